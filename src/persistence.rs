//! File-based persistence for run folders and finalized results
//!
//! Every run gets its own folder under the result root:
//! `<kind>_<sanitised target>_<YYYYmmdd_HHMMSS>_<short id>`. Raw probe
//! documents are written there by the tools; finalized reports are stored
//! beside them as pretty JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    core::ScanReport,
    error::{Result, ScannerError},
    target::Target,
    waf_detection::WafDetectionResult,
};

pub const SCAN_REPORT_FILE: &str = "scan_report.json";
pub const WAF_RESULT_FILE: &str = "waf_result.json";

/// Kind of run a folder belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Recon,
    Waf,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::Waf => "waf",
        }
    }
}

/// Trait for scan data storage operations
#[async_trait]
pub trait ScanDataStore: Send + Sync {
    /// Create a fresh run folder for `target`
    async fn create_scan_folder(&self, kind: RunKind, target: &Target, run_id: Uuid) -> Result<PathBuf>;

    /// Store a finalized recon report in its run folder
    async fn store_scan_report(&self, report: &ScanReport) -> Result<PathBuf>;

    async fn load_scan_report(&self, path: &Path) -> Result<ScanReport>;

    async fn store_waf_result(&self, folder: &Path, result: &WafDetectionResult) -> Result<PathBuf>;

    async fn load_waf_result(&self, path: &Path) -> Result<WafDetectionResult>;

    /// Run folders under the root, newest first
    async fn list_runs(&self) -> Result<Vec<RunSummary>>;
}

/// One run folder found under the result root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub folder: PathBuf,
    pub kind: Option<RunKind>,
    pub modified_at: Option<DateTime<Utc>>,
    pub has_report: bool,
}

/// File-based implementation of scan data store
pub struct FileBasedDataStore {
    base_dir: PathBuf,
    pretty: bool,
}

impl FileBasedDataStore {
    pub fn new(base_dir: PathBuf, pretty: bool) -> Self {
        Self { base_dir, pretty }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| ScannerError::io("create result root", e.to_string()))?;
        tracing::info!("File-based data store initialized at: {}", self.base_dir.display());
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Folder name for a run started at `started_at`
    pub fn folder_name(kind: RunKind, target: &Target, started_at: DateTime<Utc>, run_id: Uuid) -> String {
        let short_id: String = run_id.simple().to_string().chars().take(8).collect();
        format!(
            "{}_{}_{}_{}",
            kind.as_str(),
            target.sanitized(),
            started_at.format("%Y%m%d_%H%M%S"),
            short_id
        )
    }

    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        let json_data = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };

        let mut file = fs::File::create(path)
            .await
            .map_err(|e| ScannerError::io(format!("create {}", path.display()), e.to_string()))?;
        file.write_all(json_data.as_bytes())
            .await
            .map_err(|e| ScannerError::io(format!("write {}", path.display()), e.to_string()))?;
        file.flush().await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let json_data = fs::read_to_string(path)
            .await
            .map_err(|e| ScannerError::io(format!("read {}", path.display()), e.to_string()))?;
        serde_json::from_str(&json_data).map_err(|e| {
            ScannerError::malformed_document(path.display().to_string(), e.to_string())
        })
    }
}

/// Accept either a run folder or the JSON file itself
fn resolve_file(path: &Path, file_name: &str) -> PathBuf {
    if path.is_dir() {
        path.join(file_name)
    } else {
        path.to_path_buf()
    }
}

#[async_trait]
impl ScanDataStore for FileBasedDataStore {
    async fn create_scan_folder(&self, kind: RunKind, target: &Target, run_id: Uuid) -> Result<PathBuf> {
        let folder = self
            .base_dir
            .join(Self::folder_name(kind, target, Utc::now(), run_id));
        fs::create_dir_all(&folder)
            .await
            .map_err(|e| ScannerError::io(format!("create {}", folder.display()), e.to_string()))?;
        tracing::debug!("Created run folder {}", folder.display());
        Ok(folder)
    }

    async fn store_scan_report(&self, report: &ScanReport) -> Result<PathBuf> {
        let folder = report
            .scan_folder()
            .ok_or_else(|| ScannerError::internal("store report", "report has no run folder"))?;
        let file_path = folder.join(SCAN_REPORT_FILE);
        self.write_json(&file_path, report).await?;
        tracing::info!("Stored scan report to: {}", file_path.display());
        Ok(file_path)
    }

    async fn load_scan_report(&self, path: &Path) -> Result<ScanReport> {
        self.read_json(&resolve_file(path, SCAN_REPORT_FILE)).await
    }

    async fn store_waf_result(&self, folder: &Path, result: &WafDetectionResult) -> Result<PathBuf> {
        let file_path = folder.join(WAF_RESULT_FILE);
        self.write_json(&file_path, result).await?;
        tracing::info!("Stored WAF result to: {}", file_path.display());
        Ok(file_path)
    }

    async fn load_waf_result(&self, path: &Path) -> Result<WafDetectionResult> {
        self.read_json(&resolve_file(path, WAF_RESULT_FILE)).await
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut runs = Vec::new();
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(ScannerError::io("list runs", e.to_string())),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = if name.starts_with("recon_") {
                Some(RunKind::Recon)
            } else if name.starts_with("waf_") {
                Some(RunKind::Waf)
            } else {
                None
            };
            let modified_at = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            let has_report = path.join(SCAN_REPORT_FILE).exists() || path.join(WAF_RESULT_FILE).exists();

            runs.push(RunSummary {
                folder: path,
                kind,
                modified_at,
                has_report,
            });
        }

        runs.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(runs)
    }
}

/// Factory function for creating data store
pub async fn create_data_store(config: &AppConfig) -> Result<std::sync::Arc<dyn ScanDataStore>> {
    let data_store = FileBasedDataStore::new(
        config.persistence.result_root.clone(),
        config.output.pretty_json,
    );
    data_store.init().await?;
    Ok(std::sync::Arc::new(data_store))
}
