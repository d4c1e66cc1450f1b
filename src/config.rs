//! Configuration management system
//!
//! Settings are layered in this order, later sources winning:
//! - Compiled defaults
//! - TOML configuration file (created with defaults on first run)
//! - Environment variables prefixed with `RECON_` (`__` separates sections)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// External probe tool and script catalog
    pub probe: ProbeConfig,
    /// Orchestration time budget
    pub budget: BudgetConfig,
    /// Script matching policy
    pub matching: MatchingConfig,
    /// Result document ceilings
    pub parser: ParserConfig,
    /// WAF detection settings
    pub waf: WafConfig,
    /// Scan-management service client
    pub session: SessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Output configuration
    pub output: OutputConfig,
    /// Performance tuning
    pub performance: PerformanceConfig,
    /// File persistence settings
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Path or name of the nmap binary
    pub nmap_path: String,
    /// Directory holding the probe scripts
    pub script_dir: PathBuf,
    /// File extension identifying a script (without the dot)
    pub script_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetConfig {
    /// Total budget used when the caller gives none
    pub default_total_timeout_secs: u64,
    /// Hard deadline for the OS fingerprint phase
    pub os_scan_timeout_secs: u64,
    /// Hard deadline for the port discovery phase
    pub port_scan_timeout_secs: u64,
    /// Time held back from script execution for the mandatory phases
    pub reserved_secs: u64,
    /// Upper bound for a single script run
    pub max_script_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchingConfig {
    /// Maximum scripts scheduled per port
    pub max_scripts_per_port: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParserConfig {
    /// Bytes read from a result document before truncating
    pub max_document_bytes: u64,
    /// Port entries accepted from one document
    pub max_port_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WafConfig {
    /// Total budget used when the caller gives none
    pub default_total_timeout_secs: u64,
    /// Timeout for each HTTP request
    pub request_timeout_secs: u64,
    /// Payloads sampled from every category
    pub payloads_per_category: usize,
    /// Bytes of response body kept for content matching
    pub max_body_bytes: usize,
    /// Characters of baseline content stored in the result
    pub content_excerpt_chars: usize,
    /// Deadline for each nmap WAF script in intensive mode
    pub nmap_script_timeout_secs: u64,
    /// User agent sent with every probe
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Base URL of the scan-management REST API
    pub base_url: String,
    /// Login user (usually supplied through the environment)
    pub username: Option<String>,
    /// Login password (usually supplied through the environment)
    pub password: Option<String>,
    /// Verify the service TLS certificate
    pub verify_tls: bool,
    /// Timeout for each API request
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
    /// Directory for daily rolling log files (None for stderr only)
    pub file_dir: Option<PathBuf>,
    /// File name prefix for rolling log files
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_dir: None,
            file_prefix: "recon_orchestrator.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Default output format (human, json)
    pub default_format: String,
    /// Pretty-print JSON output
    pub pretty_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    /// Ports whose scripts may run at the same time
    pub max_concurrent_ports: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    /// Root directory for per-run result folders
    pub result_root: PathBuf,
    /// Save the finalized report into the run folder
    pub auto_save: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig {
                nmap_path: "nmap".to_string(),
                script_dir: PathBuf::from("/usr/share/nmap/scripts"),
                script_extension: "nse".to_string(),
            },
            budget: BudgetConfig {
                default_total_timeout_secs: 600,
                os_scan_timeout_secs: 120,
                port_scan_timeout_secs: 180,
                reserved_secs: 300,
                max_script_timeout_secs: 30,
            },
            matching: MatchingConfig {
                max_scripts_per_port: 5,
            },
            parser: ParserConfig {
                max_document_bytes: 50 * 1024 * 1024,
                max_port_entries: 1000,
            },
            waf: WafConfig {
                default_total_timeout_secs: 300,
                request_timeout_secs: 30,
                payloads_per_category: 2,
                max_body_bytes: 1_000_000,
                content_excerpt_chars: 1000,
                nmap_script_timeout_secs: 120,
                user_agent: format!("recon_orchestrator/{}", env!("CARGO_PKG_VERSION")),
            },
            session: SessionConfig {
                base_url: "https://localhost:8834".to_string(),
                username: None,
                password: None,
                verify_tls: false,
                request_timeout_secs: 30,
            },
            logging: LoggingConfig::default(),
            output: OutputConfig {
                default_format: "human".to_string(),
                pretty_json: true,
            },
            performance: PerformanceConfig {
                max_concurrent_ports: 4,
            },
            persistence: PersistenceConfig {
                result_root: PathBuf::from("./scan_results"),
                auto_save: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from file with environment variable overrides
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        info!("Loading configuration from: {}", config_path.display());

        let mut settings = config::Config::builder();

        settings = settings.add_source(config::Config::try_from(&Self::default())?);

        if config_path.exists() {
            debug!("Found configuration file, loading settings");
            settings = settings.add_source(config::File::from(config_path));
        } else {
            info!("No configuration file found, using defaults");
            Self::create_default_config(config_path).await?;
        }

        settings = settings.add_source(
            config::Environment::with_prefix("RECON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Create a default configuration file
    async fn create_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let config_content = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default configuration")?;

        tokio::fs::write(path, config_content)
            .await
            .context("Failed to write default configuration file")?;

        info!("Created default configuration file: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(anyhow::anyhow!("Invalid logging level: {}", self.logging.level)),
        }

        match self.output.default_format.to_lowercase().as_str() {
            "human" | "json" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid output format: {}",
                    self.output.default_format
                ))
            }
        }

        if self.probe.script_extension.trim_start_matches('.').is_empty() {
            return Err(anyhow::anyhow!("probe.script_extension must not be empty"));
        }
        if self.budget.max_script_timeout_secs == 0 {
            return Err(anyhow::anyhow!("budget.max_script_timeout_secs must be greater than 0"));
        }
        if self.matching.max_scripts_per_port == 0 {
            return Err(anyhow::anyhow!("matching.max_scripts_per_port must be greater than 0"));
        }
        if self.parser.max_port_entries == 0 || self.parser.max_document_bytes == 0 {
            return Err(anyhow::anyhow!("parser limits must be greater than 0"));
        }
        if self.waf.payloads_per_category == 0 {
            return Err(anyhow::anyhow!("waf.payloads_per_category must be greater than 0"));
        }
        if self.performance.max_concurrent_ports == 0 {
            return Err(anyhow::anyhow!("performance.max_concurrent_ports must be greater than 0"));
        }
        url::Url::parse(&self.session.base_url).context("Invalid session.base_url")?;

        debug!("Configuration validation passed");
        Ok(())
    }

    pub fn os_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.budget.os_scan_timeout_secs)
    }

    pub fn port_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.budget.port_scan_timeout_secs)
    }

    pub fn reserved_time(&self) -> Duration {
        Duration::from_secs(self.budget.reserved_secs)
    }

    pub fn max_script_timeout(&self) -> Duration {
        Duration::from_secs(self.budget.max_script_timeout_secs)
    }

    pub fn waf_request_timeout(&self) -> Duration {
        Duration::from_secs(self.waf.request_timeout_secs)
    }

    pub fn session_request_timeout(&self) -> Duration {
        Duration::from_secs(self.session.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matching.max_scripts_per_port, 5);
        assert_eq!(config.waf.payloads_per_category, 2);
        assert_eq!(config.reserved_time(), Duration::from_secs(300));
    }

    #[test]
    fn test_zero_caps_rejected() {
        let mut config = AppConfig::default();
        config.matching.max_scripts_per_port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_concurrent_ports = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut config = AppConfig::default();
        config.output.default_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let config = AppConfig::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.budget.default_total_timeout_secs, 600);
    }

    #[tokio::test]
    async fn test_load_reads_file_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut custom = AppConfig::default();
        custom.matching.max_scripts_per_port = 3;
        custom.probe.script_dir = PathBuf::from("/opt/scripts");
        tokio::fs::write(&path, toml::to_string_pretty(&custom).unwrap())
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.matching.max_scripts_per_port, 3);
        assert_eq!(config.probe.script_dir, PathBuf::from("/opt/scripts"));
    }
}
