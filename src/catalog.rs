//! Probe-script catalog
//!
//! Enumerates the script directory once per orchestration run. Entries are the
//! file names carrying the script extension, sorted so matching is
//! deterministic.

use std::path::{Path, PathBuf};

use crate::error::{Result, ScannerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCatalog {
    directory: PathBuf,
    entries: Vec<String>,
}

impl ScriptCatalog {
    /// Load the catalog from `directory`, keeping files ending in `.{extension}`
    pub async fn load(directory: &Path, extension: &str) -> Result<Self> {
        let suffix = format!(".{}", extension.trim_start_matches('.'));
        let dir_label = directory.display().to_string();

        let mut reader = tokio::fs::read_dir(directory)
            .await
            .map_err(|e| ScannerError::catalog_unavailable(&dir_label, e.to_string()))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ScannerError::catalog_unavailable(&dir_label, e.to_string()))?
        {
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(e) => {
                    tracing::debug!("Skipping unreadable catalog entry {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            if file_type.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(&suffix) && name.len() > suffix.len() {
                entries.push(name);
            }
        }

        entries.sort();
        tracing::info!("Loaded {} scripts from {}", entries.len(), dir_label);

        Ok(Self {
            directory: directory.to_path_buf(),
            entries,
        })
    }

    /// Build a catalog from known names; the result is sorted
    pub fn from_entries<I, S>(directory: &Path, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<String> = entries.into_iter().map(Into::into).collect();
        entries.sort();
        Self {
            directory: directory.to_path_buf(),
            entries,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["http-waf-detect.nse", "ssh-auth-methods.nse", "http-sql-injection.nse", "README", "script.db"] {
            tokio::fs::write(temp_dir.path().join(name), b"-- script").await.unwrap();
        }
        tokio::fs::create_dir(temp_dir.path().join("nested.nse")).await.unwrap();

        let catalog = ScriptCatalog::load(temp_dir.path(), "nse").await.unwrap();
        assert_eq!(
            catalog.entries(),
            &["http-sql-injection.nse", "http-waf-detect.nse", "ssh-auth-methods.nse"]
        );
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let err = ScriptCatalog::load(&temp_dir.path().join("missing"), "nse")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CATALOG_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_reload_sees_new_scripts() {
        let temp_dir = TempDir::new().unwrap();
        let first = ScriptCatalog::load(temp_dir.path(), ".nse").await.unwrap();
        assert!(first.is_empty());

        tokio::fs::write(temp_dir.path().join("ftp-anon.nse"), b"").await.unwrap();
        let second = ScriptCatalog::load(temp_dir.path(), ".nse").await.unwrap();
        assert_eq!(second.len(), 1);
    }
}
