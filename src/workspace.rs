use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::error::HarvestError;

pub const FAILED_LEDGER: &str = "failed_download.txt";
pub const STILL_FAILED_LEDGER: &str = "still_failed_download.txt";
pub const STORAGE_SUMMARY: &str = "storage_requirement.txt";

/// On-disk layout of one pipeline run. Concurrent runs against the same root
/// are not supported.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: Utf8PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn raw_dir(&self) -> Utf8PathBuf {
        self.root.join("raw")
    }

    pub fn extra_dir(&self) -> Utf8PathBuf {
        self.raw_dir().join("extra")
    }

    pub fn sources_dir(&self) -> Utf8PathBuf {
        self.root.join("sources")
    }

    pub fn queue_dir(&self) -> Utf8PathBuf {
        self.root.join("queue")
    }

    pub fn downloads_dir(&self) -> Utf8PathBuf {
        self.root.join("downloads")
    }

    pub fn raw_catalog_path(&self, experiment: &str, variable: &str) -> Utf8PathBuf {
        self.raw_dir().join(format!("{experiment}.{variable}.csv"))
    }

    pub fn extra_pair_dir(&self, experiment: &str, variable: &str) -> Utf8PathBuf {
        self.extra_dir().join(format!("{experiment}.{variable}"))
    }

    pub fn extra_catalog_path(&self, experiment: &str, variable: &str, source: &str) -> Utf8PathBuf {
        self.extra_pair_dir(experiment, variable)
            .join(format!("{experiment}.{variable}.{source}.csv"))
    }

    pub fn source_catalog_path(&self, source: &str) -> Utf8PathBuf {
        self.sources_dir().join(format!("{source}.csv"))
    }

    pub fn queue_path(&self, source: &str) -> Utf8PathBuf {
        self.queue_dir().join(format!("{source}.csv"))
    }

    pub fn storage_summary_path(&self) -> Utf8PathBuf {
        self.queue_dir().join(STORAGE_SUMMARY)
    }

    pub fn failed_ledger_path(&self) -> Utf8PathBuf {
        self.downloads_dir().join(FAILED_LEDGER)
    }

    pub fn still_failed_ledger_path(&self) -> Utf8PathBuf {
        self.downloads_dir().join(STILL_FAILED_LEDGER)
    }

    pub fn download_path(&self, filename: &str) -> Utf8PathBuf {
        self.downloads_dir().join(filename)
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), HarvestError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("create {path}: {err}")))
    }

    pub fn ensure_layout(&self) -> Result<(), HarvestError> {
        for dir in [
            self.raw_dir(),
            self.extra_dir(),
            self.sources_dir(),
            self.queue_dir(),
            self.downloads_dir(),
        ] {
            Self::ensure_dir(&dir)?;
        }
        Ok(())
    }

    /// Writes through a sibling temp file so readers never observe a torn artifact.
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        let parent = path
            .parent()
            .ok_or_else(|| HarvestError::Filesystem(format!("invalid destination {path}")))?;
        Self::ensure_dir(parent)?;
        let temp = Builder::new()
            .prefix(".cmip-harvest")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_lines(path: &Utf8Path, lines: &[String]) -> Result<(), HarvestError> {
        Self::write_bytes_atomic(path, lines.join("\n").as_bytes())
    }

    pub fn read_to_string(path: &Utf8Path) -> Result<String, HarvestError> {
        fs::read_to_string(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("read {path}: {err}")))
    }

    /// Visible `.csv` files directly under `dir`, sorted by name. A missing
    /// directory yields an empty list.
    pub fn list_csv(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        if !dir.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("list {dir}: {err}")))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            let Some(name) = path.file_name() else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".csv") || !path.is_file() {
                continue;
            }
            files.push(path);
        }
        files.sort();
        Ok(files)
    }

    /// Removes visible `.csv` files under `dir` that are not in `keep`.
    /// Returns the removed paths.
    pub fn prune_csv(
        dir: &Utf8Path,
        keep: &[Utf8PathBuf],
    ) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        let mut removed = Vec::new();
        for path in Self::list_csv(dir)? {
            if keep.contains(&path) {
                continue;
            }
            fs::remove_file(path.as_std_path())
                .map_err(|err| HarvestError::Filesystem(format!("remove {path}: {err}")))?;
            removed.push(path);
        }
        Ok(removed)
    }

    pub fn is_present(&self, filename: &str) -> bool {
        self.download_path(filename).as_std_path().is_file()
    }
}
