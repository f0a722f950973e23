use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{FacetTuple, VariantLabel};
use crate::error::HarvestError;
use crate::raw::{RawRecord, read_raw_catalog};
use crate::workspace::Workspace;

pub const SOURCE_HEADER: &str = "source_id,activity_id,experiment_id,variant_label,variable,grid_label,filename,filesize,download_url,opendap_url";

/// Ordering key of a cataloged file. Iteration order of the catalog follows it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CatalogKey {
    pub source_id: String,
    pub activity_id: String,
    pub experiment_id: String,
    pub variant_label: VariantLabel,
    pub variable_id: String,
    pub grid_label: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub source_id: String,
    pub activity_id: String,
    pub experiment_id: String,
    pub variant_label: VariantLabel,
    pub variable_id: String,
    pub grid_label: String,
    pub filename: String,
    pub size_bytes: Option<u64>,
    pub download_urls: Vec<String>,
    pub query_urls: Vec<String>,
}

impl FileRecord {
    pub fn from_raw(facets: &FacetTuple, raw: RawRecord) -> Self {
        Self {
            source_id: facets.source_id.clone(),
            activity_id: facets.activity_id.clone(),
            experiment_id: facets.experiment_id.clone(),
            variant_label: facets.variant_label,
            variable_id: facets.variable_id.clone(),
            grid_label: facets.grid_label.clone(),
            filename: raw.filename,
            size_bytes: raw.size,
            download_urls: raw.download_url.into_iter().collect(),
            query_urls: raw.opendap_url.into_iter().collect(),
        }
    }

    pub fn key(&self) -> CatalogKey {
        CatalogKey {
            source_id: self.source_id.clone(),
            activity_id: self.activity_id.clone(),
            experiment_id: self.experiment_id.clone(),
            variant_label: self.variant_label,
            variable_id: self.variable_id.clone(),
            grid_label: self.grid_label.clone(),
            filename: self.filename.clone(),
        }
    }

    /// URL lists concatenate, mirror duplicates included. A reported size
    /// replaces the previous one (last seen wins, mirrors are not reconciled).
    fn merge(&mut self, other: FileRecord) {
        self.download_urls.extend(other.download_urls);
        self.query_urls.extend(other.query_urls);
        if other.size_bytes.is_some() {
            self.size_bytes = other.size_bytes;
        }
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            self.source_id,
            self.activity_id,
            self.experiment_id,
            self.variant_label,
            self.variable_id,
            self.grid_label,
            self.filename,
            self.size_bytes.map(|size| size.to_string()).unwrap_or_default(),
            self.download_urls.join("|"),
            self.query_urls.join("|"),
        )
    }

    pub fn from_csv_line(line: &str) -> Result<Self, HarvestError> {
        let malformed = || HarvestError::MalformedRow(line.to_string());
        let fields = line.trim_end_matches(['\r', '\n']).split(',').collect::<Vec<_>>();
        let [source, activity, experiment, variant, variable, grid, filename, size, urls, dap] =
            fields.as_slice()
        else {
            return Err(malformed());
        };
        Ok(Self {
            source_id: source.to_string(),
            activity_id: activity.to_string(),
            experiment_id: experiment.to_string(),
            variant_label: variant.parse()?,
            variable_id: variable.to_string(),
            grid_label: grid.to_string(),
            filename: filename.to_string(),
            size_bytes: parse_size(size).map_err(|_| malformed())?,
            download_urls: split_urls(urls),
            query_urls: split_urls(dap),
        })
    }
}

pub fn parse_size(value: &str) -> Result<Option<u64>, std::num::ParseIntError> {
    match value.trim() {
        "" => Ok(None),
        value => value.parse().map(Some),
    }
}

pub fn split_urls(field: &str) -> Vec<String> {
    field
        .split('|')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub added: usize,
    pub merged: usize,
    pub dropped_malformed: usize,
    pub dropped_frequency: usize,
}

impl IngestStats {
    pub fn absorb(&mut self, other: &IngestStats) {
        self.added += other.added;
        self.merged += other.merged;
        self.dropped_malformed += other.dropped_malformed;
        self.dropped_frequency += other.dropped_frequency;
    }
}

/// Append/merge-only file catalog spanning every source.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    records: BTreeMap<CatalogKey, FileRecord>,
    by_filename: BTreeMap<String, CatalogKey>,
    sources: Vec<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Source ids in order of first appearance.
    pub fn source_ids(&self) -> &[String] {
        &self.sources
    }

    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    pub fn source_records<'a>(&'a self, source_id: &'a str) -> impl Iterator<Item = &'a FileRecord> {
        self.records
            .values()
            .filter(move |record| record.source_id == source_id)
    }

    pub fn get(&self, filename: &str) -> Option<&FileRecord> {
        self.by_filename
            .get(filename)
            .and_then(|key| self.records.get(key))
    }

    pub fn file_size(&self, filename: &str) -> Option<u64> {
        self.get(filename).and_then(|record| record.size_bytes)
    }

    pub fn ingest(&mut self, records: impl IntoIterator<Item = RawRecord>) -> IngestStats {
        let mut stats = IngestStats::default();
        for raw in records {
            let facets = match raw.master_id.parse::<FacetTuple>() {
                Ok(facets) => facets,
                Err(err) => {
                    debug!("dropping {}: {err}", raw.filename);
                    stats.dropped_malformed += 1;
                    continue;
                }
            };
            if !facets.has_expected_frequency() {
                debug!(
                    "dropping {}: table {} for variable {}",
                    raw.filename, facets.frequency, facets.variable_id
                );
                stats.dropped_frequency += 1;
                continue;
            }
            if self.insert(FileRecord::from_raw(&facets, raw)) {
                stats.added += 1;
            } else {
                stats.merged += 1;
            }
        }
        stats
    }

    /// Returns `true` when the filename was new to the catalog.
    pub fn insert(&mut self, record: FileRecord) -> bool {
        if let Some(key) = self.by_filename.get(&record.filename) {
            if let Some(existing) = self.records.get_mut(key) {
                existing.merge(record);
                return false;
            }
        }
        if !self.sources.contains(&record.source_id) {
            self.sources.push(record.source_id.clone());
        }
        let key = record.key();
        self.by_filename.insert(record.filename.clone(), key.clone());
        self.records.insert(key, record);
        true
    }

    /// Folds the raw listing of each (experiment, variable) pair, then the
    /// out-of-band listings under `raw/extra/<experiment>.<variable>/`.
    pub fn ingest_workspace(
        &mut self,
        workspace: &Workspace,
        experiments: &[String],
        variables: &[String],
    ) -> Result<IngestStats, HarvestError> {
        let mut stats = IngestStats::default();
        for experiment in experiments {
            for variable in variables {
                let primary = workspace.raw_catalog_path(experiment, variable);
                let mut paths = Vec::new();
                if primary.as_std_path().is_file() {
                    paths.push(primary);
                } else {
                    warn!("no raw listing for {experiment}.{variable}");
                }
                paths.extend(Workspace::list_csv(
                    &workspace.extra_pair_dir(experiment, variable),
                )?);
                for path in paths {
                    let (records, malformed) = read_raw_catalog(&path)?;
                    let mut file_stats = self.ingest(records);
                    file_stats.dropped_malformed += malformed;
                    debug!("{path}: {file_stats:?}");
                    stats.absorb(&file_stats);
                }
            }
        }
        info!(
            "catalog holds {} files from {} sources",
            self.len(),
            self.sources.len()
        );
        Ok(stats)
    }

    /// One catalog file per source; files of sources no longer cataloged are removed.
    pub fn write_sources(&self, workspace: &Workspace) -> Result<Vec<String>, HarvestError> {
        let mut written = Vec::new();
        for source in &self.sources {
            let mut lines = vec![SOURCE_HEADER.to_string()];
            lines.extend(self.source_records(source).map(FileRecord::to_csv_line));
            let path = workspace.source_catalog_path(source);
            Workspace::write_lines(&path, &lines)?;
            info!("saved {path}");
            written.push(path);
        }
        for stale in Workspace::prune_csv(&workspace.sources_dir(), &written)? {
            info!("removed stale source catalog {stale}");
        }
        Ok(written.iter().map(ToString::to_string).collect())
    }

    /// Rebuilds a catalog from the per-source files written by `write_sources`.
    pub fn load_sources(workspace: &Workspace) -> Result<Self, HarvestError> {
        let mut catalog = Self::new();
        for path in Workspace::list_csv(&workspace.sources_dir())? {
            let content = Workspace::read_to_string(&path)?;
            for line in content.lines().skip(1) {
                if line.trim().is_empty() {
                    continue;
                }
                match FileRecord::from_csv_line(line) {
                    Ok(record) => {
                        catalog.insert(record);
                    }
                    Err(err) => warn!("{path}: {err}"),
                }
            }
        }
        Ok(catalog)
    }
}
