use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, FileRecord, parse_size, split_urls};
use crate::domain::VariantLabel;
use crate::error::HarvestError;
use crate::workspace::Workspace;

pub const QUEUE_HEADER: &str = "source_id,activity_id,experiment_id,variant_label,variable,grid_label,filenum,filename,filesize,download_url,opendap_url";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub baseline_experiment: String,
    pub forced_experiment: String,
    pub required_variables: BTreeSet<String>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            baseline_experiment: "piControl".to_string(),
            forced_experiment: "abrupt-4xCO2".to_string(),
            required_variables: ["rsdt", "rsut", "rlut", "tas"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntry {
    pub source_id: String,
    pub activity_id: String,
    pub experiment_id: String,
    pub variant_label: VariantLabel,
    pub variable_id: String,
    pub grid_label: String,
    pub filename: String,
    pub size_bytes: Option<u64>,
    pub position: usize,
    pub group_size: usize,
    pub download_urls: Vec<String>,
    pub query_urls: Vec<String>,
}

impl QueueEntry {
    fn from_record(record: &FileRecord, position: usize, group_size: usize) -> Self {
        Self {
            source_id: record.source_id.clone(),
            activity_id: record.activity_id.clone(),
            experiment_id: record.experiment_id.clone(),
            variant_label: record.variant_label,
            variable_id: record.variable_id.clone(),
            grid_label: record.grid_label.clone(),
            filename: record.filename.clone(),
            size_bytes: record.size_bytes,
            position,
            group_size,
            download_urls: record.download_urls.clone(),
            query_urls: record.query_urls.clone(),
        }
    }

    pub fn filenum(&self) -> String {
        format!("{}/{}", self.position, self.group_size)
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.source_id,
            self.activity_id,
            self.experiment_id,
            self.variant_label,
            self.variable_id,
            self.grid_label,
            self.filenum(),
            self.filename,
            self.size_bytes.map(|size| size.to_string()).unwrap_or_default(),
            self.download_urls.join("|"),
            self.query_urls.join("|"),
        )
    }

    pub fn from_csv_line(line: &str) -> Result<Self, HarvestError> {
        let malformed = || HarvestError::MalformedRow(line.to_string());
        let fields = line.trim_end_matches(['\r', '\n']).split(',').collect::<Vec<_>>();
        let [
            source,
            activity,
            experiment,
            variant,
            variable,
            grid,
            filenum,
            filename,
            size,
            urls,
            dap,
        ] = fields.as_slice()
        else {
            return Err(malformed());
        };
        let (position, group_size) = filenum.split_once('/').ok_or_else(malformed)?;
        Ok(Self {
            source_id: source.to_string(),
            activity_id: activity.to_string(),
            experiment_id: experiment.to_string(),
            variant_label: variant.parse()?,
            variable_id: variable.to_string(),
            grid_label: grid.to_string(),
            filename: filename.to_string(),
            size_bytes: parse_size(size).map_err(|_| malformed())?,
            position: position.parse().map_err(|_| malformed())?,
            group_size: group_size.parse().map_err(|_| malformed())?,
            download_urls: split_urls(urls),
            query_urls: split_urls(dap),
        })
    }
}

/// Queue of one admitted source. A source can pass the experiment gate yet
/// produce no entries when no experiment has the required variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceQueue {
    pub source_id: String,
    pub entries: Vec<QueueEntry>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub sources: Vec<SourceQueue>,
}

impl Selection {
    pub fn total_bytes(&self) -> u64 {
        self.sources.iter().map(|source| source.total_bytes).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.sources.iter().flat_map(|source| source.entries.iter())
    }

    pub fn storage_lines(&self) -> Vec<String> {
        let mut lines = self
            .sources
            .iter()
            .map(|source| format!("{},{}", source.source_id, format_gigabytes(source.total_bytes)))
            .collect::<Vec<_>>();
        lines.push(format!("total,{}", format_gigabytes(self.total_bytes())));
        lines
    }

    /// Writes one queue file per source with entries and the storage summary.
    /// Queue files from an earlier selection that this one does not produce
    /// are removed.
    pub fn write(&self, workspace: &Workspace) -> Result<(), HarvestError> {
        let mut written = Vec::new();
        for source in &self.sources {
            if source.entries.is_empty() {
                continue;
            }
            let mut lines = vec![QUEUE_HEADER.to_string()];
            lines.extend(source.entries.iter().map(QueueEntry::to_csv_line));
            let path = workspace.queue_path(&source.source_id);
            Workspace::write_lines(&path, &lines)?;
            info!("saved {path}");
            written.push(path);
        }
        for stale in Workspace::prune_csv(&workspace.queue_dir(), &written)? {
            info!("removed stale queue {stale}");
        }
        Workspace::write_lines(&workspace.storage_summary_path(), &self.storage_lines())
    }
}

/// Decimal gigabytes with three decimals, e.g. `4.000GB`.
pub fn format_gigabytes(bytes: u64) -> String {
    format!("{:.3}GB", bytes as f64 * 1.0e-9)
}

pub fn select(catalog: &Catalog, policy: &SelectionPolicy) -> Selection {
    let mut source_ids = catalog.source_ids().to_vec();
    source_ids.sort();

    let mut sources = Vec::new();
    for source_id in source_ids {
        let records = catalog.source_records(&source_id).collect::<Vec<_>>();
        let experiments = records
            .iter()
            .map(|record| record.experiment_id.as_str())
            .collect::<BTreeSet<_>>();
        if !experiments.contains(policy.baseline_experiment.as_str())
            || !experiments.contains(policy.forced_experiment.as_str())
        {
            debug!("{source_id}: missing gate experiments");
            continue;
        }

        let mut entries = Vec::new();
        for experiment in &experiments {
            entries.extend(select_experiment(&records, experiment, policy));
        }
        let total_bytes = entries
            .iter()
            .map(|entry| entry.size_bytes.unwrap_or(0))
            .sum();
        info!(
            "{source_id}: {} files, {}",
            entries.len(),
            format_gigabytes(total_bytes)
        );
        sources.push(SourceQueue {
            source_id,
            entries,
            total_bytes,
        });
    }
    Selection { sources }
}

fn select_experiment(
    records: &[&FileRecord],
    experiment: &str,
    policy: &SelectionPolicy,
) -> Vec<QueueEntry> {
    let Some(canonical) = records
        .iter()
        .filter(|record| record.experiment_id == experiment)
        .map(|record| record.variant_label)
        .min()
    else {
        return Vec::new();
    };
    let in_variant = records
        .iter()
        .filter(|record| record.experiment_id == experiment && record.variant_label == canonical)
        .copied()
        .collect::<Vec<_>>();
    let variables = in_variant
        .iter()
        .map(|record| record.variable_id.as_str())
        .collect::<BTreeSet<_>>();
    let complete = policy
        .required_variables
        .iter()
        .all(|required| variables.contains(required.as_str()));
    if !complete {
        debug!("{experiment}/{canonical}: required variables missing");
        return Vec::new();
    }

    let mut entries = Vec::new();
    for variable in variables {
        let group = in_variant
            .iter()
            .filter(|record| record.variable_id == variable)
            .collect::<Vec<_>>();
        let group_size = group.len();
        entries.extend(
            group
                .into_iter()
                .enumerate()
                .map(|(idx, record)| QueueEntry::from_record(record, idx + 1, group_size)),
        );
    }
    entries
}

/// Reads every queue file in the workspace, sources in name order.
pub fn read_queue(workspace: &Workspace) -> Result<Vec<QueueEntry>, HarvestError> {
    let mut entries = Vec::new();
    for path in Workspace::list_csv(&workspace.queue_dir())? {
        let content = Workspace::read_to_string(&path)?;
        for line in content.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            match QueueEntry::from_csv_line(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!("{path}: {err}"),
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::RawRecord;

    fn raw(experiment: &str, variant: &str, variable: &str, filename: &str, size: u64) -> RawRecord {
        let table = if variable == "areacella" { "fx" } else { "Amon" };
        RawRecord {
            master_id: format!("CMIP6.CMIP.X.ModelX.{experiment}.{variant}.{table}.{variable}.gn.v1"),
            data_node: "node".to_string(),
            filename: filename.to_string(),
            size: Some(size),
            download_url: Some(format!("http://node/{filename}")),
            opendap_url: None,
        }
    }

    #[test]
    fn gigabytes_format() {
        assert_eq!(
            format_gigabytes(1_000_000_000 + 2_500_000_000 + 500_000_000),
            "4.000GB"
        );
        assert_eq!(format_gigabytes(0), "0.000GB");
        assert_eq!(format_gigabytes(1_234_567), "0.001GB");
    }

    #[test]
    fn canonical_variant_is_numerically_smallest() {
        let mut catalog = Catalog::new();
        let mut records = Vec::new();
        for experiment in ["piControl", "abrupt-4xCO2"] {
            for variant in ["r10i1p1f1", "r2i1p1f1"] {
                for variable in ["tas", "rsdt", "rsut", "rlut"] {
                    records.push(raw(
                        experiment,
                        variant,
                        variable,
                        &format!("{variable}_{experiment}_{variant}.nc"),
                        1,
                    ));
                }
            }
        }
        catalog.ingest(records);
        let selection = select(&catalog, &SelectionPolicy::default());
        assert_eq!(selection.entries().count(), 8);
        assert!(
            selection
                .entries()
                .all(|entry| entry.variant_label.to_string() == "r2i1p1f1")
        );
    }

    #[test]
    fn groups_are_numbered_in_catalog_order() {
        let mut catalog = Catalog::new();
        let mut records = vec![
            raw("piControl", "r1i1p1f1", "tas", "tas_b_000101-010012.nc", 3),
            raw("piControl", "r1i1p1f1", "tas", "tas_a_010101-020012.nc", 4),
        ];
        for variable in ["rsdt", "rsut", "rlut"] {
            records.push(raw("piControl", "r1i1p1f1", variable, &format!("{variable}.nc"), 1));
        }
        records.push(raw("abrupt-4xCO2", "r1i1p1f1", "tas", "tas_4x.nc", 1));
        catalog.ingest(records);

        let selection = select(&catalog, &SelectionPolicy::default());
        let source = &selection.sources[0];
        // abrupt-4xCO2 lacks rsdt/rsut/rlut so only piControl contributes.
        assert_eq!(source.entries.len(), 5);
        let tas = source
            .entries
            .iter()
            .filter(|entry| entry.variable_id == "tas")
            .map(|entry| (entry.filename.as_str(), entry.filenum()))
            .collect::<Vec<_>>();
        assert_eq!(
            tas,
            vec![
                ("tas_a_010101-020012.nc", "1/2".to_string()),
                ("tas_b_000101-010012.nc", "2/2".to_string())
            ]
        );
        assert_eq!(source.total_bytes, 10);
    }

    #[test]
    fn queue_row_uses_filenum() {
        let mut catalog = Catalog::new();
        catalog.ingest(vec![raw("piControl", "r1i1p1f1", "tas", "tas.nc", 7)]);
        let record = catalog.get("tas.nc").unwrap();
        let entry = QueueEntry::from_record(record, 1, 1);
        let line = entry.to_csv_line();
        assert_eq!(
            line,
            "ModelX,CMIP,piControl,r1i1p1f1,tas,gn,1/1,tas.nc,7,http://node/tas.nc,"
        );
        assert_eq!(QueueEntry::from_csv_line(&line).unwrap(), entry);
    }
}
