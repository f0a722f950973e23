use camino::Utf8Path;
use serde::Serialize;
use tracing::warn;

use crate::error::HarvestError;
use crate::workspace::Workspace;

pub const RAW_HEADER: &str = "master_id,data_node,filename,size,download_url,opendap_url";

/// One file as reported by one data node, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawRecord {
    pub master_id: String,
    pub data_node: String,
    pub filename: String,
    pub size: Option<u64>,
    pub download_url: Option<String>,
    pub opendap_url: Option<String>,
}

impl RawRecord {
    pub fn to_csv_line(&self) -> String {
        let size = self.size.map(|size| size.to_string()).unwrap_or_default();
        [
            self.master_id.as_str(),
            self.data_node.as_str(),
            self.filename.as_str(),
            size.as_str(),
            self.download_url.as_deref().unwrap_or_default(),
            self.opendap_url.as_deref().unwrap_or_default(),
        ]
        .join(",")
    }

    /// Accepts six fields, or five for listings produced before the query
    /// protocol column existed.
    pub fn from_csv_line(line: &str) -> Result<Self, HarvestError> {
        let fields = line.trim_end_matches(['\r', '\n']).split(',').collect::<Vec<_>>();
        let (master_id, data_node, filename, size, download_url, opendap_url) =
            match fields.as_slice() {
                [m, d, f, s, u, o] => (*m, *d, *f, *s, *u, *o),
                [m, d, f, s, u] => (*m, *d, *f, *s, *u, ""),
                _ => return Err(HarvestError::MalformedRow(line.to_string())),
            };
        if master_id.is_empty() || filename.is_empty() {
            return Err(HarvestError::MalformedRow(line.to_string()));
        }
        let size = match size.trim() {
            "" | "None" => None,
            value => Some(
                value
                    .parse::<u64>()
                    .map_err(|_| HarvestError::MalformedRow(line.to_string()))?,
            ),
        };
        Ok(Self {
            master_id: master_id.to_string(),
            data_node: data_node.to_string(),
            filename: filename.to_string(),
            size,
            download_url: optional(download_url),
            opendap_url: optional(opendap_url),
        })
    }
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

pub fn write_raw_catalog(path: &Utf8Path, records: &[RawRecord]) -> Result<(), HarvestError> {
    let mut lines = Vec::with_capacity(records.len() + 1);
    lines.push(RAW_HEADER.to_string());
    lines.extend(records.iter().map(RawRecord::to_csv_line));
    Workspace::write_lines(path, &lines)
}

/// Reads a raw listing, dropping malformed rows. Returns the records and the
/// number of rows dropped.
pub fn read_raw_catalog(path: &Utf8Path) -> Result<(Vec<RawRecord>, usize), HarvestError> {
    let content = Workspace::read_to_string(path)?;
    let mut records = Vec::new();
    let mut dropped = 0usize;
    for line in content.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match RawRecord::from_csv_line(line) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!("{path}: {err}");
                dropped += 1;
            }
        }
    }
    Ok((records, dropped))
}
