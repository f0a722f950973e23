#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use cmip_harvest::config::{Config, ConfigLoader, NetworkEntry, ResolvedConfig};
use cmip_harvest::domain::{FacetTuple, expected_table};
use cmip_harvest::download::{QueryTransfer, Transfer};
use cmip_harvest::error::HarvestError;
use cmip_harvest::search::{DatasetHit, FileHit, IndexNode, SearchQuery};

pub const PAYLOAD: &[u8] = b"CDF\x01payload";

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

pub fn test_config(root: &Utf8Path, experiments: &[&str], variables: &[&str]) -> ResolvedConfig {
    ConfigLoader::resolve_config(Config {
        workspace: Some(root.to_string()),
        experiments: Some(experiments.iter().map(|value| value.to_string()).collect()),
        variables: Some(variables.iter().map(|value| value.to_string()).collect()),
        index_nodes: Some(vec!["node-a".to_string()]),
        network: Some(NetworkEntry {
            search_workers: Some(2),
            retry_attempts: Some(2),
            retry_delay_ms: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    })
    .unwrap()
}

pub fn master_id(source: &str, experiment: &str, variable: &str, variant: &str) -> String {
    format!(
        "CMIP6.CMIP.Inst.{source}.{experiment}.{variant}.{}.{variable}.gn.v20200101",
        expected_table(variable)
    )
}

pub fn filename(source: &str, experiment: &str, variable: &str, variant: &str) -> String {
    let table = expected_table(variable);
    if table == "fx" {
        format!("{variable}_{table}_{source}_{experiment}_{variant}_gn.nc")
    } else {
        format!("{variable}_{table}_{source}_{experiment}_{variant}_gn_000101-010012.nc")
    }
}

pub fn download_url(node: &str, filename: &str) -> String {
    format!("http://{node}/thredds/fileServer/{filename}")
}

pub fn query_url(node: &str, filename: &str) -> String {
    format!("http://{node}/thredds/dodsC/{filename}")
}

/// In-memory index node. Counters are shared so a clone kept by the test
/// observes calls made after the node was moved into the pipeline.
#[derive(Clone)]
pub struct FakeNode {
    endpoint: String,
    datasets: Vec<(DatasetHit, Vec<FileHit>)>,
    unreachable: bool,
    listing_failures: Arc<Mutex<BTreeMap<String, usize>>>,
    pub search_calls: Arc<Mutex<usize>>,
    pub list_calls: Arc<Mutex<usize>>,
}

impl FakeNode {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            datasets: Vec::new(),
            unreachable: false,
            listing_failures: Arc::default(),
            search_calls: Arc::default(),
            list_calls: Arc::default(),
        }
    }

    pub fn unreachable(endpoint: &str) -> Self {
        Self {
            unreachable: true,
            ..Self::new(endpoint)
        }
    }

    pub fn with_file(mut self, master_id: &str, filename: &str, size: u64) -> Self {
        let file = FileHit {
            filename: filename.to_string(),
            size: Some(size),
            download_url: Some(download_url(&self.endpoint, filename)),
            opendap_url: Some(query_url(&self.endpoint, filename)),
        };
        match self
            .datasets
            .iter_mut()
            .find(|(hit, _)| hit.master_id == master_id)
        {
            Some((_, files)) => files.push(file),
            None => {
                let hit = DatasetHit {
                    id: format!("{master_id}|{}", self.endpoint),
                    master_id: master_id.to_string(),
                    data_node: self.endpoint.clone(),
                };
                self.datasets.push((hit, vec![file]));
            }
        }
        self
    }

    /// Standard ModelX-style layout: one file per variable for each experiment.
    pub fn with_source(
        mut self,
        source: &str,
        experiments: &[&str],
        variables: &[&str],
        variant: &str,
    ) -> Self {
        for experiment in experiments {
            for variable in variables {
                self = self.with_file(
                    &master_id(source, experiment, variable, variant),
                    &filename(source, experiment, variable, variant),
                    1_000,
                );
            }
        }
        self
    }

    /// The first `count` listings of `master_id` answer with HTTP 503.
    pub fn with_listing_failures(self, master_id: &str, count: usize) -> Self {
        self.listing_failures
            .lock()
            .unwrap()
            .insert(format!("{master_id}|{}", self.endpoint), count);
        self
    }

    pub fn search_count(&self) -> usize {
        *self.search_calls.lock().unwrap()
    }

    pub fn list_count(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }
}

impl IndexNode for FakeNode {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn search_datasets(&self, query: &SearchQuery) -> Result<Vec<DatasetHit>, HarvestError> {
        *self.search_calls.lock().unwrap() += 1;
        if self.unreachable {
            return Err(HarvestError::SearchHttp("connection refused".to_string()));
        }
        Ok(self
            .datasets
            .iter()
            .map(|(hit, _)| hit)
            .filter(|hit| {
                let Ok(facets) = hit.master_id.parse::<FacetTuple>() else {
                    return true;
                };
                facets.experiment_id == query.experiment_id
                    && facets.variable_id == query.variable_id
                    && query
                        .source_id
                        .as_ref()
                        .is_none_or(|source| &facets.source_id == source)
            })
            .cloned()
            .collect())
    }

    fn list_files(&self, dataset: &DatasetHit) -> Result<Vec<FileHit>, HarvestError> {
        *self.list_calls.lock().unwrap() += 1;
        if let Some(remaining) = self.listing_failures.lock().unwrap().get_mut(&dataset.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HarvestError::SearchStatus {
                    status: 503,
                    message: "busy".to_string(),
                });
            }
        }
        Ok(self
            .datasets
            .iter()
            .find(|(hit, _)| hit.id == dataset.id)
            .map(|(_, files)| files.clone())
            .unwrap_or_default())
    }
}

/// Writes `PAYLOAD` for every URL not marked as failing and records each call.
/// Failing URLs answer 404; busy URLs answer 503 until their count runs out.
#[derive(Clone, Default)]
pub struct FakeTransfer {
    fail_all: bool,
    failing: BTreeSet<String>,
    busy: Arc<Mutex<BTreeMap<String, usize>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeTransfer {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing_all() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    pub fn failing(urls: &[String]) -> Self {
        Self {
            failing: urls.iter().cloned().collect(),
            ..Self::default()
        }
    }

    /// The first `count` calls on `url` answer with HTTP 503.
    pub fn with_busy(self, url: &str, count: usize) -> Self {
        self.busy.lock().unwrap().insert(url.to_string(), count);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|call| call.as_str() == url).count()
    }

    fn transfer(&self, url: &str, destination: &Utf8Path) -> Result<u64, u16> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(remaining) = self.busy.lock().unwrap().get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(503);
            }
        }
        if self.fail_all || self.failing.contains(url) {
            return Err(404);
        }
        std::fs::write(destination.as_std_path(), PAYLOAD).unwrap();
        Ok(PAYLOAD.len() as u64)
    }
}

impl Transfer for FakeTransfer {
    fn fetch(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError> {
        self.transfer(url, destination)
            .map_err(|status| HarvestError::DownloadStatus {
                status,
                url: url.to_string(),
            })
    }
}

#[derive(Clone, Default)]
pub struct FakeQuery {
    inner: FakeTransfer,
}

impl FakeQuery {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing_all() -> Self {
        Self {
            inner: FakeTransfer::failing_all(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls()
    }
}

impl QueryTransfer for FakeQuery {
    fn materialize(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError> {
        self.inner
            .transfer(url, destination)
            .map_err(|_| HarvestError::QueryProtocol(format!("cannot open {url}")))
    }
}
