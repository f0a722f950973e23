use std::collections::BTreeMap;
use std::time::Duration;

use rayon::ThreadPool;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::domain::{FacetTuple, search_frequency};
use crate::error::HarvestError;
use crate::raw::RawRecord;
use crate::retry::RetryPolicy;

const PROJECT: &str = "CMIP6";
const SOLR_JSON: &str = "application/solr+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub experiment_id: String,
    pub variable_id: String,
    pub frequency: &'static str,
    pub source_id: Option<String>,
}

impl SearchQuery {
    pub fn new(experiment_id: &str, variable_id: &str, source_id: Option<&str>) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            variable_id: variable_id.to_string(),
            frequency: search_frequency(variable_id),
            source_id: source_id.map(str::to_string),
        }
    }

    pub fn label(&self) -> String {
        match &self.source_id {
            Some(source) => format!("{}.{}.{source}", self.experiment_id, self.variable_id),
            None => format!("{}.{}", self.experiment_id, self.variable_id),
        }
    }
}

/// A dataset replica: one master id served by one data node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHit {
    pub id: String,
    pub master_id: String,
    pub data_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHit {
    pub filename: String,
    pub size: Option<u64>,
    pub download_url: Option<String>,
    pub opendap_url: Option<String>,
}

pub trait IndexNode: Send + Sync {
    fn endpoint(&self) -> &str;
    fn search_datasets(&self, query: &SearchQuery) -> Result<Vec<DatasetHit>, HarvestError>;
    fn list_files(&self, dataset: &DatasetHit) -> Result<Vec<FileHit>, HarvestError>;
}

#[derive(Clone)]
pub struct EsgfHttpNode {
    client: Client,
    base_url: String,
    page_size: usize,
}

impl EsgfHttpNode {
    pub fn new(base_url: &str, timeout: Duration, page_size: usize) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("cmip-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::SearchHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| HarvestError::SearchHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
        })
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.base_url)
    }

    fn get_json(&self, params: &[(&str, String)]) -> Result<Value, HarvestError> {
        let response = self
            .client
            .get(self.search_url())
            .query(params)
            .send()
            .map_err(map_search_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "index node request failed".to_string());
            return Err(HarvestError::SearchStatus { status, message });
        }
        response
            .json::<Value>()
            .map_err(|err| HarvestError::SearchDecode(err.to_string()))
    }

    /// Walks `offset`/`limit` pages until `numFound` docs have been seen.
    fn paged_docs(&self, base: &[(&str, String)]) -> Result<Vec<Value>, HarvestError> {
        let mut docs = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut params = base.to_vec();
            params.push(("format", SOLR_JSON.to_string()));
            params.push(("limit", self.page_size.to_string()));
            params.push(("offset", offset.to_string()));
            let body = self.get_json(&params)?;
            let response = body
                .get("response")
                .ok_or_else(|| HarvestError::SearchDecode("missing response object".to_string()))?;
            let num_found = response
                .get("numFound")
                .and_then(|value| value.as_u64())
                .unwrap_or(0) as usize;
            let page = response
                .get("docs")
                .and_then(|value| value.as_array())
                .cloned()
                .unwrap_or_default();
            let page_len = page.len();
            docs.extend(page);
            offset += page_len;
            if page_len == 0 || offset >= num_found {
                return Ok(docs);
            }
        }
    }
}

impl IndexNode for EsgfHttpNode {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn search_datasets(&self, query: &SearchQuery) -> Result<Vec<DatasetHit>, HarvestError> {
        let mut params = vec![
            ("type", "Dataset".to_string()),
            ("project", PROJECT.to_string()),
            ("experiment_id", query.experiment_id.clone()),
            ("variable", query.variable_id.clone()),
            ("frequency", query.frequency.to_string()),
            ("latest", "true".to_string()),
            ("distrib", "true".to_string()),
            ("fields", "id,master_id,data_node".to_string()),
        ];
        if let Some(source) = &query.source_id {
            params.push(("source_id", source.clone()));
        }
        let docs = self.paged_docs(&params)?;
        Ok(docs.iter().filter_map(parse_dataset_doc).collect())
    }

    fn list_files(&self, dataset: &DatasetHit) -> Result<Vec<FileHit>, HarvestError> {
        let params = vec![
            ("type", "File".to_string()),
            ("dataset_id", dataset.id.clone()),
            ("distrib", "true".to_string()),
            ("fields", "title,size,url".to_string()),
        ];
        let docs = self.paged_docs(&params)?;
        Ok(docs.iter().filter_map(parse_file_doc).collect())
    }
}

fn map_search_error(err: reqwest::Error) -> HarvestError {
    if err.is_timeout() {
        HarvestError::SearchTimeout(err.to_string())
    } else {
        HarvestError::SearchHttp(err.to_string())
    }
}

/// Solr stores some scalar fields as single-element arrays.
fn scalar_str<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    match doc.get(key)? {
        Value::String(value) => Some(value.as_str()),
        Value::Array(items) => items.first().and_then(|value| value.as_str()),
        _ => None,
    }
}

pub fn parse_dataset_doc(doc: &Value) -> Option<DatasetHit> {
    let id = scalar_str(doc, "id")?.to_string();
    let (id_master, id_node) = id.split_once('|').unwrap_or((id.as_str(), ""));
    let master_id = scalar_str(doc, "master_id").unwrap_or(id_master).to_string();
    let data_node = scalar_str(doc, "data_node").unwrap_or(id_node).to_string();
    Some(DatasetHit {
        master_id,
        data_node,
        id,
    })
}

pub fn parse_file_doc(doc: &Value) -> Option<FileHit> {
    let filename = scalar_str(doc, "title")?.to_string();
    let size = match doc.get("size") {
        Some(Value::Number(value)) => value.as_u64(),
        Some(Value::String(value)) => value.parse().ok(),
        _ => None,
    };
    let (download_url, opendap_url) = doc
        .get("url")
        .and_then(|value| value.as_array())
        .map(|urls| split_access_urls(urls.iter().filter_map(|value| value.as_str())))
        .unwrap_or((None, None));
    Some(FileHit {
        filename,
        size,
        download_url,
        opendap_url,
    })
}

/// Picks the `HTTPServer` and `OPENDAP` endpoints out of `url|mime|service`
/// access entries. The OPeNDAP entry points at the `.html` form page.
pub fn split_access_urls<'a>(
    entries: impl Iterator<Item = &'a str>,
) -> (Option<String>, Option<String>) {
    let mut download = None;
    let mut opendap = None;
    for entry in entries {
        let mut parts = entry.split('|');
        let url = parts.next().unwrap_or_default();
        let service = parts.nth(1).unwrap_or_default();
        match service {
            "HTTPServer" if download.is_none() => download = Some(url.to_string()),
            "OPENDAP" if opendap.is_none() => {
                opendap = Some(url.strip_suffix(".html").unwrap_or(url).to_string())
            }
            _ => {}
        }
    }
    (download, opendap)
}

/// Ordered index nodes with fallback and a bounded pool for per-dataset file listing.
pub struct FederatedSearch<N: IndexNode> {
    nodes: Vec<N>,
    retry: RetryPolicy,
    pool: Option<ThreadPool>,
}

impl<N: IndexNode> FederatedSearch<N> {
    pub fn new(nodes: Vec<N>, retry: RetryPolicy, workers: usize) -> Self {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|idx| format!("esgf-list-{idx}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!("failed to build listing pool, falling back to sequential: {err}");
                None
            }
        };
        Self { nodes, retry, pool }
    }

    /// First node producing any record wins; results are never merged across
    /// nodes. Every node failing degrades to an empty result.
    pub fn search(&self, query: &SearchQuery, sink: &dyn ProgressSink) -> Vec<RawRecord> {
        for node in &self.nodes {
            sink.event(ProgressEvent::new(
                Stage::Harvest,
                format!("search {} on {}", query.label(), node.endpoint()),
            ));
            match self.search_node(node, query) {
                Ok(records) if !records.is_empty() => {
                    info!(
                        "{} file records for {} from {}",
                        records.len(),
                        query.label(),
                        node.endpoint()
                    );
                    return records;
                }
                Ok(_) => {
                    info!("no records for {} on {}", query.label(), node.endpoint());
                }
                Err(err) => {
                    error!("search {} on {} failed: {err}", query.label(), node.endpoint());
                }
            }
        }
        warn!("all index nodes exhausted for {}", query.label());
        Vec::new()
    }

    fn search_node(&self, node: &N, query: &SearchQuery) -> Result<Vec<RawRecord>, HarvestError> {
        let hits = node.search_datasets(query)?;
        let datasets = group_replicas(hits, query);
        let replica_count = datasets.values().map(Vec::len).sum::<usize>();
        info!(
            "{} datasets ({replica_count} replicas) found for {}",
            datasets.len(),
            query.label()
        );

        let replicas = datasets.into_values().flatten().collect::<Vec<_>>();
        let list = |hit: &DatasetHit| self.list_replica(node, hit);
        let listed: Vec<Vec<RawRecord>> = match &self.pool {
            Some(pool) => pool.install(|| replicas.par_iter().map(list).collect()),
            None => replicas.iter().map(list).collect(),
        };
        Ok(listed.into_iter().flatten().collect())
    }

    fn list_replica(&self, node: &N, hit: &DatasetHit) -> Vec<RawRecord> {
        let files = self
            .retry
            .run_transient(&format!("list {}", hit.id), |_| node.list_files(hit));
        match files {
            Ok(files) => files
                .into_iter()
                .map(|file| RawRecord {
                    master_id: hit.master_id.clone(),
                    data_node: hit.data_node.clone(),
                    filename: file.filename,
                    size: file.size,
                    download_url: file.download_url,
                    opendap_url: file.opendap_url,
                })
                .collect(),
            Err(err) => {
                error!("failed to list files for {}: {err}", hit.id);
                Vec::new()
            }
        }
    }
}

/// Groups replicas by master id. Unparsable ids and monthly datasets outside
/// the `Amon` table are dropped before any file listing is issued.
fn group_replicas(hits: Vec<DatasetHit>, query: &SearchQuery) -> BTreeMap<String, Vec<DatasetHit>> {
    let mut datasets = BTreeMap::<String, Vec<DatasetHit>>::new();
    for hit in hits {
        let facets = match hit.master_id.parse::<FacetTuple>() {
            Ok(facets) => facets,
            Err(err) => {
                warn!("skipping dataset {}: {err}", hit.id);
                continue;
            }
        };
        if query.frequency == "mon" && !facets.has_expected_frequency() {
            debug!("skipping {} with table {}", hit.master_id, facets.frequency);
            continue;
        }
        let replicas = datasets.entry(hit.master_id.clone()).or_default();
        if !replicas.iter().any(|known| known.data_node == hit.data_node) {
            replicas.push(hit);
        }
    }
    datasets
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn access_urls_split_by_service() {
        let entries = [
            "http://node/thredds/fileServer/a.nc|application/netcdf|HTTPServer",
            "gsiftp://node/a.nc|application/gridftp|GridFTP",
            "http://node/thredds/dodsC/a.nc.html|application/opendap-html|OPENDAP",
        ];
        let (download, opendap) = split_access_urls(entries.into_iter());
        assert_eq!(
            download.as_deref(),
            Some("http://node/thredds/fileServer/a.nc")
        );
        assert_eq!(opendap.as_deref(), Some("http://node/thredds/dodsC/a.nc"));
    }

    #[test]
    fn file_doc_accepts_array_title() {
        let doc = json!({
            "title": ["tas_Amon_ModelX_piControl_r1i1p1f1_gn_000101-010012.nc"],
            "size": 1024,
            "url": ["http://node/a.nc|application/netcdf|HTTPServer"]
        });
        let hit = parse_file_doc(&doc).unwrap();
        assert_eq!(hit.size, Some(1024));
        assert!(hit.opendap_url.is_none());
    }

    #[test]
    fn dataset_doc_falls_back_to_id() {
        let doc = json!({ "id": "CMIP6.CMIP.X.ModelX.piControl.r1i1p1f1.Amon.tas.gn.v1|node-a" });
        let hit = parse_dataset_doc(&doc).unwrap();
        assert_eq!(hit.master_id, "CMIP6.CMIP.X.ModelX.piControl.r1i1p1f1.Amon.tas.gn.v1");
        assert_eq!(hit.data_node, "node-a");
    }

    #[test]
    fn grouping_drops_wrong_table_and_duplicate_nodes() {
        let hit = |master: &str, node: &str| DatasetHit {
            id: format!("{master}|{node}"),
            master_id: master.to_string(),
            data_node: node.to_string(),
        };
        let amon = "CMIP6.CMIP.X.ModelX.piControl.r1i1p1f1.Amon.tas.gn.v1";
        let omon = "CMIP6.CMIP.X.ModelX.piControl.r1i1p1f1.Omon.tas.gn.v1";
        let grouped = group_replicas(
            vec![
                hit(amon, "a"),
                hit(amon, "b"),
                hit(amon, "a"),
                hit(omon, "a"),
                hit("broken", "a"),
            ],
            &SearchQuery::new("piControl", "tas", None),
        );
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[amon].len(), 2);
    }
}
