use std::io;
use std::time::Duration;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, error, info, warn};

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::error::HarvestError;
use crate::retry::RetryPolicy;
use crate::select::QueueEntry;
use crate::workspace::Workspace;

/// Direct transfer of a file URL to `destination`. Implementations must only
/// create `destination` once the full body has been received.
pub trait Transfer: Send + Sync {
    fn fetch(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError>;
}

/// Materializes a remote dataset handle, opened through its query endpoint,
/// as a file at `destination`.
pub trait QueryTransfer: Send + Sync {
    fn materialize(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError>;
}

fn build_client(connect_timeout: Duration, timeout: Duration) -> Result<Client, HarvestError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("cmip-harvest/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| HarvestError::DownloadHttp(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .build()
        .map_err(|err| HarvestError::DownloadHttp(err.to_string()))
}

fn map_download_error(err: reqwest::Error) -> HarvestError {
    if err.is_timeout() {
        HarvestError::DownloadTimeout(err.to_string())
    } else {
        HarvestError::DownloadHttp(err.to_string())
    }
}

/// Streams `url` into a temp file beside `destination`, checks the byte count
/// against `Content-Length`, then renames it into place.
fn stream_to_file(client: &Client, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError> {
    let mut response = client.get(url).send().map_err(map_download_error)?;
    if !response.status().is_success() {
        return Err(HarvestError::DownloadStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    let expected = response.content_length();

    let parent = destination
        .parent()
        .ok_or_else(|| HarvestError::Filesystem(format!("invalid destination {destination}")))?;
    Workspace::ensure_dir(parent)?;
    let mut temp = Builder::new()
        .prefix(".partial-")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let received = io::copy(&mut response, temp.as_file_mut()).map_err(|err| {
        if err.kind() == io::ErrorKind::TimedOut {
            HarvestError::DownloadTimeout(err.to_string())
        } else {
            HarvestError::DownloadHttp(err.to_string())
        }
    })?;
    if let Some(expected) = expected {
        if expected != received {
            return Err(HarvestError::IncompleteTransfer {
                url: url.to_string(),
                expected,
                received,
            });
        }
    }
    temp.as_file()
        .sync_all()
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    temp.persist(destination.as_std_path())
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    Ok(received)
}

#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self, HarvestError> {
        Ok(Self {
            client: build_client(connect_timeout, timeout)?,
        })
    }
}

impl Transfer for HttpTransfer {
    fn fetch(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError> {
        stream_to_file(&self.client, url, destination)
    }
}

/// OPeNDAP fallback. The server renders the whole dataset as netCDF when the
/// `.nc` response suffix is appended to the dataset URL.
#[derive(Clone)]
pub struct DapTransfer {
    client: Client,
}

impl DapTransfer {
    pub fn new(connect_timeout: Duration, timeout: Duration) -> Result<Self, HarvestError> {
        Ok(Self {
            client: build_client(connect_timeout, timeout)?,
        })
    }

    pub fn netcdf_url(url: &str) -> String {
        let url = url.strip_suffix(".html").unwrap_or(url);
        if url.ends_with(".nc.nc") {
            url.to_string()
        } else {
            format!("{url}.nc")
        }
    }
}

impl QueryTransfer for DapTransfer {
    fn materialize(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError> {
        stream_to_file(&self.client, &Self::netcdf_url(url), destination)
            .map_err(|err| HarvestError::QueryProtocol(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    AlreadyPresent,
    Downloaded { url: String, bytes: u64 },
    Materialized { url: String, bytes: u64 },
    Failed,
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed)
    }
}

/// A filename whose download and query chains were both exhausted, with the
/// queue group it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub filename: String,
    pub source_id: String,
    pub experiment_id: String,
    pub variable_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub already_present: usize,
    pub downloaded: usize,
    pub materialized: usize,
    pub failed: Vec<FailureRecord>,
}

impl DownloadReport {
    pub fn failed_filenames(&self) -> Vec<String> {
        self.failed
            .iter()
            .map(|failure| failure.filename.clone())
            .collect()
    }
}

pub struct Executor<T: Transfer, Q: QueryTransfer> {
    workspace: Workspace,
    transfer: T,
    query: Q,
    retry: RetryPolicy,
}

impl<T: Transfer, Q: QueryTransfer> Executor<T, Q> {
    pub fn new(workspace: Workspace, transfer: T, query: Q, retry: RetryPolicy) -> Self {
        Self {
            workspace,
            transfer,
            query,
            retry,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// A file already present under its canonical name is taken as complete
    /// and costs no network call.
    pub fn execute(&self, entry: &QueueEntry) -> Outcome {
        if self.workspace.is_present(&entry.filename) {
            debug!("found {}", entry.filename);
            return Outcome::AlreadyPresent;
        }
        self.attempt(&entry.filename, &entry.download_urls, &entry.query_urls)
    }

    /// Download URLs in order, each retried on transient errors, then query
    /// URLs in order, each retried on any error.
    pub fn attempt(&self, filename: &str, download_urls: &[String], query_urls: &[String]) -> Outcome {
        if !is_plain_filename(filename) {
            error!("refusing unsafe filename {filename:?}");
            return Outcome::Failed;
        }
        let destination = self.workspace.download_path(filename);

        for url in download_urls.iter().filter(|url| !url.is_empty()) {
            let result = self
                .retry
                .run_transient(&format!("download {url}"), |_| {
                    self.transfer.fetch(url, &destination)
                });
            match result {
                Ok(bytes) => {
                    info!("downloaded {filename} ({bytes} bytes) from {url}");
                    return Outcome::Downloaded {
                        url: url.clone(),
                        bytes,
                    };
                }
                Err(err) => debug!("download {url} failed: {err}"),
            }
        }

        if !download_urls.is_empty() {
            warn!("failed to download {filename}, trying query protocol");
        }
        for url in query_urls.iter().filter(|url| !url.is_empty()) {
            let result = self
                .retry
                .run_any(&format!("opendap {url}"), |_| {
                    self.query.materialize(url, &destination)
                });
            match result {
                Ok(bytes) => {
                    info!("materialized {filename} ({bytes} bytes) from {url}");
                    return Outcome::Materialized {
                        url: url.clone(),
                        bytes,
                    };
                }
                Err(err) => debug!("opendap {url} failed: {err}"),
            }
        }

        error!("options exhausted for {filename}");
        Outcome::Failed
    }

    /// Processes the queue sequentially; a failed entry never stops the run.
    pub fn run(&self, entries: &[QueueEntry], sink: &dyn ProgressSink) -> DownloadReport {
        let started_at = Utc::now();
        let mut report = DownloadReport {
            started_at,
            finished_at: started_at,
            total: entries.len(),
            already_present: 0,
            downloaded: 0,
            materialized: 0,
            failed: Vec::new(),
        };
        let width = entries.len().to_string().len();
        for (idx, entry) in entries.iter().enumerate() {
            let outcome = self.execute(entry);
            if !matches!(outcome, Outcome::AlreadyPresent) {
                sink.event(ProgressEvent::new(
                    Stage::Download,
                    format!(
                        "{:>width$}/{}: {} {}",
                        idx + 1,
                        entries.len(),
                        outcome_verb(&outcome),
                        entry.filename
                    ),
                ));
            }
            match outcome {
                Outcome::AlreadyPresent => report.already_present += 1,
                Outcome::Downloaded { .. } => report.downloaded += 1,
                Outcome::Materialized { .. } => report.materialized += 1,
                Outcome::Failed => report.failed.push(FailureRecord {
                    filename: entry.filename.clone(),
                    source_id: entry.source_id.clone(),
                    experiment_id: entry.experiment_id.clone(),
                    variable_id: entry.variable_id.clone(),
                }),
            }
        }
        report.finished_at = Utc::now();
        report
    }
}

fn outcome_verb(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::AlreadyPresent => "found",
        Outcome::Downloaded { .. } => "downloaded",
        Outcome::Materialized { .. } => "materialized",
        Outcome::Failed => "failed",
    }
}

fn is_plain_filename(filename: &str) -> bool {
    !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\'])
}

pub fn write_ledger(path: &Utf8Path, filenames: &[String]) -> Result<(), HarvestError> {
    Workspace::write_lines(path, filenames)
}

/// Newline-delimited filenames. A missing ledger reads as empty.
pub fn read_ledger(path: &Utf8Path) -> Result<Vec<String>, HarvestError> {
    if !path.as_std_path().is_file() {
        return Ok(Vec::new());
    }
    Ok(Workspace::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
