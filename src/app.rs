use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::catalog::{Catalog, IngestStats};
use crate::config::ResolvedConfig;
use crate::download::{DownloadReport, Executor, QueryTransfer, Transfer, read_ledger, write_ledger};
use crate::error::HarvestError;
use crate::raw::write_raw_catalog;
use crate::recover::{Recovery, RecoveryReport};
use crate::search::{FederatedSearch, IndexNode, SearchQuery};
use crate::select::{format_gigabytes, read_queue, select};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Harvest,
    Process,
    Queue,
    Download,
    Recover,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Harvest => "harvest",
            Stage::Process => "process",
            Stage::Queue => "queue",
            Stage::Download => "download",
            Stage::Recover => "recover",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn finished(stage: Stage, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            stage,
            message: message.into(),
            elapsed: Some(elapsed),
        }
    }
}

/// Per-run progress channel handed to every stage.
pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct PairSummary {
    pub experiment_id: String,
    pub variable_id: String,
    pub records: usize,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs: Vec<PairSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: usize,
    pub sources: Vec<String>,
    pub stats: IngestStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStorage {
    pub source_id: String,
    pub files: usize,
    pub bytes: u64,
    pub storage: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceStorage>,
    pub files: usize,
    pub total_bytes: u64,
    pub total_storage: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub harvest: HarvestReport,
    pub process: ProcessReport,
    pub queue: QueueReport,
    pub download: DownloadReport,
    pub recover: RecoveryReport,
}

pub struct App<N: IndexNode, T: Transfer, Q: QueryTransfer> {
    config: ResolvedConfig,
    search: FederatedSearch<N>,
    executor: Executor<T, Q>,
}

impl<N: IndexNode, T: Transfer, Q: QueryTransfer> App<N, T, Q> {
    pub fn new(config: ResolvedConfig, nodes: Vec<N>, transfer: T, query: Q) -> Self {
        let workspace = Workspace::new(config.workspace.clone());
        let search = FederatedSearch::new(
            nodes,
            config.network.retry,
            config.network.search_workers,
        );
        let executor = Executor::new(workspace, transfer, query, config.network.retry);
        Self {
            config,
            search,
            executor,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        self.executor.workspace()
    }

    /// One raw listing per (experiment, variable). A pair every node failed
    /// on still gets a header-only file.
    pub fn harvest(&self, sink: &dyn ProgressSink) -> Result<HarvestReport, HarvestError> {
        let _span = info_span!("harvest").entered();
        let start = Instant::now();
        let started_at = Utc::now();
        self.workspace().ensure_layout()?;

        let mut pairs = Vec::new();
        for experiment in &self.config.experiments {
            for variable in &self.config.variables {
                let query = SearchQuery::new(experiment, variable, None);
                let records = self.search.search(&query, sink);
                let path = self.workspace().raw_catalog_path(experiment, variable);
                write_raw_catalog(&path, &records)?;
                sink.event(ProgressEvent::new(
                    Stage::Harvest,
                    format!("{} records saved to {path}", records.len()),
                ));
                pairs.push(PairSummary {
                    experiment_id: experiment.clone(),
                    variable_id: variable.clone(),
                    records: records.len(),
                    path: path.to_string(),
                });
            }
        }
        sink.event(ProgressEvent::finished(
            Stage::Harvest,
            format!("{} listings written", pairs.len()),
            start.elapsed(),
        ));
        Ok(HarvestReport {
            started_at,
            finished_at: Utc::now(),
            pairs,
        })
    }

    pub fn process(&self, sink: &dyn ProgressSink) -> Result<ProcessReport, HarvestError> {
        let _span = info_span!("process").entered();
        let start = Instant::now();
        let started_at = Utc::now();
        self.workspace().ensure_layout()?;

        let mut catalog = Catalog::new();
        let stats = catalog.ingest_workspace(
            self.workspace(),
            &self.config.experiments,
            &self.config.variables,
        )?;
        let written = catalog.write_sources(self.workspace())?;
        sink.event(ProgressEvent::finished(
            Stage::Process,
            format!(
                "{} files cataloged into {} source files",
                catalog.len(),
                written.len()
            ),
            start.elapsed(),
        ));
        Ok(ProcessReport {
            started_at,
            finished_at: Utc::now(),
            files: catalog.len(),
            sources: catalog.source_ids().to_vec(),
            stats,
        })
    }

    pub fn queue(&self, sink: &dyn ProgressSink) -> Result<QueueReport, HarvestError> {
        let _span = info_span!("queue").entered();
        let start = Instant::now();
        let started_at = Utc::now();
        self.workspace().ensure_layout()?;

        let catalog = Catalog::load_sources(self.workspace())?;
        let selection = select(&catalog, &self.config.selection);
        selection.write(self.workspace())?;

        let total_bytes = selection.total_bytes();
        let sources = selection
            .sources
            .iter()
            .map(|source| SourceStorage {
                source_id: source.source_id.clone(),
                files: source.entries.len(),
                bytes: source.total_bytes,
                storage: format_gigabytes(source.total_bytes),
            })
            .collect::<Vec<_>>();
        let files = selection.entries().count();
        sink.event(ProgressEvent::finished(
            Stage::Queue,
            format!(
                "{} of storage required for {files} files",
                format_gigabytes(total_bytes)
            ),
            start.elapsed(),
        ));
        Ok(QueueReport {
            started_at,
            finished_at: Utc::now(),
            sources,
            files,
            total_bytes,
            total_storage: format_gigabytes(total_bytes),
        })
    }

    pub fn download(&self, sink: &dyn ProgressSink) -> Result<DownloadReport, HarvestError> {
        let _span = info_span!("download").entered();
        let start = Instant::now();
        self.workspace().ensure_layout()?;

        let entries = read_queue(self.workspace())?;
        if entries.is_empty() {
            warn!("download queue is empty");
        }
        let report = self.executor.run(&entries, sink);
        write_ledger(
            &self.workspace().failed_ledger_path(),
            &report.failed_filenames(),
        )?;
        info!(
            "{} downloaded, {} via opendap, {} present, {} failed",
            report.downloaded,
            report.materialized,
            report.already_present,
            report.failed.len()
        );
        sink.event(ProgressEvent::finished(
            Stage::Download,
            format!("{} of {} files failed", report.failed.len(), report.total),
            start.elapsed(),
        ));
        Ok(report)
    }

    pub fn recover(&self, sink: &dyn ProgressSink) -> Result<RecoveryReport, HarvestError> {
        let _span = info_span!("recover").entered();
        let start = Instant::now();
        self.workspace().ensure_layout()?;

        let failures = read_ledger(&self.workspace().failed_ledger_path())?;
        let report = Recovery::new(&self.search, &self.executor).recover(&failures, sink)?;
        write_ledger(
            &self.workspace().still_failed_ledger_path(),
            &report.still_failed,
        )?;
        sink.event(ProgressEvent::finished(
            Stage::Recover,
            format!(
                "{} recovered, {} still failed",
                report.recovered.len(),
                report.still_failed.len()
            ),
            start.elapsed(),
        ));
        Ok(report)
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunReport, HarvestError> {
        Ok(RunReport {
            harvest: self.harvest(sink)?,
            process: self.process(sink)?,
            queue: self.queue(sink)?,
            download: self.download(sink)?,
            recover: self.recover(sink)?,
        })
    }
}
