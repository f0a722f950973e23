use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::domain::FilenameFacets;
use crate::download::{Executor, QueryTransfer, Transfer};
use crate::error::HarvestError;
use crate::raw::{RawRecord, write_raw_catalog};
use crate::search::{FederatedSearch, IndexNode, SearchQuery};

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: usize,
    pub skipped_present: usize,
    pub recovered: Vec<String>,
    pub still_failed: Vec<String>,
}

/// URL candidates rebuilt for one failed filename; order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    pub download_urls: BTreeSet<String>,
    pub query_urls: BTreeSet<String>,
}

impl Candidates {
    pub fn collect(filename: &str, records: &[RawRecord]) -> Self {
        let mut candidates = Self::default();
        for record in records.iter().filter(|record| record.filename == filename) {
            candidates.download_urls.extend(record.download_url.clone());
            candidates.query_urls.extend(record.opendap_url.clone());
        }
        candidates
    }

    pub fn is_empty(&self) -> bool {
        self.download_urls.is_empty() && self.query_urls.is_empty()
    }
}

type SearchScope = (String, String, String);

pub struct Recovery<'a, N: IndexNode, T: Transfer, Q: QueryTransfer> {
    search: &'a FederatedSearch<N>,
    executor: &'a Executor<T, Q>,
}

impl<'a, N: IndexNode, T: Transfer, Q: QueryTransfer> Recovery<'a, N, T, Q> {
    pub fn new(search: &'a FederatedSearch<N>, executor: &'a Executor<T, Q>) -> Self {
        Self { search, executor }
    }

    /// Re-searches each failed file scoped to its own source and retries it
    /// against the rebuilt URL set. Scoped search results are kept under
    /// `raw/extra/` so the next catalog build folds them in.
    pub fn recover(
        &self,
        failures: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<RecoveryReport, HarvestError> {
        let started_at = Utc::now();
        let workspace = self.executor.workspace();

        let mut seen = BTreeSet::new();
        let mut skipped_present = 0usize;
        let mut still_failed = Vec::new();
        let mut scopes = BTreeMap::<SearchScope, Vec<String>>::new();
        for filename in failures {
            if !filename.ends_with(".nc") || !seen.insert(filename.as_str()) {
                continue;
            }
            if workspace.is_present(filename) {
                skipped_present += 1;
                continue;
            }
            match filename.parse::<FilenameFacets>() {
                Ok(facets) => scopes
                    .entry((facets.experiment_id, facets.variable_id, facets.source_id))
                    .or_default()
                    .push(filename.clone()),
                Err(err) => {
                    warn!("{err}");
                    still_failed.push(filename.clone());
                }
            }
        }
        let targets = seen.len() - skipped_present;
        info!("{targets} files to recover");

        let mut recovered = Vec::new();
        for ((experiment, variable, source), filenames) in scopes {
            let query = SearchQuery::new(&experiment, &variable, Some(&source));
            let records = self.search.search(&query, sink);
            if !records.is_empty() {
                write_raw_catalog(
                    &workspace.extra_catalog_path(&experiment, &variable, &source),
                    &records,
                )?;
            }

            for filename in filenames {
                let candidates = Candidates::collect(&filename, &records);
                if candidates.is_empty() {
                    warn!("no url found for {filename}");
                    still_failed.push(filename);
                    continue;
                }
                sink.event(ProgressEvent::new(
                    Stage::Recover,
                    format!(
                        "retrying {filename} with {} urls",
                        candidates.download_urls.len() + candidates.query_urls.len()
                    ),
                ));
                let download_urls = candidates.download_urls.into_iter().collect::<Vec<_>>();
                let query_urls = candidates.query_urls.into_iter().collect::<Vec<_>>();
                if self
                    .executor
                    .attempt(&filename, &download_urls, &query_urls)
                    .is_failed()
                {
                    still_failed.push(filename);
                } else {
                    recovered.push(filename);
                }
            }
        }

        Ok(RecoveryReport {
            started_at,
            finished_at: Utc::now(),
            targets,
            skipped_present,
            recovered,
            still_failed,
        })
    }
}
