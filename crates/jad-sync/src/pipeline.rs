//! Aggregation run: fetch -> normalize -> identity -> conditional upsert.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jad_adapters::{JobSource, SourceFetchError};
use jad_core::{identity_of, normalize, RawPosting};
use jad_storage::{bounded, PostingStore};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub source_timeout: Duration,
    pub store_timeout: Duration,
    pub concurrent_sources: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(120),
            store_timeout: Duration::from_secs(10),
            concurrent_sources: false,
        }
    }
}

/// Outcome for one source within one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    /// Postings this run inserted for the first time.
    pub new_count: usize,
    /// Raw postings the source yielded, malformed ones included.
    pub total_count: usize,
    pub malformed_count: usize,
    /// Postings whose write failed; they are picked up again next run.
    pub store_failures: usize,
    pub fetch_error: Option<String>,
}

impl SourceReport {
    fn fetch_failed(err: &SourceFetchError) -> Self {
        Self {
            fetch_error: Some(err.to_string()),
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: SourceReport) {
        self.new_count += other.new_count;
        self.total_count += other.total_count;
        self.malformed_count += other.malformed_count;
        self.store_failures += other.store_failures;
        if other.fetch_error.is_some() {
            self.fetch_error = other.fetch_error;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_source: BTreeMap<String, SourceReport>,
    pub malformed_count: usize,
}

impl AggregationReport {
    pub fn per_source_new_count(&self) -> BTreeMap<&str, usize> {
        self.per_source
            .iter()
            .map(|(id, r)| (id.as_str(), r.new_count))
            .collect()
    }

    pub fn per_source_total_count(&self) -> BTreeMap<&str, usize> {
        self.per_source
            .iter()
            .map(|(id, r)| (id.as_str(), r.total_count))
            .collect()
    }

    pub fn new_count(&self) -> usize {
        self.per_source.values().map(|r| r.new_count).sum()
    }

    pub fn store_failures(&self) -> usize {
        self.per_source.values().map(|r| r.store_failures).sum()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.per_source
            .iter()
            .filter(|(_, r)| r.fetch_error.is_some())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

struct RunBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    per_source: BTreeMap<String, SourceReport>,
}

impl RunBuilder {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            per_source: BTreeMap::new(),
        }
    }

    /// Keyed by the trimmed id, matching what `normalize` stores.
    fn record(&mut self, source_id: &str, report: SourceReport) {
        self.per_source
            .entry(source_id.trim().to_string())
            .or_default()
            .absorb(report);
    }

    fn finish(self) -> AggregationReport {
        let report = AggregationReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            malformed_count: self.per_source.values().map(|r| r.malformed_count).sum(),
            per_source: self.per_source,
        };
        info!(
            run_id = %report.run_id,
            sources = report.per_source.len(),
            new = report.new_count(),
            malformed = report.malformed_count,
            store_failures = report.store_failures(),
            failed_sources = report.failed_sources().len(),
            "aggregation run finished"
        );
        report
    }
}

/// Orchestrates one aggregation run against an injected store.
///
/// A run never fails as a whole: bad records, failing sources and store errors
/// are counted in the returned [`AggregationReport`].
#[derive(Clone)]
pub struct AggregationPipeline {
    store: Arc<dyn PostingStore>,
    options: PipelineOptions,
}

impl AggregationPipeline {
    pub fn new(store: Arc<dyn PostingStore>, options: PipelineOptions) -> Self {
        Self { store, options }
    }

    /// Fetch every source (under the source timeout) and ingest what it yields.
    pub async fn run(&self, sources: &[Arc<dyn JobSource>]) -> AggregationReport {
        let mut run = RunBuilder::start();
        let run_span = info_span!("aggregation_run", run_id = %run.run_id);

        if self.options.concurrent_sources {
            let mut handles = Vec::with_capacity(sources.len());
            for source in sources {
                let pipeline = self.clone();
                let source = Arc::clone(source);
                let source_id = source.source_id().to_string();
                let span = info_span!(parent: &run_span, "source", source_id = %source_id);
                let handle = tokio::spawn(
                    async move { pipeline.fetch_and_ingest(source.as_ref()).await }.instrument(span),
                );
                handles.push((source_id, handle));
            }
            for (source_id, handle) in handles {
                let report = match handle.await {
                    Ok(report) => report,
                    Err(err) => {
                        warn!(parent: &run_span, source_id = %source_id, error = %err, "source task aborted");
                        SourceReport {
                            fetch_error: Some(format!("source task aborted: {err}")),
                            ..SourceReport::default()
                        }
                    }
                };
                run.record(&source_id, report);
            }
        } else {
            for source in sources {
                let source_id = source.source_id().to_string();
                let span = info_span!(parent: &run_span, "source", source_id = %source_id);
                let report = self.fetch_and_ingest(source.as_ref()).instrument(span).await;
                run.record(&source_id, report);
            }
        }

        let _entered = run_span.enter();
        run.finish()
    }

    /// Aggregate already materialized per-source result lists.
    pub async fn run_batches(&self, batches: BTreeMap<String, Vec<RawPosting>>) -> AggregationReport {
        let mut run = RunBuilder::start();
        for (source_id, raws) in batches {
            let report = self.ingest(&source_id, &raws).await;
            run.record(&source_id, report);
        }
        run.finish()
    }

    async fn fetch_and_ingest(&self, source: &dyn JobSource) -> SourceReport {
        let source_id = source.source_id().to_string();
        let limit = self.options.source_timeout;
        let fetched = match tokio::time::timeout(limit, source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(SourceFetchError::Timeout(limit)),
        };

        match fetched {
            Ok(raws) => self.ingest(&source_id, &raws).await,
            Err(err) => {
                warn!(source_id = %source_id, error = %err, "source fetch failed; skipping source this run");
                SourceReport::fetch_failed(&err)
            }
        }
    }

    /// Normalize, hash and upsert one source's raw postings.
    pub async fn ingest(&self, source_id: &str, raws: &[RawPosting]) -> SourceReport {
        let mut report = SourceReport {
            total_count: raws.len(),
            ..SourceReport::default()
        };

        for raw in raws {
            let posting = match normalize(raw, source_id) {
                Ok(posting) => posting,
                Err(err) => {
                    report.malformed_count += 1;
                    debug!(source_id, error = %err, "dropping malformed posting");
                    continue;
                }
            };
            let identity = identity_of(&posting);

            match bounded(self.options.store_timeout, self.store.upsert(&posting, &identity)).await {
                Ok(result) if result.is_new => report.new_count += 1,
                Ok(_) => {}
                Err(err) => {
                    report.store_failures += 1;
                    warn!(source_id, url = %posting.url, error = %err, "posting not persisted; will retry next run");
                }
            }
        }

        info!(
            source_id,
            new = report.new_count,
            total = report.total_count,
            malformed = report.malformed_count,
            store_failures = report.store_failures,
            "source aggregated"
        );
        report
    }
}
