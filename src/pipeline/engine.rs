//! Request-level orchestration.
//!
//! fetch → parse corpus → partition and allocate → run jobs → merge →
//! deliver, all inside one [`ArtifactRegistry`] whose cleanup runs on every
//! exit path, including cancellation.

use crate::config::Config;
use crate::corpus::{Corpus, CorpusFormat};
use crate::error::PipelineError;
use crate::io::{is_remote, ArtifactKind, ArtifactRegistry, ObjectStorage};
use crate::partition::PartitionPlan;
use crate::pipeline::executor::BoundedExecutor;
use crate::pipeline::invoker::{ProcessInvoker, ToolInvoker};
use crate::pipeline::job::{JobRunner, JobSettings};
use crate::pipeline::merger::{MergedResult, ResultMerger, RunSummary};
use crate::pipeline::{Metrics, MetricsReporter, MetricsSnapshot};
use crate::table::SchemaParser;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Where the merged table ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivery {
    /// Object URI, or download URL when upload fell back to local storage.
    Link { url: String },
    /// Kept on the local filesystem.
    File { path: PathBuf },
    /// Nothing was dispatched, so there is no table.
    Empty,
}

/// Outcome of one request.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub request_id: String,
    pub delivery: Delivery,
    pub header: Vec<String>,
    pub row_count: usize,
    /// Some jobs contributed no rows.
    pub partial: bool,
    pub allocation: String,
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
    pub cleanup_warnings: Vec<String>,
}

/// Blocking tasks started by one request.
///
/// Dropping a `spawn_blocking` handle does not stop the task, so a cancelled
/// request signals these and waits for them before removing its artifacts.
#[derive(Debug, Default)]
struct BlockingWork {
    cancel: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockingWork {
    fn spawn<F, R>(&self, f: F) -> oneshot::Receiver<R>
    where
        F: FnOnce(&AtomicBool) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = self.cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _ = tx.send(f(&cancel));
        });
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        rx
    }

    /// Signal cancellation and wait until every task has returned.
    async fn cancel_and_wait(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Blocking task failed: {}", e);
            }
        }
    }
}

/// Fan-out engine for one configured tool.
pub struct Engine {
    config: Arc<Config>,
    storage: ObjectStorage,
    invoker: Arc<dyn ToolInvoker>,
    parser: Arc<dyn SchemaParser>,
}

impl Engine {
    /// Build an engine that runs real processes against configured storage.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let parser: Arc<dyn SchemaParser> = Arc::from(config.tool.parser.build()?);
        Ok(Self {
            storage: ObjectStorage::from_config(&config.storage),
            config: Arc::new(config),
            invoker: Arc::new(ProcessInvoker),
            parser,
        })
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_storage(mut self, storage: ObjectStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Partition `input` without running anything.
    pub async fn plan(&self, input: &str) -> Result<PartitionPlan, PipelineError> {
        let registry = ArtifactRegistry::create(&self.config.processing.scratch_base(), "plan")?;
        let corpus = self.load_corpus(input, &registry).await;
        registry.cleanup();
        Ok(PartitionPlan::build(
            &corpus?,
            &self.config.partition,
            self.config.processing.effective_concurrency(),
        )?)
    }

    /// Process one input to completion.
    pub async fn run(&self, input: &str) -> Result<RunReport, PipelineError> {
        self.run_until(input, std::future::pending()).await
    }

    /// Process one input, abandoning it when `shutdown` completes first.
    ///
    /// On cancellation in-flight tool processes are killed, nothing is
    /// uploaded, and every artifact is removed.
    pub async fn run_until<F>(&self, input: &str, shutdown: F) -> Result<RunReport, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let request_id = Uuid::new_v4().to_string();
        let registry = Arc::new(ArtifactRegistry::create(
            &self.config.processing.scratch_base(),
            &request_id,
        )?);
        tracing::info!("Request {} started for {}", request_id, input);
        let blocking = BlockingWork::default();

        let outcome = tokio::select! {
            biased;
            _ = shutdown => {
                tracing::warn!("Request {} cancelled", request_id);
                Err(PipelineError::Cancelled)
            }
            result = self.execute(&request_id, input, &registry, &blocking) => result,
        };

        blocking.cancel_and_wait().await;
        let cleanup = registry.cleanup();
        let warnings: Vec<String> = cleanup.warnings.iter().map(ToString::to_string).collect();

        match outcome {
            Ok(mut report) => {
                report.cleanup_warnings = warnings;
                tracing::info!("Request {} complete: {}", request_id, report.summary);
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Request {} failed: {}", request_id, e);
                Err(e)
            }
        }
    }

    async fn load_corpus(&self, input: &str, registry: &ArtifactRegistry) -> Result<Corpus, PipelineError> {
        let path = self
            .storage
            .fetch(input, registry.root())
            .await
            .map_err(PipelineError::Fetch)?;
        if is_remote(input) {
            registry.register_file(&path, ArtifactKind::Input);
        }
        Corpus::from_file(&path).map_err(PipelineError::Fetch)
    }

    async fn execute(
        &self,
        request_id: &str,
        input: &str,
        registry: &Arc<ArtifactRegistry>,
        blocking: &BlockingWork,
    ) -> Result<RunReport, PipelineError> {
        let metrics = Metrics::new();
        let corpus = self.load_corpus(input, registry).await?;

        let plan = PartitionPlan::build(
            &corpus,
            &self.config.partition,
            self.config.processing.effective_concurrency(),
        )?;
        tracing::info!("{}", plan);
        metrics.add_records_skipped((plan.skipped_length + plan.skipped_malformed) as u64);

        let summary = RunSummary {
            skipped_records: plan.skipped_length,
            malformed_records: plan.skipped_malformed,
            ..Default::default()
        };
        let allocation = plan.allocation.to_string();

        if plan.is_empty() {
            tracing::info!("Request {} has no records to process", request_id);
            return Ok(self.report(request_id, Delivery::Empty, MergedResult::empty(summary), allocation, &metrics));
        }

        let mut merged = self
            .fan_out(request_id, plan, corpus.format(), summary, registry, blocking, &metrics)
            .await?;

        if let Some(err) = merged.error.take() {
            return Err(PipelineError::Merge(err));
        }
        let delivery = match &merged.path {
            Some(path) => self.deliver(request_id, path, registry).await?,
            None => Delivery::Empty,
        };

        self.save_metrics(&metrics);
        Ok(self.report(request_id, delivery, merged, allocation, &metrics))
    }

    async fn fan_out(
        &self,
        request_id: &str,
        plan: PartitionPlan,
        format: CorpusFormat,
        summary: RunSummary,
        registry: &Arc<ArtifactRegistry>,
        blocking: &BlockingWork,
        metrics: &Arc<Metrics>,
    ) -> Result<MergedResult, PipelineError> {
        let jobs = plan.partitions;
        let total_jobs = jobs.len();
        metrics.add_job_submitted(total_jobs as u64);

        let runner = JobRunner::new(
            self.invoker.clone(),
            registry.clone(),
            metrics.clone(),
            JobSettings::from_config(&self.config),
            format,
        );
        let executor = BoundedExecutor::new(plan.allocation.total());

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.processing.enable_metrics {
            let reporter = MetricsReporter::new(
                metrics.clone(),
                self.config.processing.metrics_interval_secs,
                total_jobs as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let outcomes = executor.run_all(jobs, |partition| runner.run(partition)).await;

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let dest = registry.file_path(ArtifactKind::Merged, &self.config.output.object_name(request_id));
        let merger = ResultMerger::new(self.parser.clone());
        let started = Instant::now();
        let completed = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        let merged = blocking
            .spawn(move |cancel| merger.merge(outcomes, &dest, summary, cancel))
            .await
            .map_err(|_| PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "merge task panicked")))?;

        // Jobs whose output the merge discarded count as failed.
        metrics.reclassify_rejected(completed.saturating_sub(merged.summary.succeeded) as u64);
        metrics.add_merge_time(started.elapsed());
        metrics.add_rows_merged(merged.row_count as u64);
        Ok(merged)
    }

    /// Upload the merged table, or keep it locally.
    async fn deliver(&self, request_id: &str, path: &Path, registry: &ArtifactRegistry) -> Result<Delivery, PipelineError> {
        let output = &self.config.output;
        let object_name = output.object_name(request_id);

        let Some(bucket) = &output.bucket else {
            let kept = registry.persist(path, &output.local_dir)?;
            tracing::info!("Merged result kept at {}", kept.display());
            return Ok(Delivery::File { path: kept });
        };

        match self.storage.store(path, bucket, &object_name).await {
            Ok(url) => Ok(Delivery::Link { url }),
            Err(e) => match &output.download_url_prefix {
                Some(prefix) => {
                    tracing::warn!("Upload failed ({:#}), serving {} locally", e, object_name);
                    registry.persist(path, &output.local_dir)?;
                    Ok(Delivery::Link {
                        url: format!("{}/{}", prefix.trim_end_matches('/'), object_name),
                    })
                }
                None => Err(PipelineError::Upload(e)),
            },
        }
    }

    fn save_metrics(&self, metrics: &Metrics) {
        if !self.config.processing.enable_metrics {
            return;
        }
        if let Some(ref path) = self.config.processing.metrics_output_path {
            if let Err(e) = metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }

    fn report(
        &self,
        request_id: &str,
        delivery: Delivery,
        merged: MergedResult,
        allocation: String,
        metrics: &Metrics,
    ) -> RunReport {
        RunReport {
            request_id: request_id.to_string(),
            delivery,
            partial: merged.is_partial(),
            header: merged.header,
            row_count: merged.row_count,
            allocation,
            summary: merged.summary,
            metrics: self.config.processing.enable_metrics.then(|| metrics.snapshot()),
            cleanup_warnings: Vec::new(),
        }
    }
}
