//! Pipeline lifecycle
//!
//! A [`Pipeline`] wires the record builder, shard router, shard flushers and
//! merge coordinator to a host and a packet source, and drives them through
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Every start builds
//! its components from scratch; nothing carries over between runs except the
//! files on disk.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::host::{ApplicationId, HostServices, PacketProcessor, PacketSource, ProcessorId, TrafficSelector};
use crate::merge::{MergeCoordinator, MergeReport};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::packet::DecodedPacket;
use crate::record::{RecordBuilder, StreamCounters};
use crate::scheduler::Scheduler;
use crate::shard::{util, FlushOutcome, ShardFlusher, ShardManager, ShardRouter, ShardStats};

/// Name of the advisory lock file inside the base directory
pub const LOCK_FILE_NAME: &str = ".netcap.lock";

/// Lifecycle state of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Operator view of a running pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub state: LifecycleState,
    pub application: ApplicationId,
    /// Last sequence number assigned
    pub last_sequence: u64,
    /// Accumulated inter-arrival time in milliseconds
    pub elapsed_millis: u64,
    pub shards: ShardStats,
    pub metrics: MetricsSnapshot,
}

/// Packet processor turning packets into routed records
struct CaptureProcessor {
    builder: RecordBuilder,
    router: ShardRouter,
    metrics: Arc<MetricsCollector>,
}

impl PacketProcessor for CaptureProcessor {
    fn process(&self, packet: &DecodedPacket) {
        self.metrics.record_received();

        match self.builder.build(packet) {
            Some(record) => {
                self.router.route(&record);
            }
            None => self.metrics.record_skipped(),
        }
    }
}

/// Everything owned by one run, torn down by `stop`
struct Run {
    application: ApplicationId,
    processor: ProcessorId,
    selector: TrafficSelector,
    counters: Arc<StreamCounters>,
    shards: Arc<ShardManager>,
    merger: Arc<MergeCoordinator>,
    scheduler: Scheduler,
    metrics: Arc<MetricsCollector>,
    lock_file: File,
}

/// Capture pipeline bound to a host and a packet source
pub struct Pipeline {
    config: PipelineConfig,
    host: Arc<dyn HostServices>,
    source: Arc<dyn PacketSource>,
    state: Mutex<LifecycleState>,
    run: Mutex<Option<Run>>,
    metrics: Mutex<Arc<MetricsCollector>>,
}

impl Pipeline {
    /// Create a stopped pipeline
    pub fn new(config: PipelineConfig, host: Arc<dyn HostServices>, source: Arc<dyn PacketSource>) -> Self {
        Self {
            config,
            host,
            source,
            state: Mutex::new(LifecycleState::Stopped),
            run: Mutex::new(None),
            metrics: Mutex::new(Arc::new(MetricsCollector::new())),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Check if the pipeline is running
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Start capturing
    ///
    /// Fails unless the pipeline is stopped. A failure part way through undoes
    /// the steps already taken and leaves the pipeline stopped.
    pub fn start(&self) -> Result<()> {
        let mut run = self.run.lock();
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Stopped {
                return Err(Error::lifecycle(format!("Cannot start a pipeline that is {}", *state)));
            }
            *state = LifecycleState::Starting;
        }
        tracing::info!(application = %self.config.application_name, "pipeline starting");

        match self.start_run() {
            Ok(started) => {
                *self.metrics.lock() = started.metrics.clone();
                *run = Some(started);
                *self.state.lock() = LifecycleState::Running;
                tracing::info!(
                    shards = self.config.shard_count,
                    dir = %self.config.base_dir.display(),
                    "pipeline running"
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = LifecycleState::Stopped;
                tracing::error!(error = %e, "pipeline failed to start");
                Err(e)
            }
        }
    }

    fn start_run(&self) -> Result<Run> {
        let config = &self.config;
        config.validate()?;

        let application = self.host.register_application(&config.application_name)?;

        util::ensure_dir(&config.base_dir)?;
        util::ensure_dir(&config.merged_dir)?;
        let lock_file = lock_directory(config)?;

        let metrics = Arc::new(MetricsCollector::new());
        let counters = Arc::new(StreamCounters::new());
        let shards = Arc::new(ShardManager::open(config)?);
        let merger = Arc::new(MergeCoordinator::new(shards.clone(), config, metrics.clone()));

        let processor = Arc::new(CaptureProcessor {
            builder: RecordBuilder::new(counters.clone()),
            router: ShardRouter::new(
                shards.clone(),
                config.offer_timeout(),
                config.drop_log_interval(),
                metrics.clone(),
            ),
            metrics: metrics.clone(),
        });

        let selector = TrafficSelector::ipv4();
        let processor_id = self.source.add_processor(processor, config.processor_priority)?;
        if let Err(e) = self.source.request_packets(selector, &application) {
            self.unsubscribe(processor_id, selector, &application);
            return Err(e);
        }

        let scheduler = Scheduler::new("netcap");
        if let Err(e) = schedule_tasks(&scheduler, config, &shards, &merger, &metrics) {
            scheduler.shutdown();
            scheduler.await_termination(config.shutdown_timeout());
            self.unsubscribe(processor_id, selector, &application);
            return Err(e);
        }

        Ok(Run {
            application,
            processor: processor_id,
            selector,
            counters,
            shards,
            merger,
            scheduler,
            metrics,
            lock_file,
        })
    }

    /// Stop capturing
    ///
    /// Unsubscribes from the source, runs a final flush and merge, and waits a
    /// bounded time for background tasks. Problems are logged, never returned.
    /// Stopping a stopped pipeline does nothing.
    pub fn stop(&self) {
        let mut run = self.run.lock();
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Stopped {
                tracing::debug!("pipeline already stopped");
                return;
            }
            *state = LifecycleState::Stopping;
        }
        tracing::info!("pipeline stopping");

        if let Some(finished) = run.take() {
            self.unsubscribe(finished.processor, finished.selector, &finished.application);

            if let Err(e) = finished.merger.run_cycle() {
                tracing::error!(error = %e, "final merge failed");
            }

            finished.scheduler.shutdown();
            let timeout = self.config.shutdown_timeout();
            if !finished.scheduler.await_termination(timeout) {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "background tasks did not finish before the shutdown timeout"
                );
            }

            if let Err(e) = finished.lock_file.unlock() {
                tracing::warn!(error = %e, "failed to release directory lock");
            }
        }

        *self.state.lock() = LifecycleState::Stopped;
        tracing::info!("pipeline stopped");
    }

    /// Flush every shard queue into its file now
    pub fn flush_all(&self) -> Result<FlushOutcome> {
        let run = self.run.lock();
        let run = running(&run)?;

        let start = std::time::Instant::now();
        let outcome = run.shards.flush_all().map_err(|e| {
            run.metrics.record_flush_failure();
            Error::from(e)
        })?;
        if !outcome.is_empty() {
            run.metrics.record_flush(outcome.records, outcome.bytes, start.elapsed());
        }

        Ok(outcome)
    }

    /// Run a merge cycle now
    pub fn merge_now(&self) -> Result<MergeReport> {
        let run = self.run.lock();
        running(&run)?.merger.run_cycle()
    }

    /// Get operator statistics of the running pipeline
    pub fn stats(&self) -> Result<PipelineStats> {
        let run = self.run.lock();
        let run = running(&run)?;

        Ok(PipelineStats {
            state: self.state(),
            application: run.application.clone(),
            last_sequence: run.counters.current_sequence(),
            elapsed_millis: run.counters.elapsed_millis(),
            shards: run.shards.stats(),
            metrics: run.metrics.snapshot(),
        })
    }

    /// Get the metrics of the current run, or of the last one when stopped
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    fn unsubscribe(&self, processor: ProcessorId, selector: TrafficSelector, application: &ApplicationId) {
        if let Err(e) = self.source.remove_processor(processor) {
            tracing::error!(processor = processor.0, error = %e, "failed to remove packet processor");
        }
        if let Err(e) = self.source.cancel_packets(selector, application) {
            tracing::error!(application = %application, error = %e, "failed to cancel packet request");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("base_dir", &self.config.base_dir)
            .field("merged_path", &self.config.merged_path())
            .finish()
    }
}

fn running(run: &Option<Run>) -> Result<&Run> {
    run.as_ref()
        .ok_or_else(|| Error::lifecycle("Pipeline is not running"))
}

fn lock_directory(config: &PipelineConfig) -> Result<File> {
    let path = config.base_dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)?;

    file.try_lock_exclusive().map_err(|e| {
        Error::storage(format!(
            "Directory {} is in use by another pipeline: {}",
            config.base_dir.display(),
            e
        ))
    })?;

    Ok(file)
}

fn schedule_tasks(
    scheduler: &Scheduler,
    config: &PipelineConfig,
    shards: &Arc<ShardManager>,
    merger: &Arc<MergeCoordinator>,
    metrics: &Arc<MetricsCollector>,
) -> Result<()> {
    let flush_interval = config.flush_interval();
    for shard in shards.shards() {
        let flusher = ShardFlusher::new(shard.clone(), config.batch_size, metrics.clone());
        scheduler.schedule_with_fixed_delay(
            &format!("flush-{}", shard.id()),
            flush_interval,
            flush_interval,
            move || {
                flusher.run();
            },
        )?;
    }

    let merger = merger.clone();
    let merge_interval = config.merge_interval();
    scheduler.schedule_at_fixed_rate("merge", merge_interval, merge_interval, move || {
        merger.run_scheduled()
    })
}
