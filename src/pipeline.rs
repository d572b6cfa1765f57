//! Drivers that connect the stages.
//!
//! The concurrent path runs three tasks joined by unbounded channels:
//! the scratch poller feeds drained slots to the aggregator, which forwards
//! completed epochs to the report generator. Cancelling the poller closes
//! each channel in turn, so every stage drains what it holds before exiting.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregateError, Aggregator, AggregatorSummary};
use crate::config::Config;
use crate::device::event::HostEventType;
use crate::device::stats::PipelineStats;
use crate::export::PipelineMetrics;
use crate::host::{HostProfiler, HostSummary};
use crate::offline;
use crate::poller::{DeviceTransport, PollerSummary, ScratchBufferPoller};
use crate::report::{ReportGenerator, ReportSummary};
use crate::state::PerfState;

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Everything the stages reported at shutdown.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub poller: PollerSummary,
    /// `None` when the aggregator ended with an error.
    pub aggregator: Option<AggregatorSummary>,
    pub aggregator_error: Option<String>,
    pub report: ReportSummary,
    pub host: HostSummary,
}

impl PipelineSummary {
    /// True when every check passed and the trace count matched.
    pub fn passed(&self) -> bool {
        self.report.checks.passed && self.aggregator_error.is_none()
    }
}

struct Tasks {
    poller: JoinHandle<PollerSummary>,
    aggregator: JoinHandle<Result<AggregatorSummary, AggregateError>>,
    reporter: JoinHandle<Result<ReportSummary>>,
}

/// Concurrent poller → aggregator → report generator pipeline.
pub struct Pipeline<T: DeviceTransport + 'static> {
    cfg: Config,
    state: Arc<PerfState>,
    stats: Arc<PipelineStats>,
    transport: Arc<T>,
    profiler: Arc<HostProfiler>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    tasks: Option<Tasks>,
}

impl<T: DeviceTransport + 'static> Pipeline<T> {
    pub fn new(
        cfg: Config,
        state: Arc<PerfState>,
        transport: Arc<T>,
        profiler: Arc<HostProfiler>,
    ) -> Result<Self> {
        let metrics =
            Arc::new(PipelineMetrics::new(&cfg.health.addr).context("creating pipeline metrics")?);

        Ok(Self {
            cfg,
            state,
            stats: Arc::new(PipelineStats::new()),
            transport,
            profiler,
            metrics,
            cancel: CancellationToken::new(),
            tasks: None,
        })
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Start the metrics server and the three stage tasks.
    pub async fn start(&mut self) -> Result<()> {
        if !self.cfg.health.addr.is_empty() {
            self.metrics
                .start()
                .await
                .context("starting metrics server")?;
        }

        record_device_alignment(&self.state, &self.profiler);

        let mut poller = ScratchBufferPoller::new(
            Arc::clone(&self.transport),
            self.cfg.scratch.clone(),
            Arc::clone(&self.stats),
        );
        poller.initialize();

        let (slot_tx, slot_rx) = mpsc::unbounded_channel();
        let (epoch_tx, epoch_rx) = mpsc::unbounded_channel();

        let aggregator = Aggregator::new(
            Arc::clone(&self.state),
            Arc::clone(&self.stats),
            self.cfg.scratch.clone(),
        );
        let reporter = ReportGenerator::new(Arc::clone(&self.state), Arc::clone(&self.stats))
            .with_metrics(Arc::clone(&self.metrics));

        self.tasks = Some(Tasks {
            poller: tokio::spawn(poller.run(slot_tx, self.cancel.child_token())),
            aggregator: tokio::spawn(aggregator.run(slot_rx, epoch_tx)),
            reporter: tokio::spawn(reporter.run(epoch_rx)),
        });
        self.spawn_stats_reporter();

        info!(
            queues = self.cfg.scratch.num_queues,
            slots = self.cfg.scratch.num_slots,
            "pipeline started",
        );
        Ok(())
    }

    /// Stop polling, drain every stage and write the host report.
    pub async fn stop(&mut self) -> Result<PipelineSummary> {
        let tasks = self.tasks.take().context("pipeline was not started")?;
        let drain_start = self.profiler.now_ns();

        self.cancel.cancel();

        let poller = tasks.poller.await.context("joining poller task")?;
        self.metrics.observe_poller(&poller);

        let (aggregator, aggregator_error) =
            match tasks.aggregator.await.context("joining aggregator task")? {
                Ok(summary) => (Some(summary), None),
                Err(e) => {
                    error!(error = %e, "aggregator finished with an error");
                    (None, Some(e.to_string()))
                }
            };
        let report = tasks.reporter.await.context("joining report task")??;

        self.profiler.record_span(
            HostEventType::PerfPostprocessor,
            drain_start,
            self.profiler.now_ns(),
        );
        let host = write_host_report(&self.state, &self.profiler)?;

        self.metrics.observe_stats(&self.stats);
        self.metrics.stop().await?;

        let summary = PipelineSummary {
            poller,
            aggregator,
            aggregator_error,
            report,
            host,
        };
        log_summary(&summary);
        Ok(summary)
    }

    /// Periodically log counter totals and refresh the metric gauges.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        metrics.observe_stats(&stats);
                        let snapshot = stats.snapshot();
                        if snapshot.is_empty() {
                            continue;
                        }
                        for (counter, count) in &snapshot {
                            debug!(counter = counter.as_str(), count, "pipeline stats");
                        }
                    }
                }
            }
        });
    }
}

/// Seed the host profile with the device clock windows known up front.
fn record_device_alignment(state: &PerfState, profiler: &HostProfiler) {
    let aligner = state.get_device_alignment();
    for (&device, alignment) in aligner.devices() {
        let Ok(device) = u8::try_from(device) else {
            warn!(device, "device id does not fit a host event id");
            continue;
        };
        profiler.record_device_start(device, alignment.device_start_cycle, alignment.host_start_ns);
        if alignment.is_complete() {
            profiler.record_device_end(device, alignment.device_end_cycle, alignment.host_end_ns);
        }
    }
}

fn write_host_report(state: &PerfState, profiler: &HostProfiler) -> Result<HostSummary> {
    let perf = state.get_config();
    if perf.append_device_runtime_to_host_report {
        if !state.is_postprocessor_executed() {
            error!("epoch runtimes can only be added after the postprocessor has finished");
        } else {
            match profiler.append_epoch_runtimes(&state.get_all_epochs_info(), &state.get_device_alignment()) {
                Ok(added) => debug!(added, "added epoch runtimes to host profile"),
                Err(e) => warn!(error = %e, "could not add epoch runtimes to host profile"),
            }
        }
    }
    profiler
        .postprocess(&state.get_output_root(), Some(state.get_total_input_count()))
        .context("writing host report")
}

fn log_summary(summary: &PipelineSummary) {
    info!(
        traces = summary.poller.total(),
        corrupt_slots = summary.poller.corrupt_slots,
        epochs_reported = summary.report.epochs_reported,
        epochs_failed = summary.report.epochs_failed,
        samples_per_second = summary.report.samples_per_second,
        host_reports = summary.host.reports.len(),
        passed = summary.passed(),
        "pipeline finished",
    );
    if let Some(e) = &summary.aggregator_error {
        error!(error = %e, "pipeline summary");
    }
}

/// Report every textual dump of a run, one dump per executed instruction.
pub fn run_offline(
    state: Arc<PerfState>,
    profiler: &HostProfiler,
    dumps: &[impl AsRef<Path>],
) -> Result<PipelineSummary> {
    let stats = Arc::new(PipelineStats::new());
    let started = profiler.now_ns();

    let epochs = offline::parse_dump_files(&state, Arc::clone(&stats), dumps)?;
    let mut reporter = ReportGenerator::new(Arc::clone(&state), Arc::clone(&stats));
    for epoch in &epochs {
        reporter.report_or_log(epoch);
    }
    let report = reporter.finish()?;

    profiler.record_span(HostEventType::PerfPostprocessor, started, profiler.now_ns());
    let host = write_host_report(&state, profiler)?;

    let summary = PipelineSummary {
        report,
        host,
        ..Default::default()
    };
    log_summary(&summary);
    Ok(summary)
}
