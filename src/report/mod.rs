//! Report generation for completed epochs.
//!
//! Every completed [`EpochRecord`] turns into a set of JSON, CSV and text
//! artifacts under the epoch's output directory. Values that could not be
//! measured render as `"N/A"`. All maps are key-ordered, so reporting the
//! same record twice produces byte-identical files.

pub mod check;
pub mod epoch_info;
pub mod op_table;
pub mod postprocess;
pub mod runtime_table;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::clock::{ClockAligner, ClockError};
use crate::config::PerfConfig;
use crate::device::stats::{Counter, PipelineStats};
use crate::export::PipelineMetrics;
use crate::record::EpochRecord;
use crate::state::{EpochThroughput, InstructionMeta, PerfState};

use self::check::CheckReport;

/// Placeholder for values that were not recorded.
pub const NA: &str = "N/A";

pub const POSTPROCESS_JSON: &str = "perf_postprocess.json";
pub const CORES_TO_OPS_JSON: &str = "cores_to_ops.json";
pub const RUNTIME_TABLE_JSON: &str = "runtime_table.json";
pub const RUNTIME_TABLE_CSV: &str = "runtime_table.csv";
pub const RUNTIME_TABLE_TXT: &str = "runtime_table.txt";
pub const OP_TABLE_JSON: &str = "op_perf_table.json";

pub(crate) fn na() -> Value {
    Value::from(NA)
}

/// `value` as JSON, or `"N/A"` when absent.
pub(crate) fn or_na<T: Into<Value>>(value: Option<T>) -> Value {
    value.map(Into::into).unwrap_or_else(na)
}

/// Ratio as JSON, or `"N/A"` when the denominator is zero.
pub(crate) fn ratio(num: f64, den: f64) -> Value {
    if den == 0.0 {
        na()
    } else {
        json!(num / den)
    }
}

/// Bytes per tile, including the header and exponent section.
pub fn tile_size(data_format: &str) -> Option<u64> {
    let size = match data_format {
        "Float32" | "Int32" | "RawUInt32" => 32 * 32 * 4 + 32,
        "Float16" | "Float16_b" | "UInt16" | "RawUInt16" => 32 * 32 * 2 + 32,
        "Bfp8" | "Bfp8_b" => 32 * 32 + 32 + 4 * 16,
        "Bfp4" | "Bfp4_b" => 32 * 16 + 32 + 4 * 16,
        "Bfp2" | "Bfp2_b" => 32 * 8 + 32 + 4 * 16,
        "Lf8" | "Int8" | "UInt8" | "RawUInt8" => 32 * 32 + 32,
        _ => return None,
    };
    Some(size)
}

/// Maps raw device cycles of one epoch onto the aligned timeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleRebias {
    start: Option<u64>,
}

impl CycleRebias {
    /// Rebias against `device`'s start cycle, or pass through when `align`
    /// is off.
    pub fn new(aligner: &ClockAligner, device: u32, align: bool) -> Result<Self, ClockError> {
        if !align {
            return Ok(Self::default());
        }
        let alignment = aligner
            .get(device)
            .ok_or(ClockError::MissingAlignment { device })?;
        Ok(Self {
            start: Some(alignment.device_start_cycle),
        })
    }

    #[inline]
    pub fn cycle(&self, raw: u64) -> u64 {
        match self.start {
            Some(start) => crate::clock::rebias_cycle(start, raw),
            None => raw,
        }
    }
}

/// All artifacts of one epoch, ready to be written.
#[derive(Debug, Clone)]
pub struct EpochReports {
    pub postprocess: Value,
    pub cores_to_ops: Value,
    pub runtime_table: Value,
    pub runtime_csv: String,
    pub runtime_txt: String,
    pub op_table: Value,
    pub throughput: EpochThroughput,
}

/// Build every per-epoch report. Pure: writes nothing.
pub fn build_epoch_reports(epoch: &EpochRecord, perf: &PerfConfig, rebias: CycleRebias) -> EpochReports {
    let postprocess = postprocess::create_postprocess_report(epoch, perf, rebias);
    let runtime_table = runtime_table::create_runtime_report(&postprocess.report);
    let rows = runtime_table::runtime_table_rows(&runtime_table);
    let op_table = op_table::create_op_report(&runtime_table, perf);

    EpochReports {
        cores_to_ops: cores_to_ops(epoch),
        runtime_csv: runtime_table::to_csv(&rows),
        runtime_txt: runtime_table::to_text(&rows),
        postprocess: postprocess.report,
        runtime_table,
        op_table,
        throughput: postprocess.throughput,
    }
}

impl EpochReports {
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating report directory {}", dir.display()))?;

        write_json(&dir.join(POSTPROCESS_JSON), &self.postprocess)?;
        write_json(&dir.join(CORES_TO_OPS_JSON), &self.cores_to_ops)?;
        write_json(&dir.join(RUNTIME_TABLE_JSON), &self.runtime_table)?;
        write_text(&dir.join(RUNTIME_TABLE_CSV), &self.runtime_csv)?;
        write_text(&dir.join(RUNTIME_TABLE_TXT), &self.runtime_txt)?;
        write_json(&dir.join(OP_TABLE_JSON), &self.op_table)?;
        Ok(())
    }
}

/// "x-y" of every active core to its op placement.
fn cores_to_ops(epoch: &EpochRecord) -> Value {
    let mut map = Map::new();
    for assignment in &epoch.graph.cores {
        let core = crate::device::codec::CoreCoord::new(assignment.x, assignment.y);
        let Some(desc) = epoch.graph.core_desc(core) else {
            continue;
        };
        map.insert(
            core.label(),
            json!({
                "op-name": desc.op_name,
                "op-type": desc.op_type,
                "logical-core": desc.logical.label(),
            }),
        );
    }
    Value::Object(map)
}

pub(crate) fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    bytes.push(b'\n');
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

pub(crate) fn write_text(path: &Path, value: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, value).with_context(|| format!("writing {}", path.display()))
}

/// What the report stage did over the whole run.
#[derive(Debug, Clone, Default)]
pub struct ReportSummary {
    pub epochs_reported: u64,
    pub epochs_failed: u64,
    pub samples_per_second: f64,
    pub checks: CheckReport,
}

/// Single consumer of completed epochs.
pub struct ReportGenerator {
    state: Arc<PerfState>,
    stats: Arc<PipelineStats>,
    metrics: Option<Arc<PipelineMetrics>>,
    summary: ReportSummary,
}

impl ReportGenerator {
    pub fn new(state: Arc<PerfState>, stats: Arc<PipelineStats>) -> Self {
        Self {
            state,
            stats,
            metrics: None,
            summary: ReportSummary::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Write the reports of one epoch and run its device checks.
    pub fn report_epoch(&mut self, epoch: &EpochRecord) -> Result<InstructionMeta> {
        let started = Instant::now();
        let perf = self.state.get_config();
        let aligner = self.state.get_device_alignment();
        let rebias = CycleRebias::new(&aligner, u32::from(epoch.meta.device_id), perf.align_devices)
            .with_context(|| format!("aligning epoch {}", epoch.label()))?;

        let reports = build_epoch_reports(epoch, &perf, rebias);
        reports.write(&epoch.meta.output_dir)?;

        let mut meta = epoch.meta.clone();
        meta.throughput = reports.throughput.clone();
        self.state.update_all_epochs_info(meta.clone());

        let failures_before = self.summary.checks.failures.len();
        check::check_device(&perf, &reports.runtime_table, &meta, &mut self.summary.checks);
        let new_failures = self.summary.checks.failures.len() - failures_before;
        self.state.update_perf_check(new_failures == 0);
        if new_failures > 0 {
            self.stats.record_n(Counter::ChecksFailed, new_failures as u64);
        }

        self.summary.epochs_reported += 1;
        self.stats.record(Counter::EpochsReported);
        if let Some(metrics) = &self.metrics {
            metrics
                .epoch_report_duration
                .observe(started.elapsed().as_secs_f64());
            if new_failures > 0 {
                metrics.perf_check_passed.set(0.0);
            }
        }
        debug!(
            epoch = %epoch.label(),
            dir = %meta.output_dir.display(),
            "wrote epoch reports",
        );
        Ok(meta)
    }

    /// Report epochs until the channel closes, then write the run summary.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EpochRecord>) -> Result<ReportSummary> {
        while let Some(epoch) = rx.recv().await {
            self.report_or_log(&epoch);
        }
        self.finish()
    }

    /// Report an epoch, counting and logging a failure instead of returning it.
    pub fn report_or_log(&mut self, epoch: &EpochRecord) {
        if let Err(e) = self.report_epoch(epoch) {
            self.summary.epochs_failed += 1;
            error!(epoch = %epoch.label(), error = %format!("{e:#}"), "failed to report epoch");
        }
    }

    /// Write the run-level epoch summary and run host checks.
    pub fn finish(&mut self) -> Result<ReportSummary> {
        let perf = self.state.get_config();
        let mut epochs = self.state.get_all_epochs_info();
        epochs.sort_by_key(|meta| meta.global_epoch_id);

        if !epochs.is_empty() {
            let summary = epoch_info::AllEpochsInfo::new(
                &epochs,
                |program| self.state.get_num_instructions_executed(program),
                self.state.get_total_input_count(),
            );
            let root = self.state.get_output_root();
            summary.write(&root, perf.measure_steady_state)?;
            self.summary.samples_per_second = summary.samples_per_second();
        }

        let failures_before = self.summary.checks.failures.len();
        check::check_host(&perf, self.summary.samples_per_second, &mut self.summary.checks);
        let new_failures = self.summary.checks.failures.len() - failures_before;
        self.state.update_perf_check(new_failures == 0);
        if new_failures > 0 {
            self.stats.record_n(Counter::ChecksFailed, new_failures as u64);
        }
        self.state.set_postprocessor_executed();
        if let Some(metrics) = &self.metrics {
            metrics.samples_per_second.set(self.summary.samples_per_second);
            metrics
                .perf_check_passed
                .set(if self.summary.checks.passed { 1.0 } else { 0.0 });
        }

        let checks = &self.summary.checks;
        info!(
            epochs_reported = self.summary.epochs_reported,
            epochs_failed = self.summary.epochs_failed,
            checks_run = checks.checks_run,
            "report generator finished",
        );
        if checks.passed {
            info!(checks_run = checks.checks_run, "performance check passed");
        } else {
            error!(failures = checks.failures.len(), "performance check failed");
            for failure in &checks.failures {
                error!(
                    program = %failure.program_name,
                    graph = %failure.graph_name,
                    target = %failure.target,
                    metric = failure.metric,
                    "{}",
                    failure.message,
                );
            }
        }

        Ok(self.summary.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::DeviceAlignment;
    use crate::record::finalize::tests::sample_core;
    use crate::record::tests::{graph, meta};
    use crate::record::{finalize_core, EpochRecord};

    /// One-core epoch built from the finalized sample core.
    pub(crate) fn sample_epoch() -> EpochRecord {
        let mut core = sample_core();
        finalize_core(&mut core, true);
        core.descriptor = graph(&[(1, 1)])
            .core_desc(core.core)
            .expect("active core");
        let mut epoch = EpochRecord::new(0, meta(), graph(&[(1, 1)]), 1);
        epoch.insert_core(core).expect("insert");
        epoch
    }

    #[test]
    fn test_tile_sizes() {
        assert_eq!(tile_size("Float32"), Some(4128));
        assert_eq!(tile_size("Float16_b"), Some(2080));
        assert_eq!(tile_size("Bfp8_b"), Some(1120));
        assert_eq!(tile_size("Bfp4"), Some(608));
        assert_eq!(tile_size("Bfp2_b"), Some(352));
        assert_eq!(tile_size("Int8"), Some(1056));
        assert_eq!(tile_size("Invalid"), None);
    }

    #[test]
    fn test_rebias_passthrough_and_missing_device() {
        let aligner = ClockAligner::default();
        let raw = CycleRebias::new(&aligner, 0, false).expect("raw");
        assert_eq!(raw.cycle(1234), 1234);
        assert_eq!(
            CycleRebias::new(&aligner, 0, true).unwrap_err(),
            ClockError::MissingAlignment { device: 0 }
        );

        let mut aligner = ClockAligner::default();
        aligner.insert(
            2,
            DeviceAlignment {
                device_start_cycle: 500,
                device_end_cycle: 1500,
                host_start_ns: 0,
                host_end_ns: 1_000_000,
            },
        );
        let rebias = CycleRebias::new(&aligner, 2, true).expect("aligned");
        assert_eq!(rebias.cycle(700), 200);
        assert_eq!(rebias.cycle(499), u64::MAX - 1);
    }

    #[test]
    fn test_reports_are_idempotent() {
        let epoch = sample_epoch();
        let perf = PerfConfig::default();
        let a = build_epoch_reports(&epoch, &perf, CycleRebias::default());
        let b = build_epoch_reports(&epoch, &perf, CycleRebias::default());

        let dir_a = tempfile::tempdir().expect("tempdir");
        let dir_b = tempfile::tempdir().expect("tempdir");
        a.write(dir_a.path()).expect("write");
        b.write(dir_b.path()).expect("write");
        for name in [
            POSTPROCESS_JSON,
            CORES_TO_OPS_JSON,
            RUNTIME_TABLE_JSON,
            RUNTIME_TABLE_CSV,
            RUNTIME_TABLE_TXT,
            OP_TABLE_JSON,
        ] {
            let left = std::fs::read(dir_a.path().join(name)).expect("read");
            let right = std::fs::read(dir_b.path().join(name)).expect("read");
            assert_eq!(left, right, "{name} differs");
        }
    }

    #[test]
    fn test_cores_to_ops() {
        let epoch = sample_epoch();
        let value = cores_to_ops(&epoch);
        assert_eq!(value["1-1"]["op-name"], "op0");
        assert_eq!(value["1-1"]["op-type"], "matmul");
        assert_eq!(value["1-1"]["logical-core"], "1-1");
    }
}
