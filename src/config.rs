use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::device::event::{ThreadKind, NUM_THREADS};

/// Top-level configuration for the perf postprocessor.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for all generated reports. Default: "perf_results".
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Dump mode, verbosity and report/check options.
    #[serde(default)]
    pub perf: PerfConfig,

    /// Layout of the host-visible scratch ring buffers.
    #[serde(default)]
    pub scratch: ScratchConfig,

    /// Prometheus metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// How device perf data reaches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpMode {
    Disable,
    /// One dump per epoch, written after the epoch finishes.
    SingleDump,
    /// Periodic dumps to an intermediate DRAM buffer.
    Intermediate,
    /// Dumps streamed through the scratch ring buffers while running.
    Concurrent,
}

impl Default for DumpMode {
    fn default() -> Self {
        Self::SingleDump
    }
}

/// Trisc pipelines an op can be decoupled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriscDecoupleMode {
    UnpMath,
    MathPack,
}

/// Performance dump and report configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PerfConfig {
    /// Dump mode. Default: single_dump.
    #[serde(default)]
    pub dump_mode: DumpMode,

    /// Verbosity level of recorded events, 0..=2. Default: 0.
    #[serde(default)]
    pub dump_level: u8,

    /// Graph names to record. Empty records every graph.
    #[serde(default)]
    pub target_epochs: Vec<String>,

    /// Record the steady-state throughput window. Default: false.
    #[serde(default)]
    pub measure_steady_state: bool,

    /// Treat every comparison as passed. Default: false.
    #[serde(default)]
    pub skip_perf_check: bool,

    /// Rebias device timestamps against the recorded start cycle. Default: true.
    #[serde(default = "default_true")]
    pub align_devices: bool,

    /// Demote data-quality warnings to debug. Default: false.
    #[serde(default)]
    pub suppress_warnings: bool,

    /// Expected number of thread dumps per run, 0 disables the check. Default: 0.
    #[serde(default)]
    pub check_total_num_traces: u64,

    /// Ops whose trisc pipelines are decoupled, by op name.
    #[serde(default)]
    pub trisc_decouplings: BTreeMap<String, Vec<TriscDecoupleMode>>,

    /// Performance targets checked after each epoch.
    #[serde(default)]
    pub comparisons: Vec<ComparisonConfig>,

    /// Add per-epoch device runtime spans to the host profile. Default: false.
    #[serde(default)]
    pub append_device_runtime_to_host_report: bool,
}

/// Target for a single metric.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PerfCheckValue {
    /// Observed value must be within `rtol` of this.
    #[serde(default)]
    pub expected: Option<f64>,

    /// Observed value must be at least this.
    #[serde(default)]
    pub min_bound: Option<f64>,

    /// Relative tolerance for `expected`. Default: 0.01.
    #[serde(default = "default_rtol")]
    pub rtol: f64,

    /// Target used when the configured target is 0.
    #[serde(default)]
    pub override_target: f64,
}

/// A set of performance targets for one (program, graph) pair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComparisonConfig {
    pub program_name: String,
    pub graph_name: String,

    /// Physical cores to check, as [x, y].
    #[serde(default)]
    pub target_cores: Vec<[u8; 2]>,

    /// Op names to check, matched against the end of core labels.
    #[serde(default)]
    pub target_ops: Vec<String>,

    /// Input indices for per-input metrics. Default: [0].
    #[serde(default = "default_target_inputs")]
    pub target_inputs: Vec<u32>,

    #[serde(default)]
    pub math_utilization: Option<PerfCheckValue>,
    #[serde(default)]
    pub execution_cycles: Option<PerfCheckValue>,
    #[serde(default)]
    pub average_math_utilization: Option<PerfCheckValue>,
    #[serde(default)]
    pub total_runtime: Option<PerfCheckValue>,
    #[serde(default)]
    pub input0_bw: Option<PerfCheckValue>,
    #[serde(default)]
    pub output_bw: Option<PerfCheckValue>,
    #[serde(default)]
    pub num_cycles_per_input: Option<PerfCheckValue>,
    #[serde(default)]
    pub num_inputs_per_second: Option<PerfCheckValue>,
    #[serde(default)]
    pub backend_samples_per_second: Option<PerfCheckValue>,
}

/// Scratch ring-buffer layout.
#[derive(Debug, Clone, Deserialize)]
pub struct ScratchConfig {
    /// Number of ring queues (one per DRAM bank group). Default: 1.
    #[serde(default = "default_num_queues")]
    pub num_queues: usize,

    /// Slots per queue. Default: 4.
    #[serde(default = "default_num_slots")]
    pub num_slots: usize,

    /// Words reserved per thread in a slot; unpack, pack and ncrisc use all of it. Default: 256.
    #[serde(default = "default_thread_dump_words")]
    pub thread_dump_words: usize,

    /// Words used by the math thread. Default: 64.
    #[serde(default = "default_math_dump_words")]
    pub math_dump_words: usize,

    /// Words used by the brisc thread. Default: 128.
    #[serde(default = "default_brisc_dump_words")]
    pub brisc_dump_words: usize,

    /// Delay between polling passes. Default: 1ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address, e.g. ":9090". Empty disables the server. Default: "".
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_output_dir() -> PathBuf {
    PathBuf::from("perf_results")
}

fn default_true() -> bool {
    true
}

fn default_rtol() -> f64 {
    0.01
}

fn default_target_inputs() -> Vec<u32> {
    vec![0]
}

fn default_num_queues() -> usize {
    1
}

fn default_num_slots() -> usize {
    4
}

fn default_thread_dump_words() -> usize {
    256
}

fn default_math_dump_words() -> usize {
    64
}

fn default_brisc_dump_words() -> usize {
    128
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            perf: PerfConfig::default(),
            scratch: ScratchConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            dump_mode: DumpMode::default(),
            dump_level: 0,
            target_epochs: Vec::new(),
            measure_steady_state: false,
            skip_perf_check: false,
            align_devices: default_true(),
            suppress_warnings: false,
            check_total_num_traces: 0,
            trisc_decouplings: BTreeMap::new(),
            comparisons: Vec::new(),
            append_device_runtime_to_host_report: false,
        }
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            num_queues: default_num_queues(),
            num_slots: default_num_slots(),
            thread_dump_words: default_thread_dump_words(),
            math_dump_words: default_math_dump_words(),
            brisc_dump_words: default_brisc_dump_words(),
            poll_interval: default_poll_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            bail!("output_dir is required");
        }

        if self.perf.dump_level > 2 {
            bail!("perf.dump_level must be 0, 1 or 2");
        }

        self.scratch.validate()?;

        for (i, cmp) in self.perf.comparisons.iter().enumerate() {
            cmp.validate()
                .with_context(|| format!("invalid perf.comparisons[{i}]"))?;
        }

        Ok(())
    }
}

impl ScratchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_queues == 0 {
            bail!("scratch.num_queues must be positive");
        }

        if self.num_slots == 0 {
            bail!("scratch.num_slots must be positive");
        }

        if self.thread_dump_words < 4 {
            bail!("scratch.thread_dump_words must be at least 4");
        }

        if self.math_dump_words == 0 || self.math_dump_words > self.thread_dump_words {
            bail!("scratch.math_dump_words must be in 1..=thread_dump_words");
        }

        if self.brisc_dump_words == 0 || self.brisc_dump_words > self.thread_dump_words {
            bail!("scratch.brisc_dump_words must be in 1..=thread_dump_words");
        }

        Ok(())
    }

    /// Words in one slot: five thread regions back to back.
    pub fn slot_words(&self) -> usize {
        self.thread_dump_words * NUM_THREADS
    }

    /// Words of a thread region that carry data.
    pub fn thread_words(&self, kind: ThreadKind) -> usize {
        match kind {
            ThreadKind::Math => self.math_dump_words,
            ThreadKind::Brisc => self.brisc_dump_words,
            _ => self.thread_dump_words,
        }
    }
}

impl ComparisonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.program_name.is_empty() {
            bail!("program_name is required");
        }

        if self.graph_name.is_empty() {
            bail!("graph_name is required");
        }

        for (name, value) in self.metrics() {
            value
                .validate()
                .with_context(|| format!("invalid target for {name}"))?;
        }

        Ok(())
    }

    /// Configured metric targets by metric name.
    pub fn metrics(&self) -> Vec<(&'static str, PerfCheckValue)> {
        [
            ("math_utilization", self.math_utilization),
            ("execution_cycles", self.execution_cycles),
            ("average_math_utilization", self.average_math_utilization),
            ("total_runtime", self.total_runtime),
            ("input0_bw", self.input0_bw),
            ("output_bw", self.output_bw),
            ("num_cycles_per_input", self.num_cycles_per_input),
            ("num_inputs_per_second", self.num_inputs_per_second),
            ("backend_samples_per_second", self.backend_samples_per_second),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect()
    }
}

impl PerfCheckValue {
    pub fn validate(&self) -> Result<()> {
        match (self.expected, self.min_bound) {
            (Some(_), Some(_)) => bail!("expected and min_bound are mutually exclusive"),
            (None, None) => bail!("one of expected or min_bound is required"),
            _ => {}
        }

        if self.rtol < 0.0 {
            bail!("rtol must not be negative");
        }

        Ok(())
    }
}

impl PerfConfig {
    /// True when the op runs with any trisc pipeline decoupled.
    pub fn is_op_decoupled(&self, op_name: &str) -> bool {
        self.trisc_decouplings
            .get(op_name)
            .is_some_and(|modes| !modes.is_empty())
    }

    /// Wait/stall totals are only recorded by the streaming dump modes.
    pub fn records_stalls(&self) -> bool {
        matches!(self.dump_mode, DumpMode::Intermediate | DumpMode::Concurrent)
    }

    /// Log data-quality issues at warn, or debug when suppressed.
    pub fn quiet(&self) -> bool {
        self.suppress_warnings
    }
}
