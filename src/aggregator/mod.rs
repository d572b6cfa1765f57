//! Assembly of streamed thread dumps into per-core and per-epoch records.
//!
//! A device slot carries one chunk per thread. Chunks of the same thread
//! arrive in order and are stitched together until the thread's end
//! sentinel shows up. Complete threads are decoded and grouped by core;
//! complete cores are finalized and grouped by epoch. An epoch is handed off
//! exactly once, when every core its graph declares active has arrived.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ScratchConfig;
use crate::device::codec::{CoreCoord, DumpHeader};
use crate::device::event::{ThreadKind, ThreadRecord, THREAD_DUMP_END_ID, VALID_THREAD_DUMP_START_ID};
use crate::device::parse::{parse_thread_dump, ParseError};
use crate::device::stats::{Counter, PipelineStats};
use crate::record::{finalize_core, CoreRecord, EpochRecord, OutOfMemoryCores};
use crate::state::{PerfState, StateError};

/// Errors raised while assembling dumps. Every variant except the trace
/// count check discards the offending dump and leaves the rest intact.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("slot too short: {len} words")]
    SlotTooShort { len: usize },

    #[error("thread chunk does not start with the valid sentinel: {word:#010x}")]
    MissingStartSentinel { word: u32 },

    #[error("invalid thread id {thread_id} in header {header:#010x}")]
    InvalidThread { thread_id: u8, header: u32 },

    #[error("thread {thread} of core {x}-{y} on chip {chip} epoch {epoch} received twice")]
    DuplicateThread {
        chip: u8,
        x: u8,
        y: u8,
        epoch: u16,
        thread: ThreadKind,
    },

    #[error("core {x}-{y} received twice for epoch {epoch_idx}")]
    DuplicateCore { epoch_idx: usize, x: u8, y: u8 },

    #[error("core {x}-{y} received after epoch {epoch_idx} completed")]
    EpochAlreadyComplete { epoch_idx: usize, x: u8, y: u8 },

    #[error("core {x}-{y} is not active in graph {graph}")]
    InactiveCore { x: u8, y: u8, graph: String },

    #[error("expected {expected} thread dumps, received {received}")]
    TraceCountMismatch { expected: u64, received: u64 },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Identifies the partial core a thread belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreKey {
    pub chip: u8,
    pub core: CoreCoord,
    pub epoch_id: u16,
}

impl From<&DumpHeader> for CoreKey {
    fn from(header: &DumpHeader) -> Self {
        Self {
            chip: header.chip_id,
            core: header.core(),
            epoch_id: header.epoch_id,
        }
    }
}

/// Totals reported when the aggregator shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorSummary {
    pub threads_received: u64,
    pub full_threads: u64,
    pub full_cores: u64,
    pub full_epochs: u64,
    pub violations: u64,
    /// Thread chunks received per (chip, core).
    pub dumps_per_core: BTreeMap<(u8, CoreCoord), u64>,
    pub incomplete_threads: usize,
    pub incomplete_cores: usize,
    pub incomplete_epochs: usize,
}

/// Indices of epochs already handed off.
///
/// Indices below `low` are all complete; only epochs that finished ahead of
/// an older one are kept in the set, so it stays as small as the number of
/// epochs in flight.
#[derive(Debug, Default)]
struct CompletedEpochs {
    low: usize,
    ahead: HashSet<usize>,
}

impl CompletedEpochs {
    fn contains(&self, idx: usize) -> bool {
        idx < self.low || self.ahead.contains(&idx)
    }

    fn insert(&mut self, idx: usize) {
        if idx < self.low {
            return;
        }
        self.ahead.insert(idx);
        while self.ahead.remove(&self.low) {
            self.low += 1;
        }
    }
}

/// Single-consumer assembler for device dumps.
pub struct Aggregator {
    state: Arc<PerfState>,
    stats: Arc<PipelineStats>,
    scratch: ScratchConfig,
    quiet: bool,
    check_total_num_traces: u64,

    /// Thread words accumulated so far, keyed by dump header.
    partial_threads: HashMap<DumpHeader, Vec<u32>>,
    partial_cores: HashMap<CoreKey, CoreRecord>,
    /// Epochs still waiting for cores, keyed by executed-instruction index.
    epochs: HashMap<usize, EpochRecord>,
    completed_epochs: CompletedEpochs,
    out_of_memory_cores: OutOfMemoryCores,

    summary: AggregatorSummary,
}

impl Aggregator {
    pub fn new(state: Arc<PerfState>, stats: Arc<PipelineStats>, scratch: ScratchConfig) -> Self {
        let perf = state.get_config();
        Self {
            state,
            stats,
            scratch,
            quiet: perf.quiet(),
            check_total_num_traces: perf.check_total_num_traces,
            partial_threads: HashMap::new(),
            partial_cores: HashMap::new(),
            epochs: HashMap::new(),
            completed_epochs: CompletedEpochs::default(),
            out_of_memory_cores: OutOfMemoryCores::default(),
            summary: AggregatorSummary::default(),
        }
    }

    /// Process one drained slot: one chunk per thread at a fixed stride.
    ///
    /// Per-thread protocol violations are logged, counted and skipped; only a
    /// slot that cannot hold five thread regions is an error.
    pub fn process_device_dump(&mut self, slot: &[u32]) -> Result<Vec<EpochRecord>, AggregateError> {
        if slot.len() < self.scratch.slot_words() {
            return Err(AggregateError::SlotTooShort { len: slot.len() });
        }

        let mut finished = Vec::new();
        for (i, &kind) in ThreadKind::all().iter().enumerate() {
            let start = i * self.scratch.thread_dump_words;
            let chunk = &slot[start..start + self.scratch.thread_words(kind)];

            match self.process_thread_chunk(chunk) {
                Ok(Some(epoch)) => finished.push(epoch),
                Ok(None) => {}
                Err(e) => self.record_violation(&e),
            }
        }

        Ok(finished)
    }

    /// Append one thread chunk. Returns the epoch it completed, if any.
    pub fn process_thread_chunk(
        &mut self,
        chunk: &[u32],
    ) -> Result<Option<EpochRecord>, AggregateError> {
        if chunk.len() < 2 {
            return Err(AggregateError::SlotTooShort { len: chunk.len() });
        }
        if chunk[0] != VALID_THREAD_DUMP_START_ID {
            return Err(AggregateError::MissingStartSentinel { word: chunk[0] });
        }

        let header = DumpHeader::decode(chunk[1]);
        let kind = header.thread_kind().ok_or(AggregateError::InvalidThread {
            thread_id: header.thread_id,
            header: chunk[1],
        })?;

        self.summary.threads_received += 1;
        self.stats.record(Counter::ThreadsReceived);
        *self
            .summary
            .dumps_per_core
            .entry((header.chip_id, header.core()))
            .or_default() += 1;

        let words = self.partial_threads.entry(header).or_default();
        if words.is_empty() {
            words.extend_from_slice(chunk);
        } else {
            // Continuation chunks repeat the sentinel and header.
            words.extend_from_slice(&chunk[2..]);
        }

        // Math always fits in a single chunk.
        let complete = kind == ThreadKind::Math || chunk.last() == Some(&THREAD_DUMP_END_ID);
        if !complete {
            return Ok(None);
        }

        let words = self.partial_threads.remove(&header).unwrap_or_default();
        let (header, record) = parse_thread_dump(&words, true)?;
        self.summary.full_threads += 1;
        self.stats.record(Counter::FullThreads);

        self.insert_thread(header, record)
    }

    /// Place a decoded thread in its core, finalizing the core and the epoch
    /// when they complete.
    pub fn insert_thread(
        &mut self,
        header: DumpHeader,
        record: ThreadRecord,
    ) -> Result<Option<EpochRecord>, AggregateError> {
        let key = CoreKey::from(&header);
        let core = self
            .partial_cores
            .entry(key)
            .or_insert_with(|| CoreRecord::new(key.chip, key.core, key.epoch_id));

        if let Err(e) = core.insert_thread(record) {
            self.partial_cores.remove(&key);
            return Err(e);
        }
        if !core.is_complete() {
            return Ok(None);
        }

        let Some(mut core) = self.partial_cores.remove(&key) else {
            return Ok(None);
        };
        self.summary.full_cores += 1;
        self.stats.record(Counter::FullCores);

        let (epoch_idx, meta) = self.state.get_global_epoch_idx_and_instr_for_core(&header)?;
        if self.completed_epochs.contains(epoch_idx) {
            return Err(AggregateError::EpochAlreadyComplete {
                epoch_idx,
                x: key.core.x,
                y: key.core.y,
            });
        }

        core.descriptor = self
            .state
            .get_core_desc(&meta.graph_name, key.core)
            .ok_or_else(|| AggregateError::InactiveCore {
                x: key.core.x,
                y: key.core.y,
                graph: meta.graph_name.clone(),
            })?;

        let dropped = finalize_core(&mut core, self.quiet);
        if dropped > 0 {
            self.stats.record_n(Counter::EventsDropped, dropped as u64);
        }
        if self.out_of_memory_cores.carry(&mut core) {
            warn!(chip = key.chip, core = %key.core.label(), "core ran out of trace memory");
        }

        if !self.epochs.contains_key(&epoch_idx) {
            let graph = self.state.get_graph(&meta.graph_name)?;
            let num_epochs = self.state.get_num_instructions_executed(meta.program_id);
            self.epochs
                .insert(epoch_idx, EpochRecord::new(epoch_idx, meta, graph, num_epochs));
        }
        let Some(epoch) = self.epochs.get_mut(&epoch_idx) else {
            return Ok(None);
        };
        epoch.insert_core(core)?;

        if !epoch.is_complete() {
            return Ok(None);
        }

        let epoch = self.epochs.remove(&epoch_idx);
        if let Some(epoch) = &epoch {
            self.completed_epochs.insert(epoch_idx);
            self.summary.full_epochs += 1;
            self.stats.record(Counter::FullEpochs);
            info!(
                epoch = %epoch.label(),
                global_epoch_id = epoch.meta.global_epoch_id,
                cores = epoch.cores.len(),
                "finished postprocessor for epoch",
            );
        }
        Ok(epoch)
    }

    fn record_violation(&mut self, e: &AggregateError) {
        error!(error = %e, "discarding thread dump");
        self.summary.violations += 1;
        self.stats.record(Counter::ProtocolViolations);
    }

    /// Consume slots until the channel closes, forwarding completed epochs.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Vec<u32>>,
        tx: mpsc::UnboundedSender<EpochRecord>,
    ) -> Result<AggregatorSummary, AggregateError> {
        while let Some(slot) = rx.recv().await {
            match self.process_device_dump(&slot) {
                Ok(epochs) => {
                    for epoch in epochs {
                        if tx.send(epoch).is_err() {
                            warn!("report queue closed, dropping epoch");
                        }
                    }
                }
                Err(e) => self.record_violation(&e),
            }
        }

        self.finish()
    }

    /// Log the run summary and check the expected trace count.
    pub fn finish(&self) -> Result<AggregatorSummary, AggregateError> {
        let mut summary = self.summary.clone();
        summary.incomplete_threads = self.partial_threads.len();
        summary.incomplete_cores = self.partial_cores.len();
        summary.incomplete_epochs = self.epochs.len();

        info!(
            threads_received = summary.threads_received,
            full_threads = summary.full_threads,
            full_cores = summary.full_cores,
            full_epochs = summary.full_epochs,
            violations = summary.violations,
            "aggregator finished",
        );
        for ((chip, core), count) in &summary.dumps_per_core {
            debug!(chip, core = %core.label(), dumps = count, "thread dumps received");
        }
        if summary.incomplete_threads + summary.incomplete_cores + summary.incomplete_epochs > 0 {
            crate::perf_warn!(
                self.quiet,
                threads = summary.incomplete_threads,
                cores = summary.incomplete_cores,
                epochs = summary.incomplete_epochs,
                "records left incomplete at shutdown",
            );
        }

        if self.check_total_num_traces > 0
            && self.check_total_num_traces != summary.threads_received
        {
            return Err(AggregateError::TraceCountMismatch {
                expected: self.check_total_num_traces,
                received: summary.threads_received,
            });
        }

        Ok(summary)
    }
}
