//! Line-oriented parser for textual device dumps.
//!
//! A dump holds one epoch. Lines are recognized by content only:
//!
//! ```text
//! 1-1:
//!     T0:
//!         - 0xbeeff00d
//!         - 0x00001100
//!         ...
//! ```
//!
//! Cores without an op in the epoch's graph are skipped. A thread ends at
//! its end sentinel, at an out-of-memory marker, at the next header line or
//! at the end of input. A core is finalized when its BRISC thread ends.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::aggregator::AggregateError;
use crate::device::codec::CoreCoord;
use crate::device::event::{
    ThreadKind, MATH_HEADER_WORD, PERF_OUT_OF_MEM, PERF_VAL_FIRST, PERF_VAL_LAST,
};
use crate::device::parse::{parse_thread, ParseError};
use crate::device::stats::{Counter, PipelineStats};
use crate::record::{finalize_core, CoreRecord, EpochRecord, OutOfMemoryCores};
use crate::state::{PerfState, StateError};

/// Errors raised while reading a textual dump.
#[derive(Error, Debug)]
pub enum TextParseError {
    #[error("line {line}: expected an event word, got {content:?}")]
    InvalidEventLine { line: usize, content: String },

    #[error("line {line}: unknown thread header {name:?}")]
    UnknownThread { line: usize, name: String },

    #[error("reading dump: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// What the parser is looking for next.
#[derive(Debug)]
enum ParserState {
    /// Ignore everything up to the next core header.
    SeekingCore,
    /// Ignore everything up to the next thread header.
    SeekingThread,
    /// Collect event words of one thread.
    Accumulating {
        kind: ThreadKind,
        words: Vec<u32>,
        /// Event lines seen so far, sentinel and header included.
        seen: usize,
    },
}

/// A recognized line.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Core(CoreCoord),
    Thread(ThreadKind),
    Event(u32),
    /// A `label:` line that names neither a core nor a thread.
    UnknownHeader(String),
    Other,
}

fn classify(line: &str) -> Line {
    let line = line.trim();
    if let Some(label) = line.strip_suffix(':') {
        if let Some(kind) = ThreadKind::from_name(label) {
            return Line::Thread(kind);
        }
        if let Some((x, y)) = label.split_once('-') {
            if let (Ok(x), Ok(y)) = (x.parse(), y.parse()) {
                return Line::Core(CoreCoord::new(x, y));
            }
        }
        return Line::UnknownHeader(label.to_string());
    }
    if let Some(word) = line.strip_prefix("- ") {
        let word = word.trim();
        let digits = word.strip_prefix("0x").unwrap_or(word);
        if let Ok(value) = u32::from_str_radix(digits, 16) {
            return Line::Event(value);
        }
    }
    Line::Other
}

/// Counts kept while parsing one dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineSummary {
    pub threads: u64,
    pub cores: u64,
    pub skipped_cores: u64,
    pub violations: u64,
}

/// Single-pass parser for one epoch's textual dump.
pub struct OfflineParser {
    state: ParserState,
    epoch: EpochRecord,
    core: Option<CoreRecord>,
    quiet: bool,
    stats: Arc<PipelineStats>,
    summary: OfflineSummary,
}

impl OfflineParser {
    pub fn new(epoch: EpochRecord, stats: Arc<PipelineStats>, quiet: bool) -> Self {
        Self {
            state: ParserState::SeekingCore,
            epoch,
            core: None,
            quiet,
            stats,
            summary: OfflineSummary::default(),
        }
    }

    pub fn summary(&self) -> &OfflineSummary {
        &self.summary
    }

    /// Feed one line. `line_no` is 1-based and only used in errors.
    pub fn feed_line(&mut self, line_no: usize, line: &str) -> Result<(), TextParseError> {
        let parsed = classify(line);

        match parsed {
            Line::Core(core) => {
                self.interrupt_thread()?;
                self.start_core(core);
                return Ok(());
            }
            Line::Thread(kind) => {
                if matches!(self.state, ParserState::SeekingCore) {
                    return Ok(());
                }
                self.interrupt_thread()?;
                self.state = ParserState::Accumulating {
                    kind,
                    words: Vec::new(),
                    seen: 0,
                };
                return Ok(());
            }
            Line::UnknownHeader(name) => {
                if matches!(self.state, ParserState::SeekingCore) {
                    return Ok(());
                }
                // Words up to the next header belong to the unknown thread.
                self.interrupt_thread()?;
                let e = TextParseError::UnknownThread { line: line_no, name };
                error!(epoch = %self.epoch.label(), error = %e, "skipping thread");
                self.count_violation();
                return Ok(());
            }
            _ => {}
        }

        let ParserState::Accumulating { kind, words, seen } = &mut self.state else {
            return Ok(());
        };
        let Line::Event(value) = parsed else {
            return Err(TextParseError::InvalidEventLine {
                line: line_no,
                content: line.to_string(),
            });
        };

        let kind = *kind;
        *seen += 1;
        if *seen == 1 {
            // An inactive thread does not start with the sentinel.
            if value != PERF_VAL_FIRST {
                let words = std::mem::take(words);
                return self.end_thread(kind, words, value == PERF_OUT_OF_MEM);
            }
            return Ok(());
        }

        if value == PERF_OUT_OF_MEM {
            let words = std::mem::take(words);
            return self.end_thread(kind, words, true);
        }
        // Header word, plus the two counter header words for math.
        let skip = match kind {
            ThreadKind::Math => *seen <= 4,
            ThreadKind::Ncrisc => *seen <= 2,
            _ => *seen <= 2 || value == MATH_HEADER_WORD,
        };
        if skip {
            return Ok(());
        }
        if value == PERF_VAL_LAST {
            let words = std::mem::take(words);
            return self.end_thread(kind, words, false);
        }
        words.push(value);
        Ok(())
    }

    /// Flush a thread left open and return the epoch.
    pub fn finish(mut self) -> Result<(EpochRecord, OfflineSummary), TextParseError> {
        self.interrupt_thread()?;
        if self.core.take().is_some() {
            crate::perf_warn!(self.quiet, epoch = %self.epoch.label(), "last core has no BRISC thread, discarding");
        }
        if !self.epoch.is_complete() {
            crate::perf_warn!(
                self.quiet,
                epoch = %self.epoch.label(),
                cores = self.epoch.cores.len(),
                expected = self.epoch.expected_cores(),
                "dump is missing cores",
            );
        }
        Ok((self.epoch, self.summary))
    }

    fn start_core(&mut self, core: CoreCoord) {
        if let Some(previous) = self.core.take() {
            crate::perf_warn!(
                self.quiet,
                core = %previous.core.label(),
                threads = previous.threads.len(),
                "core ended without a BRISC thread, discarding",
            );
        }

        let Some(descriptor) = self.epoch.graph.core_desc(core) else {
            debug!(core = %core.label(), "skipping core without an op");
            self.summary.skipped_cores += 1;
            self.state = ParserState::SeekingCore;
            return;
        };

        let epoch_id = u16::try_from(self.epoch.meta.global_epoch_id).unwrap_or(u16::MAX);
        let mut record = CoreRecord::new(self.epoch.meta.device_id, core, epoch_id);
        record.descriptor = descriptor;
        debug!(core = %record.label(), "processing core");
        self.core = Some(record);
        self.state = ParserState::SeekingThread;
    }

    /// A header line arrived while a thread was still collecting words.
    fn interrupt_thread(&mut self) -> Result<(), TextParseError> {
        let state = std::mem::replace(&mut self.state, ParserState::SeekingThread);
        match state {
            ParserState::Accumulating { kind, words, .. } if !words.is_empty() => {
                let core = self.core.as_ref().map(|c| c.label()).unwrap_or_default();
                crate::perf_warn!(self.quiet, core = %core, thread = %kind, "end sentinel of thread not found");
                self.end_thread(kind, words, false)
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    fn end_thread(&mut self, kind: ThreadKind, words: Vec<u32>, out_of_memory: bool) -> Result<(), TextParseError> {
        self.state = if kind == ThreadKind::Brisc {
            ParserState::SeekingCore
        } else {
            ParserState::SeekingThread
        };
        let Some(core) = self.core.as_mut() else {
            return Ok(());
        };

        let mut record = parse_thread(&words, kind, false)?;
        if out_of_memory {
            crate::perf_warn!(self.quiet, core = %core.label(), thread = %kind, "thread ran out of memory");
            record.out_of_memory = true;
        }
        self.summary.threads += 1;
        self.stats.record(Counter::FullThreads);

        if let Err(e) = core.insert_thread(record) {
            self.violation(&e);
            self.core = None;
            self.state = ParserState::SeekingCore;
            return Ok(());
        }
        if kind == ThreadKind::Brisc {
            self.finish_core();
        }
        Ok(())
    }

    fn finish_core(&mut self) {
        let Some(mut core) = self.core.take() else {
            return;
        };
        if !core.is_complete() {
            crate::perf_warn!(self.quiet, core = %core.label(), threads = core.threads.len(), "core is missing threads");
        }
        let dropped = finalize_core(&mut core, self.quiet);
        if dropped > 0 {
            self.stats.record_n(Counter::EventsDropped, dropped as u64);
        }
        match self.epoch.insert_core(core) {
            Ok(()) => {
                self.summary.cores += 1;
                self.stats.record(Counter::FullCores);
            }
            Err(e) => self.violation(&e),
        }
    }

    fn violation(&mut self, e: &AggregateError) {
        error!(epoch = %self.epoch.label(), error = %e, "discarding core");
        self.count_violation();
    }

    fn count_violation(&mut self) {
        self.summary.violations += 1;
        self.stats.record(Counter::ProtocolViolations);
    }
}

/// Parse a whole dump for `epoch`.
pub fn parse_dump(
    reader: impl BufRead,
    epoch: EpochRecord,
    stats: Arc<PipelineStats>,
    quiet: bool,
) -> Result<(EpochRecord, OfflineSummary), TextParseError> {
    let mut parser = OfflineParser::new(epoch, stats, quiet);
    for (i, line) in reader.lines().enumerate() {
        parser.feed_line(i + 1, &line?)?;
    }
    parser.finish()
}

/// Empty epoch record for the `idx`-th executed instruction.
pub fn epoch_for_instruction(state: &PerfState, idx: usize) -> Result<Option<EpochRecord>, StateError> {
    let Some(meta) = state.get_executed_instr().into_iter().nth(idx) else {
        return Ok(None);
    };
    let graph = state.get_graph(&meta.graph_name)?;
    let num_epochs = state.get_num_instructions_executed(meta.program_id);
    Ok(Some(EpochRecord::new(idx, meta, graph, num_epochs)))
}

/// Parse one dump file per executed instruction, in execution order.
pub fn parse_dump_files(
    state: &PerfState,
    stats: Arc<PipelineStats>,
    dumps: &[impl AsRef<Path>],
) -> anyhow::Result<Vec<EpochRecord>> {
    let quiet = state.get_config().quiet();
    let mut epochs = Vec::with_capacity(dumps.len());
    let mut out_of_memory = OutOfMemoryCores::default();

    for (idx, path) in dumps.iter().enumerate() {
        let path = path.as_ref();
        let epoch = epoch_for_instruction(state, idx)?
            .with_context(|| format!("{} has no executed instruction", path.display()))?;
        let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let (mut epoch, summary) = parse_dump(std::io::BufReader::new(file), epoch, Arc::clone(&stats), quiet)
            .with_context(|| format!("parsing {}", path.display()))?;
        for core in epoch.cores.values_mut() {
            if out_of_memory.carry(core) {
                crate::perf_warn!(quiet, chip = core.chip, core = %core.core.label(), "core ran out of trace memory");
            }
        }

        info!(
            dump = %path.display(),
            epoch = %epoch.label(),
            cores = summary.cores,
            threads = summary.threads,
            skipped_cores = summary.skipped_cores,
            violations = summary.violations,
            "parsed textual dump",
        );
        stats.record(Counter::FullEpochs);
        epochs.push(epoch);
    }

    Ok(epochs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::codec::{DumpHeader, TriscEventId};
    use crate::device::event::TriscEventType;
    use crate::config::PerfConfig;
    use crate::record::tests::{graph, meta};
    use crate::state::descriptor::tests::SAMPLE;
    use crate::state::descriptor::RunDescriptor;

    fn epoch() -> EpochRecord {
        EpochRecord::new(0, meta(), graph(&[(1, 1)]), 1)
    }

    fn hex(word: u32) -> String {
        format!("        - 0x{word:08x}")
    }

    fn header(kind: ThreadKind) -> u32 {
        DumpHeader {
            x: 1,
            y: 1,
            chip_id: 0,
            thread_id: kind as u8,
            epoch_id: 0,
        }
        .encode()
    }

    fn trisc(event_type: TriscEventType, value: u32) -> [u32; 3] {
        let id = TriscEventId {
            operand_idx: 0,
            num_tiles: 0,
            event_type: event_type as u8,
            outer_loop_idx: 0,
        }
        .encode();
        [id, 0, value]
    }

    /// A full textual dump for core 1-1 with first unpack at 1000 and last
    /// pack end at 1500.
    pub(crate) fn sample_dump() -> String {
        let mut lines = vec!["1-1:".to_string()];
        for &kind in ThreadKind::all() {
            lines.push(format!("    {kind}:"));
            lines.push(hex(PERF_VAL_FIRST));
            lines.push(hex(header(kind)));
            let body: Vec<u32> = match kind {
                ThreadKind::Unpack => [
                    trisc(TriscEventType::UnpackFirstInstruction, 1000),
                    trisc(TriscEventType::UnpackFirstInstruction, 1005),
                ]
                .concat(),
                ThreadKind::Pack => [
                    trisc(TriscEventType::PackEachInput, 1100),
                    trisc(TriscEventType::PackEachInput, 1500),
                ]
                .concat(),
                ThreadKind::Math => vec![MATH_HEADER_WORD, MATH_HEADER_WORD, 0, 100, 0, 0, 1200, 400, 0, 0],
                _ => Vec::new(),
            };
            lines.extend(body.into_iter().map(hex));
            lines.push(hex(PERF_VAL_LAST));
        }
        lines.join("\n")
    }

    fn parse(text: &str) -> (EpochRecord, OfflineSummary) {
        parse_dump(text.as_bytes(), epoch(), Arc::new(PipelineStats::new()), true).expect("parse")
    }

    #[test]
    fn test_classify_lines() {
        assert_eq!(classify("1-2:"), Line::Core(CoreCoord::new(1, 2)));
        assert_eq!(classify("    T1:"), Line::Thread(ThreadKind::Math));
        assert_eq!(classify("    NCRISC:"), Line::Thread(ThreadKind::Ncrisc));
        assert_eq!(classify("        - 0xbeeff00d"), Line::Event(PERF_VAL_FIRST));
        assert_eq!(classify("        - 0"), Line::Event(0));
        assert_eq!(classify("T9:"), Line::UnknownHeader("T9".to_string()));
        assert_eq!(classify("epoch 0"), Line::Other);
    }

    #[test]
    fn test_full_core() {
        let (epoch, summary) = parse(&sample_dump());
        assert!(epoch.is_complete());
        assert_eq!(summary.threads, 5);
        assert_eq!(summary.cores, 1);

        let core = &epoch.cores[&CoreCoord::new(1, 1)];
        assert_eq!(core.descriptor.op_name, "op0");
        assert!(!core.out_of_memory);
        assert_eq!(core.outer_loops[&0].unpack_first, Some(1000));
        assert_eq!(core.outer_loops[&0].pack_last_end, Some(1500));
        assert_eq!(core.math_activity, Some(300));
    }

    #[test]
    fn test_unknown_core_is_skipped() {
        let text = format!("5-5:\n    T0:\n{}\n{}", hex(PERF_VAL_FIRST), sample_dump());
        let (epoch, summary) = parse(&text);
        assert_eq!(summary.skipped_cores, 1);
        assert_eq!(epoch.cores.len(), 1);
    }

    #[test]
    fn test_out_of_memory_thread() {
        let text = sample_dump().replacen(
            &format!("{}\n    T1:", hex(PERF_VAL_LAST)),
            &format!("{}\n    T1:", hex(PERF_OUT_OF_MEM)),
            1,
        );
        let (epoch, _) = parse(&text);
        let core = &epoch.cores[&CoreCoord::new(1, 1)];
        assert!(core.threads[&ThreadKind::Unpack].out_of_memory);
        assert!(core.out_of_memory);
    }

    #[test]
    fn test_out_of_memory_carried_across_dumps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let desc: RunDescriptor = serde_yaml::from_str(SAMPLE).expect("parse run");
        let state = PerfState::from_descriptor(&desc, PerfConfig::default(), dir.path()).expect("state");

        let first = dir.path().join("epoch0.yaml");
        let second = dir.path().join("epoch1.yaml");
        let overflowed = sample_dump().replacen(
            &format!("{}\n    T1:", hex(PERF_VAL_LAST)),
            &format!("{}\n    T1:", hex(PERF_OUT_OF_MEM)),
            1,
        );
        std::fs::write(&first, overflowed).expect("write");
        std::fs::write(&second, sample_dump()).expect("write");

        let epochs = parse_dump_files(&state, Arc::new(PipelineStats::new()), &[&first, &second]).expect("parse");
        assert_eq!(epochs.len(), 2);
        for epoch in &epochs {
            assert!(epoch.cores[&CoreCoord::new(1, 1)].out_of_memory, "epoch {}", epoch.epoch_idx);
        }
        // The clean dump itself carried no marker.
        let unpack = &epochs[1].cores[&CoreCoord::new(1, 1)].threads[&ThreadKind::Unpack];
        assert!(!unpack.out_of_memory);
    }

    #[test]
    fn test_inactive_thread_starts_with_marker() {
        let text = sample_dump().replacen(
            &format!("    T0:\n{}", hex(PERF_VAL_FIRST)),
            &format!("    T0:\n{}", hex(PERF_OUT_OF_MEM)),
            1,
        );
        let (epoch, _) = parse(&text);
        let core = &epoch.cores[&CoreCoord::new(1, 1)];
        assert!(core.threads[&ThreadKind::Unpack].out_of_memory);
    }

    #[test]
    fn test_missing_end_sentinel_flushed_by_next_header() {
        // Drop the unpack end sentinel; the T1 header closes the thread.
        let text = sample_dump().replacen(&format!("{}\n    T1:", hex(PERF_VAL_LAST)), "    T1:", 1);
        let (epoch, summary) = parse(&text);
        assert_eq!(summary.threads, 5);
        let core = &epoch.cores[&CoreCoord::new(1, 1)];
        assert_eq!(core.outer_loops[&0].unpack_first, Some(1000));
        assert!(!core.threads[&ThreadKind::Unpack].out_of_memory);
    }

    #[test]
    fn test_duplicate_thread_discards_core() {
        let text = sample_dump().replacen("    T1:", "    T0:", 1);
        let (epoch, summary) = parse(&text);
        assert_eq!(summary.violations, 1);
        assert!(epoch.cores.is_empty());
    }

    #[test]
    fn test_unknown_thread_counted_once() {
        let stray = format!("    T9:\n{}\n{}", hex(PERF_VAL_FIRST), hex(0x1234));

        // Between threads.
        let between = sample_dump().replacen(
            &format!("{}\n    T1:", hex(PERF_VAL_LAST)),
            &format!("{}\n{stray}\n    T1:", hex(PERF_VAL_LAST)),
            1,
        );
        // While the unpack thread is still open.
        let open = sample_dump().replacen(
            &format!("{}\n    T1:", hex(PERF_VAL_LAST)),
            &format!("{stray}\n    T1:"),
            1,
        );

        for text in [between, open] {
            let stats = Arc::new(PipelineStats::new());
            let (epoch, summary) =
                parse_dump(text.as_bytes(), epoch(), Arc::clone(&stats), true).expect("parse");
            assert_eq!(summary.violations, 1);
            assert_eq!(stats.get(Counter::ProtocolViolations), 1);
            assert_eq!(summary.threads, 5);
            let core = &epoch.cores[&CoreCoord::new(1, 1)];
            assert_eq!(core.outer_loops[&0].unpack_first, Some(1000));
        }
    }

    #[test]
    fn test_unknown_header_ignored_between_cores() {
        let text = format!("T9:\n{}\n{}", hex(0x1234), sample_dump());
        let (epoch, summary) = parse(&text);
        assert_eq!(summary.violations, 0);
        assert_eq!(epoch.cores.len(), 1);
    }

    #[test]
    fn test_invalid_event_line() {
        let text = format!("1-1:\n    T0:\n{}\n        - zz", hex(PERF_VAL_FIRST));
        let err = parse_dump(text.as_bytes(), epoch(), Arc::new(PipelineStats::new()), true).unwrap_err();
        assert!(matches!(err, TextParseError::InvalidEventLine { line: 4, .. }));
    }
}
