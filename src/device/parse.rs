//! Thread dump decoding.
//!
//! Turns the raw word stream of one firmware thread into a [`ThreadRecord`].
//! The walk never panics on malformed input: trailing partial records are
//! ignored, unknown NCRISC types end the walk, and an out-of-memory marker
//! ends the walk and flags the record.

use thiserror::Error;
use tracing::debug;

use super::codec::{self, events_32b_to_64b, DumpHeader};
use super::event::{
    Event, NcriscEventType, ThreadKind, ThreadRecord, MATH_HEADER_WORD, PERF_OUT_OF_MEM,
    PERF_VAL_LAST, PERF_VAL_PADDING, THREAD_DUMP_END_ID, VALID_THREAD_DUMP_START_ID,
    WORDS_PER_EVENT_MATH, WORDS_PER_EVENT_NCRISC, WORDS_PER_EVENT_TRISC,
};

/// Description given to math records.
pub const MATH_EVENT_DESCRIPTION: &str = "math-perf-counter-outer-loop-0";

/// Placeholder width added to DRAM IO queue status events that never
/// recorded an end timestamp.
pub const DRAM_IO_Q_STATUS_PLACEHOLDER_CYCLES: u64 = 1000;

/// Errors that can occur while decoding a thread dump.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("thread dump too short: {size} words")]
    Truncated { size: usize },

    #[error("thread dump does not start with the valid sentinel: {word:#010x}")]
    MissingStartSentinel { word: u32 },

    #[error("invalid thread id {thread_id} in header {header:#010x}")]
    InvalidThreadId { thread_id: u8, header: u32 },

    #[error("concurrent math dump word {index} must be 0xffffffff, got {word:#010x}")]
    MissingMathHeader { index: usize, word: u32 },
}

/// Decode one self-contained thread dump: start sentinel, header, events
/// and (optionally) the end sentinel.
pub fn parse_thread_dump(
    words: &[u32],
    concurrent: bool,
) -> Result<(DumpHeader, ThreadRecord), ParseError> {
    if words.len() < 2 {
        return Err(ParseError::Truncated { size: words.len() });
    }
    if words[0] != VALID_THREAD_DUMP_START_ID {
        return Err(ParseError::MissingStartSentinel { word: words[0] });
    }

    let header = DumpHeader::decode(words[1]);
    let kind = header.thread_kind().ok_or(ParseError::InvalidThreadId {
        thread_id: header.thread_id,
        header: words[1],
    })?;

    let mut body = &words[2..];
    if let Some((&last, rest)) = body.split_last() {
        if last == THREAD_DUMP_END_ID {
            body = rest;
        }
    }

    let record = parse_thread(body, kind, concurrent)?;
    Ok((header, record))
}

/// Decode the event words of one thread. `words` excludes the sentinels and
/// the header.
pub fn parse_thread(
    words: &[u32],
    kind: ThreadKind,
    concurrent: bool,
) -> Result<ThreadRecord, ParseError> {
    let mut record = ThreadRecord::new(kind);

    let mut words = words;
    if concurrent && kind == ThreadKind::Math {
        for index in 0..2 {
            match words.get(index) {
                Some(&MATH_HEADER_WORD) => {}
                Some(&word) => return Err(ParseError::MissingMathHeader { index, word }),
                None => return Err(ParseError::Truncated { size: words.len() }),
            }
        }
        words = &words[2..];
    }

    let mut walker = Walker::new(words, kind, concurrent);
    walker.run(&mut record);

    if kind == ThreadKind::Ncrisc {
        combine_ncrisc_events(&mut record);
    }

    Ok(record)
}

// ---------------------------------------------------------------------------
// Word walker
// ---------------------------------------------------------------------------

struct Walker<'a> {
    words: &'a [u32],
    kind: ThreadKind,
    concurrent: bool,
    math_calibration: u32,
    clock_top: u32,
    ncrisc_loop: Option<u64>,
    ncrisc_first_write: u64,
}

impl<'a> Walker<'a> {
    fn new(words: &'a [u32], kind: ThreadKind, concurrent: bool) -> Self {
        Self {
            words,
            kind,
            concurrent,
            math_calibration: 0,
            clock_top: 0,
            ncrisc_loop: None,
            ncrisc_first_write: 0,
        }
    }

    fn default_stride(&self) -> usize {
        match self.kind {
            ThreadKind::Math => WORDS_PER_EVENT_MATH,
            ThreadKind::Ncrisc => WORDS_PER_EVENT_NCRISC,
            _ => WORDS_PER_EVENT_TRISC,
        }
    }

    fn run(&mut self, record: &mut ThreadRecord) {
        let stride = self.default_stride();
        let len = self.words.len();
        let mut i = 0;

        while i + stride <= len {
            let word = self.words[i];

            if word == PERF_OUT_OF_MEM {
                record.out_of_memory = true;
                break;
            }
            if self.concurrent && word == PERF_VAL_LAST {
                break;
            }
            if self.concurrent && word == MATH_HEADER_WORD && self.kind.is_unpack_or_pack() {
                i += 1;
                continue;
            }

            let advance = match self.kind {
                ThreadKind::Unpack | ThreadKind::Pack | ThreadKind::Brisc => {
                    self.trisc_record(record, i);
                    stride
                }
                ThreadKind::Math => {
                    self.math_record(record, i);
                    stride
                }
                ThreadKind::Ncrisc => match self.ncrisc_record(record, i) {
                    Some(advance) => advance,
                    None => break,
                },
            };
            i += advance;
        }
    }

    fn trisc_record(&self, record: &mut ThreadRecord, i: usize) {
        let id = self.words[i];
        let value = events_32b_to_64b(self.words[i + 1], self.words[i + 2]);

        let events = record.events.entry(u64::from(id)).or_default();
        match events.last_mut() {
            Some(last) if last.second.is_none() => last.second = Some(value),
            _ => {
                let desc = codec::describe(id, self.kind).unwrap_or_default();
                events.push(Event::new(u64::from(id), desc, value));
            }
        }
    }

    fn math_record(&mut self, record: &mut ThreadRecord, i: usize) {
        if i == 0 {
            self.math_calibration = self.words[1];
            return;
        }

        // The activity counter is free-running across records.
        let previous = if i >= WORDS_PER_EVENT_MATH {
            self.words[i - 3]
        } else {
            self.math_calibration
        };
        let activity = self.words[i + 1].wrapping_sub(previous);

        record.events.entry(0).or_default().push(Event::paired(
            0,
            MATH_EVENT_DESCRIPTION,
            u64::from(self.words[i]),
            u64::from(activity),
        ));
    }

    /// Returns the number of words consumed, or `None` to end the walk.
    fn ncrisc_record(&mut self, record: &mut ThreadRecord, i: usize) -> Option<usize> {
        let id = self.words[i];
        if id == PERF_VAL_PADDING {
            return Some(1);
        }

        let Some(kind) = NcriscEventType::from_id(id) else {
            debug!(id = %format!("{id:#010x}"), index = i, "unknown ncrisc event type");
            return None;
        };

        if kind == NcriscEventType::WallClockTop32b {
            self.clock_top = self.words[i + 1];
            return Some(WORDS_PER_EVENT_NCRISC);
        }

        let stride = kind.words_per_record();
        if i + stride > self.words.len() {
            return None;
        }

        let w = &self.words[i..i + stride];
        let timestamp = if kind.has_64b_timestamp() {
            events_32b_to_64b(w[2], w[1])
        } else {
            events_32b_to_64b(self.clock_top, w[1])
        };

        let key = u64::from(id);
        if !record.events.contains_key(&key) {
            let event = self.first_ncrisc_event(kind, id, w, timestamp);
            record.events.insert(key, vec![event]);
            return Some(stride);
        }

        let events = record.events.entry(key).or_default();
        let Some(last) = events.last_mut() else {
            return Some(stride);
        };

        if last.second.is_none() {
            last.second = Some(timestamp);
            return Some(stride);
        }

        let desc = codec::describe_ncrisc(id).unwrap_or_default();
        let event = match kind {
            NcriscEventType::StreamMiscInfo => {
                Event::paired(key, desc, timestamp, u64::from(w[2]))
            }
            NcriscEventType::DramIoQStatus
            | NcriscEventType::StreamRestart
            | NcriscEventType::StreamBufStatus
            | NcriscEventType::EpochQEmpty => Event::new(key, desc, timestamp),
            _ => Event {
                id: key,
                description: desc,
                first: last.second,
                second: Some(timestamp),
                extras: Vec::new(),
            },
        };
        events.push(event);

        Some(stride)
    }

    fn first_ncrisc_event(
        &mut self,
        kind: NcriscEventType,
        id: u32,
        w: &[u32],
        timestamp: u64,
    ) -> Event {
        let key = u64::from(id);
        let desc = codec::describe_ncrisc(id).unwrap_or_default();

        match kind {
            NcriscEventType::StreamInfo => Event {
                id: key,
                description: desc,
                first: Some(u64::from(w[1])),
                second: Some(u64::from(w[2])),
                extras: w[3..7].to_vec(),
            },
            NcriscEventType::StreamMiscInfo => Event::paired(key, desc, timestamp, u64::from(w[2])),
            NcriscEventType::StreamHandlerLoop => {
                self.ncrisc_loop = Some(timestamp);
                Event::new(key, desc, timestamp)
            }
            NcriscEventType::EpochQSlotComplete
            | NcriscEventType::DramWriteSent
            | NcriscEventType::DramWriteTilesCleared => {
                // The loop event is spilled late in concurrent mode, so it can
                // appear after the events that reference it.
                if self.ncrisc_loop.is_none() {
                    if !self.concurrent {
                        debug!("stream handler loop event recorded out of order");
                    }
                    self.ncrisc_loop = find_stream_handler_loop(self.words);
                }

                let first = match kind {
                    NcriscEventType::DramWriteSent => {
                        self.ncrisc_first_write = timestamp;
                        self.ncrisc_loop
                    }
                    NcriscEventType::DramWriteTilesCleared => Some(self.ncrisc_first_write),
                    _ => self.ncrisc_loop,
                };

                Event {
                    id: key,
                    description: desc,
                    first,
                    second: Some(timestamp),
                    extras: Vec::new(),
                }
            }
            _ => Event::new(key, desc, timestamp),
        }
    }
}

/// Scan an NCRISC buffer for the first stream handler loop timestamp.
pub fn find_stream_handler_loop(words: &[u32]) -> Option<u64> {
    let mut i = 0;
    while i < words.len() {
        let id = words[i];
        if id == PERF_VAL_PADDING {
            i += 1;
            continue;
        }
        let kind = NcriscEventType::from_id(id)?;
        if kind == NcriscEventType::StreamHandlerLoop {
            return match (words.get(i + 1), words.get(i + 2)) {
                (Some(&lo), Some(&hi)) => Some(events_32b_to_64b(hi, lo)),
                _ => None,
            };
        }
        i += kind.words_per_record();
    }
    None
}

// ---------------------------------------------------------------------------
// Post-passes
// ---------------------------------------------------------------------------

/// Stitch each DRAM read-issued id with its tile-flushed twin.
///
/// The read of index `i` ends when flush `i` starts; the twin id is removed
/// afterwards.
pub fn combine_ncrisc_events(record: &mut ThreadRecord) {
    let read_ids: Vec<u64> = record
        .events
        .keys()
        .copied()
        .filter(|id| NcriscEventType::from_id(*id as u32) == Some(NcriscEventType::DramReadIssued))
        .collect();

    for read_id in read_ids {
        let flushed_id = (read_id & 0xff_ffff) | ((NcriscEventType::DramReadTileFlushed as u64) << 24);
        let flushed = record.events.remove(&flushed_id);

        let Some(reads) = record.events.get_mut(&read_id) else {
            continue;
        };

        if let Some(tail) = reads.last().and_then(|last| last.second) {
            let desc = reads[0].description.clone();
            reads.push(Event::new(read_id, desc, tail));
        }

        let Some(mut flushes) = flushed else {
            continue;
        };

        if let Some(tail) = flushes.last().and_then(|last| last.second) {
            let desc = flushes[0].description.clone();
            flushes.push(Event::new(flushed_id, desc, tail));
        }

        for (read, flush) in reads.iter_mut().zip(flushes.iter()) {
            read.second = flush.first;
        }
    }
}

/// Drop events that are missing a value they must carry.
///
/// Single-value unpack/pack/brisc ids are kept as is. DRAM IO queue status
/// events without an end get a placeholder end `first + 1000`; that value is
/// an approximation, not a measurement. Returns the number of dropped events.
pub fn check_end_time_recorded(record: &mut ThreadRecord, core_label: &str, quiet: bool) -> usize {
    let kind = record.kind;
    let mut dropped = 0;

    record.events.retain(|&id, events| {
        if kind != ThreadKind::Ncrisc && codec::is_single_value(id as u32, kind) {
            return true;
        }

        events.retain_mut(|event| {
            let Some(first) = event.first else {
                crate::perf_warn!(
                    quiet,
                    core = core_label,
                    thread = %kind,
                    description = %event.description,
                    "first value not recorded, dropping event",
                );
                dropped += 1;
                return false;
            };

            if event.second.is_some() {
                return true;
            }

            if kind == ThreadKind::Ncrisc
                && NcriscEventType::from_id(id as u32) == Some(NcriscEventType::DramIoQStatus)
            {
                crate::perf_warn!(
                    quiet,
                    core = core_label,
                    thread = %kind,
                    description = %event.description,
                    "end value not recorded, using placeholder end",
                );
                event.second = Some(first + DRAM_IO_Q_STATUS_PLACEHOLDER_CYCLES);
                return true;
            }

            crate::perf_warn!(
                quiet,
                core = core_label,
                thread = %kind,
                description = %event.description,
                "end value not recorded, dropping event",
            );
            dropped += 1;
            false
        });

        !events.is_empty()
    });

    dropped
}
