use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline stages counted by [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Counter {
    /// Scratch slots copied out of the device.
    SlotsDrained = 0,
    /// Thread dump chunks handed to the aggregator.
    ThreadsReceived = 1,
    /// Thread dumps that parsed into a record.
    FullThreads = 2,
    /// Cores with all five threads assembled.
    FullCores = 3,
    /// Epochs with every active core assembled.
    FullEpochs = 4,
    /// Events removed by the cleanup pass.
    EventsDropped = 5,
    /// Dumps discarded for breaking the dump protocol.
    ProtocolViolations = 6,
    /// Slots whose first word was not a known sentinel.
    CorruptSlots = 7,
    /// Epochs written out by the report generator.
    EpochsReported = 8,
    /// Comparison checks that failed.
    ChecksFailed = 9,
}

/// Maximum Counter value, used for array sizing.
pub const MAX_COUNTER: usize = 9;

impl Counter {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SlotsDrained => "slots_drained",
            Self::ThreadsReceived => "threads_received",
            Self::FullThreads => "full_threads",
            Self::FullCores => "full_cores",
            Self::FullEpochs => "full_epochs",
            Self::EventsDropped => "events_dropped",
            Self::ProtocolViolations => "protocol_violations",
            Self::CorruptSlots => "corrupt_slots",
            Self::EpochsReported => "epochs_reported",
            Self::ChecksFailed => "checks_failed",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::SlotsDrained),
            1 => Some(Self::ThreadsReceived),
            2 => Some(Self::FullThreads),
            3 => Some(Self::FullCores),
            4 => Some(Self::FullEpochs),
            5 => Some(Self::EventsDropped),
            6 => Some(Self::ProtocolViolations),
            7 => Some(Self::CorruptSlots),
            8 => Some(Self::EpochsReported),
            9 => Some(Self::ChecksFailed),
            _ => None,
        }
    }
}

/// Lock-free pipeline counters shared by the poller and the aggregator.
///
/// Counters are cumulative for the lifetime of the pipeline.
pub struct PipelineStats {
    counts: [AtomicU64; MAX_COUNTER + 1],
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter by one.
    pub fn record(&self, c: Counter) {
        self.record_n(c, 1);
    }

    /// Increment the counter by n.
    pub fn record_n(&self, c: Counter, n: u64) {
        if let Some(counter) = self.counts.get(c as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value of one counter.
    pub fn get(&self, c: Counter) -> u64 {
        self.counts
            .get(c as usize)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Read all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.load(Ordering::Relaxed);
            if v > 0 {
                if let Some(c) = Counter::from_u8(i as u8) {
                    result.push((c, v));
                }
            }
        }

        result
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let stats = PipelineStats::new();
        stats.record(Counter::SlotsDrained);
        stats.record(Counter::SlotsDrained);
        stats.record_n(Counter::EventsDropped, 5);

        assert_eq!(stats.get(Counter::SlotsDrained), 2);
        assert_eq!(stats.get(Counter::EventsDropped), 5);
        assert_eq!(stats.get(Counter::FullCores), 0);
    }

    #[test]
    fn test_snapshot_is_cumulative() {
        let stats = PipelineStats::new();
        stats.record(Counter::FullEpochs);
        assert_eq!(stats.snapshot(), vec![(Counter::FullEpochs, 1)]);

        stats.record(Counter::CorruptSlots);
        assert_eq!(
            stats.snapshot(),
            vec![(Counter::FullEpochs, 1), (Counter::CorruptSlots, 1)]
        );
        assert_eq!(stats.get(Counter::FullEpochs), 1);
    }

    #[test]
    fn test_counter_roundtrip() {
        for i in 0..=MAX_COUNTER as u8 {
            let c = Counter::from_u8(i).expect("valid counter");
            assert_eq!(c as u8, i);
        }
        assert!(Counter::from_u8(MAX_COUNTER as u8 + 1).is_none());
    }
}
