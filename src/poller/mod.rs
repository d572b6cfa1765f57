//! Draining of the host-visible scratch ring buffers.
//!
//! Each queue is a fixed number of slots. Software tags every free slot with
//! an empty first word and an end-empty last word; the device overwrites the
//! first word with the valid-start sentinel once it has written a dump. The
//! poller copies such slots out, frees them and publishes its read pointer
//! back to the device so the slot can be reused.

pub mod mock;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ScratchConfig;
use crate::device::event::{
    PERF_SCRATCH_EMPTY_ID, PERF_SCRATCH_END_EMPTY_ID, VALID_THREAD_DUMP_START_ID,
};
use crate::device::stats::{Counter, PipelineStats};

pub use mock::MemoryTransport;

/// Errors raised while polling a queue.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PollError {
    #[error("queue {queue} slot {slot}: first word {word:#010x} is neither empty nor a valid dump start")]
    CorruptSlot { queue: usize, slot: usize, word: u32 },
}

/// One slot of one ring queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingSlot {
    pub queue: usize,
    pub index: usize,
}

/// The device side of the scratch ring buffers.
pub trait DeviceTransport: Send + Sync {
    /// First and last word of a slot.
    fn peek_slot(&self, slot: RingSlot) -> (u32, u32);

    /// Copy of the whole slot.
    fn read_slot(&self, slot: RingSlot) -> Vec<u32>;

    /// Re-tag a slot as free.
    fn release_slot(&self, slot: RingSlot);

    /// Publish the host read pointer of a queue to the device.
    fn write_ptr(&self, queue: usize, rd_ptr: u32);
}

/// Read and write pointers of one queue. Both wrap at twice the slot count
/// so a full queue can be told apart from an empty one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePtr {
    pub rd: u32,
    pub wr: u32,
}

impl QueuePtr {
    fn incr_rd(&mut self, num_slots: u32) {
        self.rd = (self.rd + 1) % (2 * num_slots);
    }

    fn incr_wr(&mut self, num_slots: u32) {
        self.wr = (self.wr + 1) % (2 * num_slots);
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ptr: QueuePtr,
    traces_received: u64,
}

/// Traces drained per queue, reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerSummary {
    pub traces_per_queue: Vec<u64>,
    pub corrupt_slots: u64,
}

impl PollerSummary {
    pub fn total(&self) -> u64 {
        self.traces_per_queue.iter().sum()
    }
}

/// Single loop over every queue of a transport.
pub struct ScratchBufferPoller<T: DeviceTransport> {
    transport: Arc<T>,
    cfg: ScratchConfig,
    stats: Arc<PipelineStats>,
    queues: Vec<QueueState>,
    corrupt_slots: u64,
}

impl<T: DeviceTransport> ScratchBufferPoller<T> {
    pub fn new(transport: Arc<T>, cfg: ScratchConfig, stats: Arc<PipelineStats>) -> Self {
        let queues = (0..cfg.num_queues).map(|_| QueueState::default()).collect();
        Self {
            transport,
            cfg,
            stats,
            queues,
            corrupt_slots: 0,
        }
    }

    /// Tag every slot as free and reset the device-side pointers.
    pub fn initialize(&mut self) {
        for queue in 0..self.cfg.num_queues {
            for index in 0..self.cfg.num_slots {
                self.transport.release_slot(RingSlot { queue, index });
            }
            self.transport.write_ptr(queue, 0);
        }
        for state in &mut self.queues {
            *state = QueueState::default();
        }
        info!(
            queues = self.cfg.num_queues,
            slots = self.cfg.num_slots,
            slot_words = self.cfg.slot_words(),
            "initialized scratch queues",
        );
    }

    fn num_slots(&self) -> u32 {
        self.cfg.num_slots as u32
    }

    fn current_slot(&self, queue: usize) -> RingSlot {
        let rd = self.queues.get(queue).map(|q| q.ptr.rd).unwrap_or(0);
        RingSlot {
            queue,
            index: rd as usize % self.cfg.num_slots,
        }
    }

    pub fn ptr(&self, queue: usize) -> Option<QueuePtr> {
        self.queues.get(queue).map(|q| q.ptr)
    }

    /// True when the slot at the read pointer holds a finished dump.
    pub fn check_new_entry(&self, queue: usize) -> Result<bool, PollError> {
        let slot = self.current_slot(queue);
        let (first, last) = self.transport.peek_slot(slot);

        if first != PERF_SCRATCH_EMPTY_ID && first != VALID_THREAD_DUMP_START_ID {
            return Err(PollError::CorruptSlot {
                queue,
                slot: slot.index,
                word: first,
            });
        }

        // The device writes the last word last.
        Ok(first == VALID_THREAD_DUMP_START_ID && last != PERF_SCRATCH_END_EMPTY_ID)
    }

    /// One pass over all queues. Returns the number of slots drained.
    pub fn poll_once(&mut self, tx: &mpsc::UnboundedSender<Vec<u32>>) -> usize {
        let mut drained = 0;
        for queue in 0..self.queues.len() {
            loop {
                match self.check_new_entry(queue) {
                    Ok(true) => {
                        self.drain_slot(queue, tx);
                        drained += 1;
                    }
                    Ok(false) => break,
                    Err(e) => {
                        // Re-tag without advancing; the device has not
                        // produced a dump here yet.
                        error!(error = %e, "resetting corrupt scratch slot");
                        self.transport.release_slot(self.current_slot(queue));
                        self.corrupt_slots += 1;
                        self.stats.record(Counter::CorruptSlots);
                        break;
                    }
                }
            }
        }
        drained
    }

    fn drain_slot(&mut self, queue: usize, tx: &mpsc::UnboundedSender<Vec<u32>>) {
        let num_slots = self.num_slots();
        let slot = self.current_slot(queue);

        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        state.ptr.incr_wr(num_slots);
        state.traces_received += 1;

        let words = self.transport.read_slot(slot);
        if tx.send(words).is_err() {
            warn!(queue, slot = slot.index, "aggregator queue closed, dropping slot");
        }

        self.transport.release_slot(slot);
        state.ptr.incr_rd(num_slots);
        self.transport.write_ptr(queue, state.ptr.rd);
        self.stats.record(Counter::SlotsDrained);

        debug!(
            queue,
            slot = slot.index,
            rd_ptr = state.ptr.rd,
            wr_ptr = state.ptr.wr,
            "drained scratch slot",
        );
    }

    /// Poll until cancelled, then make one final pass. Queues must have
    /// been initialized.
    pub async fn run(
        mut self,
        tx: mpsc::UnboundedSender<Vec<u32>>,
        cancel: CancellationToken,
    ) -> PollerSummary {
        info!("starting scratch buffer poll");

        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.poll_once(&tx);
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once(&tx);
                }
            }
        }

        let summary = self.summary();
        info!(
            traces = summary.total(),
            corrupt_slots = summary.corrupt_slots,
            "stopped scratch buffer poll",
        );
        for (queue, count) in summary.traces_per_queue.iter().enumerate() {
            debug!(queue, traces = count, "traces received from queue");
        }
        summary
    }

    pub fn summary(&self) -> PollerSummary {
        PollerSummary {
            traces_per_queue: self.queues.iter().map(|q| q.traces_received).collect(),
            corrupt_slots: self.corrupt_slots,
        }
    }
}
