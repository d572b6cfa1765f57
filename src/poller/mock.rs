//! In-memory scratch queues standing in for the device-mapped region.

use parking_lot::Mutex;

use super::{DeviceTransport, RingSlot};
use crate::config::ScratchConfig;
use crate::device::event::{PERF_SCRATCH_EMPTY_ID, PERF_SCRATCH_END_EMPTY_ID};

struct Queues {
    /// One flat buffer per queue.
    words: Vec<Vec<u32>>,
    /// Device-side write pointer per queue, wrapping at twice the slot count.
    device_wr: Vec<u32>,
    /// Last read pointer the host published per queue.
    host_rd: Vec<u32>,
    ptr_writes: Vec<(usize, u32)>,
}

/// Scratch queues backed by host memory. Also plays the device side:
/// [`MemoryTransport::push_dump`] writes a dump the way firmware would.
pub struct MemoryTransport {
    num_slots: usize,
    slot_words: usize,
    queues: Mutex<Queues>,
}

impl MemoryTransport {
    pub fn new(cfg: &ScratchConfig) -> Self {
        let slot_words = cfg.slot_words();
        Self {
            num_slots: cfg.num_slots,
            slot_words,
            queues: Mutex::new(Queues {
                words: vec![vec![0; cfg.num_slots * slot_words]; cfg.num_queues],
                device_wr: vec![0; cfg.num_queues],
                host_rd: vec![0; cfg.num_queues],
                ptr_writes: Vec::new(),
            }),
        }
    }

    fn range(&self, slot: RingSlot) -> std::ops::Range<usize> {
        let start = slot.index * self.slot_words;
        start..start + self.slot_words
    }

    /// Overwrite a slot verbatim, padding or truncating to the slot size.
    pub fn write_slot(&self, slot: RingSlot, words: &[u32]) {
        let range = self.range(slot);
        let mut q = self.queues.lock();
        if let Some(dst) = q.words.get_mut(slot.queue).and_then(|buf| buf.get_mut(range)) {
            let n = words.len().min(dst.len());
            dst[..n].copy_from_slice(&words[..n]);
            dst[n..].fill(0);
        }
    }

    /// Write a dump at the device write pointer. Returns false when the queue
    /// is full or does not exist.
    pub fn push_dump(&self, queue: usize, words: &[u32]) -> bool {
        let wrap = 2 * self.num_slots as u32;
        let (wr, rd) = {
            let q = self.queues.lock();
            match (q.device_wr.get(queue), q.host_rd.get(queue)) {
                (Some(&wr), Some(&rd)) => (wr, rd),
                _ => return false,
            }
        };

        let occupied = (wr + wrap - rd) % wrap;
        if occupied as usize >= self.num_slots {
            return false;
        }

        self.write_slot(
            RingSlot {
                queue,
                index: wr as usize % self.num_slots,
            },
            words,
        );
        let mut q = self.queues.lock();
        if let Some(device_wr) = q.device_wr.get_mut(queue) {
            *device_wr = (wr + 1) % wrap;
        }
        true
    }

    /// Every read pointer published by the host, in order.
    pub fn ptr_writes(&self) -> Vec<(usize, u32)> {
        self.queues.lock().ptr_writes.clone()
    }
}

impl DeviceTransport for MemoryTransport {
    fn peek_slot(&self, slot: RingSlot) -> (u32, u32) {
        let range = self.range(slot);
        let q = self.queues.lock();
        q.words
            .get(slot.queue)
            .and_then(|buf| buf.get(range))
            .map(|words| {
                (
                    words.first().copied().unwrap_or(PERF_SCRATCH_EMPTY_ID),
                    words.last().copied().unwrap_or(PERF_SCRATCH_END_EMPTY_ID),
                )
            })
            .unwrap_or((PERF_SCRATCH_EMPTY_ID, PERF_SCRATCH_END_EMPTY_ID))
    }

    fn read_slot(&self, slot: RingSlot) -> Vec<u32> {
        let range = self.range(slot);
        let q = self.queues.lock();
        q.words
            .get(slot.queue)
            .and_then(|buf| buf.get(range))
            .map(<[u32]>::to_vec)
            .unwrap_or_default()
    }

    fn release_slot(&self, slot: RingSlot) {
        let range = self.range(slot);
        let mut q = self.queues.lock();
        if let Some(words) = q.words.get_mut(slot.queue).and_then(|buf| buf.get_mut(range)) {
            if let Some(first) = words.first_mut() {
                *first = PERF_SCRATCH_EMPTY_ID;
            }
            if let Some(last) = words.last_mut() {
                *last = PERF_SCRATCH_END_EMPTY_ID;
            }
        }
    }

    fn write_ptr(&self, queue: usize, rd_ptr: u32) {
        let mut q = self.queues.lock();
        if let Some(rd) = q.host_rd.get_mut(queue) {
            *rd = rd_ptr;
        }
        q.ptr_writes.push((queue, rd_ptr));
    }
}
