//! Per-core and per-epoch records assembled from thread records.

pub mod finalize;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::aggregator::AggregateError;
use crate::device::codec::CoreCoord;
use crate::device::event::{ThreadKind, ThreadRecord, NUM_THREADS};
use crate::state::descriptor::{CoreDescriptor, GraphDescriptor};
use crate::state::InstructionMeta;

pub use finalize::finalize_core;

/// Timing window of one input (outer-loop iteration) on one core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OuterLoopWindow {
    /// First block of data available on all operands.
    pub unpack_first: Option<u64>,
    pub pack_first_start: Option<u64>,
    pub pack_last_end: Option<u64>,
    pub wait_for_tile_after_first_unpack: u64,
    pub wait_for_free_tiles_after_first_unpack: u64,
    pub trisc0_stall_on_ncrisc: u64,
    pub trisc2_stall_on_ncrisc: u64,
}

/// All thread records of one core for one epoch, plus derived values.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreRecord {
    pub chip: u8,
    pub core: CoreCoord,
    pub epoch_id: u16,
    pub descriptor: CoreDescriptor,
    pub threads: BTreeMap<ThreadKind, ThreadRecord>,
    pub outer_loops: BTreeMap<u32, OuterLoopWindow>,
    /// Math activity of a single input; identical across inputs.
    pub math_activity: Option<u64>,
    /// Tiles per operand from the unpack/pack threads. Outputs are at `8 + idx`.
    pub trisc_operand_tiles: BTreeMap<u32, u64>,
    /// Tiles per operand from the brisc thread. Outputs are at `8 + idx`.
    pub brisc_operand_tiles: BTreeMap<u32, u64>,
    pub brisc_operand_pop_cycles: BTreeMap<u32, u64>,
    pub packer_num_tiles: u64,
    pub packer_push_runtime: u64,
    pub num_unpack_inputs: usize,
    pub num_pack_inputs: usize,
    pub out_of_memory: bool,
}

impl CoreRecord {
    pub fn new(chip: u8, core: CoreCoord, epoch_id: u16) -> Self {
        Self {
            chip,
            core,
            epoch_id,
            descriptor: CoreDescriptor {
                op_name: String::new(),
                op_type: String::new(),
                physical: core,
                logical: core,
            },
            threads: BTreeMap::new(),
            outer_loops: BTreeMap::new(),
            math_activity: None,
            trisc_operand_tiles: BTreeMap::new(),
            brisc_operand_tiles: BTreeMap::new(),
            brisc_operand_pop_cycles: BTreeMap::new(),
            packer_num_tiles: 0,
            packer_push_runtime: 0,
            num_unpack_inputs: 0,
            num_pack_inputs: 0,
            out_of_memory: false,
        }
    }

    /// Report label: "x-y-opname".
    pub fn label(&self) -> String {
        format!("{}-{}", self.core.label(), self.descriptor.op_name)
    }

    /// Insert a decoded thread. A second record for the same thread is a
    /// protocol violation.
    pub fn insert_thread(&mut self, record: ThreadRecord) -> Result<(), AggregateError> {
        let kind = record.kind;
        if self.threads.contains_key(&kind) {
            return Err(AggregateError::DuplicateThread {
                chip: self.chip,
                x: self.core.x,
                y: self.core.y,
                epoch: self.epoch_id,
                thread: kind,
            });
        }
        self.threads.insert(kind, record);
        Ok(())
    }

    /// All five threads are present.
    pub fn is_complete(&self) -> bool {
        self.threads.len() == NUM_THREADS
    }

    pub fn thread(&self, kind: ThreadKind) -> Option<&ThreadRecord> {
        self.threads.get(&kind)
    }

    /// Smallest and largest recorded input index.
    pub fn first_and_last_recorded_input(&self) -> Option<(u32, u32)> {
        let first = *self.outer_loops.keys().next()?;
        let last = *self.outer_loops.keys().next_back()?;
        Some((first, last))
    }
}

/// Cores whose trace buffer filled up. Once a core runs out of memory its
/// later epochs are flagged too, since the device stops recording for it.
#[derive(Debug, Clone, Default)]
pub struct OutOfMemoryCores {
    cores: HashSet<(u8, CoreCoord)>,
}

impl OutOfMemoryCores {
    /// Remember or inherit the flag of a finalized core. Returns true the
    /// first time a core is seen out of memory.
    pub fn carry(&mut self, core: &mut CoreRecord) -> bool {
        let key = (core.chip, core.core);
        if core.out_of_memory {
            return self.cores.insert(key);
        }
        core.out_of_memory = self.cores.contains(&key);
        false
    }

    pub fn contains(&self, chip: u8, core: CoreCoord) -> bool {
        self.cores.contains(&(chip, core))
    }
}

/// All cores of one executed graph instance.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    /// Position of the instruction in the executed sequence.
    pub epoch_idx: usize,
    pub meta: InstructionMeta,
    pub graph: Arc<GraphDescriptor>,
    pub num_epochs_current_program: u32,
    pub cores: BTreeMap<CoreCoord, CoreRecord>,
}

impl EpochRecord {
    pub fn new(
        epoch_idx: usize,
        meta: InstructionMeta,
        graph: Arc<GraphDescriptor>,
        num_epochs_current_program: u32,
    ) -> Self {
        Self {
            epoch_idx,
            meta,
            graph,
            num_epochs_current_program,
            cores: BTreeMap::new(),
        }
    }

    /// Insert a finalized core. Fails on a duplicate or once the epoch is complete.
    pub fn insert_core(&mut self, core: CoreRecord) -> Result<(), AggregateError> {
        if self.is_complete() {
            return Err(AggregateError::EpochAlreadyComplete {
                epoch_idx: self.epoch_idx,
                x: core.core.x,
                y: core.core.y,
            });
        }
        if self.cores.contains_key(&core.core) {
            return Err(AggregateError::DuplicateCore {
                epoch_idx: self.epoch_idx,
                x: core.core.x,
                y: core.core.y,
            });
        }
        self.cores.insert(core.core, core);
        Ok(())
    }

    pub fn expected_cores(&self) -> usize {
        self.graph.num_active_cores()
    }

    /// Every core the graph declares active has been inserted.
    pub fn is_complete(&self) -> bool {
        self.cores.len() == self.expected_cores()
    }

    pub fn label(&self) -> String {
        format!(
            "{}-{}-{}",
            self.meta.program_name, self.meta.local_epoch_id, self.meta.graph_name
        )
    }
}
