pub mod descriptor;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{ClockAligner, DeviceAlignment};
use crate::config::{DumpMode, PerfConfig};
use crate::device::codec::{CoreCoord, DumpHeader};

use self::descriptor::{CoreDescriptor, GraphDescriptor, Instruction, Opcode, RunDescriptor};

/// Errors returned by registry lookups.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("program {name} was not initialized")]
    UnknownProgram { name: String },

    #[error("program {name}: pc {pc} out of range")]
    PcOutOfRange { name: String, pc: usize },

    #[error("graph {name} is not registered")]
    UnknownGraph { name: String },

    #[error("epoch {epoch} for core {x}-{y} on chip {chip} was not executed")]
    EpochNotFound { chip: u8, x: u8, y: u8, epoch: u16 },
}

/// Throughput figures derived while reporting one epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpochThroughput {
    pub first_input_recorded: Option<u32>,
    pub last_input_recorded: Option<u32>,
    pub first_unpack_first_input: Option<u64>,
    pub last_pack_first_input: Option<u64>,
    pub last_pack_last_input: Option<u64>,
    pub num_cycles_per_input: Option<f64>,
    pub num_inputs_per_second: Option<f64>,
    pub last_input_execution_cycles: Option<u64>,
    pub steady_state_first_input: Option<u32>,
    pub steady_state_last_input: Option<u32>,
    pub steady_state_num_cycles_per_input: Option<f64>,
    pub steady_state_num_inputs_per_second: Option<f64>,
    /// Longest epoch-queue-empty window across the epoch's cores.
    pub largest_wait_for_epoch_binary_cycles: u64,
}

/// One executed (program, graph) instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionMeta {
    pub program_id: u32,
    pub program_name: String,
    pub graph_name: String,
    pub local_epoch_id: u32,
    pub global_epoch_id: u32,
    pub device_id: u8,
    pub aiclk: u32,
    pub input_count: u32,
    pub output_dir: PathBuf,
    pub throughput: EpochThroughput,
}

#[derive(Default)]
struct Inner {
    perf: PerfConfig,
    output_root: PathBuf,
    perf_check_passed: bool,
    postprocessor_executed: bool,
    graphs: HashMap<String, Arc<GraphDescriptor>>,
    programs: HashMap<String, Vec<Instruction>>,
    aiclk: BTreeMap<u32, u32>,
    alignment: ClockAligner,
    total_input_count: u64,
    next_program_id: u32,
    program_id: u32,
    local_epoch_id: u32,
    global_epoch_id: u32,
    executed: Vec<InstructionMeta>,
    epochs_per_program: BTreeMap<u32, u32>,
    all_epochs_info: Vec<InstructionMeta>,
}

/// Thread-safe registry consulted by every pipeline stage.
///
/// Every accessor takes the same re-entrant lock, so a caller holding it
/// for a compound update can still call through the public API.
pub struct PerfState {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl PerfState {
    pub fn new(perf: PerfConfig, output_root: impl Into<PathBuf>) -> Self {
        let inner = Inner {
            perf,
            output_root: output_root.into(),
            perf_check_passed: true,
            ..Default::default()
        };
        Self {
            inner: ReentrantMutex::new(RefCell::new(inner)),
        }
    }

    /// Build a registry from a run descriptor, replaying its executed sequence.
    pub fn from_descriptor(
        desc: &RunDescriptor,
        perf: PerfConfig,
        output_root: impl Into<PathBuf>,
    ) -> Result<Self, StateError> {
        let state = Self::new(perf, output_root);

        for graph in &desc.graphs {
            state.update_graph(graph.clone());
        }
        for (&device, &aiclk) in &desc.aiclk {
            state.update_chip_aiclk(device, aiclk);
        }
        for (&device, alignment) in &desc.device_alignment {
            state.update_device_alignment(device, *alignment);
        }
        state.update_total_input_count(desc.total_input_count);

        for run in &desc.executed {
            let instructions = desc
                .programs
                .iter()
                .find(|p| p.name == run.program)
                .map(|p| p.instructions.clone())
                .ok_or_else(|| StateError::UnknownProgram {
                    name: run.program.clone(),
                })?;
            state.initialize_for_program(&run.program, instructions);
            for &pc in &run.pcs {
                state.update_executed_instr(&run.program, pc)?;
            }
        }

        Ok(state)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        f(&mut inner)
    }

    // --- Setters ---

    pub fn update_test_output_dir(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.with(|s| s.output_root = dir);
    }

    /// AND the result of one check into the run-level result.
    pub fn update_perf_check(&self, passed: bool) {
        self.with(|s| s.perf_check_passed &= passed);
    }

    pub fn update_graph(&self, graph: GraphDescriptor) {
        self.with(|s| {
            s.graphs.insert(graph.name.clone(), Arc::new(graph));
        });
    }

    pub fn update_chip_aiclk(&self, device: u32, aiclk_mhz: u32) {
        self.with(|s| {
            s.aiclk.insert(device, aiclk_mhz);
        });
    }

    pub fn update_device_alignment(&self, device: u32, alignment: DeviceAlignment) {
        self.with(|s| s.alignment.insert(device, alignment));
    }

    pub fn update_device_alignment_start(&self, device: u32, cycle: u64, host_ns: u64) {
        self.with(|s| {
            let mut a = s.alignment.get(device).copied().unwrap_or_default();
            a.device_start_cycle = cycle;
            a.host_start_ns = host_ns;
            s.alignment.insert(device, a);
        });
    }

    pub fn update_device_alignment_end(&self, device: u32, cycle: u64, host_ns: u64) {
        self.with(|s| {
            let mut a = s.alignment.get(device).copied().unwrap_or_default();
            a.device_end_cycle = cycle;
            a.host_end_ns = host_ns;
            s.alignment.insert(device, a);
        });
    }

    pub fn set_config(&self, perf: PerfConfig) {
        self.with(|s| s.perf = perf);
    }

    pub fn update_total_input_count(&self, count: u64) {
        self.with(|s| s.total_input_count = count);
    }

    pub fn set_postprocessor_executed(&self) {
        self.with(|s| s.postprocessor_executed = true);
    }

    /// Start a new program run. Instructions are registered once per name.
    pub fn initialize_for_program(&self, name: &str, instructions: Vec<Instruction>) {
        self.with(|s| {
            s.program_id = s.next_program_id;
            s.next_program_id += 1;
            s.local_epoch_id = 0;

            if s.programs.contains_key(name) {
                warn!(program = name, "program already initialized, keeping its instructions");
                return;
            }
            debug!(program = name, program_id = s.program_id, "initializing program");
            s.programs.insert(name.to_string(), instructions);
        });
    }

    /// Record one executed instruction. Non-execute instructions are ignored.
    pub fn update_executed_instr(&self, program: &str, pc: usize) -> Result<(), StateError> {
        self.with(|s| {
            let instructions = s
                .programs
                .get(program)
                .ok_or_else(|| StateError::UnknownProgram {
                    name: program.to_string(),
                })?;
            let instr = instructions.get(pc).ok_or_else(|| StateError::PcOutOfRange {
                name: program.to_string(),
                pc,
            })?;
            if instr.opcode != Opcode::Execute {
                return Ok(());
            }

            let graph_name = instr.graph_name.clone();
            if !perf_enabled(&s.perf, &graph_name) {
                s.global_epoch_id += 1;
                s.local_epoch_id += 1;
                return Ok(());
            }

            let graph = s
                .graphs
                .get(&graph_name)
                .cloned()
                .ok_or_else(|| StateError::UnknownGraph {
                    name: graph_name.clone(),
                })?;

            let device_id = graph.target_device;
            let output_dir = s
                .output_root
                .join("device")
                .join(format!("{}-{}", s.program_id, program))
                .join(format!("{}-{}", s.global_epoch_id, graph_name));

            debug!(
                program,
                graph = %graph_name,
                local_epoch_id = s.local_epoch_id,
                global_epoch_id = s.global_epoch_id,
                "recording executed instruction",
            );

            s.executed.push(InstructionMeta {
                program_id: s.program_id,
                program_name: program.to_string(),
                graph_name,
                local_epoch_id: s.local_epoch_id,
                global_epoch_id: s.global_epoch_id,
                device_id,
                aiclk: s.aiclk.get(&u32::from(device_id)).copied().unwrap_or(0),
                input_count: graph.input_count,
                output_dir,
                throughput: EpochThroughput::default(),
            });
            s.global_epoch_id += 1;
            s.local_epoch_id += 1;
            *s.epochs_per_program.entry(s.program_id).or_default() += 1;

            Ok(())
        })
    }

    /// Store the final metadata of a reported epoch for run-level summaries.
    pub fn update_all_epochs_info(&self, meta: InstructionMeta) {
        self.with(|s| s.all_epochs_info.push(meta));
    }

    // --- Getters ---

    pub fn get_config(&self) -> PerfConfig {
        self.with(|s| s.perf.clone())
    }

    pub fn get_output_root(&self) -> PathBuf {
        self.with(|s| s.output_root.clone())
    }

    pub fn get_perf_check(&self) -> bool {
        self.with(|s| s.perf_check_passed)
    }

    pub fn is_postprocessor_executed(&self) -> bool {
        self.with(|s| s.postprocessor_executed)
    }

    pub fn get_graph(&self, name: &str) -> Result<Arc<GraphDescriptor>, StateError> {
        self.with(|s| {
            s.graphs.get(name).cloned().ok_or_else(|| StateError::UnknownGraph {
                name: name.to_string(),
            })
        })
    }

    pub fn get_core_desc(&self, graph: &str, core: CoreCoord) -> Option<CoreDescriptor> {
        self.with(|s| s.graphs.get(graph).and_then(|g| g.core_desc(core)))
    }

    /// AICLK in MHz, or 0 when unknown.
    pub fn get_aiclk(&self, device: u32) -> u32 {
        self.with(|s| s.aiclk.get(&device).copied().unwrap_or(0))
    }

    pub fn get_device_alignment(&self) -> ClockAligner {
        self.with(|s| s.alignment.clone())
    }

    pub fn get_total_input_count(&self) -> u64 {
        self.with(|s| s.total_input_count)
    }

    pub fn get_num_instructions_executed(&self, program_id: u32) -> u32 {
        self.with(|s| s.epochs_per_program.get(&program_id).copied().unwrap_or(0))
    }

    pub fn get_executed_instr(&self) -> Vec<InstructionMeta> {
        self.with(|s| s.executed.clone())
    }

    pub fn get_all_epochs_info(&self) -> Vec<InstructionMeta> {
        self.with(|s| s.all_epochs_info.clone())
    }

    pub fn is_perf_enabled_for_graph(&self, graph: &str) -> bool {
        self.with(|s| perf_enabled(&s.perf, graph))
    }

    /// Resolve the executed instruction a device dump belongs to.
    ///
    /// The device numbers epochs per core, counting only epochs in which the
    /// core was active on its chip. Returns the instruction's position in the
    /// executed sequence, which keys the epoch for the rest of the pipeline.
    pub fn get_global_epoch_idx_and_instr_for_core(
        &self,
        header: &DumpHeader,
    ) -> Result<(usize, InstructionMeta), StateError> {
        self.with(|s| {
            let core = header.core();
            let mut active_idx: u32 = 0;

            for (idx, instr) in s.executed.iter().enumerate() {
                let Some(graph) = s.graphs.get(&instr.graph_name) else {
                    continue;
                };
                if graph.target_device != header.chip_id || !graph.is_core_active(core) {
                    continue;
                }
                if active_idx == u32::from(header.epoch_id) {
                    return Ok((idx, instr.clone()));
                }
                active_idx += 1;
            }

            Err(StateError::EpochNotFound {
                chip: header.chip_id,
                x: header.x,
                y: header.y,
                epoch: header.epoch_id,
            })
        })
    }

    /// Directory for host-side reports.
    pub fn host_output_dir(&self) -> PathBuf {
        self.with(|s| Path::new(&s.output_root).join("host"))
    }
}

fn perf_enabled(perf: &PerfConfig, graph: &str) -> bool {
    perf.dump_mode != DumpMode::Disable
        && (perf.target_epochs.is_empty() || perf.target_epochs.iter().any(|g| g == graph))
}
