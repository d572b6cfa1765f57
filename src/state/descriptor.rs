//! Read-only run descriptors supplied by the compiler and runtime.
//!
//! A [`RunDescriptor`] bundles everything the postprocessor consumes from
//! its collaborators: graphs with their per-core op placement, programs,
//! the executed instruction sequence, clock frequencies and device clock
//! alignment. It is loaded once from YAML and never mutated.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::DeviceAlignment;
use crate::device::codec::CoreCoord;

/// Metadata of one op.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpDescriptor {
    pub op_type: String,
    #[serde(default)]
    pub input_data_formats: Vec<String>,
    #[serde(default)]
    pub output_data_format: String,
}

/// One physical core assigned to an op.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreAssignment {
    pub x: u8,
    pub y: u8,
    pub op_name: String,
    /// Logical grid position as [x, y]. Default: the physical position.
    #[serde(default)]
    pub logical: Option<[u8; 2]>,
}

/// Placement information for one core, as reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreDescriptor {
    pub op_name: String,
    pub op_type: String,
    pub physical: CoreCoord,
    pub logical: CoreCoord,
}

/// A compiled graph and its placement on one device.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphDescriptor {
    pub name: String,
    #[serde(default)]
    pub target_device: u8,
    #[serde(default = "default_input_count")]
    pub input_count: u32,
    #[serde(default)]
    pub ops: BTreeMap<String, OpDescriptor>,
    #[serde(default)]
    pub cores: Vec<CoreAssignment>,
}

impl GraphDescriptor {
    /// Descriptor of the op running on `core`, if any.
    pub fn core_desc(&self, core: CoreCoord) -> Option<CoreDescriptor> {
        let assignment = self
            .cores
            .iter()
            .find(|c| c.x == core.x && c.y == core.y)?;
        let op_type = self
            .ops
            .get(&assignment.op_name)
            .map(|op| op.op_type.clone())
            .unwrap_or_default();
        let logical = assignment
            .logical
            .map(|[x, y]| CoreCoord::new(x, y))
            .unwrap_or(core);

        Some(CoreDescriptor {
            op_name: assignment.op_name.clone(),
            op_type,
            physical: core,
            logical,
        })
    }

    pub fn is_core_active(&self, core: CoreCoord) -> bool {
        self.cores.iter().any(|c| c.x == core.x && c.y == core.y)
    }

    /// Number of cores that report for one epoch of this graph.
    pub fn num_active_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn op(&self, op_name: &str) -> Option<&OpDescriptor> {
        self.ops.get(op_name)
    }
}

/// Instruction opcodes; only `execute` runs a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Execute,
    Loop,
    EndLoop,
    AllocateQueue,
    DeallocateQueue,
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    #[serde(default)]
    pub graph_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramDescriptor {
    pub name: String,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

/// One run of a program: the program counters it executed, in order.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramRun {
    pub program: String,
    #[serde(default)]
    pub pcs: Vec<usize>,
}

/// Everything the postprocessor reads from the rest of the stack.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunDescriptor {
    #[serde(default)]
    pub graphs: Vec<GraphDescriptor>,
    #[serde(default)]
    pub programs: Vec<ProgramDescriptor>,
    #[serde(default)]
    pub executed: Vec<ProgramRun>,
    /// AICLK in MHz per device id.
    #[serde(default)]
    pub aiclk: BTreeMap<u32, u32>,
    #[serde(default)]
    pub device_alignment: BTreeMap<u32, DeviceAlignment>,
    /// Inputs pushed by the host across the run.
    #[serde(default)]
    pub total_input_count: u64,
}

fn default_input_count() -> u32 {
    1
}

impl RunDescriptor {
    /// Load a run descriptor from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading run descriptor {}", path.display()))?;

        let desc: RunDescriptor = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing run descriptor {}", path.display()))?;

        desc.validate()?;

        Ok(desc)
    }

    /// Cross-reference programs, graphs and the executed sequence.
    pub fn validate(&self) -> Result<()> {
        for graph in &self.graphs {
            for core in &graph.cores {
                if !graph.ops.contains_key(&core.op_name) {
                    bail!(
                        "graph {}: core {}-{} runs unknown op {}",
                        graph.name,
                        core.x,
                        core.y,
                        core.op_name
                    );
                }
            }
        }

        for program in &self.programs {
            for (pc, instr) in program.instructions.iter().enumerate() {
                if instr.opcode == Opcode::Execute && self.graph(&instr.graph_name).is_none() {
                    bail!(
                        "program {} pc {pc}: unknown graph {}",
                        program.name,
                        instr.graph_name
                    );
                }
            }
        }

        for run in &self.executed {
            let Some(program) = self.programs.iter().find(|p| p.name == run.program) else {
                bail!("executed program {} is not declared", run.program);
            };
            if let Some(pc) = run.pcs.iter().find(|pc| **pc >= program.instructions.len()) {
                bail!("executed program {}: pc {pc} out of range", run.program);
            }
        }

        Ok(())
    }

    pub fn graph(&self, name: &str) -> Option<&GraphDescriptor> {
        self.graphs.iter().find(|g| g.name == name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
graphs:
  - name: graph0
    target_device: 0
    input_count: 4
    ops:
      matmul0: { op_type: matmul, input_data_formats: [Bfp8_b, Bfp8_b], output_data_format: Float16_b }
    cores:
      - { x: 1, y: 1, op_name: matmul0, logical: [0, 0] }
      - { x: 2, y: 1, op_name: matmul0 }
programs:
  - name: program0
    instructions:
      - { opcode: loop }
      - { opcode: execute, graph_name: graph0 }
      - { opcode: end_loop }
executed:
  - { program: program0, pcs: [0, 1, 1, 2] }
aiclk: { 0: 1000 }
device_alignment:
  0: { device_start_cycle: 0, device_end_cycle: 1000, host_start_ns: 0, host_end_ns: 1000000 }
total_input_count: 8
"#;

    #[test]
    fn test_parse_sample() {
        let desc: RunDescriptor = serde_yaml::from_str(SAMPLE).expect("parse");
        desc.validate().expect("valid");

        let graph = desc.graph("graph0").expect("graph");
        assert_eq!(graph.num_active_cores(), 2);
        let core = graph.core_desc(CoreCoord::new(2, 1)).expect("core");
        assert_eq!(core.op_name, "matmul0");
        assert_eq!(core.op_type, "matmul");
        assert_eq!(core.logical, CoreCoord::new(2, 1));
        assert_eq!(
            graph.core_desc(CoreCoord::new(1, 1)).expect("core").logical,
            CoreCoord::new(0, 0)
        );
        assert!(graph.core_desc(CoreCoord::new(5, 5)).is_none());
        assert_eq!(desc.aiclk.get(&0), Some(&1000));
        assert_eq!(desc.executed[0].pcs, vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_validation_unknown_graph() {
        let mut desc: RunDescriptor = serde_yaml::from_str(SAMPLE).expect("parse");
        desc.programs[0].instructions[1].graph_name = "missing".to_string();
        let err = desc.validate().unwrap_err();
        assert!(err.to_string().contains("unknown graph missing"));
    }

    #[test]
    fn test_validation_pc_out_of_range() {
        let mut desc: RunDescriptor = serde_yaml::from_str(SAMPLE).expect("parse");
        desc.executed[0].pcs.push(9);
        let err = desc.validate().unwrap_err();
        assert!(err.to_string().contains("pc 9 out of range"));
    }

    #[test]
    fn test_validation_unknown_op() {
        let mut desc: RunDescriptor = serde_yaml::from_str(SAMPLE).expect("parse");
        desc.graphs[0].cores[0].op_name = "nope".to_string();
        let err = desc.validate().unwrap_err();
        assert!(err.to_string().contains("unknown op nope"));
    }
}
