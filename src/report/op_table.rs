//! Op-level rollup across every core running the same op.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tracing::warn;

use super::runtime_table::PER_EPOCH_EVENTS;
use super::{na, or_na, ratio};
use crate::config::PerfConfig;
use crate::device::event::{PERF_MAX_NUM_INPUTS, PERF_MAX_NUM_OUTPUTS};

/// Split a core label "x-y-op" into the core location and the op name.
pub fn parse_op_key(label: &str) -> Option<(String, String)> {
    let mut parts = label.splitn(3, '-');
    let x = parts.next().filter(|s| !s.is_empty())?;
    let y = parts.next().filter(|s| !s.is_empty())?;
    let op = parts.next().filter(|s| !s.is_empty())?;
    Some((format!("{x}-{y}"), op.to_string()))
}

/// First-unpack / last-pack bounds of an op across its cores.
#[derive(Debug, Clone, Copy)]
struct OpWindow {
    first_unpack_first: u64,
    first_unpack_last: u64,
    last_pack_first: u64,
    last_pack_last: u64,
}

impl OpWindow {
    fn of(core: &Value) -> Option<Self> {
        Some(Self {
            first_unpack_first: core.get("first-unpack-first-input")?.as_u64()?,
            first_unpack_last: core.get("first-unpack-last-input")?.as_u64()?,
            last_pack_first: core.get("last-pack-first-input")?.as_u64()?,
            last_pack_last: core.get("last-pack-last-input")?.as_u64()?,
        })
    }

    fn merge(self, other: Self) -> Self {
        Self {
            first_unpack_first: self.first_unpack_first.min(other.first_unpack_first),
            first_unpack_last: self.first_unpack_last.min(other.first_unpack_last),
            last_pack_first: self.last_pack_first.max(other.last_pack_first),
            last_pack_last: self.last_pack_last.max(other.last_pack_last),
        }
    }

    fn runtime(&self) -> u64 {
        self.last_pack_last.wrapping_sub(self.first_unpack_first)
    }
}

#[derive(Debug)]
struct OpRollup {
    cores: Map<String, Value>,
    /// `None` once any core lacks a complete window.
    window: Option<OpWindow>,
    /// `None` once any core lacks math activity.
    math_activity: Option<u64>,
    /// Per-core tensor size by operand key ("input-0", "output-0").
    tensor_sizes: BTreeMap<String, u64>,
    num_cores: u64,
}

impl OpRollup {
    fn new(first_core: &Value) -> Self {
        Self {
            cores: Map::new(),
            window: OpWindow::of(first_core),
            math_activity: Some(0),
            tensor_sizes: BTreeMap::new(),
            num_cores: 0,
        }
    }

    fn add_core(&mut self, op_name: &str, core_loc: String, core: &Value) {
        if self.num_cores > 0 {
            self.window = self.window.zip(OpWindow::of(core)).map(|(a, b)| a.merge(b));
        }

        for operand in operand_keys() {
            let Some(size) = core
                .get(format!("trisc-total-tensor-size-operand-{operand}"))
                .and_then(Value::as_u64)
            else {
                continue;
            };
            match self.tensor_sizes.get(&operand) {
                None => {
                    self.tensor_sizes.insert(operand, size);
                }
                Some(&previous) if previous != size => {
                    warn!(
                        op = op_name,
                        core = %core_loc,
                        operand = %operand,
                        previous,
                        size,
                        "tensor size differs between cores of the same op",
                    );
                }
                Some(_) => {}
            }
        }

        let mut entry = Map::new();
        for (key, source) in [
            ("first-input-recorded", "first-input-recorded"),
            ("last-input-recorded", "last-input-recorded"),
            ("math-utilization-across-inputs", "average-math-utilization"),
            ("runtime-across-inputs", "total-runtime"),
        ] {
            entry.insert(key.to_string(), core.get(source).cloned().unwrap_or_else(na));
        }
        for operand in operand_keys() {
            let key = format!("trisc-bw-operand-{operand}");
            if let Some(bw) = core.get(&key) {
                entry.insert(key, bw.clone());
            }
        }
        self.cores.insert(core_loc, Value::Object(entry));

        let inputs = core
            .get("first-input-recorded")
            .and_then(Value::as_u64)
            .zip(core.get("last-input-recorded").and_then(Value::as_u64));
        let activity = inputs.and_then(|(first, last)| {
            let per_input = core
                .get(format!("input-{first}"))
                .and_then(|input| input.get("math-activity"))
                .and_then(Value::as_u64)?;
            Some(per_input * (last.saturating_sub(first) + 1))
        });
        self.math_activity = self.math_activity.and(activity);
        self.num_cores += 1;
    }

    fn finish(self, op_name: &str, perf: &PerfConfig, aiclk: u32) -> Value {
        let mut report = self.cores;

        let runtime = self.window.map(|w| w.runtime());
        report.insert("runtime-across-cores".to_string(), or_na(runtime));
        let utilization = self
            .math_activity
            .zip(runtime)
            .map(|(activity, runtime)| ratio(100.0 * activity as f64, runtime as f64));
        report.insert(
            "math-utilization-across-cores".to_string(),
            utilization.unwrap_or_else(na),
        );
        report.insert("num-cores".to_string(), json!(self.num_cores));

        if let (Some(w), false) = (self.window, perf.is_op_decoupled(op_name)) {
            report.insert("first-unpack-first-input".to_string(), json!(w.first_unpack_first));
            report.insert("first-unpack-last-input".to_string(), json!(w.first_unpack_last));
            report.insert("last-pack-first-input".to_string(), json!(w.last_pack_first));
            report.insert("last-pack-last-input".to_string(), json!(w.last_pack_last));

            for (operand, size) in &self.tensor_sizes {
                let total = size * self.num_cores;
                report.insert(
                    format!("trisc-total-tensor-size-all-cores-operand-{operand}"),
                    json!(total),
                );
                report.insert(
                    format!("trisc-bw-total-runtime-operand-{operand}"),
                    ratio(total as f64, w.runtime() as f64 / (f64::from(aiclk) / 1000.0)),
                );
            }
        }

        for key in [
            "first-unpack-first-input",
            "first-unpack-last-input",
            "last-pack-first-input",
            "last-pack-last-input",
            "trisc-bw-total-runtime-operand-input-0",
            "trisc-bw-total-runtime-operand-input-1",
            "trisc-bw-total-runtime-operand-output-0",
            "trisc-total-tensor-size-all-cores-operand-input-0",
            "trisc-total-tensor-size-all-cores-operand-input-1",
            "trisc-total-tensor-size-all-cores-operand-output-0",
        ] {
            report.entry(key).or_insert_with(na);
        }

        Value::Object(report)
    }
}

fn operand_keys() -> impl Iterator<Item = String> {
    (0..PERF_MAX_NUM_INPUTS)
        .map(|i| format!("input-{i}"))
        .chain((0..PERF_MAX_NUM_OUTPUTS).map(|i| format!("output-{i}")))
}

/// Build `op_perf_table.json` from the runtime table.
pub fn create_op_report(runtime_table: &Value, perf: &PerfConfig) -> Value {
    let mut rollups: BTreeMap<String, OpRollup> = BTreeMap::new();
    let mut report = Map::new();
    let mut aiclk = 0;

    let Some(cores) = runtime_table.as_object() else {
        return Value::Object(report);
    };

    for (label, core) in cores {
        if label == PER_EPOCH_EVENTS {
            aiclk = core
                .get("AICLK")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0);
            report.insert(
                "epoch-information".to_string(),
                json!({
                    "epoch-global-id": core.get("epoch-global-id").cloned().unwrap_or_else(na),
                    "AICLK": aiclk,
                }),
            );
            continue;
        }

        let Some((core_loc, op_name)) = parse_op_key(label) else {
            warn!(label = %label, "skipping malformed core label in runtime table");
            continue;
        };
        rollups
            .entry(op_name.clone())
            .or_insert_with(|| OpRollup::new(core))
            .add_core(&op_name, core_loc, core);
    }

    for (op_name, rollup) in rollups {
        let value = rollup.finish(&op_name, perf, aiclk);
        report.insert(op_name, value);
    }

    Value::Object(report)
}
