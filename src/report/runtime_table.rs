//! Flattened per-core runtime view and its CSV/text renderings.

use serde_json::{Map, Value};

use super::NA;
use crate::device::event::{PERF_MAX_NUM_INPUTS, PERF_MAX_NUM_OUTPUTS};

pub const PER_EPOCH_EVENTS: &str = "per-epoch-events";

/// Per-input fields copied from `per-thread-events`, as (runtime key, source key).
const INPUT_FIELDS: &[(&str, &str)] = &[
    ("math-activity", "math-activity"),
    ("pack-runtime", "pack-runtime"),
    (
        "math-utilization-first-unpack-to-last-pack",
        "math-utilization-first-unpack-to-last-pack",
    ),
    ("first-unpack-to-last-pack", "first-unpack-to-last-pack"),
    (
        "first-unpack-to-last-pack-without-wait-for-tile",
        "first-unpack-to-last-pack-without-wait-tile",
    ),
    (
        "total-unpack-wait-for-tile-after-first-unpack",
        "total-unpack-wait-for-tile-after-first-unpack",
    ),
    (
        "total-wait-for-free-tile-after-first-unpack",
        "total-wait-for-free-tile-after-first-unpack",
    ),
    (
        "unpacker-stalled-on-ncrisc-intermediate-dump",
        "unpacker-stalled-on-ncrisc-intermediate-dump",
    ),
    (
        "packer-stalled-on-ncrisc-intermediate-dump",
        "packer-stalled-on-ncrisc-intermediate-dump",
    ),
];

/// Per-core fields copied from `inputs-common-events`.
const CORE_FIELDS: &[&str] = &[
    "average-math-utilization",
    "first-unpack-first-input",
    "first-unpack-last-input",
    "last-pack-last-input",
    "last-pack-first-input",
    "total-runtime",
    "first-input-recorded",
    "last-input-recorded",
    "out-of-memory",
    "num-cycles-per-tensor",
    "num-tensors-per-second",
    "model-math-utilization",
    "model-num-cycles",
];

/// Copied only when present.
const OPTIONAL_FIELDS: &[&str] = &[
    "packer-push-runtime",
    "packer-overlay-decoupled-output-bw",
    "packer-num-tiles",
];

pub const HEADER: [&str; 14] = [
    "core-label",
    "device_id",
    "aiclk",
    "first-and-last-inputs",
    "total-runtime",
    "active-math-cycles-single-input",
    "math-utilization-over-all-inputs",
    "math-utilization-last-input-recorded",
    "runtime-last-input-recorded",
    "num-cycles-per-tensor",
    "num-tensors-per-second",
    "input0-bw",
    "input1-bw",
    "output-bw",
];

fn operand_keys() -> Vec<String> {
    let mut keys = Vec::new();
    let operands = (0..PERF_MAX_NUM_INPUTS)
        .map(|i| format!("input-{i}"))
        .chain((0..PERF_MAX_NUM_OUTPUTS).map(|i| format!("output-{i}")));
    for operand in operands {
        for prefix in [
            "trisc-num-tiles-operand-",
            "trisc-total-tensor-size-operand-",
            "trisc-bw-operand-",
            "brisc-num-tiles-operand-",
            "brisc-pop-num-cycles-operand-",
            "brisc-bw-operand-",
        ] {
            keys.push(format!("{prefix}{operand}"));
        }
    }
    keys
}

/// Flatten the postprocess report into one object per core.
pub fn create_runtime_report(postprocess: &Value) -> Value {
    let mut table = Map::new();
    let Some(cores) = postprocess.as_object() else {
        return Value::Object(table);
    };
    let operand_keys = operand_keys();

    for (label, core) in cores {
        if label == PER_EPOCH_EVENTS {
            table.insert(label.clone(), core.clone());
            continue;
        }

        let mut row = Map::new();
        if let Some(inputs) = core.get("per-thread-events").and_then(Value::as_object) {
            for (input, events) in inputs {
                let mut fields = Map::new();
                for (key, source) in INPUT_FIELDS {
                    let value = events.get(*source).cloned().unwrap_or_else(super::na);
                    fields.insert((*key).to_string(), value);
                }
                row.insert(input.clone(), Value::Object(fields));
            }
        }

        let common = core.get("inputs-common-events");
        let lookup = |key: &str| common.and_then(|c| c.get(key));
        for key in CORE_FIELDS {
            row.insert(
                (*key).to_string(),
                lookup(key).cloned().unwrap_or_else(super::na),
            );
        }
        for key in operand_keys.iter().map(String::as_str).chain(OPTIONAL_FIELDS.iter().copied()) {
            if let Some(value) = lookup(key) {
                row.insert(key.to_string(), value.clone());
            }
        }

        table.insert(label.clone(), Value::Object(row));
    }

    Value::Object(table)
}

/// Render a JSON scalar for a table cell.
pub fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => NA.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) if n.is_f64() => {
            format!("{:.2}", n.as_f64().unwrap_or_default())
        }
        Some(other) => other.to_string(),
    }
}

/// One row per core, in label order. The header is not included.
pub fn runtime_table_rows(runtime_table: &Value) -> Vec<Vec<String>> {
    let Some(cores) = runtime_table.as_object() else {
        return Vec::new();
    };
    let epoch = cores.get(PER_EPOCH_EVENTS);
    let device_id = cell(epoch.and_then(|e| e.get("device-id")));
    let aiclk = cell(epoch.and_then(|e| e.get("AICLK")));

    cores
        .iter()
        .filter(|(label, _)| label.as_str() != PER_EPOCH_EVENTS)
        .map(|(label, core)| {
            let last_input = core
                .get("last-input-recorded")
                .and_then(Value::as_u64)
                .and_then(|last| core.get(format!("input-{last}")));
            let from_last = |key: &str| cell(last_input.and_then(|input| input.get(key)));

            vec![
                label.clone(),
                device_id.clone(),
                aiclk.clone(),
                format!(
                    "{} -> {}",
                    cell(core.get("first-input-recorded")),
                    cell(core.get("last-input-recorded"))
                ),
                cell(core.get("total-runtime")),
                from_last("math-activity"),
                cell(core.get("average-math-utilization")),
                from_last("math-utilization-first-unpack-to-last-pack"),
                from_last("first-unpack-to-last-pack"),
                cell(core.get("num-cycles-per-tensor")),
                cell(core.get("num-tensors-per-second")),
                cell(core.get("trisc-bw-operand-input-0")),
                cell(core.get("trisc-bw-operand-input-1")),
                cell(core.get("trisc-bw-operand-output-0")),
            ]
        })
        .collect()
}

pub fn to_csv(rows: &[Vec<String>]) -> String {
    let mut out = HEADER.join(",");
    out.push('\n');
    for row in rows {
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Aligned plain-text table with a rule under the header and a bar after
/// the first column.
pub fn to_text(rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = HEADER.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, value) in widths.iter_mut().zip(row) {
            *width = (*width).max(value.len());
        }
    }

    let render = |cells: &mut dyn Iterator<Item = &str>| {
        let mut line = String::new();
        for (i, (value, &width)) in cells.zip(&widths).enumerate() {
            match i {
                0 => {}
                1 => line.push_str(" | "),
                _ => line.push_str("  "),
            }
            line.push_str(&format!("{value:<width$}"));
        }
        line.truncate(line.trim_end().len());
        line.push('\n');
        line
    };

    let mut out = render(&mut HEADER.iter().copied());
    let total = widths.iter().sum::<usize>() + 3 + 2 * widths.len().saturating_sub(2);
    out.push_str(&"-".repeat(total));
    out.push('\n');
    for row in rows {
        out.push_str(&render(&mut row.iter().map(String::as_str)));
    }
    out
}
