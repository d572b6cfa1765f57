//! The per-epoch event report (`perf_postprocess.json`).

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::{na, or_na, ratio, tile_size, CycleRebias};
use crate::config::PerfConfig;
use crate::device::codec::{self, CoreCoord, TriscEventId};
use crate::device::event::{
    Event, NcriscEventType, ThreadKind, ThreadRecord, TriscEventType, PERF_MAX_NUM_INPUTS,
};
use crate::record::{CoreRecord, EpochRecord};
use crate::state::descriptor::{GraphDescriptor, OpDescriptor};
use crate::state::{EpochThroughput, InstructionMeta};

/// Postprocess JSON plus the epoch throughput derived while building it.
#[derive(Debug, Clone)]
pub struct PostprocessReport {
    pub report: Value,
    pub throughput: EpochThroughput,
}

/// Cross-core state collected while walking the cores of one epoch.
#[derive(Debug, Default)]
struct EpochWindows {
    /// Latest aligned pack end per input, with the core that produced it.
    last_pack: BTreeMap<u32, (CoreCoord, u64)>,
    /// Earliest aligned first unpack per input.
    first_unpack: BTreeMap<u32, (CoreCoord, u64)>,
    longest_op: BTreeMap<u32, (String, u64)>,
    largest_wait_for_epoch_binary: u64,
}

impl EpochWindows {
    fn observe(&mut self, core: &CoreRecord, rebias: CycleRebias) {
        for (&input, window) in &core.outer_loops {
            if let Some(end) = window.pack_last_end.map(|v| rebias.cycle(v)) {
                let entry = self.last_pack.entry(input).or_insert((core.core, end));
                if end > entry.1 {
                    *entry = (core.core, end);
                }
            }
            if let Some(start) = window.unpack_first.map(|v| rebias.cycle(v)) {
                let entry = self.first_unpack.entry(input).or_insert((core.core, start));
                if start < entry.1 {
                    *entry = (core.core, start);
                }
            }
        }

        let epoch_q_empty = core.thread(ThreadKind::Ncrisc).and_then(|ncrisc| {
            ncrisc
                .events
                .iter()
                .find(|&(&id, _)| NcriscEventType::from_id(id as u32) == Some(NcriscEventType::EpochQEmpty))
                .and_then(|(_, events)| events.first())
                .and_then(Event::diff)
        });
        if let Some(wait) = epoch_q_empty {
            self.largest_wait_for_epoch_binary = self.largest_wait_for_epoch_binary.max(wait);
        }
    }

    fn update_longest_op(&mut self, input: u32, op_name: &str, runtime: u64) {
        match self.longest_op.get(&input) {
            Some((_, longest)) if *longest >= runtime => {}
            _ => {
                self.longest_op.insert(input, (op_name.to_string(), runtime));
            }
        }
    }
}

/// Build the postprocess report of one epoch.
pub fn create_postprocess_report(
    epoch: &EpochRecord,
    perf: &PerfConfig,
    rebias: CycleRebias,
) -> PostprocessReport {
    let mut report = Map::new();
    let mut windows = EpochWindows::default();

    for core in epoch.cores.values() {
        let mut threads = Map::new();
        for (kind, record) in &core.threads {
            threads.insert(kind.as_str().to_string(), thread_events(record, rebias));
        }
        threads.insert(
            "per-thread-events".to_string(),
            per_thread_events(core, perf, rebias, &mut windows),
        );
        threads.insert(
            "inputs-common-events".to_string(),
            inputs_common_events(core, &epoch.graph, &epoch.meta, perf, rebias),
        );
        windows.observe(core, rebias);
        report.insert(core.label(), Value::Object(threads));
    }

    let (per_epoch, throughput) = per_epoch_events(&windows, &epoch.meta, perf);
    report.insert("per-epoch-events".to_string(), per_epoch);

    PostprocessReport {
        report: Value::Object(report),
        throughput,
    }
}

// ---------------------------------------------------------------------------
// Thread event maps
// ---------------------------------------------------------------------------

fn thread_events(record: &ThreadRecord, rebias: CycleRebias) -> Value {
    let mut events = Map::new();
    for (&id, list) in &record.events {
        let Some(head) = list.first() else {
            continue;
        };
        let value = match record.kind {
            ThreadKind::Math => math_events(list),
            ThreadKind::Ncrisc => ncrisc_events(id, list, rebias),
            kind if codec::is_single_value(id as u32, kind) => {
                single_value_events(id, kind, list, rebias)
            }
            _ => paired_events(list, rebias, "start", "end"),
        };
        events.insert(head.description.clone(), value);
    }
    let oom = if record.out_of_memory { "true" } else { "false" };
    events.insert("out-of-memory".to_string(), json!(oom));
    Value::Object(events)
}

fn aligned(value: Option<u64>, rebias: CycleRebias) -> Value {
    or_na(value.map(|v| rebias.cycle(v)))
}

fn paired_events(list: &[Event], rebias: CycleRebias, first_key: &str, second_key: &str) -> Value {
    let firsts: Vec<Value> = list.iter().map(|e| aligned(e.first, rebias)).collect();
    let seconds: Vec<Value> = list.iter().map(|e| aligned(e.second, rebias)).collect();
    let diffs: Vec<Value> = list
        .iter()
        .map(|e| match (e.first, e.second) {
            (Some(first), Some(second)) => json!(rebias.cycle(second).wrapping_sub(rebias.cycle(first))),
            _ => na(),
        })
        .collect();

    let mut map = Map::new();
    map.insert(first_key.to_string(), Value::Array(firsts));
    map.insert(second_key.to_string(), Value::Array(seconds));
    map.insert("diff".to_string(), Value::Array(diffs));
    Value::Object(map)
}

fn math_events(list: &[Event]) -> Value {
    let periods: Vec<Value> = list.iter().map(|e| or_na(e.first)).collect();
    let activity: Vec<Value> = list.iter().map(|e| or_na(e.second)).collect();
    let utilization: Vec<Value> = list
        .iter()
        .map(|e| {
            let period = e.first.unwrap_or(0);
            if period == 0 {
                json!(0.0)
            } else {
                json!(e.second.unwrap_or(0) as f64 / period as f64)
            }
        })
        .collect();
    json!({
        "total-period": periods,
        "math-activity": activity,
        "math-utilization": utilization,
    })
}

fn single_value_events(id: u64, kind: ThreadKind, list: &[Event], rebias: CycleRebias) -> Value {
    // Tile counts are not timestamps.
    let is_count = kind == ThreadKind::Brisc
        || matches!(
            TriscEventId::decode(id as u32).kind(),
            Some(
                TriscEventType::NumTilesUnpack
                    | TriscEventType::NumTilesPack
                    | TriscEventType::OutputNumTiles
            )
        );
    let values: Vec<Value> = list
        .iter()
        .map(|e| {
            if is_count {
                or_na(e.first)
            } else {
                aligned(e.first, rebias)
            }
        })
        .collect();
    json!({ "value": values })
}

fn ncrisc_events(id: u64, list: &[Event], rebias: CycleRebias) -> Value {
    match NcriscEventType::from_id(id as u32) {
        Some(NcriscEventType::DramReadIssued) => {
            paired_events(list, rebias, "chunk-read-issued", "tiles-flushed")
        }
        Some(NcriscEventType::DramIoQStatus) => paired_events(list, rebias, "q-available", "q-empty"),
        Some(NcriscEventType::StreamBufStatus) => {
            paired_events(list, rebias, "buf-available", "buf-full")
        }
        Some(NcriscEventType::EpochQEmpty) => paired_events(list, rebias, "q-empty", "q-available"),
        Some(NcriscEventType::StreamMiscInfo) => {
            let times: Vec<Value> = list.iter().map(|e| aligned(e.first, rebias)).collect();
            let data: Vec<Value> = list.iter().map(|e| or_na(e.second)).collect();
            json!({ "time": times, "data": data })
        }
        Some(NcriscEventType::StreamInfo) => {
            let Some(info) = list.first() else {
                return Value::Object(Map::new());
            };
            let extra = |i: usize| or_na(info.extras.get(i).copied());
            json!({
                "flags": or_na(info.first),
                "epoch-iterations-remaining": or_na(info.second),
                "epoch-q-slots-remaining": extra(0),
                "q-slot-size-tiles": extra(1),
                "data-chunk-size-tiles": extra(2),
                "data-chunk-size-bytes": extra(3),
            })
        }
        _ => paired_events(list, rebias, "start", "end"),
    }
}

// ---------------------------------------------------------------------------
// Per-input events
// ---------------------------------------------------------------------------

/// Runtime-derived values are meaningless for decoupled or overflowed cores.
fn is_measurable(core: &CoreRecord, perf: &PerfConfig) -> bool {
    !perf.is_op_decoupled(&core.descriptor.op_name) && !core.out_of_memory
}

fn per_thread_events(
    core: &CoreRecord,
    perf: &PerfConfig,
    rebias: CycleRebias,
    windows: &mut EpochWindows,
) -> Value {
    let measurable = is_measurable(core, perf);
    let record_waits = perf.records_stalls() && perf.dump_level > 0;
    let mut inputs = Map::new();

    for (&input, window) in &core.outer_loops {
        let mut events = Map::new();
        events.insert(
            "unpack-first-block-data-available".to_string(),
            aligned(window.unpack_first, rebias),
        );
        events.insert("pack-start-outer-loop".to_string(), aligned(window.pack_first_start, rebias));
        events.insert("pack-end-outer-loop".to_string(), aligned(window.pack_last_end, rebias));

        let (wait_tile, wait_free) = if record_waits {
            (
                json!(window.wait_for_tile_after_first_unpack),
                json!(window.wait_for_free_tiles_after_first_unpack),
            )
        } else {
            (na(), na())
        };
        events.insert("total-unpack-wait-for-tile-after-first-unpack".to_string(), wait_tile);
        events.insert("total-wait-for-free-tile-after-first-unpack".to_string(), wait_free);

        let (unpack_stall, pack_stall) = if perf.records_stalls() {
            (json!(window.trisc0_stall_on_ncrisc), json!(window.trisc2_stall_on_ncrisc))
        } else {
            (na(), na())
        };
        events.insert("unpacker-stalled-on-ncrisc-intermediate-dump".to_string(), unpack_stall);
        events.insert("packer-stalled-on-ncrisc-intermediate-dump".to_string(), pack_stall);

        if let (Some(unpack), Some(pack_end), true) = (window.unpack_first, window.pack_last_end, measurable) {
            if pack_end >= unpack {
                let runtime = pack_end - unpack;
                events.insert("first-unpack-to-last-pack".to_string(), json!(runtime));
                windows.update_longest_op(input, &core.descriptor.op_name, runtime);

                let wait = window.wait_for_tile_after_first_unpack;
                let without_wait = (wait > 0 && runtime >= wait).then(|| runtime - wait);
                if let Some(without_wait) = without_wait {
                    events.insert(
                        "first-unpack-to-last-pack-without-wait-tile".to_string(),
                        json!(without_wait),
                    );
                }
                if let Some(activity) = core.math_activity {
                    events.insert(
                        "math-utilization-first-unpack-to-last-pack".to_string(),
                        ratio(activity as f64 * 100.0, runtime as f64),
                    );
                    if let Some(without_wait) = without_wait {
                        events.insert(
                            "math-utilization-first-unpack-to-last-pack-without-wait-tile".to_string(),
                            ratio(activity as f64 * 100.0, without_wait as f64),
                        );
                    }
                }
            } else {
                events.insert("first-unpack-to-last-pack".to_string(), json!("Invalid Runtime Value"));
            }
        }

        if let (Some(start), Some(end)) = (window.pack_first_start, window.pack_last_end) {
            events.insert(
                "pack-runtime".to_string(),
                json!(rebias.cycle(end).wrapping_sub(rebias.cycle(start))),
            );
        }
        if let Some(activity) = core.math_activity {
            events.insert("math-activity".to_string(), json!(activity));
        }

        for key in [
            "first-unpack-to-last-pack",
            "first-unpack-to-last-pack-without-wait-tile",
            "pack-runtime",
            "math-utilization-first-unpack-to-last-pack",
            "math-utilization-first-unpack-to-last-pack-without-wait-tile",
            "math-utilization-over-math-thread",
            "total-unpack-wait-for-tile-after-first-unpack",
            "math-activity",
        ] {
            events.entry(key).or_insert_with(na);
        }

        inputs.insert(format!("input-{input}"), Value::Object(events));
    }

    Value::Object(inputs)
}

// ---------------------------------------------------------------------------
// Per-core common events
// ---------------------------------------------------------------------------

/// Aligned first/last input window of one core.
struct CoreWindow {
    first: u32,
    last: u32,
    first_unpack_first: u64,
    first_unpack_last: Option<u64>,
    last_pack_first: u64,
    last_pack_last: u64,
}

impl CoreWindow {
    fn of(core: &CoreRecord, rebias: CycleRebias) -> Option<Self> {
        let (first, last) = core.first_and_last_recorded_input()?;
        let first_window = core.outer_loops.get(&first)?;
        let last_window = core.outer_loops.get(&last)?;
        Some(Self {
            first,
            last,
            first_unpack_first: rebias.cycle(first_window.unpack_first?),
            first_unpack_last: last_window.unpack_first.map(|v| rebias.cycle(v)),
            last_pack_first: rebias.cycle(first_window.pack_last_end?),
            last_pack_last: rebias.cycle(last_window.pack_last_end?),
        })
    }

    fn num_inputs(&self) -> u64 {
        u64::from(self.last - self.first) + 1
    }

    fn total_runtime(&self) -> u64 {
        self.last_pack_last.wrapping_sub(self.first_unpack_first)
    }
}

/// Report key ("input-N" / "output-N") and tile size of an operand. Outputs
/// are indexed from `PERF_MAX_NUM_INPUTS`.
fn operand_tile(op: &OpDescriptor, operand: u32, quiet: bool) -> Option<(String, u64)> {
    let (key, format) = if operand < PERF_MAX_NUM_INPUTS {
        (
            format!("input-{operand}"),
            op.input_data_formats.get(operand as usize).map(String::as_str),
        )
    } else {
        (
            format!("output-{}", operand - PERF_MAX_NUM_INPUTS),
            Some(op.output_data_format.as_str()),
        )
    };
    match format.and_then(tile_size) {
        Some(size) => Some((key, size)),
        None => {
            crate::perf_warn!(
                quiet,
                operand = %key,
                format = format.unwrap_or(""),
                "unknown data format for operand, skipping bandwidth",
            );
            None
        }
    }
}

fn cycles_to_bw(bytes: f64, cycles: u64, aiclk: u32) -> Value {
    ratio(bytes, cycles as f64 / (f64::from(aiclk) / 1000.0))
}

fn inputs_common_events(
    core: &CoreRecord,
    graph: &GraphDescriptor,
    meta: &InstructionMeta,
    perf: &PerfConfig,
    rebias: CycleRebias,
) -> Value {
    let quiet = perf.quiet();
    let measurable = is_measurable(core, perf);
    let op = graph.op(&core.descriptor.op_name);
    if op.is_none() {
        crate::perf_warn!(
            quiet,
            core = %core.label(),
            op = %core.descriptor.op_name,
            "op missing from graph, skipping operand sizes",
        );
    }

    let mut common = Map::new();
    common.insert("op-type".to_string(), json!(core.descriptor.op_type));
    common.insert("out-of-memory".to_string(), json!(core.out_of_memory));

    let window = CoreWindow::of(core, rebias);
    let total_math = window
        .as_ref()
        .zip(core.math_activity)
        .map(|(w, activity)| w.num_inputs() * activity);

    match &window {
        Some(w) => {
            common.insert("first-input-recorded".to_string(), json!(w.first));
            common.insert("last-input-recorded".to_string(), json!(w.last));
            common.insert("first-unpack-first-input".to_string(), json!(w.first_unpack_first));
            common.insert("first-unpack-last-input".to_string(), or_na(w.first_unpack_last));
            common.insert("last-pack-last-input".to_string(), json!(w.last_pack_last));
            common.insert("last-pack-first-input".to_string(), json!(w.last_pack_first));

            for (&operand, &tiles) in &core.trisc_operand_tiles {
                let Some((key, tile)) = op.and_then(|op| operand_tile(op, operand, quiet)) else {
                    continue;
                };
                let runtime = if operand < PERF_MAX_NUM_INPUTS {
                    w.first_unpack_last
                        .and_then(|last| last.checked_sub(w.first_unpack_first))
                } else {
                    w.last_pack_last.checked_sub(w.last_pack_first)
                };
                common.insert(format!("trisc-num-tiles-operand-{key}"), json!(tiles));
                common.insert(
                    format!("trisc-total-tensor-size-operand-{key}"),
                    json!(tiles * tile * w.num_inputs()),
                );
                if let Some(runtime) = runtime.filter(|&r| r > 0 && w.last > w.first) {
                    let bytes = (tiles * tile * u64::from(w.last - w.first)) as f64;
                    common.insert(
                        format!("trisc-bw-operand-{key}"),
                        cycles_to_bw(bytes, runtime, meta.aiclk),
                    );
                }
            }
        }
        None => {
            for key in [
                "first-input-recorded",
                "last-input-recorded",
                "first-unpack-first-input",
                "first-unpack-last-input",
                "last-pack-last-input",
                "last-pack-first-input",
            ] {
                common.insert(key.to_string(), na());
            }
        }
    }

    let measured = window.as_ref().filter(|_| measurable);
    match measured {
        Some(w) => {
            common.insert("total-runtime".to_string(), json!(w.total_runtime()));
            if w.last > w.first {
                let cycles = w.last_pack_last.wrapping_sub(w.last_pack_first) as f64
                    / f64::from(w.last - w.first);
                common.insert("num-cycles-per-tensor".to_string(), json!(cycles));
                common.insert(
                    "num-tensors-per-second".to_string(),
                    ratio(f64::from(meta.aiclk) * 1e6, cycles),
                );
            }
        }
        None => {
            common.insert("total-runtime".to_string(), na());
        }
    }

    for key in [
        "num-cycles-per-tensor",
        "num-tensors-per-second",
        "model-num-cycles",
        "model-math-utilization",
        "trisc-num-tiles-operand-input-0",
        "trisc-num-tiles-operand-input-1",
        "trisc-num-tiles-operand-output-0",
        "trisc-total-tensor-size-operand-input-0",
        "trisc-total-tensor-size-operand-input-1",
        "trisc-total-tensor-size-operand-output-0",
        "trisc-bw-operand-input-0",
        "trisc-bw-operand-input-1",
        "trisc-bw-operand-output-0",
    ] {
        common.entry(key).or_insert_with(na);
    }

    let utilization = measured
        .zip(total_math)
        .map(|(w, total)| ratio(total as f64 * 100.0, w.total_runtime() as f64));
    common.insert(
        "average-math-utilization".to_string(),
        utilization.unwrap_or_else(na),
    );

    for (&operand, &tiles) in &core.brisc_operand_tiles {
        let Some(&pop_cycles) = core.brisc_operand_pop_cycles.get(&operand) else {
            crate::perf_warn!(
                quiet,
                core = %core.label(),
                operand,
                "tile pop cycles not recorded for operand",
            );
            continue;
        };
        let Some((key, tile)) = op.and_then(|op| operand_tile(op, operand, quiet)) else {
            continue;
        };
        common.insert(format!("brisc-num-tiles-operand-{key}"), json!(tiles));
        common.insert(format!("brisc-pop-num-cycles-operand-{key}"), json!(pop_cycles));
        common.insert(
            format!("brisc-bw-operand-{key}"),
            cycles_to_bw((tile * tiles) as f64, pop_cycles, meta.aiclk),
        );
    }

    if core.packer_num_tiles != 0 {
        common.insert(
            "packer-overlay-decoupled-num-tiles".to_string(),
            json!(core.packer_num_tiles),
        );
        common.insert(
            "packer-overlay-decoupled-push-runtime".to_string(),
            json!(core.packer_push_runtime),
        );
        let bw = op
            .and_then(|op| tile_size(&op.output_data_format))
            .map(|tile| {
                cycles_to_bw(
                    (tile * core.packer_num_tiles) as f64,
                    core.packer_push_runtime,
                    meta.aiclk,
                )
            })
            .unwrap_or_else(na);
        common.insert("packer-overlay-decoupled-output-bw".to_string(), bw);
    } else {
        common.insert("packer-overlay-decoupled-output-bw".to_string(), na());
        common.insert("packer-num-tiles".to_string(), na());
        common.insert("packer-push-runtime".to_string(), na());
    }

    Value::Object(common)
}

// ---------------------------------------------------------------------------
// Per-epoch events
// ---------------------------------------------------------------------------

fn per_epoch_events(
    windows: &EpochWindows,
    meta: &InstructionMeta,
    perf: &PerfConfig,
) -> (Value, EpochThroughput) {
    let mut events = Map::new();
    let mut throughput = EpochThroughput {
        largest_wait_for_epoch_binary_cycles: windows.largest_wait_for_epoch_binary,
        ..EpochThroughput::default()
    };

    let mut last_pack = Map::new();
    for (input, (core, end)) in &windows.last_pack {
        last_pack.insert(
            format!("input_{input}"),
            json!({ "end-timestamp": end, "core-id": core.label() }),
        );
    }
    events.insert("last-pack".to_string(), Value::Object(last_pack));

    let mut first_unpack = Map::new();
    for (input, (core, start)) in &windows.first_unpack {
        first_unpack.insert(
            format!("input_{input}"),
            json!({ "timestamp": start, "core-id": core.label() }),
        );
    }
    events.insert("unpack-first-block-available".to_string(), Value::Object(first_unpack));

    let first = windows.last_pack.iter().next();
    let last = windows.last_pack.iter().next_back();

    if let Some((&last_input, &(_, last_end))) = last {
        if let Some(&(_, unpack)) = windows.first_unpack.get(&last_input) {
            let runtime = last_end.wrapping_sub(unpack);
            events.insert(format!("last-input-{last_input}-execution-time"), json!(runtime));
            throughput.last_input_execution_cycles = Some(runtime);
        }
    }

    match (first, last) {
        (Some((&first_input, &(_, first_end))), Some((&last_input, &(_, last_end)))) => {
            events.insert("first-input-recorded".to_string(), json!(first_input));
            events.insert("last-input-recorded".to_string(), json!(last_input));
            events.insert("last-pack-last-input".to_string(), json!(last_end));
            events.insert("last-pack-first-input".to_string(), json!(first_end));
            throughput.first_input_recorded = Some(first_input);
            throughput.last_input_recorded = Some(last_input);
            throughput.last_pack_first_input = Some(first_end);
            throughput.last_pack_last_input = Some(last_end);

            match windows.first_unpack.get(&first_input) {
                Some(&(_, unpack)) => {
                    events.insert("first-unpack-first-input".to_string(), json!(unpack));
                    events.insert("total-runtime".to_string(), json!(last_end.wrapping_sub(unpack)));
                    throughput.first_unpack_first_input = Some(unpack);
                }
                None => {
                    events.insert("first-unpack-first-input".to_string(), na());
                    events.insert("total-runtime".to_string(), na());
                }
            }

            if windows.last_pack.len() > 1 && last_input > first_input {
                let cycles = last_end.wrapping_sub(first_end) as f64 / f64::from(last_input - first_input);
                events.insert("num-cycles-per-input".to_string(), json!(cycles));
                throughput.num_cycles_per_input = Some(cycles);
                if cycles > 0.0 {
                    let per_second = f64::from(meta.aiclk) * 1e6 / cycles;
                    events.insert("num-inputs-per-second".to_string(), json!(per_second));
                    throughput.num_inputs_per_second = Some(per_second);
                }
            }
        }
        _ => {
            for key in [
                "first-unpack-first-input",
                "last-pack-last-input",
                "last-pack-first-input",
                "total-runtime",
            ] {
                events.insert(key.to_string(), na());
            }
        }
    }
    events.entry("num-cycles-per-input").or_insert_with(na);
    events.entry("num-inputs-per-second").or_insert_with(na);

    if perf.measure_steady_state {
        let quarter = meta.input_count / 4;
        let three_quarters = 3 * meta.input_count / 4;
        if let (Some(&(_, start)), Some(&(_, end)), true) = (
            windows.last_pack.get(&quarter),
            windows.last_pack.get(&three_quarters),
            three_quarters > quarter,
        ) {
            let cycles = end.wrapping_sub(start) as f64 / f64::from(three_quarters - quarter);
            throughput.steady_state_first_input = Some(quarter);
            throughput.steady_state_last_input = Some(three_quarters);
            throughput.steady_state_num_cycles_per_input = Some(cycles);
            if cycles > 0.0 {
                throughput.steady_state_num_inputs_per_second = Some(f64::from(meta.aiclk) * 1e6 / cycles);
            }
        }
    }

    let mut longest = Map::new();
    for (input, (op_name, runtime)) in &windows.longest_op {
        longest.insert(
            format!("input-{input}"),
            json!({ "op-name": op_name, "runtime": runtime }),
        );
    }
    events.insert("longest-op-each-input".to_string(), Value::Object(longest));
    events.insert("AICLK".to_string(), json!(meta.aiclk));
    events.insert("device-id".to_string(), json!(meta.device_id));
    events.insert("epoch-global-id".to_string(), json!(meta.global_epoch_id));
    events.insert("epoch-local-id".to_string(), json!(meta.local_epoch_id));
    events.insert("program-id".to_string(), json!(meta.program_id));
    events.insert("program-name".to_string(), json!(meta.program_name));
    events.insert("graph-name".to_string(), json!(meta.graph_name));

    (Value::Object(events), throughput)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DumpMode;
    use crate::record::OuterLoopWindow;
    use crate::report::tests::sample_epoch;
    use crate::report::NA as NA_STR;

    fn report(epoch: &EpochRecord, perf: &PerfConfig) -> PostprocessReport {
        create_postprocess_report(epoch, perf, CycleRebias::default())
    }

    #[test]
    fn test_math_utilization_first_unpack_to_last_pack() {
        let epoch = sample_epoch();
        let out = report(&epoch, &PerfConfig::default());
        let input = &out.report["1-1-op0"]["per-thread-events"]["input-0"];

        assert_eq!(input["first-unpack-to-last-pack"], 500);
        assert_eq!(input["math-utilization-first-unpack-to-last-pack"], 60.0);
        assert_eq!(input["first-unpack-to-last-pack-without-wait-tile"], 450);
        assert_eq!(input["pack-runtime"], 400);
        assert_eq!(input["math-activity"], 300);
        // Wait totals are only reported by the streaming dump modes.
        assert_eq!(input["total-unpack-wait-for-tile-after-first-unpack"], NA_STR);
        assert_eq!(input["unpacker-stalled-on-ncrisc-intermediate-dump"], NA_STR);
    }

    #[test]
    fn test_stalls_reported_in_concurrent_mode() {
        let epoch = sample_epoch();
        let perf = PerfConfig {
            dump_mode: DumpMode::Concurrent,
            dump_level: 1,
            ..PerfConfig::default()
        };
        let out = report(&epoch, &perf);
        let input = &out.report["1-1-op0"]["per-thread-events"]["input-0"];
        assert_eq!(input["total-unpack-wait-for-tile-after-first-unpack"], 50);
        assert_eq!(input["total-wait-for-free-tile-after-first-unpack"], 20);
        assert_eq!(input["packer-stalled-on-ncrisc-intermediate-dump"], 0);
    }

    #[test]
    fn test_thread_event_maps() {
        let epoch = sample_epoch();
        let out = report(&epoch, &PerfConfig::default());
        let core = &out.report["1-1-op0"];

        let math = &core["T1"]["math-perf-counter-outer-loop-0"];
        assert_eq!(math["total-period"][0], 600);
        assert_eq!(math["math-activity"][0], 300);
        assert_eq!(math["math-utilization"][0], 0.5);

        let pack = &core["T2"]["pack"];
        assert_eq!(pack["start"][0], 1100);
        assert_eq!(pack["end"][0], 1500);
        assert_eq!(pack["diff"][0], 400);

        assert_eq!(core["T0"]["tiles"]["value"][0], 16);
        assert_eq!(core["T0"]["unpack-first"]["value"][0], 1000);
        assert_eq!(core["T0"]["out-of-memory"], "false");
    }

    #[test]
    fn test_inputs_common_events() {
        let epoch = sample_epoch();
        let out = report(&epoch, &PerfConfig::default());
        let common = &out.report["1-1-op0"]["inputs-common-events"];

        assert_eq!(common["op-type"], "matmul");
        assert_eq!(common["total-runtime"], 500);
        assert_eq!(common["average-math-utilization"], 60.0);
        // A single input has no per-tensor cadence.
        assert_eq!(common["num-cycles-per-tensor"], NA_STR);
        assert_eq!(common["trisc-num-tiles-operand-input-0"], 16);
        assert_eq!(common["trisc-total-tensor-size-operand-input-0"], 16 * 1120);
        assert_eq!(common["trisc-total-tensor-size-operand-output-0"], 8 * 2080);
        assert_eq!(common["trisc-bw-operand-input-0"], NA_STR);
        assert_eq!(common["brisc-num-tiles-operand-input-0"], 32);
        assert_eq!(common["brisc-pop-num-cycles-operand-input-0"], 200);
        // 32 tiles * 1120 bytes over 200 cycles at 1000 MHz.
        assert_eq!(common["brisc-bw-operand-input-0"], 179.2);
        assert_eq!(common["model-num-cycles"], NA_STR);
        assert_eq!(common["packer-num-tiles"], NA_STR);
    }

    #[test]
    fn test_multi_input_cadence() {
        let mut epoch = sample_epoch();
        let core = epoch.cores.values_mut().next().expect("core");
        core.outer_loops.insert(
            1,
            OuterLoopWindow {
                unpack_first: Some(1600),
                pack_first_start: Some(1700),
                pack_last_end: Some(2000),
                ..OuterLoopWindow::default()
            },
        );
        let out = report(&epoch, &PerfConfig::default());
        let common = &out.report["1-1-op0"]["inputs-common-events"];
        assert_eq!(common["num-cycles-per-tensor"], 500.0);
        assert_eq!(common["num-tensors-per-second"], 2_000_000.0);
        assert_eq!(common["total-runtime"], 1000);

        let epoch_events = &out.report["per-epoch-events"];
        assert_eq!(epoch_events["first-input-recorded"], 0);
        assert_eq!(epoch_events["last-input-recorded"], 1);
        assert_eq!(epoch_events["num-cycles-per-input"], 500.0);
        assert_eq!(epoch_events["last-input-1-execution-time"], 400);
        assert_eq!(out.throughput.num_inputs_per_second, Some(2_000_000.0));
        assert_eq!(out.throughput.last_input_execution_cycles, Some(400));
    }

    #[test]
    fn test_out_of_memory_core_reports_na() {
        let mut epoch = sample_epoch();
        let core = epoch.cores.values_mut().next().expect("core");
        core.out_of_memory = true;

        let out = report(&epoch, &PerfConfig::default());
        let core = &out.report["1-1-op0"];
        assert_eq!(core["per-thread-events"]["input-0"]["first-unpack-to-last-pack"], NA_STR);
        assert_eq!(
            core["per-thread-events"]["input-0"]["math-utilization-first-unpack-to-last-pack"],
            NA_STR
        );
        assert_eq!(core["inputs-common-events"]["total-runtime"], NA_STR);
        assert_eq!(core["inputs-common-events"]["average-math-utilization"], NA_STR);
        assert_eq!(core["inputs-common-events"]["out-of-memory"], true);
    }

    #[test]
    fn test_decoupled_op_reports_na() {
        let epoch = sample_epoch();
        let mut perf = PerfConfig::default();
        perf.trisc_decouplings
            .insert("op0".to_string(), vec![crate::config::TriscDecoupleMode::UnpMath]);
        let out = report(&epoch, &perf);
        let core = &out.report["1-1-op0"];
        assert_eq!(core["per-thread-events"]["input-0"]["first-unpack-to-last-pack"], NA_STR);
        assert_eq!(core["inputs-common-events"]["total-runtime"], NA_STR);
        // Window timestamps stay available.
        assert_eq!(core["inputs-common-events"]["first-unpack-first-input"], 1000);
    }

    #[test]
    fn test_per_epoch_events() {
        let epoch = sample_epoch();
        let out = report(&epoch, &PerfConfig::default());
        let events = &out.report["per-epoch-events"];

        assert_eq!(events["last-pack"]["input_0"]["end-timestamp"], 1500);
        assert_eq!(events["last-pack"]["input_0"]["core-id"], "1-1");
        assert_eq!(events["unpack-first-block-available"]["input_0"]["timestamp"], 1000);
        assert_eq!(events["total-runtime"], 500);
        assert_eq!(events["num-cycles-per-input"], NA_STR);
        assert_eq!(events["longest-op-each-input"]["input-0"]["op-name"], "op0");
        assert_eq!(events["longest-op-each-input"]["input-0"]["runtime"], 500);
        assert_eq!(events["AICLK"], 1000);
        assert_eq!(events["graph-name"], "graph0");
        assert_eq!(out.throughput.first_unpack_first_input, Some(1000));
        assert_eq!(out.throughput.last_pack_last_input, Some(1500));
    }

    #[test]
    fn test_rebias_applies_to_timestamps_only() {
        let mut aligner = crate::clock::ClockAligner::default();
        aligner.insert(
            0,
            crate::clock::DeviceAlignment {
                device_start_cycle: 100,
                ..Default::default()
            },
        );
        let rebias = CycleRebias::new(&aligner, 0, true).expect("aligned");
        let epoch = sample_epoch();
        let out = create_postprocess_report(&epoch, &PerfConfig::default(), rebias);
        let core = &out.report["1-1-op0"];

        assert_eq!(core["per-thread-events"]["input-0"]["unpack-first-block-data-available"], 900);
        assert_eq!(core["T0"]["tiles"]["value"][0], 16);
        assert_eq!(core["T0"]["unpack-first"]["value"][0], 900);
        assert_eq!(core["inputs-common-events"]["first-unpack-first-input"], 900);
        assert_eq!(core["inputs-common-events"]["total-runtime"], 500);
    }
}
