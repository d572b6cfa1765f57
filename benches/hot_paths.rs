use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ttperf::aggregator::Aggregator;
use ttperf::config::{DumpMode, PerfConfig, ScratchConfig};
use ttperf::device::codec::{describe, DumpHeader, TriscEventId};
use ttperf::device::event::{
    ThreadKind, TriscEventType, MATH_HEADER_WORD, PERF_VAL_FIRST, PERF_VAL_LAST, THREAD_DUMP_END_ID,
    VALID_THREAD_DUMP_START_ID,
};
use ttperf::device::parse::parse_thread_dump;
use ttperf::device::stats::PipelineStats;
use ttperf::report::{build_epoch_reports, CycleRebias};
use ttperf::state::descriptor::RunDescriptor;
use ttperf::state::PerfState;

const NUM_CORES: u8 = 8;

fn run_descriptor() -> String {
    let cores: String = (1..=NUM_CORES)
        .map(|x| format!("      - {{ x: {x}, y: 1, op_name: matmul0 }}\n"))
        .collect();
    format!(
        r#"
graphs:
  - name: graph0
    target_device: 0
    input_count: 64
    ops:
      matmul0: {{ op_type: matmul, input_data_formats: [Bfp8_b, Bfp8_b], output_data_format: Float16_b }}
    cores:
{cores}programs:
  - name: program0
    instructions:
      - {{ opcode: execute, graph_name: graph0 }}
executed:
  - {{ program: program0, pcs: [0] }}
aiclk: {{ 0: 1000 }}
total_input_count: 64
"#
    )
}

fn header(x: u8, kind: ThreadKind) -> u32 {
    DumpHeader {
        x,
        y: 1,
        chip_id: 0,
        thread_id: kind as u8,
        epoch_id: 0,
    }
    .encode()
}

fn trisc_id(event_type: TriscEventType, outer_loop_idx: u16) -> u32 {
    TriscEventId {
        operand_idx: 0,
        num_tiles: 0,
        event_type: event_type as u8,
        outer_loop_idx,
    }
    .encode()
}

fn unpack_dump(inputs: u16) -> Vec<u32> {
    let mut words = vec![PERF_VAL_FIRST, header(1, ThreadKind::Unpack)];
    for input in 0..inputs {
        let id = trisc_id(TriscEventType::UnpackFirstInstruction, input);
        let ts = u32::from(input) * 1_000;
        words.extend([id, 0, ts, id, 0, ts + 500]);
    }
    words.push(PERF_VAL_LAST);
    words
}

fn scratch() -> ScratchConfig {
    ScratchConfig {
        num_queues: 1,
        num_slots: 4,
        thread_dump_words: 64,
        math_dump_words: 12,
        brisc_dump_words: 64,
        ..Default::default()
    }
}

/// One slot per core with eight inputs of unpack/pack windows.
fn core_slot(cfg: &ScratchConfig, x: u8) -> Vec<u32> {
    let mut slot = Vec::with_capacity(cfg.slot_words());
    for &kind in ThreadKind::all() {
        let len = cfg.thread_words(kind);
        let mut words = vec![VALID_THREAD_DUMP_START_ID, header(x, kind)];
        match kind {
            ThreadKind::Unpack => {
                for input in 0..8u16 {
                    let id = trisc_id(TriscEventType::UnpackFirstInstruction, input);
                    let ts = u32::from(input) * 1_000;
                    words.extend([id, 0, ts, id, 0, ts + 5]);
                }
            }
            ThreadKind::Pack => {
                for input in 0..8u16 {
                    let id = trisc_id(TriscEventType::PackEachInput, input);
                    let ts = u32::from(input) * 1_000;
                    words.extend([id, 0, ts + 100, id, 0, ts + 500]);
                }
            }
            ThreadKind::Math => {
                words.extend([MATH_HEADER_WORD, MATH_HEADER_WORD, 0, 100, 0, 0, 200, 400, 0, 0]);
            }
            _ => {}
        }
        let pad = if kind == ThreadKind::Math { 0 } else { THREAD_DUMP_END_ID };
        words.resize(len, pad);
        slot.extend(words);
        slot.resize(slot.len() + cfg.thread_dump_words - len, 0);
    }
    slot
}

fn state() -> Arc<PerfState> {
    let desc: RunDescriptor = serde_yaml::from_str(&run_descriptor()).expect("parse run");
    let perf = PerfConfig {
        dump_mode: DumpMode::Concurrent,
        ..Default::default()
    };
    Arc::new(PerfState::from_descriptor(&desc, perf, "/tmp/ttperf-bench").expect("state"))
}

fn bench_parse(c: &mut Criterion) {
    let dump = unpack_dump(64);
    let id = trisc_id(TriscEventType::PackEachInput, 12);

    c.bench_function("parse/unpack_64_inputs", |b| {
        b.iter(|| parse_thread_dump(black_box(&dump), false).expect("parse unpack"))
    });

    c.bench_function("codec/describe_pack", |b| {
        b.iter(|| describe(black_box(id), ThreadKind::Pack))
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let cfg = scratch();
    let state = state();
    let slots: Vec<Vec<u32>> = (1..=NUM_CORES).map(|x| core_slot(&cfg, x)).collect();

    c.bench_function("aggregator/epoch_8_cores", |b| {
        b.iter(|| {
            let mut aggregator = Aggregator::new(Arc::clone(&state), Arc::new(PipelineStats::new()), cfg.clone());
            let mut done = 0;
            for slot in &slots {
                done += aggregator.process_device_dump(black_box(slot)).expect("slot").len();
            }
            black_box(done)
        })
    });
}

fn bench_reports(c: &mut Criterion) {
    let cfg = scratch();
    let state = state();
    let mut aggregator = Aggregator::new(Arc::clone(&state), Arc::new(PipelineStats::new()), cfg.clone());
    let mut epochs = Vec::new();
    for x in 1..=NUM_CORES {
        epochs.extend(aggregator.process_device_dump(&core_slot(&cfg, x)).expect("slot"));
    }
    let Some(epoch) = epochs.pop() else {
        panic!("epoch did not complete");
    };
    let perf = state.get_config();

    c.bench_function("report/build_epoch_8_cores", |b| {
        b.iter(|| {
            let reports = build_epoch_reports(black_box(&epoch), &perf, CycleRebias::default());
            black_box(reports.runtime_csv.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse(c);
    bench_aggregate(c);
    bench_reports(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
