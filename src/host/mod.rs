//! Host-side event profiler.
//!
//! Every recording thread appends `(event id, value)` pairs to its own
//! buffer. Timed events are recorded twice with the same id, once at start
//! and once at end; postprocessing pairs the two values back into spans and
//! writes one report per thread plus a run-level host summary.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{ClockAligner, ClockError};
use crate::device::codec::{describe_host, HostEventId};
use crate::device::event::HostEventType;
use crate::report::{na, write_json};
use crate::state::InstructionMeta;

pub const HOST_SUMMARY_JSON: &str = "host_summary_report.json";

/// Custom label indices occupy the 24-bit label field of a host event id.
const MAX_CUSTOM_LABELS: usize = 0xff_ffff;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("custom label space exhausted ({MAX_CUSTOM_LABELS} labels)")]
    LabelSpaceExhausted,

    #[error("clock conversion failed: {0}")]
    Clock(#[from] ClockError),
}

#[derive(Debug, Default)]
struct CustomLabels {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

/// One start/end pair, or a lone value for single-value events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent {
    pub first: u64,
    pub second: Option<u64>,
}

/// What host postprocessing wrote.
#[derive(Debug, Clone, Default)]
pub struct HostSummary {
    pub reports: Vec<PathBuf>,
    pub samples_per_second: f64,
}

/// Collects host events for one process.
pub struct HostProfiler {
    pid: u32,
    start: Instant,
    quiet: bool,
    events: DashMap<u64, Vec<(u64, u64)>>,
    device_start_cycles: DashMap<u8, u64>,
    labels: Mutex<CustomLabels>,
}

/// Stable numeric id for the calling thread.
pub fn current_thread_id() -> u64 {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() & 0xffff_ffff
}

fn event_id(kind: HostEventType, device: u8, epoch: u16, program: u8, label: u32) -> u64 {
    HostEventId {
        event_type: kind as u8,
        device_id: device,
        epoch_id: epoch,
        program_id: program,
        custom_label: label,
    }
    .encode()
}

impl HostProfiler {
    pub fn new(quiet: bool) -> Self {
        Self {
            pid: std::process::id(),
            start: Instant::now(),
            quiet,
            events: DashMap::new(),
            device_start_cycles: DashMap::new(),
            labels: Mutex::new(CustomLabels::default()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Monotonic nanoseconds since the profiler was created.
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Append a raw `(id, value)` pair to the calling thread's buffer.
    pub fn record_event(&self, id: u64, value: u64) {
        self.events
            .entry(current_thread_id())
            .or_default()
            .push((id, value));
    }

    /// Record a loader event stamped with the current time.
    pub fn record_loader_event(&self, kind: HostEventType, device: u8, epoch: u16, program: u8, label: u32) {
        self.record_event(event_id(kind, device, epoch, program, label), self.now_ns());
    }

    /// Index of `label`, registering it on first use.
    pub fn register_custom_label(&self, label: &str) -> Result<u32, HostError> {
        let mut labels = self.labels.lock();
        if let Some(&idx) = labels.index.get(label) {
            return Ok(idx);
        }
        if labels.names.len() >= MAX_CUSTOM_LABELS {
            return Err(HostError::LabelSpaceExhausted);
        }
        let idx = labels.names.len() as u32;
        labels.names.push(label.to_string());
        labels.index.insert(label.to_string(), idx);
        Ok(idx)
    }

    /// Record one edge of a span named by a custom label.
    pub fn record_custom(&self, label: &str) -> Result<(), HostError> {
        let idx = self.register_custom_label(label)?;
        self.record_loader_event(HostEventType::Custom, 0, 0, 0, idx);
        Ok(())
    }

    /// Record both edges of a span measured elsewhere, on the calling thread.
    pub fn record_span(&self, kind: HostEventType, start_ns: u64, end_ns: u64) {
        let id = event_id(kind, 0, 0, 0, 0);
        self.record_event(id, start_ns);
        self.record_event(id, end_ns);
    }

    /// Record the device start together with the host time it was read at.
    pub fn record_device_start(&self, device: u8, cycle: u64, host_ns: u64) {
        self.device_start_cycles.insert(device, cycle);
        self.record_event(event_id(HostEventType::DeviceRuntime, device, 0, 0, 0), host_ns);
        self.record_event(event_id(HostEventType::DeviceStartCycle, device, 0, 0, 0), cycle);
        self.record_event(event_id(HostEventType::DeviceStartCycleAligned, device, 0, 0, 0), 0);
    }

    pub fn record_device_end(&self, device: u8, cycle: u64, host_ns: u64) {
        let start = self.device_start_cycles.get(&device).map(|c| *c).unwrap_or(0);
        self.record_event(event_id(HostEventType::DeviceRuntime, device, 0, 0, 0), host_ns);
        self.record_event(event_id(HostEventType::DeviceEndCycle, device, 0, 0, 0), cycle);
        self.record_event(
            event_id(HostEventType::DeviceEndCycleAligned, device, 0, 0, 0),
            cycle.saturating_sub(start),
        );
    }

    /// Span that ends when the guard drops.
    pub fn scoped(&self, kind: HostEventType) -> ScopedEvent<'_> {
        let id = event_id(kind, 0, 0, 0, 0);
        self.record_event(id, self.now_ns());
        ScopedEvent { profiler: self, id }
    }

    /// Add the first-unpack to last-pack window of every epoch as host spans.
    ///
    /// Nothing is added unless every epoch recorded all of its inputs.
    /// Returns the number of spans added.
    pub fn append_epoch_runtimes(
        &self,
        epochs: &[InstructionMeta],
        aligner: &ClockAligner,
    ) -> Result<usize, HostError> {
        for epoch in epochs {
            let t = &epoch.throughput;
            let complete = t.first_input_recorded == Some(0)
                && t.last_input_recorded == Some(epoch.input_count.saturating_sub(1));
            if !complete {
                crate::perf_warn!(
                    self.quiet,
                    program = %epoch.program_name,
                    graph = %epoch.graph_name,
                    first = ?t.first_input_recorded,
                    last = ?t.last_input_recorded,
                    "not adding epoch runtimes to host report, inputs were not all recorded",
                );
                return Ok(0);
            }
        }

        let mut added = 0;
        for epoch in epochs {
            let t = &epoch.throughput;
            let (Some(first), Some(last)) = (t.first_unpack_first_input, t.last_pack_last_input) else {
                crate::perf_warn!(
                    self.quiet,
                    graph = %epoch.graph_name,
                    "epoch has no first-unpack/last-pack window",
                );
                continue;
            };
            let device = u32::from(epoch.device_id);
            let id = event_id(
                HostEventType::DeviceEpochFirstUnpackLastPack,
                epoch.device_id,
                epoch.local_epoch_id as u16,
                epoch.program_id as u8,
                0,
            );
            self.record_event(id, aligner.to_host_time(device, first)?);
            self.record_event(id, aligner.to_host_time(device, last)?);
            added += 1;
        }
        Ok(added)
    }

    fn label_names(&self) -> Vec<String> {
        self.labels.lock().names.clone()
    }

    /// Write one report per recording thread and update the host summary.
    ///
    /// A thread whose report already exists is skipped.
    pub fn postprocess(&self, output_root: &Path, total_input_count: Option<u64>) -> Result<HostSummary> {
        let host_dir = output_root.join("host");
        let labels = self.label_names();
        let mut summary = HostSummary::default();

        let buffers: Vec<(u64, Vec<(u64, u64)>)> = self
            .events
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (thread, entries) in buffers {
            let path = host_dir.join(format!("host_profile_{}_{thread}.json", self.pid));
            if path.exists() {
                debug!(path = %path.display(), "host report already written, skipping");
                continue;
            }
            info!(pid = self.pid, thread, "starting host profiler postprocessor");

            let mut events = pair_events(&entries);
            drop_incomplete(&mut events, self.quiet);
            let report = build_thread_report(
                &events,
                self.pid,
                thread,
                &labels,
                total_input_count,
                self.quiet,
            );
            info!(path = %path.display(), "writing host postprocess report");
            write_json(&path, &report)?;

            let sps = report["global-events"]["samples-per-second"]
                .as_f64()
                .unwrap_or(0.0);
            update_host_summary(&host_dir.join(HOST_SUMMARY_JSON), sps)?;
            if sps != 0.0 {
                summary.samples_per_second = sps;
            }
            summary.reports.push(path);
        }

        Ok(summary)
    }
}

impl Default for HostProfiler {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Records the end edge of a span when dropped.
pub struct ScopedEvent<'a> {
    profiler: &'a HostProfiler,
    id: u64,
}

impl Drop for ScopedEvent<'_> {
    fn drop(&mut self) {
        self.profiler.record_event(self.id, self.profiler.now_ns());
    }
}

fn is_single_value(id: u64) -> bool {
    HostEventId::decode(id)
        .kind()
        .is_some_and(HostEventType::is_single_value)
}

/// Group raw values by id. A value closes the newest open span of its id,
/// or opens a new one.
pub fn pair_events(entries: &[(u64, u64)]) -> BTreeMap<u64, Vec<HostEvent>> {
    let mut events: BTreeMap<u64, Vec<HostEvent>> = BTreeMap::new();
    for &(id, value) in entries {
        let list = events.entry(id).or_default();
        match list.last_mut() {
            Some(last) if last.second.is_none() && !is_single_value(id) => last.second = Some(value),
            _ => list.push(HostEvent {
                first: value,
                second: None,
            }),
        }
    }
    events
}

/// Remove spans without an end value, then ids left with no events.
pub fn drop_incomplete(events: &mut BTreeMap<u64, Vec<HostEvent>>, quiet: bool) {
    events.retain(|&id, list| {
        if is_single_value(id) {
            return true;
        }
        let before = list.len();
        list.retain(|event| event.second.is_some());
        if list.len() != before {
            crate::perf_warn!(
                quiet,
                event_id = id,
                removed = before - list.len(),
                "removing host events without an end value",
            );
        }
        !list.is_empty()
    });
}

/// Run-level events derived from program and output spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostGlobalEvents {
    pub first_program_start: Option<u64>,
    pub last_output_pop_end: Option<u64>,
}

pub fn global_events(events: &BTreeMap<u64, Vec<HostEvent>>) -> HostGlobalEvents {
    let mut global = HostGlobalEvents::default();
    for (&id, list) in events {
        match HostEventId::decode(id).kind() {
            Some(HostEventType::RunProgram) => {
                let start = list.iter().map(|e| e.first).min();
                global.first_program_start = match (global.first_program_start, start) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            Some(HostEventType::PopOutput) => {
                let end = list.iter().filter_map(|e| e.second).max();
                global.last_output_pop_end = global.last_output_pop_end.max(end);
            }
            _ => {}
        }
    }
    global
}

fn global_events_json(global: HostGlobalEvents, total_input_count: Option<u64>) -> Value {
    let window = global
        .first_program_start
        .zip(global.last_output_pop_end)
        .map(|(start, end)| end.saturating_sub(start));
    let samples_per_second = window
        .zip(total_input_count)
        .filter(|&(window, _)| window > 0)
        .map(|(window, inputs)| inputs as f64 * 1e9 / window as f64);

    json!({
        "first-program-start": global.first_program_start.map_or_else(na, Value::from),
        "last-output-pop-end": global.last_output_pop_end.map_or_else(na, Value::from),
        "total-input-count": total_input_count.map_or_else(na, Value::from),
        "first-program-to-last-output-pop": window.map_or_else(na, Value::from),
        "samples-per-second": samples_per_second.map_or_else(|| json!(0), Value::from),
    })
}

/// Per-thread host report: one entry per event description plus `global-events`.
pub fn build_thread_report(
    events: &BTreeMap<u64, Vec<HostEvent>>,
    pid: u32,
    thread: u64,
    labels: &[String],
    total_input_count: Option<u64>,
    quiet: bool,
) -> Value {
    let mut report = Map::new();
    for (&id, list) in events {
        let Some(description) = describe_host(id, pid, thread, labels) else {
            crate::perf_warn!(quiet, event_id = id, "skipping host event with unknown id");
            continue;
        };
        let entry = if is_single_value(id) {
            json!({ "value": list.iter().map(|e| e.first).collect::<Vec<_>>() })
        } else {
            let spans: Vec<(u64, u64)> = list
                .iter()
                .filter_map(|e| e.second.map(|second| (e.first, second)))
                .collect();
            json!({
                "start": spans.iter().map(|s| s.0).collect::<Vec<_>>(),
                "end": spans.iter().map(|s| s.1).collect::<Vec<_>>(),
                "diff": spans.iter().map(|s| s.1.saturating_sub(s.0)).collect::<Vec<_>>(),
            })
        };
        report.insert(description, entry);
    }
    report.insert(
        "global-events".to_string(),
        global_events_json(global_events(events), total_input_count),
    );
    Value::Object(report)
}

/// Merge `samples_per_second` into the host summary, keeping an existing
/// nonzero value when this thread measured none.
pub fn update_host_summary(path: &Path, samples_per_second: f64) -> Result<()> {
    let mut summary = match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(path = %path.display(), "ignoring unreadable host summary");
                Map::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    if samples_per_second != 0.0 {
        summary.insert("samples-per-second".to_string(), json!(samples_per_second));
    }
    summary
        .entry("samples-per-second")
        .or_insert_with(|| json!(0));
    write_json(path, &Value::Object(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DeviceAlignment;
    use crate::state::EpochThroughput;

    fn id(kind: HostEventType) -> u64 {
        event_id(kind, 0, 0, 0, 0)
    }

    #[test]
    fn test_pairing_and_cleanup() {
        let run = id(HostEventType::RunProgram);
        let start = id(HostEventType::DeviceStartCycle);
        let entries = [(run, 10), (run, 20), (run, 30), (start, 5), (start, 6)];

        let mut events = pair_events(&entries);
        assert_eq!(events[&run].len(), 2);
        assert_eq!(events[&start].len(), 2);

        drop_incomplete(&mut events, true);
        assert_eq!(
            events[&run],
            vec![HostEvent {
                first: 10,
                second: Some(20)
            }]
        );
        assert_eq!(events[&start].len(), 2);

        let lone = [(id(HostEventType::PopOutput), 1)];
        let mut events = pair_events(&lone);
        drop_incomplete(&mut events, true);
        assert!(events.is_empty());
    }

    #[test]
    fn test_global_events_and_samples_per_second() {
        let run = id(HostEventType::RunProgram);
        let pop = id(HostEventType::PopOutput);
        let entries = [(run, 100), (run, 200), (run, 50), (run, 60), (pop, 300), (pop, 1_000_100)];
        let events = pair_events(&entries);

        let global = global_events(&events);
        assert_eq!(global.first_program_start, Some(50));
        assert_eq!(global.last_output_pop_end, Some(1_000_100));

        let report = build_thread_report(&events, 7, 3, &[], Some(10), true);
        let g = &report["global-events"];
        assert_eq!(g["first-program-to-last-output-pop"], 1_000_050);
        assert_eq!(g["total-input-count"], 10);
        assert_eq!(g["samples-per-second"], 10.0 * 1e9 / 1_000_050.0);
        assert_eq!(report["run-program_pid_7_th_3"]["start"], json!([100, 50]));
        assert_eq!(report["run-program_pid_7_th_3"]["diff"], json!([100, 10]));
    }

    #[test]
    fn test_missing_globals_default() {
        let report = build_thread_report(&BTreeMap::new(), 1, 1, &[], None, true);
        let g = &report["global-events"];
        assert_eq!(g["first-program-start"], "N/A");
        assert_eq!(g["last-output-pop-end"], "N/A");
        assert_eq!(g["total-input-count"], "N/A");
        assert_eq!(g["first-program-to-last-output-pop"], "N/A");
        assert_eq!(g["samples-per-second"], 0);
    }

    #[test]
    fn test_custom_labels_and_scoped_events() {
        let profiler = HostProfiler::new(true);
        assert_eq!(profiler.register_custom_label("compile").expect("label"), 0);
        assert_eq!(profiler.register_custom_label("load").expect("label"), 1);
        assert_eq!(profiler.register_custom_label("compile").expect("label"), 0);

        profiler.record_custom("load").expect("record");
        profiler.record_custom("load").expect("record");
        {
            let _span = profiler.scoped(HostEventType::PerfPostprocessor);
        }

        let thread = current_thread_id();
        let entries = profiler.events.get(&thread).expect("buffer").clone();
        let events = pair_events(&entries);
        let report = build_thread_report(&events, 9, thread, &profiler.label_names(), None, true);
        assert!(report.get(format!("load_pid_9_th_{thread}")).is_some());
        assert!(report
            .get(format!("perf-postprocessor_pid_9_th_{thread}"))
            .is_some());
    }

    #[test]
    fn test_device_start_end_records_aligned_cycles() {
        let profiler = HostProfiler::new(true);
        profiler.record_device_start(1, 5000, 100);
        profiler.record_device_end(1, 8000, 900);

        let entries = profiler.events.get(&current_thread_id()).expect("buffer").clone();
        let events = pair_events(&entries);
        let runtime = event_id(HostEventType::DeviceRuntime, 1, 0, 0, 0);
        let aligned_end = event_id(HostEventType::DeviceEndCycleAligned, 1, 0, 0, 0);
        assert_eq!(
            events[&runtime],
            vec![HostEvent {
                first: 100,
                second: Some(900)
            }]
        );
        assert_eq!(events[&aligned_end][0].first, 3000);
    }

    fn epoch_meta(first: Option<u32>, last: Option<u32>) -> InstructionMeta {
        InstructionMeta {
            program_id: 0,
            program_name: "program0".to_string(),
            graph_name: "graph0".to_string(),
            local_epoch_id: 2,
            global_epoch_id: 2,
            device_id: 0,
            aiclk: 1000,
            input_count: 4,
            output_dir: PathBuf::from("/tmp"),
            throughput: EpochThroughput {
                first_input_recorded: first,
                last_input_recorded: last,
                first_unpack_first_input: Some(100),
                last_pack_last_input: Some(500),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_append_epoch_runtimes() {
        let mut aligner = ClockAligner::default();
        aligner.insert(
            0,
            DeviceAlignment {
                device_start_cycle: 0,
                device_end_cycle: 1000,
                host_start_ns: 10_000,
                host_end_ns: 12_000,
            },
        );

        let profiler = HostProfiler::new(true);
        let partial = [epoch_meta(Some(0), Some(2))];
        assert_eq!(profiler.append_epoch_runtimes(&partial, &aligner).expect("append"), 0);

        let full = [epoch_meta(Some(0), Some(3))];
        assert_eq!(profiler.append_epoch_runtimes(&full, &aligner).expect("append"), 1);
        let entries = profiler.events.get(&current_thread_id()).expect("buffer").clone();
        assert_eq!(entries[0].1, 10_200);
        assert_eq!(entries[1].1, 11_000);

        let report = build_thread_report(&pair_events(&entries), 1, 2, &[], None, true);
        let span = &report["device-epoch-first-unpack-last-pack-program-id-0-epoch-id-2-device-0_pid_1_th_2"];
        assert_eq!(span["diff"], json!([800]));
    }

    #[test]
    fn test_postprocess_writes_reports_and_summary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let profiler = HostProfiler::new(true);
        profiler.record_event(id(HostEventType::RunProgram), 0);
        profiler.record_event(id(HostEventType::RunProgram), 10);
        profiler.record_event(id(HostEventType::PopOutput), 20);
        profiler.record_event(id(HostEventType::PopOutput), 500_000_000);

        let summary = profiler.postprocess(dir.path(), Some(64)).expect("postprocess");
        assert_eq!(summary.reports.len(), 1);
        assert!(summary.reports[0].exists());
        assert_eq!(summary.samples_per_second, 128.0);

        let host_summary: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("host").join(HOST_SUMMARY_JSON)).expect("read"),
        )
        .expect("json");
        assert_eq!(host_summary["samples-per-second"], 128.0);

        // A second pass does not rewrite the thread report.
        let again = profiler.postprocess(dir.path(), Some(64)).expect("postprocess");
        assert!(again.reports.is_empty());
    }

    #[test]
    fn test_summary_keeps_nonzero_rate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(HOST_SUMMARY_JSON);
        update_host_summary(&path, 0.0).expect("write");
        let read = |p: &Path| -> Value {
            serde_json::from_str(&std::fs::read_to_string(p).expect("read")).expect("json")
        };
        assert_eq!(read(&path)["samples-per-second"], 0);

        update_host_summary(&path, 42.5).expect("write");
        update_host_summary(&path, 0.0).expect("write");
        assert_eq!(read(&path)["samples-per-second"], 42.5);
    }
}
