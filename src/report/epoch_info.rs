//! Run-level summary across every reported epoch.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::{or_na, write_text};
use crate::state::InstructionMeta;

pub const EPOCHS_CSV: &str = "perf_info_all_epochs.csv";
pub const EPOCHS_YAML: &str = "perf_info_all_epochs.yaml";

/// Throughput of one epoch in the YAML summary.
#[derive(Debug, Clone, Serialize)]
pub struct EpochNode {
    pub aiclk: u32,
    pub device_id: u8,
    pub global_epoch_id: u32,
    pub output_directory: String,
    #[serde(rename = "Number of cycles per input  (Skipping first input)")]
    pub num_cycles_per_input: Value,
    #[serde(rename = "Number of inputs per second (Skipping first input)")]
    pub num_inputs_per_second: Value,
    #[serde(rename = "Number of cycles (First unpack to last pack) for last input")]
    pub last_input_execution_cycles: Value,
    #[serde(rename = "Largest epoch binary queue empty among all cores")]
    pub largest_wait_for_epoch_binary: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalEvents {
    #[serde(rename = "samples-per-second-excluding-last-epoch-of-each-program")]
    pub samples_per_second: f64,
    #[serde(rename = "host-name")]
    pub host_name: String,
    #[serde(rename = "host-name-envvar")]
    pub host_name_envvar: String,
}

/// `perf_info_all_epochs.yaml`: "P-program" -> "L-graph" -> epoch node.
#[derive(Debug, Clone, Serialize)]
pub struct AllEpochsInfo {
    #[serde(flatten)]
    pub programs: BTreeMap<String, BTreeMap<String, EpochNode>>,
    #[serde(rename = "global-events")]
    pub global_events: GlobalEvents,
    #[serde(skip)]
    epochs: Vec<InstructionMeta>,
}

impl AllEpochsInfo {
    /// `epochs` must be sorted by global epoch id. `num_epochs` returns the
    /// number of epochs executed by a program.
    pub fn new(
        epochs: &[InstructionMeta],
        num_epochs: impl Fn(u32) -> u32,
        total_input_count: u64,
    ) -> Self {
        let mut programs: BTreeMap<String, BTreeMap<String, EpochNode>> = BTreeMap::new();
        for meta in epochs {
            let t = &meta.throughput;
            programs
                .entry(format!("{}-{}", meta.program_id, meta.program_name))
                .or_default()
                .insert(
                    format!("{}-{}", meta.local_epoch_id, meta.graph_name),
                    EpochNode {
                        aiclk: meta.aiclk,
                        device_id: meta.device_id,
                        global_epoch_id: meta.global_epoch_id,
                        output_directory: meta.output_dir.display().to_string(),
                        num_cycles_per_input: or_na(t.num_cycles_per_input),
                        num_inputs_per_second: or_na(t.num_inputs_per_second),
                        last_input_execution_cycles: or_na(t.last_input_execution_cycles),
                        largest_wait_for_epoch_binary: t.largest_wait_for_epoch_binary_cycles,
                    },
                );
        }

        Self {
            programs,
            global_events: GlobalEvents {
                samples_per_second: samples_per_second(epochs, num_epochs, total_input_count),
                host_name: host_name(),
                host_name_envvar: std::env::var("BOARD_HOSTNAME").unwrap_or_default(),
            },
            epochs: epochs.to_vec(),
        }
    }

    pub fn samples_per_second(&self) -> f64 {
        self.global_events.samples_per_second
    }

    /// Rows of `perf_info_all_epochs.csv`, header first.
    pub fn csv_rows(&self, steady_state: bool) -> Vec<Vec<String>> {
        let mut header: Vec<&str> = vec![
            "program-name",
            "graph-name",
            "aiclk",
            "device-id",
            "input-count",
            "first-to-last-inputs",
            "num-cycles-per-tensor-all-inputs",
            "num-tensors-per-second-all-inputs",
            "num-cycles-all-inputs",
        ];
        if steady_state {
            header.extend([
                "middle-inputs",
                "num-cycles-per-tensor-mid-inputs",
                "num-tensors-per-second-mid-inputs",
            ]);
        }
        header.push("largest-wait-for-epoch-binary");

        let mut rows = vec![header.into_iter().map(String::from).collect::<Vec<_>>()];
        for meta in &self.epochs {
            let t = &meta.throughput;
            let range = |first: Option<u32>, last: Option<u32>| match (first, last) {
                (Some(first), Some(last)) => format!("{first}->{last}"),
                _ => na_string(),
            };
            let whole = |v: Option<f64>| {
                v.filter(|v| *v != 0.0)
                    .map(|v| (v as u64).to_string())
                    .unwrap_or_else(na_string)
            };
            let latency = match (t.first_input_recorded, t.first_unpack_first_input, t.last_pack_last_input) {
                (Some(0), Some(start), Some(end)) => end.wrapping_sub(start).to_string(),
                _ => na_string(),
            };

            let mut row = vec![
                meta.program_name.clone(),
                meta.graph_name.clone(),
                meta.aiclk.to_string(),
                meta.device_id.to_string(),
                meta.input_count.to_string(),
                range(t.first_input_recorded, t.last_input_recorded),
                whole(t.num_cycles_per_input),
                whole(t.num_inputs_per_second),
                latency,
            ];
            if steady_state {
                row.extend([
                    range(t.steady_state_first_input, t.steady_state_last_input),
                    whole(t.steady_state_num_cycles_per_input),
                    whole(t.steady_state_num_inputs_per_second),
                ]);
            }
            row.push(t.largest_wait_for_epoch_binary_cycles.to_string());
            rows.push(row);
        }
        rows
    }

    /// Write the CSV and YAML summaries under `root`, replacing earlier ones.
    pub fn write(&self, root: &Path, steady_state: bool) -> Result<()> {
        let rows = self.csv_rows(steady_state);
        let mut csv = String::new();
        for row in &rows {
            csv.push_str(&row.join(","));
            csv.push('\n');
        }
        write_text(&root.join(EPOCHS_CSV), &csv)?;

        let yaml = serde_yaml::to_string(self).context("serializing epoch summary")?;
        write_text(&root.join(EPOCHS_YAML), &yaml)?;

        for meta in &self.epochs {
            info!(
                program = %meta.program_name,
                graph = %meta.graph_name,
                epoch = meta.global_epoch_id,
                cycles_per_input = %json_cell(or_na(meta.throughput.num_cycles_per_input)),
                inputs_per_second = %json_cell(or_na(meta.throughput.num_inputs_per_second)),
                "epoch throughput",
            );
        }
        info!(
            epochs = self.epochs.len(),
            samples_per_second = self.global_events.samples_per_second,
            dir = %root.display(),
            "wrote epoch summary",
        );
        Ok(())
    }
}

fn na_string() -> String {
    super::NA.to_string()
}

fn json_cell(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Inputs per second over every epoch but the last of its program. Zero when
/// any epoch missed an input, the input count is unknown, or more than one
/// program ran.
pub fn samples_per_second(
    epochs: &[InstructionMeta],
    num_epochs: impl Fn(u32) -> u32,
    total_input_count: u64,
) -> f64 {
    let mut total_seconds = 0.0;
    let mut num_programs = 0;

    for meta in epochs {
        num_programs = num_programs.max(meta.program_id + 1);
        let t = &meta.throughput;
        let complete = t.first_input_recorded == Some(0)
            && t.last_input_recorded == meta.input_count.checked_sub(1);
        let (true, Some(start), Some(end)) = (complete, t.first_unpack_first_input, t.last_pack_last_input) else {
            return 0.0;
        };
        if meta.local_epoch_id + 1 < num_epochs(meta.program_id) {
            total_seconds += end.wrapping_sub(start) as f64 / (f64::from(meta.aiclk) * 1e6);
        }
    }

    if total_seconds == 0.0 || total_input_count == 0 || num_programs != 1 {
        return 0.0;
    }
    total_input_count as f64 / total_seconds
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::meta;
    use crate::state::EpochThroughput;

    fn epoch(local: u32, global: u32, start: u64, end: u64) -> InstructionMeta {
        InstructionMeta {
            local_epoch_id: local,
            global_epoch_id: global,
            input_count: 2,
            throughput: EpochThroughput {
                first_input_recorded: Some(0),
                last_input_recorded: Some(1),
                first_unpack_first_input: Some(start),
                last_pack_last_input: Some(end),
                num_cycles_per_input: Some(250.5),
                num_inputs_per_second: Some(3_992_015.9),
                ..EpochThroughput::default()
            },
            ..meta()
        }
    }

    #[test]
    fn test_samples_per_second_skips_last_epoch() {
        // aiclk 1000 MHz: 1000 cycles is 1us.
        let epochs = vec![epoch(0, 0, 0, 1000), epoch(1, 1, 0, 1000), epoch(2, 2, 0, 9999)];
        let sps = samples_per_second(&epochs, |_| 3, 4);
        assert!((sps - 4.0 / 2e-6).abs() < 1e-3);
    }

    #[test]
    fn test_samples_per_second_invalid_cases() {
        let mut partial = epoch(0, 0, 0, 1000);
        partial.throughput.first_input_recorded = Some(1);
        assert_eq!(samples_per_second(&[partial, epoch(1, 1, 0, 1000)], |_| 2, 4), 0.0);

        // Unknown input count.
        let epochs = vec![epoch(0, 0, 0, 1000), epoch(1, 1, 0, 1000)];
        assert_eq!(samples_per_second(&epochs, |_| 2, 0), 0.0);

        // Two programs.
        let mut other = epoch(0, 1, 0, 1000);
        other.program_id = 1;
        assert_eq!(samples_per_second(&[epoch(0, 0, 0, 1000), other], |_| 2, 4), 0.0);

        // Only the last epoch of the program ran.
        assert_eq!(samples_per_second(&[epoch(0, 0, 0, 1000)], |_| 1, 4), 0.0);
    }

    #[test]
    fn test_csv_rows() {
        let mut missing = epoch(1, 1, 0, 0);
        missing.throughput = EpochThroughput::default();
        let info = AllEpochsInfo::new(&[epoch(0, 0, 100, 600), missing], |_| 2, 2);
        let rows = info.csv_rows(false);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].last().map(String::as_str), Some("largest-wait-for-epoch-binary"));
        assert_eq!(
            rows[1],
            vec!["program0", "graph0", "1000", "0", "2", "0->1", "250", "3992015", "500", "0"]
        );
        assert_eq!(rows[2][5], "N/A");
        assert_eq!(rows[2][6], "N/A");
        assert_eq!(rows[2][8], "N/A");

        let steady = info.csv_rows(true);
        assert_eq!(steady[0].len(), 13);
        assert_eq!(steady[1][9], "N/A");
    }

    #[test]
    fn test_yaml_layout() {
        let info = AllEpochsInfo::new(&[epoch(0, 0, 100, 600)], |_| 1, 2);
        let dir = tempfile::tempdir().expect("tempdir");
        info.write(dir.path(), false).expect("write");

        let yaml = std::fs::read_to_string(dir.path().join(EPOCHS_YAML)).expect("read");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("parse");
        let node = &parsed["0-program0"]["0-graph0"];
        assert_eq!(node["aiclk"].as_u64(), Some(1000));
        assert_eq!(
            node["Number of cycles per input  (Skipping first input)"].as_f64(),
            Some(250.5)
        );
        assert_eq!(
            node["Number of cycles (First unpack to last pack) for last input"].as_str(),
            Some("N/A")
        );
        assert_eq!(
            parsed["global-events"]["samples-per-second-excluding-last-epoch-of-each-program"]
                .as_f64(),
            Some(0.0)
        );
        assert!(dir.path().join(EPOCHS_CSV).exists());

        // Rewriting replaces the previous summary.
        info.write(dir.path(), false).expect("rewrite");
        let again = std::fs::read_to_string(dir.path().join(EPOCHS_YAML)).expect("read");
        assert_eq!(yaml, again);
    }
}
