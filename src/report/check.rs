//! Performance checks against configured comparison targets.

use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{ComparisonConfig, PerfCheckValue, PerfConfig};
use crate::state::InstructionMeta;

/// One failed check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub program_name: String,
    pub graph_name: String,
    /// Core label and input, "graph" or "host".
    pub target: String,
    pub metric: &'static str,
    pub message: String,
}

/// Accumulated outcome of every check in the run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub passed: bool,
    pub checks_run: u64,
    pub failures: Vec<CheckFailure>,
}

impl Default for CheckReport {
    fn default() -> Self {
        Self {
            passed: true,
            checks_run: 0,
            failures: Vec::new(),
        }
    }
}

impl CheckReport {
    fn fail(&mut self, cmp: &ComparisonConfig, target: String, metric: &'static str, message: String) {
        error!(
            program = %cmp.program_name,
            graph = %cmp.graph_name,
            target = %target,
            metric,
            "perf check failed: {message}",
        );
        self.passed = false;
        self.failures.push(CheckFailure {
            program_name: cmp.program_name.clone(),
            graph_name: cmp.graph_name.clone(),
            target,
            metric,
            message,
        });
    }

    fn record(&mut self, cmp: &ComparisonConfig, target: &str, metric: &'static str, check: &PerfCheckValue, observed: f64) {
        self.checks_run += 1;
        let message = check.message(observed, lower_is_better(metric));
        if check.check(observed) {
            info!(
                program = %cmp.program_name,
                graph = %cmp.graph_name,
                target = %target,
                metric,
                "perf check passed: {message}",
            );
        } else {
            self.fail(cmp, target.to_string(), metric, message);
        }
    }
}

impl PerfCheckValue {
    /// The configured target, or the override when the target is 0.
    pub fn target(&self) -> f64 {
        let target = self.expected.or(self.min_bound).unwrap_or_default();
        if target == 0.0 {
            self.override_target
        } else {
            target
        }
    }

    pub fn check(&self, observed: f64) -> bool {
        let target = self.target();
        if self.min_bound.is_some() {
            observed >= target
        } else {
            (observed - target).abs() < (self.rtol * target).abs()
        }
    }

    pub fn message(&self, observed: f64, lower_is_better: bool) -> String {
        let kind = if self.min_bound.is_some() { "Min-Bound" } else { "Expected" };
        let direction = if lower_is_better { "lower" } else { "higher" };
        format!(
            "{kind} {} Observed {observed} ({direction} values are better)",
            self.target()
        )
    }
}

fn lower_is_better(metric: &str) -> bool {
    matches!(metric, "execution_cycles" | "total_runtime" | "num_cycles_per_input")
}

/// Numeric value of a report cell. "N/A" and other strings count as 0.
fn observed(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

/// First comparison configured for this (program, graph) pair.
fn comparison_for<'a>(perf: &'a PerfConfig, meta: &InstructionMeta) -> Option<&'a ComparisonConfig> {
    perf.comparisons
        .iter()
        .find(|c| c.program_name == meta.program_name && c.graph_name == meta.graph_name)
}

/// Core labels ("x-y-op") in the runtime table matching the comparison's
/// target cores and target ops. `None` marks a target core with no entry.
fn target_labels(cmp: &ComparisonConfig, cores: &serde_json::Map<String, Value>) -> Vec<(String, Option<String>)> {
    let mut labels = Vec::new();
    for [x, y] in &cmp.target_cores {
        let prefix = format!("{x}-{y}-");
        let label = cores.keys().find(|label| label.starts_with(&prefix)).cloned();
        labels.push((format!("{x}-{y}"), label));
    }
    for op in &cmp.target_ops {
        let suffix = format!("-{op}");
        for label in cores.keys().filter(|label| label.ends_with(&suffix)) {
            labels.push((op.clone(), Some(label.clone())));
        }
    }
    labels
}

const CORE_METRICS: &[&str] = &[
    "math_utilization",
    "execution_cycles",
    "average_math_utilization",
    "total_runtime",
    "input0_bw",
    "output_bw",
];

/// Check one reported epoch against its comparison, if any.
pub fn check_device(perf: &PerfConfig, runtime_table: &Value, meta: &InstructionMeta, report: &mut CheckReport) {
    if perf.skip_perf_check {
        return;
    }
    let Some(cmp) = comparison_for(perf, meta) else {
        return;
    };
    let metrics = cmp.metrics();
    if metrics.is_empty() {
        report.fail(cmp, "graph".to_string(), "none", "no performance metric configured".to_string());
        return;
    }
    let core_metrics: Vec<_> = metrics
        .into_iter()
        .filter(|(name, _)| CORE_METRICS.contains(name))
        .collect();
    let empty = serde_json::Map::new();
    let cores = runtime_table.as_object().unwrap_or(&empty);

    info!(
        program = %meta.program_name,
        graph = %meta.graph_name,
        epoch = meta.global_epoch_id,
        "running perf checks",
    );

    for (target, label) in target_labels(cmp, cores) {
        let Some(label) = label else {
            report.fail(cmp, target, "core", "core not found in runtime table".to_string());
            continue;
        };
        let core = &cores[&label];
        for input in &cmp.target_inputs {
            let input_key = format!("input-{input}");
            let Some(per_input) = core.get(&input_key) else {
                report.fail(
                    cmp,
                    format!("{label} {input_key}"),
                    "input",
                    "input not recorded".to_string(),
                );
                continue;
            };
            let target = format!("{label} {input_key}");
            for &(name, check) in &core_metrics {
                let value = match name {
                    "math_utilization" => per_input.get("math-utilization-first-unpack-to-last-pack"),
                    "execution_cycles" => per_input.get("first-unpack-to-last-pack"),
                    "average_math_utilization" => core.get("average-math-utilization"),
                    "total_runtime" => core.get("total-runtime"),
                    "input0_bw" => core.get("trisc-bw-operand-input-0"),
                    _ => core.get("trisc-bw-operand-output-0"),
                };
                report.record(cmp, &target, name, &check, observed(value));
            }
        }
    }

    let t = &meta.throughput;
    if let Some(check) = &cmp.num_cycles_per_input {
        report.record(cmp, "graph", "num_cycles_per_input", check, t.num_cycles_per_input.unwrap_or(0.0));
    }
    if let Some(check) = &cmp.num_inputs_per_second {
        report.record(cmp, "graph", "num_inputs_per_second", check, t.num_inputs_per_second.unwrap_or(0.0));
    }
}

/// Check run-level host metrics.
pub fn check_host(perf: &PerfConfig, samples_per_second: f64, report: &mut CheckReport) {
    if perf.skip_perf_check {
        if !perf.comparisons.is_empty() {
            warn!("skipping performance checks");
        }
        return;
    }
    for cmp in &perf.comparisons {
        if let Some(check) = &cmp.backend_samples_per_second {
            report.record(cmp, "host", "backend_samples_per_second", check, samples_per_second);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::meta;
    use crate::state::EpochThroughput;
    use serde_json::json;

    fn expected(value: f64, rtol: f64) -> Option<PerfCheckValue> {
        Some(PerfCheckValue {
            expected: Some(value),
            min_bound: None,
            rtol,
            override_target: 0.0,
        })
    }

    fn min_bound(value: f64) -> Option<PerfCheckValue> {
        Some(PerfCheckValue {
            expected: None,
            min_bound: Some(value),
            rtol: 0.01,
            override_target: 0.0,
        })
    }

    fn runtime_table() -> Value {
        json!({
            "1-1-op0": {
                "input-0": {
                    "math-utilization-first-unpack-to-last-pack": 60.0,
                    "first-unpack-to-last-pack": 500,
                },
                "average-math-utilization": 60.0,
                "total-runtime": 500,
                "trisc-bw-operand-input-0": "N/A",
            },
            "per-epoch-events": { "AICLK": 1000 },
        })
    }

    fn perf(cmp: ComparisonConfig) -> PerfConfig {
        PerfConfig {
            comparisons: vec![cmp],
            ..Default::default()
        }
    }

    fn comparison() -> ComparisonConfig {
        ComparisonConfig {
            program_name: "program0".to_string(),
            graph_name: "graph0".to_string(),
            target_cores: vec![[1, 1]],
            target_inputs: vec![0],
            ..Default::default()
        }
    }

    #[test]
    fn test_check_value() {
        let check = expected(60.0, 0.1).expect("check");
        assert!(check.check(60.5));
        assert!(!check.check(70.0));
        assert_eq!(
            check.message(60.5, false),
            "Expected 60 Observed 60.5 (higher values are better)"
        );

        let bound = min_bound(100.0).expect("check");
        assert!(bound.check(100.0));
        assert!(!bound.check(99.0));
        assert!(bound.message(99.0, true).starts_with("Min-Bound 100 Observed 99"));

        let overridden = PerfCheckValue {
            expected: Some(0.0),
            override_target: 50.0,
            ..expected(0.0, 0.1).expect("check")
        };
        assert_eq!(overridden.target(), 50.0);
        assert!(overridden.check(52.0));
    }

    #[test]
    fn test_device_checks_pass_and_fail() {
        let cmp = ComparisonConfig {
            math_utilization: expected(60.0, 0.01),
            execution_cycles: expected(400.0, 0.01),
            ..comparison()
        };
        let mut report = CheckReport::default();
        check_device(&perf(cmp), &runtime_table(), &meta(), &mut report);

        assert_eq!(report.checks_run, 2);
        assert!(!report.passed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].metric, "execution_cycles");
        assert_eq!(report.failures[0].target, "1-1-op0 input-0");
        assert!(report.failures[0].message.contains("lower values are better"));
    }

    #[test]
    fn test_na_counts_as_zero() {
        let cmp = ComparisonConfig {
            input0_bw: min_bound(1.0),
            ..comparison()
        };
        let mut report = CheckReport::default();
        check_device(&perf(cmp), &runtime_table(), &meta(), &mut report);
        assert!(!report.passed);
        assert!(report.failures[0].message.contains("Observed 0"));
    }

    #[test]
    fn test_missing_core_and_input_fail() {
        let cmp = ComparisonConfig {
            target_cores: vec![[1, 1], [5, 5]],
            target_inputs: vec![0, 3],
            math_utilization: expected(60.0, 0.01),
            ..comparison()
        };
        let mut report = CheckReport::default();
        check_device(&perf(cmp), &runtime_table(), &meta(), &mut report);

        let metrics: Vec<_> = report.failures.iter().map(|f| f.metric).collect();
        assert_eq!(metrics, vec!["input", "core"]);
        assert_eq!(report.checks_run, 1);
    }

    #[test]
    fn test_target_ops_and_graph_metrics() {
        let cmp = ComparisonConfig {
            target_cores: Vec::new(),
            target_ops: vec!["op0".to_string()],
            average_math_utilization: min_bound(50.0),
            num_inputs_per_second: min_bound(1000.0),
            ..comparison()
        };
        let meta = InstructionMeta {
            throughput: EpochThroughput {
                num_inputs_per_second: Some(2000.0),
                ..Default::default()
            },
            ..meta()
        };
        let mut report = CheckReport::default();
        check_device(&perf(cmp), &runtime_table(), &meta, &mut report);
        assert!(report.passed);
        assert_eq!(report.checks_run, 2);
    }

    #[test]
    fn test_empty_comparison_and_skip() {
        let mut report = CheckReport::default();
        check_device(&perf(comparison()), &runtime_table(), &meta(), &mut report);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].metric, "none");

        let skipped = PerfConfig {
            skip_perf_check: true,
            ..perf(comparison())
        };
        let mut report = CheckReport::default();
        check_device(&skipped, &runtime_table(), &meta(), &mut report);
        check_host(&skipped, 0.0, &mut report);
        assert!(report.passed);
        assert_eq!(report.checks_run, 0);
    }

    #[test]
    fn test_unmatched_epoch_is_not_checked() {
        let cmp = ComparisonConfig {
            graph_name: "other".to_string(),
            ..comparison()
        };
        let mut report = CheckReport::default();
        check_device(&perf(cmp), &runtime_table(), &meta(), &mut report);
        assert_eq!(report, CheckReport::default());
    }

    #[test]
    fn test_host_check() {
        let cmp = ComparisonConfig {
            backend_samples_per_second: min_bound(100.0),
            ..comparison()
        };
        let mut report = CheckReport::default();
        check_host(&perf(cmp.clone()), 150.0, &mut report);
        assert!(report.passed);

        check_host(&perf(cmp), 50.0, &mut report);
        assert!(!report.passed);
        assert_eq!(report.failures[0].target, "host");
        assert_eq!(report.checks_run, 2);
    }
}
