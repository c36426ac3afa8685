//! Declarative checks against finished runs.
//!
//! An [`Assertions`] block describes what a scenario should have produced, for
//! example:
//!
//! ```json
//! { "runs_len": 1, "exitcode": 0, "config": {}, "telemetry": [{ "index": 3, "contains": 8 }] }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::run::RunSnapshot;

/// `index: None` checks membership anywhere in the feature list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelemetryCheck {
    #[serde(default)]
    pub index: Option<usize>,
    pub contains: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Assertions {
    pub runs_len: Option<usize>,
    /// Exact match.
    pub config: Option<BTreeMap<String, Value>>,
    pub exitcode: Option<i32>,
    /// Every listed key must be present with this value; other keys are ignored.
    pub summary: Option<BTreeMap<String, Value>>,
    pub telemetry: Vec<TelemetryCheck>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub run: Option<usize>,
    pub check: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(run) = self.run {
            write!(f, "run {}: ", run)?;
        }
        write!(f, "{}: expected {}, got {}", self.check, self.expected, self.actual)
    }
}

impl Assertions {
    /// Checks every run against the per-run assertions, plus the run count.
    pub fn evaluate(&self, runs: &[RunSnapshot]) -> Vec<Failure> {
        let mut failures = Vec::new();

        if let Some(expected) = self.runs_len {
            if runs.len() != expected {
                failures.push(Failure {
                    run: None,
                    check: "runs_len".into(),
                    expected: expected.to_string(),
                    actual: runs.len().to_string(),
                });
            }
        }

        for (i, run) in runs.iter().enumerate() {
            self.evaluate_run(i, run, &mut failures);
        }
        failures
    }

    fn evaluate_run(&self, i: usize, run: &RunSnapshot, failures: &mut Vec<Failure>) {
        let mut fail = |check: String, expected: String, actual: String| {
            failures.push(Failure {
                run: Some(i),
                check,
                expected,
                actual,
            })
        };

        if let Some(expected) = &self.config {
            if &run.config != expected {
                fail("config".into(), render(expected), render(&run.config));
            }
        }

        if let Some(expected) = self.exitcode {
            if run.exit_code != Some(expected) {
                let actual = run
                    .exit_code
                    .map_or_else(|| "no exit code".to_string(), |c| c.to_string());
                fail("exitcode".into(), expected.to_string(), actual);
            }
        }

        if let Some(expected) = &self.summary {
            for (key, value) in expected {
                let actual = run.summary.get(key);
                if actual != Some(value) {
                    fail(
                        format!("summary[{}]", key),
                        value.to_string(),
                        actual.map_or_else(|| "missing".to_string(), Value::to_string),
                    );
                }
            }
        }

        for check in &self.telemetry {
            match check.index {
                Some(index) => {
                    let actual = run.telemetry.get(index).copied();
                    if actual != Some(check.contains) {
                        fail(
                            format!("telemetry[{}]", index),
                            check.contains.to_string(),
                            actual.map_or_else(|| "out of range".to_string(), |v| v.to_string()),
                        );
                    }
                }
                None => {
                    if !run.telemetry.contains(&check.contains) {
                        fail(
                            "telemetry".into(),
                            format!("to contain {}", check.contains),
                            format!("{:?}", run.telemetry),
                        );
                    }
                }
            }
        }
    }
}

fn render(map: &BTreeMap<String, Value>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| format!("{:?}", map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished_run() -> RunSnapshot {
        RunSnapshot {
            run_id: "r1".into(),
            exit_code: Some(0),
            telemetry: vec![1, 2, 5, 8],
            ..RunSnapshot::default()
        }
    }

    #[test]
    fn test_passing_assertions() {
        let assertions: Assertions = serde_json::from_value(json!({
            "runs_len": 1,
            "exitcode": 0,
            "config": {},
            "telemetry": [{ "index": 3, "contains": 8 }, { "contains": 5 }]
        }))
        .unwrap();

        assert!(assertions.evaluate(&[finished_run()]).is_empty());
    }

    #[test]
    fn test_failures_name_the_check() {
        let assertions = Assertions {
            runs_len: Some(2),
            exitcode: Some(1),
            telemetry: vec![TelemetryCheck { index: Some(0), contains: 8 }],
            ..Assertions::default()
        };

        let failures = assertions.evaluate(&[finished_run()]);
        let checks: Vec<&str> = failures.iter().map(|f| f.check.as_str()).collect();
        assert_eq!(checks, vec!["runs_len", "exitcode", "telemetry[0]"]);
        assert_eq!(failures[2].to_string(), "run 0: telemetry[0]: expected 8, got 1");
    }

    #[test]
    fn test_summary_is_a_subset_check() {
        let mut run = finished_run();
        run.summary.insert("loss".into(), json!(0.1));
        run.summary.insert("acc".into(), json!(0.9));

        let assertions = Assertions {
            summary: Some([("acc".to_string(), json!(0.9))].into_iter().collect()),
            ..Assertions::default()
        };
        assert!(assertions.evaluate(&[run.clone()]).is_empty());

        let assertions = Assertions {
            summary: Some([("f1".to_string(), json!(0.5))].into_iter().collect()),
            ..Assertions::default()
        };
        assert_eq!(assertions.evaluate(&[run])[0].actual, "missing");
    }
}
