use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::RunRecord;

/// Strict run delta. This is the ONLY way a [`Run`] mutates.
#[derive(Debug, Clone, PartialEq)]
pub enum RunDelta {
    Metadata(RunRecord),
    /// Set-once: ignored when the key already holds a value.
    ConfigSet { key: String, value: Value },
    SummarySet { key: String, value: Value },
    Step(i64),
    Telemetry(Vec<u32>),
    /// Set-once.
    Exit(i32),
    Counted,
}

/// Aggregate state of one tracked run, built from the records the handler accepts.
#[derive(Debug, Clone, Default)]
pub struct Run {
    pub run_id: String,
    pub project: Option<String>,
    pub display_name: Option<String>,
    config: BTreeMap<String, Value>,
    summary: BTreeMap<String, Value>,
    telemetry: Vec<u32>,
    exit_code: Option<i32>,
    /// Next history step to hand out.
    step: i64,
    records_seen: u64,
    /// Monotonic, bumped by every applied delta.
    pub version: u64,
}

impl Run {
    pub fn new(run_id: impl Into<String>, project: Option<String>) -> Self {
        Self {
            run_id: run_id.into(),
            project,
            ..Self::default()
        }
    }

    /// Whether `delta` would change anything. Config conflicts and a second
    /// exit code are the only rejected deltas.
    pub fn accepts(&self, delta: &RunDelta) -> bool {
        match delta {
            RunDelta::ConfigSet { key, value } => match self.config.get(key) {
                Some(existing) => existing == value,
                None => true,
            },
            RunDelta::Exit(_) => self.exit_code.is_none(),
            _ => true,
        }
    }

    /// Pure reduction: Run + Delta -> mutated Run. Returns false when the delta was rejected.
    pub fn reduce(&mut self, delta: RunDelta) -> bool {
        if !self.accepts(&delta) {
            return false;
        }
        self.version += 1;

        match delta {
            RunDelta::Metadata(meta) => {
                if !meta.run_id.is_empty() {
                    self.run_id = meta.run_id;
                }
                if meta.project.is_some() {
                    self.project = meta.project;
                }
                if meta.display_name.is_some() {
                    self.display_name = meta.display_name;
                }
            }
            RunDelta::ConfigSet { key, value } => {
                self.config.entry(key).or_insert(value);
            }
            RunDelta::SummarySet { key, value } => {
                self.summary.insert(key, value);
            }
            RunDelta::Step(step) => {
                // steps only move forward
                self.step = self.step.max(step + 1);
            }
            RunDelta::Telemetry(features) => {
                for feature in features {
                    if !self.telemetry.contains(&feature) {
                        self.telemetry.push(feature);
                    }
                }
            }
            RunDelta::Exit(code) => {
                self.exit_code = Some(code);
            }
            RunDelta::Counted => {
                self.records_seen += 1;
            }
        }
        true
    }

    pub fn next_step(&self) -> i64 {
        self.step
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn config(&self) -> &BTreeMap<String, Value> {
        &self.config
    }

    pub fn summary(&self) -> &BTreeMap<String, Value> {
        &self.summary
    }

    pub fn telemetry(&self) -> &[u32] {
        &self.telemetry
    }

    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            project: self.project.clone(),
            display_name: self.display_name.clone(),
            config: self.config.clone(),
            summary: self.summary.clone(),
            telemetry: self.telemetry.clone(),
            exit_code: self.exit_code,
            history_step: self.step,
            records_seen: self.records_seen,
            version: self.version,
        }
    }
}

/// Consistent copy of a [`Run`], taken under the handler's read lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub project: Option<String>,
    pub display_name: Option<String>,
    pub config: BTreeMap<String, Value>,
    pub summary: BTreeMap<String, Value>,
    pub telemetry: Vec<u32>,
    pub exit_code: Option<i32>,
    pub history_step: i64,
    pub records_seen: u64,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_is_set_once() {
        let mut run = Run::new("r1", None);
        assert!(run.reduce(RunDelta::ConfigSet { key: "lr".into(), value: json!(0.1) }));
        assert!(!run.reduce(RunDelta::ConfigSet { key: "lr".into(), value: json!(0.2) }));
        // same value again is a no-op, not a conflict
        assert!(run.reduce(RunDelta::ConfigSet { key: "lr".into(), value: json!(0.1) }));
        assert_eq!(run.config().get("lr"), Some(&json!(0.1)));
    }

    #[test]
    fn test_summary_overwrites() {
        let mut run = Run::new("r1", None);
        run.reduce(RunDelta::SummarySet { key: "loss".into(), value: json!(1.0) });
        run.reduce(RunDelta::SummarySet { key: "loss".into(), value: json!(0.5) });
        assert_eq!(run.summary().get("loss"), Some(&json!(0.5)));
    }

    #[test]
    fn test_exit_code_set_at_most_once() {
        let mut run = Run::new("r1", None);
        assert!(run.reduce(RunDelta::Exit(0)));
        assert!(!run.reduce(RunDelta::Exit(1)));
        assert_eq!(run.exit_code(), Some(0));
    }

    #[test]
    fn test_telemetry_keeps_first_seen_order() {
        let mut run = Run::new("r1", None);
        run.reduce(RunDelta::Telemetry(vec![3, 8]));
        run.reduce(RunDelta::Telemetry(vec![8, 1]));
        assert_eq!(run.telemetry(), &[3, 8, 1]);
    }

    #[test]
    fn test_version_and_step_are_monotonic() {
        let mut run = Run::new("r1", None);
        run.reduce(RunDelta::Step(4));
        run.reduce(RunDelta::Step(2));
        assert_eq!(run.next_step(), 5);
        assert_eq!(run.version, 2);
        assert!(run.reduce(RunDelta::ConfigSet { key: "a".into(), value: json!(1) }));
        // rejected deltas leave the version alone
        assert!(!run.reduce(RunDelta::ConfigSet { key: "a".into(), value: json!(2) }));
        assert_eq!(run.version, 3);
    }
}
