use std::fmt::Write;

use crate::run::RunSnapshot;
use crate::settings::Settings;

const MAX_SUMMARY_ROWS: usize = 20;

/// Human readable summary of a finished run.
pub fn render(run: &RunSnapshot, settings: &Settings) -> String {
    let mut out = String::new();
    let name = run.display_name.as_deref().unwrap_or(&run.run_id);
    let _ = writeln!(out, "Run {} ({})", name, run.run_id);
    if let Some(project) = &run.project {
        let _ = writeln!(out, "  project:    {}", project);
    }
    match run.exit_code {
        Some(code) => {
            let _ = writeln!(out, "  exit code:  {}", code);
        }
        None => {
            let _ = writeln!(out, "  exit code:  (none)");
        }
    }
    let _ = writeln!(out, "  records:    {}", run.records_seen);
    let _ = writeln!(out, "  history:    {} steps", run.history_step);

    if !run.summary.is_empty() {
        let width = run
            .summary
            .keys()
            .take(MAX_SUMMARY_ROWS)
            .map(|k| k.len())
            .max()
            .unwrap_or(0);
        let _ = writeln!(out, "  summary:");
        for (key, value) in run.summary.iter().take(MAX_SUMMARY_ROWS) {
            let _ = writeln!(out, "    {:>width$} {}", key, value, width = width);
        }
        if run.summary.len() > MAX_SUMMARY_ROWS {
            let _ = writeln!(out, "    ... {} more", run.summary.len() - MAX_SUMMARY_ROWS);
        }
    }

    if !run.telemetry.is_empty() {
        let features: Vec<String> = run.telemetry.iter().map(u32::to_string).collect();
        let _ = writeln!(out, "  features:   {}", features.join(", "));
    }

    let _ = writeln!(out, "  log:        {}", settings.log_path().display());
    if settings.offline {
        let _ = writeln!(out, "  offline run: replay the log above to upload it");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_mentions_exit_summary_and_features() {
        let mut run = RunSnapshot {
            run_id: "abc".into(),
            exit_code: Some(0),
            telemetry: vec![3, 8],
            ..RunSnapshot::default()
        };
        run.summary.insert("loss".into(), json!(0.25));
        let settings = Settings {
            run_id: "abc".into(),
            offline: true,
            ..Settings::default()
        };

        let text = render(&run, &settings);
        assert!(text.contains("exit code:  0"));
        assert!(text.contains("loss 0.25"));
        assert!(text.contains("features:   3, 8"));
        assert!(text.contains("run-abc.nexus"));
        assert!(text.contains("offline run"));
    }
}
