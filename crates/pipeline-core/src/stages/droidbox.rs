//! Stage 6: DroidBox dynamic analysis and raw-output splitting.
//!
//! The sandbox is an external tool located through `DROIDBOX_HOME`. Each
//! sample runs for at most the configured duration; a run that overshoots
//! the bound plus a small grace period is killed so one hung emulator cannot
//! block the batch. The tool prints its result JSON on stdout, captured as
//! the raw artifact. Splitting then separates each raw result into a
//! behavioral-trace JSON and a syscall-trace CSV.
//!
//! The launcher chdirs into its own home as a side effect; the orchestrator
//! wraps this stage in a working-directory guard.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::layout::RunLayout;
use crate::stages::collect_samples;

const HOME_ENV: &str = "DROIDBOX_HOME";
const LAUNCHER: &str = "droidbox.sh";

/// Wall-clock allowance past the configured duration before a run is killed.
const KILL_GRACE: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Key of the syscall trace inside the raw result JSON; everything else is
/// the behavioral trace.
const STRACE_KEY: &str = "strace";

const STRACE_CSV_HEADER: &str = "time,syscall,arguments";

#[derive(Debug, Default, Clone, Serialize)]
pub struct DynamicSummary {
    pub analyzed: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub behavior_records: usize,
    pub syscall_records: usize,
}

fn droidbox_home() -> Result<PathBuf> {
    env::var_os(HOME_ENV).map(PathBuf::from).ok_or_else(|| {
        PipelineError::missing_tool(
            "DroidBox".to_string(),
            format!("set {HOME_ENV} to the sandbox installation"),
        )
    })
}

/// Run the sandbox over every sample, one raw JSON artifact per sample in
/// `DroidBox_outputs/`.
pub fn run_droidbox(layout: &RunLayout, duration_secs: u64) -> Result<DynamicSummary> {
    run_droidbox_from(&droidbox_home()?, layout, duration_secs)
}

pub(crate) fn run_droidbox_from(
    home: &Path,
    layout: &RunLayout,
    duration_secs: u64,
) -> Result<DynamicSummary> {
    let launcher = home.join(LAUNCHER);
    if !launcher.is_file() {
        return Err(PipelineError::missing_tool(
            "DroidBox".to_string(),
            format!("no {LAUNCHER} under {}", home.display()),
        ));
    }
    let out_dir = layout.droidbox_raw();
    RunLayout::ensure(&out_dir)?;

    let mut summary = DynamicSummary::default();
    for sample in collect_samples(&layout.samples()) {
        let Some(name) = sample.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        let raw_path = out_dir.join(format!("{name}.json"));
        let raw_file = fs::File::create(&raw_path)?;

        let mut child = Command::new(&launcher)
            .arg(&sample)
            .arg(duration_secs.to_string())
            .current_dir(home)
            .stdout(Stdio::from(raw_file))
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + Duration::from_secs(duration_secs) + KILL_GRACE;
        loop {
            match child.try_wait()? {
                Some(status) if status.success() => {
                    debug!(sample = name, "sandbox run finished");
                    summary.analyzed += 1;
                    break;
                }
                Some(status) => {
                    warn!(sample = name, %status, "sandbox run failed");
                    summary.failed += 1;
                    break;
                }
                None if Instant::now() >= deadline => {
                    // Hung run; kill it and move on to the next sample.
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(sample = name, "sandbox run killed after the duration bound");
                    summary.timed_out += 1;
                    break;
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
    Ok(summary)
}

/// Split every raw result into its behavioral-trace JSON (under
/// `Dynamic/Droidbox/`) and its syscall-trace CSV (under `Dynamic/Strace/`).
pub fn split_outputs(layout: &RunLayout, summary: &mut DynamicSummary) -> Result<()> {
    let raw_dir = layout.droidbox_raw();
    let behavior_dir = layout.dynamic_droidbox();
    let strace_dir = layout.dynamic_strace();
    RunLayout::ensure(&behavior_dir)?;
    RunLayout::ensure(&strace_dir)?;

    if !raw_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&raw_dir)? {
        let path = entry?.path();
        if path.extension() != Some(OsStr::new("json")) {
            continue;
        }
        let Some(raw_name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        let Some(sample) = path.file_stem().and_then(OsStr::to_str) else {
            continue;
        };
        let text = fs::read_to_string(&path)?;
        let mut value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(artifact = raw_name, error = %e, "discarding malformed sandbox result");
                continue;
            }
        };
        let Some(object) = value.as_object_mut() else {
            warn!(artifact = raw_name, "sandbox result is not an object");
            continue;
        };

        let strace = object.remove(STRACE_KEY);
        fs::write(
            behavior_dir.join(raw_name),
            serde_json::to_string_pretty(&value)?,
        )?;
        summary.behavior_records += 1;

        let mut csv = fs::File::create(strace_dir.join(format!("{sample}.csv")))?;
        writeln!(csv, "{STRACE_CSV_HEADER}")?;
        if let Some(entries) = strace.as_ref().and_then(|s| s.as_array()) {
            for entry in entries {
                let time = entry
                    .get("time")
                    .map(json_scalar)
                    .unwrap_or_default();
                let syscall = entry
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown");
                let arguments = entry
                    .get("arguments")
                    .map(json_scalar)
                    .unwrap_or_default()
                    .replace('"', "\"\"");
                writeln!(csv, "{time},{syscall},\"{arguments}\"")?;
                summary.syscall_records += 1;
            }
        }
    }
    Ok(())
}

fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_result() -> serde_json::Value {
        serde_json::json!({
            "apkName": "app.apk",
            "opennet": { "0.4": { "desthost": "10.0.0.1", "destport": "80" } },
            "sendsms": {},
            "strace": [
                { "time": "0.12", "name": "open", "arguments": "/data/local, O_RDONLY" },
                { "time": "0.51", "name": "write" },
                { "time": 1.02, "name": "clock_gettime", "arguments": "CLOCK_MONOTONIC" }
            ]
        })
    }

    #[test]
    fn missing_home_is_a_fatal_stage_error() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());

        let err = run_droidbox_from(Path::new("/nonexistent/droidbox"), &layout, 5).unwrap_err();
        assert!(matches!(err, PipelineError::MissingTool { .. }));
    }

    #[test]
    fn split_separates_behavior_and_syscall_traces() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        RunLayout::ensure(&layout.droidbox_raw()).unwrap();
        fs::write(
            layout.droidbox_raw().join("app.apk.json"),
            serde_json::to_string(&raw_result()).unwrap(),
        )
        .unwrap();

        let mut summary = DynamicSummary::default();
        split_outputs(&layout, &mut summary).unwrap();

        assert_eq!(summary.behavior_records, 1);
        assert_eq!(summary.syscall_records, 3);

        let behavior = fs::read_to_string(layout.dynamic_droidbox().join("app.apk.json")).unwrap();
        let behavior: serde_json::Value = serde_json::from_str(&behavior).unwrap();
        assert!(behavior.get("strace").is_none());
        assert!(behavior.get("opennet").is_some());

        let csv = fs::read_to_string(layout.dynamic_strace().join("app.apk.csv")).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "time,syscall,arguments");
        assert_eq!(lines[1], "0.12,open,\"/data/local, O_RDONLY\"");
        // Missing arguments degrade to an empty field, not an error.
        assert_eq!(lines[2], "0.51,write,\"\"");
        assert_eq!(lines[3], "1.02,clock_gettime,\"CLOCK_MONOTONIC\"");
    }

    #[test]
    fn malformed_raw_result_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        RunLayout::ensure(&layout.droidbox_raw()).unwrap();
        fs::write(layout.droidbox_raw().join("bad.apk.json"), "{nope").unwrap();

        let mut summary = DynamicSummary::default();
        split_outputs(&layout, &mut summary).unwrap();

        assert_eq!(summary.behavior_records, 0);
        assert!(!layout.dynamic_droidbox().join("bad.apk.json").exists());
    }

    #[test]
    fn split_without_raw_outputs_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());

        let mut summary = DynamicSummary::default();
        split_outputs(&layout, &mut summary).unwrap();

        assert_eq!(summary.behavior_records, 0);
        assert_eq!(summary.syscall_records, 0);
    }
}
