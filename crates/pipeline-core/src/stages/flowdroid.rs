//! Stages 4 and 5: FlowDroid taint analysis and raw-output normalization.
//!
//! FlowDroid is an external Java tool located through the `FLOWDROID_JAR`
//! environment variable. The adapter shells out once per sample and captures
//! stdout as the raw artifact; a nonzero exit writes a `.failed` marker for
//! that sample and the batch continues. A missing jar (or missing `java`)
//! aborts the stage before any sample is attempted.
//!
//! Normalization turns each raw output into a per-sample CSV record plus one
//! aggregate table across all samples.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::layout::RunLayout;
use crate::stages::collect_samples;

const JAR_ENV: &str = "FLOWDROID_JAR";
const DEFAULT_JAR: &str = "flowdroid.jar";
/// Android platforms directory handed to FlowDroid when set.
const PLATFORMS_ENV: &str = "ANDROID_PLATFORMS";

/// Raw-output line markers. One leak line is printed per discovered flow;
/// the sources feeding it are enumerated as dash-prefixed lines below it.
const LEAK_MARKER: &str = "Found a flow to sink";
const SOURCE_PREFIX: &str = "- ";

const CSV_HEADER: &str = "sample,leaks,sources";

#[derive(Debug, Default, Clone, Serialize)]
pub struct StaticSummary {
    pub analyzed: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcessedSummary {
    pub processed: usize,
    /// Failure markers encountered; those samples have no normalized record.
    pub skipped: usize,
}

/// Normalized taint counts for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaintRecord {
    pub sample: String,
    pub leaks: u32,
    pub sources: u32,
}

fn jar_path() -> PathBuf {
    env::var_os(JAR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_JAR))
}

/// Run the taint analysis over every sample. One raw artifact (or failure
/// marker) per sample lands in `FlowDroid_outputs/`.
pub fn run_flowdroid(layout: &RunLayout) -> Result<StaticSummary> {
    run_flowdroid_with_jar(&jar_path(), layout)
}

pub(crate) fn run_flowdroid_with_jar(jar: &Path, layout: &RunLayout) -> Result<StaticSummary> {
    if !jar.is_file() {
        return Err(PipelineError::missing_tool(
            "FlowDroid".to_string(),
            format!("set {JAR_ENV} to the analysis jar"),
        ));
    }
    let out_dir = layout.flowdroid_raw();
    RunLayout::ensure(&out_dir)?;

    let platforms = env::var_os(PLATFORMS_ENV);
    let mut summary = StaticSummary::default();

    for sample in collect_samples(&layout.samples()) {
        let Some(name) = sample.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        let mut cmd = Command::new("java");
        cmd.arg("-jar").arg(jar).arg("-a").arg(&sample);
        if let Some(dir) = &platforms {
            cmd.arg("-p").arg(dir);
        }
        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::missing_tool("java".to_string(), "install a JRE".to_string())
            } else {
                e.into()
            }
        })?;

        if output.status.success() {
            fs::write(out_dir.join(format!("{name}.txt")), &output.stdout)?;
            debug!(sample = name, "taint analysis finished");
            summary.analyzed += 1;
        } else {
            let mut marker = fs::File::create(out_dir.join(format!("{name}.failed")))?;
            marker.write_all(&output.stdout)?;
            marker.write_all(&output.stderr)?;
            warn!(sample = name, status = %output.status, "taint analysis failed");
            summary.failed += 1;
        }
    }
    Ok(summary)
}

/// Count leak and source lines in one raw FlowDroid output.
pub fn parse_raw_output(text: &str) -> (u32, u32) {
    let mut leaks = 0;
    let mut sources = 0;
    for line in text.lines() {
        if line.contains(LEAK_MARKER) {
            leaks += 1;
        } else if line.trim_start().starts_with(SOURCE_PREFIX) {
            sources += 1;
        }
    }
    (leaks, sources)
}

/// Normalize every raw output into `FlowDroid_processed/`: one CSV record
/// per sample plus the aggregate `flowdroid_global.csv` table.
pub fn process_outputs(layout: &RunLayout) -> Result<ProcessedSummary> {
    let raw_dir = layout.flowdroid_raw();
    let processed_dir = layout.flowdroid_processed();
    RunLayout::ensure(&processed_dir)?;

    let mut summary = ProcessedSummary::default();
    let mut records = Vec::new();

    if raw_dir.is_dir() {
        for entry in fs::read_dir(&raw_dir)? {
            let path = entry?.path();
            match path.extension().and_then(OsStr::to_str) {
                Some("txt") => {}
                Some("failed") => {
                    summary.skipped += 1;
                    continue;
                }
                _ => continue,
            }
            let Some(sample) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            let text = fs::read_to_string(&path)?;
            let (leaks, sources) = parse_raw_output(&text);
            records.push(TaintRecord {
                sample: sample.to_string(),
                leaks,
                sources,
            });
        }
    }
    records.sort_by(|a, b| a.sample.cmp(&b.sample));

    for record in &records {
        let path = processed_dir.join(format!("{}.csv", record.sample));
        write_records(&path, std::slice::from_ref(record))?;
    }
    write_records(&layout.flowdroid_global_csv(), &records)?;

    summary.processed = records.len();
    Ok(summary)
}

fn write_records(path: &Path, records: &[TaintRecord]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "{CSV_HEADER}")?;
    for record in records {
        // Escape the one free-form field; counts need no quoting.
        let sample = record.sample.replace('"', "\"\"");
        writeln!(file, "\"{}\",{},{}", sample, record.leaks, record.sources)?;
    }
    Ok(())
}

/// Read one sample's normalized record back, if normalization produced one.
pub fn read_taint_record(processed_dir: &Path, sample_name: &OsStr) -> Option<TaintRecord> {
    let Some(sample) = sample_name.to_str() else {
        return None;
    };
    let text = fs::read_to_string(processed_dir.join(format!("{sample}.csv"))).ok()?;
    let line = text.lines().nth(1)?;
    // Fields are written as "sample",leaks,sources; parse from the right so
    // quoted sample names with commas survive.
    let mut tail = line.rsplitn(3, ',');
    let sources = tail.next()?.trim().parse().ok()?;
    let leaks = tail.next()?.trim().parse().ok()?;
    Some(TaintRecord {
        sample: sample.to_string(),
        leaks,
        sources,
    })
}
