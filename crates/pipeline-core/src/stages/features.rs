//! Stage 7: feature extraction over whatever artifacts earlier stages left.
//!
//! Always runs as the terminal stage. Every input category other than the
//! samples themselves is optional: a missing reputation report, taint record
//! or dynamic trace narrows the feature set for that sample, it never aborts
//! the run. The aggregate export is rebuilt from the current directory state
//! on every invocation, so re-runs do not accumulate duplicate entries.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::layout::RunLayout;
use crate::stages::{collect_samples, flowdroid, virustotal};

const AGGREGATE_FILE: &str = "features.json";

const MONGODB_DATABASE: &str = "apk_pipeline";
const MONGODB_COLLECTION: &str = "features";

const STATIC_CSV_HEADER: &str =
    "sample,sha256,size,label,vt_positives,vt_total,taint_leaks,taint_sources,api_package_hits,api_class_hits";

/// Derived attributes for one sample across all analysis categories.
/// Fields from categories whose artifacts are absent stay unset.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRecord {
    pub sample: String,
    pub sha256: String,
    pub size: u64,
    /// `benign` / `malicious` from the partition, `unknown` otherwise.
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vt_positives: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vt_total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taint_leaks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taint_sources: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_package_hits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_class_hits: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior_events: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscalls: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_system_commands: Option<u32>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ExtractionSummary {
    pub records: usize,
    pub failed: usize,
    pub exported_csv: bool,
    pub exported_mongodb: bool,
}

/// Load a lookup index: one entry per line, blank lines and `#` comments
/// ignored. A missing index file disables the features depending on it.
fn read_index(path: &Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(path) else {
        debug!(index = %path.display(), "index file not available");
        return Vec::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn label_for(sample: &Path, layout: &RunLayout) -> &'static str {
    match sample.parent() {
        Some(parent) if parent == layout.benign() => "benign",
        Some(parent) if parent == layout.malware() => "malicious",
        _ => "unknown",
    }
}

/// Total occurrences of any index entry in the text.
fn count_hits(text: &str, index: &[String]) -> u32 {
    index
        .iter()
        .map(|entry| text.matches(entry.as_str()).count() as u32)
        .sum()
}

/// Entries across all sections of a behavioral trace.
fn count_behavior_events(behavior: &serde_json::Value) -> u32 {
    let Some(object) = behavior.as_object() else {
        return 0;
    };
    object
        .values()
        .map(|section| match section {
            serde_json::Value::Object(map) => map.len() as u32,
            serde_json::Value::Array(items) => items.len() as u32,
            _ => 0,
        })
        .sum()
}

fn build_record(
    sample: &Path,
    layout: &RunLayout,
    package_index: &[String],
    class_index: &[String],
    command_index: &HashSet<String>,
) -> Result<FeatureRecord> {
    let name = sample.file_name().unwrap_or_default();
    let sample_name = name.to_string_lossy().into_owned();
    let sha256 = virustotal::sha256_file(sample)?;
    let size = fs::metadata(sample)?.len();

    let mut record = FeatureRecord {
        sample: sample_name.clone(),
        sha256,
        size,
        label: label_for(sample, layout).to_string(),
        vt_positives: None,
        vt_total: None,
        taint_leaks: None,
        taint_sources: None,
        api_package_hits: None,
        api_class_hits: None,
        behavior_events: None,
        syscalls: None,
        known_system_commands: None,
    };

    if let Some(report) = virustotal::load_report(&layout.vt_reports(), name) {
        record.vt_positives = Some(report.positives);
        record.vt_total = Some(report.total);
    }

    if let Some(taint) = flowdroid::read_taint_record(&layout.flowdroid_processed(), name) {
        record.taint_leaks = Some(taint.leaks);
        record.taint_sources = Some(taint.sources);
    }

    // API usage is counted over the raw taint traces, where the full method
    // signatures appear.
    let raw_taint = layout.flowdroid_raw().join(format!("{sample_name}.txt"));
    if let Ok(text) = fs::read_to_string(&raw_taint) {
        if !package_index.is_empty() {
            record.api_package_hits = Some(count_hits(&text, package_index));
        }
        if !class_index.is_empty() {
            record.api_class_hits = Some(count_hits(&text, class_index));
        }
    }

    let behavior_path = layout.dynamic_droidbox().join(format!("{sample_name}.json"));
    if let Ok(text) = fs::read_to_string(&behavior_path) {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(behavior) => record.behavior_events = Some(count_behavior_events(&behavior)),
            Err(e) => warn!(artifact = %behavior_path.display(), error = %e, "unreadable behavioral trace"),
        }
    }

    let strace_path = layout.dynamic_strace().join(format!("{sample_name}.csv"));
    if let Ok(text) = fs::read_to_string(&strace_path) {
        let mut syscalls = 0;
        let mut known = 0;
        for line in text.lines().skip(1) {
            syscalls += 1;
            if let Some(syscall) = line.split(',').nth(1) {
                if command_index.contains(syscall.trim()) {
                    known += 1;
                }
            }
        }
        record.syscalls = Some(syscalls);
        if !command_index.is_empty() {
            record.known_system_commands = Some(known);
        }
    }

    Ok(record)
}

/// Produce one feature record per sample and export the aggregate.
pub fn extract(config: &RunConfig, layout: &RunLayout) -> Result<ExtractionSummary> {
    let features_dir = layout.features();
    let tmp_dir = layout.features_tmp();
    RunLayout::ensure(&features_dir)?;
    RunLayout::ensure(&tmp_dir)?;

    let package_index = read_index(&config.package_index);
    let class_index = read_index(&config.class_index);
    let command_index: HashSet<String> =
        read_index(&config.system_commands_index).into_iter().collect();

    let mut summary = ExtractionSummary::default();
    let mut records = Vec::new();
    for sample in collect_samples(&layout.samples()) {
        let record =
            match build_record(&sample, layout, &package_index, &class_index, &command_index) {
                Ok(record) => record,
                Err(e) => {
                    warn!(sample = %sample.display(), error = %e, "sample skipped");
                    summary.failed += 1;
                    continue;
                }
            };
        // Working copy per sample; a crash mid-batch leaves these behind
        // for inspection.
        let serialized = serde_json::to_string_pretty(&record)?;
        fs::write(tmp_dir.join(format!("{}.json", record.sample)), &serialized)?;
        if config.single {
            fs::write(features_dir.join(format!("{}.json", record.sample)), &serialized)?;
        }
        records.push(record);
    }
    records.sort_by(|a, b| a.sample.cmp(&b.sample));
    summary.records = records.len();

    // The aggregate mirrors the current directory state, nothing more.
    fs::write(
        features_dir.join(AGGREGATE_FILE),
        serde_json::to_string_pretty(&records)?,
    )?;

    if let Some(path) = &config.export_csv {
        write_static_csv(path, &records)?;
        summary.exported_csv = true;
    }
    if let Some(uri) = &config.mongodb_uri {
        export_mongodb(uri, &records)?;
        summary.exported_mongodb = true;
    }

    if !config.nocleanup {
        if let Err(e) = fs::remove_dir_all(&tmp_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }
    Ok(summary)
}

fn csv_opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

/// Static features only; dynamic columns are deliberately not exported.
fn write_static_csv(path: &Path, records: &[FeatureRecord]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    writeln!(file, "{STATIC_CSV_HEADER}")?;
    for r in records {
        let sample = r.sample.replace('"', "\"\"");
        writeln!(
            file,
            "\"{}\",{},{},{},{},{},{},{},{},{}",
            sample,
            r.sha256,
            r.size,
            r.label,
            csv_opt(&r.vt_positives),
            csv_opt(&r.vt_total),
            csv_opt(&r.taint_leaks),
            csv_opt(&r.taint_sources),
            csv_opt(&r.api_package_hits),
            csv_opt(&r.api_class_hits),
        )?;
    }
    Ok(())
}

/// Upsert keyed by sha256 so the external store stays duplicate-free across
/// re-runs, same as the file exports.
fn export_mongodb(uri: &str, records: &[FeatureRecord]) -> Result<()> {
    use mongodb::bson;
    use mongodb::options::ReplaceOptions;
    use mongodb::sync::Client;

    let uri = if uri.contains("://") {
        uri.to_string()
    } else {
        format!("mongodb://{uri}")
    };
    let client = Client::with_uri_str(&uri).map_err(|e| PipelineError::export(e.to_string()))?;
    let collection = client
        .database(MONGODB_DATABASE)
        .collection::<bson::Document>(MONGODB_COLLECTION);
    for record in records {
        let document =
            bson::to_document(record).map_err(|e| PipelineError::export(e.to_string()))?;
        let options = ReplaceOptions::builder().upsert(true).build();
        collection
            .replace_one(bson::doc! { "sha256": record.sha256.as_str() }, document, options)
            .map_err(|e| PipelineError::export(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    use crate::stages::virustotal::{report_file_name, VtReport};

    fn test_config(root: &Path) -> RunConfig {
        let mut config = RunConfig::new(root);
        // Point the indexes somewhere definitely absent by default.
        config.package_index = root.join("no_package_index.txt");
        config.class_index = root.join("no_class_index.txt");
        config.system_commands_index = root.join("no_commands_index.txt");
        config
    }

    fn seed_sample(dir: &Path, name: &str) {
        RunLayout::ensure(dir).unwrap();
        fs::write(dir.join(name), b"PK\x03\x04content").unwrap();
    }

    fn parse_aggregate(layout: &RunLayout) -> Vec<serde_json::Value> {
        let text = fs::read_to_string(layout.features().join(AGGREGATE_FILE)).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn degraded_extraction_still_yields_one_record_per_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let config = test_config(tmp.path());
        seed_sample(&layout.samples(), "a.apk");
        seed_sample(&layout.samples(), "b.apk");

        let summary = extract(&config, &layout).unwrap();

        assert_eq!(summary.records, 2);
        assert_eq!(summary.failed, 0);

        let aggregate = parse_aggregate(&layout);
        assert_eq!(aggregate.len(), 2);
        // No artifacts: category-dependent fields are absent, not null.
        assert_eq!(aggregate[0]["label"], "unknown");
        assert!(aggregate[0].get("vt_positives").is_none());
        assert!(aggregate[0].get("taint_leaks").is_none());
        assert!(aggregate[0].get("behavior_events").is_none());
    }

    #[test]
    fn labels_follow_the_partition_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let config = test_config(tmp.path());
        seed_sample(&layout.benign(), "bw.apk");
        seed_sample(&layout.malware(), "mw.apk");
        seed_sample(&layout.samples(), "plain.apk");

        extract(&config, &layout).unwrap();

        let by_name: std::collections::HashMap<String, String> = parse_aggregate(&layout)
            .into_iter()
            .map(|v| {
                (
                    v["sample"].as_str().unwrap().to_string(),
                    v["label"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(by_name["bw.apk"], "benign");
        assert_eq!(by_name["mw.apk"], "malicious");
        assert_eq!(by_name["plain.apk"], "unknown");
    }

    #[test]
    fn artifacts_populate_their_feature_categories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let mut config = test_config(tmp.path());
        seed_sample(&layout.samples(), "a.apk");

        // Reputation report.
        RunLayout::ensure(&layout.vt_reports()).unwrap();
        let report = VtReport {
            sha256: "abc".into(),
            positives: 7,
            total: 60,
            permalink: String::new(),
            detection_names: Vec::new(),
        };
        fs::write(
            layout.vt_reports().join(report_file_name(OsStr::new("a.apk"))),
            serde_json::to_string(&report).unwrap(),
        )
        .unwrap();

        // Raw and normalized taint outputs.
        RunLayout::ensure(&layout.flowdroid_raw()).unwrap();
        fs::write(
            layout.flowdroid_raw().join("a.apk.txt"),
            "Found a flow to sink android.telephony.SmsManager.sendTextMessage\n",
        )
        .unwrap();
        RunLayout::ensure(&layout.flowdroid_processed()).unwrap();
        fs::write(
            layout.flowdroid_processed().join("a.apk.csv"),
            "sample,leaks,sources\n\"a.apk\",1,2\n",
        )
        .unwrap();

        // Dynamic traces.
        RunLayout::ensure(&layout.dynamic_droidbox()).unwrap();
        fs::write(
            layout.dynamic_droidbox().join("a.apk.json"),
            r#"{"opennet":{"0.4":{}},"sendsms":{"1.1":{},"2.2":{}}}"#,
        )
        .unwrap();
        RunLayout::ensure(&layout.dynamic_strace()).unwrap();
        fs::write(
            layout.dynamic_strace().join("a.apk.csv"),
            "time,syscall,arguments\n0.1,open,\"\"\n0.2,chmod,\"\"\n0.3,read,\"\"\n",
        )
        .unwrap();

        // Index files.
        fs::write(tmp.path().join("packages.txt"), "android.telephony\n").unwrap();
        fs::write(tmp.path().join("commands.txt"), "# shell commands\nchmod\nmount\n").unwrap();
        config.package_index = tmp.path().join("packages.txt");
        config.system_commands_index = tmp.path().join("commands.txt");

        extract(&config, &layout).unwrap();

        let aggregate = parse_aggregate(&layout);
        let record = &aggregate[0];
        assert_eq!(record["vt_positives"], 7);
        assert_eq!(record["vt_total"], 60);
        assert_eq!(record["taint_leaks"], 1);
        assert_eq!(record["taint_sources"], 2);
        assert_eq!(record["api_package_hits"], 1);
        // Class index was not supplied, so the field stays absent.
        assert!(record.get("api_class_hits").is_none());
        assert_eq!(record["behavior_events"], 3);
        assert_eq!(record["syscalls"], 3);
        assert_eq!(record["known_system_commands"], 1);
    }

    #[test]
    fn rerun_does_not_accumulate_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let mut config = test_config(tmp.path());
        config.nocleanup = true;
        seed_sample(&layout.samples(), "a.apk");
        seed_sample(&layout.samples(), "b.apk");

        extract(&config, &layout).unwrap();
        extract(&config, &layout).unwrap();

        assert_eq!(parse_aggregate(&layout).len(), 2);
    }

    #[test]
    fn single_mode_writes_one_report_per_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let mut config = test_config(tmp.path());
        config.single = true;
        seed_sample(&layout.samples(), "a.apk");

        extract(&config, &layout).unwrap();

        assert!(layout.features().join("a.apk.json").is_file());
        assert!(layout.features().join(AGGREGATE_FILE).is_file());
    }

    #[test]
    fn csv_export_contains_static_columns_only() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let mut config = test_config(tmp.path());
        let csv_path = tmp.path().join("export.csv");
        config.export_csv = Some(csv_path.clone());
        seed_sample(&layout.samples(), "a.apk");

        let summary = extract(&config, &layout).unwrap();
        assert!(summary.exported_csv);

        let csv = fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], STATIC_CSV_HEADER);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("\"a.apk\","));
        // Absent categories export as empty fields.
        assert!(lines[1].ends_with(",,,,,"));
    }

    #[test]
    fn cleanup_removes_the_working_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let config = test_config(tmp.path());
        seed_sample(&layout.samples(), "a.apk");

        extract(&config, &layout).unwrap();

        assert!(!layout.features_tmp().exists());
    }

    #[test]
    fn nocleanup_keeps_the_working_files() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        let mut config = test_config(tmp.path());
        config.nocleanup = true;
        seed_sample(&layout.samples(), "a.apk");

        extract(&config, &layout).unwrap();

        assert!(layout.features_tmp().join("a.apk.json").is_file());
    }

    #[test]
    fn read_index_skips_blanks_and_comments() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.txt");
        fs::write(&path, "# header\n\nandroid.net\n  android.os  \n").unwrap();

        let index = read_index(&path);
        assert_eq!(index, vec!["android.net", "android.os"]);
    }

    #[test]
    fn count_hits_sums_occurrences_across_entries() {
        let index = vec!["android.net".to_string(), "android.os".to_string()];
        let text = "android.net.Uri android.net.Socket android.os.Build";
        assert_eq!(count_hits(text, &index), 3);
    }
}
