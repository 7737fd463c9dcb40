//! Stage 2: reputation lookups against the VirusTotal v3 API.
//!
//! One JSON report is written per sample into `VT_analysis/`, keyed by the
//! sample's file name, so partitioning and feature extraction can join on
//! identity without re-hashing. A lookup failure for one sample leaves that
//! sample unclassified and the batch continues; only an unreadable samples
//! directory aborts the stage. Built-in rate limiting keeps requests under
//! the free-tier 4 req/min limit.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::layout::RunLayout;
use crate::stages::collect_samples;

const VT_API_BASE: &str = "https://www.virustotal.com/api/v3";

/// Minimum interval between API calls (15.5 s = ~3.87 req/min).
const RATE_LIMIT_INTERVAL: Duration = Duration::from_millis(15_500);

/// Reputation report for one sample, as persisted in `VT_analysis/`.
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VtReport {
    pub sha256: String,
    /// Engines flagging the sample as malicious or suspicious.
    pub positives: u32,
    pub total: u32,
    pub permalink: String,
    pub detection_names: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReputationSummary {
    /// Samples with a report written to disk.
    pub reported: usize,
    /// Samples the service has never seen (404).
    pub unknown: usize,
    /// Samples whose lookup failed; they stay unclassified.
    pub failed: usize,
}

#[derive(Debug)]
pub struct VirusTotalClient {
    api_key: String,
    client: reqwest::blocking::Client,
    last_request: Option<Instant>,
}

impl VirusTotalClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::blocking::Client::new(),
            last_request: None,
        }
    }

    /// Enforce rate limiting by sleeping if needed.
    fn rate_limit(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < RATE_LIMIT_INTERVAL {
                std::thread::sleep(RATE_LIMIT_INTERVAL - elapsed);
            }
        }
        self.last_request = Some(Instant::now());
    }

    /// Look up a SHA-256 hash. `Ok(None)` means the file is unknown to the
    /// service (404); that sample ends up unclassified, not failed.
    pub fn lookup_hash(&mut self, sha256: &str) -> Result<Option<VtReport>> {
        self.rate_limit();

        let url = format!("{VT_API_BASE}/files/{sha256}");
        let resp = self
            .client
            .get(&url)
            .header("x-apikey", &self.api_key)
            .send()
            .map_err(|e| PipelineError::stage("virustotal", e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(PipelineError::stage(
                "virustotal",
                format!("API error (HTTP {status}): {body}"),
            ));
        }

        let json: serde_json::Value = resp
            .json()
            .map_err(|e| PipelineError::stage("virustotal", e.to_string()))?;
        Ok(Some(parse_vt_response(sha256, &json)))
    }
}

/// Parse a VT v3 API JSON response into a `VtReport`.
pub fn parse_vt_response(sha256: &str, json: &serde_json::Value) -> VtReport {
    let data = &json["data"]["attributes"];
    let stats = &data["last_analysis_stats"];
    let results = &data["last_analysis_results"];

    let positives =
        stats["malicious"].as_u64().unwrap_or(0) + stats["suspicious"].as_u64().unwrap_or(0);
    let total = positives
        + stats["undetected"].as_u64().unwrap_or(0)
        + stats["harmless"].as_u64().unwrap_or(0)
        + stats["timeout"].as_u64().unwrap_or(0)
        + stats["failure"].as_u64().unwrap_or(0);

    let mut detection_names = Vec::new();
    if let Some(obj) = results.as_object() {
        for (engine, result) in obj {
            if let Some(cat) = result["category"].as_str() {
                if cat == "malicious" || cat == "suspicious" {
                    let name = result["result"].as_str().unwrap_or("unknown");
                    detection_names.push(format!("{engine}:{name}"));
                }
            }
        }
    }
    detection_names.sort();

    let permalink = format!("https://www.virustotal.com/gui/file/{sha256}");

    VtReport {
        sha256: sha256.to_string(),
        positives: positives as u32,
        total: total as u32,
        permalink,
        detection_names,
    }
}

/// Compute SHA-256 hash of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    let hash = Sha256::digest(&data);
    Ok(format!("{:x}", hash))
}

/// Name of the report artifact for a sample file name: `<name>.json`.
pub fn report_file_name(sample_name: &OsStr) -> std::ffi::OsString {
    let mut name = sample_name.to_os_string();
    name.push(".json");
    name
}

/// Load a sample's reputation report from the reports directory, if any.
/// An unreadable or malformed report counts as missing.
pub fn load_report(reports_dir: &Path, sample_name: &OsStr) -> Option<VtReport> {
    let path = reports_dir.join(report_file_name(sample_name));
    let data = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&data) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(report = %path.display(), error = %e, "discarding malformed reputation report");
            None
        }
    }
}

/// Look up every sample under the samples directory and persist one report
/// per sample. Returns the per-outcome counts.
pub fn analyse_directory(client: &mut VirusTotalClient, layout: &RunLayout) -> Result<ReputationSummary> {
    let reports_dir = layout.vt_reports();
    RunLayout::ensure(&reports_dir)?;

    let mut summary = ReputationSummary::default();
    for sample in collect_samples(&layout.samples()) {
        let Some(name) = sample.file_name() else {
            continue;
        };
        let sha256 = match sha256_file(&sample) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(sample = %sample.display(), error = %e, "cannot hash sample");
                summary.failed += 1;
                continue;
            }
        };
        match client.lookup_hash(&sha256) {
            Ok(Some(report)) => {
                let path = reports_dir.join(report_file_name(name));
                fs::write(&path, serde_json::to_string_pretty(&report)?)?;
                debug!(sample = %sample.display(), positives = report.positives, "report written");
                summary.reported += 1;
            }
            Ok(None) => {
                debug!(sample = %sample.display(), "unknown to the reputation service");
                summary.unknown += 1;
            }
            Err(e) => {
                // One failed lookup must not abort the batch.
                warn!(sample = %sample.display(), error = %e, "reputation lookup failed");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}
