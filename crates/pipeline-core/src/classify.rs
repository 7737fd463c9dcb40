//! Benignware/malware classification from reputation reports.
//!
//! The rule is a plain detection-count threshold. Partitioning is
//! destructive: a classified sample is moved out of the samples root into
//! `BW` or `MW`, so a sample lives in exactly one of the three locations
//! afterwards. Samples without a report are left in place and surfaced as
//! unclassified, never guessed at and never dropped.

use std::fs;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::layout::RunLayout;
use crate::stages::virustotal::{load_report, VtReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Benign,
    Malicious,
}

/// Malicious when at least `threshold` engines flagged the sample.
/// Threshold 0 therefore marks every reported sample as malicious; callers
/// get a warning for that at validation time but it is not rejected.
pub fn classify(report: &VtReport, threshold: u32) -> Verdict {
    if report.positives >= threshold {
        Verdict::Malicious
    } else {
        Verdict::Benign
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PartitionSummary {
    pub benign: usize,
    pub malicious: usize,
    /// Samples with no usable reputation report; left in the samples root.
    pub unclassified: usize,
}

/// Move every reported sample out of the samples root into `BW`/`MW`.
///
/// Only files directly in the samples root are considered; the partition
/// subdirectories underneath are never re-partitioned.
pub fn partition(layout: &RunLayout, threshold: u32) -> Result<PartitionSummary> {
    let benign_dir = layout.benign();
    let malware_dir = layout.malware();
    RunLayout::ensure(&benign_dir)?;
    RunLayout::ensure(&malware_dir)?;

    let reports_dir = layout.vt_reports();
    let mut summary = PartitionSummary::default();

    for entry in fs::read_dir(layout.samples())? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name();
        match load_report(&reports_dir, &name) {
            Some(report) => {
                let target = match classify(&report, threshold) {
                    Verdict::Benign => {
                        summary.benign += 1;
                        benign_dir.join(&name)
                    }
                    Verdict::Malicious => {
                        summary.malicious += 1;
                        malware_dir.join(&name)
                    }
                };
                fs::rename(&path, &target)?;
                debug!(
                    sample = %name.to_string_lossy(),
                    positives = report.positives,
                    "sample partitioned"
                );
            }
            None => {
                warn!(
                    sample = %name.to_string_lossy(),
                    "no reputation report, sample stays unclassified"
                );
                summary.unclassified += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::Path;

    use crate::stages::virustotal::report_file_name;

    fn report(positives: u32) -> VtReport {
        VtReport {
            sha256: "abc".into(),
            positives,
            total: 60,
            permalink: String::new(),
            detection_names: Vec::new(),
        }
    }

    fn write_report(reports_dir: &Path, sample: &str, positives: u32) {
        let path = reports_dir.join(report_file_name(OsStr::new(sample)));
        fs::write(&path, serde_json::to_string(&report(positives)).unwrap()).unwrap();
    }

    fn seed_sample(layout: &RunLayout, name: &str) {
        fs::write(layout.samples().join(name), b"PK\x03\x04sample").unwrap();
    }

    #[test]
    fn threshold_is_an_inclusive_lower_bound() {
        assert_eq!(classify(&report(5), 5), Verdict::Malicious);
        assert_eq!(classify(&report(4), 5), Verdict::Benign);
        assert_eq!(classify(&report(6), 5), Verdict::Malicious);
    }

    #[test]
    fn classification_is_monotonic_in_the_threshold() {
        let r = report(7);
        let mut previous = Verdict::Malicious;
        for threshold in 1..=10 {
            let verdict = classify(&r, threshold);
            // Raising the threshold can only flip malicious -> benign.
            if previous == Verdict::Benign {
                assert_eq!(verdict, Verdict::Benign);
            }
            previous = verdict;
        }
        assert_eq!(classify(&r, 7), Verdict::Malicious);
        assert_eq!(classify(&r, 8), Verdict::Benign);
    }

    #[test]
    fn threshold_zero_marks_everything_malicious() {
        assert_eq!(classify(&report(0), 0), Verdict::Malicious);
    }

    #[test]
    fn partition_routes_by_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        RunLayout::ensure(&layout.samples()).unwrap();
        RunLayout::ensure(&layout.vt_reports()).unwrap();
        seed_sample(&layout, "low.apk");
        seed_sample(&layout, "high.apk");
        write_report(&layout.vt_reports(), "low.apk", 2);
        write_report(&layout.vt_reports(), "high.apk", 7);

        let summary = partition(&layout, 5).unwrap();

        assert_eq!(summary.benign, 1);
        assert_eq!(summary.malicious, 1);
        assert_eq!(summary.unclassified, 0);
        assert!(layout.benign().join("low.apk").is_file());
        assert!(layout.malware().join("high.apk").is_file());
        // The move is destructive: the root copies are gone.
        assert!(!layout.samples().join("low.apk").exists());
        assert!(!layout.samples().join("high.apk").exists());
    }

    #[test]
    fn partitions_are_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        RunLayout::ensure(&layout.samples()).unwrap();
        RunLayout::ensure(&layout.vt_reports()).unwrap();
        for (name, positives) in [("a.apk", 0), ("b.apk", 1), ("c.apk", 9)] {
            seed_sample(&layout, name);
            write_report(&layout.vt_reports(), name, positives);
        }

        partition(&layout, 1).unwrap();

        for name in ["a.apk", "b.apk", "c.apk"] {
            let in_benign = layout.benign().join(name).exists();
            let in_malware = layout.malware().join(name).exists();
            assert!(in_benign ^ in_malware, "{name} must be in exactly one partition");
        }
    }

    #[test]
    fn samples_without_a_report_stay_unclassified() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        RunLayout::ensure(&layout.samples()).unwrap();
        RunLayout::ensure(&layout.vt_reports()).unwrap();
        seed_sample(&layout, "known.apk");
        seed_sample(&layout, "orphan.apk");
        write_report(&layout.vt_reports(), "known.apk", 3);

        let summary = partition(&layout, 1).unwrap();

        assert_eq!(summary.malicious, 1);
        assert_eq!(summary.unclassified, 1);
        assert!(layout.samples().join("orphan.apk").is_file());
    }

    #[test]
    fn malformed_report_counts_as_unclassified() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        RunLayout::ensure(&layout.samples()).unwrap();
        RunLayout::ensure(&layout.vt_reports()).unwrap();
        seed_sample(&layout, "broken.apk");
        fs::write(layout.vt_reports().join("broken.apk.json"), "{oops").unwrap();

        let summary = partition(&layout, 1).unwrap();

        assert_eq!(summary.unclassified, 1);
        assert!(layout.samples().join("broken.apk").is_file());
    }

    #[test]
    fn already_partitioned_samples_are_not_touched() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(tmp.path());
        RunLayout::ensure(&layout.benign()).unwrap();
        RunLayout::ensure(&layout.vt_reports()).unwrap();
        fs::write(layout.benign().join("done.apk"), b"PK\x03\x04x").unwrap();

        let summary = partition(&layout, 1).unwrap();

        assert_eq!(summary.benign + summary.malicious + summary.unclassified, 0);
        assert!(layout.benign().join("done.apk").is_file());
    }
}
