//! On-disk layout shared by every pipeline stage.
//!
//! All stage inputs and outputs live in fixed subdirectories of the run's
//! source directory. The subpath names are part of the persisted format: a
//! partially processed tree keeps meaning the same thing across
//! re-invocations, which is what makes narrowed-flag recovery runs work.
//! Adapters only ever receive paths built here.

use std::io;
use std::path::{Path, PathBuf};

/// File extension of an Android application package.
pub const PACKAGE_EXTENSION: &str = "apk";

const SAMPLES_DIR: &str = "samples";
const BENIGN_DIR: &str = "samples/BW";
const MALWARE_DIR: &str = "samples/MW";
const INVALID_DIR: &str = "invalid_apks";
const VT_REPORTS_DIR: &str = "VT_analysis";
const FLOWDROID_RAW_DIR: &str = "FlowDroid_outputs";
const FLOWDROID_PROCESSED_DIR: &str = "FlowDroid_processed";
const FLOWDROID_GLOBAL_CSV: &str = "flowdroid_global.csv";
const DROIDBOX_RAW_DIR: &str = "DroidBox_outputs";
const DYNAMIC_DROIDBOX_DIR: &str = "Dynamic/Droidbox";
const DYNAMIC_STRACE_DIR: &str = "Dynamic/Strace";
const FEATURES_DIR: &str = "Features_files";
const FEATURES_TMP_DIR: &str = "Features_files/tmp";

/// Resolves every stage path relative to one run's source directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Valid samples; partitioned samples live in `BW`/`MW` underneath.
    pub fn samples(&self) -> PathBuf {
        self.root.join(SAMPLES_DIR)
    }

    pub fn benign(&self) -> PathBuf {
        self.root.join(BENIGN_DIR)
    }

    pub fn malware(&self) -> PathBuf {
        self.root.join(MALWARE_DIR)
    }

    /// Terminal area for packages that failed the validity probe.
    pub fn invalid(&self) -> PathBuf {
        self.root.join(INVALID_DIR)
    }

    pub fn vt_reports(&self) -> PathBuf {
        self.root.join(VT_REPORTS_DIR)
    }

    pub fn flowdroid_raw(&self) -> PathBuf {
        self.root.join(FLOWDROID_RAW_DIR)
    }

    pub fn flowdroid_processed(&self) -> PathBuf {
        self.root.join(FLOWDROID_PROCESSED_DIR)
    }

    /// Aggregate table across all samples produced by static normalization.
    pub fn flowdroid_global_csv(&self) -> PathBuf {
        self.flowdroid_processed().join(FLOWDROID_GLOBAL_CSV)
    }

    pub fn droidbox_raw(&self) -> PathBuf {
        self.root.join(DROIDBOX_RAW_DIR)
    }

    /// Behavioral-trace half of the normalized dynamic output.
    pub fn dynamic_droidbox(&self) -> PathBuf {
        self.root.join(DYNAMIC_DROIDBOX_DIR)
    }

    /// Syscall-trace half of the normalized dynamic output.
    pub fn dynamic_strace(&self) -> PathBuf {
        self.root.join(DYNAMIC_STRACE_DIR)
    }

    pub fn features(&self) -> PathBuf {
        self.root.join(FEATURES_DIR)
    }

    /// Intermediate working files for feature extraction, removed after the
    /// run unless cleanup is suppressed.
    pub fn features_tmp(&self) -> PathBuf {
        self.root.join(FEATURES_TMP_DIR)
    }

    /// Create a directory on demand. Re-creating an existing one is a no-op.
    pub fn ensure(dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }
}
