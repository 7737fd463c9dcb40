//! Resolved options for one pipeline invocation.
//!
//! Constructed once at start and read-only afterwards. The VirusTotal API
//! key doubles as the enable switch for the reputation stage, so there is no
//! separate flag for it.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::{PipelineError, Result};

const DEFAULT_PACKAGE_INDEX: &str = "info/package_index.txt";
const DEFAULT_CLASS_INDEX: &str = "info/class_index.txt";
const DEFAULT_SYSTEM_COMMANDS_INDEX: &str = "info/system_commands.txt";

/// Wait inserted after mutating stages so late writes from external tools
/// settle before the next stage reads the tree.
const DEFAULT_SETTLE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root of the run; every stage path hangs off this directory.
    pub source: PathBuf,
    pub filter: bool,
    pub classify: bool,
    pub flowdroid: bool,
    pub droidbox: bool,
    /// Presence enables the reputation stage.
    pub virustotal_api_key: Option<String>,
    /// Detections needed before a sample counts as malicious.
    pub virustotal_threshold: u32,
    /// DroidBox run time per sample, in seconds.
    pub droidbox_time: u64,
    /// Also write one feature report per sample.
    pub single: bool,
    /// Keep intermediate working files after feature extraction.
    pub nocleanup: bool,
    pub package_index: PathBuf,
    pub class_index: PathBuf,
    pub system_commands_index: PathBuf,
    pub mongodb_uri: Option<String>,
    pub export_csv: Option<PathBuf>,
    pub color: bool,
    pub settle_pause: Duration,
}

impl RunConfig {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            filter: false,
            classify: false,
            flowdroid: false,
            droidbox: false,
            virustotal_api_key: None,
            virustotal_threshold: 1,
            droidbox_time: 300,
            single: false,
            nocleanup: false,
            package_index: PathBuf::from(DEFAULT_PACKAGE_INDEX),
            class_index: PathBuf::from(DEFAULT_CLASS_INDEX),
            system_commands_index: PathBuf::from(DEFAULT_SYSTEM_COMMANDS_INDEX),
            mongodb_uri: None,
            export_csv: None,
            color: true,
            settle_pause: DEFAULT_SETTLE_PAUSE,
        }
    }

    /// Enable every stage. Reputation lookups still require an API key.
    pub fn all_steps(mut self) -> Self {
        self.filter = true;
        self.classify = true;
        self.flowdroid = true;
        self.droidbox = true;
        self
    }

    pub fn reputation_enabled(&self) -> bool {
        self.virustotal_api_key.is_some()
    }

    /// Checks that must pass before any stage touches the filesystem.
    ///
    /// Classification consumes the reputation reports, so requesting it
    /// without a key refuses the whole run up front, including when
    /// classification was only implied by the all-steps shorthand.
    pub fn validate(&self) -> Result<()> {
        if self.classify && !self.reputation_enabled() {
            return Err(PipelineError::configuration(
                "classification requires a VirusTotal API key (--virustotal-api-key)",
            ));
        }
        if !self.source.is_dir() {
            return Err(PipelineError::SourceNotFound {
                path: self.source.clone(),
            });
        }
        if self.classify && self.virustotal_threshold == 0 {
            // Allowed, but no sample has a negative detection count.
            warn!("threshold 0 classifies every reported sample as malicious");
        }
        Ok(())
    }
}
