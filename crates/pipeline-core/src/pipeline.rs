//! Pipeline orchestrator: fixed stage order, flag-driven skipping.
//!
//! The stage list is declarative: every enabled predicate is evaluated once
//! from the resolved configuration, then the stages run strictly in order.
//! Stages hand work to each other exclusively through the directory layout,
//! so a failed run can be resumed by re-invoking with the flags narrowed to
//! the remaining work; nothing is rolled back here.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::thread;

use chrono::Utc;
use colored::Colorize;
use tracing::warn;

use crate::config::RunConfig;
use crate::error::Result;
use crate::layout::{RunLayout, PACKAGE_EXTENSION};
use crate::report::RunReport;
use crate::stages::{ExternalStages, StageRunner};

/// The seven stages in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Filter,
    Reputation,
    Partition,
    StaticAnalysis,
    StaticProcessing,
    DynamicAnalysis,
    FeatureExtraction,
}

impl StageKind {
    pub fn title(self) -> &'static str {
        match self {
            Self::Filter => "STEP 1: Filtering valid packages",
            Self::Reputation => "STEP 2: Analysing with VirusTotal",
            Self::Partition => "STEP 3: Partitioning benignware and malware",
            Self::StaticAnalysis => "STEP 4: Launching FlowDroid",
            Self::StaticProcessing => "STEP 5: Processing FlowDroid outputs",
            Self::DynamicAnalysis => "STEP 6: Executing DroidBox",
            Self::FeatureExtraction => "STEP 7: Extracting features",
        }
    }

    /// Stages whose external tool mutates the tree get a settle pause
    /// afterwards, letting late asynchronous writes land before the next
    /// stage reads the directory.
    fn settles(self) -> bool {
        matches!(
            self,
            Self::Filter
                | Self::Reputation
                | Self::Partition
                | Self::StaticAnalysis
                | Self::StaticProcessing
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlannedStage {
    pub kind: StageKind,
    pub enabled: bool,
}

/// Evaluate every stage's enabled predicate once, up front. Feature
/// extraction is the terminal stage and always runs.
pub fn plan(config: &RunConfig) -> Vec<PlannedStage> {
    vec![
        PlannedStage {
            kind: StageKind::Filter,
            enabled: config.filter,
        },
        PlannedStage {
            kind: StageKind::Reputation,
            enabled: config.reputation_enabled(),
        },
        PlannedStage {
            kind: StageKind::Partition,
            enabled: config.classify,
        },
        PlannedStage {
            kind: StageKind::StaticAnalysis,
            enabled: config.flowdroid,
        },
        PlannedStage {
            kind: StageKind::StaticProcessing,
            enabled: config.flowdroid,
        },
        PlannedStage {
            kind: StageKind::DynamicAnalysis,
            enabled: config.droidbox,
        },
        PlannedStage {
            kind: StageKind::FeatureExtraction,
            enabled: true,
        },
    ]
}

/// Restores the process working directory when dropped. The dynamic
/// analysis launcher chdirs into its own home as a side effect; no stage
/// after it may observe the moved directory.
struct WorkdirGuard {
    original: PathBuf,
}

impl WorkdirGuard {
    fn capture() -> std::io::Result<Self> {
        Ok(Self {
            original: env::current_dir()?,
        })
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.original) {
            warn!(error = %e, "failed to restore the working directory");
        }
    }
}

pub struct Pipeline<S = ExternalStages> {
    config: RunConfig,
    layout: RunLayout,
    stages: S,
}

impl Pipeline<ExternalStages> {
    pub fn new(config: RunConfig) -> Self {
        Self::with_stages(config, ExternalStages)
    }
}

impl<S: StageRunner> Pipeline<S> {
    pub fn with_stages(config: RunConfig, stages: S) -> Self {
        let layout = RunLayout::new(&config.source);
        Self {
            config,
            layout,
            stages,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Execute the planned stages in order. Stage errors propagate with
    /// their original diagnostic; completed stages' outputs stay on disk.
    pub fn run(&self) -> Result<RunReport> {
        self.config.validate()?;

        let started = Utc::now();
        let mut filter = None;
        let mut reputation = None;
        let mut partition = None;
        let mut static_analysis = None;
        let mut static_processed = None;
        let mut dynamic = None;
        let mut features = None;

        for stage in plan(&self.config) {
            if !stage.enabled {
                // Without the filter stage, package files still have to end
                // up in the samples root for the rest of the pipeline.
                if stage.kind == StageKind::Filter {
                    self.migrate_unfiltered()?;
                }
                continue;
            }
            self.banner(stage.kind);
            match stage.kind {
                StageKind::Filter => {
                    filter = Some(self.stages.filter_valid(&self.config, &self.layout)?);
                }
                StageKind::Reputation => {
                    reputation = Some(self.stages.reputation(&self.config, &self.layout)?);
                }
                StageKind::Partition => {
                    partition = Some(self.stages.partition(&self.config, &self.layout)?);
                }
                StageKind::StaticAnalysis => {
                    static_analysis =
                        Some(self.stages.static_analysis(&self.config, &self.layout)?);
                }
                StageKind::StaticProcessing => {
                    static_processed =
                        Some(self.stages.process_static_outputs(&self.config, &self.layout)?);
                }
                StageKind::DynamicAnalysis => {
                    let _workdir = WorkdirGuard::capture()?;
                    dynamic = Some(self.stages.dynamic_analysis(&self.config, &self.layout)?);
                }
                StageKind::FeatureExtraction => {
                    features = Some(self.stages.extract_features(&self.config, &self.layout)?);
                }
            }
            if stage.kind.settles() && !self.config.settle_pause.is_zero() {
                thread::sleep(self.config.settle_pause);
            }
        }

        Ok(RunReport {
            started,
            finished: Utc::now(),
            filter,
            reputation,
            partition,
            static_analysis,
            static_processed,
            dynamic,
            features,
        })
    }

    /// Lazy migration used when the validity filter is skipped: move every
    /// package file from the source root into `samples/` by extension match
    /// alone. Already-processed and fresh files are indistinguishable here,
    /// which is why enabling the filter stage is the recommended path.
    fn migrate_unfiltered(&self) -> Result<()> {
        let samples = self.layout.samples();
        RunLayout::ensure(&samples)?;
        for entry in fs::read_dir(self.layout.root())? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension() == Some(OsStr::new(PACKAGE_EXTENSION)) {
                fs::rename(&path, samples.join(entry.file_name()))?;
            }
        }
        Ok(())
    }

    fn banner(&self, kind: StageKind) {
        let message = format!("\n>>>> {}", kind.title());
        if self.config.color {
            println!("{}", message.green());
        } else {
            println!("{message}");
        }
    }
}
