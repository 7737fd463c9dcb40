//! Thin adapters around the external analysis collaborators.
//!
//! Each adapter takes paths from the layout contract, leaves its outputs on
//! disk and returns a typed summary of what it wrote, the in-memory mirror
//! of the directory handoff. Adapters recover from per-sample failures
//! themselves; only unrecoverable conditions (a missing external tool, an
//! unreadable input directory) surface as errors and abort the run.

pub mod droidbox;
pub mod features;
pub mod filter;
pub mod flowdroid;
pub mod virustotal;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::classify::{self, PartitionSummary};
use crate::config::RunConfig;
use crate::error::Result;
use crate::layout::{RunLayout, PACKAGE_EXTENSION};

/// Every package file under `dir`, including the partition subdirectories.
/// Sorted so batches are processed in a stable order.
pub(crate) fn collect_samples(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
        let path = entry.into_path();
        if path.is_file() && path.extension() == Some(OsStr::new(PACKAGE_EXTENSION)) {
            files.push(path);
        }
    }
    files.sort();
    files
}

/// Seam between the orchestrator and the stage implementations, so the
/// sequencing logic is testable with an injected stub.
pub trait StageRunner {
    fn filter_valid(&self, config: &RunConfig, layout: &RunLayout) -> Result<filter::FilterSummary>;

    fn reputation(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<virustotal::ReputationSummary>;

    fn partition(&self, config: &RunConfig, layout: &RunLayout) -> Result<PartitionSummary>;

    fn static_analysis(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<flowdroid::StaticSummary>;

    fn process_static_outputs(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<flowdroid::ProcessedSummary>;

    fn dynamic_analysis(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<droidbox::DynamicSummary>;

    fn extract_features(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<features::ExtractionSummary>;
}

/// Production wiring: every call reaches the real collaborator.
#[derive(Debug, Default)]
pub struct ExternalStages;

impl StageRunner for ExternalStages {
    fn filter_valid(&self, _config: &RunConfig, layout: &RunLayout) -> Result<filter::FilterSummary> {
        filter::filter_directory(layout)
    }

    fn reputation(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<virustotal::ReputationSummary> {
        // validate() guarantees the key when this stage is planned.
        let key = config.virustotal_api_key.clone().unwrap_or_default();
        let mut client = virustotal::VirusTotalClient::new(key);
        virustotal::analyse_directory(&mut client, layout)
    }

    fn partition(&self, config: &RunConfig, layout: &RunLayout) -> Result<PartitionSummary> {
        classify::partition(layout, config.virustotal_threshold)
    }

    fn static_analysis(
        &self,
        _config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<flowdroid::StaticSummary> {
        flowdroid::run_flowdroid(layout)
    }

    fn process_static_outputs(
        &self,
        _config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<flowdroid::ProcessedSummary> {
        flowdroid::process_outputs(layout)
    }

    fn dynamic_analysis(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<droidbox::DynamicSummary> {
        let mut summary = droidbox::run_droidbox(layout, config.droidbox_time)?;
        droidbox::split_outputs(layout, &mut summary)?;
        Ok(summary)
    }

    fn extract_features(
        &self,
        config: &RunConfig,
        layout: &RunLayout,
    ) -> Result<features::ExtractionSummary> {
        features::extract(config, layout)
    }
}
