//! Stage 1: validity filter over candidate package files.
//!
//! Every regular file directly in the source directory is a candidate.
//! Valid packages move into `samples/`; everything else moves into
//! `invalid_apks/` and is never touched by later stages. The probe itself
//! is cheap (extension plus container magic), so candidates are checked in
//! parallel and moved sequentially afterwards.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::layout::{RunLayout, PACKAGE_EXTENSION};

/// ZIP local-file magic; every installable package is a ZIP container.
const PACKAGE_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

#[derive(Debug, Default, Clone, Serialize)]
pub struct FilterSummary {
    pub valid: usize,
    pub invalid: usize,
}

/// Validity probe: the package extension and the container magic must both
/// be present. Truncated or corrupt downloads fail here instead of being
/// handed to the analysers.
pub fn is_valid_package(path: &Path) -> bool {
    if path.extension() != Some(OsStr::new(PACKAGE_EXTENSION)) {
        return false;
    }
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    magic == PACKAGE_MAGIC
}

/// Partition the source directory's files into valid and invalid samples.
pub fn filter_directory(layout: &RunLayout) -> Result<FilterSummary> {
    let samples_dir = layout.samples();
    let invalid_dir = layout.invalid();
    RunLayout::ensure(&samples_dir)?;
    RunLayout::ensure(&invalid_dir)?;

    let mut candidates = Vec::new();
    for entry in fs::read_dir(layout.root())? {
        let path = entry?.path();
        if path.is_file() {
            candidates.push(path);
        }
    }
    candidates.sort();

    let probed: Vec<(PathBuf, bool)> = candidates
        .into_par_iter()
        .map(|path| {
            let valid = is_valid_package(&path);
            (path, valid)
        })
        .collect();

    let mut summary = FilterSummary::default();
    for (path, valid) in probed {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = if valid {
            summary.valid += 1;
            samples_dir.join(name)
        } else {
            summary.invalid += 1;
            debug!(sample = %path.display(), "failed the validity probe");
            invalid_dir.join(name)
        };
        fs::rename(&path, &target)?;
    }

    info!(valid = summary.valid, invalid = summary.invalid, "filter finished");
    Ok(summary)
}
