//! pipeline-core: batch analysis pipeline for Android application packages.
//!
//! Sequences the analysis stages (validity filter, VirusTotal reputation
//! lookups, benignware/malware partitioning, FlowDroid taint analysis,
//! DroidBox dynamic analysis, feature extraction) over a fixed on-disk
//! directory layout. Stages communicate exclusively through the filesystem,
//! so an interrupted run can be resumed by re-invoking with the stage flags
//! narrowed to the remaining work.

pub mod classify;
pub mod config;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod report;
pub mod stages;
