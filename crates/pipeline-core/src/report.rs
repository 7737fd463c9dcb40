//! Aggregated outcome of one pipeline run.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classify::PartitionSummary;
use crate::stages::droidbox::DynamicSummary;
use crate::stages::features::ExtractionSummary;
use crate::stages::filter::FilterSummary;
use crate::stages::flowdroid::{ProcessedSummary, StaticSummary};
use crate::stages::virustotal::ReputationSummary;

/// One summary per executed stage; skipped stages stay `None`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<ReputationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_analysis: Option<StaticSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_processed: Option<ProcessedSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<DynamicSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<ExtractionSummary>,
}

impl RunReport {
    pub fn print(&self) {
        println!("\n{}", "=".repeat(70));
        println!("PIPELINE RESULTS");
        println!("{}", "=".repeat(70));

        if let Some(f) = &self.filter {
            println!("\nFILTER:");
            println!("  Valid samples:       {}", f.valid);
            println!("  Invalid samples:     {}", f.invalid);
        }
        if let Some(r) = &self.reputation {
            println!("\nREPUTATION:");
            println!("  Reports written:     {}", r.reported);
            println!("  Unknown to service:  {}", r.unknown);
            println!("  Lookups failed:      {}", r.failed);
        }
        if let Some(p) = &self.partition {
            println!("\nCLASSIFICATION:");
            println!("  Benignware:          {}", p.benign);
            println!("  Malware:             {}", p.malicious);
            println!("  Unclassified:        {}", p.unclassified);
        }
        if let Some(s) = &self.static_analysis {
            println!("\nSTATIC ANALYSIS:");
            println!("  Analyzed:            {}", s.analyzed);
            println!("  Failed:              {}", s.failed);
        }
        if let Some(s) = &self.static_processed {
            println!("\nSTATIC OUTPUTS:");
            println!("  Normalized:          {}", s.processed);
            println!("  Skipped:             {}", s.skipped);
        }
        if let Some(d) = &self.dynamic {
            println!("\nDYNAMIC ANALYSIS:");
            println!("  Analyzed:            {}", d.analyzed);
            println!("  Timed out:           {}", d.timed_out);
            println!("  Failed:              {}", d.failed);
            println!("  Behavior records:    {}", d.behavior_records);
            println!("  Syscall records:     {}", d.syscall_records);
        }
        if let Some(x) = &self.features {
            println!("\nFEATURES:");
            println!("  Records:             {}", x.records);
            println!("  Failed samples:      {}", x.failed);
            if x.exported_csv {
                println!("  Exported to CSV");
            }
            if x.exported_mongodb {
                println!("  Exported to MongoDB");
            }
        }

        println!("\nElapsed: {}s", (self.finished - self.started).num_seconds());
        println!("{}", "=".repeat(70));
    }
}
