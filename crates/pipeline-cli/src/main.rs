//! apk-pipeline: batch analysis of Android application packages.
//!
//! Usage:
//!   apk-pipeline --source /data/apks --all-steps --virustotal-api-key KEY
//!   apk-pipeline --source /data/apks --filter --flowdroid
//!   apk-pipeline --source /data/apks --export-csv features.csv --no-color

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pipeline_core::config::RunConfig;
use pipeline_core::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "apk-pipeline")]
#[command(about = "Batch analysis pipeline for Android application packages")]
struct Cli {
    /// Source directory containing the packages to analyse
    #[arg(short, long)]
    source: PathBuf,

    /// Run every stage (reputation lookups still need an API key)
    #[arg(short = 'a', long)]
    all_steps: bool,

    /// Filter valid and invalid packages (recommended)
    #[arg(short, long)]
    filter: bool,

    /// VirusTotal API key; enables the reputation stage
    #[arg(long, value_name = "KEY")]
    virustotal_api_key: Option<String>,

    /// Detections needed before a sample counts as malicious
    #[arg(long, default_value_t = 1, value_name = "N")]
    virustotal_threshold: u32,

    /// Partition samples into benignware and malware from the reputation
    /// reports; requires --virustotal-api-key
    #[arg(short, long)]
    classify: bool,

    /// Run FlowDroid taint analysis
    #[arg(long)]
    flowdroid: bool,

    /// Run DroidBox dynamic analysis
    #[arg(long)]
    droidbox: bool,

    /// DroidBox run time per sample, in seconds
    #[arg(long, default_value_t = 300, value_name = "SECONDS")]
    droidbox_time: u64,

    /// Also write one feature report per sample
    #[arg(long)]
    single: bool,

    /// Keep intermediate working files after feature extraction
    #[arg(long)]
    nocleanup: bool,

    /// Android API package index
    #[arg(long, default_value = "info/package_index.txt", value_name = "FILE")]
    package_index: PathBuf,

    /// Android API class index
    #[arg(long, default_value = "info/class_index.txt", value_name = "FILE")]
    class_index: PathBuf,

    /// System command index
    #[arg(long, default_value = "info/system_commands.txt", value_name = "FILE")]
    system_commands_index: PathBuf,

    /// Export the aggregate feature report to MongoDB (host:port or URI)
    #[arg(long, value_name = "URI")]
    mongodb_uri: Option<String>,

    /// Export the aggregate static features to a CSV file
    #[arg(long, value_name = "FILE")]
    export_csv: Option<PathBuf>,

    /// Colorize progress messages (default)
    #[arg(long, overrides_with = "no_color")]
    color: bool,

    /// Disable colorized progress messages
    #[arg(long)]
    no_color: bool,
}

fn resolve(cli: Cli) -> RunConfig {
    let mut config = RunConfig::new(cli.source);
    config.filter = cli.filter;
    config.classify = cli.classify;
    config.flowdroid = cli.flowdroid;
    config.droidbox = cli.droidbox;
    if cli.all_steps {
        config = config.all_steps();
    }
    config.virustotal_api_key = cli.virustotal_api_key;
    config.virustotal_threshold = cli.virustotal_threshold;
    config.droidbox_time = cli.droidbox_time;
    config.single = cli.single;
    config.nocleanup = cli.nocleanup;
    config.package_index = cli.package_index;
    config.class_index = cli.class_index;
    config.system_commands_index = cli.system_commands_index;
    config.mongodb_uri = cli.mongodb_uri;
    config.export_csv = cli.export_csv;
    config.color = cli.color || !cli.no_color;
    config
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = resolve(cli);
    if !config.color {
        colored::control::set_override(false);
    }

    let report = Pipeline::new(config).run()?;
    report.print();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_steps_implies_every_stage_flag() {
        let cli = Cli::parse_from(["apk-pipeline", "--source", "/tmp", "--all-steps"]);
        let config = resolve(cli);

        assert!(config.filter);
        assert!(config.classify);
        assert!(config.flowdroid);
        assert!(config.droidbox);
        assert!(!config.reputation_enabled());
    }

    #[test]
    fn individual_flags_are_honored_without_all_steps() {
        let cli = Cli::parse_from(["apk-pipeline", "--source", "/tmp", "--filter", "--flowdroid"]);
        let config = resolve(cli);

        assert!(config.filter);
        assert!(config.flowdroid);
        assert!(!config.classify);
        assert!(!config.droidbox);
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cli = Cli::parse_from(["apk-pipeline", "--source", "/tmp"]);
        let config = resolve(cli);

        assert_eq!(config.virustotal_threshold, 1);
        assert_eq!(config.droidbox_time, 300);
        assert!(config.color);
        assert!(!config.single);
        assert!(!config.nocleanup);
        assert_eq!(config.package_index, PathBuf::from("info/package_index.txt"));
    }

    #[test]
    fn no_color_disables_colorized_banners() {
        let cli = Cli::parse_from(["apk-pipeline", "--source", "/tmp", "--no-color"]);
        let config = resolve(cli);
        assert!(!config.color);
    }

    #[test]
    fn missing_source_argument_is_a_usage_error() {
        let result = Cli::try_parse_from(["apk-pipeline"]);
        assert!(result.is_err());
    }
}
