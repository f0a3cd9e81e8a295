//! `finfocus plugin conformance`: run the suite and map the report to an
//! exit code.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use regex::Regex;

use finfocus_core::conformance::{self, Category, ConformanceReport, SuiteConfig, Verbosity};
use finfocus_proto::CommMode;

use crate::config::FinfocusConfig;

/// Invalid arguments or configuration.
pub const EXIT_USAGE: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Junit,
}

#[derive(Debug, Args)]
pub struct ConformanceArgs {
    /// Path to the plugin executable
    pub path: PathBuf,
    /// Transport to use: tcp or stdio
    #[arg(long, default_value = "tcp")]
    pub mode: CommMode,
    /// quiet, normal, verbose, or debug
    #[arg(long, default_value = "normal")]
    pub verbosity: Verbosity,
    /// Report format
    #[arg(long, value_enum, default_value = "table")]
    pub output: OutputFormat,
    /// Write the report to this file instead of stdout
    #[arg(long)]
    pub output_file: Option<PathBuf>,
    /// Wall-clock budget of the whole suite (e.g. 90s, 5m)
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub timeout: Duration,
    /// Upper bound of a single case
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub case_timeout: Duration,
    /// Only run this category (repeatable)
    #[arg(long = "category")]
    pub categories: Vec<Category>,
    /// Only run cases whose name matches this regex
    #[arg(long)]
    pub filter: Option<String>,
}

/// Run the suite and return the process exit code.
pub async fn run_conformance(args: ConformanceArgs, config: &FinfocusConfig) -> i32 {
    let filter = match args.filter.as_deref().map(Regex::new).transpose() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid --filter: {e}");
            return EXIT_USAGE;
        }
    };

    // Fail on an unwritable destination before spending minutes on the suite.
    let mut sink: Box<dyn Write> = match &args.output_file {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(file),
            Err(e) => {
                eprintln!("cannot write report to {}: {e}", path.display());
                return EXIT_USAGE;
            }
        },
        None => Box::new(std::io::stdout()),
    };

    let suite = SuiteConfig {
        mode: args.mode,
        timeout: args.timeout,
        case_timeout: args.case_timeout,
        categories: args.categories,
        filter,
        verbosity: args.verbosity,
        supervisor: config.supervisor.clone(),
        sample_resource: None,
    };

    let report = conformance::run_suite(&args.path, &suite).await;

    let rendered = match render(&report, args.output, args.verbosity) {
        Ok(rendered) => rendered,
        Err(e) => {
            eprintln!("failed to render report: {e}");
            return EXIT_USAGE;
        }
    };
    if let Err(e) = sink.write_all(rendered.as_bytes()).and_then(|()| sink.flush()) {
        eprintln!("failed to write report: {e}");
        return EXIT_USAGE;
    }

    report.exit_code()
}

fn render(
    report: &ConformanceReport,
    format: OutputFormat,
    verbosity: Verbosity,
) -> serde_json::Result<String> {

    Ok(match format {
        OutputFormat::Table => conformance::render_table(report, verbosity),
        OutputFormat::Json => {
            let mut json = conformance::render_json(report)?;
            json.push('\n');
            json
        }
        OutputFormat::Junit => conformance::render_junit(report),
    })
}

/// Parse `90`, `90s`, `500ms`, `5m`, or `1h`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?} (expected e.g. 30s, 5m)"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit {other:?} in {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("m").is_err());
    }
}
