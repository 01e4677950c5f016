use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use dmarc_analyzer::alignment::AlignmentSetting;
use dmarc_analyzer::period::{parse_timestamp, PeriodAnchor, TimePeriod};
use dmarc_analyzer::report::{self, ReportOptions};
use dmarc_analyzer::{Analyzer, AnalyzerConfig};
use log::LevelFilter;

fn cli() -> Command {
    Command::new("dmarc-analyzer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Analyze DMARC aggregate reports in a directory")
        .long_about(
            "Reads DMARC aggregate (RUA) reports in XML, gzip or zip form, classifies\n\
             every record's SPF/DKIM alignment, and summarizes sending sources over\n\
             rolling time periods with policy recommendations.",
        )
        .arg(
            Arg::new("input")
                .value_name("PATH")
                .help("Directory containing DMARC reports, or a single report file")
                .required_unless_present("generate-config"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file (default: stdout)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Verbose output with per-IP details and diagnostics")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("html")
                .long("html")
                .help("Generate HTML report")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("html-output")
                .long("html-output")
                .value_name("FILE")
                .help("HTML output file (default: dmarc_report.html)"),
        )
        .arg(
            Arg::new("resolve-ips")
                .short('r')
                .long("resolve-ips")
                .help("Resolve IP addresses to hostnames")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("time-periods")
                .short('t')
                .long("time-periods")
                .value_name("DAYS")
                .help("Time periods in days to include in report (default: all five)")
                .num_args(1..)
                .value_parser(["30", "90", "180", "360", "all"]),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("YAML configuration file"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .help("Require exact domain matches for alignment")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("as-of")
                .long("as-of")
                .value_name("TIMESTAMP")
                .help("Measure periods back from this time (RFC 3339 or YYYY-MM-DD)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Emit the analysis summary as JSON instead of text")
                .action(clap::ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(Path::new(generate_path));
        return;
    }

    if let Err(e) = run(&matches).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn generate_default_config(path: &Path) {
    let config = AnalyzerConfig::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {}", path.display());
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<AnalyzerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => AnalyzerConfig::load_or_default(Path::new(path))?,
        None => AnalyzerConfig::default(),
    };

    if let Some(periods) = matches.get_many::<String>("time-periods") {
        config.time_periods = periods
            .map(|p| p.parse::<TimePeriod>())
            .collect::<Result<_, _>>()?;
    }
    if matches.get_flag("strict") {
        config.alignment = AlignmentSetting::Strict;
    }
    if matches.get_flag("resolve-ips") {
        config.resolve.enabled = true;
    }
    if let Some(as_of) = matches.get_one::<String>("as-of") {
        config.anchor = PeriodAnchor::Fixed(parse_timestamp(as_of)?);
    }
    if let Some(html_output) = matches.get_one::<String>("html-output") {
        config.output.html_output = PathBuf::from(html_output);
    }

    config.validate()?;
    Ok(config)
}

async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(matches)?;
    let input = matches
        .get_one::<String>("input")
        .map(PathBuf::from)
        .context("no input path given")?;

    let analyzer = Analyzer::from_config(&config)?;
    log::info!(
        "Analyzing {} for periods: {}",
        input.display(),
        config
            .periods()
            .iter()
            .map(TimePeriod::label)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let summary = analyzer.analyze_path(&input).await?;

    let options = ReportOptions {
        verbose: matches.get_flag("verbose"),
        top_sources: config.output.top_sources,
    };
    let html = matches.get_flag("html");
    let content = if matches.get_flag("json") {
        report::to_json(&summary).context("failed to serialize summary")?
    } else {
        report::text::render(&summary, &options)
    };

    if let Some(output) = matches.get_one::<String>("output") {
        std::fs::write(output, &content).with_context(|| format!("failed to write {output}"))?;
        println!("Report written to {output}");
    } else if !html {
        println!("{content}");
    }

    if html {
        let html_output = &config.output.html_output;
        std::fs::write(html_output, report::html::render(&summary))
            .with_context(|| format!("failed to write {}", html_output.display()))?;
        println!("HTML report written to {}", html_output.display());
    }

    Ok(())
}
