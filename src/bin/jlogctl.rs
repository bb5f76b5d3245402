use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use jlog::admin::{
    index_report, perspective, scan_segments, subscriber_reports, IndexReport, IntervalReport,
    SegmentReport, SubscriberReport,
};
use jlog::segment::segment_filename;
use jlog::{ExclusiveLock, Inspection, Log, StartPolicy};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "jlogctl",
    version,
    about = "Inspect and administer jlog directories",
    after_help = "WARNING: -r must not be used on a log that is being written to."
)]
struct Cli {
    /// Add SUB as a log subscriber, starting at the beginning of the log
    #[arg(short = 'a', value_name = "SUB")]
    add: Option<String>,
    /// Erase SUB as a log subscriber
    #[arg(short = 'e', value_name = "SUB")]
    erase: Option<String>,
    /// Show the perspective of the subscriber SUB
    #[arg(short = 'p', value_name = "SUB")]
    perspective: Option<String>,
    /// List all log segments with sizes and readers
    #[arg(short = 'l')]
    list: bool,
    /// List index information
    #[arg(short = 'i')]
    index: bool,
    /// Clean all log segments with no pending readers
    #[arg(short = 'c')]
    clean: bool,
    /// Show all subscribers
    #[arg(short = 's')]
    subscribers: bool,
    /// Analyze datafiles
    #[arg(short = 'd')]
    analyze: bool,
    /// Analyze datafiles and repair if needed
    #[arg(short = 'r')]
    repair: bool,
    /// Verbose output
    #[arg(short = 'v')]
    verbose: bool,
    /// Emit a JSON report instead of text
    #[arg(long)]
    json: bool,
    #[arg(required = true, value_name = "LOGPATH")]
    logs: Vec<PathBuf>,
}

/// What to do for every log, resolved from the flags.
struct Options {
    add: Option<String>,
    erase: Option<String>,
    perspective: Option<String>,
    show_subscribers: bool,
    show_files: bool,
    show_index: bool,
    analyze: bool,
    repair: bool,
    clean: bool,
    quiet: bool,
}

impl From<&Cli> for Options {
    fn from(cli: &Cli) -> Self {
        let analyze = cli.analyze || cli.repair;
        Self {
            add: cli.add.clone(),
            erase: cli.erase.clone(),
            perspective: cli.perspective.clone(),
            show_subscribers: cli.subscribers,
            show_files: cli.list || cli.index || analyze || cli.clean,
            show_index: cli.index,
            analyze,
            repair: cli.repair,
            clean: cli.clean,
            quiet: cli.clean,
        }
    }
}

#[derive(Serialize)]
struct LogSummary {
    path: PathBuf,
    actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    perspective: Option<IntervalReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscribers: Option<Vec<SubscriberReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    segments: Option<Vec<SegmentSummary>>,
}

#[derive(Serialize)]
struct SegmentSummary {
    name: String,
    #[serde(flatten)]
    report: Option<SegmentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<IndexReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    datafile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repair: Option<String>,
    reclaimed: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let options = Options::from(&cli);
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let mut summaries = Vec::new();
    let mut failures = 0usize;
    for path in &cli.logs {
        match process_log(path, &options) {
            Ok(summary) if cli.json => summaries.push(summary),
            Ok(summary) => {
                if !options.quiet {
                    render_text(&summary, &mut out)?;
                }
            }
            Err(err) => {
                eprintln!("{}: {err:#}", path.display());
                failures += 1;
            }
        }
    }
    if cli.json {
        serde_json::to_writer_pretty(&mut out, &summaries)?;
        writeln!(out)?;
    }
    out.flush()?;
    if failures > 0 {
        anyhow::bail!("{failures} of {} logs could not be processed", cli.logs.len());
    }
    Ok(())
}

fn process_log(path: &Path, options: &Options) -> Result<LogSummary> {
    let log = Log::open(path).with_context(|| format!("error opening '{}'", path.display()))?;
    let mut summary = LogSummary {
        path: path.to_path_buf(),
        actions: Vec::new(),
        perspective: None,
        subscribers: None,
        segments: None,
    };

    if let Some(name) = &options.add {
        match log.add_subscriber(name, StartPolicy::Beginning) {
            Ok(start) => summary
                .actions
                .push(format!("Added subscriber '{name}' at {start}")),
            Err(err) => eprintln!("Could not add subscriber '{name}': {err}"),
        }
    }
    if let Some(name) = &options.erase {
        match log.remove_subscriber(name) {
            Ok(()) => summary.actions.push(format!("Erased subscriber '{name}'")),
            Err(err) => eprintln!("Could not erase subscriber '{name}': {err}"),
        }
    }

    // Repair and reclaim need the log to themselves.
    let lock = if options.repair || options.clean {
        Some(
            log.lock_exclusive()
                .with_context(|| format!("'{}' is held by a writer", path.display()))?,
        )
    } else {
        None
    };

    if let Some(name) = &options.perspective {
        match perspective(&log, name) {
            Ok(report) => summary.perspective = Some(report),
            Err(err) => eprintln!("Could not show perspective of '{name}': {err}"),
        }
    }
    if options.show_subscribers {
        summary.subscribers = Some(subscriber_reports(&log)?);
    }
    if options.show_files {
        summary.segments = Some(process_segments(&log, options, lock.as_ref())?);
    }
    Ok(summary)
}

fn process_segments(
    log: &Log,
    options: &Options,
    lock: Option<&ExclusiveLock>,
) -> Result<Vec<SegmentSummary>> {
    let mut segments = Vec::new();
    for (segment, report) in scan_segments(log)? {
        let mut summary = SegmentSummary {
            name: segment_filename(segment),
            report: None,
            error: None,
            index: None,
            datafile: None,
            repair: None,
            reclaimed: false,
        };
        let report = match report {
            Ok(report) => report,
            Err(err) => {
                summary.error = Some(err.to_string());
                segments.push(summary);
                continue;
            }
        };
        if options.show_index {
            summary.index = Some(index_report(log, segment));
        }
        if options.analyze {
            analyze_segment(log, segment, options, lock, &mut summary);
        }
        if let Some(lock) = lock.filter(|_| options.clean) {
            if report.pending_readers == 0 && log.is_closed(segment)? {
                match log.reclaim(segment, lock) {
                    Ok(()) => summary.reclaimed = true,
                    Err(err) => eprintln!("{}: {err}", summary.name),
                }
            }
        }
        summary.report = Some(report);
        segments.push(summary);
    }
    Ok(segments)
}

fn analyze_segment(
    log: &Log,
    segment: u32,
    options: &Options,
    lock: Option<&ExclusiveLock>,
    summary: &mut SegmentSummary,
) {
    let inspection = match log.inspect(segment) {
        Ok(inspection) => inspection,
        Err(err) => {
            eprintln!("{}: {err}", summary.name);
            return;
        }
    };
    summary.datafile = Some(inspection.to_string());
    if let Inspection::Corrupt { .. } = inspection {
        eprintln!("One or more errors were found.");
        if let Some(lock) = lock.filter(|_| options.repair) {
            match log.repair(segment, lock) {
                Ok(outcome) => {
                    eprintln!("Log file reconstructed, deleting the corresponding idx file.");
                    summary.repair = Some(outcome.to_string());
                }
                Err(err) => eprintln!("{}: repair failed: {err}", summary.name),
            }
        }
    }
}

fn render_text(summary: &LogSummary, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "{}", summary.path.display())?;
    for action in &summary.actions {
        writeln!(out, "{action}")?;
    }
    if let Some(report) = &summary.perspective {
        let or_none = |value: Option<String>| value.unwrap_or_else(|| "none".to_string());
        writeln!(out, "--------------------")?;
        writeln!(out, "  Perspective of the '{}' subscriber", report.subscriber)?;
        writeln!(out, "    current checkpoint: {}", report.checkpoint)?;
        writeln!(
            out,
            "    Last write: {}",
            or_none(report.last_written.map(|id| id.to_string()))
        )?;
        writeln!(
            out,
            "    next interval: {}",
            or_none(report.interval.map(|interval| interval.to_string()))
        )?;
        writeln!(out, "--------------------\n")?;
    }
    for subscriber in summary.subscribers.iter().flatten() {
        writeln!(out, "\t{:>32} @ {}", subscriber.name, subscriber.checkpoint)?;
    }
    for segment in summary.segments.iter().flatten() {
        match (&segment.report, &segment.error) {
            (Some(report), _) => writeln!(
                out,
                "\t{:>8} [{} bytes] {} pending readers",
                segment.name, report.size_bytes, report.pending_readers
            )?,
            (None, Some(err)) => {
                writeln!(out, "\t{:>8} [error stat(2)ing file: {err}]", segment.name)?
            }
            (None, None) => continue,
        }
        if let Some(index) = &segment.index {
            writeln!(out, "\t\t idx: {index}")?;
        }
        if let Some(datafile) = &segment.datafile {
            writeln!(out, "\t\t data: {datafile}")?;
        }
        if let Some(repair) = &segment.repair {
            writeln!(out, "\t\t repair: {repair}")?;
        }
        if segment.reclaimed {
            writeln!(out, "\t\t reclaimed")?;
        }
    }
    Ok(())
}
