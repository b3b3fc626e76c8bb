use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use colored::Colorize;
use fuzzpatch::{apply_patch, ApplyOptions, LineEnding, PatchOutcome, PatchStatus};
use log::{Level, LevelFilter};
use similar::TextDiff;

/// Apply a unified, context, or git diff to a file, recovering from drifted
/// line numbers with offset search and context fuzzing.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the patch file.
    patch_file: PathBuf,

    /// File the patch applies to. Created if the patch is a file creation.
    target_file: PathBuf,

    /// Show the resulting diff without writing anything.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Line ending for the patched output.
    #[arg(long, value_enum, default_value = "lf")]
    eol: EolArg,

    /// Increase verbosity (-v: info, -vv: debug, -vvv: trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EolArg {
    Lf,
    Crlf,
}

impl From<EolArg> for LineEnding {
    fn from(value: EolArg) -> Self {
        match value {
            EolArg::Lf => LineEnding::Lf,
            EolArg::Crlf => LineEnding::CrLf,
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            let prefix = match record.level() {
                Level::Error => "error:".red().bold().to_string(),
                Level::Warn => "warning:".yellow().bold().to_string(),
                Level::Info => "info:".green().to_string(),
                level => format!("{}:", level.to_string().to_lowercase()),
            };
            writeln!(buf, "{} {}", prefix, record.args())
        })
        .init();
}

fn report_rejects(outcome: &PatchOutcome) {
    for reject in &outcome.rejects {
        eprintln!(
            "{} hunk #{} {} failed to apply to '{}'",
            "warning:".yellow().bold(),
            reject.number,
            reject.header,
            reject.file
        );
    }
}

fn run(args: &Args) -> Result<PatchStatus> {
    let patch = fs::read_to_string(&args.patch_file)
        .with_context(|| format!("failed to read patch file '{}'", args.patch_file.display()))?;
    // A missing target is fine when the patch creates the file.
    let original = match fs::read_to_string(&args.target_file) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to read target file '{}'", args.target_file.display())
            })
        }
    };

    let options = ApplyOptions::builder().eol(args.eol.into()).build();
    let outcome = apply_patch(&patch, &original, &options)
        .with_context(|| format!("failed to apply '{}'", args.patch_file.display()))?;

    report_rejects(&outcome);

    if args.dry_run {
        let diff = TextDiff::from_lines(original.as_str(), outcome.new_content.as_str());
        print!(
            "{}",
            diff.unified_diff()
                .header("original", "patched")
        );
        return Ok(outcome.status);
    }

    if outcome.file_removed {
        fs::remove_file(&args.target_file).with_context(|| {
            format!("failed to remove '{}'", args.target_file.display())
        })?;
    } else {
        fs::write(&args.target_file, &outcome.new_content).with_context(|| {
            format!("failed to write '{}'", args.target_file.display())
        })?;
    }
    Ok(outcome.status)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(PatchStatus::Rejected) => {
            eprintln!(
                "{} some hunks did not apply; target left unchanged for them",
                "error:".red().bold()
            );
            ExitCode::from(1)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            ExitCode::from(2)
        }
    }
}
