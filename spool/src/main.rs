use std::{
    panic,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use spool_core::{context::PipelineContext, settings::{CropMode, Settings}, Error};
use tracing::info;

use crate::term::TerminalReporter;

mod discovery;
mod logging;
mod term;

#[derive(Parser)]
#[command(name = "spool", version, about = "Batch AV1 video transcoder built on SVT-AV1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode video files to AV1
    Encode(EncodeArgs),
}

#[derive(Args)]
struct EncodeArgs {
    /// Input video file or directory containing video files
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Log directory (defaults to the XDG state directory)
    #[arg(short, long)]
    log_dir: Option<PathBuf>,

    /// Scratch directory for chunk files (defaults to the output directory)
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// CRF quality: a single value, or an SD,HD,UHD triple (0-63, lower
    /// is better)
    #[arg(long)]
    crf: Option<String>,

    /// SVT-AV1 preset (0-13, lower is slower)
    #[arg(long)]
    preset: Option<u8>,

    /// Disable automatic black-bar crop detection
    #[arg(long)]
    disable_autocrop: bool,

    /// Number of parallel encoder workers (capped by available memory)
    #[arg(long, default_value_t = spool_core::settings::DEFAULT_WORKERS)]
    workers: usize,

    /// Extra chunks to keep in flight beyond the worker count
    #[arg(long, default_value_t = spool_core::settings::DEFAULT_CHUNK_BUFFER)]
    buffer: usize,

    /// Threads per encoder worker (0 = auto from CPU topology)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Disable the log file
    #[arg(long)]
    no_log: bool,

    /// Disable colored terminal output
    #[arg(long)]
    no_color: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    // Surface panics from worker threads as a process failure.
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        original_hook(panic_info);
        process::exit(1);
    }));

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Encode(args) => run_encode(args),
    };

    if let Err(err) = result {
        if err.downcast_ref::<Error>().is_some_and(Error::is_cancelled) {
            eprintln!("cancelled");
            process::exit(130);
        }
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

fn run_encode(args: EncodeArgs) -> Result<()> {
    if args.no_color || std::env::var_os("NO_COLOR").is_some() {
        colored::control::set_override(false);
    }

    let input = args.input.canonicalize().context("input path does not exist")?;
    let log_dir = args.log_dir.clone().unwrap_or_else(logging::default_log_dir);
    logging::init(&log_dir, args.verbose, args.no_log)?;

    let files = if input.is_dir() {
        let files = discovery::find_video_files(&input)?;
        if files.is_empty() {
            bail!("no video files found in {}", input.display());
        }
        info!("discovered {count} video files in {dir}", count = files.len(), dir = input.display());
        files
    } else {
        vec![input]
    };

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create output directory {}", args.output.display()))?;

    let settings = build_settings(&args)?;

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = Arc::clone(&cancelled);
        ctrlc::set_handler(move || {
            eprintln!("\ninterrupt received, finishing current frames...");
            cancelled.store(true, Ordering::SeqCst);
        })
        .context("failed to install interrupt handler")?;
    }

    let reporter = TerminalReporter::new();
    let context = PipelineContext::new(settings, &reporter, cancelled)?;
    let outcomes = context.process_batch(&files)?;

    if outcomes.iter().any(|outcome| !outcome.validation.passed) {
        bail!("one or more outputs failed validation");
    }
    Ok(())
}

fn build_settings(args: &EncodeArgs) -> Result<Settings> {
    let mut settings = Settings::new(args.output.clone());
    settings.temp_dir = args
        .temp_dir
        .clone()
        .or_else(|| std::env::var_os("SPOOL_TEMP_DIR").map(PathBuf::from));

    if let Some(crf) = &args.crf {
        let (sd, hd, uhd) = parse_crf(crf)?;
        settings.quality.crf_sd = sd;
        settings.quality.crf_hd = hd;
        settings.quality.crf_uhd = uhd;
    }
    if let Some(preset) = args.preset {
        settings.quality.preset = preset;
    }
    if args.disable_autocrop {
        settings.crop_mode = CropMode::Disabled;
    }
    settings.workers.workers = args.workers;
    settings.workers.chunk_buffer = args.buffer;
    settings.workers.threads_per_worker = args.threads;

    Ok(settings)
}

/// Parses `--crf`: either one value for every tier or an `SD,HD,UHD`
/// triple.
fn parse_crf(value: &str) -> Result<(u8, u8, u8)> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let parse = |part: &str| -> Result<u8> {
        part.parse::<u8>().with_context(|| format!("invalid CRF value {part:?}"))
    };
    match parts.as_slice() {
        [single] => {
            let crf = parse(single)?;
            Ok((crf, crf, crf))
        },
        [sd, hd, uhd] => Ok((parse(sd)?, parse(hd)?, parse(uhd)?)),
        _ => bail!("--crf takes one value or an SD,HD,UHD triple"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crf_accepts_single_value() {
        assert_eq!(parse_crf("27").unwrap(), (27, 27, 27));
    }

    #[test]
    fn crf_accepts_triple() {
        assert_eq!(parse_crf("25,27,29").unwrap(), (25, 27, 29));
        assert_eq!(parse_crf("25, 27, 29").unwrap(), (25, 27, 29));
    }

    #[test]
    fn crf_rejects_other_shapes() {
        assert!(parse_crf("25,27").is_err());
        assert!(parse_crf("abc").is_err());
    }
}
