use std::sync::Mutex;

use colored::Colorize;
use spool_core::{
    reporter::{
        BatchStartInfo, BatchSummary, CropSummary, EncodingConfigSummary, EncodingOutcome,
        ErrorReport, FileProgress, InitializationSummary, ProgressSnapshot, Reporter, Stage,
    },
    util,
    validate::ValidationReport,
};

/// Renders engine events as terminal output. Progress updates are
/// throttled to whole-percent steps to keep the output readable in both
/// interactive and redirected use.
pub struct TerminalReporter {
    last_percent: Mutex<i32>,
}

impl TerminalReporter {
    pub fn new() -> Self {
        Self {
            last_percent: Mutex::new(-1),
        }
    }
}

impl Reporter for TerminalReporter {
    fn initialization(&self, summary: &InitializationSummary) {
        println!();
        println!("{}", format!("Encoding {}", summary.input_file).bold());
        println!("  Duration:   {}", summary.duration);
        println!("  Resolution: {}", summary.resolution);
        println!("  Range:      {}", summary.dynamic_range);
        println!("  Audio:      {}", summary.audio_description);
    }

    fn encoding_config(&self, summary: &EncodingConfigSummary) {
        println!(
            "  Encoder:    {encoder}, {quality}, {params}",
            encoder = summary.encoder,
            quality = summary.quality,
            params = summary.encoder_params.dimmed()
        );
        println!(
            "  Audio out:  {codec} ({description})",
            codec = summary.audio_codec,
            description = summary.audio_description
        );
    }

    fn stage_progress(&self, stage: Stage, message: &str) {
        println!("{} {message}", format!("[{stage}]").blue().bold());
    }

    fn crop_result(&self, summary: &CropSummary) {
        match (&summary.crop, summary.disabled) {
            (_, true) => println!("{} crop detection disabled", "[Crop]".blue().bold()),
            (Some(crop), _) => {
                println!(
                    "{} {message} ({crop})",
                    "[Crop]".blue().bold(),
                    message = summary.message
                );
            },
            (None, _) => {
                println!("{} {message}", "[Crop]".blue().bold(), message = summary.message);
            },
        }
    }

    fn encoding_started(&self, total_frames: u64) {
        println!(
            "{} {total_frames} frames to encode",
            "[Encoding]".blue().bold()
        );
        *self.last_percent.lock().expect("progress state poisoned") = -1;
    }

    fn encoding_progress(&self, progress: &ProgressSnapshot) {
        let percent = progress.percent as i32;
        {
            let mut last = self.last_percent.lock().expect("progress state poisoned");
            if percent <= *last {
                return;
            }
            *last = percent;
        }

        println!(
            "  {percent:>3}%  frame {frame}/{total}  {speed:.2}x  ETA {eta}  chunks {done}/{chunks}",
            frame = progress.current_frame,
            total = progress.total_frames,
            speed = progress.speed,
            eta = util::format_duration_secs(progress.eta.as_secs_f64()),
            done = progress.chunks_done,
            chunks = progress.chunks_total
        );
    }

    fn validation_complete(&self, report: &ValidationReport) {
        let verdict = if report.passed {
            "passed".green().bold()
        } else {
            "failed".red().bold()
        };
        println!("{} validation {verdict}", "[Validate]".blue().bold());
        for step in &report.steps {
            let mark = if step.passed {
                "ok".green()
            } else {
                "FAIL".red()
            };
            println!("  {mark:>4}  {name}: {details}", name = step.name, details = step.details);
        }
    }

    fn encoding_complete(&self, outcome: &EncodingOutcome) {
        println!(
            "{} {output} ({original} -> {encoded}, {reduction:.1}% smaller, {speed:.2}x over {time})",
            "[Done]".green().bold(),
            output = outcome.output_file,
            original = util::format_size(outcome.original_size),
            encoded = util::format_size(outcome.encoded_size),
            reduction = util::size_reduction_percent(outcome.original_size, outcome.encoded_size),
            speed = outcome.average_speed,
            time = util::format_duration_secs(outcome.total_time.as_secs_f64())
        );
    }

    fn batch_started(&self, info: &BatchStartInfo) {
        println!(
            "{} {count} files -> {output}",
            "[Batch]".blue().bold(),
            count = info.total_files,
            output = info.output_dir.display()
        );
    }

    fn file_progress(&self, progress: FileProgress) {
        println!(
            "{} file {current} of {total}",
            "[Batch]".blue().bold(),
            current = progress.current,
            total = progress.total
        );
    }

    fn batch_complete(&self, summary: &BatchSummary) {
        println!();
        println!(
            "{} {successful}/{total} files encoded, {reduction:.1}% total reduction, \
             {passed} validated ({failed} failed)",
            "[Batch]".green().bold(),
            successful = summary.successful_count,
            total = summary.total_files,
            reduction =
                util::size_reduction_percent(summary.original_size, summary.encoded_size),
            passed = summary.validation_passed,
            failed = summary.validation_failed
        );
    }

    fn operation_complete(&self, message: &str) {
        println!("{} {message}", "[Done]".green().bold());
    }

    fn warning(&self, message: &str) {
        println!("{} {message}", "[Warning]".yellow().bold());
    }

    fn error(&self, report: &ErrorReport) {
        eprintln!();
        eprintln!("{}: {message}", report.title.red().bold(), message = report.message);
        if !report.context.is_empty() {
            eprintln!("  context:    {}", report.context);
        }
        if !report.suggestion.is_empty() {
            eprintln!("  suggestion: {}", report.suggestion);
        }
    }

    fn verbose(&self, message: &str) {
        tracing::debug!("{message}");
    }
}
