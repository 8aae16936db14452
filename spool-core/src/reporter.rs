use std::{fmt, path::PathBuf, time::Duration};

use serde::Serialize;

use crate::validate::ValidationReport;

/// Pipeline stages surfaced to reporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Preparing,
    Chunking,
    Encoding,
    Merging,
    Muxing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preparing => "Preparing",
            Stage::Chunking => "Chunking",
            Stage::Encoding => "Encoding",
            Stage::Merging => "Merging",
            Stage::Muxing => "Muxing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitializationSummary {
    pub input_file:        String,
    pub output_file:       String,
    pub duration:          String,
    pub resolution:        String,
    pub dynamic_range:     String,
    pub audio_description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodingConfigSummary {
    pub encoder:           String,
    pub preset:            u8,
    pub tune:              u8,
    pub quality:           String,
    pub pixel_format:      String,
    pub audio_codec:       String,
    pub audio_description: String,
    pub encoder_params:    String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CropSummary {
    pub message:  String,
    /// The chosen rectangle as a filter expression, when cropping.
    pub crop:     Option<String>,
    pub required: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub current_frame: u64,
    pub total_frames:  u64,
    pub percent:       f32,
    /// Encoded video seconds per wall-clock second.
    pub speed:         f32,
    pub eta:           Duration,
    pub chunks_done:   usize,
    pub chunks_total:  usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodingOutcome {
    pub input_file:    String,
    pub output_file:   String,
    pub output_path:   PathBuf,
    pub original_size: u64,
    pub encoded_size:  u64,
    pub total_time:    Duration,
    pub average_speed: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStartInfo {
    pub total_files: usize,
    pub file_list:   Vec<String>,
    pub output_dir:  PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FileProgress {
    pub current: usize,
    pub total:   usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub successful_count:  usize,
    pub total_files:       usize,
    pub original_size:     u64,
    pub encoded_size:      u64,
    pub total_duration:    Duration,
    pub average_speed:     f32,
    pub validation_passed: usize,
    pub validation_failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub title:      String,
    pub message:    String,
    pub context:    String,
    pub suggestion: String,
}

/// Capability set the engine emits over. Every method has a no-op
/// default, so a sink only implements what it renders.
#[allow(unused_variables)]
pub trait Reporter: Send + Sync {
    fn hardware(&self, hostname: &str) {}
    fn initialization(&self, summary: &InitializationSummary) {}
    fn stage_progress(&self, stage: Stage, message: &str) {}
    fn crop_result(&self, summary: &CropSummary) {}
    fn encoding_config(&self, summary: &EncodingConfigSummary) {}
    fn encoding_started(&self, total_frames: u64) {}
    fn encoding_progress(&self, progress: &ProgressSnapshot) {}
    fn validation_complete(&self, report: &ValidationReport) {}
    fn encoding_complete(&self, outcome: &EncodingOutcome) {}
    fn batch_started(&self, info: &BatchStartInfo) {}
    fn file_progress(&self, progress: FileProgress) {}
    fn batch_complete(&self, summary: &BatchSummary) {}
    fn operation_complete(&self, message: &str) {}
    fn warning(&self, message: &str) {}
    fn error(&self, report: &ErrorReport) {}
    fn verbose(&self, message: &str) {}
}

/// Discards every event.
pub struct NullReporter;

impl Reporter for NullReporter {}

/// Fans every event out to multiple sinks.
pub struct MultiReporter {
    sinks: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(sinks: Vec<Box<dyn Reporter>>) -> Self {
        Self {
            sinks,
        }
    }

    pub fn push(&mut self, sink: Box<dyn Reporter>) {
        self.sinks.push(sink);
    }
}

impl Reporter for MultiReporter {
    fn hardware(&self, hostname: &str) {
        for sink in &self.sinks {
            sink.hardware(hostname);
        }
    }

    fn initialization(&self, summary: &InitializationSummary) {
        for sink in &self.sinks {
            sink.initialization(summary);
        }
    }

    fn stage_progress(&self, stage: Stage, message: &str) {
        for sink in &self.sinks {
            sink.stage_progress(stage, message);
        }
    }

    fn crop_result(&self, summary: &CropSummary) {
        for sink in &self.sinks {
            sink.crop_result(summary);
        }
    }

    fn encoding_config(&self, summary: &EncodingConfigSummary) {
        for sink in &self.sinks {
            sink.encoding_config(summary);
        }
    }

    fn encoding_started(&self, total_frames: u64) {
        for sink in &self.sinks {
            sink.encoding_started(total_frames);
        }
    }

    fn encoding_progress(&self, progress: &ProgressSnapshot) {
        for sink in &self.sinks {
            sink.encoding_progress(progress);
        }
    }

    fn validation_complete(&self, report: &ValidationReport) {
        for sink in &self.sinks {
            sink.validation_complete(report);
        }
    }

    fn encoding_complete(&self, outcome: &EncodingOutcome) {
        for sink in &self.sinks {
            sink.encoding_complete(outcome);
        }
    }

    fn batch_started(&self, info: &BatchStartInfo) {
        for sink in &self.sinks {
            sink.batch_started(info);
        }
    }

    fn file_progress(&self, progress: FileProgress) {
        for sink in &self.sinks {
            sink.file_progress(progress);
        }
    }

    fn batch_complete(&self, summary: &BatchSummary) {
        for sink in &self.sinks {
            sink.batch_complete(summary);
        }
    }

    fn operation_complete(&self, message: &str) {
        for sink in &self.sinks {
            sink.operation_complete(message);
        }
    }

    fn warning(&self, message: &str) {
        for sink in &self.sinks {
            sink.warning(message);
        }
    }

    fn error(&self, report: &ErrorReport) {
        for sink in &self.sinks {
            sink.error(report);
        }
    }

    fn verbose(&self, message: &str) {
        for sink in &self.sinks {
            sink.verbose(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    struct CountingReporter {
        warnings: Arc<AtomicUsize>,
    }

    impl Reporter for CountingReporter {
        fn warning(&self, _message: &str) {
            self.warnings.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn multi_reporter_fans_out() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let multi = MultiReporter::new(vec![
            Box::new(NullReporter),
            Box::new(CountingReporter {
                warnings: Arc::clone(&warnings),
            }),
        ]);
        multi.warning("low memory");
        multi.stage_progress(Stage::Encoding, "starting");
        multi.warning("worker count reduced");
        assert_eq!(warnings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stage_names_render() {
        assert_eq!(Stage::Preparing.to_string(), "Preparing");
        assert_eq!(Stage::Muxing.to_string(), "Muxing");
    }
}
