use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use tracing::{debug, info, warn};

use crate::{
    admission::{self, HostResources},
    broker::{Broker, Progress},
    chunk, concat,
    crop::{self, CropResult},
    encoder::{self, EncodeConfig},
    ffmpeg,
    probe::{self, AudioStream, VideoInfo},
    reporter::{
        BatchStartInfo, BatchSummary, CropSummary, EncodingConfigSummary, EncodingOutcome,
        ErrorReport, FileProgress, InitializationSummary, ProgressSnapshot, Reporter, Stage,
    },
    resume::ResumeState,
    settings::{CropMode, Settings},
    source::{FrameGeometry, SourceIndex},
    util::{self, WorkDir},
    validate::{self, Expectations, ValidationReport, ValidationStep},
    Error,
};

const REQUIRED_BINARIES: [&str; 4] = ["ffmpeg", "ffprobe", "ffmsindex", encoder::SVT_BINARY];

/// Result of one successfully produced output file.
#[derive(Debug)]
pub struct FileOutcome {
    pub input:               PathBuf,
    pub output:              PathBuf,
    pub elapsed:             Duration,
    pub input_size:          u64,
    pub output_size:         u64,
    pub video_duration_secs: f64,
    pub speed:               f32,
    pub validation:          ValidationReport,
}

/// Sequences the pipeline for a batch of inputs:
/// index+crop in parallel, chunk planning, admission, encode+audio in
/// parallel, merge, mux, then validation. Structured events are emitted
/// at every stage boundary.
pub struct PipelineContext<'a> {
    settings:  Settings,
    reporter:  &'a dyn Reporter,
    cancelled: Arc<AtomicBool>,
}

impl<'a> PipelineContext<'a> {
    /// Validates the configuration and the external-tool environment.
    /// Both are checked before any work starts.
    pub fn new(
        settings: Settings,
        reporter: &'a dyn Reporter,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        settings.validate()?;

        for binary in REQUIRED_BINARIES {
            if which::which(binary).is_err() {
                return Err(Error::PrerequisiteMissing {
                    binary: binary.to_string(),
                });
            }
        }
        if !probe::mediainfo_available() {
            warn!("mediainfo not installed; HDR validation will be skipped");
        }

        Ok(Self {
            settings,
            reporter,
            cancelled,
        })
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Encodes every input in order. Per-input failures are reported and
    /// the batch continues; cancellation stops the batch after the
    /// current file.
    pub fn process_batch(&self, inputs: &[PathBuf]) -> Result<Vec<FileOutcome>, Error> {
        self.reporter
            .hardware(&sysinfo::System::host_name().unwrap_or_default());

        if inputs.len() > 1 {
            self.reporter.batch_started(&BatchStartInfo {
                total_files: inputs.len(),
                file_list:   inputs.iter().map(|input| display_name(input)).collect(),
                output_dir:  self.settings.output_dir.clone(),
            });
        }

        let mut outcomes = Vec::new();
        for (file_index, input) in inputs.iter().enumerate() {
            if self.cancelled.load(Ordering::SeqCst) {
                self.reporter.warning("encoding cancelled");
                break;
            }

            if inputs.len() > 1 {
                self.reporter.file_progress(FileProgress {
                    current: file_index + 1,
                    total:   inputs.len(),
                });
            }

            let output = self.output_path_for(input);
            if output.exists() {
                self.reporter.warning(&format!(
                    "output file already exists: {output}; skipping encode",
                    output = output.display()
                ));
                continue;
            }

            match self.encode_file(input, &output) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) if err.is_cancelled() => {
                    self.reporter.warning("encoding cancelled");
                    break;
                },
                Err(err) => {
                    self.reporter.error(&error_report(input, &err));
                },
            }

            // Cooldown between batch encodes.
            if inputs.len() > 1
                && file_index + 1 < inputs.len()
                && self.settings.encode_cooldown_secs > 0
                && !self.cancelled.load(Ordering::SeqCst)
            {
                thread::sleep(Duration::from_secs(self.settings.encode_cooldown_secs));
            }
        }

        self.emit_summary(inputs.len(), &outcomes);

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(outcomes)
    }

    fn output_path_for(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map_or_else(|| "output".to_string(), |stem| stem.to_string_lossy().into_owned());
        self.settings.output_dir.join(format!("{stem}.mkv"))
    }

    fn encode_file(&self, input: &Path, output: &Path) -> Result<FileOutcome, Error> {
        let started = Instant::now();

        let info = probe::probe_video(input).map_err(Error::ProbeFailed)?;
        let audio_streams = probe::probe_audio_streams(input).map_err(Error::ProbeFailed)?;
        let hdr_probe = probe::probe_hdr(input);
        let is_hdr = hdr_probe.is_hdr.unwrap_or_else(|| info.is_hdr());

        self.reporter.initialization(&InitializationSummary {
            input_file:        display_name(input),
            output_file:       display_name(output),
            duration:          util::format_duration_secs(info.duration_secs),
            resolution:        format!("{width}x{height}", width = info.width, height = info.height),
            dynamic_range:     if is_hdr { "HDR" } else { "SDR" }.to_string(),
            audio_description: probe::format_audio_description(&audio_streams),
        });
        debug!(
            "video duration: {duration:.2}s, {frames} frames",
            duration = info.duration_secs,
            frames = info.total_frames
        );

        let crf = self.settings.crf_for_width(info.width);
        self.reporter.encoding_config(&EncodingConfigSummary {
            encoder:           "SVT-AV1".to_string(),
            preset:            self.settings.quality.preset,
            tune:              self.settings.quality.tune,
            quality:           format!(
                "CRF {crf} ({tier})",
                tier = Settings::tier_label(info.width)
            ),
            pixel_format:      "yuv420p10le".to_string(),
            audio_codec:       "Opus".to_string(),
            audio_description: probe::format_audio_description(&audio_streams),
            encoder_params:    format!(
                "preset={preset}:tune={tune}:keyint=10s:scd=1:scm=0",
                preset = self.settings.quality.preset,
                tune = self.settings.quality.tune
            ),
        });

        let crop_result = self.run_chunked(input, output, &info, &audio_streams, crf, is_hdr)?;

        let elapsed = started.elapsed();
        let input_size = util::file_size(input);
        let output_size = util::file_size(output);
        let speed = if elapsed.as_secs_f64() > 0.0 {
            (info.duration_secs / elapsed.as_secs_f64()) as f32
        } else {
            0.0
        };

        let dimensions = crop_result.output_dimensions(info.width, info.height);
        let expectations = Expectations {
            dimensions:    Some(dimensions),
            duration_secs: Some(info.duration_secs),
            hdr:           Some(is_hdr),
            audio_tracks:  Some(audio_streams.len()),
        };
        let validation = match validate::validate_output(output, &expectations) {
            Ok(report) => report,
            Err(err) => ValidationReport {
                passed: false,
                steps:  vec![ValidationStep {
                    name:    "Validation".to_string(),
                    passed:  false,
                    details: format!("{err:#}"),
                }],
            },
        };
        self.reporter.validation_complete(&validation);

        self.reporter.encoding_complete(&EncodingOutcome {
            input_file: display_name(input),
            output_file: display_name(output),
            output_path: output.to_path_buf(),
            original_size: input_size,
            encoded_size: output_size,
            total_time: elapsed,
            average_speed: speed,
        });

        Ok(FileOutcome {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            elapsed,
            input_size,
            output_size,
            video_duration_secs: info.duration_secs,
            speed,
            validation,
        })
    }

    /// The chunked encoding pipeline for a single file. Returns the crop
    /// decision so the caller can validate against post-crop dimensions.
    fn run_chunked(
        &self,
        input: &Path,
        output: &Path,
        info: &VideoInfo,
        audio_streams: &[AudioStream],
        crf: u8,
        is_hdr: bool,
    ) -> Result<CropResult, Error> {
        let workdir = WorkDir::for_input(input, self.settings.temp_dir());
        workdir.create().context("failed to create work directory")?;
        util::check_disk_space(workdir.root());

        // Phase 1: index build and crop detection run concurrently; both
        // must finish before chunking.
        self.reporter
            .stage_progress(Stage::Preparing, "Indexing video and detecting crop");
        let crop_disabled = self.settings.crop_mode == CropMode::Disabled;
        let (index, crop_result) = thread::scope(|scope| {
            let index_handle = scope.spawn(|| SourceIndex::build(input));
            let crop_result = crop::detect_crop(
                input,
                info.duration_secs,
                info.width,
                info.height,
                is_hdr,
                crop_disabled,
            );
            (index_handle.join().expect("indexing thread panicked"), crop_result)
        });
        let index = index.map_err(Error::ProbeFailed)?;

        self.reporter.crop_result(&CropSummary {
            message:  crop_result.message.clone(),
            crop:     crop_result.rect().map(|rect| rect.filter()),
            required: crop_result.rect().is_some(),
            disabled: crop_disabled,
        });

        let chunk_duration = self.settings.chunk_duration_for_width(info.width);
        self.reporter.stage_progress(
            Stage::Chunking,
            &format!("Creating {chunk_duration:.0}s chunks"),
        );
        let chunks = chunk::plan_chunks(info.total_frames, info.fps(), chunk_duration);
        self.reporter.stage_progress(
            Stage::Chunking,
            &format!("Split video into {count} chunks", count = chunks.len()),
        );
        debug!(
            "average chunk duration: {duration:.1}s ({frames} frames)",
            duration = info.total_frames as f64 / chunks.len() as f64 / info.fps(),
            frames = info.total_frames / chunks.len()
        );

        let (out_width, out_height) = crop_result.output_dimensions(info.width, info.height);
        let host = HostResources::detect();
        let admission = admission::admit(
            self.settings.workers.workers,
            self.settings.workers.chunk_buffer,
            out_width,
            out_height,
            self.settings.workers.threads_per_worker,
            host,
        );
        if admission.capped {
            self.reporter.warning(&format!(
                "worker count reduced from {requested} to {actual} due to memory headroom",
                requested = self.settings.workers.workers,
                actual = admission.workers
            ));
        }
        self.reporter.stage_progress(
            Stage::Encoding,
            &format!(
                "Starting chunked encoding with {workers} workers",
                workers = admission.workers
            ),
        );
        info!(
            "encoding {chunks} chunks with {workers} workers, {threads} threads/worker",
            chunks = chunks.len(),
            workers = admission.workers,
            threads = admission.threads_per_worker
        );

        let encode_config = EncodeConfig::new(
            info,
            (out_width, out_height),
            crf,
            self.settings.quality.preset,
            self.settings.quality.tune,
            admission.threads_per_worker,
        );
        let geometry = FrameGeometry {
            width:   out_width,
            height:  out_height,
            crop:    crop_result.rect(),
            fps_num: info.fps_num,
            fps_den: info.fps_den,
        };

        let state = ResumeState::load(&workdir)?;
        if !state.completed().is_empty() {
            info!(
                "resuming with {count} chunks already recorded",
                count = state.completed().len()
            );
        }

        self.reporter.encoding_started(info.total_frames as u64);
        let encode_started = Instant::now();
        let fps = info.fps();
        let reporter = self.reporter;
        let on_progress = move |progress: Progress| {
            let elapsed = encode_started.elapsed().as_secs_f64();
            let mut speed = 0.0_f32;
            let mut eta = Duration::ZERO;
            if elapsed > 0.0 && progress.frames_done > 0 {
                let video_seconds = progress.frames_done as f64 / fps;
                speed = (video_seconds / elapsed) as f32;
                if speed > 0.0 {
                    let remaining_frames = progress.frames_total - progress.frames_done;
                    let remaining_secs = remaining_frames as f64 / fps / f64::from(speed);
                    eta = Duration::from_secs_f64(remaining_secs.max(0.0));
                }
            }
            reporter.encoding_progress(&ProgressSnapshot {
                current_frame: progress.frames_done as u64,
                total_frames: progress.frames_total as u64,
                percent: progress.percent(),
                speed,
                eta,
                chunks_done: progress.chunks_done,
                chunks_total: progress.chunks_total,
            });
        };

        // Phase 2: audio extraction only reads the source, so it runs
        // alongside the worker pool. The scope joins the audio thread
        // even when encoding fails.
        let broker = Broker {
            index: &index,
            workdir: &workdir,
            geometry,
            encode_config,
            admission,
        };
        let (encode_result, audio_result) = thread::scope(|scope| {
            let audio_handle =
                scope.spawn(|| ffmpeg::extract_audio(input, &workdir, audio_streams));
            let encode_result =
                broker.encoding_loop(&chunks, &state, &self.cancelled, &on_progress);
            (encode_result, audio_handle.join().expect("audio thread panicked"))
        });
        encode_result?;
        let audio_path = audio_result.context("audio extraction failed")?;

        self.reporter.stage_progress(Stage::Merging, "Merging encoded chunks");
        concat::merge_bitstreams(&workdir, fps, chunks.len()).map_err(Error::MergeFailed)?;

        self.reporter.stage_progress(Stage::Muxing, "Creating final output");
        ffmpeg::mux_final(input, &workdir, output, audio_path.is_some())
            .map_err(Error::MuxFailed)?;

        // The work directory is removed only after the output exists;
        // any earlier return above leaves it in place for resume.
        if output.exists() {
            if let Err(err) = workdir.remove() {
                warn!(
                    "failed to remove work directory {path}: {err}",
                    path = workdir.root().display()
                );
            }
        }

        Ok(crop_result)
    }

    fn emit_summary(&self, total_files: usize, outcomes: &[FileOutcome]) {
        match outcomes {
            [] => self.reporter.warning("no files were successfully encoded"),
            [single] if total_files == 1 => {
                self.reporter.operation_complete(&format!(
                    "successfully encoded {input}",
                    input = display_name(&single.input)
                ));
            },
            _ => {
                let original_size: u64 = outcomes.iter().map(|o| o.input_size).sum();
                let encoded_size: u64 = outcomes.iter().map(|o| o.output_size).sum();
                let total_duration: Duration = outcomes.iter().map(|o| o.elapsed).sum();
                let video_duration: f64 =
                    outcomes.iter().map(|o| o.video_duration_secs).sum();
                let average_speed = if total_duration.as_secs_f64() > 0.0 {
                    (video_duration / total_duration.as_secs_f64()) as f32
                } else {
                    0.0
                };
                let validation_passed =
                    outcomes.iter().filter(|o| o.validation.passed).count();

                self.reporter.batch_complete(&BatchSummary {
                    successful_count: outcomes.len(),
                    total_files,
                    original_size,
                    encoded_size,
                    total_duration,
                    average_speed,
                    validation_passed,
                    validation_failed: outcomes.len() - validation_passed,
                });
            },
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

fn error_report(input: &Path, err: &Error) -> ErrorReport {
    let context = format!("file: {input}", input = input.display());
    match err {
        Error::ProbeFailed(_) => ErrorReport {
            title: "Analysis Error".to_string(),
            message: format!("{err}"),
            context,
            suggestion: "Check that the file is a valid video".to_string(),
        },
        Error::ChunkEncode(_) => ErrorReport {
            title: "Encoding Error".to_string(),
            message: format!("{err}"),
            context,
            suggestion: "Check the log file for the full encoder output".to_string(),
        },
        Error::MergeFailed(_) | Error::MuxFailed(_) => ErrorReport {
            title: "Output Error".to_string(),
            message: format!("{err}"),
            context,
            suggestion: "The work directory was preserved; rerun to resume".to_string(),
        },
        _ => ErrorReport {
            title: "Encoding Error".to_string(),
            message: format!("{err}"),
            context,
            suggestion: "Check the log file for details".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;

    #[test]
    fn output_path_replaces_extension() {
        let context = PipelineContext {
            settings:  Settings::new(PathBuf::from("/out")),
            reporter:  &NullReporter,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        assert_eq!(
            context.output_path_for(Path::new("/media/movie.m2ts")),
            PathBuf::from("/out/movie.mkv")
        );
    }

    #[test]
    fn error_reports_carry_context_and_suggestion() {
        let err = Error::ProbeFailed(anyhow::anyhow!("boom"));
        let report = error_report(Path::new("/media/movie.mkv"), &err);
        assert_eq!(report.title, "Analysis Error");
        assert!(report.context.contains("movie.mkv"));
        assert!(!report.suggestion.is_empty());
    }
}
