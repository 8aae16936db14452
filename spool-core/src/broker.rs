use std::{
    fs,
    io::{BufReader, Read, Write},
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::{
    admission::Admission,
    chunk::{self, Chunk},
    encoder::{self, EncodeConfig},
    resume::{self, ChunkCompletion, ResumeState},
    source::{FrameGeometry, FrameSource, SourceIndex},
    util::{Semaphore, WorkDir},
    EncoderCrash, Error,
};

/// Aggregated encode progress. Every component is non-decreasing and
/// bounded by its total; updates happen under one lock in the collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub chunks_done:  usize,
    pub chunks_total: usize,
    pub frames_done:  usize,
    pub frames_total: usize,
    pub bytes_done:   u64,
}

impl Progress {
    #[inline]
    pub fn percent(&self) -> f32 {
        if self.frames_total == 0 {
            return 0.0;
        }
        (self.frames_done as f32 / self.frames_total as f32) * 100.0
    }
}

struct ChunkOutcome {
    chunk:  Chunk,
    result: Result<ChunkCompletion, Error>,
}

/// Distributes chunks across a bounded pool of worker threads.
///
/// `W` long-lived workers each hold their own decoder source and one
/// reusable frame buffer; a dispatcher feeds a bounded queue under a
/// counting semaphore of `permits` in-flight chunks; a single collector
/// serializes progress updates and resume-log appends. The first failure
/// is latched atomically and later chunks drain without encoding.
pub struct Broker<'a> {
    pub index:         &'a SourceIndex,
    pub workdir:       &'a WorkDir,
    pub geometry:      FrameGeometry,
    pub encode_config: EncodeConfig,
    pub admission:     Admission,
}

impl Broker<'_> {
    /// Encodes every chunk not already completed according to the resume
    /// state. Blocks until all workers have exited.
    pub fn encoding_loop(
        &self,
        chunks: &[Chunk],
        state: &ResumeState,
        cancelled: &AtomicBool,
        on_progress: &(dyn Fn(Progress) + Sync),
    ) -> Result<(), Error> {
        let encode_dir = self.workdir.encode_dir();
        let done = state.verified_done(&encode_dir);
        let remaining: Vec<Chunk> =
            chunks.iter().filter(|chunk| !done.contains(&chunk.index)).copied().collect();

        let progress = Mutex::new(Progress {
            chunks_done:  chunks.len() - remaining.len(),
            chunks_total: chunks.len(),
            frames_done:  state.frames_done(&done),
            frames_total: chunks.iter().map(Chunk::frames).sum(),
            bytes_done:   state.bytes_done(&done),
        });

        if remaining.is_empty() {
            debug!("all chunks already completed; nothing to encode");
            return Ok(());
        }
        debug!(
            "dispatching {remaining} of {total} chunks across {workers} workers \
             ({permits} permits)",
            remaining = remaining.len(),
            total = chunks.len(),
            workers = self.admission.workers,
            permits = self.admission.permits
        );

        let error_slot: OnceLock<Error> = OnceLock::new();
        let semaphore = Semaphore::new(self.admission.permits);

        thread::scope(|scope| {
            let (chunk_tx, chunk_rx) = bounded::<Chunk>(self.admission.permits);
            let (result_tx, result_rx) = unbounded::<ChunkOutcome>();

            for worker_id in 0..self.admission.workers {
                let chunk_rx = chunk_rx.clone();
                let result_tx = result_tx.clone();
                let error_slot = &error_slot;
                scope.spawn(move || {
                    self.worker_loop(worker_id, &chunk_rx, &result_tx, cancelled, error_slot);
                });
            }
            drop(chunk_rx);
            drop(result_tx);

            // Dispatcher: feed the queue in index order, one permit per
            // in-flight chunk. Stops on cancellation or the first error.
            {
                let remaining = &remaining;
                let semaphore = &semaphore;
                let error_slot = &error_slot;
                scope.spawn(move || {
                    let stop = || {
                        cancelled.load(Ordering::SeqCst) || error_slot.get().is_some()
                    };
                    for chunk in remaining {
                        if stop() {
                            break;
                        }
                        if !semaphore.acquire_unless(stop) {
                            break;
                        }
                        if chunk_tx.send(*chunk).is_err() {
                            semaphore.release();
                            break;
                        }
                    }
                });
            }

            // Collector: the only writer of Progress and the resume log.
            {
                let progress = &progress;
                let semaphore = &semaphore;
                let error_slot = &error_slot;
                scope.spawn(move || {
                    for outcome in result_rx.iter() {
                        semaphore.release();
                        match outcome.result {
                            Ok(completion) => {
                                // Append failures are non-fatal: the chunk
                                // is simply re-encoded on resume.
                                if let Err(err) = resume::append(self.workdir, &completion) {
                                    warn!(
                                        "failed to record chunk {index} in resume log: {err:#}",
                                        index = completion.index
                                    );
                                }

                                let snapshot = {
                                    let mut progress =
                                        progress.lock().expect("progress lock poisoned");
                                    progress.chunks_done += 1;
                                    progress.frames_done += completion.frames;
                                    progress.bytes_done += completion.bytes;
                                    *progress
                                };
                                on_progress(snapshot);
                            },
                            Err(Error::Cancelled) => {
                                debug!(
                                    "chunk {index} drained without encoding",
                                    index = outcome.chunk.index
                                );
                            },
                            Err(err) => {
                                // Only the first failure survives.
                                let _ = error_slot.set(err);
                            },
                        }
                    }
                });
            }
        });

        if let Some(err) = error_slot.into_inner() {
            return Err(err);
        }
        if cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn worker_loop(
        &self,
        worker_id: usize,
        chunk_rx: &Receiver<Chunk>,
        result_tx: &Sender<ChunkOutcome>,
        cancelled: &AtomicBool,
        error_slot: &OnceLock<Error>,
    ) {
        // Each worker owns its decoder source and a single reusable frame
        // buffer; this bounds per-worker pixel memory to one frame.
        let source = FrameSource::new(self.index, self.geometry);
        let mut frame_buffer = vec![0u8; self.geometry.frame_bytes()];
        let should_stop =
            || cancelled.load(Ordering::SeqCst) || error_slot.get().is_some();

        for chunk in chunk_rx.iter() {
            let result = if should_stop() {
                Err(Error::Cancelled)
            } else {
                self.encode_chunk(worker_id, &source, &chunk, &mut frame_buffer, &should_stop)
            };

            if result_tx
                .send(ChunkOutcome {
                    chunk,
                    result,
                })
                .is_err()
            {
                break;
            }
        }
    }

    /// Streams one chunk through a fresh encoder process: decode a frame,
    /// write it to the encoder's stdin, repeat. Cancellation is honored
    /// at every frame boundary.
    fn encode_chunk(
        &self,
        worker_id: usize,
        source: &FrameSource<'_>,
        chunk: &Chunk,
        frame_buffer: &mut [u8],
        should_stop: &impl Fn() -> bool,
    ) -> Result<ChunkCompletion, Error> {
        let output = chunk::bitstream_path(&self.workdir.encode_dir(), chunk.index);
        let crash = |exit_status: Option<ExitStatus>, summary: String, stderr: String| {
            Error::ChunkEncode(Box::new(EncoderCrash {
                chunk_index: chunk.index,
                exit_status,
                summary,
                stderr,
            }))
        };

        let mut command =
            encoder::compose_svt_command(&self.encode_config, chunk.frames(), &output);
        command.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Err(crash(
                    None,
                    format!("failed to spawn encoder: {err}"),
                    String::new(),
                ));
            },
        };
        let mut stdin = child.stdin.take().expect("encoder stdin is piped");
        let stderr = child.stderr.take().expect("encoder stderr is piped");

        // Drain the encoder's diagnostic stream as it is produced, so a
        // chatty encoder can never fill the pipe and stall the frame loop.
        let stderr_text = Arc::new(Mutex::new(String::new()));
        let stderr_capture = Arc::clone(&stderr_text);
        let stderr_reader = thread::spawn(move || {
            let mut captured = String::new();
            if BufReader::new(stderr).read_to_string(&mut captured).is_ok() {
                *stderr_capture.lock().expect("stderr capture poisoned") = captured;
            }
        });

        let mut stream = match source.open_chunk(chunk) {
            Ok(stream) => stream,
            Err(err) => {
                drop(stdin);
                let _ = child.wait();
                let stderr = finish_capture(stderr_reader, &stderr_text);
                return Err(crash(
                    None,
                    format!("failed to open decode stream: {err:#}"),
                    stderr,
                ));
            },
        };

        let mut write_error = None;
        for _ in 0..chunk.frames() {
            if should_stop() {
                drop(stdin);
                let _ = child.wait();
                let _ = stderr_reader.join();
                return Err(Error::Cancelled);
            }

            if let Err(err) = stream.read_frame(frame_buffer) {
                drop(stdin);
                let _ = child.wait();
                let stderr = finish_capture(stderr_reader, &stderr_text);
                return Err(crash(None, format!("{err:#}"), stderr));
            }

            if let Err(err) = stdin.write_all(frame_buffer) {
                write_error = Some(err);
                break;
            }
        }
        drop(stdin);

        let status = match child.wait() {
            Ok(status) => status,
            Err(err) => {
                let stderr = finish_capture(stderr_reader, &stderr_text);
                return Err(crash(
                    None,
                    format!("failed to wait for encoder: {err}"),
                    stderr,
                ));
            },
        };
        let stderr = finish_capture(stderr_reader, &stderr_text);

        if let Some(err) = write_error {
            return Err(crash(
                Some(status),
                format!("failed to write frame data to encoder: {err}"),
                stderr,
            ));
        }
        if !status.success() {
            return Err(crash(Some(status), "encoder exited with failure".to_string(), stderr));
        }

        let bytes = match fs::metadata(&output) {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                return Err(crash(
                    Some(status),
                    format!("encoder produced no output at {path}: {err}", path = output.display()),
                    stderr,
                ));
            },
        };

        debug!(
            "worker {worker_id}: chunk {index} done ({frames} frames, {bytes} bytes)",
            index = chunk.index,
            frames = chunk.frames()
        );
        Ok(ChunkCompletion {
            index: chunk.index,
            frames: chunk.frames(),
            bytes,
        })
    }
}

fn finish_capture(reader: JoinHandle<()>, text: &Arc<Mutex<String>>) -> String {
    let _ = reader.join();
    text.lock().expect("stderr capture poisoned").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn progress_percent_tracks_frames() {
        let progress = Progress {
            chunks_done:  1,
            chunks_total: 4,
            frames_done:  250,
            frames_total: 1000,
            bytes_done:   1,
        };
        assert_eq!(progress.percent(), 25.0);
        assert_eq!(Progress::default().percent(), 0.0);
    }

    #[test]
    fn error_slot_keeps_only_first_failure() {
        let slot: OnceLock<Error> = OnceLock::new();

        thread::scope(|scope| {
            for index in 0..8 {
                let slot = &slot;
                scope.spawn(move || {
                    let _ = slot.set(Error::ChunkEncode(Box::new(EncoderCrash {
                        chunk_index: index,
                        exit_status: None,
                        summary:     "simulated failure".to_string(),
                        stderr:      String::new(),
                    })));
                });
            }
        });

        // Exactly one of the concurrent failures was latched.
        let latched = slot.into_inner().unwrap();
        match latched {
            Error::ChunkEncode(crash) => assert!(crash.chunk_index < 8),
            other => panic!("unexpected error kind: {other}"),
        }
    }

    #[test]
    fn cancelled_results_are_not_latched() {
        let slot: OnceLock<Error> = OnceLock::new();
        // Mirrors the collector's match: cancellations pass through.
        for result in [Err::<ChunkCompletion, _>(Error::Cancelled)] {
            match result {
                Err(Error::Cancelled) => {},
                Err(err) => {
                    let _ = slot.set(err);
                },
                Ok(_) => {},
            }
        }
        assert!(slot.get().is_none());
    }
}
