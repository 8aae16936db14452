use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::Path,
};

use anyhow::Context;
use tracing::debug;

use crate::{chunk, util::WorkDir};

/// One successfully encoded chunk, as recorded in the resume log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCompletion {
    pub index:  usize,
    pub frames: usize,
    pub bytes:  u64,
}

impl ChunkCompletion {
    /// Renders the log line for this completion (without the newline).
    pub fn format_line(&self) -> String {
        format!(
            "{index} {frames} {bytes}",
            index = self.index,
            frames = self.frames,
            bytes = self.bytes
        )
    }

    /// Parses one resume-log line. Returns `None` for anything that is
    /// not three whitespace-separated decimal integers, so a torn final
    /// line after a crash is silently skipped.
    pub fn parse_line(line: &str) -> Option<ChunkCompletion> {
        let mut fields = line.split_whitespace();
        let index = fields.next()?.parse().ok()?;
        let frames = fields.next()?.parse().ok()?;
        let bytes = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }
        Some(ChunkCompletion {
            index,
            frames,
            bytes,
        })
    }
}

/// Completed-chunk state parsed from the resume log at startup.
///
/// The log is the sole source of truth for "done": a chunk counts as done
/// only when its index appears here *and* its bitstream file still exists.
#[derive(Debug, Default)]
pub struct ResumeState {
    completed: Vec<ChunkCompletion>,
}

impl ResumeState {
    /// Loads the resume log, tolerating a missing file and malformed
    /// lines.
    pub fn load(workdir: &WorkDir) -> anyhow::Result<ResumeState> {
        let path = workdir.done_file();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ResumeState::default());
            },
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open resume log {}", path.display()));
            },
        };

        let mut completed = Vec::new();
        for line in BufReader::new(file).lines() {
            let line =
                line.with_context(|| format!("failed to read resume log {}", path.display()))?;
            if let Some(completion) = ChunkCompletion::parse_line(&line) {
                completed.push(completion);
            }
        }

        debug!(
            "loaded resume log with {count} completed chunks",
            count = completed.len()
        );
        Ok(ResumeState {
            completed,
        })
    }

    /// The set of chunk indices that are both recorded in the log and
    /// still have their bitstream file on disk. An output file that is
    /// not in the log is ignored and the chunk will be re-encoded.
    pub fn verified_done(&self, encode_dir: &Path) -> HashSet<usize> {
        self.completed
            .iter()
            .filter(|completion| chunk::bitstream_path(encode_dir, completion.index).exists())
            .map(|completion| completion.index)
            .collect()
    }

    pub fn frames_done(&self, done: &HashSet<usize>) -> usize {
        self.completed
            .iter()
            .filter(|completion| done.contains(&completion.index))
            .map(|completion| completion.frames)
            .sum()
    }

    pub fn bytes_done(&self, done: &HashSet<usize>) -> u64 {
        self.completed
            .iter()
            .filter(|completion| done.contains(&completion.index))
            .map(|completion| completion.bytes)
            .sum()
    }

    #[inline]
    pub fn completed(&self) -> &[ChunkCompletion] {
        &self.completed
    }
}

/// Appends one completion record and flushes before close.
///
/// Failures here are logged but non-fatal for the chunk: re-encoding it on
/// resume is idempotent because the output file is overwritten.
pub fn append(workdir: &WorkDir, completion: &ChunkCompletion) -> anyhow::Result<()> {
    let path = workdir.done_file();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open resume log {}", path.display()))?;
    writeln!(file, "{}", completion.format_line())
        .with_context(|| format!("failed to append to resume log {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush resume log {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn scratch_workdir() -> (tempfile::TempDir, WorkDir) {
        let temp = tempfile::tempdir().unwrap();
        let workdir = WorkDir::for_input(Path::new("clip.mkv"), temp.path());
        workdir.create().unwrap();
        (temp, workdir)
    }

    #[test]
    fn line_roundtrip() {
        let completion = ChunkCompletion {
            index:  17,
            frames: 720,
            bytes:  1_234_567,
        };
        assert_eq!(
            ChunkCompletion::parse_line(&completion.format_line()),
            Some(completion)
        );
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert_eq!(ChunkCompletion::parse_line(""), None);
        assert_eq!(ChunkCompletion::parse_line("3 720"), None);
        assert_eq!(ChunkCompletion::parse_line("3 720 123 extra"), None);
        assert_eq!(ChunkCompletion::parse_line("3 720 12x"), None);
        // Torn final line after a crash.
        assert_eq!(ChunkCompletion::parse_line("5 48"), None);
    }

    #[test]
    fn load_missing_file_returns_empty_state() {
        let (_temp, workdir) = scratch_workdir();
        let state = ResumeState::load(&workdir).unwrap();
        assert!(state.completed().is_empty());
    }

    #[test]
    fn append_then_load_recovers_completions() {
        let (_temp, workdir) = scratch_workdir();
        for index in [0, 2, 5] {
            append(&workdir, &ChunkCompletion {
                index,
                frames: 480,
                bytes:  1000 + index as u64,
            })
            .unwrap();
        }

        let state = ResumeState::load(&workdir).unwrap();
        assert_eq!(state.completed().len(), 3);
        assert_eq!(state.completed()[1].index, 2);
    }

    #[test]
    fn load_skips_torn_final_line() {
        let (_temp, workdir) = scratch_workdir();
        fs::write(workdir.done_file(), "0 480 1000\n1 480 1001\n2 48").unwrap();

        let state = ResumeState::load(&workdir).unwrap();
        assert_eq!(state.completed().len(), 2);
    }

    #[test]
    fn done_requires_bitstream_on_disk() {
        let (_temp, workdir) = scratch_workdir();
        let encode_dir = workdir.encode_dir();
        for index in [0, 1] {
            append(&workdir, &ChunkCompletion {
                index,
                frames: 480,
                bytes:  9000,
            })
            .unwrap();
        }
        // Only chunk 0 still has its output.
        fs::write(chunk::bitstream_path(&encode_dir, 0), b"ivf").unwrap();
        // Chunk 3 has an output but no log record; it must not count.
        fs::write(chunk::bitstream_path(&encode_dir, 3), b"ivf").unwrap();

        let state = ResumeState::load(&workdir).unwrap();
        let done = state.verified_done(&encode_dir);
        assert_eq!(done, HashSet::from([0]));
        assert_eq!(state.frames_done(&done), 480);
        assert_eq!(state.bytes_done(&done), 9000);
    }
}
