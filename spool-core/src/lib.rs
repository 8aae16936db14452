//! Core engine for spool: parallel chunked AV1 encoding with SVT-AV1.
//!
//! The engine splits a source video into fixed-length frame-range chunks,
//! dispatches them to a bounded pool of worker threads that stream decoded
//! frames one at a time into per-worker encoder processes, tracks per-chunk
//! completion for crash resume, concatenates the encoded chunk bitstreams
//! into one elementary stream, and validates the final output.
//!
//! The entry point is [`context::PipelineContext`], which sequences the
//! pipeline phases for each input file and emits structured events through
//! a [`reporter::Reporter`].

use std::{fmt, process::ExitStatus};

use thiserror::Error;

pub mod admission;
pub mod broker;
pub mod chunk;
pub mod concat;
pub mod context;
pub mod crop;
pub mod encoder;
pub mod ffmpeg;
pub mod probe;
pub mod reporter;
pub mod resume;
pub mod settings;
pub mod source;
pub mod util;
pub mod validate;

/// Error kinds surfaced by the engine.
///
/// Worker failures are latched atomically inside the broker; only the first
/// failure of a run is returned. `Cancelled` is propagated as an error but
/// treated as expected by callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("{binary} not found in system path")]
    PrerequisiteMissing { binary: String },

    #[error("failed to analyze source: {0:#}")]
    ProbeFailed(anyhow::Error),

    #[error(transparent)]
    ChunkEncode(Box<EncoderCrash>),

    #[error("failed to merge encoded chunks: {0:#}")]
    MergeFailed(anyhow::Error),

    #[error("failed to mux final output: {0:#}")]
    MuxFailed(anyhow::Error),

    #[error("output file failed validation")]
    ValidationFailed,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<Box<EncoderCrash>> for Error {
    fn from(crash: Box<EncoderCrash>) -> Self {
        Error::ChunkEncode(crash)
    }
}

/// Captured state of a failed chunk encode.
///
/// The encoder's stderr is the primary debugging artifact when a chunk
/// fails, so it is kept verbatim and rendered in full.
#[derive(Debug)]
pub struct EncoderCrash {
    pub chunk_index: usize,
    pub exit_status: Option<ExitStatus>,
    pub summary:     String,
    pub stderr:      String,
}

impl fmt::Display for EncoderCrash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {index} failed: {summary}",
            index = self.chunk_index,
            summary = self.summary
        )?;
        if let Some(status) = self.exit_status {
            write!(f, " (exit status: {status})")?;
        }
        if !self.stderr.is_empty() {
            write!(f, "\nencoder stderr:\n{stderr}", stderr = self.stderr.trim_end())?;
        }
        Ok(())
    }
}

impl std::error::Error for EncoderCrash {}
