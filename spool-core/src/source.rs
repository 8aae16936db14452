use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{bail, Context};
use tracing::debug;

use crate::{chunk::Chunk, crop::CropRect};

/// Frame-accurate index over a source file, built once per input and
/// shared read-only across workers.
///
/// Building it runs the external indexer, which fully demuxes the source
/// and leaves a `.ffindex` sidecar next to it; a source that cannot be
/// indexed is rejected before any worker starts.
#[derive(Debug)]
pub struct SourceIndex {
    source:     PathBuf,
    index_file: PathBuf,
}

impl SourceIndex {
    pub fn build(source: &Path) -> anyhow::Result<SourceIndex> {
        let index_file = sidecar_path(source);

        let output = Command::new("ffmsindex")
            .arg("-f")
            .arg(source)
            .output()
            .context("failed to run ffmsindex")?;
        if !output.status.success() {
            bail!(
                "ffmsindex exited with {status}: {stderr}",
                status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        debug!(
            "indexed {source} -> {index}",
            source = source.display(),
            index = index_file.display()
        );
        Ok(SourceIndex {
            source: source.to_path_buf(),
            index_file,
        })
    }

    #[inline]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[inline]
    pub fn index_file(&self) -> &Path {
        &self.index_file
    }
}

fn sidecar_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(".ffindex");
    PathBuf::from(name)
}

/// Decode geometry shared by every worker: output dimensions after
/// cropping, the crop rectangle itself, and the source timing needed for
/// frame-accurate seeks.
#[derive(Debug, Clone, Copy)]
pub struct FrameGeometry {
    pub width:   u32,
    pub height:  u32,
    pub crop:    Option<CropRect>,
    pub fps_num: u32,
    pub fps_den: u32,
}

impl FrameGeometry {
    /// Size of one decoded frame in bytes: 10-bit (two bytes per sample)
    /// 4:2:0, so `2 * w * h * 3/2`.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn start_secs(&self, frame: usize) -> f64 {
        frame as f64 * f64::from(self.fps_den) / f64::from(self.fps_num)
    }

    fn filter_chain(&self) -> String {
        match self.crop {
            Some(rect) => format!("{},format=yuv420p10le", rect.filter()),
            None => "format=yuv420p10le".to_string(),
        }
    }
}

/// A worker's private decode handle over the shared index.
///
/// Sources are single-threaded internally and must never be shared across
/// workers; each worker creates its own on first use and reuses it for
/// every chunk it encodes.
#[derive(Debug)]
pub struct FrameSource<'a> {
    index:    &'a SourceIndex,
    geometry: FrameGeometry,
}

impl<'a> FrameSource<'a> {
    pub fn new(index: &'a SourceIndex, geometry: FrameGeometry) -> Self {
        Self {
            index,
            geometry,
        }
    }

    #[inline]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Opens a decode stream over one chunk's frame range. The decoder is
    /// told to crop and convert before returning pixels, so the stream
    /// yields exactly `chunk.frames()` frames of `frame_bytes()` each.
    pub fn open_chunk(&self, chunk: &Chunk) -> anyhow::Result<FrameStream> {
        let start_secs = self.geometry.start_secs(chunk.start);

        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-ss"])
            .arg(format!("{start_secs:.6}"))
            .arg("-i")
            .arg(self.index.source())
            .args(["-map", "0:v:0", "-vf"])
            .arg(self.geometry.filter_chain())
            .arg("-frames:v")
            .arg(chunk.frames().to_string())
            .args(["-f", "rawvideo", "-an", "-sn", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn decoder")?;

        let stdout = child.stdout.take().expect("decoder stdout is piped");
        let stderr = child.stderr.take().expect("decoder stderr is piped");

        // Drain the diagnostic stream concurrently so the decoder can
        // never block on it; the capture is included in decode errors.
        let stderr_text = Arc::new(Mutex::new(String::new()));
        let stderr_capture = Arc::clone(&stderr_text);
        let stderr_reader = thread::spawn(move || {
            let mut reader = std::io::BufReader::new(stderr);
            let mut captured = String::new();
            if reader.read_to_string(&mut captured).is_ok() {
                *stderr_capture.lock().expect("stderr capture poisoned") = captured;
            }
        });

        Ok(FrameStream {
            child,
            stdout,
            stderr_text,
            stderr_reader: Some(stderr_reader),
            chunk: *chunk,
            frames_read: 0,
        })
    }
}

/// One chunk's worth of decoded frames, read one frame at a time into a
/// caller-provided reusable buffer.
#[derive(Debug)]
pub struct FrameStream {
    child:         Child,
    stdout:        ChildStdout,
    stderr_text:   Arc<Mutex<String>>,
    stderr_reader: Option<JoinHandle<()>>,
    chunk:         Chunk,
    frames_read:   usize,
}

impl FrameStream {
    /// Reads the next frame into `buffer`, which must be exactly
    /// `frame_bytes()` long.
    pub fn read_frame(&mut self, buffer: &mut [u8]) -> anyhow::Result<()> {
        if self.frames_read >= self.chunk.frames() {
            bail!(
                "chunk {index} has no more frames",
                index = self.chunk.index
            );
        }

        if let Err(err) = self.stdout.read_exact(buffer) {
            let stderr = self.captured_stderr();
            if stderr.is_empty() {
                bail!(
                    "failed to decode frame {frame}: {err}",
                    frame = self.chunk.start + self.frames_read
                );
            }
            bail!(
                "failed to decode frame {frame}: {err}\ndecoder stderr:\n{stderr}",
                frame = self.chunk.start + self.frames_read
            );
        }

        self.frames_read += 1;
        Ok(())
    }

    fn captured_stderr(&mut self) -> String {
        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }
        self.stderr_text.lock().expect("stderr capture poisoned").trim().to_string()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        // The decoder exits on its own after the last requested frame;
        // killing an already-exited process is harmless, and an abandoned
        // stream must not leave a child behind.
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.stderr_reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_lands_next_to_source() {
        assert_eq!(
            sidecar_path(Path::new("/media/movie.mkv")),
            PathBuf::from("/media/movie.mkv.ffindex")
        );
    }

    fn geometry(crop: Option<CropRect>) -> FrameGeometry {
        FrameGeometry {
            width: 1920,
            height: 800,
            crop,
            fps_num: 24,
            fps_den: 1,
        }
    }

    #[test]
    fn frame_bytes_for_10_bit_420() {
        // 1920x800, two bytes per sample, 4:2:0 subsampling.
        assert_eq!(geometry(None).frame_bytes(), 1920 * 800 * 3);
    }

    #[test]
    fn seek_position_follows_frame_rate() {
        let geometry = FrameGeometry {
            width:   1280,
            height:  720,
            crop:    None,
            fps_num: 24000,
            fps_den: 1001,
        };
        let secs = geometry.start_secs(240);
        assert!((secs - 10.01).abs() < 1e-9);
    }

    #[test]
    fn filter_chain_applies_crop_before_format() {
        let rect = CropRect {
            width:  1920,
            height: 800,
            x:      0,
            y:      140,
        };
        assert_eq!(
            geometry(Some(rect)).filter_chain(),
            "crop=1920:800:0:140,format=yuv420p10le"
        );
        assert_eq!(geometry(None).filter_chain(), "format=yuv420p10le");
    }
}
