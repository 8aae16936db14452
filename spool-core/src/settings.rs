use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Minimum width for the HD quality/chunking tier.
pub const HD_WIDTH_THRESHOLD: u32 = 1920;
/// Minimum width for the UHD quality/chunking tier.
pub const UHD_WIDTH_THRESHOLD: u32 = 3840;

pub const DEFAULT_CRF_SD: u8 = 25;
pub const DEFAULT_CRF_HD: u8 = 27;
pub const DEFAULT_CRF_UHD: u8 = 29;

pub const DEFAULT_PRESET: u8 = 6;
pub const DEFAULT_TUNE: u8 = 0;

// Longer chunks give the encoder more warmup and reduce concatenation
// overhead; slower tiers get longer chunks.
pub const DEFAULT_CHUNK_DURATION_SD: f64 = 20.0;
pub const DEFAULT_CHUNK_DURATION_HD: f64 = 30.0;
pub const DEFAULT_CHUNK_DURATION_UHD: f64 = 45.0;

/// Default worker request. The admission policy caps this down based on
/// resolution and available memory at encode time.
pub const DEFAULT_WORKERS: usize = 24;
/// Extra in-flight chunks beyond the worker count, to keep workers fed.
pub const DEFAULT_CHUNK_BUFFER: usize = 4;

pub const DEFAULT_ENCODE_COOLDOWN_SECS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CropMode {
    Auto,
    Disabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualitySettings {
    pub crf_sd:  u8,
    pub crf_hd:  u8,
    pub crf_uhd: u8,
    pub preset:  u8,
    pub tune:    u8,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            crf_sd:  DEFAULT_CRF_SD,
            crf_hd:  DEFAULT_CRF_HD,
            crf_uhd: DEFAULT_CRF_UHD,
            preset:  DEFAULT_PRESET,
            tune:    DEFAULT_TUNE,
        }
    }
}

/// Chunk duration targets in seconds, by width tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkingSettings {
    pub duration_sd:  f64,
    pub duration_hd:  f64,
    pub duration_uhd: f64,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            duration_sd:  DEFAULT_CHUNK_DURATION_SD,
            duration_hd:  DEFAULT_CHUNK_DURATION_HD,
            duration_uhd: DEFAULT_CHUNK_DURATION_UHD,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Requested worker count; the admission policy may reduce it.
    pub workers:            usize,
    /// Extra chunks to keep in flight beyond the worker count.
    pub chunk_buffer:       usize,
    /// Threads per encoder worker (`--lp`); 0 selects automatically from
    /// the host's CPU topology and the frame width.
    pub threads_per_worker: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers:            DEFAULT_WORKERS,
            chunk_buffer:       DEFAULT_CHUNK_BUFFER,
            threads_per_worker: 0,
        }
    }
}

/// Frozen run configuration. Built once at startup, validated before any
/// work starts, then carried by reference through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub output_dir: PathBuf,
    /// Scratch root for per-input work directories; defaults to the
    /// output directory when unset.
    pub temp_dir:   Option<PathBuf>,

    pub quality:  QualitySettings,
    pub chunking: ChunkingSettings,
    pub workers:  WorkerSettings,

    pub crop_mode:            CropMode,
    pub encode_cooldown_secs: u64,
}

impl Settings {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            temp_dir: None,
            quality: QualitySettings::default(),
            chunking: ChunkingSettings::default(),
            workers: WorkerSettings::default(),
            crop_mode: CropMode::Auto,
            encode_cooldown_secs: DEFAULT_ENCODE_COOLDOWN_SECS,
        }
    }

    /// Checks every knob against its documented range. Raised before any
    /// work starts; fatal for the run.
    pub fn validate(&self) -> Result<(), Error> {
        if self.quality.preset > 13 {
            return Err(Error::ConfigInvalid(format!(
                "preset must be 0-13, got {preset}",
                preset = self.quality.preset
            )));
        }

        for (name, crf) in [
            ("crf-sd", self.quality.crf_sd),
            ("crf-hd", self.quality.crf_hd),
            ("crf-uhd", self.quality.crf_uhd),
        ] {
            if crf > 63 {
                return Err(Error::ConfigInvalid(format!("{name} must be 0-63, got {crf}")));
            }
        }

        if self.workers.workers < 1 {
            return Err(Error::ConfigInvalid(format!(
                "workers must be at least 1, got {workers}",
                workers = self.workers.workers
            )));
        }

        for (name, duration) in [
            ("chunk-duration-sd", self.chunking.duration_sd),
            ("chunk-duration-hd", self.chunking.duration_hd),
            ("chunk-duration-uhd", self.chunking.duration_uhd),
        ] {
            if !(1.0..=120.0).contains(&duration) {
                return Err(Error::ConfigInvalid(format!(
                    "{name} must be between 1 and 120 seconds, got {duration}"
                )));
            }
        }

        Ok(())
    }

    #[inline]
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.as_deref().unwrap_or(&self.output_dir)
    }

    #[inline]
    pub fn crf_for_width(&self, width: u32) -> u8 {
        if width >= UHD_WIDTH_THRESHOLD {
            self.quality.crf_uhd
        } else if width >= HD_WIDTH_THRESHOLD {
            self.quality.crf_hd
        } else {
            self.quality.crf_sd
        }
    }

    #[inline]
    pub fn chunk_duration_for_width(&self, width: u32) -> f64 {
        if width >= UHD_WIDTH_THRESHOLD {
            self.chunking.duration_uhd
        } else if width >= HD_WIDTH_THRESHOLD {
            self.chunking.duration_hd
        } else {
            self.chunking.duration_sd
        }
    }

    pub fn tier_label(width: u32) -> &'static str {
        if width >= UHD_WIDTH_THRESHOLD {
            "UHD"
        } else if width >= HD_WIDTH_THRESHOLD {
            "HD"
        } else {
            "SD"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::new(PathBuf::from("/tmp/out"))
    }

    #[test]
    fn default_settings_validate() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_preset() {
        let mut s = settings();
        s.quality.preset = 14;
        assert!(matches!(s.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_out_of_range_crf() {
        let mut s = settings();
        s.quality.crf_hd = 64;
        assert!(matches!(s.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_zero_workers() {
        let mut s = settings();
        s.workers.workers = 0;
        assert!(matches!(s.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_chunk_duration_outside_range() {
        let mut s = settings();
        s.chunking.duration_uhd = 121.0;
        assert!(matches!(s.validate(), Err(Error::ConfigInvalid(_))));

        s.chunking.duration_uhd = 0.5;
        assert!(matches!(s.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn quality_follows_width_tier() {
        let s = settings();
        assert_eq!(s.crf_for_width(1280), DEFAULT_CRF_SD);
        assert_eq!(s.crf_for_width(1920), DEFAULT_CRF_HD);
        assert_eq!(s.crf_for_width(3840), DEFAULT_CRF_UHD);
    }

    #[test]
    fn chunk_duration_follows_width_tier() {
        let s = settings();
        assert_eq!(s.chunk_duration_for_width(1280), DEFAULT_CHUNK_DURATION_SD);
        assert_eq!(s.chunk_duration_for_width(2560), DEFAULT_CHUNK_DURATION_HD);
        assert_eq!(s.chunk_duration_for_width(4096), DEFAULT_CHUNK_DURATION_UHD);
    }

    #[test]
    fn temp_dir_falls_back_to_output_dir() {
        let mut s = settings();
        assert_eq!(s.temp_dir(), Path::new("/tmp/out"));
        s.temp_dir = Some(PathBuf::from("/tmp/scratch"));
        assert_eq!(s.temp_dir(), Path::new("/tmp/scratch"));
    }
}
