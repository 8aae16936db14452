use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::probe::{self, HdrProbe};

/// Maximum allowed difference between input and output durations.
pub const DURATION_TOLERANCE_SECS: f64 = 1.0;
/// Maximum allowed audio/video drift, in milliseconds.
pub const MAX_SYNC_DRIFT_MS: f64 = 100.0;

/// One validation check's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationStep {
    pub name:    String,
    pub passed:  bool,
    pub details: String,
}

/// The validator's verdict: the conjunction of all applicable checks.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub steps:  Vec<ValidationStep>,
}

impl ValidationReport {
    fn push(&mut self, name: &str, passed: bool, details: String) {
        self.passed &= passed;
        self.steps.push(ValidationStep {
            name: name.to_string(),
            passed,
            details,
        });
    }
}

/// What the pipeline expects of the produced file.
#[derive(Debug, Clone, Default)]
pub struct Expectations {
    /// Post-crop output dimensions.
    pub dimensions:    Option<(u32, u32)>,
    pub duration_secs: Option<f64>,
    pub hdr:           Option<bool>,
    pub audio_tracks:  Option<usize>,
}

/// Probes the output file and runs every check against `expect`.
pub fn validate_output(output: &Path, expect: &Expectations) -> anyhow::Result<ValidationReport> {
    let info = probe::probe_video(output)?;
    let audio = probe::probe_audio_streams(output).unwrap_or_default();
    let hdr = probe::probe_hdr(output);

    let mut report = ValidationReport {
        passed: true,
        steps:  Vec::with_capacity(7),
    };

    // The codec name comes from the dedicated codec probe below rather
    // than VideoInfo, which carries no codec identity.
    let codec = probe_video_codec(output);
    let (passed, details) = check_codec(codec.as_deref());
    report.push("Video codec", passed, details);

    let (passed, details) = check_bit_depth(info.bit_depth);
    report.push("Bit depth", passed, details);

    if let Some((expected_width, expected_height)) = expect.dimensions {
        let (passed, details) =
            check_dimensions(info.width, info.height, expected_width, expected_height);
        report.push("Dimensions", passed, details);
    } else {
        report.push("Dimensions", true, "No dimension expectation".to_string());
    }

    if let Some(expected) = expect.duration_secs {
        let (passed, details) = check_duration(info.duration_secs, expected);
        report.push("Duration", passed, details);
    } else {
        report.push("Duration", true, "Duration validation skipped".to_string());
    }

    let (passed, details) = check_hdr(&hdr, expect.hdr);
    report.push("Dynamic range", passed, details);

    let (passed, details) = check_audio(&audio, expect.audio_tracks);
    report.push("Audio", passed, details);

    if let Some(expected) = expect.duration_secs {
        let (passed, details) = check_sync(info.duration_secs, expected);
        report.push("A/V sync", passed, details);
    } else {
        report.push("A/V sync", true, "Sync validation skipped".to_string());
    }

    debug!(
        "validation {verdict}: {passes}/{total} checks passed",
        verdict = if report.passed { "passed" } else { "failed" },
        passes = report.steps.iter().filter(|step| step.passed).count(),
        total = report.steps.len()
    );
    Ok(report)
}

fn probe_video_codec(output: &Path) -> Option<String> {
    let streams = std::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=codec_name",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(output)
        .output()
        .ok()?;
    if !streams.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&streams.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn check_codec(codec: Option<&str>) -> (bool, String) {
    match codec {
        Some(codec) if codec.to_lowercase().contains("av1") => {
            (true, format!("Video codec is {codec}"))
        },
        Some(codec) => (false, format!("Video codec is {codec} (expected AV1)")),
        None => (false, "Could not determine video codec".to_string()),
    }
}

/// Defaults to pass when the depth is unknown, recording that the value
/// came from an assumption rather than the container.
fn check_bit_depth(bit_depth: Option<u8>) -> (bool, String) {
    match bit_depth {
        Some(depth) if depth >= 10 => (true, format!("{depth}-bit output")),
        Some(depth) => (false, format!("{depth}-bit output (expected at least 10-bit)")),
        None => (true, "Bit depth unknown (assumed 10-bit AV1)".to_string()),
    }
}

fn check_dimensions(
    actual_width: u32,
    actual_height: u32,
    expected_width: u32,
    expected_height: u32,
) -> (bool, String) {
    if actual_width == expected_width && actual_height == expected_height {
        (true, format!("Dimensions match: {actual_width}x{actual_height}"))
    } else {
        (
            false,
            format!(
                "Dimension mismatch: got {actual_width}x{actual_height}, expected \
                 {expected_width}x{expected_height}"
            ),
        )
    }
}

fn check_duration(actual: f64, expected: f64) -> (bool, String) {
    let diff = (actual - expected).abs();
    if diff <= DURATION_TOLERANCE_SECS {
        (true, format!("Duration matches input ({actual:.1}s)"))
    } else {
        (
            false,
            format!("Duration mismatch: got {actual:.1}s, expected {expected:.1}s (diff: {diff:.1}s)"),
        )
    }
}

/// The HDR check is skipped (and passes) whenever the HDR-metadata
/// tooling is unavailable; a skipped check never flips the verdict.
fn check_hdr(probe: &HdrProbe, expected: Option<bool>) -> (bool, String) {
    if !probe.tooling_available {
        return (true, "HDR validation skipped (mediainfo not installed)".to_string());
    }

    let label = |hdr: bool| if hdr { "HDR" } else { "SDR" };
    match (expected, probe.is_hdr) {
        (Some(expected), Some(actual)) if expected == actual => {
            (true, format!("{} preserved", label(actual)))
        },
        (Some(expected), Some(actual)) => (
            false,
            format!("Expected {}, found {}", label(expected), label(actual)),
        ),
        (Some(expected), None) => (
            false,
            format!("Expected {}, but could not detect dynamic range", label(expected)),
        ),
        (None, Some(actual)) => (true, format!("Output is {}", label(actual))),
        (None, None) => (true, "No dynamic range expectation".to_string()),
    }
}

fn check_audio(streams: &[probe::AudioStream], expected_tracks: Option<usize>) -> (bool, String) {
    if streams.is_empty() {
        let passed = expected_tracks.map_or(true, |expected| expected == 0);
        return (passed, "No audio tracks".to_string());
    }

    let codecs: Vec<String> =
        streams.iter().map(|stream| stream.codec_name.to_lowercase()).collect();
    let all_opus = codecs.iter().all(|codec| codec == "opus");
    let count_ok = expected_tracks.map_or(true, |expected| expected == streams.len());

    let details = match (all_opus, count_ok) {
        (true, true) if streams.len() == 1 => "Audio track is Opus".to_string(),
        (true, true) => format!("{count} audio tracks, all Opus", count = streams.len()),
        (false, _) => format!(
            "{count} audio tracks: {codecs} (expected all Opus)",
            count = streams.len(),
            codecs = codecs.join(", ")
        ),
        (true, false) => format!(
            "{count} audio tracks (expected {expected})",
            count = streams.len(),
            expected = expected_tracks.unwrap_or(0)
        ),
    };

    (all_opus && count_ok, details)
}

/// Container-duration proxy for A/V drift; true stream-timestamp
/// analysis is out of reach with the tools at hand.
fn check_sync(actual: f64, expected: f64) -> (bool, String) {
    let drift_ms = (actual - expected).abs() * 1000.0;
    if drift_ms <= MAX_SYNC_DRIFT_MS {
        (true, format!("Audio/video sync preserved (drift: {drift_ms:.1}ms)"))
    } else {
        (
            false,
            format!("Audio/video sync drift too large: {drift_ms:.1}ms (max: {MAX_SYNC_DRIFT_MS:.0}ms)"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(codec: &str, channels: u32) -> probe::AudioStream {
        probe::AudioStream {
            index: 0,
            codec_name: codec.to_string(),
            channels,
        }
    }

    #[test]
    fn codec_check_accepts_av1_variants() {
        assert!(check_codec(Some("av1")).0);
        assert!(check_codec(Some("AV1")).0);
        assert!(!check_codec(Some("hevc")).0);
        assert!(!check_codec(None).0);
    }

    #[test]
    fn bit_depth_requires_ten_or_more() {
        assert!(check_bit_depth(Some(10)).0);
        assert!(check_bit_depth(Some(12)).0);
        assert!(!check_bit_depth(Some(8)).0);
        // Unknown depth defaults to pass.
        assert!(check_bit_depth(None).0);
    }

    #[test]
    fn dimension_check_is_exact() {
        assert!(check_dimensions(1920, 800, 1920, 800).0);
        assert!(!check_dimensions(1920, 1080, 1920, 800).0);
    }

    #[test]
    fn duration_check_allows_one_second() {
        assert!(check_duration(120.9, 120.0).0);
        assert!(check_duration(119.0, 120.0).0);
        assert!(!check_duration(121.5, 120.0).0);
    }

    #[test]
    fn sync_check_allows_hundred_millis() {
        assert!(check_sync(120.05, 120.0).0);
        assert!(!check_sync(120.2, 120.0).0);
    }

    #[test]
    fn missing_tooling_skips_hdr_check() {
        let unavailable = HdrProbe {
            tooling_available: false,
            is_hdr:            None,
        };
        // Skipped never flips the verdict, even with an expectation.
        assert!(check_hdr(&unavailable, Some(true)).0);
        assert!(check_hdr(&unavailable, Some(false)).0);
    }

    #[test]
    fn hdr_expectation_must_match_detection() {
        let hdr = HdrProbe {
            tooling_available: true,
            is_hdr:            Some(true),
        };
        assert!(check_hdr(&hdr, Some(true)).0);
        assert!(!check_hdr(&hdr, Some(false)).0);
        assert_eq!(check_hdr(&hdr, Some(true)).1, "HDR preserved");
    }

    #[test]
    fn verdict_is_conjunction_of_steps() {
        let mut report = ValidationReport {
            passed: true,
            steps:  Vec::new(),
        };
        report.push("Video codec", true, "Video codec is av1".to_string());
        report.push("Dynamic range", true, "HDR validation skipped".to_string());
        assert!(report.passed);

        report.push("Duration", false, "off by 3s".to_string());
        report.push("Audio", true, "Audio track is Opus".to_string());
        assert!(!report.passed);
        assert_eq!(report.steps.len(), 4);
    }

    #[test]
    fn audio_check_requires_opus_and_count() {
        let opus = vec![stream("opus", 2), stream("opus", 6)];
        assert!(check_audio(&opus, Some(2)).0);
        assert!(!check_audio(&opus, Some(3)).0);

        let mixed = vec![stream("opus", 2), stream("aac", 2)];
        assert!(!check_audio(&mixed, Some(2)).0);

        assert!(check_audio(&[], None).0);
        assert!(!check_audio(&[], Some(1)).0);
    }
}
