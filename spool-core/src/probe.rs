use std::{path::Path, process::Command};

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::debug;

/// Read-only snapshot of source video properties, produced once per input
/// after probing and consumed by every downstream component.
#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub width:         u32,
    pub height:        u32,
    pub fps_num:       u32,
    pub fps_den:       u32,
    pub total_frames:  usize,
    pub duration_secs: f64,
    /// `None` when the container does not reveal the depth.
    pub bit_depth:     Option<u8>,

    // Color metadata forwarded to the encoder, as the integer codes the
    // encoder expects. `None` means the source did not carry the field.
    pub color_primaries:          Option<u8>,
    pub transfer_characteristics: Option<u8>,
    pub matrix_coefficients:      Option<u8>,
    pub mastering_display:        Option<String>,
    pub content_light:            Option<String>,
}

impl VideoInfo {
    #[inline]
    pub fn fps(&self) -> f64 {
        f64::from(self.fps_num) / f64::from(self.fps_den)
    }

    /// HDR classification from the transfer characteristics alone (PQ or
    /// HLG). Used where a fast answer matters, e.g. the crop detector's
    /// black-bar threshold.
    #[inline]
    pub fn is_hdr(&self) -> bool {
        matches!(self.transfer_characteristics, Some(16) | Some(18))
    }
}

/// One audio track of the source.
#[derive(Debug, Clone)]
pub struct AudioStream {
    /// Position among the input's audio streams (0-based).
    pub index:      usize,
    pub codec_name: String,
    pub channels:   u32,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format:  Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type:          Option<String>,
    codec_name:          Option<String>,
    width:               Option<u32>,
    height:              Option<u32>,
    r_frame_rate:        Option<String>,
    avg_frame_rate:      Option<String>,
    nb_frames:           Option<String>,
    duration:            Option<String>,
    pix_fmt:             Option<String>,
    bits_per_raw_sample: Option<String>,
    color_primaries:     Option<String>,
    color_transfer:      Option<String>,
    color_space:         Option<String>,
    channels:            Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFrames {
    #[serde(default)]
    frames: Vec<FfprobeFrame>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFrame {
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,

    // Mastering display metadata; chromaticities are rational strings
    // like "34000/50000".
    red_x:         Option<String>,
    red_y:         Option<String>,
    green_x:       Option<String>,
    green_y:       Option<String>,
    blue_x:        Option<String>,
    blue_y:        Option<String>,
    white_point_x: Option<String>,
    white_point_y: Option<String>,
    max_luminance: Option<String>,
    min_luminance: Option<String>,

    // Content light level metadata.
    max_content: Option<u32>,
    max_average: Option<u32>,
}

fn run_ffprobe(args: &[&str]) -> anyhow::Result<Vec<u8>> {
    let output = Command::new("ffprobe")
        .args(args)
        .output()
        .context("failed to run ffprobe")?;
    if !output.status.success() {
        bail!(
            "ffprobe exited with {status}: {stderr}",
            status = output.status,
            stderr = String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

/// Probes the source's video stream.
pub fn probe_video(input: &Path) -> anyhow::Result<VideoInfo> {
    let stdout = run_ffprobe(&[
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
        &input.to_string_lossy(),
    ])?;
    let probe: FfprobeOutput =
        serde_json::from_slice(&stdout).context("failed to parse ffprobe output")?;

    let stream = probe
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .context("no video stream found")?;

    let width = stream.width.context("video stream has no width")?;
    let height = stream.height.context("video stream has no height")?;
    if width == 0 || height == 0 {
        bail!("video stream reports zero dimensions ({width}x{height})");
    }

    let rate = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .context("video stream has no frame rate")?;
    let (fps_num, fps_den) = parse_frame_rate(rate)
        .with_context(|| format!("failed to parse frame rate {rate:?}"))?;

    let duration_secs = stream
        .duration
        .as_deref()
        .or(probe.format.as_ref().and_then(|format| format.duration.as_deref()))
        .and_then(|duration| duration.parse::<f64>().ok())
        .context("source has no readable duration")?;
    if duration_secs <= 0.0 {
        bail!("source reports non-positive duration ({duration_secs})");
    }

    let fps = f64::from(fps_num) / f64::from(fps_den);
    let total_frames = match stream.nb_frames.as_deref().and_then(|n| n.parse::<usize>().ok()) {
        Some(frames) if frames > 0 => frames,
        _ => (duration_secs * fps).round() as usize,
    };
    if total_frames == 0 {
        bail!("source contains no video frames");
    }

    let bit_depth = detect_bit_depth(stream);
    let (mastering_display, content_light) = probe_mastering_metadata(input);

    let info = VideoInfo {
        width,
        height,
        fps_num,
        fps_den,
        total_frames,
        duration_secs,
        bit_depth,
        color_primaries: stream.color_primaries.as_deref().and_then(primaries_code),
        transfer_characteristics: stream.color_transfer.as_deref().and_then(transfer_code),
        matrix_coefficients: stream.color_space.as_deref().and_then(matrix_code),
        mastering_display,
        content_light,
    };
    debug!(
        "probed {input}: {width}x{height} @ {fps:.3} fps, {frames} frames, {depth:?} bit depth",
        input = input.display(),
        fps = info.fps(),
        frames = info.total_frames,
        depth = info.bit_depth
    );
    Ok(info)
}

/// Probes the source's audio tracks.
pub fn probe_audio_streams(input: &Path) -> anyhow::Result<Vec<AudioStream>> {
    let stdout = run_ffprobe(&[
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_streams",
        "-select_streams",
        "a",
        &input.to_string_lossy(),
    ])?;
    let probe: FfprobeOutput =
        serde_json::from_slice(&stdout).context("failed to parse ffprobe output")?;

    Ok(probe
        .streams
        .iter()
        .enumerate()
        .map(|(index, stream)| AudioStream {
            index,
            codec_name: stream.codec_name.clone().unwrap_or_default(),
            channels: stream.channels.unwrap_or(2),
        })
        .collect())
}

fn detect_bit_depth(stream: &FfprobeStream) -> Option<u8> {
    if let Some(pix_fmt) = stream.pix_fmt.as_deref() {
        if pix_fmt.contains("12") {
            return Some(12);
        }
        if pix_fmt.contains("10") {
            return Some(10);
        }
        if let Some(bits) =
            stream.bits_per_raw_sample.as_deref().and_then(|bits| bits.parse().ok())
        {
            return Some(bits);
        }
        // A known pixel format without a depth marker is 8-bit.
        return Some(8);
    }
    stream.bits_per_raw_sample.as_deref().and_then(|bits| bits.parse().ok())
}

pub(crate) fn parse_frame_rate(rate: &str) -> Option<(u32, u32)> {
    let (num, den) = rate.split_once('/')?;
    let num = num.parse().ok()?;
    let den = den.parse().ok()?;
    if num == 0 || den == 0 {
        return None;
    }
    Some((num, den))
}

/// Reads mastering-display and content-light metadata from the first
/// frame's side data, formatted the way the encoder expects. Best effort:
/// sources without HDR10 metadata simply yield `None`.
fn probe_mastering_metadata(input: &Path) -> (Option<String>, Option<String>) {
    let stdout = match run_ffprobe(&[
        "-v",
        "error",
        "-print_format",
        "json",
        "-select_streams",
        "v:0",
        "-show_frames",
        "-read_intervals",
        "%+#1",
        &input.to_string_lossy(),
    ]) {
        Ok(stdout) => stdout,
        Err(_) => return (None, None),
    };

    let frames: FfprobeFrames = match serde_json::from_slice(&stdout) {
        Ok(frames) => frames,
        Err(_) => return (None, None),
    };
    let Some(frame) = frames.frames.first() else {
        return (None, None);
    };

    let mut mastering = None;
    let mut content_light = None;
    for side_data in &frame.side_data_list {
        match side_data.side_data_type.as_deref() {
            Some("Mastering display metadata") => {
                mastering = format_mastering_display(side_data);
            },
            Some("Content light level metadata") => {
                if let (Some(max_content), Some(max_average)) =
                    (side_data.max_content, side_data.max_average)
                {
                    content_light = Some(format!("{max_content},{max_average}"));
                }
            },
            _ => {},
        }
    }
    (mastering, content_light)
}

fn format_mastering_display(side_data: &FfprobeSideData) -> Option<String> {
    let value = |field: &Option<String>| field.as_deref().and_then(parse_rational);

    let (gx, gy) = (value(&side_data.green_x)?, value(&side_data.green_y)?);
    let (bx, by) = (value(&side_data.blue_x)?, value(&side_data.blue_y)?);
    let (rx, ry) = (value(&side_data.red_x)?, value(&side_data.red_y)?);
    let (wx, wy) = (value(&side_data.white_point_x)?, value(&side_data.white_point_y)?);
    let max_l = value(&side_data.max_luminance)?;
    let min_l = value(&side_data.min_luminance)?;

    Some(format!(
        "G({gx:.4},{gy:.4})B({bx:.4},{by:.4})R({rx:.4},{ry:.4})WP({wx:.4},{wy:.4})L({max_l:.4},{min_l:.4})"
    ))
}

pub(crate) fn parse_rational(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        },
        None => value.parse().ok(),
    }
}

// Integer codes per ISO/IEC 23091-4, which is what the encoder's
// `--color-primaries` and friends take.

fn primaries_code(name: &str) -> Option<u8> {
    match name {
        "bt709" => Some(1),
        "bt470m" => Some(4),
        "bt470bg" => Some(5),
        "smpte170m" => Some(6),
        "smpte240m" => Some(7),
        "film" => Some(8),
        "bt2020" => Some(9),
        "smpte428" => Some(10),
        "smpte431" => Some(11),
        "smpte432" => Some(12),
        _ => None,
    }
}

fn transfer_code(name: &str) -> Option<u8> {
    match name {
        "bt709" => Some(1),
        "gamma22" | "bt470m" => Some(4),
        "gamma28" | "bt470bg" => Some(5),
        "smpte170m" => Some(6),
        "smpte240m" => Some(7),
        "linear" => Some(8),
        "iec61966-2-4" => Some(11),
        "iec61966-2-1" | "srgb" => Some(13),
        "bt2020-10" => Some(14),
        "bt2020-12" => Some(15),
        "smpte2084" => Some(16),
        "smpte428" => Some(17),
        "arib-std-b67" => Some(18),
        _ => None,
    }
}

fn matrix_code(name: &str) -> Option<u8> {
    match name {
        "gbr" | "rgb" => Some(0),
        "bt709" => Some(1),
        "fcc" => Some(4),
        "bt470bg" => Some(5),
        "smpte170m" => Some(6),
        "smpte240m" => Some(7),
        "ycgco" => Some(8),
        "bt2020nc" => Some(9),
        "bt2020c" => Some(10),
        "smpte2085" => Some(11),
        "ictcp" => Some(14),
        _ => None,
    }
}

/// HDR classification of a file, preferring MediaInfo when it is
/// installed.
#[derive(Debug, Clone)]
pub struct HdrProbe {
    /// Whether the HDR-metadata tooling was available for this reading.
    pub tooling_available: bool,
    pub is_hdr:            Option<bool>,
}

#[derive(Debug, Deserialize)]
struct MediaInfoOutput {
    media: Option<MediaInfoMedia>,
}

#[derive(Debug, Deserialize)]
struct MediaInfoMedia {
    #[serde(default)]
    track: Vec<MediaInfoTrack>,
}

#[derive(Debug, Deserialize)]
struct MediaInfoTrack {
    #[serde(rename = "@type")]
    track_type: Option<String>,
    #[serde(rename = "HDR_Format")]
    hdr_format: Option<String>,
    #[serde(rename = "transfer_characteristics")]
    transfer_characteristics: Option<String>,
    #[serde(rename = "colour_primaries")]
    colour_primaries: Option<String>,
}

pub fn mediainfo_available() -> bool {
    which::which("mediainfo").is_ok()
}

/// Classifies a file as HDR or SDR via MediaInfo. When MediaInfo is not
/// installed, `tooling_available` is false and the classification is
/// unknown; callers treat the corresponding check as skipped.
pub fn probe_hdr(path: &Path) -> HdrProbe {
    if !mediainfo_available() {
        return HdrProbe {
            tooling_available: false,
            is_hdr:            None,
        };
    }

    let is_hdr = Command::new("mediainfo")
        .args(["--Output=JSON", &path.to_string_lossy()])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| serde_json::from_slice::<MediaInfoOutput>(&output.stdout).ok())
        .and_then(|info| {
            let media = info.media?;
            let video = media
                .track
                .iter()
                .find(|track| track.track_type.as_deref() == Some("Video"))?;
            Some(classify_hdr_track(video))
        });

    HdrProbe {
        tooling_available: true,
        is_hdr,
    }
}

fn classify_hdr_track(track: &MediaInfoTrack) -> bool {
    if track.hdr_format.as_deref().is_some_and(|format| !format.is_empty()) {
        return true;
    }
    let transfer = track.transfer_characteristics.as_deref().unwrap_or_default();
    if transfer.contains("PQ") || transfer.contains("2084") || transfer.contains("HLG") {
        return true;
    }
    track
        .colour_primaries
        .as_deref()
        .is_some_and(|primaries| primaries.contains("2020"))
}

const CHANNEL_NAMES: [(u32, &str); 5] = [
    (1, "Mono"),
    (2, "Stereo"),
    (6, "5.1 surround"),
    (7, "6.1 surround"),
    (8, "7.1 surround"),
];

pub fn channel_description(channels: u32) -> String {
    CHANNEL_NAMES
        .iter()
        .find(|(count, _)| *count == channels)
        .map_or_else(|| format!("{channels} channels"), |(_, name)| (*name).to_string())
}

/// Human-readable audio summary for the initialization event, e.g.
/// "2 tracks: Stereo, 5.1 surround".
pub fn format_audio_description(streams: &[AudioStream]) -> String {
    match streams.len() {
        0 => "No audio".to_string(),
        1 => channel_description(streams[0].channels),
        n => {
            let kinds = streams
                .iter()
                .map(|stream| channel_description(stream.channels))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{n} tracks: {kinds}")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("24000/1001"), Some((24000, 1001)));
        assert_eq!(parse_frame_rate("25/1"), Some((25, 1)));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("24"), None);
    }

    #[test]
    fn rational_parsing() {
        assert_eq!(parse_rational("34000/50000"), Some(0.68));
        assert_eq!(parse_rational("50/10000"), Some(0.005));
        assert_eq!(parse_rational("0.3127"), Some(0.3127));
        assert_eq!(parse_rational("1/0"), None);
    }

    #[test]
    fn color_codes_cover_common_names() {
        assert_eq!(primaries_code("bt709"), Some(1));
        assert_eq!(primaries_code("bt2020"), Some(9));
        assert_eq!(transfer_code("smpte2084"), Some(16));
        assert_eq!(transfer_code("arib-std-b67"), Some(18));
        assert_eq!(matrix_code("bt2020nc"), Some(9));
        assert_eq!(matrix_code("unknown-space"), None);
    }

    #[test]
    fn hdr_classification_from_transfer() {
        let info = VideoInfo {
            width:                    3840,
            height:                   2160,
            fps_num:                  24,
            fps_den:                  1,
            total_frames:             100,
            duration_secs:            4.17,
            bit_depth:                Some(10),
            color_primaries:          Some(9),
            transfer_characteristics: Some(16),
            matrix_coefficients:      Some(9),
            mastering_display:        None,
            content_light:            None,
        };
        assert!(info.is_hdr());
    }

    #[test]
    fn mediainfo_track_classification() {
        let pq = MediaInfoTrack {
            track_type:               Some("Video".to_string()),
            hdr_format:               None,
            transfer_characteristics: Some("PQ".to_string()),
            colour_primaries:         Some("BT.2020".to_string()),
        };
        assert!(classify_hdr_track(&pq));

        let sdr = MediaInfoTrack {
            track_type:               Some("Video".to_string()),
            hdr_format:               None,
            transfer_characteristics: Some("BT.709".to_string()),
            colour_primaries:         Some("BT.709".to_string()),
        };
        assert!(!classify_hdr_track(&sdr));
    }

    #[test]
    fn audio_descriptions() {
        assert_eq!(channel_description(2), "Stereo");
        assert_eq!(channel_description(6), "5.1 surround");
        assert_eq!(channel_description(3), "3 channels");

        let streams = vec![
            AudioStream {
                index:      0,
                codec_name: "dts".to_string(),
                channels:   6,
            },
            AudioStream {
                index:      1,
                codec_name: "aac".to_string(),
                channels:   2,
            },
        ];
        assert_eq!(format_audio_description(&streams), "2 tracks: 5.1 surround, Stereo");
    }
}
