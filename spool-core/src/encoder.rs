use std::{
    path::Path,
    process::Command,
};

use crate::probe::VideoInfo;

pub const SVT_BINARY: &str = "SvtAv1EncApp";

/// Keyframe interval in seconds. Fixed-length chunks rely on regular
/// keyframes rather than scene-aware splitting.
const KEYINT_SECS: f64 = 10.0;

/// Everything a worker needs to spawn an encoder for one chunk. Carried
/// by value into the workers and immutable for the whole run.
#[derive(Debug, Clone)]
pub struct EncodeConfig {
    pub crf:    u8,
    pub preset: u8,
    pub tune:   u8,
    /// `--lp` value; 0 leaves threading to the encoder.
    pub threads_per_worker: usize,

    // Output geometry (after cropping) and timing.
    pub width:   u32,
    pub height:  u32,
    pub fps_num: u32,
    pub fps_den: u32,

    pub color_primaries:          Option<u8>,
    pub transfer_characteristics: Option<u8>,
    pub matrix_coefficients:      Option<u8>,
    pub mastering_display:        Option<String>,
    pub content_light:            Option<String>,
}

impl EncodeConfig {
    pub fn new(
        info: &VideoInfo,
        output_dimensions: (u32, u32),
        crf: u8,
        preset: u8,
        tune: u8,
        threads_per_worker: usize,
    ) -> Self {
        Self {
            crf,
            preset,
            tune,
            threads_per_worker,
            width: output_dimensions.0,
            height: output_dimensions.1,
            fps_num: info.fps_num,
            fps_den: info.fps_den,
            color_primaries: info.color_primaries,
            transfer_characteristics: info.transfer_characteristics,
            matrix_coefficients: info.matrix_coefficients,
            mastering_display: info.mastering_display.clone(),
            content_light: info.content_light.clone(),
        }
    }

}

/// Composes the encoder invocation for one chunk: raw 10-bit 4:2:0 frames
/// on stdin, elementary stream written to `output`. Wrapped in
/// `nice -n 19` so long encodes leave the host responsive.
pub fn compose_svt_command(config: &EncodeConfig, frames: usize, output: &Path) -> Command {
    let mut command = Command::new("nice");
    command.args(["-n", "19", SVT_BINARY]);
    command.args(svt_args(config, frames, output));
    command
}

fn svt_args(config: &EncodeConfig, frames: usize, output: &Path) -> Vec<String> {
    let fps = f64::from(config.fps_num) / f64::from(config.fps_den);
    let keyint_frames = (fps * KEYINT_SECS) as u32;

    let mut args: Vec<String> = vec![
        "-i".into(),
        "stdin".into(),
        // 8-bit sources are converted upstream; the encoder always sees
        // 10-bit 4:2:0.
        "--input-depth".into(),
        "10".into(),
        "--color-format".into(),
        "1".into(),
        "--profile".into(),
        "0".into(),
        "--passes".into(),
        "1".into(),
        "--tile-rows".into(),
        "0".into(),
        "--tile-columns".into(),
        "0".into(),
        "--width".into(),
        config.width.to_string(),
        "--height".into(),
        config.height.to_string(),
        "--fps-num".into(),
        config.fps_num.to_string(),
        "--fps-denom".into(),
        config.fps_den.to_string(),
        "--keyint".into(),
        keyint_frames.to_string(),
        // CRF rate control, with in-chunk scene-change keyframes.
        "--rc".into(),
        "0".into(),
        "--scd".into(),
        "1".into(),
        "--scm".into(),
        "0".into(),
        "--progress".into(),
        "2".into(),
        "--frames".into(),
        frames.to_string(),
        "--crf".into(),
        config.crf.to_string(),
        "--preset".into(),
        config.preset.to_string(),
        "--tune".into(),
        config.tune.to_string(),
    ];

    if config.threads_per_worker > 0 {
        args.push("--lp".into());
        args.push(config.threads_per_worker.to_string());
    }

    if let Some(primaries) = config.color_primaries {
        args.push("--color-primaries".into());
        args.push(primaries.to_string());
    }
    if let Some(transfer) = config.transfer_characteristics {
        args.push("--transfer-characteristics".into());
        args.push(transfer.to_string());
    }
    if let Some(matrix) = config.matrix_coefficients {
        args.push("--matrix-coefficients".into());
        args.push(matrix.to_string());
    }
    if let Some(mastering) = &config.mastering_display {
        args.push("--mastering-display".into());
        args.push(mastering.clone());
    }
    if let Some(content_light) = &config.content_light {
        args.push("--content-light".into());
        args.push(content_light.clone());
    }

    args.push("-b".into());
    args.push(output.to_string_lossy().into_owned());

    args
}

pub fn svt_available() -> bool {
    which::which(SVT_BINARY).is_ok()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn config() -> EncodeConfig {
        EncodeConfig {
            crf:                      27,
            preset:                   6,
            tune:                     0,
            threads_per_worker:       4,
            width:                    1920,
            height:                   800,
            fps_num:                  24000,
            fps_den:                  1001,
            color_primaries:          Some(1),
            transfer_characteristics: Some(1),
            matrix_coefficients:      Some(1),
            mastering_display:        None,
            content_light:            None,
        }
    }

    fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|index| args.get(index + 1))
            .map(String::as_str)
    }

    #[test]
    fn args_carry_geometry_and_quality() {
        let args = svt_args(&config(), 720, &PathBuf::from("/work/encode/0003.bit"));
        assert_eq!(arg_value(&args, "--width"), Some("1920"));
        assert_eq!(arg_value(&args, "--height"), Some("800"));
        assert_eq!(arg_value(&args, "--crf"), Some("27"));
        assert_eq!(arg_value(&args, "--preset"), Some("6"));
        assert_eq!(arg_value(&args, "--frames"), Some("720"));
        assert_eq!(arg_value(&args, "--lp"), Some("4"));
        assert_eq!(arg_value(&args, "-b"), Some("/work/encode/0003.bit"));
        assert_eq!(arg_value(&args, "-i"), Some("stdin"));
    }

    #[test]
    fn keyint_tracks_frame_rate() {
        let args = svt_args(&config(), 720, &PathBuf::from("out.bit"));
        // 23.976 fps over ten seconds.
        assert_eq!(arg_value(&args, "--keyint"), Some("239"));
    }

    #[test]
    fn hdr_metadata_is_forwarded() {
        let mut config = config();
        config.transfer_characteristics = Some(16);
        config.mastering_display =
            Some("G(0.2650,0.6900)B(0.1500,0.0600)R(0.6800,0.3200)WP(0.3127,0.3290)L(1000.0000,0.0050)".to_string());
        config.content_light = Some("1000,400".to_string());

        let args = svt_args(&config, 100, &PathBuf::from("out.bit"));
        assert_eq!(arg_value(&args, "--transfer-characteristics"), Some("16"));
        assert!(arg_value(&args, "--mastering-display").is_some());
        assert_eq!(arg_value(&args, "--content-light"), Some("1000,400"));
    }

    #[test]
    fn threading_flag_is_omitted_when_unset() {
        let mut config = config();
        config.threads_per_worker = 0;
        let args = svt_args(&config, 100, &PathBuf::from("out.bit"));
        assert_eq!(arg_value(&args, "--lp"), None);
    }
}
