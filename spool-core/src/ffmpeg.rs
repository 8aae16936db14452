use std::{
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use anyhow::{bail, Context};
use tracing::debug;

use crate::{probe::AudioStream, util::WorkDir};

/// Runs a command to completion with its output captured. Non-zero exit
/// fails with the captured diagnostics included verbatim; they are the
/// primary debugging artifact for external-tool failures.
pub(crate) fn run_captured(mut command: Command, what: &str) -> anyhow::Result<Output> {
    debug!("running {what}: {command:?}");
    let output = command
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {what}"))?;
    if !output.status.success() {
        bail!(
            "{what} exited with {status}:\n{stderr}",
            status = output.status,
            stderr = String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    Ok(output)
}

/// Opus bitrate in kbps for a track's channel count.
pub fn audio_bitrate_kbps(channels: u32) -> u32 {
    match channels {
        1 => 64,
        2 => 128,
        6 => 256,
        8 => 384,
        other => other * 48,
    }
}

/// Extracts every audio track from the source into the work directory,
/// re-encoded to Opus with channel-count-dependent bitrates. Returns the
/// audio path, or `None` when the source has no audio.
pub fn extract_audio(
    input: &Path,
    workdir: &WorkDir,
    streams: &[AudioStream],
) -> anyhow::Result<Option<PathBuf>> {
    if streams.is_empty() {
        return Ok(None);
    }

    let audio_path = workdir.audio_path();
    let mut command = Command::new("ffmpeg");
    command.arg("-hide_banner").arg("-i").arg(input).args(["-vn", "-map_metadata", "0"]);

    for (position, stream) in streams.iter().enumerate() {
        command.arg("-map").arg(format!("0:a:{index}", index = stream.index));
        command.arg(format!("-c:a:{position}")).arg("libopus");
        command
            .arg(format!("-b:a:{position}"))
            .arg(format!("{rate}k", rate = audio_bitrate_kbps(stream.channels)));
        // Opus rejects some source layouts (e.g. 5.1(side)); normalize.
        command
            .arg(format!("-filter:a:{position}"))
            .arg("aformat=channel_layouts=7.1|5.1|stereo|mono");
    }

    command.arg("-y").arg(&audio_path);
    run_captured(command, "audio extraction")?;
    Ok(Some(audio_path))
}

/// Muxes the merged video with the extracted audio plus the source's
/// subtitles, chapters, and metadata into the final output container.
pub fn mux_final(
    input: &Path,
    workdir: &WorkDir,
    output: &Path,
    has_audio: bool,
) -> anyhow::Result<()> {
    let video = workdir.video_path();
    if !video.exists() {
        bail!("merged video not found at {}", video.display());
    }

    let mut command = Command::new("ffmpeg");
    command.arg("-hide_banner").arg("-i").arg(&video);

    if has_audio {
        command.arg("-i").arg(workdir.audio_path());
    }
    // The original input contributes subtitles and chapters only.
    command.arg("-i").arg(input);

    command.args(["-map", "0:v:0"]);
    if has_audio {
        command.args(["-map", "1:a?"]);
    }
    let source_input = if has_audio { 2 } else { 1 };
    command.arg("-map").arg(format!("{source_input}:s?"));

    command.args(["-c", "copy", "-map_metadata", "0"]);
    command.arg("-map_chapters").arg(source_input.to_string());
    command.args(["-movflags", "+faststart"]);
    command.arg("-y").arg(output);

    run_captured(command, "final mux")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_table_by_channel_count() {
        assert_eq!(audio_bitrate_kbps(1), 64);
        assert_eq!(audio_bitrate_kbps(2), 128);
        assert_eq!(audio_bitrate_kbps(6), 256);
        assert_eq!(audio_bitrate_kbps(8), 384);
        // Non-standard layouts scale per channel.
        assert_eq!(audio_bitrate_kbps(3), 144);
        assert_eq!(audio_bitrate_kbps(5), 240);
    }
}
