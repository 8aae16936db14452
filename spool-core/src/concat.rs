use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context};
use tracing::debug;

use crate::{chunk, ffmpeg::run_captured, util::WorkDir};

/// Maximum number of files handed to the concatenator in one manifest.
/// Larger chunk counts are merged in two levels.
pub const MERGE_BATCH_SIZE: usize = 500;

/// Concatenates the per-chunk bitstreams into one elementary stream at
/// the work directory's video path, with timestamps reset to zero and the
/// source frame rate propagated.
pub fn merge_bitstreams(workdir: &WorkDir, fps: f64, chunk_count: usize) -> anyhow::Result<()> {
    if chunk_count > MERGE_BATCH_SIZE {
        merge_batched(workdir, chunk_count)?;
    }
    merge_output(workdir, fps)
}

/// Writes a concat manifest listing `paths` in order, one absolute path
/// per line.
fn write_manifest(manifest: &Path, paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut file = File::create(manifest)
        .with_context(|| format!("failed to create manifest {}", manifest.display()))?;
    for path in paths {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        writeln!(file, "file '{}'", absolute.display())
            .with_context(|| format!("failed to write manifest {}", manifest.display()))?;
    }
    Ok(())
}

fn concat_command(manifest: &Path) -> Command {
    let mut command = Command::new("ffmpeg");
    command.args(["-hide_banner", "-f", "concat", "-safe", "0"]).arg("-i").arg(manifest);
    command
}

/// Single-level merge of every `.bit` file in the encode directory.
/// Lexicographic file order equals chunk-index order by construction.
fn merge_output(workdir: &WorkDir, fps: f64) -> anyhow::Result<()> {
    let encode_dir = workdir.encode_dir();
    let mut bitstreams: Vec<PathBuf> = fs::read_dir(&encode_dir)
        .with_context(|| format!("failed to read encode directory {}", encode_dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "bit"))
        .collect();
    if bitstreams.is_empty() {
        bail!("no encoded chunks found in {}", encode_dir.display());
    }
    bitstreams.sort();

    let manifest = workdir.manifest_path();
    write_manifest(&manifest, &bitstreams)?;

    let mut command = concat_command(&manifest);
    command
        .args(["-c", "copy", "-r"])
        .arg(format!("{fps:.6}"))
        .args([
            "-fflags",
            "+genpts+igndts+discardcorrupt+bitexact",
            "-avoid_negative_ts",
            "make_zero",
            "-reset_timestamps",
            "1",
            "-start_at_zero",
            "-y",
        ])
        .arg(workdir.video_path());
    run_captured(command, "bitstream concatenation")?;

    let _ = fs::remove_file(&manifest);
    Ok(())
}

/// Contiguous `[start, end)` batches of size `batch_size` covering `count`
/// items.
fn batch_ranges(count: usize, batch_size: usize) -> Vec<(usize, usize)> {
    (0..count.div_ceil(batch_size))
        .map(|batch| (batch * batch_size, ((batch + 1) * batch_size).min(count)))
        .collect()
}

/// Two-level merge for very large chunk counts: concatenate batches of
/// [`MERGE_BATCH_SIZE`] chunks into intermediates, concatenate the
/// intermediates, then delete the per-chunk files and promote the merged
/// result into the `0000` slot so a retry finds a consistent encode
/// directory.
fn merge_batched(workdir: &WorkDir, chunk_count: usize) -> anyhow::Result<()> {
    let encode_dir = workdir.encode_dir();
    let scratch = workdir.merge_scratch_dir();
    fs::create_dir_all(&scratch)
        .with_context(|| format!("failed to create {}", scratch.display()))?;

    let ranges = batch_ranges(chunk_count, MERGE_BATCH_SIZE);
    debug!(
        "batched merge: {chunk_count} chunks in {batches} batches",
        batches = ranges.len()
    );

    let mut intermediates = Vec::with_capacity(ranges.len());
    for (batch, (start, end)) in ranges.iter().enumerate() {
        let paths: Vec<PathBuf> =
            (*start..*end).map(|index| chunk::bitstream_path(&encode_dir, index)).collect();
        let manifest = scratch.join(format!("batch_{batch:04}.txt"));
        write_manifest(&manifest, &paths)?;

        let intermediate = scratch.join(format!("batch_{batch:04}.bit"));
        let mut command = concat_command(&manifest);
        command.args(["-c", "copy", "-y"]).arg(&intermediate);
        run_captured(command, "batch concatenation")?;

        let _ = fs::remove_file(&manifest);
        intermediates.push(intermediate);
    }

    let final_manifest = scratch.join("final.txt");
    write_manifest(&final_manifest, &intermediates)?;
    let merged = scratch.join("merged.bit");
    let mut command = concat_command(&final_manifest);
    command.args(["-c", "copy", "-y"]).arg(&merged);
    run_captured(command, "final batch concatenation")?;

    for index in 0..chunk_count {
        let _ = fs::remove_file(chunk::bitstream_path(&encode_dir, index));
    }
    let slot = chunk::bitstream_path(&encode_dir, 0);
    fs::rename(&merged, &slot).with_context(|| {
        format!("failed to move merged bitstream into {}", slot.display())
    })?;

    let _ = fs::remove_dir_all(&scratch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_exactly() {
        assert_eq!(batch_ranges(1, 500), vec![(0, 1)]);
        assert_eq!(batch_ranges(500, 500), vec![(0, 500)]);
        assert_eq!(batch_ranges(501, 500), vec![(0, 500), (500, 501)]);
        assert_eq!(
            batch_ranges(1001, 500),
            vec![(0, 500), (500, 1000), (1000, 1001)]
        );
        assert_eq!(
            batch_ranges(1200, 500),
            vec![(0, 500), (500, 1000), (1000, 1200)]
        );
    }

    #[test]
    fn manifest_lists_files_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let first = temp.path().join("0000.bit");
        let second = temp.path().join("0001.bit");
        fs::write(&first, b"a").unwrap();
        fs::write(&second, b"b").unwrap();

        let manifest = temp.path().join("concat.txt");
        write_manifest(&manifest, &[first.clone(), second.clone()]).unwrap();

        let contents = fs::read_to_string(&manifest).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("file '"));
        assert!(lines[0].contains("0000.bit"));
        assert!(lines[1].contains("0001.bit"));
    }

    #[test]
    fn manifest_rejects_missing_files() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = temp.path().join("concat.txt");
        let missing = temp.path().join("nope.bit");
        assert!(write_manifest(&manifest, &[missing]).is_err());
    }
}
