use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const VIDEO_EXTENSIONS: [&str; 7] = ["mkv", "mp4", "mov", "avi", "webm", "m2ts", "ts"];

/// Lists the video files directly inside `dir`, sorted by name.
pub fn find_video_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && is_video(path))
        .collect();
    files.sort();
    Ok(files)
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_lowercase();
            VIDEO_EXTENSIONS.iter().any(|candidate| *candidate == ext)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_video_extensions() {
        assert!(is_video(Path::new("movie.mkv")));
        assert!(is_video(Path::new("movie.MKV")));
        assert!(is_video(Path::new("clip.webm")));
        assert!(!is_video(Path::new("notes.txt")));
        assert!(!is_video(Path::new("noext")));
    }
}
