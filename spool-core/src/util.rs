use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex},
    time::Duration,
};

use tracing::warn;

/// Minimum free space recommended for the scratch filesystem, in bytes.
pub const MIN_TEMP_SPACE_BYTES: u64 = 100 * 1024 * 1024;

/// Per-input scratch directory.
///
/// Owned exclusively by the orchestrator for the duration of one file.
/// Removed on successful completion, preserved on failure so a rerun can
/// resume from the completed chunks.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Derives the work directory for an input file under the scratch
    /// root: a hidden directory named after the input's file stem.
    pub fn for_input(input: &Path, temp_root: &Path) -> Self {
        let stem = input.file_stem().map_or_else(
            || "input".to_string(),
            |stem| stem.to_string_lossy().into_owned(),
        );
        Self {
            root: temp_root.join(format!(".spool-{stem}")),
        }
    }

    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(self.encode_dir())
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn encode_dir(&self) -> PathBuf {
        self.root.join("encode")
    }

    #[inline]
    pub fn done_file(&self) -> PathBuf {
        self.root.join("done.txt")
    }

    /// Merged elementary stream, produced by the bitstream merger.
    #[inline]
    pub fn video_path(&self) -> PathBuf {
        self.root.join("video.mkv")
    }

    /// Extracted and re-encoded audio.
    #[inline]
    pub fn audio_path(&self) -> PathBuf {
        self.root.join("audio.mka")
    }

    /// Transient merger manifest.
    #[inline]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("concat.txt")
    }

    /// Scratch directory for intermediate files of a batched merge.
    #[inline]
    pub fn merge_scratch_dir(&self) -> PathBuf {
        self.root.join("temp_merge")
    }

    pub fn remove(&self) -> io::Result<()> {
        fs::remove_dir_all(&self.root)
    }
}

/// Counting semaphore built on a mutex and condition variable.
///
/// Used to cap in-flight chunks in the worker pool and concurrent samples
/// in the crop detector.
pub struct Semaphore {
    permits: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial_permits: usize) -> Self {
        Self {
            permits: Mutex::new(initial_permits),
            condvar: Condvar::new(),
        }
    }

    /// Acquires a permit, blocking until one is available.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().expect("semaphore mutex poisoned");
        while *permits == 0 {
            permits = self.condvar.wait(permits).expect("semaphore mutex poisoned");
        }
        *permits -= 1;
    }

    /// Acquires a permit unless `stop` becomes true while waiting.
    /// Returns `false` without taking a permit when stopped.
    pub fn acquire_unless(&self, stop: impl Fn() -> bool) -> bool {
        let mut permits = self.permits.lock().expect("semaphore mutex poisoned");
        loop {
            if stop() {
                return false;
            }
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(permits, Duration::from_millis(100))
                .expect("semaphore mutex poisoned");
            permits = guard;
        }
    }

    /// Releases a permit, waking one blocked acquirer.
    pub fn release(&self) {
        let mut permits = self.permits.lock().expect("semaphore mutex poisoned");
        *permits += 1;
        drop(permits);
        self.condvar.notify_one();
    }
}

#[inline]
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

pub fn size_reduction_percent(original: u64, encoded: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    (1.0 - encoded as f64 / original as f64) * 100.0
}

pub fn format_duration_secs(total_secs: f64) -> String {
    let total = total_secs.max(0.0).round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn format_size(bytes: u64) -> String {
    const GIB: f64 = (1u64 << 30) as f64;
    const MIB: f64 = (1u64 << 20) as f64;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes / GIB)
    } else {
        format!("{:.1} MiB", bytes / MIB)
    }
}

/// Warns when the filesystem holding `path` is low on space. Advisory
/// only; the encode proceeds either way.
pub fn check_disk_space(path: &Path) {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let available = disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(sysinfo::Disk::available_space);

    if let Some(available) = available {
        if available < MIN_TEMP_SPACE_BYTES {
            warn!(
                "low disk space in {path}: {available} available (minimum recommended: {minimum})",
                path = path.display(),
                available = format_size(available),
                minimum = format_size(MIN_TEMP_SPACE_BYTES)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;

    #[test]
    fn workdir_layout() {
        let workdir = WorkDir::for_input(Path::new("/media/movie.mkv"), Path::new("/tmp"));
        assert_eq!(workdir.root(), Path::new("/tmp/.spool-movie"));
        assert_eq!(workdir.encode_dir(), Path::new("/tmp/.spool-movie/encode"));
        assert_eq!(workdir.done_file(), Path::new("/tmp/.spool-movie/done.txt"));
        assert_eq!(workdir.video_path(), Path::new("/tmp/.spool-movie/video.mkv"));
        assert_eq!(workdir.audio_path(), Path::new("/tmp/.spool-movie/audio.mka"));
        assert_eq!(workdir.manifest_path(), Path::new("/tmp/.spool-movie/concat.txt"));
    }

    #[test]
    fn semaphore_caps_concurrency() {
        let semaphore = Arc::new(Semaphore::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    semaphore.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                    semaphore.release();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn acquire_unless_observes_stop() {
        let semaphore = Semaphore::new(0);
        let stop = AtomicBool::new(true);
        assert!(!semaphore.acquire_unless(|| stop.load(Ordering::SeqCst)));
    }

    #[test]
    fn acquire_unless_takes_available_permit() {
        let semaphore = Semaphore::new(1);
        assert!(semaphore.acquire_unless(|| false));
        // Permit was consumed.
        assert!(!semaphore.acquire_unless(|| true));
    }

    #[test]
    fn size_reduction() {
        assert_eq!(size_reduction_percent(100, 25), 75.0);
        assert_eq!(size_reduction_percent(0, 25), 0.0);
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration_secs(42.4), "42s");
        assert_eq!(format_duration_secs(62.0), "1m 02s");
        assert_eq!(format_duration_secs(3723.0), "1h 02m 03s");
    }
}
