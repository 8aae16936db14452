use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    path::Path,
    process::{Command, Stdio},
    sync::Mutex,
    thread,
};

use itertools::Itertools;
use tracing::{debug, warn};

use crate::util::Semaphore;

/// Maximum number of concurrent crop-detection samples.
pub const SAMPLE_CONCURRENCY: usize = 8;

/// Share of samples a rectangle must win before it is trusted when the
/// samples disagree.
const DOMINANCE_THRESHOLD: f64 = 0.80;

// Black-pixel thresholds for the detector. HDR grading often leaves
// "black" bars well above SDR black, so the HDR threshold is far more
// tolerant.
const SDR_BLACK_THRESHOLD: u32 = 16;
const HDR_BLACK_THRESHOLD: u32 = 100;

/// A detected crop rectangle. `width + x <= source width` and
/// `height + y <= source height`; all components even.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropRect {
    pub width:  u32,
    pub height: u32,
    pub x:      u32,
    pub y:      u32,
}

impl CropRect {
    /// Parses the detector's `W:H:X:Y` component form.
    pub fn parse(value: &str) -> Option<CropRect> {
        let mut parts = value.split(':');
        let width = parts.next()?.parse().ok()?;
        let height = parts.next()?.parse().ok()?;
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(CropRect {
            width,
            height,
            x,
            y,
        })
    }

    /// The filter expression form, e.g. `crop=1920:800:0:140`.
    pub fn filter(&self) -> String {
        format!(
            "crop={width}:{height}:{x}:{y}",
            width = self.width,
            height = self.height,
            x = self.x,
            y = self.y
        )
    }

    /// Whether applying this rectangle would remove any pixels.
    #[inline]
    pub fn is_effective(&self, source_width: u32, source_height: u32) -> bool {
        self.width != source_width || self.height != source_height
    }
}

/// The sampler's verdict for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropDecision {
    /// No crop; encode at source dimensions.
    None,
    Crop(CropRect),
    /// Multiple non-dominant rectangles were detected. Treated as no
    /// crop, but flagged for reporting.
    Ambiguous,
}

#[derive(Debug, Clone)]
pub struct CropResult {
    pub decision: CropDecision,
    pub message:  String,
    /// True when detection was skipped via configuration.
    pub disabled: bool,
}

impl CropResult {
    fn skipped() -> Self {
        Self {
            decision: CropDecision::None,
            message:  "Skipped".to_string(),
            disabled: true,
        }
    }

    #[inline]
    pub fn rect(&self) -> Option<CropRect> {
        match self.decision {
            CropDecision::Crop(rect) => Some(rect),
            _ => None,
        }
    }

    /// Final output dimensions after applying the decision.
    pub fn output_dimensions(&self, source_width: u32, source_height: u32) -> (u32, u32) {
        match self.decision {
            CropDecision::Crop(rect) => (rect.width, rect.height),
            _ => (source_width, source_height),
        }
    }
}

/// Estimates a single crop rectangle by sampling the detector at 141
/// positions spread uniformly over 15-85% of the source duration.
///
/// Samples run at most [`SAMPLE_CONCURRENCY`] at a time. A sample that
/// fails to spawn or produces no parseable rectangle contributes nothing;
/// it never fails the whole detection.
pub fn detect_crop(
    input: &Path,
    duration_secs: f64,
    source_width: u32,
    source_height: u32,
    hdr: bool,
    disabled: bool,
) -> CropResult {
    if disabled {
        return CropResult::skipped();
    }

    let threshold = if hdr {
        HDR_BLACK_THRESHOLD
    } else {
        SDR_BLACK_THRESHOLD
    };

    let positions = sample_positions();
    let sample_count = positions.len();
    let counts: Mutex<HashMap<CropRect, usize>> = Mutex::new(HashMap::new());
    let semaphore = Semaphore::new(SAMPLE_CONCURRENCY);

    thread::scope(|scope| {
        for position in &positions {
            let counts = &counts;
            let semaphore = &semaphore;
            scope.spawn(move || {
                semaphore.acquire();
                let rect = sample_at(input, duration_secs * position, threshold);
                semaphore.release();
                if let Some(rect) = rect {
                    *counts.lock().expect("crop counts poisoned").entry(rect).or_insert(0) += 1;
                }
            });
        }
    });

    let counts = counts.into_inner().expect("crop counts poisoned");
    debug!(
        "crop detection: {distinct} distinct rectangles over {sample_count} samples",
        distinct = counts.len()
    );
    aggregate(&counts, sample_count, source_width, source_height)
}

/// Sample positions as fractions of the duration: every 0.5% over
/// [15%, 85%], 141 points.
fn sample_positions() -> Vec<f64> {
    (30..=170).map(|step| f64::from(step) / 200.0).collect()
}

/// Runs one short detector pass and returns the plurality rectangle among
/// the lines it printed, if any.
fn sample_at(input: &Path, start_secs: f64, threshold: u32) -> Option<CropRect> {
    let mut child = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-ss")
        .arg(format!("{start_secs:.2}"))
        .arg("-i")
        .arg(input)
        .args(["-vframes", "10", "-vf"])
        .arg(format!("cropdetect=limit={threshold}:round=2:reset=1"))
        .args(["-f", "null", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .ok()?;

    // The detector reports on its diagnostic stream.
    let stderr = child.stderr.take()?;
    let mut counts: HashMap<CropRect, usize> = HashMap::new();
    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        if let Some(rect) = parse_crop_line(&line) {
            *counts.entry(rect).or_insert(0) += 1;
        }
    }

    if let Err(err) = child.wait() {
        warn!("crop sample at {start_secs:.2}s failed to finish: {err}");
    }

    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(rect, _)| rect)
}

/// Extracts the rectangle from a detector line containing `crop=W:H:X:Y`.
pub(crate) fn parse_crop_line(line: &str) -> Option<CropRect> {
    let start = line.find("crop=")? + "crop=".len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != ':')
        .unwrap_or(rest.len());
    CropRect::parse(&rest[..end])
}

fn aggregate(
    counts: &HashMap<CropRect, usize>,
    sample_count: usize,
    source_width: u32,
    source_height: u32,
) -> CropResult {
    let sample_msg = format!("Analyzed {sample_count} samples");

    if counts.is_empty() {
        return CropResult {
            decision: CropDecision::None,
            message:  sample_msg,
            disabled: false,
        };
    }

    let decide_single = |rect: CropRect| {
        if rect.is_effective(source_width, source_height) {
            CropResult {
                decision: CropDecision::Crop(rect),
                message:  "Black bars detected".to_string(),
                disabled: false,
            }
        } else {
            CropResult {
                decision: CropDecision::None,
                message:  sample_msg.clone(),
                disabled: false,
            }
        }
    };

    if counts.len() == 1 {
        let rect = *counts.keys().next().expect("non-empty map");
        return decide_single(rect);
    }

    let total: usize = counts.values().sum();
    let (most_common, count) = counts
        .iter()
        .sorted_by_key(|(_, count)| std::cmp::Reverse(**count))
        .next()
        .map(|(rect, count)| (*rect, *count))
        .expect("non-empty map");

    let share = count as f64 / total as f64;
    if share > DOMINANCE_THRESHOLD {
        return decide_single(most_common);
    }

    CropResult {
        decision: CropDecision::Ambiguous,
        message:  "Multiple aspect ratios detected".to_string(),
        disabled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LETTERBOX: CropRect = CropRect {
        width:  1920,
        height: 800,
        x:      0,
        y:      140,
    };

    const FULL_FRAME: CropRect = CropRect {
        width:  1920,
        height: 1080,
        x:      0,
        y:      0,
    };

    #[test]
    fn parses_detector_lines() {
        let line = "[Parsed_cropdetect_0 @ 0x5624] x1:0 x2:1919 y1:140 y2:939 w:1920 h:800 \
                    x:0 y:140 pts:143 t:0.143 crop=1920:800:0:140";
        assert_eq!(parse_crop_line(line), Some(LETTERBOX));
        assert_eq!(parse_crop_line("no rectangle here"), None);
        assert_eq!(parse_crop_line("crop=1920:800:0"), None);
    }

    #[test]
    fn rect_filter_form() {
        assert_eq!(LETTERBOX.filter(), "crop=1920:800:0:140");
    }

    #[test]
    fn sample_positions_span_15_to_85_percent() {
        let positions = sample_positions();
        assert_eq!(positions.len(), 141);
        assert_eq!(positions[0], 0.15);
        assert_eq!(*positions.last().unwrap(), 0.85);
    }

    #[test]
    fn no_rectangles_means_no_crop() {
        let result = aggregate(&HashMap::new(), 141, 1920, 1080);
        assert_eq!(result.decision, CropDecision::None);
    }

    #[test]
    fn single_effective_rectangle_is_used() {
        let counts = HashMap::from([(LETTERBOX, 141)]);
        let result = aggregate(&counts, 141, 1920, 1080);
        assert_eq!(result.decision, CropDecision::Crop(LETTERBOX));
        assert_eq!(result.output_dimensions(1920, 1080), (1920, 800));
    }

    #[test]
    fn source_sized_rectangle_means_no_crop() {
        let counts = HashMap::from([(FULL_FRAME, 141)]);
        let result = aggregate(&counts, 141, 1920, 1080);
        assert_eq!(result.decision, CropDecision::None);
    }

    #[test]
    fn dominant_rectangle_wins_over_outliers() {
        let counts = HashMap::from([(LETTERBOX, 120), (FULL_FRAME, 10)]);
        let result = aggregate(&counts, 141, 1920, 1080);
        assert_eq!(result.decision, CropDecision::Crop(LETTERBOX));
    }

    #[test]
    fn split_rectangles_are_ambiguous() {
        let other = CropRect {
            width:  1920,
            height: 1036,
            x:      0,
            y:      22,
        };
        let counts = HashMap::from([(LETTERBOX, 70), (other, 60)]);
        let result = aggregate(&counts, 141, 1920, 1080);
        assert_eq!(result.decision, CropDecision::Ambiguous);
        // Ambiguity falls back to source dimensions.
        assert_eq!(result.output_dimensions(1920, 1080), (1920, 1080));
    }

    #[test]
    fn disabled_detection_reports_skip() {
        let result = CropResult::skipped();
        assert!(result.disabled);
        assert_eq!(result.decision, CropDecision::None);
    }
}
