use std::path::{Path, PathBuf};

use serde::Serialize;

pub const SEGMENT_EXTENSION: &str = "ts";
pub const INDEX_EXTENSION: &str = "m3u8";

/// One fixed-length slice of a track, as produced by the transcoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub duration: f64,
    pub path: PathBuf,
    /// Only the first segment of a track; marks a discontinuity in the output.
    pub is_first: bool,
    pub track_id: String,
}

/// `{track_id}-{index}.ts`
pub fn segment_file_name(track_id: &str, index: usize) -> String {
    format!("{track_id}-{index}.{SEGMENT_EXTENSION}")
}

/// The transcoder's own index file for a track.
pub fn index_file_name(track_id: &str) -> String {
    format!("{track_id}.{INDEX_EXTENSION}")
}

/// True when `file_name` is one of the artifacts written for `track_id`.
pub fn is_owned_by(file_name: &str, track_id: &str) -> bool {
    if track_id.is_empty() {
        return false;
    }
    if file_name == index_file_name(track_id) {
        return true;
    }
    match file_name.strip_prefix(track_id).and_then(|rest| rest.strip_prefix('-')) {
        Some(rest) => rest
            .strip_suffix(SEGMENT_EXTENSION)
            .and_then(|n| n.strip_suffix('.'))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// Partitions `track_duration` into segments of `target` seconds (the last
/// one may be shorter). Paths depend only on `(track_id, index)`, so the
/// sequence can be re-derived at any time without looking at the disk.
pub fn generate_segments(
    track_duration: f64,
    target: f64,
    track_id: &str,
    out_dir: &Path,
) -> Vec<Segment> {
    if !(track_duration > 0.0 && target > 0.0) || !track_duration.is_finite() {
        return Vec::new();
    }

    let mut segments = Vec::with_capacity((track_duration / target).ceil() as usize);
    let mut remaining = track_duration;
    let mut index = 0usize;

    while remaining > 0.0 {
        let duration = remaining.min(target);
        segments.push(Segment {
            duration,
            path: out_dir.join(segment_file_name(track_id, index)),
            is_first: index == 0,
            track_id: track_id.to_string(),
        });
        remaining -= duration;
        index += 1;
    }

    segments
}
