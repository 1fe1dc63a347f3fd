use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::store::SqliteStore;
use crate::track::{DurationPolicy, Track};
use crate::transcoder::FfmpegTranscoder;

/// Extensions ffmpeg can segment with `-codec: copy` into MPEG-TS.
const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "aac", "m4a", "flac", "wav", "ogg", "opus"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub found: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Display name for a track file: the stem, with underscores as spaces.
pub fn title_from_path(p: &Path) -> String {
    p.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown")
        .replace('_', " ")
}

/// Every audio file below `dir`, sorted by path.
pub fn scan_audio_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        anyhow::bail!("tracks dir does not exist: {}", dir.display());
    }

    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        let rd = std::fs::read_dir(&path)
            .map_err(|e| anyhow::anyhow!("failed to read_dir({}): {e}", path.display()))?;
        for ent in rd {
            let ent = ent.map_err(|e| anyhow::anyhow!("failed to read_dir entry: {e}"))?;
            let p = ent.path();
            if p.is_dir() {
                stack.push(p);
                continue;
            }
            if !p.is_file() {
                continue;
            }

            let Some(ext) = p.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let ext = ext.to_ascii_lowercase();
            // Leftovers from an interrupted trim/pad.
            let is_tmp = p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("xtmp-"));
            if AUDIO_EXTENSIONS.contains(&ext.as_str()) && !is_tmp {
                out.push(p);
            }
        }
    }

    out.sort();
    Ok(out)
}

/// Adds every new audio file under `dir` to the store.
///
/// Files whose name is already known are skipped. Each new file is probed,
/// its duration aligned with `policy` (rewriting the file when that changes
/// the length) and stored under a fresh id. One bad file never aborts the
/// scan.
pub async fn import_tracks(
    dir: &Path,
    store: &SqliteStore,
    transcoder: &FfmpegTranscoder,
    policy: DurationPolicy,
    segment_duration: u32,
) -> anyhow::Result<ImportReport> {
    let scan_dir = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || scan_audio_files(&scan_dir)).await??;

    let mut report = ImportReport {
        found: files.len(),
        ..Default::default()
    };

    for file in files {
        let name = title_from_path(&file);
        if store.track_by_name(&name).await?.is_some() {
            report.skipped += 1;
            continue;
        }

        match import_one(&file, name, store, transcoder, policy, segment_duration).await {
            Ok(track) => {
                tracing::info!("imported {} ({:.2}s, {} kbps)", track.name, track.duration, track.bit_rate);
                report.imported += 1;
            }
            Err(e) => {
                tracing::warn!("import of {} failed: {e:#}", file.display());
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn import_one(
    file: &Path,
    name: String,
    store: &SqliteStore,
    transcoder: &FfmpegTranscoder,
    policy: DurationPolicy,
    segment_duration: u32,
) -> anyhow::Result<Track> {
    let meta = transcoder.probe(file).await?;
    let duration = policy.apply(meta.duration, f64::from(segment_duration));

    if duration < meta.duration {
        transcoder.trim(file, duration).await?;
    } else if duration > meta.duration {
        transcoder.pad(file, duration).await?;
    }

    let track = Track {
        id: Uuid::new_v4().to_string(),
        name,
        path: file.to_string_lossy().to_string(),
        duration,
        bit_rate: meta.bit_rate,
    };
    store.add_track(track.clone()).await?;
    Ok(track)
}
