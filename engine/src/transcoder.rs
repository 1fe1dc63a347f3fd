use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::segment::{index_file_name, SEGMENT_EXTENSION};
use crate::track::Track;

/// Produces the on-disk media behind a track's segments.
///
/// Implementations must be idempotent: asking again for a track whose
/// segments already exist is cheap and succeeds.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn ensure_segments(
        &self,
        track: &Track,
        out_dir: &Path,
        segment_duration: u32,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioMetadata {
    pub duration: f64,
    /// kbps
    pub bit_rate: u32,
    pub codec_name: String,
    pub sample_rate: u32,
    pub channels: u32,
}

/// Shells out to ffmpeg / ffprobe.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    /// Duration, bit rate and stream layout of an audio file.
    pub async fn probe(&self, path: &Path) -> anyhow::Result<AudioMetadata> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(ffprobe_args(path));

        let stdout = self.run(cmd).await.with_context(|| format!("probe {}", path.display()))?;
        parse_probe_output(&stdout)
    }

    /// Cuts `path` down to `duration` seconds in place.
    pub async fn trim(&self, path: &Path, duration: f64) -> anyhow::Result<()> {
        let tmp = sibling_tmp_path(path)?;
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(trim_args(path, &tmp, duration));

        self.run(cmd).await.with_context(|| format!("trim {}", path.display()))?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Extends `path` with trailing silence up to `duration` seconds in place.
    pub async fn pad(&self, path: &Path, duration: f64) -> anyhow::Result<()> {
        let tmp = sibling_tmp_path(path)?;
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(pad_args(path, &tmp, duration));

        self.run(cmd).await.with_context(|| format!("pad {}", path.display()))?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn run(&self, mut cmd: Command) -> anyhow::Result<Vec<u8>> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {}s", self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} ({})", output.status, stderr.trim());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn ensure_segments(
        &self,
        track: &Track,
        out_dir: &Path,
        segment_duration: u32,
    ) -> anyhow::Result<()> {
        let index = out_dir.join(index_file_name(&track.id));
        if is_complete_index(&index).await {
            tracing::debug!("segments already present for {}", track.id);
            return Ok(());
        }

        if !Path::new(&track.path).exists() {
            anyhow::bail!("track file does not exist: {}", track.path);
        }
        tokio::fs::create_dir_all(out_dir).await?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(segment_args(track, out_dir, segment_duration));

        tracing::info!("transcoding {} ({}) into {}s segments", track.name, track.id, segment_duration);
        self.run(cmd).await?;
        Ok(())
    }
}

fn segment_args(track: &Track, out_dir: &Path, segment_duration: u32) -> Vec<String> {
    // ffmpeg expands `%d` to the zero-based segment index, matching `segment_file_name`.
    let pattern = out_dir.join(format!("{}-%d.{SEGMENT_EXTENSION}", track.id));
    let index = out_dir.join(index_file_name(&track.id));

    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        track.path.clone(),
        "-codec:".into(),
        "copy".into(),
        "-start_number".into(),
        "0".into(),
        "-hls_time".into(),
        segment_duration.to_string(),
        "-hls_playlist_type".into(),
        "event".into(),
        "-hls_segment_filename".into(),
        pattern.to_string_lossy().to_string(),
        "-y".into(),
        index.to_string_lossy().to_string(),
    ]
}

fn ffprobe_args(path: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration,bit_rate:stream=codec_name,sample_rate,channels".into(),
        "-of".into(),
        "json".into(),
        "-i".into(),
        path.to_string_lossy().to_string(),
    ]
}

fn trim_args(path: &Path, tmp: &Path, duration: f64) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        path.to_string_lossy().to_string(),
        "-t".into(),
        format!("{duration:.3}"),
        "-c:a".into(),
        "copy".into(),
        "-y".into(),
        tmp.to_string_lossy().to_string(),
    ]
}

fn pad_args(path: &Path, tmp: &Path, duration: f64) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        path.to_string_lossy().to_string(),
        "-af".into(),
        format!("apad=whole_dur={duration:.3}"),
        "-y".into(),
        tmp.to_string_lossy().to_string(),
    ]
}

async fn is_complete_index(index: &Path) -> bool {
    match tokio::fs::read_to_string(index).await {
        Ok(body) => body.contains("#EXT-X-ENDLIST"),
        Err(_) => false,
    }
}

fn sibling_tmp_path(path: &Path) -> anyhow::Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid file name: {}", path.display()))?;
    Ok(path.with_file_name(format!("xtmp-{name}")))
}

#[derive(Deserialize)]
struct RawProbe {
    format: RawFormat,
    #[serde(default)]
    streams: Vec<RawStream>,
}

#[derive(Deserialize)]
struct RawFormat {
    duration: String,
    bit_rate: String,
}

#[derive(Deserialize)]
struct RawStream {
    codec_name: String,
    sample_rate: String,
    channels: u32,
}

fn parse_probe_output(stdout: &[u8]) -> anyhow::Result<AudioMetadata> {
    let raw: RawProbe = serde_json::from_slice(stdout).context("parse ffprobe output")?;
    let stream = raw
        .streams
        .first()
        .ok_or_else(|| anyhow::anyhow!("ffprobe reported no streams"))?;

    let duration: f64 = raw.format.duration.trim().parse().context("parse duration")?;
    if !duration.is_finite() || duration <= 0.0 {
        anyhow::bail!("invalid duration: {duration}");
    }
    let bit_rate: u64 = raw.format.bit_rate.trim().parse().context("parse bit rate")?;

    Ok(AudioMetadata {
        duration,
        bit_rate: (bit_rate / 1000) as u32,
        codec_name: stream.codec_name.clone(),
        sample_rate: stream.sample_rate.trim().parse().context("parse sample rate")?,
        channels: stream.channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, path: &str) -> Track {
        Track {
            id: id.into(),
            name: "Song".into(),
            path: path.into(),
            duration: 12.0,
            bit_rate: 192,
        }
    }

    #[test]
    fn segment_pattern_matches_generated_names() {
        let args = segment_args(&track("abc", "in.mp3"), Path::new("static/tmp"), 5);
        let pattern_at = args.iter().position(|a| a == "-hls_segment_filename").unwrap();
        assert_eq!(args[pattern_at + 1], "static/tmp/abc-%d.ts");
        assert_eq!(args.last().unwrap(), "static/tmp/abc.m3u8");
        let hls_time_at = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[hls_time_at + 1], "5");
    }

    #[tokio::test]
    async fn complete_index_skips_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("abc.m3u8"),
            "#EXTM3U\n#EXTINF:5.0,\nabc-0.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();

        let t = FfmpegTranscoder::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe", Duration::from_secs(1));
        t.ensure_segments(&track("abc", "/nonexistent/in.mp3"), dir.path(), 5)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_source_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let t = FfmpegTranscoder::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe", Duration::from_secs(1));
        let err = t
            .ensure_segments(&track("abc", "/nonexistent/in.mp3"), dir.path(), 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn parses_ffprobe_json() {
        let json = br#"{
            "streams": [{"codec_name": "mp3", "sample_rate": "44100", "channels": 2}],
            "format": {"duration": "241.576000", "bit_rate": "192000"}
        }"#;
        let meta = parse_probe_output(json).unwrap();
        assert_eq!(meta.bit_rate, 192);
        assert_eq!(meta.sample_rate, 44100);
        assert_eq!(meta.channels, 2);
        assert_eq!(meta.codec_name, "mp3");
        assert!((meta.duration - 241.576).abs() < 1e-9);
    }

    #[test]
    fn rejects_probe_without_streams() {
        let json = br#"{"streams": [], "format": {"duration": "1.0", "bit_rate": "1000"}}"#;
        assert!(parse_probe_output(json).is_err());
    }

    #[test]
    fn metadata_query_asks_for_json() {
        let args = ffprobe_args(Path::new("static/tracks/song.mp3"));
        let of_at = args.iter().position(|a| a == "-of").unwrap();
        assert_eq!(args[of_at + 1], "json");
        assert_eq!(args.last().unwrap(), "static/tracks/song.mp3");
    }

    #[test]
    fn trim_and_pad_write_to_the_tmp_file() {
        let src = Path::new("static/tracks/song.mp3");
        let tmp = sibling_tmp_path(src).unwrap();

        let trim = trim_args(src, &tmp, 120.0);
        let t_at = trim.iter().position(|a| a == "-t").unwrap();
        assert_eq!(trim[t_at + 1], "120.000");
        assert_eq!(trim.last().unwrap(), "static/tracks/xtmp-song.mp3");

        let pad = pad_args(src, &tmp, 125.0);
        assert!(pad.contains(&"apad=whole_dur=125.000".to_string()));
        assert_eq!(pad.last().unwrap(), "static/tracks/xtmp-song.mp3");
    }

    #[test]
    fn tmp_path_sits_next_to_source() {
        let tmp = sibling_tmp_path(Path::new("static/tracks/song.mp3")).unwrap();
        assert_eq!(tmp, PathBuf::from("static/tracks/xtmp-song.mp3"));
    }
}
