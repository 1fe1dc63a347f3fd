use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::events::DEFAULT_EVENT_BUFFER;
use crate::playback::StationSettings;
use crate::playlist::{DEFAULT_LIVE_SEGMENTS, DEFAULT_MAX_SEGMENT_DURATION};
use crate::track::DurationPolicy;

/// Service configuration, read once at startup from `ONAIR_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub tracks_dir: PathBuf,
    pub segment_dir: PathBuf,
    pub ffmpeg: String,
    pub ffprobe: String,
    /// Seconds.
    pub segment_duration: u32,
    pub live_segments: usize,
    pub tick_interval: Duration,
    pub transcode_timeout: Duration,
    pub duration_policy: DurationPolicy,
    pub history_retention_days: u32,
    pub event_buffer: usize,
    pub autoplay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7331)),
            db_path: PathBuf::from("storage/onair.db"),
            tracks_dir: PathBuf::from("static/tracks"),
            segment_dir: PathBuf::from("static/tmp"),
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            segment_duration: DEFAULT_MAX_SEGMENT_DURATION,
            live_segments: DEFAULT_LIVE_SEGMENTS,
            tick_interval: Duration::from_millis(1000),
            transcode_timeout: Duration::from_secs(120),
            duration_policy: DurationPolicy::Keep,
            history_retention_days: 30,
            event_buffer: DEFAULT_EVENT_BUFFER,
            autoplay: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let string = |key: &str, default: String| lookup(key).filter(|v| !v.trim().is_empty()).unwrap_or(default);

        Self {
            bind: parse_or(&lookup, "ONAIR_BIND", d.bind),
            db_path: string("ONAIR_DB_PATH", d.db_path.to_string_lossy().to_string()).into(),
            tracks_dir: string("ONAIR_TRACKS_DIR", d.tracks_dir.to_string_lossy().to_string()).into(),
            segment_dir: string("ONAIR_SEGMENT_DIR", d.segment_dir.to_string_lossy().to_string()).into(),
            ffmpeg: string("ONAIR_FFMPEG", d.ffmpeg),
            ffprobe: string("ONAIR_FFPROBE", d.ffprobe),
            segment_duration: positive_or(&lookup, "ONAIR_SEGMENT_DURATION", d.segment_duration),
            live_segments: positive_or(&lookup, "ONAIR_LIVE_SEGMENTS", d.live_segments),
            tick_interval: Duration::from_millis(positive_or(&lookup, "ONAIR_TICK_MS", 1000u64)),
            transcode_timeout: Duration::from_secs(positive_or(&lookup, "ONAIR_TRANSCODE_TIMEOUT_SECS", 120u64)),
            duration_policy: parse_or(&lookup, "ONAIR_DURATION_POLICY", d.duration_policy),
            history_retention_days: positive_or(&lookup, "ONAIR_HISTORY_RETENTION_DAYS", d.history_retention_days),
            event_buffer: positive_or(&lookup, "ONAIR_EVENT_BUFFER", d.event_buffer),
            autoplay: parse_bool_or(&lookup, "ONAIR_AUTOPLAY", d.autoplay),
        }
    }

    pub fn station_settings(&self) -> StationSettings {
        StationSettings {
            segment_dir: self.segment_dir.clone(),
            segment_duration: self.segment_duration,
            live_segments: self.live_segments,
            tick_interval: self.tick_interval,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("{key}={raw:?} is invalid ({e}); using default");
                default
            }
        },
    }
}

fn positive_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy,
    T::Err: std::fmt::Display,
{
    let v = parse_or(lookup, key, default);
    if v > T::default() {
        v
    } else {
        warn!("{key} must be positive; using default");
        default
    }
}

fn parse_bool_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => default,
        Some(v) if v.is_empty() => default,
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!("{key}={v:?} is not a boolean; using default");
                default
            }
        },
    }
}
