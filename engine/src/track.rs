use serde::{Deserialize, Serialize};

/// A transcoded audio file known to the station.
///
/// Tracks are owned by the store; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub name: String,
    pub path: String,
    /// Seconds, already normalized by the configured `DurationPolicy`.
    pub duration: f64,
    /// kbps
    pub bit_rate: u32,
}

/// Tails shorter than this are cut off by `DurationPolicy::Trim` instead of
/// producing a tiny last segment.
const TRIM_TOLERANCE_SECS: f64 = 1.2;

/// How a freshly imported track's duration is aligned to the segment grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurationPolicy {
    /// Leave the duration alone; the last segment may be short.
    #[default]
    Keep,
    /// Cut a short tail so the track ends on a segment boundary,
    /// otherwise floor to whole seconds.
    Trim,
    /// Extend with silence up to the next segment boundary.
    Pad,
}

impl DurationPolicy {
    pub fn apply(self, duration: f64, segment_duration: f64) -> f64 {
        if !duration.is_finite() || duration <= 0.0 || segment_duration <= 0.0 {
            return duration;
        }

        let remainder = duration % segment_duration;
        match self {
            DurationPolicy::Keep => duration,
            DurationPolicy::Trim => {
                if remainder < TRIM_TOLERANCE_SECS {
                    (duration / segment_duration).floor() * segment_duration
                } else {
                    duration.floor()
                }
            }
            DurationPolicy::Pad => {
                if remainder == 0.0 {
                    duration
                } else {
                    (duration / segment_duration).ceil() * segment_duration
                }
            }
        }
    }
}

impl std::str::FromStr for DurationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(DurationPolicy::Keep),
            "trim" => Ok(DurationPolicy::Trim),
            "pad" => Ok(DurationPolicy::Pad),
            other => anyhow::bail!("unknown duration policy: {other}"),
        }
    }
}
