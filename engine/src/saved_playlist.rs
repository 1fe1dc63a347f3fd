use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::track::Track;

pub const MIN_NAME_LEN: usize = 3;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_DESCRIPTION_LEN: usize = 512;
pub const MAX_TRACKS: usize = 500;

/// A named, ordered selection of library tracks that operators can load
/// into the queue. Unrelated to the live HLS playlist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPlaylist {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Empty in listings; filled when a single playlist is fetched.
    pub tracks: Vec<Track>,
    pub track_count: usize,
}

/// Create / edit payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub track_ids: Vec<String>,
}

impl PlaylistDraft {
    pub fn validate(&self) -> anyhow::Result<()> {
        let name_len = self.name.chars().count();
        if name_len < MIN_NAME_LEN {
            anyhow::bail!("name must be at least {MIN_NAME_LEN} characters");
        }
        if name_len > MAX_NAME_LEN {
            anyhow::bail!("name must be at most {MAX_NAME_LEN} characters");
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            anyhow::bail!("description must be at most {MAX_DESCRIPTION_LEN} characters");
        }
        if self.track_ids.len() > MAX_TRACKS {
            anyhow::bail!("playlist cannot have more than {MAX_TRACKS} tracks");
        }

        let mut seen = HashSet::with_capacity(self.track_ids.len());
        for id in &self.track_ids {
            if id.is_empty() {
                anyhow::bail!("track id cannot be empty");
            }
            if !seen.insert(id.as_str()) {
                anyhow::bail!("duplicate track id: {id}");
            }
        }
        Ok(())
    }
}
