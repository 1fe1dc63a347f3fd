// SQLite persistence for the track library, the play queue, saved playlists
// and the history.
//
// rusqlite is synchronous: every operation opens its own connection inside
// `spawn_blocking` and mutations run in a single transaction, so a crash never
// leaves a half-written queue behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::history::{HistoryEntry, HistorySink};
use crate::queue::Queue;
use crate::saved_playlist::{PlaylistDraft, SavedPlaylist};
use crate::track::Track;

const TRACK_COLUMNS: &str = "t.id, t.name, t.path, t.duration, t.bit_rate";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS tracks (
            id        TEXT PRIMARY KEY,
            name      TEXT NOT NULL UNIQUE,
            path      TEXT NOT NULL,
            duration  REAL NOT NULL,
            bit_rate  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            track_id  TEXT NOT NULL UNIQUE REFERENCES tracks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS playlists (
            id           TEXT PRIMARY KEY,
            name         TEXT NOT NULL UNIQUE,
            description  TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS playlist_tracks (
            playlist_id  TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
            track_id     TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            position     INTEGER NOT NULL,
            PRIMARY KEY (playlist_id, track_id)
        );

        CREATE TABLE IF NOT EXISTS playback_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            played_at   INTEGER NOT NULL,
            track_name  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_playback_history_played_at ON playback_history(played_at);
        "#,
    )
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        duration: row.get(3)?,
        bit_rate: row.get(4)?,
    })
}

fn db_queue(conn: &Connection) -> rusqlite::Result<Vec<Track>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TRACK_COLUMNS} FROM queue q JOIN tracks t ON t.id = q.track_id ORDER BY q.id ASC"
    ))?;
    let rows = stmt.query_map([], track_from_row)?;
    rows.collect()
}

fn db_queued_ids(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT track_id FROM queue ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Tracks in the order of `ids`; unknown ids are skipped.
fn db_tracks_by_ids(conn: &Connection, ids: &[String]) -> rusqlite::Result<Vec<Track>> {
    let mut stmt = conn.prepare(&format!("SELECT {TRACK_COLUMNS} FROM tracks t WHERE t.id = ?1"))?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(track) = stmt.query_row(params![id], track_from_row).optional()? {
            out.push(track);
        }
    }
    Ok(out)
}

fn db_require_tracks(conn: &Connection, ids: &[String]) -> anyhow::Result<()> {
    for id in ids {
        let known: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tracks WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if !known {
            anyhow::bail!("unknown track id: {id}");
        }
    }
    Ok(())
}

fn db_playlist_name_taken(conn: &Connection, name: &str, except_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM playlists WHERE name = ?1 AND id != ?2)",
        params![name, except_id],
        |row| row.get(0),
    )
}

fn db_set_playlist_tracks(conn: &Connection, playlist_id: &str, ids: &[String]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM playlist_tracks WHERE playlist_id = ?1", params![playlist_id])?;
    for (position, id) in ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO playlist_tracks (playlist_id, track_id, position) VALUES (?1, ?2, ?3)",
            params![playlist_id, id, position as i64],
        )?;
    }
    Ok(())
}

fn db_playlist(conn: &Connection, id: &str) -> rusqlite::Result<Option<SavedPlaylist>> {
    let head = conn
        .query_row(
            "SELECT id, name, description FROM playlists WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
        )
        .optional()?;
    let Some((id, name, description)) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {TRACK_COLUMNS} FROM playlist_tracks pt JOIN tracks t ON t.id = pt.track_id
         WHERE pt.playlist_id = ?1 ORDER BY pt.position ASC"
    ))?;
    let tracks = stmt
        .query_map(params![id], track_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(SavedPlaylist {
        id,
        name,
        description,
        track_count: tracks.len(),
        tracks,
    }))
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl SqliteStore {
    /// Opens (and if needed creates) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let store = Self { path };
        store.with_conn(|conn| Ok(db_init(conn)?)).await?;
        tracing::info!("database ready at {}", store.path.display());
        Ok(store)
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            f(&mut conn)
        })
        .await?
    }

    // --- tracks ---------------------------------------------------------

    pub async fn add_track(&self, track: Track) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tracks (id, name, path, duration, bit_rate) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![track.id, track.name, track.path, track.duration, track.bit_rate],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn tracks(&self) -> anyhow::Result<Vec<Track>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {TRACK_COLUMNS} FROM tracks t ORDER BY t.name ASC"))?;
            let rows = stmt.query_map([], track_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn track_by_name(&self, name: &str) -> anyhow::Result<Option<Track>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let track = conn
                .query_row(
                    &format!("SELECT {TRACK_COLUMNS} FROM tracks t WHERE t.name = ?1"),
                    params![name],
                    track_from_row,
                )
                .optional()?;
            Ok(track)
        })
        .await
    }

    /// Removes tracks from the library and returns the ones that existed.
    /// Their queue and saved-playlist entries go with them.
    pub async fn delete_tracks(&self, ids: Vec<String>) -> anyhow::Result<Vec<Track>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = db_tracks_by_ids(&tx, &ids)?;
            for track in &deleted {
                tx.execute("DELETE FROM tracks WHERE id = ?1", params![track.id])?;
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    // --- queue ----------------------------------------------------------

    pub async fn queue(&self) -> anyhow::Result<Vec<Track>> {
        self.with_conn(|conn| Ok(db_queue(conn)?)).await
    }

    /// Appends `ids` to the queue. Ids already queued are skipped; unknown ids
    /// reject the whole batch. Returns how many were appended.
    pub async fn add_to_queue(&self, ids: Vec<String>) -> anyhow::Result<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            db_require_tracks(&tx, &ids)?;
            let mut added = 0;
            for id in &ids {
                added += tx.execute(
                    "INSERT OR IGNORE INTO queue (track_id) VALUES (?1)",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(added)
        })
        .await
    }

    pub async fn remove_from_queue(&self, ids: Vec<String>) -> anyhow::Result<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            for id in &ids {
                removed += tx.execute("DELETE FROM queue WHERE track_id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Rewrites the queue in the order of `ids`, which must be a permutation
    /// of the currently queued ids.
    pub async fn reorder_queue(&self, ids: Vec<String>) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let queued = db_queued_ids(&tx)?;
            let wanted: HashSet<&String> = ids.iter().collect();
            if ids.len() != queued.len()
                || wanted.len() != ids.len()
                || !queued.iter().all(|id| wanted.contains(id))
            {
                anyhow::bail!("reorder must list every queued track exactly once");
            }

            tx.execute("DELETE FROM queue", [])?;
            for id in &ids {
                tx.execute("INSERT INTO queue (track_id) VALUES (?1)", params![id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // --- saved playlists ------------------------------------------------

    /// Stores a new playlist. The draft must already be validated; unknown
    /// track ids and taken names are rejected here.
    pub async fn add_playlist(&self, draft: PlaylistDraft) -> anyhow::Result<SavedPlaylist> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id = Uuid::new_v4().to_string();
            if db_playlist_name_taken(&tx, &draft.name, &id)? {
                anyhow::bail!("playlist with this name already exists");
            }
            db_require_tracks(&tx, &draft.track_ids)?;
            tx.execute(
                "INSERT INTO playlists (id, name, description) VALUES (?1, ?2, ?3)",
                params![id, draft.name, draft.description],
            )?;
            db_set_playlist_tracks(&tx, &id, &draft.track_ids)?;
            let playlist = db_playlist(&tx, &id)?
                .ok_or_else(|| anyhow::anyhow!("playlist {id} vanished while saving"))?;
            tx.commit()?;
            Ok(playlist)
        })
        .await
    }

    /// Every playlist with its track count; `tracks` is left empty.
    pub async fn playlists(&self) -> anyhow::Result<Vec<SavedPlaylist>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.name, p.description, COUNT(pt.track_id)
                 FROM playlists p LEFT JOIN playlist_tracks pt ON pt.playlist_id = p.id
                 GROUP BY p.id ORDER BY p.name ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SavedPlaylist {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    tracks: Vec::new(),
                    track_count: row.get::<_, i64>(3)? as usize,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn playlist(&self, id: &str) -> anyhow::Result<Option<SavedPlaylist>> {
        let id = id.to_string();
        self.with_conn(move |conn| Ok(db_playlist(conn, &id)?)).await
    }

    /// Replaces name, description and tracks. `None` when no such playlist.
    pub async fn edit_playlist(
        &self,
        id: &str,
        draft: PlaylistDraft,
    ) -> anyhow::Result<Option<SavedPlaylist>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if db_playlist_name_taken(&tx, &draft.name, &id)? {
                anyhow::bail!("playlist with this name already exists");
            }
            let updated = tx.execute(
                "UPDATE playlists SET name = ?2, description = ?3 WHERE id = ?1",
                params![id, draft.name, draft.description],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            db_require_tracks(&tx, &draft.track_ids)?;
            db_set_playlist_tracks(&tx, &id, &draft.track_ids)?;
            let playlist = db_playlist(&tx, &id)?;
            tx.commit()?;
            Ok(playlist)
        })
        .await
    }

    /// Returns whether a playlist was removed.
    pub async fn delete_playlist(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM playlists WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }

    // --- history --------------------------------------------------------

    pub async fn add_history(&self, track_name: &str) -> anyhow::Result<()> {
        let track_name = track_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO playback_history (played_at, track_name) VALUES (?1, ?2)",
                params![now_unix(), track_name],
            )?;
            Ok(())
        })
        .await
    }

    /// Newest first.
    pub async fn recent_history(&self, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, track_name, played_at FROM playback_history
                 ORDER BY played_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    track_name: row.get(1)?,
                    played_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Deletes entries played strictly before `unix_ts`.
    pub async fn delete_history_before(&self, unix_ts: i64) -> anyhow::Result<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let n = tx.execute("DELETE FROM playback_history WHERE played_at < ?1", params![unix_ts])?;
            tx.commit()?;
            Ok(n)
        })
        .await
    }

    #[cfg(test)]
    async fn insert_history_at(&self, track_name: &str, played_at: i64) -> anyhow::Result<()> {
        let track_name = track_name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO playback_history (played_at, track_name) VALUES (?1, ?2)",
                params![played_at, track_name],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Queue for SqliteStore {
    async fn current_and_next(&self) -> anyhow::Result<(Option<Track>, Option<Track>)> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRACK_COLUMNS} FROM queue q JOIN tracks t ON t.id = q.track_id
                 ORDER BY q.id ASC LIMIT 2"
            ))?;
            let mut head = stmt
                .query_map([], track_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter();

            let current = head.next();
            let next = head.next().or_else(|| current.clone());
            Ok((current, next))
        })
        .await
    }

    async fn rotate(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let ids = db_queued_ids(&tx)?;
            if ids.len() > 1 {
                let head = &ids[0];
                tx.execute("DELETE FROM queue WHERE track_id = ?1", params![head])?;
                tx.execute("INSERT INTO queue (track_id) VALUES (?1)", params![head])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl HistorySink for SqliteStore {
    async fn record_play(&self, track_name: &str) -> anyhow::Result<()> {
        self.add_history(track_name).await
    }
}
