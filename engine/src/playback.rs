// The station: wall-clock progress, track transitions and the live playlist.
//
// Lock order is `commands` -> `transcode` -> `state`. `state` is never held
// across a queue, transcoder or history call. Readers (`rendered_playlist_text`,
// `snapshot`) only ever take `state`. The tick path never waits on the
// transcoder: media for a promoted track is produced by a background job.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cleanup::delete_unreferenced;
use crate::error::{PlaybackError, Result};
use crate::events::{Notifier, StationEvent};
use crate::history::HistorySink;
use crate::playlist::{Playlist, DEFAULT_LIVE_SEGMENTS, DEFAULT_MAX_SEGMENT_DURATION};
use crate::queue::Queue;
use crate::segment::{generate_segments, Segment};
use crate::track::Track;
use crate::transcoder::Transcoder;

#[derive(Debug, Clone)]
pub struct StationSettings {
    pub segment_dir: PathBuf,
    /// Target segment length in seconds.
    pub segment_duration: u32,
    pub live_segments: usize,
    pub tick_interval: Duration,
}

impl StationSettings {
    /// How long retired segments stay on disk for clients still fetching them.
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_secs(2 * u64::from(self.segment_duration))
    }
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            segment_dir: PathBuf::from("static/tmp"),
            segment_duration: DEFAULT_MAX_SEGMENT_DURATION,
            live_segments: DEFAULT_LIVE_SEGMENTS,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Read-only view for API responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub current_track: Option<Track>,
    pub current_track_elapsed: f64,
    pub is_playing: bool,
    /// Unix seconds of the last state change.
    pub updated_at: i64,
}

struct PlaybackState {
    current_track: Option<Track>,
    next_track: Option<Track>,
    elapsed: f64,
    is_playing: bool,
    updated_at: OffsetDateTime,
    playlist: Option<Playlist>,
    playlist_text: String,
    /// The next slot's media has not been confirmed on disk yet.
    next_stale: bool,
    /// Same for the current track, after a transition that could not promote
    /// an already prepared next slot.
    current_stale: bool,
    /// A queue without a next track was already reported.
    missing_next_reported: bool,
}

impl PlaybackState {
    fn stopped() -> Self {
        Self {
            current_track: None,
            next_track: None,
            elapsed: 0.0,
            is_playing: false,
            updated_at: OffsetDateTime::now_utc(),
            playlist: None,
            playlist_text: String::new(),
            next_stale: false,
            current_stale: false,
            missing_next_reported: false,
        }
    }

    fn render(&mut self) {
        if let Some(playlist) = self.playlist.as_mut() {
            self.playlist_text = playlist.generate(self.elapsed);
        }
        self.updated_at = OffsetDateTime::now_utc();
    }

    fn transition_due(&self) -> bool {
        match &self.current_track {
            Some(track) => self.is_playing && self.elapsed >= track.duration,
            None => false,
        }
    }
}

struct StationInner {
    settings: StationSettings,
    queue: Arc<dyn Queue>,
    transcoder: Arc<dyn Transcoder>,
    history: Arc<dyn HistorySink>,
    notifier: Notifier,

    state: Mutex<PlaybackState>,
    /// Serializes Play / Pause / Reload and track transitions.
    commands: Mutex<()>,
    /// Serializes transcoder runs and cleanup sweeps.
    transcode: Mutex<()>,
    /// Background media job started from the tick path, at most one at a time.
    preparing: StdMutex<Option<JoinHandle<()>>>,
}

enum Step {
    Transition,
    Catchup { current: Option<Track> },
    Idle,
}

/// Handle to one station. Clones share the same state.
#[derive(Clone)]
pub struct Station {
    inner: Arc<StationInner>,
}

impl Station {
    pub fn new(
        settings: StationSettings,
        queue: Arc<dyn Queue>,
        transcoder: Arc<dyn Transcoder>,
        history: Arc<dyn HistorySink>,
        notifier: Notifier,
    ) -> Self {
        Self {
            inner: Arc::new(StationInner {
                settings,
                queue,
                transcoder,
                history,
                notifier,
                state: Mutex::new(PlaybackState::stopped()),
                commands: Mutex::new(()),
                transcode: Mutex::new(()),
                preparing: StdMutex::new(None),
            }),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn settings(&self) -> &StationSettings {
        &self.inner.settings
    }

    /// Starts playback from the head of the queue. No-op while playing.
    pub async fn play(&self) -> Result<()> {
        let _cmd = self.inner.commands.lock().await;
        self.start().await
    }

    /// Stops and discards the playlist; the next `play` starts a fresh session.
    pub async fn pause(&self) {
        let _cmd = self.inner.commands.lock().await;
        self.stop().await;
    }

    /// Reconciles the station with the queue after it was edited.
    ///
    /// A different current track restarts playback. A different next track
    /// replaces only the upcoming segments. An emptied queue lets the current
    /// track finish and stops at its end.
    pub async fn reload(&self) -> Result<()> {
        let _cmd = self.inner.commands.lock().await;

        let playing_id = {
            let st = self.inner.state.lock().await;
            if !st.is_playing {
                return Ok(());
            }
            st.current_track.as_ref().map(|t| t.id.clone())
        };

        let (current, next) = self.inner.queue.current_and_next().await?;
        match current {
            None => {
                let mut st = self.inner.state.lock().await;
                if let Some(playlist) = st.playlist.as_mut() {
                    playlist.replace_next(Vec::new());
                }
                st.next_track = None;
                st.next_stale = false;
                st.updated_at = OffsetDateTime::now_utc();
                info!("queue is empty; current track will play out");
                Ok(())
            }
            Some(current) if Some(&current.id) != playing_id.as_ref() => {
                info!("current track changed to {}; restarting playback", current.name);
                self.stop().await;
                self.start().await
            }
            Some(current) => {
                let next = next.ok_or_else(|| {
                    PlaybackError::QueueInconsistent(format!("no next track after {}", current.id))
                })?;
                if self.publish_next(&next).await {
                    self.materialize(&next).await?;
                    self.mark_next_ready(&next.id).await;
                }
                Ok(())
            }
        }
    }

    /// Advances the clock by one tick interval. Errors are logged; the next
    /// tick retries whatever did not complete.
    pub async fn tick(&self) {
        let by = self.inner.settings.tick_interval.as_secs_f64();
        if let Err(e) = self.advance(by).await {
            error!("tick failed: {e}");
        }
    }

    /// Protocol text for clients. Empty while stopped.
    pub async fn rendered_playlist_text(&self) -> String {
        let st = self.inner.state.lock().await;
        if st.is_playing {
            st.playlist_text.clone()
        } else {
            String::new()
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let st = self.inner.state.lock().await;
        Snapshot {
            current_track: st.current_track.clone(),
            current_track_elapsed: st.elapsed,
            is_playing: st.is_playing,
            updated_at: st.updated_at.unix_timestamp(),
        }
    }

    /// Drives `tick` from a fixed-rate interval until the runtime shuts down.
    ///
    /// Ticks missed while the runtime was busy are replayed at once, so
    /// `elapsed` keeps pace with the wall clock.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let station = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(station.inner.settings.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            // The first tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                station.tick().await;
            }
        })
    }

    /// Deletes segment files of tracks the playlist no longer references.
    /// Does nothing while stopped.
    pub async fn cleanup_now(&self) -> anyhow::Result<usize> {
        let _transcode = self.inner.transcode.lock().await;
        let keep = {
            let st = self.inner.state.lock().await;
            match (&st.playlist, st.is_playing) {
                (Some(playlist), true) => playlist.referenced_tracks(),
                _ => return Ok(0),
            }
        };

        let dir = self.inner.settings.segment_dir.clone();
        let removed = tokio::task::spawn_blocking(move || delete_unreferenced(&dir, &keep)).await??;
        if removed > 0 {
            debug!("cleanup removed {removed} segment files");
        }
        Ok(removed)
    }

    fn schedule_cleanup(&self) {
        let station = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(station.inner.settings.cleanup_grace()).await;
            if let Err(e) = station.cleanup_now().await {
                warn!("segment cleanup failed: {e:#}");
            }
        });
    }

    // --- internals (callers hold `commands` where noted) -------------------

    // Requires `commands`.
    async fn start(&self) -> Result<()> {
        if self.inner.state.lock().await.is_playing {
            return Ok(());
        }

        let (current, next) = self.inner.queue.current_and_next().await?;
        let current = current.ok_or(PlaybackError::EmptyQueue)?;
        let next = next.ok_or_else(|| {
            PlaybackError::QueueInconsistent(format!("no next track after {}", current.id))
        })?;

        self.materialize(&current).await?;
        self.materialize(&next).await?;

        let playlist = Playlist::new(
            self.segments_for(&current),
            self.segments_for(&next),
            self.inner.settings.segment_duration,
            self.inner.settings.live_segments,
        );

        {
            let mut st = self.inner.state.lock().await;
            *st = PlaybackState {
                current_track: Some(current.clone()),
                next_track: Some(next),
                is_playing: true,
                playlist: Some(playlist),
                ..PlaybackState::stopped()
            };
            st.render();
            self.inner.notifier.notify(StationEvent::Play);
        }

        info!("playback started with {}", current.name);
        self.record_play(&current.name).await;
        Ok(())
    }

    async fn stop(&self) {
        let was_playing = {
            let mut st = self.inner.state.lock().await;
            let was_playing = st.is_playing;
            *st = PlaybackState::stopped();
            if was_playing {
                self.inner.notifier.notify(StationEvent::Pause);
            }
            was_playing
        };
        if was_playing {
            info!("playback stopped");
        }
    }

    async fn advance(&self, by: f64) -> Result<()> {
        let step = {
            let mut st = self.inner.state.lock().await;
            if !st.is_playing {
                return Ok(());
            }
            st.elapsed += by;
            if st.transition_due() {
                Step::Transition
            } else {
                st.render();
                if st.current_stale || st.next_stale {
                    Step::Catchup {
                        current: st.current_track.clone().filter(|_| st.current_stale),
                    }
                } else {
                    Step::Idle
                }
            }
        };

        match step {
            Step::Transition => {
                let _cmd = self.inner.commands.lock().await;
                self.transition().await
            }
            Step::Catchup { current } => {
                // A command in flight will reconcile the next slot itself.
                let Ok(_cmd) = self.inner.commands.try_lock() else {
                    return Ok(());
                };
                if self.preparing() {
                    return Ok(());
                }
                let (_, next) = self.inner.queue.current_and_next().await?;
                if let Some(next) = &next {
                    self.publish_next(next).await;
                }
                let missing = next.is_none();
                self.spawn_preparation(current, next);
                if missing {
                    return self.missing_next().await;
                }
                Ok(())
            }
            Step::Idle => Ok(()),
        }
    }

    // Requires `commands`.
    async fn transition(&self) -> Result<()> {
        // Pause or Reload may have won the race for `commands`.
        if !self.inner.state.lock().await.transition_due() {
            return Ok(());
        }

        self.inner.queue.rotate().await?;
        let (current, next) = self.inner.queue.current_and_next().await?;
        let Some(current) = current else {
            info!("queue ran out at the end of a track");
            self.stop().await;
            return Ok(());
        };

        let current_segments = self.segments_for(&current);
        let next_segments = next.as_ref().map(|t| self.segments_for(t)).unwrap_or_default();

        let promoted_ready = {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;
            let Some(playlist) = st.playlist.as_mut() else {
                return Ok(());
            };

            // The queued next track is normally what the playlist already holds.
            let promoted_ready = !st.next_stale
                && playlist
                    .first_next_segment()
                    .is_some_and(|s| s.track_id == current.id);
            if !promoted_ready {
                playlist.replace_next(current_segments);
            }
            playlist.next(next_segments);

            st.current_track = Some(current.clone());
            st.next_track = next.clone();
            st.elapsed = 0.0;
            st.next_stale = true;
            st.current_stale = !promoted_ready;
            if next.is_some() {
                st.missing_next_reported = false;
            }
            st.render();
            self.inner.notifier.notify(StationEvent::NewTrack(current.name.clone()));
            promoted_ready
        };

        info!("now playing {}", current.name);
        self.record_play(&current.name).await;
        self.schedule_cleanup();

        let missing = next.is_none();
        self.spawn_preparation((!promoted_ready).then_some(current), next);
        if missing {
            return self.missing_next().await;
        }
        Ok(())
    }

    // Requires `commands`. Puts `next` in the upcoming slot if it is not
    // there yet and reports whether its media still has to be confirmed.
    async fn publish_next(&self, next: &Track) -> bool {
        let segments = self.segments_for(next);

        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        if !st.is_playing {
            return false;
        }
        let Some(playlist) = st.playlist.as_mut() else {
            return false;
        };

        st.missing_next_reported = false;
        let unchanged = playlist
            .first_next_segment()
            .is_some_and(|s| s.track_id == next.id);
        if !unchanged {
            info!("next track is now {}", next.name);
            playlist.replace_next(segments);
            st.next_track = Some(next.clone());
            st.next_stale = true;
            st.updated_at = OffsetDateTime::now_utc();
        }
        st.next_stale
    }

    // The first report goes back to the tick loop, which logs it. Later
    // ticks keep retrying quietly until the queue has a next track again.
    async fn missing_next(&self) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        if std::mem::replace(&mut st.missing_next_reported, true) {
            debug!("queue still has no next track");
            return Ok(());
        }
        let current = st.current_track.as_ref().map(|t| t.id.clone()).unwrap_or_default();
        Err(PlaybackError::QueueInconsistent(format!("no next track after {current}")))
    }

    fn preparing(&self) -> bool {
        self.inner
            .preparing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|job| !job.is_finished())
    }

    // Starts producing media for the given slots unless a job is still
    // running; a later tick picks up whatever stays stale.
    fn spawn_preparation(&self, current: Option<Track>, next: Option<Track>) {
        if current.is_none() && next.is_none() {
            return;
        }
        let mut job = self.inner.preparing.lock().unwrap_or_else(|e| e.into_inner());
        if job.as_ref().is_some_and(|job| !job.is_finished()) {
            return;
        }
        let station = self.clone();
        *job = Some(tokio::spawn(async move {
            station.prepare(current, next).await;
        }));
    }

    async fn prepare(&self, current: Option<Track>, next: Option<Track>) {
        if let Some(current) = current {
            if let Err(e) = self.materialize(&current).await {
                warn!("current track not ready: {e}");
                return;
            }
            self.mark_current_ready(&current.id).await;
        }
        if let Some(next) = next {
            match self.materialize(&next).await {
                Ok(()) => self.mark_next_ready(&next.id).await,
                Err(e) => warn!("next track not ready: {e}"),
            }
        }
    }

    async fn mark_current_ready(&self, track_id: &str) {
        let mut st = self.inner.state.lock().await;
        if st.current_track.as_ref().is_some_and(|t| t.id == track_id) {
            st.current_stale = false;
        }
    }

    async fn mark_next_ready(&self, track_id: &str) {
        let mut st = self.inner.state.lock().await;
        if st.next_track.as_ref().is_some_and(|t| t.id == track_id) {
            st.next_stale = false;
        }
    }

    async fn materialize(&self, track: &Track) -> Result<()> {
        let _transcode = self.inner.transcode.lock().await;
        self.inner
            .transcoder
            .ensure_segments(
                track,
                &self.inner.settings.segment_dir,
                self.inner.settings.segment_duration,
            )
            .await
            .map_err(|source| PlaybackError::SegmentGenerationFailed {
                track_id: track.id.clone(),
                source,
            })
    }

    fn segments_for(&self, track: &Track) -> Vec<Segment> {
        generate_segments(
            track.duration,
            f64::from(self.inner.settings.segment_duration),
            &track.id,
            &self.inner.settings.segment_dir,
        )
    }

    async fn record_play(&self, track_name: &str) {
        if let Err(e) = self.inner.history.record_play(track_name).await {
            warn!("could not record play of {track_name}: {e:#}");
        }
    }
}
