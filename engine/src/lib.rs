//! Playback engine for a simulated live HLS radio station.
//!
//! A [`playback::Station`] turns a rotating queue of pre-recorded tracks into
//! a live playlist: it tracks elapsed time, rotates the queue at track
//! boundaries, asks a [`transcoder::Transcoder`] for segment media ahead of
//! time and renders the sliding window with [`playlist::Playlist`].

pub mod api;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod library;
pub mod playback;
pub mod playlist;
pub mod queue;
pub mod saved_playlist;
pub mod segment;
pub mod store;
pub mod track;
pub mod transcoder;

pub use error::{PlaybackError, Result};
pub use playback::{Snapshot, Station, StationSettings};
