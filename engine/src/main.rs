// onair engine
//
// Single-station HLS playout service:
//   - Plays the SQLite-backed queue as a live HLS playlist at /stream
//   - Serves segment files produced by ffmpeg
//   - Exposes a small JSON + SSE API for operators
//   - Runs behind a reverse proxy for HTTPS and internet exposure

use std::sync::Arc;
use std::time::Duration;

use onair_engine::api::{build_router, spawn_listener_counter, AppState};
use onair_engine::config::Config;
use onair_engine::events::Notifier;
use onair_engine::library::import_tracks;
use onair_engine::playback::Station;
use onair_engine::store::SqliteStore;
use onair_engine::transcoder::FfmpegTranscoder;
use time::OffsetDateTime;
use tracing::{error, info, warn};

const HISTORY_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = Config::from_env();
    info!("configuration: {cfg:?}");

    // Segments from a previous run belong to a session that no longer exists.
    if cfg.segment_dir.exists() {
        tokio::fs::remove_dir_all(&cfg.segment_dir).await?;
    }
    tokio::fs::create_dir_all(&cfg.segment_dir).await?;

    let store = SqliteStore::open(&cfg.db_path).await?;
    let transcoder = FfmpegTranscoder::new(&cfg.ffmpeg, &cfg.ffprobe, cfg.transcode_timeout);

    let station = Station::new(
        cfg.station_settings(),
        Arc::new(store.clone()),
        Arc::new(transcoder.clone()),
        Arc::new(store.clone()),
        Notifier::new(cfg.event_buffer),
    );

    // New files in the tracks dir show up in the library without blocking startup.
    {
        let store = store.clone();
        let dir = cfg.tracks_dir.clone();
        let policy = cfg.duration_policy;
        let segment_duration = cfg.segment_duration;
        tokio::spawn(async move {
            match import_tracks(&dir, &store, &transcoder, policy, segment_duration).await {
                Ok(report) => info!(
                    "library import: {} found, {} imported, {} known, {} failed",
                    report.found, report.imported, report.skipped, report.failed
                ),
                Err(e) => warn!("library import skipped: {e:#}"),
            }
        });
    }

    spawn_history_retention(store.clone(), cfg.history_retention_days);
    station.spawn_ticker();
    spawn_listener_counter(station.notifier().clone());

    if cfg.autoplay {
        match station.play().await {
            Ok(()) => info!("autoplay started"),
            Err(e) => warn!("autoplay did not start: {e}"),
        }
    }

    let app = build_router(AppState {
        version,
        station: station.clone(),
        store,
    });

    info!("onair engine starting on http://{}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    station.pause().await;
    Ok(())
}

fn spawn_history_retention(store: SqliteStore, retention_days: u32) {
    tokio::spawn(async move {
        let retention = time::Duration::days(i64::from(retention_days));
        let mut interval = tokio::time::interval(HISTORY_SWEEP_PERIOD);
        loop {
            interval.tick().await;
            let cutoff = (OffsetDateTime::now_utc() - retention).unix_timestamp();
            match store.delete_history_before(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!("history retention removed {n} entries"),
                Err(e) => error!("history retention failed: {e:#}"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
