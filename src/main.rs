use std::time::Duration;

use anyhow::{Context, Result};
use rspotify::clients::OAuthClient;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use spotify_sync::model::{CacheState, PlayingItem, ToggleableState, TrackInfo};
use spotify_sync::spotify::{self, SpotifyClient};
use spotify_sync::sync::{SavedCell, StateCell, SyncContext};
use spotify_sync::{Session, SyncConfig, logging};

const DATABASE_NAME: &str = "spotify-sync";
const DEVICE_REFRESH_EVERY: u32 = 12;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = logging::init_logging() {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    tracing::info!("=== spotify-sync watcher starting ===");

    let config = SyncConfig::from_env()?;
    let token = config
        .access_token
        .clone()
        .context("SPOTIFY_ACCESS_TOKEN is not set")?;

    let api = spotify::client_from_token(&token).await?;
    match api.me().await {
        Ok(user) => tracing::info!(user_id = %user.id, "rspotify authorized successfully"),
        Err(e) => {
            tracing::error!(error = %e, "rspotify authentication failed");
            return Err(anyhow::anyhow!("rspotify init failed"));
        }
    }

    let ctx = SyncContext::current(DATABASE_NAME);
    let client = SpotifyClient::new(api, config.device_name.clone());
    let session = Session::open(&ctx, &config, client).await?;

    session.saved_tracks.load_library().await;
    if let Some(ids) = session.saved_tracks.known_saved_ids() {
        println!("{} saved tracks", ids.len());
    }

    let result = watch(&session, config.poll_interval).await;

    tracing::info!("spotify-sync watcher shutting down");
    result
}

/// Cells for the item currently playing. Holding them keeps them alive.
struct Watched {
    id: String,
    track: Option<StateCell<TrackInfo>>,
    _saved: SavedCell,
    saved_rx: watch::Receiver<Option<ToggleableState<bool>>>,
}

async fn watch(session: &Session, poll_interval: Duration) -> Result<()> {
    let transport = &session.transport;
    let mut playing = transport.playing().subscribe();
    let mut item = transport.current_item().subscribe();
    let mut device = transport.current_device().subscribe();
    let mut errors = transport.errors();
    let mut ticker = tokio::time::interval(poll_interval);
    let mut ticks: u32 = 0;
    let mut watched: Option<Watched> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                transport.refresh_playback();
                transport.refresh_track();
                if ticks % DEVICE_REFRESH_EVERY == 0 {
                    transport.refresh_devices();
                }
                ticks = ticks.wrapping_add(1);
                if let Some(position) = transport.position_ms() {
                    tracing::trace!(position_ms = position, "Position");
                }
            }
            Ok(()) = playing.changed() => {
                if let Some(ToggleableState::Set(now_playing)) = *playing.borrow_and_update() {
                    println!("{}", if now_playing { "Playing" } else { "Paused" });
                }
            }
            Ok(()) = device.changed() => {
                if let Some(device) = device.borrow_and_update().as_ref() {
                    println!("Device: {}", device.name);
                }
            }
            Ok(()) = item.changed() => {
                let current = item.borrow_and_update().clone();
                watched = current.map(|current| watch_item(session, &current));
            }
            received = errors.recv() => match received {
                Ok(error) => println!("{error}"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Missed transport errors"),
                Err(RecvError::Closed) => return Ok(()),
            },
            Some(()) = changed_saved(watched.as_mut()) => {
                if let Some(watched) = &mut watched {
                    let saved = *watched.saved_rx.borrow_and_update();
                    if let Some(state) = saved {
                        println!("{} saved: {}", watched.id, state.value());
                    }
                    if let Some(CacheState::Loaded { value, .. }) = watched.track.as_ref().and_then(|t| t.get()) {
                        println!("Track metadata: {} - {}", value.artist(), value.name);
                    }
                }
            }
        }
    }
}

fn watch_item(session: &Session, item: &PlayingItem) -> Watched {
    match item {
        PlayingItem::Track(track) => println!("Now playing: {} - {}", track.artist(), track.name),
        PlayingItem::Episode { name, show, .. } => println!("Now playing: {show} - {name}"),
    }
    let id = item.id().to_string();
    let track = matches!(item, PlayingItem::Track(_)).then(|| session.tracks.state_of(&id));
    let saved = session.saved_tracks.saved_state_of(&id);
    let mut saved_rx = saved.subscribe();
    // report the flag even if it settled before this subscription
    saved_rx.mark_changed();
    Watched {
        id,
        track,
        _saved: saved,
        saved_rx,
    }
}

/// Resolves when the saved flag of the watched item changes; never when
/// nothing is watched.
async fn changed_saved(watched: Option<&mut Watched>) -> Option<()> {
    match watched {
        Some(watched) => watched.saved_rx.changed().await.ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use spotify_sync::sync::Observable;

    use super::*;

    #[tokio::test]
    async fn saved_change_between_polls_is_seen() {
        let saved: SavedCell = Arc::new(Observable::new(None));
        let mut watched = Watched {
            id: "t1".to_string(),
            track: None,
            _saved: saved.clone(),
            saved_rx: saved.subscribe(),
        };

        // lands while the loop is busy with another branch
        saved.set(Some(ToggleableState::Set(true)));

        assert_eq!(changed_saved(Some(&mut watched)).await, Some(()));
        assert_eq!(*watched.saved_rx.borrow_and_update(), Some(ToggleableState::Set(true)));
    }
}
