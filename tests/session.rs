use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;

use spotify_sync::clock::{Clock, ManualClock};
use spotify_sync::model::{
    ArtistInfo, CacheState, CurrentlyPlaying, DeviceInfo, PlaybackSnapshot, PlayingItem,
    PlayingType, RepeatMode, ToggleableState, TrackInfo,
};
use spotify_sync::playback::PlaybackRemote;
use spotify_sync::sync::{
    Database, DocumentStore, JsonFileStore, LocalStore, MemoryStore, RemoteSource, SavedDocument,
    SavedRemote, Stored, SyncContext,
};
use spotify_sync::{Collaborators, Session, SyncConfig};

const LATENCY_MS: i64 = 100;

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::milliseconds(ms)
}

fn track(id: &str) -> TrackInfo {
    TrackInfo {
        id: id.to_string(),
        name: format!("Song {id}"),
        artists: vec!["Band".to_string()],
        album: "Record".to_string(),
        duration_ms: 180_000,
    }
}

/// Counts storage reads around a real store.
struct CountingStore<S> {
    inner: S,
    reads: AtomicUsize,
}

#[async_trait]
impl<S: LocalStore<TrackInfo>> LocalStore<TrackInfo> for CountingStore<S> {
    async fn fetch_one(&self, id: &str) -> Result<Option<Stored<TrackInfo>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_one(id).await
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<Stored<TrackInfo>>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_many(ids).await
    }

    async fn persist(&self, id: &str, value: TrackInfo, fetched_at: DateTime<Utc>) -> Result<Stored<TrackInfo>> {
        self.inner.persist(id, value, fetched_at).await
    }

    async fn persist_many(&self, rows: Vec<(String, TrackInfo)>, fetched_at: DateTime<Utc>) -> Result<()> {
        self.inner.persist_many(rows, fetched_at).await
    }
}

/// Remote catalog whose calls take `LATENCY_MS` on the manual clock.
struct Catalog {
    clock: Arc<ManualClock>,
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteSource<TrackInfo> for Catalog {
    async fn fetch_one(&self, id: &str) -> Result<Option<TrackInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.clock.advance_ms(LATENCY_MS);
        tokio::task::yield_now().await;
        Ok((id != "missing").then(|| track(id)))
    }
}

#[async_trait]
impl RemoteSource<ArtistInfo> for Catalog {
    async fn fetch_one(&self, _id: &str) -> Result<Option<ArtistInfo>> {
        Ok(None)
    }
}

#[derive(Default)]
struct Account {
    saved: Mutex<HashSet<String>>,
}

#[async_trait]
impl SavedRemote for Account {
    async fn fetch_library(&self) -> Result<Vec<String>> {
        Ok(self.saved.lock().unwrap().iter().cloned().collect())
    }

    async fn contains(&self, ids: &[String]) -> Result<Vec<bool>> {
        let saved = self.saved.lock().unwrap();
        Ok(ids.iter().map(|id| saved.contains(id)).collect())
    }

    async fn save(&self, ids: &[String]) -> Result<()> {
        self.saved.lock().unwrap().extend(ids.iter().cloned());
        Ok(())
    }

    async fn unsave(&self, ids: &[String]) -> Result<()> {
        let mut saved = self.saved.lock().unwrap();
        for id in ids {
            saved.remove(id);
        }
        Ok(())
    }
}

struct Player;

#[async_trait]
impl PlaybackRemote for Player {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn skip_next(&self) -> Result<()> {
        Ok(())
    }

    async fn skip_previous(&self) -> Result<()> {
        Ok(())
    }

    async fn seek(&self, _position_ms: u32) -> Result<()> {
        Ok(())
    }

    async fn set_repeat(&self, _mode: RepeatMode) -> Result<()> {
        Ok(())
    }

    async fn set_shuffle(&self, _shuffle: bool) -> Result<()> {
        Ok(())
    }

    async fn set_volume(&self, _percent: u8) -> Result<()> {
        anyhow::bail!("status code 403 Forbidden")
    }

    async fn transfer(&self, _device_id: &str, _play: bool) -> Result<()> {
        Ok(())
    }

    async fn current_playback(&self) -> Result<Option<PlaybackSnapshot>> {
        Ok(Some(PlaybackSnapshot {
            device: Some(DeviceInfo {
                id: "desk".to_string(),
                name: "Desk".to_string(),
                is_active: true,
                volume_percent: Some(30),
            }),
            is_playing: true,
            shuffle: false,
            repeat: RepeatMode::Off,
            context_uri: None,
            playing_type: PlayingType::Track,
            item: Some(PlayingItem::Track(track("t1"))),
            progress_ms: Some(1_000),
            timestamp_ms: 0,
        }))
    }

    async fn currently_playing(&self) -> Result<Option<CurrentlyPlaying>> {
        Ok(None)
    }

    async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(Vec::new())
    }
}

struct Setup {
    session: Session,
    clock: Arc<ManualClock>,
    catalog: Arc<Catalog>,
    track_store: Arc<CountingStore<JsonFileStore<TrackInfo>>>,
    account: Arc<Account>,
}

async fn setup(dir: &std::path::Path, start_ms: i64) -> Setup {
    let clock = Arc::new(ManualClock::new(start_ms));
    let ctx = SyncContext::new(Handle::current(), Arc::new(Database::new("it")), clock.clone());
    let config = SyncConfig {
        cache_dir: dir.to_path_buf(),
        ..SyncConfig::default()
    };
    let catalog = Arc::new(Catalog {
        clock: clock.clone(),
        calls: AtomicUsize::new(0),
    });
    let track_store: Arc<CountingStore<JsonFileStore<TrackInfo>>> = Arc::new(CountingStore {
        inner: DocumentStore::open(config.tracks_path()).await.unwrap(),
        reads: AtomicUsize::new(0),
    });
    let saved_store: DocumentStore<SavedDocument> =
        DocumentStore::open(config.saved_tracks_path()).await.unwrap();
    let account = Arc::new(Account::default());

    let session = Session::new(
        &ctx,
        &config,
        Collaborators {
            track_store: track_store.clone(),
            track_remote: catalog.clone(),
            artist_store: Arc::new(MemoryStore::<ArtistInfo>::new()),
            artist_remote: catalog.clone(),
            saved_store: Arc::new(saved_store),
            saved_remote: account.clone(),
            playback: Arc::new(Player),
        },
    );

    Setup {
        session,
        clock,
        catalog,
        track_store,
        account,
    }
}

async fn wait_loaded(cell: &spotify_sync::sync::StateCell<TrackInfo>) -> CacheState<TrackInfo> {
    let mut rx = cell.subscribe();
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| matches!(s, Some(CacheState::Loaded { .. } | CacheState::NotFound))),
    )
    .await
    .expect("timed out")
    .expect("cell alive");
    (*state).clone().expect("state present")
}

#[tokio::test]
async fn first_request_loads_with_midpoint_time_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = setup(dir.path(), 1_000).await;
    let cell = first.session.tracks.state_of("t1");
    let mut rx = cell.subscribe();
    assert!(rx.borrow().is_none());

    // observed in order: never requested, refreshing, loaded
    let refreshing = rx
        .wait_for(|s| s.as_ref().is_some_and(CacheState::is_refreshing))
        .await
        .map(|s| (*s).clone())
        .unwrap();
    assert!(refreshing.is_some_and(|s| s.value().is_none()));

    match wait_loaded(&cell).await {
        CacheState::Loaded { value, cache_time } => {
            assert_eq!(value, track("t1"));
            assert_eq!(cache_time, at(1_000 + LATENCY_MS / 2));
        }
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(first.track_store.reads.load(Ordering::SeqCst), 1);
    assert_eq!(first.catalog.calls.load(Ordering::SeqCst), 1);
    drop(first);

    // a new process finds the value on disk and never goes remote
    let second = setup(dir.path(), 5_000).await;
    let cell = second.session.tracks.state_of("t1");
    match wait_loaded(&cell).await {
        CacheState::Loaded { cache_time, .. } => assert_eq!(cache_time, at(1_050)),
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(second.catalog.calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.clock.now_ms(), 5_000);
}

#[tokio::test]
async fn missing_track_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path(), 0).await;

    let cell = s.session.tracks.state_of("missing");
    assert!(matches!(wait_loaded(&cell).await, CacheState::NotFound));

    // asking again does not go back to the network
    s.session.tracks.load("missing").await;
    assert_eq!(s.catalog.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn saved_toggle_persists_across_sessions() {
    let dir = tempfile::tempdir().unwrap();

    let first = setup(dir.path(), 0).await;
    assert!(first.session.saved_tracks.toggle_saved("t1").await.unwrap());
    assert!(first.account.saved.lock().unwrap().contains("t1"));
    drop(first);

    let second = setup(dir.path(), 0).await;
    let cell = second.session.saved_tracks.saved_state_of("t1");
    let mut rx = cell.subscribe();
    let state = rx.wait_for(Option::is_some).await.map(|s| *s).unwrap();
    assert_eq!(state, Some(ToggleableState::Set(true)));
}

#[tokio::test]
async fn transport_reports_failures_and_merges_playback() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path(), 10_000).await;
    let transport = &s.session.transport;
    let mut errors = transport.errors();

    transport.refresh_playback().unwrap().await.unwrap();
    assert!(transport.playable().get());
    assert_eq!(transport.volume().get(), Some(ToggleableState::Set(30)));

    s.clock.advance_ms(500);
    assert_eq!(transport.position_ms(), Some(1_500));

    transport.set_volume(90).unwrap().await.unwrap();
    assert_eq!(transport.volume().get(), Some(ToggleableState::Set(30)));
    let error = errors.recv().await.unwrap();
    assert_eq!(error.message, "This device does not allow volume control.");
}
