//! Session - wires the engines to their stores and remote sources

use std::sync::Arc;

use anyhow::Result;

use crate::config::SyncConfig;
use crate::model::{ArtistInfo, Library, TrackInfo};
use crate::playback::{PlaybackRemote, PlaybackTransport};
use crate::spotify::{ArtistSource, SpotifyClient, TrackSource};
use crate::sync::{
    DocumentStore, EntityCache, JsonFileStore, LocalStore, RemoteSource, SavedDocument,
    SavedRemote, SavedStateEngine, SavedStore, SyncContext, Ttl,
};

/// Stores and remote sources the engines run against
pub struct Collaborators {
    pub track_store: Arc<dyn LocalStore<TrackInfo>>,
    pub track_remote: Arc<dyn RemoteSource<TrackInfo>>,
    pub artist_store: Arc<dyn LocalStore<ArtistInfo>>,
    pub artist_remote: Arc<dyn RemoteSource<ArtistInfo>>,
    pub saved_store: Arc<dyn SavedStore>,
    pub saved_remote: Arc<dyn SavedRemote>,
    pub playback: Arc<dyn PlaybackRemote>,
}

/// Everything a client needs for one signed-in user
#[derive(Clone)]
pub struct Session {
    ctx: SyncContext,
    pub tracks: EntityCache<TrackInfo>,
    pub artists: EntityCache<ArtistInfo>,
    pub saved_tracks: SavedStateEngine,
    pub transport: PlaybackTransport,
}

impl Session {
    pub fn new(ctx: &SyncContext, config: &SyncConfig, parts: Collaborators) -> Self {
        let track_policy = Ttl::<TrackInfo>::from_std(config.track_ttl.transient, config.track_ttl.invalid);
        let artist_policy =
            Ttl::<ArtistInfo>::from_std(config.artist_ttl.transient, config.artist_ttl.invalid);
        let library_policy = Ttl::<Library>::from_std(config.library_ttl, None);

        Self {
            ctx: ctx.clone(),
            tracks: EntityCache::new(
                "tracks",
                ctx,
                parts.track_store,
                parts.track_remote,
                Arc::new(track_policy),
            ),
            artists: EntityCache::new(
                "artists",
                ctx,
                parts.artist_store,
                parts.artist_remote,
                Arc::new(artist_policy),
            ),
            saved_tracks: SavedStateEngine::new(
                "saved tracks",
                ctx,
                parts.saved_store,
                parts.saved_remote,
                Arc::new(library_policy),
            ),
            transport: PlaybackTransport::new(ctx, parts.playback),
        }
    }

    /// Open the JSON stores under `config.cache_dir` and back every engine
    /// with `client`.
    pub async fn open(ctx: &SyncContext, config: &SyncConfig, client: SpotifyClient) -> Result<Self> {
        let track_store: JsonFileStore<TrackInfo> = DocumentStore::open(config.tracks_path()).await?;
        let artist_store: JsonFileStore<ArtistInfo> =
            DocumentStore::open(config.artists_path()).await?;
        let saved_store: DocumentStore<SavedDocument> =
            DocumentStore::open(config.saved_tracks_path()).await?;

        tracing::info!(cache_dir = %config.cache_dir.display(), "Opened local stores");

        let client = Arc::new(client);
        Ok(Self::new(
            ctx,
            config,
            Collaborators {
                track_store: Arc::new(track_store),
                track_remote: Arc::new(TrackSource(client.as_ref().clone())),
                artist_store: Arc::new(artist_store),
                artist_remote: Arc::new(ArtistSource(client.as_ref().clone())),
                saved_store: Arc::new(saved_store),
                saved_remote: client.clone(),
                playback: client,
            },
        ))
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Drop everything tied to the signed-in user.
    pub fn invalidate_user(&self) {
        self.saved_tracks.invalidate_user();
    }
}
