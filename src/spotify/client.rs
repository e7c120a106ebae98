//! Spotify Web API adapters for the cache engines and the transport

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use rspotify::model::{ArtistId, TrackId};
use rspotify::prelude::*;
use rspotify::{AuthCodeSpotify, ClientError};

use super::convert;
use crate::error;
use crate::model::{
    ArtistInfo, CurrentlyPlaying, DeviceInfo, PlaybackSnapshot, RepeatMode, TrackInfo,
};
use crate::playback::PlaybackRemote;
use crate::sync::{RemoteSource, SavedRemote};

/// Most ids the batch endpoints accept per request.
const BATCH_LIMIT: usize = 50;

/// Map a 404 to "no such entity", pass every other failure through.
fn found<T>(result: Result<T, ClientError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let e = anyhow::Error::from(e);
            if error::is_not_found(&e) { Ok(None) } else { Err(e) }
        }
    }
}

/// Ids that parse, with their position in `ids`. An id Spotify would reject
/// is left out so it resolves as missing without failing its batch.
fn parse_ids<'a, T, E>(
    ids: &'a [String],
    parse: impl Fn(&'a str) -> Result<T, E>,
) -> Vec<(usize, T)> {
    ids.iter()
        .enumerate()
        .filter_map(|(index, id)| match parse(id.as_str()) {
            Ok(parsed) => Some((index, parsed)),
            Err(_) => {
                tracing::debug!(id = %id, "Skipping unparseable id");
                None
            }
        })
        .collect()
}

/// Spotify API client shared by every adapter
#[derive(Clone)]
pub struct SpotifyClient {
    client: Arc<AuthCodeSpotify>,
    local_device_name: Option<String>,
}

impl SpotifyClient {
    pub fn new(client: AuthCodeSpotify, local_device_name: Option<String>) -> Self {
        Self {
            client: Arc::new(client),
            local_device_name,
        }
    }

    pub fn api(&self) -> &AuthCodeSpotify {
        &self.client
    }

    /// The active device, or the configured local device when nothing is active.
    async fn device_id(&self) -> Option<String> {
        let devices = match self.client.device().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to get devices list");
                return None;
            }
        };

        if let Some(device) = devices.iter().find(|d| d.is_active) {
            tracing::trace!(device_name = %device.name, device_id = ?device.id, "Found active device");
            return device.id.clone();
        }

        if let Some(local_name) = &self.local_device_name {
            if let Some(device) = devices.iter().find(|d| &d.name == local_name) {
                tracing::debug!(device_name = %device.name, "No active device, using local device as fallback");
                return device.id.clone();
            }
        }

        tracing::debug!(available_devices = devices.len(), "No active device found");
        None
    }

    fn track_ids<'a>(ids: &'a [String]) -> Result<Vec<TrackId<'a>>> {
        ids.iter()
            .map(|id| TrackId::from_id(id.as_str()).map_err(anyhow::Error::from))
            .collect()
    }
}

/// Track metadata source
#[derive(Clone)]
pub struct TrackSource(pub SpotifyClient);

#[async_trait]
impl RemoteSource<TrackInfo> for TrackSource {
    async fn fetch_one(&self, id: &str) -> Result<Option<TrackInfo>> {
        let Ok(track_id) = TrackId::from_id(id) else {
            tracing::debug!(id, "Not a track id");
            return Ok(None);
        };
        tracing::debug!(id, "API: track");
        let track = found(self.0.client.track(track_id, None).await)?;
        Ok(track.and_then(convert::track_info))
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<TrackInfo>>> {
        let parsed = parse_ids(ids, |id| TrackId::from_id(id));
        let mut by_id = HashMap::with_capacity(parsed.len());
        for chunk in parsed.chunks(BATCH_LIMIT) {
            tracing::debug!(count = chunk.len(), "API: tracks");
            let chunk_ids: Vec<_> = chunk.iter().map(|(_, id)| id.clone()).collect();
            let tracks = self.0.client.tracks(chunk_ids, None).await?;
            by_id.extend(
                tracks
                    .into_iter()
                    .filter_map(convert::track_info)
                    .map(|track| (track.id.clone(), track)),
            );
        }
        Ok(ids.iter().map(|id| by_id.get(id).cloned()).collect())
    }
}

/// Artist metadata source
#[derive(Clone)]
pub struct ArtistSource(pub SpotifyClient);

#[async_trait]
impl RemoteSource<ArtistInfo> for ArtistSource {
    async fn fetch_one(&self, id: &str) -> Result<Option<ArtistInfo>> {
        let Ok(artist_id) = ArtistId::from_id(id) else {
            tracing::debug!(id, "Not an artist id");
            return Ok(None);
        };
        tracing::debug!(id, "API: artist");
        let artist = found(self.0.client.artist(artist_id).await)?;
        Ok(artist.map(convert::artist_info))
    }

    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<Option<ArtistInfo>>> {
        let parsed = parse_ids(ids, |id| ArtistId::from_id(id));
        let mut by_id = HashMap::with_capacity(parsed.len());
        for chunk in parsed.chunks(BATCH_LIMIT) {
            tracing::debug!(count = chunk.len(), "API: artists");
            let chunk_ids: Vec<_> = chunk.iter().map(|(_, id)| id.clone()).collect();
            let artists = self.0.client.artists(chunk_ids).await?;
            by_id.extend(
                artists
                    .into_iter()
                    .map(convert::artist_info)
                    .map(|artist| (artist.id.clone(), artist)),
            );
        }
        Ok(ids.iter().map(|id| by_id.get(id).cloned()).collect())
    }
}

/// Saved tracks ("Liked Songs")
#[async_trait]
impl SavedRemote for SpotifyClient {
    async fn fetch_library(&self) -> Result<Vec<String>> {
        tracing::debug!("API: current_user_saved_tracks");
        let saved: Vec<_> = self
            .client
            .current_user_saved_tracks(None)
            .try_collect()
            .await?;
        Ok(saved
            .into_iter()
            .filter_map(|saved| saved.track.id.map(|id| id.id().to_string()))
            .collect())
    }

    async fn contains(&self, ids: &[String]) -> Result<Vec<bool>> {
        // an id that is not a track id cannot be saved
        let mut flags = vec![false; ids.len()];
        let parsed = parse_ids(ids, |id| TrackId::from_id(id));
        for chunk in parsed.chunks(BATCH_LIMIT) {
            tracing::debug!(count = chunk.len(), "API: current_user_saved_tracks_contains");
            let chunk_ids: Vec<_> = chunk.iter().map(|(_, id)| id.clone()).collect();
            let saved = self.client.current_user_saved_tracks_contains(chunk_ids).await?;
            for ((index, _), saved) in chunk.iter().zip(saved) {
                flags[*index] = saved;
            }
        }
        Ok(flags)
    }

    async fn save(&self, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(BATCH_LIMIT) {
            tracing::debug!(count = chunk.len(), "API: current_user_saved_tracks_add");
            self.client
                .current_user_saved_tracks_add(Self::track_ids(chunk)?)
                .await?;
        }
        Ok(())
    }

    async fn unsave(&self, ids: &[String]) -> Result<()> {
        for chunk in ids.chunks(BATCH_LIMIT) {
            tracing::debug!(count = chunk.len(), "API: current_user_saved_tracks_delete");
            self.client
                .current_user_saved_tracks_delete(Self::track_ids(chunk)?)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PlaybackRemote for SpotifyClient {
    async fn start(&self) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(device_id = ?device_id, "API: resume_playback");
        self.client.resume_playback(device_id.as_deref(), None).await?;
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(device_id = ?device_id, "API: pause_playback");
        self.client.pause_playback(device_id.as_deref()).await?;
        Ok(())
    }

    async fn skip_next(&self) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(device_id = ?device_id, "API: next_track");
        self.client.next_track(device_id.as_deref()).await?;
        Ok(())
    }

    async fn skip_previous(&self) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(device_id = ?device_id, "API: previous_track");
        self.client.previous_track(device_id.as_deref()).await?;
        Ok(())
    }

    async fn seek(&self, position_ms: u32) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(position_ms, device_id = ?device_id, "API: seek_track");
        let position = chrono::TimeDelta::milliseconds(i64::from(position_ms));
        self.client.seek_track(position, device_id.as_deref()).await?;
        Ok(())
    }

    async fn set_repeat(&self, mode: RepeatMode) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(mode = ?mode, device_id = ?device_id, "API: repeat");
        self.client
            .repeat(convert::repeat_state(mode), device_id.as_deref())
            .await?;
        Ok(())
    }

    async fn set_shuffle(&self, shuffle: bool) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(shuffle, device_id = ?device_id, "API: shuffle");
        self.client.shuffle(shuffle, device_id.as_deref()).await?;
        Ok(())
    }

    async fn set_volume(&self, percent: u8) -> Result<()> {
        let device_id = self.device_id().await;
        tracing::debug!(percent, device_id = ?device_id, "API: volume");
        self.client.volume(percent, device_id.as_deref()).await?;
        Ok(())
    }

    async fn transfer(&self, device_id: &str, play: bool) -> Result<()> {
        tracing::debug!(device_id, play, "API: transfer_playback");
        self.client.transfer_playback(device_id, Some(play)).await?;
        Ok(())
    }

    async fn current_playback(&self) -> Result<Option<PlaybackSnapshot>> {
        tracing::trace!("API: current_playback");
        let playback = self.client.current_playback(None, None::<Vec<_>>).await?;
        Ok(playback.map(convert::playback_snapshot))
    }

    async fn currently_playing(&self) -> Result<Option<CurrentlyPlaying>> {
        tracing::trace!("API: current_playing");
        let current = self.client.current_playing(None, None::<Vec<_>>).await?;
        Ok(current.map(convert::currently_playing))
    }

    async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        tracing::debug!("API: device");
        let devices = self.client.device().await?;
        Ok(devices.into_iter().map(convert::device_info).collect())
    }
}
