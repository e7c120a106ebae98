//! Conversions from rspotify models into the crate's cached types

use chrono::TimeDelta;
use rspotify::model::{
    CurrentPlaybackContext, CurrentlyPlayingContext, CurrentlyPlayingType, Device, FullArtist,
    FullTrack, PlayableItem,
};
use rspotify::prelude::Id;

use crate::model::{
    ArtistInfo, CurrentlyPlaying, DeviceInfo, PlaybackSnapshot, PlayingItem, PlayingType,
    RepeatMode, TrackInfo,
};

pub(crate) fn millis(duration: TimeDelta) -> u32 {
    u32::try_from(duration.num_milliseconds().max(0)).unwrap_or(u32::MAX)
}

/// Local tracks have no id and cannot be cached.
pub fn track_info(track: FullTrack) -> Option<TrackInfo> {
    let id = track.id.as_ref()?.id().to_string();
    Some(TrackInfo {
        id,
        name: track.name,
        artists: track.artists.into_iter().map(|a| a.name).collect(),
        album: track.album.name,
        duration_ms: millis(track.duration),
    })
}

pub fn artist_info(artist: FullArtist) -> ArtistInfo {
    ArtistInfo {
        id: artist.id.id().to_string(),
        name: artist.name,
        genres: artist.genres,
        followers: artist.followers.total,
    }
}

pub fn device_info(device: Device) -> DeviceInfo {
    DeviceInfo {
        id: device.id.unwrap_or_default(),
        name: device.name,
        is_active: device.is_active,
        volume_percent: device
            .volume_percent
            .map(|v| u8::try_from(v.min(100)).unwrap_or(100)),
    }
}

pub fn repeat_mode(state: rspotify::model::RepeatState) -> RepeatMode {
    match state {
        rspotify::model::RepeatState::Off => RepeatMode::Off,
        rspotify::model::RepeatState::Context => RepeatMode::All,
        rspotify::model::RepeatState::Track => RepeatMode::One,
    }
}

pub fn repeat_state(mode: RepeatMode) -> rspotify::model::RepeatState {
    match mode {
        RepeatMode::Off => rspotify::model::RepeatState::Off,
        RepeatMode::All => rspotify::model::RepeatState::Context,
        RepeatMode::One => rspotify::model::RepeatState::Track,
    }
}

pub fn playing_type(kind: &CurrentlyPlayingType) -> PlayingType {
    match kind {
        CurrentlyPlayingType::Track => PlayingType::Track,
        CurrentlyPlayingType::Episode => PlayingType::Episode,
        CurrentlyPlayingType::Advertisement => PlayingType::Ad,
        CurrentlyPlayingType::Unknown => PlayingType::Unknown,
    }
}

pub fn playing_item(item: PlayableItem) -> Option<PlayingItem> {
    match item {
        PlayableItem::Track(track) => track_info(track).map(PlayingItem::Track),
        PlayableItem::Episode(episode) => Some(PlayingItem::Episode {
            id: episode.id.id().to_string(),
            name: episode.name,
            show: episode.show.name,
            duration_ms: millis(episode.duration),
        }),
        PlayableItem::Unknown(_) => None,
    }
}

pub fn playback_snapshot(playback: CurrentPlaybackContext) -> PlaybackSnapshot {
    PlaybackSnapshot {
        device: Some(device_info(playback.device)),
        is_playing: playback.is_playing,
        shuffle: playback.shuffle_state,
        repeat: repeat_mode(playback.repeat_state),
        context_uri: playback.context.map(|c| c.uri),
        playing_type: playing_type(&playback.currently_playing_type),
        item: playback.item.and_then(playing_item),
        progress_ms: playback.progress.map(millis),
        timestamp_ms: playback.timestamp.timestamp_millis(),
    }
}

pub fn currently_playing(current: CurrentlyPlayingContext) -> CurrentlyPlaying {
    CurrentlyPlaying {
        is_playing: current.is_playing,
        context_uri: current.context.map(|c| c.uri),
        playing_type: playing_type(&current.currently_playing_type),
        item: current.item.and_then(playing_item),
        progress_ms: current.progress.map(millis),
        timestamp_ms: current.timestamp.timestamp_millis(),
    }
}
