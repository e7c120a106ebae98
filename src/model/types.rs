//! Core type definitions for cached entities and playback

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information about a Spotify playback device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub volume_percent: Option<u8>,
}

/// Repeat mode state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

impl RepeatMode {
    pub fn next(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::Off,
        }
    }
}

/// Whether a skip request is outstanding, and in which direction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SkipState {
    #[default]
    NotSkipping,
    SkippingToNext,
    SkippingToPrevious,
}

/// Kind of item the player is currently on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayingType {
    Track,
    Episode,
    Ad,
    Unknown,
}

/// Track metadata as cached locally
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub name: String,
    pub artists: Vec<String>,
    pub album: String,
    pub duration_ms: u32,
}

impl TrackInfo {
    pub fn uri(&self) -> String {
        format!("spotify:track:{}", self.id)
    }

    pub fn artist(&self) -> &str {
        self.artists.first().map(String::as_str).unwrap_or_default()
    }
}

/// Artist metadata as cached locally
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistInfo {
    pub id: String,
    pub name: String,
    pub genres: Vec<String>,
    pub followers: u32,
}

/// The thing currently loaded in the player
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlayingItem {
    Track(TrackInfo),
    Episode {
        id: String,
        name: String,
        show: String,
        duration_ms: u32,
    },
}

impl PlayingItem {
    pub fn id(&self) -> &str {
        match self {
            PlayingItem::Track(track) => &track.id,
            PlayingItem::Episode { id, .. } => id,
        }
    }

    pub fn duration_ms(&self) -> u32 {
        match self {
            PlayingItem::Track(track) => track.duration_ms,
            PlayingItem::Episode { duration_ms, .. } => *duration_ms,
        }
    }
}

/// Result of the "current playback" endpoint: player settings plus the item
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSnapshot {
    pub device: Option<DeviceInfo>,
    pub is_playing: bool,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub context_uri: Option<String>,
    pub playing_type: PlayingType,
    pub item: Option<PlayingItem>,
    pub progress_ms: Option<u32>,
    /// Server timestamp of the snapshot, in unix milliseconds.
    pub timestamp_ms: i64,
}

/// Result of the "currently playing" endpoint
#[derive(Clone, Debug, PartialEq)]
pub struct CurrentlyPlaying {
    pub is_playing: bool,
    pub context_uri: Option<String>,
    pub playing_type: PlayingType,
    pub item: Option<PlayingItem>,
    pub progress_ms: Option<u32>,
    pub timestamp_ms: i64,
}

/// The user's saved entities of one kind, as of `cache_time`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Library {
    pub ids: HashSet<String>,
    pub cache_time: DateTime<Utc>,
}

impl Library {
    pub fn new(ids: impl IntoIterator<Item = String>, cache_time: DateTime<Utc>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            cache_time,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_mode_cycles_through_all_states() {
        assert_eq!(RepeatMode::Off.next(), RepeatMode::All);
        assert_eq!(RepeatMode::All.next(), RepeatMode::One);
        assert_eq!(RepeatMode::One.next(), RepeatMode::Off);
    }
}
