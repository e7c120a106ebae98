//! Remote player control and state queries

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{CurrentlyPlaying, DeviceInfo, PlaybackSnapshot, RepeatMode};

/// Verb-shaped calls against the remote player.
///
/// Commands without a device argument act on whichever device the
/// implementation considers current.
#[async_trait]
pub trait PlaybackRemote: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn skip_next(&self) -> Result<()>;

    async fn skip_previous(&self) -> Result<()>;

    async fn seek(&self, position_ms: u32) -> Result<()>;

    async fn set_repeat(&self, mode: RepeatMode) -> Result<()>;

    async fn set_shuffle(&self, shuffle: bool) -> Result<()>;

    async fn set_volume(&self, percent: u8) -> Result<()>;

    async fn transfer(&self, device_id: &str, play: bool) -> Result<()>;

    /// Player settings plus the current item. `None` when nothing is active.
    async fn current_playback(&self) -> Result<Option<PlaybackSnapshot>>;

    async fn currently_playing(&self) -> Result<Option<CurrentlyPlaying>>;

    async fn devices(&self) -> Result<Vec<DeviceInfo>>;
}
