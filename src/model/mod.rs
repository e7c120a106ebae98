//! Model module - state and data types shared by the sync engines
//!
//! - `types`: cached entities and playback types
//! - `cache_state`: load status and optimistic toggle variants
//! - `position`: time-extrapolated playback position

mod cache_state;
mod position;
mod types;

pub use cache_state::{CacheState, ToggleableState};
pub use position::TrackPosition;
pub use types::{
    ArtistInfo, CurrentlyPlaying, DeviceInfo, Library, PlaybackSnapshot, PlayingItem, PlayingType,
    RepeatMode, SkipState, TrackInfo,
};
