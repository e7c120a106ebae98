//! Live data synchronization for a Spotify client
//!
//! Entities (tracks, artists, saved flags, player state) are served from
//! observable in-memory cells, backed by a local store and the Spotify Web API.
//! Observers subscribe to cells and never talk to storage or the network.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod playback;
pub mod session;
pub mod spotify;
pub mod sync;

pub use config::SyncConfig;
pub use session::{Collaborators, Session};
