//! Playback module - remote player state and commands

mod remote;
mod transport;

pub use remote::PlaybackRemote;
pub use transport::{PlaybackTransport, ToggleCell, TransportError, TransportOp};
