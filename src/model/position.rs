//! Time-extrapolated playback position

/// Playback position, anchored to wall-clock milliseconds.
///
/// Values are replaced on every refresh, play, pause or seek; they are never
/// mutated in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackPosition {
    /// A seek request is outstanding.
    Seeking { target_ms: u32 },
    /// Last known position, observed at `fetched_at_ms`.
    Fetched {
        fetched_at_ms: i64,
        position_ms: u32,
        playing: bool,
    },
}

impl TrackPosition {
    pub fn fetched(fetched_at_ms: i64, position_ms: u32, playing: bool) -> Self {
        TrackPosition::Fetched {
            fetched_at_ms,
            position_ms,
            playing,
        }
    }

    /// Live position at `now_ms`, extrapolated while playing.
    pub fn current_position_ms(&self, now_ms: i64) -> u32 {
        match *self {
            TrackPosition::Seeking { target_ms } => target_ms,
            TrackPosition::Fetched {
                fetched_at_ms,
                position_ms,
                playing,
            } => {
                if playing {
                    let elapsed = (now_ms - fetched_at_ms).max(0);
                    let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
                    position_ms.saturating_add(elapsed)
                } else {
                    position_ms
                }
            }
        }
    }

    /// Same as [`current_position_ms`](Self::current_position_ms) but never past the item's end.
    pub fn clamped_position_ms(&self, now_ms: i64, duration_ms: u32) -> u32 {
        self.current_position_ms(now_ms).min(duration_ms)
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, TrackPosition::Fetched { playing: true, .. })
    }

    /// Freeze the position at `now_ms`.
    pub fn pause(&self, now_ms: i64) -> Self {
        match self {
            TrackPosition::Seeking { .. } => *self,
            TrackPosition::Fetched { .. } => {
                TrackPosition::fetched(now_ms, self.current_position_ms(now_ms), false)
            }
        }
    }

    /// Start extrapolating again from the position reached at `now_ms`.
    pub fn play(&self, now_ms: i64) -> Self {
        match self {
            TrackPosition::Seeking { .. } => *self,
            TrackPosition::Fetched { .. } => {
                TrackPosition::fetched(now_ms, self.current_position_ms(now_ms), true)
            }
        }
    }
}
