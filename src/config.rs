//! Runtime configuration, read from the environment

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_CACHE_DIR: &str = ".cache";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const DAY: u64 = 24 * 60 * 60;

/// Freshness thresholds for one cached entity kind. `None` means unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlConfig {
    pub transient: Option<Duration>,
    pub invalid: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Directory holding the JSON stores. Created on first write.
    pub cache_dir: PathBuf,
    pub track_ttl: TtlConfig,
    pub artist_ttl: TtlConfig,
    /// Age after which the stored library is shown but refetched.
    pub library_ttl: Option<Duration>,
    pub poll_interval: Duration,
    /// Device to command when none is active.
    pub device_name: Option<String>,
    pub access_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            track_ttl: TtlConfig {
                transient: Some(Duration::from_secs(7 * DAY)),
                invalid: None,
            },
            artist_ttl: TtlConfig {
                transient: Some(Duration::from_secs(DAY)),
                invalid: Some(Duration::from_secs(30 * DAY)),
            },
            library_ttl: Some(Duration::from_secs(10 * 60)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            device_name: None,
            access_token: None,
        }
    }
}

/// Parse a TTL in seconds. `none` (or an empty value) disables the threshold.
fn parse_ttl(name: &str, raw: &str) -> Result<Option<Duration>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{name} must be a number of seconds or \"none\", got {raw:?}"))?;
    Ok(Some(Duration::from_secs(secs)))
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from `lookup`, falling back to defaults for unset names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let ttl = |name: &str, default: Option<Duration>| -> Result<Option<Duration>> {
            match lookup(name) {
                Some(raw) => parse_ttl(name, &raw),
                None => Ok(default),
            }
        };

        if let Some(dir) = lookup("SPOTIFY_SYNC_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }

        config.track_ttl = TtlConfig {
            transient: ttl("SPOTIFY_SYNC_TRACK_TRANSIENT_TTL_SECS", config.track_ttl.transient)?,
            invalid: ttl("SPOTIFY_SYNC_TRACK_INVALID_TTL_SECS", config.track_ttl.invalid)?,
        };
        config.artist_ttl = TtlConfig {
            transient: ttl("SPOTIFY_SYNC_ARTIST_TRANSIENT_TTL_SECS", config.artist_ttl.transient)?,
            invalid: ttl("SPOTIFY_SYNC_ARTIST_INVALID_TTL_SECS", config.artist_ttl.invalid)?,
        };
        config.library_ttl = ttl("SPOTIFY_SYNC_LIBRARY_TTL_SECS", config.library_ttl)?;

        if let Some(raw) = lookup("SPOTIFY_SYNC_POLL_INTERVAL_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("SPOTIFY_SYNC_POLL_INTERVAL_SECS must be a number, got {raw:?}"))?;
            anyhow::ensure!(secs > 0, "SPOTIFY_SYNC_POLL_INTERVAL_SECS must be at least 1");
            config.poll_interval = Duration::from_secs(secs);
        }

        config.device_name = lookup("SPOTIFY_SYNC_DEVICE_NAME").filter(|name| !name.is_empty());
        config.access_token = lookup("SPOTIFY_ACCESS_TOKEN").filter(|token| !token.is_empty());

        Ok(config)
    }

    pub fn tracks_path(&self) -> PathBuf {
        self.cache_dir.join("tracks.json")
    }

    pub fn artists_path(&self) -> PathBuf {
        self.cache_dir.join("artists.json")
    }

    pub fn saved_tracks_path(&self) -> PathBuf {
        self.cache_dir.join("saved_tracks.json")
    }
}
