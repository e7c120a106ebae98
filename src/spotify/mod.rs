//! Spotify module - rspotify-backed remote sources
//!
//! - `client`: the API client and its adapters (tracks, artists, saved tracks, player)
//! - `convert`: rspotify model to cached type conversions

mod client;
pub mod convert;

pub use client::{ArtistSource, SpotifyClient, TrackSource};

use anyhow::Result;
use rspotify::{AuthCodeSpotify, Config, Token};

/// Build an rspotify client around an already issued access token.
///
/// Tokens are neither cached to disk nor refreshed by rspotify.
pub async fn client_from_token(access_token: &str) -> Result<AuthCodeSpotify> {
    let config = Config {
        token_cached: false,
        token_refreshing: false,
        ..Default::default()
    };
    let spotify = AuthCodeSpotify::with_config(Default::default(), Default::default(), config);

    let expires_in = chrono::TimeDelta::seconds(3600);
    let token = Token {
        access_token: access_token.to_string(),
        expires_in,
        expires_at: Some(chrono::Utc::now() + expires_in),
        ..Default::default()
    };
    *spotify
        .token
        .lock()
        .await
        .map_err(|_| anyhow::anyhow!("rspotify token lock poisoned"))? = Some(token);

    Ok(spotify)
}
