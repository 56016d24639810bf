//! Spotify Web API client with a cached client-credentials token.
//!
//! Spotify never serves audio here: resolved tracks are bridged to YouTube
//! searches at play time, so this client only fetches catalog metadata.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SpotifyConfig;
use crate::error::{Error, NetworkError, Result};

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";
/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(300);
pub const PLAYLIST_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// A catalog track in the shape the resolver consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotifyTrack {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration_ms: u64,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    url: String,
}

#[derive(Debug, Deserialize)]
struct AlbumRef {
    #[serde(default)]
    images: Vec<ImageRef>,
}

#[derive(Debug, Deserialize)]
struct TrackResponse {
    id: String,
    name: String,
    duration_ms: u64,
    #[serde(default)]
    artists: Vec<ArtistRef>,
    album: Option<AlbumRef>,
}

impl TrackResponse {
    fn into_track(self) -> SpotifyTrack {
        let artist = if self.artists.is_empty() {
            None
        } else {
            Some(
                self.artists
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };
        let thumbnail_url = self
            .album
            .and_then(|a| a.images.into_iter().next())
            .map(|i| i.url);
        SpotifyTrack {
            id: self.id,
            title: self.name,
            artist,
            duration_ms: self.duration_ms,
            thumbnail_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    track: Option<TrackResponse>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracksPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next: Option<String>,
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PlaylistResponse {
    name: String,
}

pub struct SpotifyClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<CachedToken>>,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| {
                Error::from(NetworkError::ConnectionFailed {
                    reason: e.to_string(),
                })
            })?;
        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token: RwLock::new(None),
        })
    }

    pub async fn track(&self, track_id: &str) -> Result<SpotifyTrack> {
        let url = format!("{API_BASE}/tracks/{track_id}");
        let track: TrackResponse = self.get_json(&url).await?;
        Ok(track.into_track())
    }

    pub async fn playlist_name(&self, playlist_id: &str) -> Result<String> {
        let url = format!("{API_BASE}/playlists/{playlist_id}?fields=name");
        let playlist: PlaylistResponse = self.get_json(&url).await?;
        Ok(playlist.name)
    }

    /// Fetch playlist tracks, following `next` links 50 at a time, capped at
    /// `cap` tracks. Returns the tracks plus how many were dropped past the
    /// cap (for the single user-facing warning).
    pub async fn playlist_tracks(
        &self,
        playlist_id: &str,
        cap: usize,
    ) -> Result<(Vec<SpotifyTrack>, usize)> {
        let mut url = format!(
            "{API_BASE}/playlists/{playlist_id}/tracks\
             ?fields=items(track(id,name,duration_ms,artists(name),album(images))),next,total\
             &limit={PLAYLIST_PAGE_SIZE}"
        );
        let mut tracks = Vec::new();
        let mut total_reported: Option<u64> = None;

        loop {
            let page: PlaylistTracksPage = self.get_json(&url).await?;
            if total_reported.is_none() {
                total_reported = page.total;
            }
            for item in page.items {
                if let Some(track) = item.track {
                    tracks.push(track.into_track());
                }
            }
            if tracks.len() >= cap {
                break;
            }
            match page.next {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(apply_cap(tracks, cap, total_reported))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(request_err)?;

        // A 401 means the cached token went stale early: refresh and retry
        // exactly once; a second 401 surfaces as an auth failure.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!("spotify token rejected, refreshing and retrying once");
            self.invalidate_token().await;
            let token = self.token().await?;
            let retried = self
                .http
                .get(url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(request_err)?;
            if retried.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(NetworkError::AuthFailed {
                    service: "spotify".to_string(),
                }
                .into());
            }
            return decode_response(retried).await;
        }

        decode_response(response).await
    }

    async fn token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut cached = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(request_err)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            warn!("spotify client credentials were rejected");
            return Err(NetworkError::AuthFailed {
                service: "spotify".to_string(),
            }
            .into());
        }

        let token: TokenResponse = decode_response(response).await?;
        let expires_at = Instant::now() + token_lifetime(token.expires_in);
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at,
        });
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }
}

/// Cache lifetime for a token: `expires_in` minus the refresh margin.
fn token_lifetime(expires_in: u64) -> Duration {
    Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN.as_secs()))
}

/// Enforce the per-request track cap and compute the dropped count.
fn apply_cap(
    mut tracks: Vec<SpotifyTrack>,
    cap: usize,
    total_reported: Option<u64>,
) -> (Vec<SpotifyTrack>, usize) {
    let fetched = tracks.len();
    let dropped_fetched = fetched.saturating_sub(cap);
    tracks.truncate(cap);

    // Prefer the playlist's reported total so unfetched pages count too.
    let dropped = match total_reported {
        Some(total) => (total as usize).saturating_sub(cap).max(dropped_fetched),
        None => dropped_fetched,
    };
    (tracks, dropped)
}

fn request_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        NetworkError::RequestTimeout { seconds: 30 }.into()
    } else if err.is_connect() {
        NetworkError::ConnectionFailed {
            reason: err.to_string(),
        }
        .into()
    } else {
        NetworkError::InvalidResponse {
            reason: err.to_string(),
        }
        .into()
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        return Err(NetworkError::RateLimited { retry_after_secs }.into());
    }
    if status.is_server_error() {
        return Err(NetworkError::ServerError {
            status: status.as_u16(),
        }
        .into());
    }
    if !status.is_success() {
        return Err(NetworkError::InvalidResponse {
            reason: format!("unexpected status {status}"),
        }
        .into());
    }
    response.json::<T>().await.map_err(|e| {
        NetworkError::InvalidResponse {
            reason: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifetime_subtracts_margin() {
        assert_eq!(token_lifetime(3600), Duration::from_secs(3300));
        // A pathologically short expiry never underflows.
        assert_eq!(token_lifetime(100), Duration::from_secs(0));
    }

    #[test]
    fn track_response_flattens_artists_and_art() {
        let json = r#"{
            "id": "4cOdK2wGLETKBW3PvgPWqT",
            "name": "Never Gonna Give You Up",
            "duration_ms": 213573,
            "artists": [{"name": "Rick Astley"}],
            "album": {"images": [{"url": "https://i.scdn.co/image/large"}, {"url": "https://i.scdn.co/image/small"}]}
        }"#;
        let parsed: TrackResponse = serde_json::from_str(json).unwrap();
        let track = parsed.into_track();
        assert_eq!(track.artist.as_deref(), Some("Rick Astley"));
        assert_eq!(track.duration_ms, 213_573);
        assert_eq!(
            track.thumbnail_url.as_deref(),
            Some("https://i.scdn.co/image/large")
        );
    }

    #[test]
    fn playlist_page_tolerates_null_tracks() {
        let json = r#"{
            "items": [
                {"track": {"id": "a", "name": "A", "duration_ms": 1000, "artists": []}},
                {"track": null}
            ],
            "next": null,
            "total": 2
        }"#;
        let page: PlaylistTracksPage = serde_json::from_str(json).unwrap();
        let tracks: Vec<_> = page.items.into_iter().filter_map(|i| i.track).collect();
        assert_eq!(tracks.len(), 1);
    }

    #[test]
    fn cap_uses_reported_total_for_dropped_count() {
        let make = |n: usize| {
            (0..n)
                .map(|i| SpotifyTrack {
                    id: format!("id{i}"),
                    title: format!("t{i}"),
                    artist: None,
                    duration_ms: 1000,
                    thumbnail_url: None,
                })
                .collect::<Vec<_>>()
        };

        // 150-track playlist, 100 fetched before the cap stopped pagination.
        let (tracks, dropped) = apply_cap(make(100), 100, Some(150));
        assert_eq!(tracks.len(), 100);
        assert_eq!(dropped, 50);

        // Under the cap: nothing dropped.
        let (tracks, dropped) = apply_cap(make(40), 100, Some(40));
        assert_eq!(tracks.len(), 40);
        assert_eq!(dropped, 0);

        // No total reported: fall back to what we actually trimmed.
        let (tracks, dropped) = apply_cap(make(120), 100, None);
        assert_eq!(tracks.len(), 100);
        assert_eq!(dropped, 20);
    }
}
