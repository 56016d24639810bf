//! Media resolver: normalizes heterogeneous play inputs into `SongRecord`
//! lists, bridging Spotify to YouTube searches and enforcing the guild's
//! duration limit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::config::AudioConfig;
use crate::error::{MediaError, Result, ValidationError};
use crate::model::{
    query_hash, AudioMetadata, GuildSettings, PlayIntent, PlayIntentKind, Requester, SongRecord,
    SongSource,
};
use crate::storage::MetadataStore;

use super::process::{ProcessRunner, TrackMetadata};
use super::spotify::{SpotifyClient, SpotifyTrack};

static SPOTIFY_PLAYLIST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://open\.spotify\.com/(?:intl-[a-z]+/)?playlist/([A-Za-z0-9]+)")
        .expect("static regex")
});
static SPOTIFY_TRACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://open\.spotify\.com/(?:intl-[a-z]+/)?track/([A-Za-z0-9]+)")
        .expect("static regex")
});
static YOUTUBE_PLAYLIST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(?:www\.|music\.)?youtube\.com/(?:playlist\?list=|watch\?(?:.*&)?list=)[\w-]+")
        .expect("static regex")
});
static YOUTUBE_TRACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^https?://(?:(?:www\.|music\.)?youtube\.com/(?:watch\?v=|shorts/)[\w-]+|youtu\.be/[\w-]+)",
    )
    .expect("static regex")
});

/// Outcome of a resolution, including what was dropped and why so the
/// dispatcher can emit a single summary warning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub songs: Vec<SongRecord>,
    pub playlist_title: Option<String>,
    /// Items rejected by the guild's duration limit.
    pub dropped_over_limit: usize,
    /// Items past the playlist ingestion cap.
    pub dropped_over_cap: usize,
}

/// Seam the session engine consumes; the production implementation drives
/// yt-dlp and the Spotify Web API.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(
        &self,
        guild_id: &str,
        intent: &PlayIntent,
        requester: &Requester,
        settings: &GuildSettings,
    ) -> Result<Resolution>;
}

/// Classify raw user input into a play intent.
pub fn classify(raw: &str) -> Result<PlayIntent> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidQuery {
            reason: "query is empty".to_string(),
        }
        .into());
    }
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return Err(ValidationError::InvalidQuery {
            reason: "query looks like structured data".to_string(),
        }
        .into());
    }

    let kind = if SPOTIFY_PLAYLIST_RE.is_match(trimmed) {
        PlayIntentKind::SpotifyPlaylist
    } else if SPOTIFY_TRACK_RE.is_match(trimmed) {
        PlayIntentKind::SpotifyTrack
    } else if YOUTUBE_PLAYLIST_RE.is_match(trimmed) {
        PlayIntentKind::YoutubePlaylist
    } else if YOUTUBE_TRACK_RE.is_match(trimmed) {
        PlayIntentKind::YoutubeTrack
    } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(MediaError::UnsupportedUrl {
            url: trimmed.to_string(),
        }
        .into());
    } else {
        PlayIntentKind::Search
    };

    Ok(PlayIntent {
        kind,
        raw: trimmed.to_string(),
    })
}

/// Reject a known duration that exceeds the guild limit.
pub fn check_duration(settings: &GuildSettings, duration_ms: Option<u64>) -> Result<()> {
    if let (Some(limit_ms), Some(duration_ms)) = (settings.max_duration_ms(), duration_ms) {
        if duration_ms > limit_ms {
            return Err(MediaError::DurationLimitExceeded {
                duration_ms,
                limit_ms,
            }
            .into());
        }
    }
    Ok(())
}

/// The YouTube search bridge for a Spotify track: `<title> <artist>`.
fn bridge_query(track: &SpotifyTrack) -> String {
    match &track.artist {
        Some(artist) => format!("ytsearch1:{} {}", track.title, artist),
        None => format!("ytsearch1:{}", track.title),
    }
}

pub struct MediaResolver {
    process: Arc<ProcessRunner>,
    spotify: Option<Arc<SpotifyClient>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    config: AudioConfig,
}

impl MediaResolver {
    pub fn new(
        process: Arc<ProcessRunner>,
        spotify: Option<Arc<SpotifyClient>>,
        metadata: Option<Arc<dyn MetadataStore>>,
        config: AudioConfig,
    ) -> Self {
        Self {
            process,
            spotify,
            metadata,
            config,
        }
    }

    fn spotify(&self) -> Result<&Arc<SpotifyClient>> {
        self.spotify.as_ref().ok_or_else(|| {
            MediaError::SourceUnavailable {
                reason: "spotify is not configured".to_string(),
            }
            .into()
        })
    }

    /// Metadata-cache read path: a fresh entry skips the yt-dlp probe.
    async fn cached_metadata(&self, query: &str) -> Option<AudioMetadata> {
        let store = self.metadata.as_ref()?;
        match store.get(&query_hash(query)).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!("metadata cache read failed: {e}");
                None
            }
        }
    }

    async fn remember_metadata(&self, query: &str, meta: &TrackMetadata) {
        let Some(store) = self.metadata.as_ref() else {
            return;
        };
        let record = AudioMetadata {
            query_hash: query_hash(query),
            title: meta.title.clone(),
            duration_seconds: meta.duration_ms.map(|ms| (ms / 1000) as u32),
            thumbnail_url: meta.thumbnail.clone(),
            uploader: meta.uploader.clone(),
            source_url: Some(meta.canonical_url()),
            stream_url: None,
            stream_url_expires_at: None,
            play_count: 0,
            last_played_at: None,
        };
        if let Err(e) = store.upsert(&record).await {
            debug!("metadata cache write failed: {e}");
        }
    }

    /// Probe a single identifier, preferring the metadata cache.
    async fn probe_single(
        &self,
        guild_id: &str,
        query: &str,
        identifier: &str,
    ) -> Result<TrackMetadata> {
        if let Some(cached) = self.cached_metadata(query).await {
            debug!("metadata cache hit for guild {guild_id}");
            return Ok(TrackMetadata {
                id: cached.query_hash.clone(),
                title: cached.title.clone(),
                uploader: cached.uploader.clone(),
                duration_ms: cached.duration_seconds.map(|s| u64::from(s) * 1000),
                webpage_url: cached.source_url.clone(),
                thumbnail: cached.thumbnail_url.clone(),
            });
        }

        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let mut tracks = self.process.probe(guild_id, identifier, timeout).await?;
        if tracks.is_empty() {
            return Err(MediaError::SourceUnavailable {
                reason: "no results".to_string(),
            }
            .into());
        }
        let meta = tracks.remove(0);
        self.remember_metadata(query, &meta).await;
        Ok(meta)
    }

    fn record_from_metadata(
        &self,
        query: &str,
        meta: &TrackMetadata,
        source: SongSource,
        stream_key: String,
        requester: &Requester,
    ) -> SongRecord {
        SongRecord {
            id: query_hash(query),
            title: meta.title.clone(),
            artist: meta.uploader.clone(),
            duration_ms: meta.duration_ms,
            thumbnail_url: meta.thumbnail.clone(),
            source,
            stream_key,
            source_url: Some(meta.canonical_url()),
            requested_by: requester.clone(),
        }
    }

    fn record_from_spotify(&self, track: &SpotifyTrack, requester: &Requester) -> SongRecord {
        SongRecord {
            id: query_hash(&format!("spotify:track:{}", track.id)),
            title: track.title.clone(),
            artist: track.artist.clone(),
            duration_ms: Some(track.duration_ms),
            thumbnail_url: track.thumbnail_url.clone(),
            source: SongSource::SpotifyTrack,
            stream_key: bridge_query(track),
            source_url: Some(format!("https://open.spotify.com/track/{}", track.id)),
            requested_by: requester.clone(),
        }
    }

    /// Apply the duration pre-filter to a playlist batch, counting drops.
    fn filter_playlist(
        &self,
        settings: &GuildSettings,
        songs: Vec<SongRecord>,
    ) -> (Vec<SongRecord>, usize) {
        let before = songs.len();
        let kept: Vec<SongRecord> = songs
            .into_iter()
            .filter(|song| check_duration(settings, song.duration_ms).is_ok())
            .collect();
        let dropped = before - kept.len();
        (kept, dropped)
    }
}

#[async_trait]
impl Resolve for MediaResolver {
    async fn resolve(
        &self,
        guild_id: &str,
        intent: &PlayIntent,
        requester: &Requester,
        settings: &GuildSettings,
    ) -> Result<Resolution> {
        match intent.kind {
            PlayIntentKind::Search => {
                let search_key = format!("ytsearch1:{}", intent.raw);
                let meta = self.probe_single(guild_id, &intent.raw, &search_key).await?;
                check_duration(settings, meta.duration_ms)?;
                let song = self.record_from_metadata(
                    &intent.raw,
                    &meta,
                    SongSource::Search,
                    search_key,
                    requester,
                );
                Ok(Resolution {
                    songs: vec![song],
                    ..Default::default()
                })
            }
            PlayIntentKind::YoutubeTrack => {
                let meta = self
                    .probe_single(guild_id, &intent.raw, &intent.raw)
                    .await?;
                check_duration(settings, meta.duration_ms)?;
                let stream_key = meta.canonical_url();
                let song = self.record_from_metadata(
                    &intent.raw,
                    &meta,
                    SongSource::YoutubeTrack,
                    stream_key,
                    requester,
                );
                Ok(Resolution {
                    songs: vec![song],
                    ..Default::default()
                })
            }
            PlayIntentKind::YoutubePlaylist => {
                let title_budget = Duration::from_secs(self.config.playlist_title_timeout_secs);
                let items_budget = Duration::from_secs(self.config.playlist_items_timeout_secs);

                let title = self
                    .process
                    .playlist_title(guild_id, &intent.raw, title_budget)
                    .await?;
                let mut entries = self
                    .process
                    .playlist_entries(guild_id, &intent.raw, items_budget)
                    .await?;

                let cap = self.config.max_playlist_tracks;
                let dropped_over_cap = entries.len().saturating_sub(cap);
                entries.truncate(cap);

                let songs: Vec<SongRecord> = entries
                    .iter()
                    .map(|meta| {
                        let url = meta.canonical_url();
                        self.record_from_metadata(
                            &url,
                            meta,
                            SongSource::YoutubeTrack,
                            url.clone(),
                            requester,
                        )
                    })
                    .collect();
                let (songs, dropped_over_limit) = self.filter_playlist(settings, songs);

                info!(
                    "resolved playlist '{title}' for guild {guild_id}: {} tracks \
                     ({dropped_over_cap} over cap, {dropped_over_limit} over duration limit)",
                    songs.len()
                );
                Ok(Resolution {
                    songs,
                    playlist_title: Some(title),
                    dropped_over_limit,
                    dropped_over_cap,
                })
            }
            PlayIntentKind::SpotifyTrack => {
                let id = spotify_id(&SPOTIFY_TRACK_RE, &intent.raw)?;
                let track = self.spotify()?.track(&id).await?;
                // Best-effort pre-filter on the Spotify-reported duration;
                // the bridged result is checked again before decode.
                check_duration(settings, Some(track.duration_ms))?;
                Ok(Resolution {
                    songs: vec![self.record_from_spotify(&track, requester)],
                    ..Default::default()
                })
            }
            PlayIntentKind::SpotifyPlaylist => {
                let id = spotify_id(&SPOTIFY_PLAYLIST_RE, &intent.raw)?;
                let spotify = self.spotify()?;
                let title = spotify.playlist_name(&id).await?;
                let (tracks, dropped_over_cap) = spotify
                    .playlist_tracks(&id, self.config.max_playlist_tracks)
                    .await?;

                let songs: Vec<SongRecord> = tracks
                    .iter()
                    .map(|t| self.record_from_spotify(t, requester))
                    .collect();
                let (songs, dropped_over_limit) = self.filter_playlist(settings, songs);

                info!(
                    "resolved spotify playlist '{title}' for guild {guild_id}: {} tracks \
                     ({dropped_over_cap} over cap, {dropped_over_limit} over duration limit)",
                    songs.len()
                );
                Ok(Resolution {
                    songs,
                    playlist_title: Some(title),
                    dropped_over_limit,
                    dropped_over_cap,
                })
            }
        }
    }
}

fn spotify_id(re: &Regex, raw: &str) -> Result<String> {
    re.captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            ValidationError::InvalidUrl {
                url: raw.to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn classifies_youtube_track_urls() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            let intent = classify(url).unwrap();
            assert_eq!(intent.kind, PlayIntentKind::YoutubeTrack, "for {url}");
        }
    }

    #[test]
    fn classifies_playlists() {
        let intent = classify("https://www.youtube.com/playlist?list=PL123abc").unwrap();
        assert_eq!(intent.kind, PlayIntentKind::YoutubePlaylist);

        let intent =
            classify("https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL123abc").unwrap();
        assert_eq!(intent.kind, PlayIntentKind::YoutubePlaylist);

        let intent = classify("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M").unwrap();
        assert_eq!(intent.kind, PlayIntentKind::SpotifyPlaylist);
    }

    #[test]
    fn classifies_spotify_tracks() {
        let intent = classify("https://open.spotify.com/track/4cOdK2wGLETKBW3PvgPWqT").unwrap();
        assert_eq!(intent.kind, PlayIntentKind::SpotifyTrack);

        let intent =
            classify("https://open.spotify.com/intl-de/track/4cOdK2wGLETKBW3PvgPWqT").unwrap();
        assert_eq!(intent.kind, PlayIntentKind::SpotifyTrack);
    }

    #[test]
    fn plain_text_is_a_search() {
        let intent = classify("never gonna give you up").unwrap();
        assert_eq!(intent.kind, PlayIntentKind::Search);
        assert_eq!(intent.raw, "never gonna give you up");
    }

    #[test]
    fn rejects_empty_and_whitespace_queries() {
        assert_eq!(classify("").unwrap_err().code(), ErrorCode::InvalidQuery);
        assert_eq!(
            classify("   \t ").unwrap_err().code(),
            ErrorCode::InvalidQuery
        );
    }

    #[test]
    fn rejects_json_blobs() {
        let err = classify(r#"{"query": "song"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidQuery);
    }

    #[test]
    fn rejects_unsupported_urls() {
        let err = classify("https://example.com/audio.mp3").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedUrl);
    }

    #[test]
    fn duration_check_honors_limit_and_unlimited() {
        let mut settings = GuildSettings::defaults_for("g1");
        settings.max_duration_seconds = 60;
        assert!(check_duration(&settings, Some(59_000)).is_ok());
        assert!(check_duration(&settings, None).is_ok());
        let err = check_duration(&settings, Some(210_000)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DurationLimitExceeded);

        settings.max_duration_seconds = 0;
        assert!(check_duration(&settings, Some(86_400_000)).is_ok());
    }

    #[test]
    fn spotify_bridge_query_includes_artist() {
        let track = SpotifyTrack {
            id: "x".into(),
            title: "Never Gonna Give You Up".into(),
            artist: Some("Rick Astley".into()),
            duration_ms: 213_000,
            thumbnail_url: None,
        };
        assert_eq!(
            bridge_query(&track),
            "ytsearch1:Never Gonna Give You Up Rick Astley"
        );

        let no_artist = SpotifyTrack {
            artist: None,
            ..track
        };
        assert_eq!(
            bridge_query(&no_artist),
            "ytsearch1:Never Gonna Give You Up"
        );
    }

    #[test]
    fn spotify_id_extraction() {
        let id = spotify_id(
            &SPOTIFY_PLAYLIST_RE,
            "https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M?si=abc",
        )
        .unwrap();
        assert_eq!(id, "37i9dQZF1DXcBWIGoYBM5M");
    }
}
