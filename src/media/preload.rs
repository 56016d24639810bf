//! Preloader: decodes the head-of-queue track into a ready artifact while
//! the current one plays, so the next transition to Playing is instant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::{MediaError, Result};
use crate::model::SongRecord;

use super::process::{DecodedArtifact, ProcessRunner};

/// Seam for producing a playable artifact from a song. The production
/// implementation shells out to yt-dlp + ffmpeg.
#[async_trait]
pub trait Decode: Send + Sync {
    async fn decode_song(
        &self,
        guild_id: &str,
        song: &SongRecord,
        volume_pct: u8,
        max_duration_ms: Option<u64>,
    ) -> Result<DecodedArtifact>;
}

/// Production decoder: resolves the stream key to a direct media URL, runs
/// the final duration check for records whose duration was unknown at
/// resolve time, and decodes with the volume baked in.
pub struct LiveDecoder {
    process: Arc<ProcessRunner>,
    probe_timeout: Duration,
    decode_timeout: Duration,
}

impl LiveDecoder {
    pub fn new(process: Arc<ProcessRunner>, config: &AudioConfig) -> Self {
        Self {
            process,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            decode_timeout: Duration::from_secs(config.decode_timeout_secs),
        }
    }
}

#[async_trait]
impl Decode for LiveDecoder {
    async fn decode_song(
        &self,
        guild_id: &str,
        song: &SongRecord,
        volume_pct: u8,
        max_duration_ms: Option<u64>,
    ) -> Result<DecodedArtifact> {
        // Bridged and search records may not have a duration until the
        // streaming provider reports one.
        if let (None, Some(limit_ms)) = (song.duration_ms, max_duration_ms) {
            let probed = self
                .process
                .probe(guild_id, &song.stream_key, self.probe_timeout)
                .await?;
            if let Some(duration_ms) = probed.first().and_then(|m| m.duration_ms) {
                if duration_ms > limit_ms {
                    return Err(MediaError::DurationLimitExceeded {
                        duration_ms,
                        limit_ms,
                    }
                    .into());
                }
            }
        }

        // Watch URLs and ytsearch keys both resolve through yt-dlp -g.
        let input_url = self
            .process
            .resolve_stream_url(guild_id, &song.stream_key, self.probe_timeout)
            .await?;

        self.process
            .decode(guild_id, &input_url, volume_pct, self.decode_timeout)
            .await
    }
}

/// Lifecycle of a preload slot. Monotone forward except the reset to
/// `NotStarted` on failure cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadState {
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
struct PreloadEntry {
    state: PreloadState,
    artifact: Option<DecodedArtifact>,
}

/// Per-guild decode-ahead registry. At most one active preload task per
/// guild, always for the head of the queue.
pub struct Preloader {
    decoder: Arc<dyn Decode>,
    entries: DashMap<(String, String), PreloadEntry>,
    active: DashMap<String, (String, JoinHandle<()>)>,
}

impl Preloader {
    pub fn new(decoder: Arc<dyn Decode>) -> Arc<Self> {
        Arc::new(Self {
            decoder,
            entries: DashMap::new(),
            active: DashMap::new(),
        })
    }

    pub fn state(&self, guild_id: &str, stream_key: &str) -> PreloadState {
        self.entries
            .get(&(guild_id.to_string(), stream_key.to_string()))
            .map(|e| e.state)
            .unwrap_or(PreloadState::NotStarted)
    }

    /// Begin preloading `song` for the guild. No-op when an artifact is
    /// already ready or in progress for the same key; an in-flight preload
    /// for a different key (stale head) is cancelled first.
    pub fn begin(
        self: &Arc<Self>,
        guild_id: &str,
        song: &SongRecord,
        volume_pct: u8,
        max_duration_ms: Option<u64>,
    ) {
        let key = (guild_id.to_string(), song.stream_key.clone());

        if let Some(entry) = self.entries.get(&key) {
            match entry.state {
                // Never overwrite a ready artifact.
                PreloadState::Ready | PreloadState::InProgress => return,
                PreloadState::NotStarted | PreloadState::Failed => {}
            }
        }

        if let Some((_, (active_key, handle))) = self.active.remove(guild_id) {
            if active_key != song.stream_key {
                debug!("cancelling stale preload for guild {guild_id}");
                handle.abort();
                self.entries.remove(&(guild_id.to_string(), active_key));
            } else if !handle.is_finished() {
                // Same key still running: put it back.
                self.active
                    .insert(guild_id.to_string(), (active_key, handle));
                return;
            }
        }

        self.entries.insert(
            key.clone(),
            PreloadEntry {
                state: PreloadState::InProgress,
                artifact: None,
            },
        );

        let this = Arc::clone(self);
        let guild = guild_id.to_string();
        let song = song.clone();
        let stream_key_for_active = song.stream_key.clone();
        let handle = tokio::spawn(async move {
            let result = this
                .decoder
                .decode_song(&guild, &song, volume_pct, max_duration_ms)
                .await;
            let key = (guild.clone(), song.stream_key.clone());
            match result {
                Ok(artifact) => {
                    debug!("preload ready for guild {guild}: {}", song.title);
                    this.entries.insert(
                        key,
                        PreloadEntry {
                            state: PreloadState::Ready,
                            artifact: Some(artifact),
                        },
                    );
                }
                Err(e) => {
                    // The song stays queued; play time falls back to a live
                    // decode.
                    warn!("preload failed for guild {guild} ({}): {e}", song.title);
                    this.entries.insert(
                        key,
                        PreloadEntry {
                            state: PreloadState::Failed,
                            artifact: None,
                        },
                    );
                }
            }
            this.active.remove(&guild);
        });
        self.active
            .insert(guild_id.to_string(), (stream_key_for_active, handle));
    }

    /// Take a ready artifact whose baked-in volume matches. A volume
    /// mismatch invalidates the artifact (the file is removed) so the
    /// caller re-decodes.
    pub async fn take_ready(
        &self,
        guild_id: &str,
        stream_key: &str,
        volume_pct: u8,
    ) -> Option<DecodedArtifact> {
        let key = (guild_id.to_string(), stream_key.to_string());
        let entry = self.entries.get(&key)?;
        if entry.state != PreloadState::Ready {
            return None;
        }
        let artifact = entry.artifact.clone()?;
        drop(entry);

        if artifact.volume_applied_pct != volume_pct {
            info!(
                "discarding preload for guild {guild_id}: volume {} != {}",
                artifact.volume_applied_pct, volume_pct
            );
            self.entries.remove(&key);
            let _ = tokio::fs::remove_file(&artifact.path).await;
            return None;
        }

        self.entries.remove(&key);
        Some(artifact)
    }

    /// Produce an artifact now: a matching ready preload, or a live decode.
    pub async fn obtain(
        &self,
        guild_id: &str,
        song: &SongRecord,
        volume_pct: u8,
        max_duration_ms: Option<u64>,
    ) -> Result<DecodedArtifact> {
        if let Some(ready) = self.take_ready(guild_id, &song.stream_key, volume_pct).await {
            return Ok(ready);
        }
        self.decoder
            .decode_song(guild_id, song, volume_pct, max_duration_ms)
            .await
    }

    /// Drop any entry for the key and delete its artifact file.
    pub async fn discard(&self, guild_id: &str, stream_key: &str) {
        let key = (guild_id.to_string(), stream_key.to_string());
        if let Some((_, entry)) = self.entries.remove(&key) {
            if let Some(artifact) = entry.artifact {
                let _ = tokio::fs::remove_file(&artifact.path).await;
            }
        }
    }

    /// Invalidate ready artifacts whose baked-in volume no longer matches.
    pub async fn invalidate_mismatched(&self, guild_id: &str, volume_pct: u8) {
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| {
                e.key().0 == guild_id
                    && e.value().state == PreloadState::Ready
                    && e.value()
                        .artifact
                        .as_ref()
                        .map(|a| a.volume_applied_pct != volume_pct)
                        .unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.discard(&key.0, &key.1).await;
        }
    }

    /// Cancel the active task and delete every artifact for the guild.
    pub async fn clear_guild(&self, guild_id: &str) {
        if let Some((_, (_, handle))) = self.active.remove(guild_id) {
            handle.abort();
        }
        let keys: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == guild_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            self.discard(&key.0, &key.1).await;
        }
    }

    /// Entry count, for the diagnostics surface.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_requester, FakeDecoder};
    use std::path::PathBuf;

    fn song(key: &str) -> SongRecord {
        SongRecord {
            id: crate::model::query_hash(key),
            title: format!("Track {key}"),
            artist: None,
            duration_ms: Some(180_000),
            thumbnail_url: None,
            source: crate::model::SongSource::YoutubeTrack,
            stream_key: key.to_string(),
            source_url: Some(key.to_string()),
            requested_by: test_requester(),
        }
    }

    #[tokio::test]
    async fn preload_reaches_ready_and_is_taken_once() {
        let decoder = Arc::new(FakeDecoder::succeeding());
        let preloader = Preloader::new(decoder);

        let track = song("https://youtu.be/a");
        preloader.begin("g1", &track, 100, None);

        // Wait for the background decode.
        for _ in 0..50 {
            if preloader.state("g1", &track.stream_key) == PreloadState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(preloader.state("g1", &track.stream_key), PreloadState::Ready);

        let artifact = preloader.take_ready("g1", &track.stream_key, 100).await;
        assert!(artifact.is_some());
        // Taking consumes the entry.
        assert!(preloader
            .take_ready("g1", &track.stream_key, 100)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn failed_preload_resets_for_lazy_decode() {
        let decoder = Arc::new(FakeDecoder::failing());
        let preloader = Preloader::new(decoder.clone());

        let track = song("https://youtu.be/b");
        preloader.begin("g1", &track, 100, None);

        for _ in 0..50 {
            if preloader.state("g1", &track.stream_key) == PreloadState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            preloader.state("g1", &track.stream_key),
            PreloadState::Failed
        );
        assert!(preloader
            .take_ready("g1", &track.stream_key, 100)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn volume_mismatch_invalidates_ready_artifact() {
        let decoder = Arc::new(FakeDecoder::succeeding());
        let preloader = Preloader::new(decoder);

        let track = song("https://youtu.be/c");
        preloader.begin("g1", &track, 50, None);
        for _ in 0..50 {
            if preloader.state("g1", &track.stream_key) == PreloadState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Asking at a different volume discards rather than serving stale.
        assert!(preloader
            .take_ready("g1", &track.stream_key, 80)
            .await
            .is_none());
        assert_eq!(
            preloader.state("g1", &track.stream_key),
            PreloadState::NotStarted
        );
    }

    #[tokio::test]
    async fn obtain_falls_back_to_live_decode() {
        let decoder = Arc::new(FakeDecoder::succeeding());
        let preloader = Preloader::new(decoder.clone());

        let track = song("https://youtu.be/d");
        let artifact = preloader.obtain("g1", &track, 100, None).await.unwrap();
        assert_eq!(artifact.volume_applied_pct, 100);
        assert_eq!(artifact.path, PathBuf::from(decoder.path_for(&track)));
    }
}
