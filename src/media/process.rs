//! Process runner: launches and supervises `yt-dlp` and `ffmpeg` children
//! with per-guild caps and deadlines. Only file paths and small JSON
//! metadata cross this boundary; audio bytes never enter memory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AudioConfig;
use crate::error::{Error, MediaError, Result, SystemError};

const YTDLP: &str = "yt-dlp";
const FFMPEG: &str = "ffmpeg";

/// Metadata extracted from a `yt-dlp` probe line.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub id: String,
    pub title: String,
    pub uploader: Option<String>,
    pub duration_ms: Option<u64>,
    pub webpage_url: Option<String>,
    pub thumbnail: Option<String>,
}

impl TrackMetadata {
    /// Canonical watch URL for this entry. Flat playlist entries sometimes
    /// carry only the video id.
    pub fn canonical_url(&self) -> String {
        match &self.webpage_url {
            Some(url) if url.starts_with("http") => url.clone(),
            _ => format!("https://www.youtube.com/watch?v={}", self.id),
        }
    }
}

/// A decoded, volume-scaled temp file ready for the player.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedArtifact {
    pub path: PathBuf,
    pub volume_applied_pct: u8,
}

pub struct ProcessRunner {
    temp_dir: PathBuf,
    cap_per_guild: usize,
    permits: DashMap<String, Arc<Semaphore>>,
    active: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProcessRunner {
    pub fn new(config: &AudioConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            temp_dir: config.temp_dir.clone(),
            cap_per_guild: config.process_cap_per_guild,
            permits: DashMap::new(),
            active: AtomicUsize::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Create the temp directory. Called once at startup.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| {
                Error::from(SystemError::Filesystem {
                    reason: format!("cannot create temp dir: {e}"),
                })
            })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Currently running children, for the diagnostics surface.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Signal every in-flight child to die. In-flight `run` calls observe the
    /// signal, and `kill_on_drop` reaps anything that races it.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Best-effort removal of everything under the temp directory.
    pub async fn sweep_temp(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.temp_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!("temp sweep failed for {:?}: {e}", entry.path());
            }
        }
    }

    /// Probe a single track or a `ytsearch1:` query.
    pub async fn probe(
        &self,
        guild_id: &str,
        identifier: &str,
        timeout: Duration,
    ) -> Result<Vec<TrackMetadata>> {
        let output = self
            .run(guild_id, YTDLP, &probe_args(identifier), timeout)
            .await?;
        Ok(parse_metadata_lines(&output))
    }

    /// Playlist title only, on the short budget.
    pub async fn playlist_title(
        &self,
        guild_id: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<String> {
        let output = self
            .run(guild_id, YTDLP, &playlist_title_args(url), timeout)
            .await?;
        let title = output.lines().map(str::trim).find(|l| !l.is_empty());
        match title {
            Some(title) => Ok(title.to_string()),
            None => Err(MediaError::SourceUnavailable {
                reason: "playlist title unavailable".to_string(),
            }
            .into()),
        }
    }

    /// Enumerate playlist entries, on the long budget.
    pub async fn playlist_entries(
        &self,
        guild_id: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<Vec<TrackMetadata>> {
        let output = self
            .run(guild_id, YTDLP, &playlist_entries_args(url), timeout)
            .await?;
        Ok(parse_metadata_lines(&output))
    }

    /// Resolve a stream key to a direct media URL the decoder accepts.
    pub async fn resolve_stream_url(
        &self,
        guild_id: &str,
        stream_key: &str,
        timeout: Duration,
    ) -> Result<String> {
        let output = self
            .run(guild_id, YTDLP, &stream_url_args(stream_key), timeout)
            .await?;
        let url = output.lines().map(str::trim).find(|l| !l.is_empty());
        match url {
            Some(url) => Ok(url.to_string()),
            None => Err(MediaError::SourceUnavailable {
                reason: "no playable stream found".to_string(),
            }
            .into()),
        }
    }

    /// Decode a direct media URL into a volume-scaled Ogg/Opus temp file.
    pub async fn decode(
        &self,
        guild_id: &str,
        input_url: &str,
        volume_pct: u8,
        timeout: Duration,
    ) -> Result<DecodedArtifact> {
        let path = self.temp_dir.join(format!("{}.ogg", Uuid::new_v4()));
        let args = decode_args(input_url, volume_pct, &path);

        match self.run(guild_id, FFMPEG, &args, timeout).await {
            Ok(_) => Ok(DecodedArtifact {
                path,
                volume_applied_pct: volume_pct,
            }),
            Err(err) => {
                // Never leave a partial artifact behind.
                let _ = tokio::fs::remove_file(&path).await;
                Err(err)
            }
        }
    }

    fn permit(&self, guild_id: &str) -> Arc<Semaphore> {
        self.permits
            .entry(guild_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.cap_per_guild)))
            .clone()
    }

    async fn run(
        &self,
        guild_id: &str,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String> {
        let semaphore = self.permit(guild_id);
        let _permit = semaphore.acquire_owned().await.map_err(|_| {
            Error::from(SystemError::SubprocessCreate {
                reason: "process runner is shut down".to_string(),
            })
        })?;

        debug!("spawning {program} for guild {guild_id}: {args:?}");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::from(MediaError::BinaryMissing {
                    binary: program.to_string(),
                }),
                _ => Error::from(SystemError::SubprocessCreate {
                    reason: e.to_string(),
                }),
            })?;

        self.active.fetch_add(1, Ordering::Relaxed);
        let mut shutdown = self.shutdown_rx.clone();
        let result = tokio::select! {
            out = child.wait_with_output() => match out {
                Ok(out) => Ok(out),
                Err(e) => Err(Error::from(SystemError::SubprocessCreate {
                    reason: e.to_string(),
                })),
            },
            _ = tokio::time::sleep(timeout) => Err(Error::from(MediaError::ProcessingTimeout {
                timeout_secs: timeout.as_secs(),
            })),
            _ = shutdown.changed() => Err(Error::from(SystemError::SubprocessKill {
                reason: "shutting down".to_string(),
            })),
        };
        self.active.fetch_sub(1, Ordering::Relaxed);

        let output = result?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::SourceUnavailable {
                reason: first_error_line(&stderr),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn probe_args(identifier: &str) -> Vec<String> {
    vec![
        "--dump-json".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--ignore-errors".into(),
        identifier.into(),
    ]
}

fn playlist_title_args(url: &str) -> Vec<String> {
    vec![
        "--flat-playlist".into(),
        "--playlist-items".into(),
        "0".into(),
        "--print".into(),
        "playlist:title".into(),
        "--no-warnings".into(),
        url.into(),
    ]
}

fn playlist_entries_args(url: &str) -> Vec<String> {
    vec![
        "--dump-json".into(),
        "--flat-playlist".into(),
        "--no-warnings".into(),
        "--ignore-errors".into(),
        url.into(),
    ]
}

fn stream_url_args(stream_key: &str) -> Vec<String> {
    vec![
        "-g".into(),
        "-f".into(),
        "bestaudio/best".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        stream_key.into(),
    ]
}

fn decode_args(input_url: &str, volume_pct: u8, out: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        input_url.into(),
        "-vn".into(),
        "-filter:a".into(),
        volume_filter(volume_pct),
        "-c:a".into(),
        "libopus".into(),
        "-b:a".into(),
        "128k".into(),
        "-f".into(),
        "ogg".into(),
        out.to_string_lossy().into_owned(),
    ]
}

/// ffmpeg volume filter expression for a 0..=100 percentage.
fn volume_filter(volume_pct: u8) -> String {
    format!("volume={:.2}", f32::from(volume_pct.min(100)) / 100.0)
}

fn first_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("subprocess failed")
        .to_string()
}

/// yt-dlp emits one JSON object per line; tolerate garbage lines.
fn parse_metadata_lines(stdout: &str) -> Vec<TrackMetadata> {
    let mut tracks = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(json) => {
                if let Some(track) = json_to_metadata(&json) {
                    tracks.push(track);
                }
            }
            Err(e) => {
                warn!("failed to parse yt-dlp JSON output: {e}");
            }
        }
    }
    tracks
}

fn json_to_metadata(json: &serde_json::Value) -> Option<TrackMetadata> {
    let id = json.get("id")?.as_str()?.to_string();
    let title = json
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or("Unknown Title")
        .to_string();
    let uploader = json
        .get("uploader")
        .or_else(|| json.get("channel"))
        .and_then(|u| u.as_str())
        .map(|u| u.to_string());
    let duration_ms = json
        .get("duration")
        .and_then(|d| d.as_f64())
        .filter(|d| *d > 0.0)
        .map(|d| (d * 1000.0) as u64);
    let webpage_url = json
        .get("webpage_url")
        .or_else(|| json.get("url"))
        .and_then(|u| u.as_str())
        .map(|u| u.to_string());
    let thumbnail = json
        .get("thumbnails")
        .and_then(|t| t.as_array())
        .and_then(|arr| arr.last())
        .and_then(|thumb| thumb.get("url"))
        .and_then(|url| url.as_str())
        .or_else(|| json.get("thumbnail").and_then(|t| t.as_str()))
        .map(|s| s.to_string());

    Some(TrackMetadata {
        id,
        title,
        uploader,
        duration_ms,
        webpage_url,
        thumbnail,
    })
}
