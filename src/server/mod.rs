//! HTTP server: the interactions webhook endpoint plus health, wired to the
//! dispatcher, with the full shutdown/cleanup sequence.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::chat::{DiscordRestClient, MessageRefManager};
use crate::config::CadenceConfig;
use crate::coordinator::StateCoordinator;
use crate::interactions::{Dispatcher, Interaction, SignatureVerifier};
use crate::media::preload::LiveDecoder;
use crate::media::{MediaResolver, Preloader, ProcessRunner, SpotifyClient};
use crate::session::{EngineDeps, IdleSupervisor, NullVoiceGateway, SessionManager};
use crate::settings::SettingsCache;
use crate::storage::{Database, MetadataStore};
use crate::ui::UiUpdater;

/// Shared application state.
pub struct AppState {
    pub config: CadenceConfig,
    pub dispatcher: Dispatcher,
    pub verifier: SignatureVerifier,
    pub sessions: Arc<SessionManager>,
    pub process: Arc<ProcessRunner>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

/// The Cadence server: construction wires every component, `run` serves
/// until a shutdown signal and then cleans up.
pub struct CadenceServer {
    config: CadenceConfig,
    state: Arc<AppState>,
}

impl CadenceServer {
    pub async fn new(config: CadenceConfig) -> Result<Self> {
        config.validate()?;
        let verifier = SignatureVerifier::new(&config.discord.public_key)?;

        let database = Arc::new(Database::connect(&config.database).await?);

        let process = Arc::new(ProcessRunner::new(&config.audio));
        process.init().await?;

        let spotify = if config.spotify.is_configured() {
            Some(Arc::new(SpotifyClient::new(&config.spotify)?))
        } else {
            info!("spotify credentials not set; spotify links will be rejected");
            None
        };

        let metadata: Arc<dyn MetadataStore> = database.clone();
        let resolver = Arc::new(MediaResolver::new(
            Arc::clone(&process),
            spotify,
            Some(Arc::clone(&metadata)),
            config.audio.clone(),
        ));
        let decoder = Arc::new(LiveDecoder::new(Arc::clone(&process), &config.audio));
        let preloader = Preloader::new(decoder);

        let settings = Arc::new(SettingsCache::new(database.clone()));
        let chat = Arc::new(DiscordRestClient::new(
            &config.discord.bot_token,
            &config.discord.app_id,
        )?);
        let refs = Arc::new(MessageRefManager::new(database.clone(), chat.clone()));

        let (ui_tx, ui_rx) = UiUpdater::channel();
        let updater = UiUpdater::new(
            Arc::clone(&refs),
            Some(database.clone()),
            config.ui.clone(),
            ui_rx,
        );
        let ui_task = tokio::spawn(updater.run());

        let coordinator = StateCoordinator::new(&config.session, &config.ratelimit, ui_tx);
        let sweeper = coordinator.start_sweeper(std::time::Duration::from_secs(
            config.session.sweep_interval_secs,
        ));

        let idle = IdleSupervisor::new(
            Arc::clone(&settings),
            config.session.default_voice_timeout_minutes,
        );

        let deps = Arc::new(EngineDeps {
            resolver,
            preloader: Arc::clone(&preloader),
            queue_store: database.clone(),
            metadata: Some(metadata),
            settings: Arc::clone(&settings),
            voice: NullVoiceGateway::new(),
            coordinator: Arc::clone(&coordinator),
            chat,
            refs,
            idle: Arc::clone(&idle),
            config: config.clone(),
        });
        let sessions = SessionManager::new(deps);

        let dispatcher = Dispatcher::new(
            Arc::clone(&sessions),
            coordinator,
            settings,
            preloader,
            Arc::clone(&process),
            idle,
            database.clone(),
        );

        let state = Arc::new(AppState {
            config: config.clone(),
            dispatcher,
            verifier,
            sessions,
            process,
            background: vec![ui_task, sweeper],
        });

        Ok(Self { config, state })
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/interactions", post(interactions_handler))
            .route("/health", get(health_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(Arc::clone(&self.state))
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.address, self.config.server.port);
        info!("starting cadence on {addr}");

        let app = self.build_router();
        let listener = TcpListener::bind(&addr).await?;
        info!("cadence is ready to accept interactions on {addr}");

        let shutdown_signal = async {
            let ctrl_c = async {
                signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install signal handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                _ = terminate => info!("received SIGTERM, shutting down"),
            }
        };

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await;

        self.cleanup().await;
        info!("shutdown complete");
        result.map_err(Into::into)
    }

    /// The §-mandated order: timers and sessions first, then subprocesses,
    /// then the temp sweep.
    async fn cleanup(&self) {
        info!("stopping guild sessions");
        self.state.sessions.shutdown_all().await;

        info!("killing tracked subprocesses");
        self.state.process.shutdown();

        info!("sweeping temp directory");
        self.state.process.sweep_temp().await;

        for task in &self.state.background {
            task.abort();
        }
    }
}

async fn interactions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("X-Signature-Ed25519")
        .and_then(|v| v.to_str().ok());
    let timestamp = headers
        .get("X-Signature-Timestamp")
        .and_then(|v| v.to_str().ok());

    let verified = match (signature, timestamp) {
        (Some(signature), Some(timestamp)) => {
            state.verifier.verify(signature, timestamp, &body)
        }
        _ => false,
    };
    if !verified {
        return (StatusCode::UNAUTHORIZED, "invalid request signature").into_response();
    }

    let interaction: Interaction = match serde_json::from_slice(&body) {
        Ok(interaction) => interaction,
        Err(e) => {
            warn!("malformed interaction payload: {e}");
            return (StatusCode::BAD_REQUEST, "malformed interaction").into_response();
        }
    };

    let response = state.dispatcher.dispatch(interaction).await;
    Json(response).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.active_count(),
    }))
}
