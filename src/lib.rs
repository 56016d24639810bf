// Cadence library surface
// Exports the core components for embedding and integration tests.

pub mod chat;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod interactions;
pub mod media;
pub mod model;
pub mod queue;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;
pub mod ui;

pub mod test_utils;

// Re-export commonly used types
pub use chat::{ChatApi, MessageRefManager};
pub use config::CadenceConfig;
pub use coordinator::StateCoordinator;
pub use error::{Error, ErrorCode, Result};
pub use interactions::{Dispatcher, SignatureVerifier};
pub use media::{MediaResolver, Preloader, ProcessRunner};
pub use model::{GuildSettings, PlayIntent, SessionSnapshot, SongRecord};
pub use server::{AppState, CadenceServer};
pub use session::{Command, SessionManager, VoiceGateway};
