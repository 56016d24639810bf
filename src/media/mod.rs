// Media pipeline: subprocess plumbing, catalog resolution, and decode-ahead.

pub mod preload;
pub mod process;
pub mod resolver;
pub mod spotify;

pub use preload::{PreloadState, Preloader};
pub use process::{DecodedArtifact, ProcessRunner, TrackMetadata};
pub use resolver::{MediaResolver, Resolution};
pub use spotify::SpotifyClient;
