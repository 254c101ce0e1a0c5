pub mod database;
pub mod download;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod notify;
pub mod playback;
pub mod queue;
pub mod remote;
pub mod settings;
pub mod sources;

// Re-export the main error types for convenience
pub use error::{PlayqError, PlayqResult};
pub use queue::ndjson::BucketIoError;

// Re-export core domain types
pub use database::{Comment, ParsedVideo, PlayqDatabase, Request, RequestStatus, VideoMetadata};
pub use ingest::{InboundComment, IngestOutcome, Ingestor, RejectReason};
pub use playback::{PlaybackOrchestrator, PollAction, PollPhase};
pub use queue::{RequestQueue, SharedDatabase, ShuffleMode, LIVE_BUCKET};
pub use remote::{OutputCommand, OutputEvent, RemoteServer};
pub use settings::{PolicySettings, SettingsManager};
