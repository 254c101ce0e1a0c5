//! playq全体のエラー型定義

use std::path::PathBuf;

/// playq共通のResult型
pub type PlayqResult<T> = Result<T, PlayqError>;

/// playqのドメインエラー
#[derive(thiserror::Error, Debug)]
pub enum PlayqError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Empty message")]
    EmptyMessage,

    #[error("Invalid status transition: {id} {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Metadata fetch failed: {0}")]
    MetadataFetch(String),

    #[error("Downloader failed: {0}")]
    Downloader(String),

    #[error("No playable artifact produced under {0}")]
    NoPlayableArtifact(PathBuf),

    #[error("Cache entry missing for request {0}")]
    CacheMissing(String),

    #[error("Playback not possible: {0}")]
    Playback(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlayqError {
    /// 汎用エラーを作成（テスト・境界層用）
    pub fn generic(context: &str, message: &str) -> Self {
        Self::Other(anyhow::anyhow!("{}: {}", context, message))
    }
}
