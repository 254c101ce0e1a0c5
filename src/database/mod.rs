pub mod crud;
pub mod models;

pub use models::*;

use anyhow::Result;
use directories::ProjectDirs;
use std::path::Path;
use std::path::PathBuf;

/// playq用データベース接続管理
pub struct PlayqDatabase {
    pub connection: rusqlite::Connection,
    pub schema_version: u32,
}

impl PlayqDatabase {
    /// 新しいデータベース接続を作成
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let connection = rusqlite::Connection::open(db_path)?;
        let mut db = Self {
            connection,
            schema_version: 1,
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// インメモリデータベースを作成（テスト用）
    pub fn new_in_memory() -> Result<Self> {
        let connection = rusqlite::Connection::open_in_memory()?;
        let mut db = Self {
            connection,
            schema_version: 1,
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// データベーススキーマを初期化
    fn initialize_schema(&mut self) -> Result<()> {
        self.connection.execute_batch(include_str!("schema.sql"))?;
        tracing::info!("Database schema initialized successfully");
        Ok(())
    }
}

/// XDGデータディレクトリからデータベースパスを取得
pub fn get_database_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("dev", "sifyfy", "playq")
        .ok_or_else(|| anyhow::anyhow!("Failed to get project directories"))?;

    let data_dir = project_dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    Ok(data_dir.join("playq.db"))
}
