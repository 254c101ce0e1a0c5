//! ストックリストのNDJSONエクスポート/インポート
//!
//! 1行1リクエストのJSONとして保存・復元する。

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use super::RequestQueue;
use crate::database::{Request, RequestStatus};

/// バケット入出力のエラー型
#[derive(Error, Debug)]
pub enum BucketIoError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error at line {line}: {source}")]
    JsonParse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("No valid entries found in {path}")]
    NoData { path: String },

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl RequestQueue {
    /// バケットの内容をNDJSONファイルへ書き出す
    pub fn export_bucket<P: AsRef<Path>>(
        &self,
        bucket: &str,
        path: P,
    ) -> Result<usize, BucketIoError> {
        let requests = self.database().lock().list_bucket(bucket)?;

        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        for request in &requests {
            let line = serde_json::to_string(request).map_err(|e| BucketIoError::JsonParse {
                line: 0,
                source: e,
            })?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;

        tracing::info!(
            bucket = bucket,
            count = requests.len(),
            path = %path.as_ref().display(),
            "📁 Bucket exported"
        );
        Ok(requests.len())
    }

    /// NDJSONファイルからバケットへ取り込む
    ///
    /// 各エントリは新しいidで、指定バケットにQUEUEDとして末尾に入る。
    /// キャッシュ・再生関連のフィールドは引き継がない。
    pub fn import_bucket<P: AsRef<Path>>(
        &self,
        bucket: &str,
        path: P,
    ) -> Result<Vec<Request>, BucketIoError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);

        let mut entries: Vec<Request> = Vec::new();
        for (line_number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: Request =
                serde_json::from_str(&line).map_err(|e| BucketIoError::JsonParse {
                    line: line_number + 1,
                    source: e,
                })?;
            entries.push(entry);
        }

        if entries.is_empty() {
            return Err(BucketIoError::NoData {
                path: path.as_ref().display().to_string(),
            });
        }

        let db = self.database();
        let mut db = db.lock();
        let mut imported = Vec::new();
        let mut position = db.max_queue_position(bucket)?.unwrap_or(0);

        for source in entries {
            position += 1;
            let now = Utc::now();
            let request = Request {
                id: Uuid::new_v4().to_string(),
                bucket: bucket.to_string(),
                created_at: now,
                updated_at: now,
                status: RequestStatus::Queued,
                reason: None,
                queue_position: Some(position),
                file_name: None,
                cache_path: None,
                play_started_at: None,
                play_ended_at: None,
                ..source
            };
            db.insert_request(&request)?;
            imported.push(request);
        }

        tracing::info!(
            bucket = bucket,
            count = imported.len(),
            "📁 Bucket imported"
        );
        Ok(imported)
    }
}
