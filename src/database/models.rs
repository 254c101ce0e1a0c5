use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// リクエストのステータス
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Validating,
    Downloading,
    Ready,
    Playing,
    Done,
    Rejected,
    Failed,
    Suspend,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Validating => "validating",
            RequestStatus::Downloading => "downloading",
            RequestStatus::Ready => "ready",
            RequestStatus::Playing => "playing",
            RequestStatus::Done => "done",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Failed => "failed",
            RequestStatus::Suspend => "suspend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RequestStatus::Queued),
            "validating" => Some(RequestStatus::Validating),
            "downloading" => Some(RequestStatus::Downloading),
            "ready" => Some(RequestStatus::Ready),
            "playing" => Some(RequestStatus::Playing),
            "done" => Some(RequestStatus::Done),
            "rejected" => Some(RequestStatus::Rejected),
            "failed" => Some(RequestStatus::Failed),
            "suspend" => Some(RequestStatus::Suspend),
            _ => None,
        }
    }

    /// アクティブ（再生候補に向かって進行中）なステータスか
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RequestStatus::Queued
                | RequestStatus::Validating
                | RequestStatus::Downloading
                | RequestStatus::Ready
                | RequestStatus::Playing
        )
    }

    /// 並べ替え操作が許可されるステータスか
    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            RequestStatus::Queued
                | RequestStatus::Validating
                | RequestStatus::Downloading
                | RequestStatus::Ready
                | RequestStatus::Done
                | RequestStatus::Suspend
        )
    }

    /// 一時停止（SUSPEND）へ遷移できるステータスか
    pub fn is_suspendable(&self) -> bool {
        matches!(
            self,
            RequestStatus::Queued
                | RequestStatus::Validating
                | RequestStatus::Downloading
                | RequestStatus::Ready
        )
    }

    /// 終端ステータス（行が削除される）か
    pub fn is_terminal_deleted(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Failed)
    }
}

/// 正規化済み動画識別子
///
/// 重複・クールダウン判定のキー。URL表記揺れに依存しない。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ParsedVideo {
    pub site: String,
    pub video_id: String,
    /// 正規化済みURL
    pub url: String,
}

/// チャットコメントモデル
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub platform: String,
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    pub published_at: DateTime<Utc>,
    /// このコメントから生成されたリクエスト（あれば）
    pub request_id: Option<String>,
    /// リクエスト削除後も残る最終ステータス
    pub request_status: Option<String>,
    pub request_reason: Option<String>,
}

/// リクエストモデル
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    /// "queue"は自動再生キュー、それ以外はストックリスト
    pub bucket: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: String,
    pub owner_name: String,
    pub message: String,
    pub raw_url: String,
    pub url: String,
    pub site: String,
    pub video_id: String,
    pub title: Option<String>,
    pub duration_sec: Option<i64>,
    pub uploader: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub thumbnail_url: Option<String>,
    pub file_name: Option<String>,
    pub cache_path: Option<String>,
    pub status: RequestStatus,
    pub reason: Option<String>,
    /// 1始まりのキュー位置。NULLは末尾扱い。
    pub queue_position: Option<i64>,
    pub play_started_at: Option<DateTime<Utc>>,
    pub play_ended_at: Option<DateTime<Utc>>,
}

impl Request {
    /// 正規化済み識別子を取得
    pub fn parsed(&self) -> ParsedVideo {
        ParsedVideo {
            site: self.site.clone(),
            video_id: self.video_id.clone(),
            url: self.url.clone(),
        }
    }
}

/// 再生ログエントリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackLogEntry {
    pub id: Option<i64>,
    pub request_id: String,
    pub title: String,
    pub url: String,
    pub played_at: DateTime<Utc>,
}

/// 外部メタデータ取得結果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub duration_sec: Option<i64>,
    pub uploader: Option<String>,
    pub upload_date_ms: Option<i64>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub thumbnail_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            RequestStatus::Queued,
            RequestStatus::Validating,
            RequestStatus::Downloading,
            RequestStatus::Ready,
            RequestStatus::Playing,
            RequestStatus::Done,
            RequestStatus::Rejected,
            RequestStatus::Failed,
            RequestStatus::Suspend,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("unknown"), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(RequestStatus::Queued.is_active());
        assert!(RequestStatus::Playing.is_active());
        assert!(!RequestStatus::Done.is_active());
        assert!(!RequestStatus::Suspend.is_active());

        assert!(RequestStatus::Done.is_editable());
        assert!(RequestStatus::Suspend.is_editable());
        assert!(!RequestStatus::Playing.is_editable());

        assert!(RequestStatus::Ready.is_suspendable());
        assert!(!RequestStatus::Done.is_suspendable());

        assert!(RequestStatus::Rejected.is_terminal_deleted());
        assert!(RequestStatus::Failed.is_terminal_deleted());
        assert!(!RequestStatus::Done.is_terminal_deleted());
    }
}
