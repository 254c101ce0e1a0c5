//! チャットソースの抽象化
//!
//! プラットフォーム固有のチャットクライアントはこのトレイトの実装として
//! 接続する。イベントは到着順のまま渡してよい（並べ替えは取り込み側の
//! 責務）。

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use crate::ingest::InboundComment;

/// ソースから届く生のチャットイベント
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommentEvent {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    /// 発行時刻（Unix秒）
    pub timestamp_sec: i64,
}

impl CommentEvent {
    /// 取り込みパイプライン向けの正規化
    pub fn into_inbound(self, platform: &str, room_id: &str) -> InboundComment {
        let published_at: DateTime<Utc> = Utc
            .timestamp_opt(self.timestamp_sec, 0)
            .single()
            .unwrap_or_else(Utc::now);
        InboundComment {
            id: self.id,
            platform: platform.to_string(),
            room_id: room_id.to_string(),
            user_id: self.user_id,
            user_name: self.user_name,
            message: self.message,
            published_at,
        }
    }
}

/// チャットイベントの供給元
#[async_trait]
pub trait CommentSource: Send {
    /// 接続先プラットフォームの識別子（例: "youtube"）
    fn platform(&self) -> &str;

    /// 監視対象の配信・ルームid
    fn room_id(&self) -> &str;

    /// 次のイベント群を受け取る。Noneはソースの終了。
    async fn next_events(&mut self) -> anyhow::Result<Option<Vec<CommentEvent>>>;
}

/// チャネル経由でイベントを注入するソース
///
/// プロセス内の別コンポーネント（テストや外部ブリッジ）からの供給に使う。
pub struct ChannelSource {
    platform: String,
    room_id: String,
    rx: mpsc::UnboundedReceiver<CommentEvent>,
}

impl ChannelSource {
    pub fn new(platform: &str, room_id: &str) -> (mpsc::UnboundedSender<CommentEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                platform: platform.to_string(),
                room_id: room_id.to_string(),
                rx,
            },
        )
    }
}

#[async_trait]
impl CommentSource for ChannelSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn next_events(&mut self) -> anyhow::Result<Option<Vec<CommentEvent>>> {
        match self.rx.recv().await {
            Some(event) => Ok(Some(vec![event])),
            None => Ok(None),
        }
    }
}

/// 標準入力からNDJSONでイベントを読むソース
///
/// 外部のチャットクライアントを `client | playq` の形で橋渡しする。
/// 1行1イベントの`CommentEvent` JSON。壊れた行は警告して読み飛ばす。
pub struct StdinSource {
    platform: String,
    room_id: String,
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
}

impl StdinSource {
    pub fn new(platform: &str, room_id: &str) -> Self {
        use tokio::io::AsyncBufReadExt;
        Self {
            platform: platform.to_string(),
            room_id: room_id.to_string(),
            lines: tokio::io::BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

#[async_trait]
impl CommentSource for StdinSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn next_events(&mut self) -> anyhow::Result<Option<Vec<CommentEvent>>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CommentEvent>(trimmed) {
                        Ok(event) => return Ok(Some(vec![event])),
                        Err(e) => {
                            tracing::warn!("⚠️ Malformed comment event skipped: {}", e);
                        }
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_inbound_converts_timestamp() {
        let event = CommentEvent {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_name: "User".to_string(),
            message: "hello".to_string(),
            timestamp_sec: 1_767_225_600, // 2026-01-01T00:00:00Z
        };
        let inbound = event.into_inbound("youtube", "room1");
        assert_eq!(inbound.platform, "youtube");
        assert_eq!(inbound.room_id, "room1");
        assert_eq!(
            inbound.published_at,
            "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_channel_source_delivers_and_closes() {
        let (tx, mut source) = ChannelSource::new("youtube", "room1");
        tx.send(CommentEvent {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            user_name: "User".to_string(),
            message: "hi".to_string(),
            timestamp_sec: 0,
        })
        .unwrap();

        let batch = source.next_events().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "c1");

        drop(tx);
        assert!(source.next_events().await.unwrap().is_none());
    }
}
