//! ユーザー向け通知チャンネル
//!
//! 受理・拒否・再生開始などの構造化通知をブロードキャストする。
//! 受信側はリモート出力サーバー（オーバーレイ表示）とテストコード。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// 通知の種別
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeKind {
    /// リクエスト受理
    Accepted,
    /// ポリシー拒否（理由コード付き）
    Rejected,
    /// ダウンロード・再生失敗
    Failed,
    /// 再生開始バナー（タイトル/URL）
    NowPlaying,
    /// 再生開始の統計バナー（再生数など）
    PlayingStats,
    /// アンケート質問の提示
    PollQuestion,
    /// アンケート結果
    PollResult,
}

/// 構造化通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub request_id: Option<String>,
    /// 拒否・失敗の理由コード
    pub reason: Option<String>,
    /// 表示用テキスト
    pub message: String,
}

impl Notice {
    pub fn accepted(request_id: &str, title: &str) -> Self {
        Self {
            kind: NoticeKind::Accepted,
            request_id: Some(request_id.to_string()),
            reason: None,
            message: format!("リクエストを受け付けました: {}", title),
        }
    }

    pub fn rejected(reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Rejected,
            request_id: None,
            reason: Some(reason_code.to_string()),
            message: message.into(),
        }
    }

    pub fn failed(request_id: &str, reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Failed,
            request_id: Some(request_id.to_string()),
            reason: Some(reason_code.to_string()),
            message: message.into(),
        }
    }
}

/// 通知送信ハンドル
///
/// 受信者がいない場合の送信失敗は無視する（通知は表示専用であり、
/// スケジューラの進行を妨げてはならない）。
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn notify(&self, notice: Notice) {
        tracing::debug!(kind = ?notice.kind, reason = ?notice.reason, "📢 Notice: {}", notice.message);
        let _ = self.tx.send(notice);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notice_broadcast() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.notify(Notice::rejected("cooldown", "しばらく待ってください"));

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, NoticeKind::Rejected);
        assert_eq!(notice.reason.as_deref(), Some("cooldown"));
    }

    #[test]
    fn test_notify_without_receiver_does_not_panic() {
        let notifier = Notifier::new(8);
        notifier.notify(Notice::accepted("r1", "Some Video"));
    }
}
