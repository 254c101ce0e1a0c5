//! コメント取り込みパイプライン
//!
//! 到着順が乱れる可能性のあるチャットイベントを、並べ替えバッファと
//! ウォーターマークで因果順に直してから、受理ガードパイプラインへ流す。
//! ストリームごとに単一ライターで呼び出すこと（内部ロックは持たない）。

pub mod guards;
pub mod url_parser;

pub use guards::{GuardInput, RejectReason};
pub use url_parser::UrlParser;

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::database::{Comment, Request};
use crate::error::{PlayqError, PlayqResult};
use crate::notify::Notice;
use crate::queue::{RequestQueue, LIVE_BUCKET};
use crate::settings::{CustomSiteRule, PolicySettings};

/// 並べ替えバッファのデフォルトウィンドウ（秒）
pub const DEFAULT_REORDER_WINDOW_SEC: i64 = 5;

/// 取り込み前の正規化済みイベント
#[derive(Debug, Clone)]
pub struct InboundComment {
    pub id: String,
    pub platform: String,
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    pub published_at: DateTime<Utc>,
}

impl InboundComment {
    /// id・タイムスタンプ省略時の補完付きコンストラクタ
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message: &str,
        platform: &str,
        room_id: &str,
        user_id: &str,
        user_name: &str,
        published_at: Option<DateTime<Utc>>,
        comment_id: Option<String>,
    ) -> Self {
        Self {
            id: comment_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            platform: platform.to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            message: message.to_string(),
            published_at: published_at.unwrap_or_else(Utc::now),
        }
    }
}

/// アンケート投票（取り込みの副チャンネル）
#[derive(Debug, Clone, PartialEq)]
pub struct PollVote {
    pub voter_id: String,
    pub yes: bool,
}

/// 取り込み結果
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub comment: Comment,
    pub request: Option<Request>,
    pub warning: Option<RejectReason>,
    pub poll_vote: Option<PollVote>,
}

/// ネットワーク起因の順序乱れを吸収する並べ替えバッファ
///
/// 最初のイベント到着で「取り込み開始時刻」が開き、発行時刻がその
/// ウィンドウ内にあるイベントはバッファされる。ウィンドウ外の発行時刻を
/// 持つイベントの到着、またはウィンドウの経過でフラッシュされ、
/// (発行時刻, 到着時刻)でソートした順に適用される。
#[derive(Debug)]
pub struct ReorderBuffer {
    window: Duration,
    opened_at: Option<DateTime<Utc>>,
    pending: Vec<(InboundComment, DateTime<Utc>)>,
}

impl ReorderBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            opened_at: None,
            pending: Vec::new(),
        }
    }

    /// イベントを差し出し、適用可能になったイベント列を返す
    pub fn offer(&mut self, event: InboundComment, now: DateTime<Utc>) -> Vec<InboundComment> {
        let mut ready = Vec::new();

        match self.opened_at {
            None => {
                self.opened_at = Some(now);
            }
            Some(opened) => {
                if event.published_at - opened > self.window {
                    ready = self.drain_sorted();
                    self.opened_at = Some(now);
                }
            }
        }

        trace!(comment_id = %event.id, buffered = self.pending.len() + 1, "Comment buffered");
        self.pending.push((event, now));
        ready
    }

    /// ウィンドウが経過していればフラッシュ
    pub fn flush_due(&mut self, now: DateTime<Utc>) -> Vec<InboundComment> {
        match self.opened_at {
            Some(opened) if now - opened >= self.window => {
                let ready = self.drain_sorted();
                self.opened_at = None;
                ready
            }
            _ => Vec::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn drain_sorted(&mut self) -> Vec<InboundComment> {
        let mut drained: Vec<(InboundComment, DateTime<Utc>)> = self.pending.drain(..).collect();
        drained.sort_by_key(|(event, arrived)| (event.published_at, *arrived));
        drained.into_iter().map(|(event, _)| event).collect()
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_REORDER_WINDOW_SEC))
    }
}

/// コメント取り込み器
///
/// ウォーターマークとid別最終処理時刻で重複・再送を破棄し、
/// 受理パイプラインを通してリクエストを生成する。
pub struct Ingestor {
    queue: Arc<RequestQueue>,
    buffer: ReorderBuffer,
    /// この時刻より古い発行時刻のイベントは処理済みとみなして破棄
    watermark: Option<DateTime<Utc>>,
    /// コメントid → 最後に処理した発行時刻
    seen: HashMap<String, DateTime<Utc>>,
    /// 取り込みの管理者一時停止
    paused: bool,
    /// カスタムサイト規則のキャッシュ（規則が変わったら作り直す）
    parser_cache: (Vec<CustomSiteRule>, UrlParser),
}

impl Ingestor {
    pub fn new(queue: Arc<RequestQueue>) -> Self {
        Self {
            queue,
            buffer: ReorderBuffer::default(),
            watermark: None,
            seen: HashMap::new(),
            paused: false,
            parser_cache: (Vec::new(), UrlParser::default()),
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// ライブソースからのイベントをバッファ経由で差し出す
    ///
    /// 適用可能になったイベントごとの取り込み結果を返す。
    pub fn offer(
        &mut self,
        event: InboundComment,
        now: DateTime<Utc>,
        policy: &PolicySettings,
        allow_request_creation: bool,
    ) -> Vec<PlayqResult<Option<IngestOutcome>>> {
        let ready = self.buffer.offer(event, now);
        self.process_batch(ready, policy, allow_request_creation)
    }

    /// タイマーtickからのフラッシュ
    pub fn flush_due(
        &mut self,
        now: DateTime<Utc>,
        policy: &PolicySettings,
        allow_request_creation: bool,
    ) -> Vec<PlayqResult<Option<IngestOutcome>>> {
        let ready = self.buffer.flush_due(now);
        self.process_batch(ready, policy, allow_request_creation)
    }

    fn process_batch(
        &mut self,
        events: Vec<InboundComment>,
        policy: &PolicySettings,
        allow_request_creation: bool,
    ) -> Vec<PlayqResult<Option<IngestOutcome>>> {
        events
            .into_iter()
            .map(|event| self.ingest(event, policy, allow_request_creation))
            .collect()
    }

    /// 単一イベントの取り込み（バッファを経由しない直接経路）
    ///
    /// 戻り値`None`は重複・再送として破棄されたことを示す。
    pub fn ingest(
        &mut self,
        event: InboundComment,
        policy: &PolicySettings,
        allow_request_creation: bool,
    ) -> PlayqResult<Option<IngestOutcome>> {
        if event.message.trim().is_empty() {
            return Err(PlayqError::EmptyMessage);
        }

        // ウォーターマークより古いイベントは処理済み
        if let Some(watermark) = self.watermark {
            if event.published_at < watermark {
                trace!(comment_id = %event.id, "Stale comment discarded (before watermark)");
                return Ok(None);
            }
        }

        // 同一idが同時刻以降で処理済みなら再送
        if let Some(&seen_at) = self.seen.get(&event.id) {
            if seen_at >= event.published_at {
                trace!(comment_id = %event.id, "Duplicate comment discarded");
                return Ok(None);
            }
        }

        self.watermark = Some(match self.watermark {
            Some(watermark) => watermark.max(event.published_at),
            None => event.published_at,
        });
        self.seen.insert(event.id.clone(), event.published_at);

        // ウォーターマーク未満はそもそも処理されないので、記録を間引く
        if let Some(watermark) = self.watermark {
            self.seen.retain(|_, seen_at| *seen_at >= watermark);
        }

        let comment = Comment {
            id: event.id.clone(),
            platform: event.platform.clone(),
            room_id: event.room_id.clone(),
            user_id: event.user_id.clone(),
            user_name: event.user_name.clone(),
            message: event.message.clone(),
            published_at: event.published_at,
            request_id: None,
            request_status: None,
            request_reason: None,
        };

        let db = self.queue.database();
        let inserted = db.lock().insert_comment(&comment)?;
        if !inserted {
            // 再起動後の再送はDB側の冪等性で落とす
            trace!(comment_id = %comment.id, "Comment already persisted, discarded");
            return Ok(None);
        }

        // アンケート投票の副チャンネル
        let poll_vote = policy.parse_poll_vote(&event.message).map(|yes| PollVote {
            voter_id: event.user_id.clone(),
            yes,
        });

        let mut outcome = IngestOutcome {
            comment,
            request: None,
            warning: None,
            poll_vote,
        };

        if !allow_request_creation || self.paused {
            return Ok(Some(outcome));
        }

        self.refresh_parser(policy);
        if !self.parser_cache.1.contains_url(&event.message) {
            // URLを含まない通常チャットはリクエスト試行ではない
            return Ok(Some(outcome));
        }

        let parsed = match self.parser_cache.1.extract(&event.message) {
            Some(parsed) => parsed,
            None => {
                self.reject(&mut outcome, RejectReason::InvalidUrl)?;
                return Ok(Some(outcome));
            }
        };

        let rejection = {
            let db = db.lock();
            let input = GuardInput {
                db: &db,
                policy,
                parsed: &parsed,
                owner_id: &event.user_id,
            };
            guards::evaluate(&input)?
        };

        if let Some(reason) = rejection {
            self.reject(&mut outcome, reason)?;
            return Ok(Some(outcome));
        }

        let request =
            self.queue
                .create_request(&outcome.comment, &parsed, LIVE_BUCKET, policy.insert_front)?;
        debug!(comment_id = %outcome.comment.id, request_id = %request.id, "✅ Comment accepted as request");
        outcome.comment.request_id = Some(request.id.clone());
        outcome.comment.request_status = Some(request.status.as_str().to_string());
        outcome.request = Some(request);

        Ok(Some(outcome))
    }

    /// 拒否の痕跡をコメントへ記録し、ユーザー通知を出す
    fn reject(&self, outcome: &mut IngestOutcome, reason: RejectReason) -> PlayqResult<()> {
        let db = self.queue.database();
        db.lock()
            .mark_comment_rejected(&outcome.comment.id, reason.code())?;
        outcome.comment.request_status = Some("rejected".to_string());
        outcome.comment.request_reason = Some(reason.code().to_string());
        outcome.warning = Some(reason);

        self.queue
            .notifier()
            .notify(Notice::rejected(reason.code(), reason.user_message()));
        Ok(())
    }

    fn refresh_parser(&mut self, policy: &PolicySettings) {
        if self.parser_cache.0 != policy.custom_sites {
            self.parser_cache = (
                policy.custom_sites.clone(),
                UrlParser::new(&policy.custom_sites),
            );
        }
    }
}
