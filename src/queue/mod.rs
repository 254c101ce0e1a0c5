//! リクエストのライフサイクルとキュー管理
//!
//! ステータス遷移の唯一のミューテーション起点（`set_status`）と、
//! バケット単位の並び順・シャッフル・SUSPEND/復帰・ストックリスト操作を提供する。

pub mod ndjson;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::{Comment, ParsedVideo, PlayqDatabase, Request, RequestStatus};
use crate::error::{PlayqError, PlayqResult};
use crate::notify::{Notice, Notifier};

/// 自動再生対象のライブキューのバケット名
pub const LIVE_BUCKET: &str = "queue";

/// 共有データベースハンドル
pub type SharedDatabase = Arc<Mutex<PlayqDatabase>>;

/// シャッフルモード（運用者がサイクリックに切り替える）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    /// 並び順の先頭を選ぶ
    #[default]
    Off,
    /// 最小キュー位置を共有するREADYから一様ランダム
    Priority,
    /// 全READYから一様ランダム
    Any,
}

impl ShuffleMode {
    /// 次のモードへ（off → priority → any → off）
    pub fn next(&self) -> Self {
        match self {
            ShuffleMode::Off => ShuffleMode::Priority,
            ShuffleMode::Priority => ShuffleMode::Any,
            ShuffleMode::Any => ShuffleMode::Off,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShuffleMode::Off => "off",
            ShuffleMode::Priority => "priority",
            ShuffleMode::Any => "any",
        }
    }
}

/// リクエストキュー
pub struct RequestQueue {
    db: SharedDatabase,
    notifier: Notifier,
}

impl RequestQueue {
    pub fn new(db: SharedDatabase, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    pub fn database(&self) -> SharedDatabase {
        Arc::clone(&self.db)
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// コメントから新しいリクエストを作成（ステータスQUEUED）
    ///
    /// `insert_front` が真なら位置1（先頭）へ、偽なら末尾へ入れる。
    /// 先頭挿入は「直近のリクエストを積み残しより優先する」意図的な仕様。
    pub fn create_request(
        &self,
        comment: &Comment,
        parsed: &ParsedVideo,
        bucket: &str,
        insert_front: bool,
    ) -> PlayqResult<Request> {
        let mut db = self.db.lock();
        let position = if insert_front {
            1
        } else {
            db.max_queue_position(bucket)?.unwrap_or(0) + 1
        };

        let now = Utc::now();
        let request = Request {
            id: Uuid::new_v4().to_string(),
            bucket: bucket.to_string(),
            created_at: now,
            updated_at: now,
            owner_id: comment.user_id.clone(),
            owner_name: comment.user_name.clone(),
            message: comment.message.clone(),
            raw_url: comment.message.clone(),
            url: parsed.url.clone(),
            site: parsed.site.clone(),
            video_id: parsed.video_id.clone(),
            title: None,
            duration_sec: None,
            uploader: None,
            view_count: None,
            like_count: None,
            comment_count: None,
            thumbnail_url: None,
            file_name: None,
            cache_path: None,
            status: RequestStatus::Queued,
            reason: None,
            queue_position: Some(position),
            play_started_at: None,
            play_ended_at: None,
        };

        db.insert_request(&request)?;
        db.link_comment_to_request(&comment.id, &request.id, RequestStatus::Queued, None)?;
        drop(db);

        info!(
            request_id = %request.id,
            site = %request.site,
            video_id = %request.video_id,
            position = position,
            "🎵 Request queued"
        );
        self.notifier
            .notify(Notice::accepted(&request.id, &request.url));

        Ok(request)
    }

    /// ステータス遷移の唯一のミューテーション起点
    ///
    /// リクエスト行を更新し、紐付くコメントへ状態を反映し、
    /// REJECTED/FAILEDでは通知を出して行を削除する。
    pub fn set_status(
        &self,
        id: &str,
        status: RequestStatus,
        reason: Option<&str>,
    ) -> PlayqResult<()> {
        let mut db = self.db.lock();
        let request = db
            .get_request(id)?
            .ok_or_else(|| PlayqError::RequestNotFound(id.to_string()))?;

        db.update_request_status(id, status, reason)?;
        db.mirror_request_state_to_comment(id, status, reason)?;

        if status.is_terminal_deleted() {
            db.delete_request(id)?;
        }
        drop(db);

        debug!(
            request_id = %id,
            from = request.status.as_str(),
            to = status.as_str(),
            reason = ?reason,
            "Status transition"
        );

        match status {
            RequestStatus::Rejected => {
                let code = reason.unwrap_or("rejected");
                self.notifier.notify(Notice::rejected(
                    code,
                    format!("リクエストは拒否されました: {}", request.url),
                ));
            }
            RequestStatus::Failed => {
                let code = reason.unwrap_or("failed");
                self.notifier.notify(Notice::failed(
                    id,
                    code,
                    format!(
                        "処理に失敗しました: {}",
                        request.title.as_deref().unwrap_or(&request.url)
                    ),
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// バケット内の全リクエストをキュー表示順で取得
    pub fn list(&self, bucket: &str) -> PlayqResult<Vec<Request>> {
        Ok(self.db.lock().list_bucket(bucket)?)
    }

    pub fn get(&self, id: &str) -> PlayqResult<Option<Request>> {
        Ok(self.db.lock().get_request(id)?)
    }

    /// シャッフルモードに従って次に再生すべきREADY行を選ぶ
    pub fn pick_next(&self, bucket: &str, mode: ShuffleMode) -> PlayqResult<Option<Request>> {
        let ready = self.db.lock().list_by_status(bucket, RequestStatus::Ready)?;
        if ready.is_empty() {
            return Ok(None);
        }

        let picked = match mode {
            ShuffleMode::Off => ready.into_iter().next(),
            ShuffleMode::Priority => {
                // list_by_statusは(queue_position NULLS LAST, created_at)順なので
                // 先頭と同じ位置を持つグループから一様に選ぶ
                let head_pos = ready[0].queue_position;
                let group: Vec<Request> = ready
                    .into_iter()
                    .take_while(|r| r.queue_position == head_pos)
                    .collect();
                let idx = rand::thread_rng().gen_range(0..group.len());
                group.into_iter().nth(idx)
            }
            ShuffleMode::Any => {
                let idx = rand::thread_rng().gen_range(0..ready.len());
                ready.into_iter().nth(idx)
            }
        };

        Ok(picked)
    }

    /// 1始まりの明示位置へ並べ替え
    ///
    /// 編集可能ステータスのみ許可。DONEの並べ替えはREADYへ昇格させる。
    pub fn reorder(&self, id: &str, position: i64) -> PlayqResult<()> {
        if position < 1 {
            return Err(PlayqError::generic("reorder", "position must be >= 1"));
        }

        let mut db = self.db.lock();
        let request = db
            .get_request(id)?
            .ok_or_else(|| PlayqError::RequestNotFound(id.to_string()))?;

        if !request.status.is_editable() {
            return Err(PlayqError::InvalidTransition {
                id: id.to_string(),
                from: request.status.as_str().to_string(),
                to: "reordered".to_string(),
            });
        }

        if request.status == RequestStatus::Done {
            db.update_request_status(id, RequestStatus::Ready, None)?;
            db.mirror_request_state_to_comment(id, RequestStatus::Ready, None)?;
        }
        db.set_queue_position(id, Some(position))?;

        debug!(request_id = %id, position = position, "Request reordered");
        Ok(())
    }

    /// SUSPENDへ遷移（QUEUED/VALIDATING/DOWNLOADING/READYのみ）
    pub fn suspend(&self, id: &str) -> PlayqResult<()> {
        {
            let db = self.db.lock();
            let request = db
                .get_request(id)?
                .ok_or_else(|| PlayqError::RequestNotFound(id.to_string()))?;
            if !request.status.is_suspendable() {
                return Err(PlayqError::InvalidTransition {
                    id: id.to_string(),
                    from: request.status.as_str().to_string(),
                    to: RequestStatus::Suspend.as_str().to_string(),
                });
            }
        }
        self.set_status(id, RequestStatus::Suspend, None)
    }

    /// SUSPENDからの復帰
    ///
    /// READYへ戻し、キュー末尾の位置とcreated_atを振り直す。
    /// 元のスロットではなくアクティブキューの最後尾に入る。
    pub fn resume(&self, id: &str) -> PlayqResult<()> {
        let mut db = self.db.lock();
        let request = db
            .get_request(id)?
            .ok_or_else(|| PlayqError::RequestNotFound(id.to_string()))?;

        if request.status != RequestStatus::Suspend {
            return Err(PlayqError::InvalidTransition {
                id: id.to_string(),
                from: request.status.as_str().to_string(),
                to: RequestStatus::Ready.as_str().to_string(),
            });
        }

        let trailing = db.max_queue_position(&request.bucket)?.unwrap_or(0) + 1;
        db.update_request_status(id, RequestStatus::Ready, None)?;
        db.mirror_request_state_to_comment(id, RequestStatus::Ready, None)?;
        db.set_queue_position(id, Some(trailing))?;
        db.refresh_created_at(id)?;

        debug!(request_id = %id, position = trailing, "Request resumed");
        Ok(())
    }

    /// リクエストを明示削除
    pub fn remove(&self, id: &str) -> PlayqResult<()> {
        let mut db = self.db.lock();
        if db.get_request(id)?.is_none() {
            return Err(PlayqError::RequestNotFound(id.to_string()));
        }
        db.delete_request(id)?;
        Ok(())
    }

    /// バケット名一覧
    pub fn buckets(&self) -> PlayqResult<Vec<String>> {
        Ok(self.db.lock().list_buckets()?)
    }

    /// ストックリストの項目をライブキューへ投入（移動ではなくコピー）
    ///
    /// コピーは新しいidでQUEUEDとして末尾に入り、重複・クールダウン
    /// チェックは通さない（運用者の明示操作のため）。
    pub fn submit_to_queue(&self, ids: &[String]) -> PlayqResult<Vec<Request>> {
        let mut db = self.db.lock();
        let mut submitted = Vec::new();

        for id in ids {
            let source = db
                .get_request(id)?
                .ok_or_else(|| PlayqError::RequestNotFound(id.clone()))?;

            let position = db.max_queue_position(LIVE_BUCKET)?.unwrap_or(0) + 1;
            let now = Utc::now();
            let copy = Request {
                id: Uuid::new_v4().to_string(),
                bucket: LIVE_BUCKET.to_string(),
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
            db.insert_request(&copy)?;
            submitted.push(copy);
        }

        info!(count = submitted.len(), "📋 Stock items submitted to live queue");
        Ok(submitted)
    }
}
