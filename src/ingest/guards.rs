//! リクエスト受理ガードパイプライン
//!
//! 受理/拒否判定を名前付きガードの明示的な順序付きリストとして表現する。
//! 拒否理由の優先順位は制御フローではなくこのリストの順序で決まる。

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::database::{ParsedVideo, PlayqDatabase};
use crate::settings::PolicySettings;

/// 拒否理由コード
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    InvalidUrl,
    SiteDisabled,
    DuplicateInQueue,
    Cooldown,
    NgUser,
    ConcurrentLimit,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidUrl => "invalid-url",
            RejectReason::SiteDisabled => "site-disabled",
            RejectReason::DuplicateInQueue => "duplicate-in-queue",
            RejectReason::Cooldown => "cooldown",
            RejectReason::NgUser => "ng-user",
            RejectReason::ConcurrentLimit => "concurrent-limit",
        }
    }

    /// ユーザー向け表示文
    pub fn user_message(&self) -> &'static str {
        match self {
            RejectReason::InvalidUrl => "URLを解釈できませんでした",
            RejectReason::SiteDisabled => "このサイトは現在受け付けていません",
            RejectReason::DuplicateInQueue => "同じ動画がすでにキューにあります",
            RejectReason::Cooldown => "この動画は最近再生されたため、しばらく受け付けません",
            RejectReason::NgUser => "リクエストを受け付けられません",
            RejectReason::ConcurrentLimit => "同時リクエスト数の上限に達しています",
        }
    }
}

/// ガードへの入力
pub struct GuardInput<'a> {
    pub db: &'a PlayqDatabase,
    pub policy: &'a PolicySettings,
    pub parsed: &'a ParsedVideo,
    pub owner_id: &'a str,
}

type GuardFn = fn(&GuardInput) -> Result<Option<RejectReason>>;

/// ガードの評価順序
///
/// URL解釈（invalid-url）はパイプラインに入る前の抽出段階で判定済み。
const GUARDS: &[(&str, GuardFn)] = &[
    ("site-allowed", guard_site_allowed),
    ("duplicate-in-queue", guard_duplicate),
    ("cooldown", guard_cooldown),
    ("ng-user", guard_ng_user),
    ("concurrent-limit", guard_concurrent_limit),
];

/// 全ガードを順に評価し、最初の拒否理由を返す
pub fn evaluate(input: &GuardInput) -> Result<Option<RejectReason>> {
    for (name, guard) in GUARDS {
        if let Some(reason) = guard(input)? {
            tracing::debug!(guard = name, reason = reason.code(), "🚫 Request rejected");
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

fn guard_site_allowed(input: &GuardInput) -> Result<Option<RejectReason>> {
    if input.policy.is_site_allowed(&input.parsed.site) {
        Ok(None)
    } else {
        Ok(Some(RejectReason::SiteDisabled))
    }
}

fn guard_duplicate(input: &GuardInput) -> Result<Option<RejectReason>> {
    if !input.policy.disallow_duplicates {
        return Ok(None);
    }
    if input
        .db
        .has_active_identity(&input.parsed.site, &input.parsed.video_id)?
    {
        Ok(Some(RejectReason::DuplicateInQueue))
    } else {
        Ok(None)
    }
}

fn guard_cooldown(input: &GuardInput) -> Result<Option<RejectReason>> {
    if input.policy.cooldown_minutes == 0 {
        return Ok(None);
    }
    if let Some(played_at) = input.db.last_played_at(&input.parsed.url)? {
        let cooldown = Duration::minutes(i64::from(input.policy.cooldown_minutes));
        if Utc::now() - played_at < cooldown {
            return Ok(Some(RejectReason::Cooldown));
        }
    }
    Ok(None)
}

fn guard_ng_user(input: &GuardInput) -> Result<Option<RejectReason>> {
    if input
        .policy
        .ng_user_ids
        .iter()
        .any(|id| id == input.owner_id)
    {
        Ok(Some(RejectReason::NgUser))
    } else {
        Ok(None)
    }
}

fn guard_concurrent_limit(input: &GuardInput) -> Result<Option<RejectReason>> {
    if input.policy.owner_concurrent_limit == 0 {
        return Ok(None);
    }
    let active = input.db.count_owner_active(input.owner_id)?;
    if active >= i64::from(input.policy.owner_concurrent_limit) {
        Ok(Some(RejectReason::ConcurrentLimit))
    } else {
        Ok(None)
    }
}
