//! 継続アンケートの状態機械
//!
//! 再生が一定時間続いたら「続行しますか？」を出し、投票期間の
//! 集計で続行/停止を決める。時刻は外から渡す純粋な状態機械で、
//! 実際の通知・スキップは呼び出し側（オーケストレーター）が行う。

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::settings::PollSettings;

/// アンケートのフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// 再生していない、またはアンケート無効
    Idle,
    /// 質問を出す時刻待ち
    AwaitingQuestion { ask_at: DateTime<Utc> },
    /// 投票受付中
    Voting { deadline: DateTime<Utc> },
    /// 停止決定済み、猶予後に強制スキップ
    Resolved { act_at: DateTime<Utc> },
}

/// advance()が呼び出し側に要求するアクション
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    /// 質問を告知して投票を開始した
    AskQuestion,
    /// 投票が締め切られた
    Result {
        continue_playback: bool,
        yes: usize,
        no: usize,
    },
    /// 停止猶予が過ぎた。現在の再生を強制スキップする
    ForceSkip,
}

/// 継続アンケート
pub struct ContinuationPoll {
    settings: PollSettings,
    phase: PollPhase,
    /// 投票者id → 賛成か。同一投票者は上書き。
    votes: HashMap<String, bool>,
}

impl ContinuationPoll {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            settings,
            phase: PollPhase::Idle,
            votes: HashMap::new(),
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn update_settings(&mut self, settings: PollSettings) {
        if !settings.enabled {
            self.phase = PollPhase::Idle;
            self.votes.clear();
        }
        self.settings = settings;
    }

    /// 再生開始。有効なら次の質問をスケジュールする。
    pub fn on_playback_started(&mut self, now: DateTime<Utc>) {
        self.votes.clear();
        self.phase = if self.settings.enabled {
            PollPhase::AwaitingQuestion {
                ask_at: now + Duration::seconds(self.settings.interval_sec as i64),
            }
        } else {
            PollPhase::Idle
        };
    }

    /// 再生終了・スキップ。アンケートを破棄する。
    pub fn on_playback_stopped(&mut self) {
        self.phase = PollPhase::Idle;
        self.votes.clear();
    }

    /// 投票を記録（投票受付中のみ有効）
    pub fn record_vote(&mut self, voter_id: &str, yes: bool) {
        if matches!(self.phase, PollPhase::Voting { .. }) {
            self.votes.insert(voter_id.to_string(), yes);
        }
    }

    /// 時間を進め、必要なアクションを返す
    ///
    /// 締め切り時の集計は賛成>=反対で続行（同数・無投票は続行側）。
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<PollAction> {
        match self.phase {
            PollPhase::Idle => None,
            PollPhase::AwaitingQuestion { ask_at } => {
                if now < ask_at {
                    return None;
                }
                self.votes.clear();
                self.phase = PollPhase::Voting {
                    deadline: now + Duration::seconds(self.settings.window_sec as i64),
                };
                Some(PollAction::AskQuestion)
            }
            PollPhase::Voting { deadline } => {
                if now < deadline {
                    return None;
                }
                let yes = self.votes.values().filter(|v| **v).count();
                let no = self.votes.len() - yes;
                let continue_playback = yes >= no;

                self.phase = if continue_playback {
                    PollPhase::AwaitingQuestion {
                        ask_at: now + Duration::seconds(self.settings.interval_sec as i64),
                    }
                } else {
                    PollPhase::Resolved {
                        act_at: now + Duration::seconds(self.settings.stop_delay_sec as i64),
                    }
                };
                self.votes.clear();
                Some(PollAction::Result {
                    continue_playback,
                    yes,
                    no,
                })
            }
            PollPhase::Resolved { act_at } => {
                if now < act_at {
                    return None;
                }
                self.phase = PollPhase::Idle;
                Some(PollAction::ForceSkip)
            }
        }
    }
}
