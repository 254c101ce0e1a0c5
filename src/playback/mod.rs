//! 再生オーケストレーター
//!
//! 「PLAYINGは常に1件以下」の不変条件を守りながら、READY行の
//! 再生開始・終了・スキップ・自動連続再生を進める。実際の音声出力は
//! リモートプレイヤーに委ね、ここではコマンド送信と状態管理だけを行う。
//!
//! 時刻はすべて引数で受け取る。tickループが壁時計を渡し、テストは
//! 任意の時刻を注入する。

pub mod poll;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::database::{PlaybackLogEntry, Request, RequestStatus};
use crate::error::{PlayqError, PlayqResult};
use crate::notify::{Notice, NoticeKind, Notifier};
use crate::queue::{RequestQueue, ShuffleMode, LIVE_BUCKET};
use crate::remote::{OutputCommand, OutputEvent};
use crate::settings::SettingsManager;

pub use poll::{ContinuationPoll, PollAction, PollPhase};

/// 再生中トラックのスナップショット
#[derive(Debug, Clone)]
pub struct NowPlaying {
    pub request_id: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
}

struct CurrentPlayback {
    request_id: String,
    title: String,
    started_at: DateTime<Utc>,
    /// 最後に再生が（再）開始された時刻
    segment_started_at: DateTime<Utc>,
    /// 一時停止までに消化した秒数
    accumulated_sec: f64,
    /// メタデータ由来の長さ（位置の上限）
    duration_sec: Option<i64>,
    paused: bool,
}

struct PlayerState {
    current: Option<CurrentPlayback>,
    autoplay: bool,
    shuffle: ShuffleMode,
}

/// 再生オーケストレーター
pub struct PlaybackOrchestrator {
    queue: Arc<RequestQueue>,
    notifier: Notifier,
    settings: Arc<SettingsManager>,
    commands: mpsc::UnboundedSender<OutputCommand>,
    state: Mutex<PlayerState>,
    poll: Mutex<ContinuationPoll>,
}

impl PlaybackOrchestrator {
    pub fn new(
        queue: Arc<RequestQueue>,
        settings: Arc<SettingsManager>,
        commands: mpsc::UnboundedSender<OutputCommand>,
    ) -> Self {
        let poll_settings = settings.load_or_default().poll;
        let notifier = queue.notifier();
        Self {
            queue,
            notifier,
            settings,
            commands,
            state: Mutex::new(PlayerState {
                current: None,
                autoplay: true,
                shuffle: ShuffleMode::Off,
            }),
            poll: Mutex::new(ContinuationPoll::new(poll_settings)),
        }
    }

    /// 起動時リカバリ: 前回セッションのPLAYING残骸をREADYへ、
    /// 中断されたVALIDATING/DOWNLOADINGをQUEUEDへ戻す
    pub fn recover(&self) -> PlayqResult<()> {
        let db = self.queue.database();
        let mut db = db.lock();
        let mut demoted = 0;
        for bucket in db.list_buckets()? {
            demoted += db.demote_playing(&bucket)?;
        }
        if demoted > 0 {
            info!(count = demoted, "♻️ Stale playing rows demoted to ready");
        }
        let requeued = db.reset_in_flight_downloads()?;
        if requeued > 0 {
            info!(count = requeued, "♻️ Interrupted downloads requeued");
        }
        Ok(())
    }

    pub fn set_autoplay(&self, enabled: bool, now: DateTime<Utc>) -> PlayqResult<()> {
        self.state.lock().autoplay = enabled;
        info!(enabled = enabled, "Autoplay toggled");
        if enabled {
            self.advance_if_idle(now)?;
        }
        Ok(())
    }

    pub fn autoplay(&self) -> bool {
        self.state.lock().autoplay
    }

    /// シャッフルモードをサイクリックに切り替え、新モードを返す
    pub fn cycle_shuffle(&self) -> ShuffleMode {
        let mut state = self.state.lock();
        state.shuffle = state.shuffle.next();
        info!(mode = state.shuffle.as_str(), "🔀 Shuffle mode changed");
        state.shuffle
    }

    pub fn shuffle_mode(&self) -> ShuffleMode {
        self.state.lock().shuffle
    }

    /// 再生中トラックのスナップショット
    pub fn current(&self) -> Option<NowPlaying> {
        self.state.lock().current.as_ref().map(|c| NowPlaying {
            request_id: c.request_id.clone(),
            title: c.title.clone(),
            started_at: c.started_at,
        })
    }

    /// 壁時計ベースの再生位置（秒、動画の長さが分かる場合はそこで頭打ち）
    pub fn position_sec(&self, now: DateTime<Utc>) -> Option<f64> {
        let state = self.state.lock();
        state.current.as_ref().map(|c| {
            let position = if c.paused {
                c.accumulated_sec
            } else {
                let elapsed = (now - c.segment_started_at).num_milliseconds() as f64 / 1000.0;
                c.accumulated_sec + elapsed.max(0.0)
            };
            match c.duration_sec {
                Some(duration) => position.min(duration as f64),
                None => position,
            }
        })
    }

    /// 指定リクエストの再生を開始
    ///
    /// READYまたはDONEのみ再生できる。キャッシュが消えていた場合は
    /// QUEUEDへ戻して再ダウンロードに回し、エラーを返す。
    /// 既存のPLAYING行は先にREADYへ降格してから昇格する。
    pub fn play(&self, id: &str, now: DateTime<Utc>) -> PlayqResult<()> {
        let request = self
            .queue
            .get(id)?
            .ok_or_else(|| PlayqError::RequestNotFound(id.to_string()))?;

        if !matches!(request.status, RequestStatus::Ready | RequestStatus::Done) {
            return Err(PlayqError::InvalidTransition {
                id: id.to_string(),
                from: request.status.as_str().to_string(),
                to: RequestStatus::Playing.as_str().to_string(),
            });
        }

        let media_path = self.resolve_media_path(&request)?;
        if !media_path.exists() {
            warn!(
                request_id = %id,
                path = %media_path.display(),
                "💾 Cache vanished, requeueing for re-download"
            );
            self.queue.set_status(id, RequestStatus::Queued, None)?;
            return Err(PlayqError::CacheMissing(id.to_string()));
        }

        let policy = self.settings.load_or_default();
        let title = request
            .title
            .clone()
            .unwrap_or_else(|| request.url.clone());

        {
            let db = self.queue.database();
            let mut db = db.lock();
            for bucket in db.list_buckets()? {
                db.demote_playing(&bucket)?;
            }
        }

        self.queue.set_status(id, RequestStatus::Playing, None)?;

        let play_count = {
            let db = self.queue.database();
            let mut db = db.lock();
            db.set_play_started(id, now)?;
            db.append_playback_log(&PlaybackLogEntry {
                id: None,
                request_id: id.to_string(),
                title: title.clone(),
                url: request.url.clone(),
                played_at: now,
            })?;
            db.count_plays(&request.url)?
        };

        self.send(OutputCommand::Play {
            request_id: id.to_string(),
            media_url: format!("file://{}", media_path.display()),
            title: title.clone(),
            requester: request.owner_name.clone(),
            volume: policy.playback.volume,
            looped: policy.playback.looped,
        });

        self.notifier.notify(Notice {
            kind: NoticeKind::NowPlaying,
            request_id: Some(id.to_string()),
            reason: None,
            message: format!("▶️ {} (リクエスト: {})", title, request.owner_name),
        });
        self.notifier.notify(Notice {
            kind: NoticeKind::PlayingStats,
            request_id: Some(id.to_string()),
            reason: None,
            message: format!("この動画は{}回目の再生です", play_count),
        });

        let mut poll = self.poll.lock();
        poll.update_settings(policy.poll);
        poll.on_playback_started(now);
        drop(poll);

        self.state.lock().current = Some(CurrentPlayback {
            request_id: id.to_string(),
            title,
            started_at: now,
            segment_started_at: now,
            accumulated_sec: 0.0,
            duration_sec: request.duration_sec,
            paused: false,
        });

        info!(request_id = %id, "▶️ Playback started");
        Ok(())
    }

    /// 現在の再生をスキップ（DONEへ）
    pub fn skip(&self, now: DateTime<Utc>) -> PlayqResult<()> {
        self.finish_current(RequestStatus::Done, None, now)?;
        self.send(OutputCommand::Stop { fade_ms: 300 });
        self.advance_if_idle(now)
    }

    /// 再生中のリクエストをキューから削除
    pub fn delete_current(&self, now: DateTime<Utc>) -> PlayqResult<()> {
        let id = match self.finish_current(RequestStatus::Done, None, now)? {
            Some(id) => id,
            None => return Ok(()),
        };
        self.queue.remove(&id)?;
        self.send(OutputCommand::Stop { fade_ms: 300 });
        self.advance_if_idle(now)
    }

    /// プレイヤーからのコールバックを処理
    pub fn on_player_event(&self, event: OutputEvent, now: DateTime<Utc>) -> PlayqResult<()> {
        match event {
            OutputEvent::Ended { request_id } => {
                debug!(request_id = %request_id, "Playback ended by player");
                if self.is_current(&request_id) {
                    self.finish_current(RequestStatus::Done, None, now)?;
                    self.advance_if_idle(now)?;
                }
            }
            OutputEvent::Error {
                request_id,
                message,
            } => {
                warn!(request_id = %request_id, "❌ Player reported error: {}", message);
                if self.is_current(&request_id) {
                    self.finish_current(RequestStatus::Failed, Some("playback-error"), now)?;
                    self.advance_if_idle(now)?;
                }
            }
        }
        Ok(())
    }

    pub fn pause(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.as_mut() {
            if !current.paused {
                let elapsed =
                    (now - current.segment_started_at).num_milliseconds() as f64 / 1000.0;
                current.accumulated_sec += elapsed.max(0.0);
                current.paused = true;
                drop(state);
                self.send(OutputCommand::Pause);
            }
        }
    }

    pub fn resume(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.as_mut() {
            if current.paused {
                current.segment_started_at = now;
                current.paused = false;
                drop(state);
                self.send(OutputCommand::Resume);
            }
        }
    }

    pub fn seek(&self, position_sec: f64, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(current) = state.current.as_mut() {
            current.accumulated_sec = position_sec.max(0.0);
            current.segment_started_at = now;
            drop(state);
            self.send(OutputCommand::Seek { position_sec });
        }
    }

    /// コメント中のアンケート投票を記録
    pub fn record_vote(&self, voter_id: &str, yes: bool) {
        self.poll.lock().record_vote(voter_id, yes);
    }

    /// 定期tick: アンケートの進行と自動再生の穴埋め
    pub fn tick(&self, now: DateTime<Utc>) -> PlayqResult<()> {
        let action = self.poll.lock().advance(now);
        match action {
            Some(PollAction::AskQuestion) => {
                self.notifier.notify(Notice {
                    kind: NoticeKind::PollQuestion,
                    request_id: None,
                    reason: None,
                    message: "この曲の再生を続けますか？（yes / no）".to_string(),
                });
            }
            Some(PollAction::Result {
                continue_playback,
                yes,
                no,
            }) => {
                let verdict = if continue_playback {
                    "続行します"
                } else {
                    "まもなく停止します"
                };
                self.notifier.notify(Notice {
                    kind: NoticeKind::PollResult,
                    request_id: None,
                    reason: None,
                    message: format!("アンケート結果 yes:{} no:{} — {}", yes, no, verdict),
                });
            }
            Some(PollAction::ForceSkip) => {
                info!("🗳️ Poll decided to stop, skipping current playback");
                self.skip(now)?;
                return Ok(());
            }
            None => {}
        }

        self.advance_if_idle(now)
    }

    // ---- 内部 ----

    fn is_current(&self, request_id: &str) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|c| c.request_id == request_id)
            .unwrap_or(false)
    }

    /// 現在の再生を終端ステータスへ落とす。終了したリクエストidを返す。
    fn finish_current(
        &self,
        status: RequestStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> PlayqResult<Option<String>> {
        let current = self.state.lock().current.take();
        let current = match current {
            Some(c) => c,
            None => return Ok(None),
        };

        self.poll.lock().on_playback_stopped();
        self.queue.database().lock().set_play_ended(&current.request_id, now)?;
        self.queue.set_status(&current.request_id, status, reason)?;

        debug!(
            request_id = %current.request_id,
            status = status.as_str(),
            "Playback finished"
        );
        Ok(Some(current.request_id))
    }

    /// 自動再生: 再生中でなければ次のREADYを選んで開始
    ///
    /// キャッシュ消失でplayが失敗した行はQUEUEDへ戻っているので、
    /// 次の候補を続けて試す。
    fn advance_if_idle(&self, now: DateTime<Utc>) -> PlayqResult<()> {
        loop {
            {
                let state = self.state.lock();
                if !state.autoplay || state.current.is_some() {
                    return Ok(());
                }
            }

            let shuffle = self.state.lock().shuffle;
            let next = self.queue.pick_next(LIVE_BUCKET, shuffle)?;
            let next = match next {
                Some(r) => r,
                None => return Ok(()),
            };

            match self.play(&next.id, now) {
                Ok(()) => return Ok(()),
                Err(PlayqError::CacheMissing(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn resolve_media_path(&self, request: &Request) -> PlayqResult<PathBuf> {
        match (&request.cache_path, &request.file_name) {
            (Some(dir), Some(file)) => Ok(PathBuf::from(dir).join(file)),
            _ => Err(PlayqError::CacheMissing(request.id.clone())),
        }
    }

    fn send(&self, command: OutputCommand) {
        if self.commands.send(command).is_err() {
            debug!("Player command channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Comment, ParsedVideo, PlayqDatabase};
    use crate::settings::{PollSettings, PolicySettings};
    use chrono::Duration;

    struct Harness {
        orchestrator: PlaybackOrchestrator,
        queue: Arc<RequestQueue>,
        commands: mpsc::UnboundedReceiver<OutputCommand>,
        cache_dir: tempfile::TempDir,
        _settings_dir: tempfile::TempDir,
    }

    fn make_harness(policy: PolicySettings) -> Harness {
        let db = Arc::new(Mutex::new(PlayqDatabase::new_in_memory().unwrap()));
        let queue = Arc::new(RequestQueue::new(db, Notifier::default()));

        let settings_dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::with_path(
            settings_dir.path().join("policy.toml"),
        ));
        settings.save(&policy).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = PlaybackOrchestrator::new(Arc::clone(&queue), settings, tx);

        Harness {
            orchestrator,
            queue,
            commands: rx,
            cache_dir: tempfile::tempdir().unwrap(),
            _settings_dir: settings_dir,
        }
    }

    fn base() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    /// READYかつキャッシュ済みのリクエストを作る
    fn make_ready(h: &Harness, comment_id: &str, video_id: &str) -> Request {
        let comment = Comment {
            id: comment_id.to_string(),
            platform: "youtube".to_string(),
            room_id: "room1".to_string(),
            user_id: "user1".to_string(),
            user_name: "User One".to_string(),
            message: format!("https://youtu.be/{}", video_id),
            published_at: Utc::now(),
            request_id: None,
            request_status: None,
            request_reason: None,
        };
        h.queue.database().lock().insert_comment(&comment).unwrap();
        let request = h
            .queue
            .create_request(
                &comment,
                &ParsedVideo {
                    site: "youtube".to_string(),
                    video_id: video_id.to_string(),
                    url: format!("https://www.youtube.com/watch?v={}", video_id),
                },
                LIVE_BUCKET,
                false,
            )
            .unwrap();

        let media_dir = h.cache_dir.path().join(video_id);
        std::fs::create_dir_all(&media_dir).unwrap();
        std::fs::write(media_dir.join("media.mp4"), b"media").unwrap();
        h.queue
            .database()
            .lock()
            .set_request_cache(&request.id, "media.mp4", &media_dir.to_string_lossy())
            .unwrap();
        h.queue
            .set_status(&request.id, RequestStatus::Ready, None)
            .unwrap();
        h.queue.get(&request.id).unwrap().unwrap()
    }

    fn drain(commands: &mut mpsc::UnboundedReceiver<OutputCommand>) -> Vec<OutputCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = commands.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn test_play_sends_command_and_sets_playing() {
        let mut h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");

        h.orchestrator.play(&request.id, base()).unwrap();

        let reloaded = h.queue.get(&request.id).unwrap().unwrap();
        assert_eq!(reloaded.status, RequestStatus::Playing);
        assert!(reloaded.play_started_at.is_some());

        let commands = drain(&mut h.commands);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            OutputCommand::Play {
                request_id,
                media_url,
                volume,
                ..
            } => {
                assert_eq!(request_id, &request.id);
                assert!(media_url.starts_with("file://"));
                assert!(media_url.ends_with("media.mp4"));
                assert_eq!(*volume, 80);
            }
            other => panic!("Expected Play command, got {:?}", other),
        }

        assert_eq!(h.queue.database().lock().count_plays(&request.url).unwrap(), 1);
    }

    #[test]
    fn test_play_demotes_previous_playing() {
        let mut h = make_harness(PolicySettings::default());
        let first = make_ready(&h, "c1", "video001");
        let second = make_ready(&h, "c2", "video002");

        h.orchestrator.play(&first.id, base()).unwrap();
        h.orchestrator.play(&second.id, base() + Duration::seconds(10)).unwrap();

        assert_eq!(
            h.queue.get(&first.id).unwrap().unwrap().status,
            RequestStatus::Ready
        );
        assert_eq!(
            h.queue.get(&second.id).unwrap().unwrap().status,
            RequestStatus::Playing
        );
        drain(&mut h.commands);
    }

    #[test]
    fn test_play_rejects_queued_request() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        h.queue
            .set_status(&request.id, RequestStatus::Queued, None)
            .unwrap();

        assert!(matches!(
            h.orchestrator.play(&request.id, base()),
            Err(PlayqError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_play_with_vanished_cache_requeues() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        std::fs::remove_file(
            h.cache_dir.path().join("video001").join("media.mp4"),
        )
        .unwrap();

        assert!(matches!(
            h.orchestrator.play(&request.id, base()),
            Err(PlayqError::CacheMissing(_))
        ));
        assert_eq!(
            h.queue.get(&request.id).unwrap().unwrap().status,
            RequestStatus::Queued
        );
    }

    #[test]
    fn test_ended_event_advances_to_next_ready() {
        let mut h = make_harness(PolicySettings::default());
        let first = make_ready(&h, "c1", "video001");
        let second = make_ready(&h, "c2", "video002");

        h.orchestrator.play(&first.id, base()).unwrap();
        h.orchestrator
            .on_player_event(
                OutputEvent::Ended {
                    request_id: first.id.clone(),
                },
                base() + Duration::seconds(100),
            )
            .unwrap();

        let ended = h.queue.get(&first.id).unwrap().unwrap();
        assert_eq!(ended.status, RequestStatus::Done);
        assert!(ended.play_ended_at.is_some());

        assert_eq!(
            h.queue.get(&second.id).unwrap().unwrap().status,
            RequestStatus::Playing
        );
        let commands = drain(&mut h.commands);
        assert_eq!(
            commands
                .iter()
                .filter(|c| matches!(c, OutputCommand::Play { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_error_event_fails_request() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");

        h.orchestrator.play(&request.id, base()).unwrap();
        h.orchestrator
            .on_player_event(
                OutputEvent::Error {
                    request_id: request.id.clone(),
                    message: "codec error".to_string(),
                },
                base() + Duration::seconds(5),
            )
            .unwrap();

        // FAILEDは行削除、コメントに最終状態が残る
        assert!(h.queue.get(&request.id).unwrap().is_none());
        let comment = h.queue.database().lock().get_comment("c1").unwrap().unwrap();
        assert_eq!(comment.request_status.as_deref(), Some("failed"));
    }

    #[test]
    fn test_stale_event_for_other_request_is_ignored() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        h.orchestrator.play(&request.id, base()).unwrap();

        h.orchestrator
            .on_player_event(
                OutputEvent::Ended {
                    request_id: "unrelated".to_string(),
                },
                base() + Duration::seconds(5),
            )
            .unwrap();

        assert_eq!(
            h.queue.get(&request.id).unwrap().unwrap().status,
            RequestStatus::Playing
        );
    }

    #[test]
    fn test_skip_stops_and_advances() {
        let mut h = make_harness(PolicySettings::default());
        let first = make_ready(&h, "c1", "video001");
        let second = make_ready(&h, "c2", "video002");

        h.orchestrator.play(&first.id, base()).unwrap();
        h.orchestrator.skip(base() + Duration::seconds(30)).unwrap();

        assert_eq!(
            h.queue.get(&first.id).unwrap().unwrap().status,
            RequestStatus::Done
        );
        assert_eq!(
            h.queue.get(&second.id).unwrap().unwrap().status,
            RequestStatus::Playing
        );
        let commands = drain(&mut h.commands);
        assert!(commands
            .iter()
            .any(|c| matches!(c, OutputCommand::Stop { .. })));
    }

    #[test]
    fn test_autoplay_off_does_not_advance() {
        let h = make_harness(PolicySettings::default());
        let first = make_ready(&h, "c1", "video001");
        let second = make_ready(&h, "c2", "video002");

        h.orchestrator.set_autoplay(false, base()).unwrap();
        h.orchestrator.play(&first.id, base()).unwrap();
        h.orchestrator.skip(base() + Duration::seconds(30)).unwrap();

        assert_eq!(
            h.queue.get(&second.id).unwrap().unwrap().status,
            RequestStatus::Ready
        );
    }

    #[test]
    fn test_position_accounts_for_pause() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        h.orchestrator.play(&request.id, base()).unwrap();

        // 10秒再生して一時停止
        h.orchestrator.pause(base() + Duration::seconds(10));
        assert_eq!(
            h.orchestrator.position_sec(base() + Duration::seconds(60)),
            Some(10.0)
        );

        // 60秒時点で再開、70秒時点では20秒消化
        h.orchestrator.resume(base() + Duration::seconds(60));
        assert_eq!(
            h.orchestrator.position_sec(base() + Duration::seconds(70)),
            Some(20.0)
        );
    }

    #[test]
    fn test_seek_resets_position() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        h.orchestrator.play(&request.id, base()).unwrap();

        h.orchestrator.seek(42.0, base() + Duration::seconds(10));
        assert_eq!(
            h.orchestrator.position_sec(base() + Duration::seconds(15)),
            Some(47.0)
        );
    }

    #[test]
    fn test_position_clamped_to_duration() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        h.queue
            .database()
            .lock()
            .update_request_metadata(
                &request.id,
                &crate::database::VideoMetadata {
                    title: "Short".to_string(),
                    duration_sec: Some(30),
                    uploader: None,
                    upload_date_ms: None,
                    view_count: None,
                    like_count: None,
                    comment_count: None,
                    thumbnail_url: None,
                },
            )
            .unwrap();

        h.orchestrator.play(&request.id, base()).unwrap();

        assert_eq!(
            h.orchestrator.position_sec(base() + Duration::seconds(10)),
            Some(10.0)
        );
        // プレイヤー側が終端で止まっていても位置は長さを超えない
        assert_eq!(
            h.orchestrator.position_sec(base() + Duration::seconds(120)),
            Some(30.0)
        );
    }

    #[test]
    fn test_poll_no_majority_force_skips() {
        let policy = PolicySettings {
            poll: PollSettings {
                enabled: true,
                interval_sec: 300,
                window_sec: 60,
                stop_delay_sec: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut h = make_harness(policy);
        let request = make_ready(&h, "c1", "video001");
        h.orchestrator.set_autoplay(false, base()).unwrap();
        h.orchestrator.play(&request.id, base()).unwrap();

        let mut notices = h.queue.notifier().subscribe();

        // 質問 → 反対多数 → 猶予後に強制スキップ
        h.orchestrator.tick(base() + Duration::seconds(300)).unwrap();
        h.orchestrator.record_vote("alice", false);
        h.orchestrator.record_vote("bob", false);
        h.orchestrator.tick(base() + Duration::seconds(360)).unwrap();

        assert_eq!(
            h.queue.get(&request.id).unwrap().unwrap().status,
            RequestStatus::Playing
        );
        h.orchestrator.tick(base() + Duration::seconds(370)).unwrap();
        assert_eq!(
            h.queue.get(&request.id).unwrap().unwrap().status,
            RequestStatus::Done
        );

        let question = notices.try_recv().unwrap();
        assert_eq!(question.kind, NoticeKind::PollQuestion);
        let result = notices.try_recv().unwrap();
        assert_eq!(result.kind, NoticeKind::PollResult);
        assert!(result.message.contains("no:2"));

        let commands = drain(&mut h.commands);
        assert!(commands
            .iter()
            .any(|c| matches!(c, OutputCommand::Stop { .. })));
    }

    #[test]
    fn test_recover_demotes_stale_playing() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        h.queue
            .set_status(&request.id, RequestStatus::Playing, None)
            .unwrap();

        h.orchestrator.recover().unwrap();
        assert_eq!(
            h.queue.get(&request.id).unwrap().unwrap().status,
            RequestStatus::Ready
        );
    }

    #[test]
    fn test_recover_requeues_interrupted_download() {
        let h = make_harness(PolicySettings::default());
        let request = make_ready(&h, "c1", "video001");
        h.queue
            .set_status(&request.id, RequestStatus::Downloading, None)
            .unwrap();

        h.orchestrator.recover().unwrap();
        assert_eq!(
            h.queue.get(&request.id).unwrap().unwrap().status,
            RequestStatus::Queued
        );
    }
}
