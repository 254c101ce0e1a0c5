//! コメント取り込み→ダウンロード→再生までの結合テスト
//!
//! ダウンローダーとメタデータ取得はモックに差し替え、DBはインメモリ。

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use playq::database::{PlayqDatabase, VideoMetadata};
use playq::download::{AttemptConfig, DownloadFailure, DownloadWorker, MediaDownloader, MediaProbe};
use playq::ingest::{InboundComment, Ingestor};
use playq::notify::{NoticeKind, Notifier};
use playq::playback::PlaybackOrchestrator;
use playq::queue::RequestQueue;
use playq::remote::{OutputCommand, OutputEvent};
use playq::settings::{DownloaderSettings, PolicySettings, SettingsManager};
use playq::{RequestStatus, LIVE_BUCKET};

struct StubProbe;

#[async_trait]
impl MediaProbe for StubProbe {
    async fn fetch_metadata(&self, _url: &str) -> Option<VideoMetadata> {
        Some(VideoMetadata {
            title: "Integration Video".to_string(),
            duration_sec: Some(180),
            uploader: Some("Uploader".to_string()),
            upload_date_ms: None,
            view_count: Some(42),
            like_count: None,
            comment_count: None,
            thumbnail_url: None,
        })
    }
}

struct StubDownloader;

#[async_trait]
impl MediaDownloader for StubDownloader {
    async fn run(
        &self,
        _url: &str,
        output_template: &str,
        _attempt: &AttemptConfig,
        _settings: &DownloaderSettings,
    ) -> Result<(), DownloadFailure> {
        let path = output_template.replace("%(ext)s", "mp4");
        std::fs::write(&path, b"integration-media").map_err(|e| DownloadFailure {
            exit_code: None,
            diagnostic: e.to_string(),
        })?;
        Ok(())
    }
}

struct World {
    queue: Arc<RequestQueue>,
    ingestor: Ingestor,
    worker: Arc<DownloadWorker>,
    orchestrator: PlaybackOrchestrator,
    commands: mpsc::UnboundedReceiver<OutputCommand>,
    policy: PolicySettings,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

fn make_world(policy: PolicySettings) -> World {
    let db = Arc::new(Mutex::new(PlayqDatabase::new_in_memory().unwrap()));
    let queue = Arc::new(RequestQueue::new(db, Notifier::default()));

    let settings_dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(SettingsManager::with_path(
        settings_dir.path().join("policy.toml"),
    ));
    settings.save(&policy).unwrap();

    let cache_dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(DownloadWorker::new(
        Arc::clone(&queue),
        Arc::new(StubProbe),
        Arc::new(StubDownloader),
        Arc::clone(&settings),
        cache_dir.path().to_path_buf(),
    ));

    let (tx, rx) = mpsc::unbounded_channel();
    let orchestrator = PlaybackOrchestrator::new(Arc::clone(&queue), settings, tx);

    World {
        ingestor: Ingestor::new(Arc::clone(&queue)),
        queue,
        worker,
        orchestrator,
        commands: rx,
        policy,
        _dirs: (settings_dir, cache_dir),
    }
}

fn chat(id: &str, user: &str, message: &str) -> InboundComment {
    InboundComment {
        id: id.to_string(),
        platform: "youtube".to_string(),
        room_id: "room1".to_string(),
        user_id: user.to_string(),
        user_name: format!("name-{}", user),
        message: message.to_string(),
        published_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_chat_to_playback_full_path() {
    let mut world = make_world(PolicySettings::default());

    // 1. チャットのURLがリクエストになる
    let outcome = world
        .ingestor
        .ingest(
            chat("c1", "alice", "これ好き https://youtu.be/dQw4w9WgXcQ"),
            &world.policy,
            true,
        )
        .unwrap()
        .unwrap();
    let request = outcome.request.expect("request created");
    assert_eq!(request.status, RequestStatus::Queued);

    // 2. ワーカーがREADYまで進める
    world.worker.tick().await.unwrap();
    let ready = world.queue.get(&request.id).unwrap().unwrap();
    assert_eq!(ready.status, RequestStatus::Ready);
    assert_eq!(ready.title.as_deref(), Some("Integration Video"));
    assert!(ready.cache_path.is_some());

    // 3. tickが自動再生を開始する
    world.orchestrator.tick(Utc::now()).unwrap();
    let playing = world.queue.get(&request.id).unwrap().unwrap();
    assert_eq!(playing.status, RequestStatus::Playing);

    let command = world.commands.try_recv().unwrap();
    match command {
        OutputCommand::Play {
            request_id, title, ..
        } => {
            assert_eq!(request_id, request.id);
            assert_eq!(title, "Integration Video");
        }
        other => panic!("Expected Play, got {:?}", other),
    }

    // 4. プレイヤーの終了コールバックでDONEになる
    world
        .orchestrator
        .on_player_event(
            OutputEvent::Ended {
                request_id: request.id.clone(),
            },
            Utc::now(),
        )
        .unwrap();
    assert_eq!(
        world.queue.get(&request.id).unwrap().unwrap().status,
        RequestStatus::Done
    );
}

#[tokio::test]
async fn test_policy_rejections_are_notified_not_queued() {
    let policy = PolicySettings {
        ng_user_ids: vec!["troll".to_string()],
        ..Default::default()
    };
    let mut world = make_world(policy.clone());
    let mut notices = world.queue.notifier().subscribe();

    let outcome = world
        .ingestor
        .ingest(
            chat("c1", "troll", "https://youtu.be/dQw4w9WgXcQ"),
            &policy,
            true,
        )
        .unwrap()
        .unwrap();
    assert!(outcome.request.is_none());
    assert!(outcome.warning.is_some());

    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.kind, NoticeKind::Rejected);
    assert_eq!(notice.reason.as_deref(), Some("ng-user"));

    // キューには何も積まれない
    assert!(world.queue.list(LIVE_BUCKET).unwrap().is_empty());
}

#[tokio::test]
async fn test_sequential_playback_over_multiple_requests() {
    let mut world = make_world(PolicySettings::default());

    for (i, video) in ["dQw4w9WgXcQ", "jNQXAC9IVRw"].iter().enumerate() {
        world
            .ingestor
            .ingest(
                chat(
                    &format!("c{}", i),
                    &format!("user{}", i),
                    &format!("https://youtu.be/{}", video),
                ),
                &world.policy,
                true,
            )
            .unwrap()
            .unwrap();
    }

    world.worker.tick().await.unwrap();

    // 先頭を再生、終了後に次へ進む
    world.orchestrator.tick(Utc::now()).unwrap();
    let first = world.orchestrator.current().expect("first playing");

    world
        .orchestrator
        .on_player_event(
            OutputEvent::Ended {
                request_id: first.request_id.clone(),
            },
            Utc::now() + Duration::seconds(60),
        )
        .unwrap();

    let second = world.orchestrator.current().expect("second playing");
    assert_ne!(second.request_id, first.request_id);

    // どの時点でもPLAYINGは1件以下
    let playing_rows: Vec<_> = world
        .queue
        .list(LIVE_BUCKET)
        .unwrap()
        .into_iter()
        .filter(|r| r.status == RequestStatus::Playing)
        .collect();
    assert_eq!(playing_rows.len(), 1);
}

#[tokio::test]
async fn test_duration_policy_end_to_end() {
    let policy = PolicySettings {
        max_duration_sec: Some(60), // スタブのメタデータは180秒
        ..Default::default()
    };
    let mut world = make_world(policy.clone());

    let outcome = world
        .ingestor
        .ingest(
            chat("c1", "alice", "https://youtu.be/dQw4w9WgXcQ"),
            &policy,
            true,
        )
        .unwrap()
        .unwrap();
    let request = outcome.request.unwrap();

    world.worker.tick().await.unwrap();

    // 長すぎるのでREJECTED、行は消えコメントに痕跡が残る
    assert!(world.queue.get(&request.id).unwrap().is_none());
    let comment = world
        .queue
        .database()
        .lock()
        .get_comment("c1")
        .unwrap()
        .unwrap();
    assert_eq!(comment.request_status.as_deref(), Some("rejected"));
    assert_eq!(comment.request_reason.as_deref(), Some("duration-limit"));
}
