use chrono::Utc;
use clap::Parser;
use parking_lot::Mutex;
use playq::download::{DownloadWorker, YtDlp};
use playq::ingest::Ingestor;
use playq::logging;
use playq::notify::Notifier;
use playq::playback::PlaybackOrchestrator;
use playq::queue::RequestQueue;
use playq::remote::{RemoteServer, DEFAULT_PORT};
use playq::sources::{CommentSource, StdinSource};
use playq::{PlayqDatabase, PlayqError, SettingsManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// チャットのリクエストをキューに積み、ダウンロードして連続再生するデーモン
#[derive(Parser, Debug)]
#[command(name = "playq", version, about)]
struct Args {
    /// 監視対象のプラットフォーム識別子
    #[arg(long, default_value = "youtube")]
    platform: String,

    /// 監視対象の配信・ルームid
    #[arg(long, default_value = "local")]
    room: String,

    /// リモートプレイヤーWebSocketの希望ポート
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// ポリシー設定ファイル（省略時はXDG設定ディレクトリ）
    #[arg(long)]
    config: Option<PathBuf>,

    /// データベースファイル（省略時はXDGデータディレクトリ）
    #[arg(long)]
    database: Option<PathBuf>,

    /// 起動時に自動再生を無効にする
    #[arg(long)]
    no_autoplay: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging()?;
    let args = Args::parse();

    info!("🎬 Starting playq - chat request queue player");

    let settings = Arc::new(match args.config {
        Some(path) => SettingsManager::with_path(path),
        None => SettingsManager::new()?,
    });
    // 初回起動時にデフォルト設定ファイルを残しておく
    let policy = settings.load_or_default();
    if let Err(e) = settings.save(&policy) {
        warn!("⚠️ Could not write policy file: {}", e);
    }

    let db_path = match args.database {
        Some(path) => path,
        None => playq::database::get_database_path()?,
    };
    info!(path = %db_path.display(), "💿 Opening database");
    let db = Arc::new(Mutex::new(PlayqDatabase::new(&db_path)?));

    let notifier = Notifier::default();
    let queue = Arc::new(RequestQueue::new(db, notifier.clone()));

    // リモートプレイヤーサーバー
    let server = Arc::new(RemoteServer::new(args.port));
    let mut player_events = server
        .take_events()
        .ok_or_else(|| anyhow::anyhow!("player event channel already taken"))?;
    server.start().await?;

    // 再生コマンドをサーバーへ中継
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                server.send_command(&command).await;
            }
        });
    }

    // 通知をサーバーへ中継
    {
        let server = Arc::clone(&server);
        let mut notices = notifier.subscribe();
        tokio::spawn(async move {
            while let Ok(notice) = notices.recv().await {
                server.send_notice(&notice).await;
            }
        });
    }

    let orchestrator = Arc::new(PlaybackOrchestrator::new(
        Arc::clone(&queue),
        Arc::clone(&settings),
        command_tx,
    ));
    orchestrator.recover()?;
    if args.no_autoplay {
        orchestrator.set_autoplay(false, Utc::now())?;
    }

    // ダウンロードワーカー
    let worker = Arc::new(DownloadWorker::new(
        Arc::clone(&queue),
        Arc::new(YtDlp),
        Arc::new(YtDlp),
        Arc::clone(&settings),
        playq::download::default_cache_root(),
    ));
    let _worker_handle = Arc::clone(&worker).spawn(Duration::from_secs(3));

    // プレイヤーコールバック
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            while let Some(event) = player_events.recv().await {
                if let Err(e) = orchestrator.on_player_event(event, Utc::now()) {
                    error!("❌ Player event handling failed: {}", e);
                }
            }
        });
    }

    // 再生tick（アンケート進行と自動再生の穴埋め）
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.tick(Utc::now()) {
                    error!("❌ Playback tick failed: {}", e);
                }
            }
        });
    }

    // コメント取り込み: 標準入力のNDJSONイベントを流し込む
    {
        let queue = Arc::clone(&queue);
        let settings = Arc::clone(&settings);
        let orchestrator = Arc::clone(&orchestrator);
        let platform = args.platform.clone();
        let room = args.room.clone();
        tokio::spawn(async move {
            let mut ingestor = Ingestor::new(queue);
            let mut source = StdinSource::new(&platform, &room);
            let mut flush = tokio::time::interval(Duration::from_secs(1));
            info!(platform = %platform, room = %room, "💬 Comment intake started (NDJSON on stdin)");

            loop {
                tokio::select! {
                    batch = source.next_events() => match batch {
                        Ok(Some(events)) => {
                            let policy = settings.load_or_default();
                            for event in events {
                                let inbound = event.into_inbound(&platform, &room);
                                let results = ingestor.offer(inbound, Utc::now(), &policy, true);
                                handle_ingest_results(results, &orchestrator);
                            }
                        }
                        Ok(None) => {
                            info!("💬 Comment source closed");
                            break;
                        }
                        Err(e) => {
                            warn!("⚠️ Comment source error: {}", e);
                        }
                    },
                    _ = flush.tick() => {
                        let policy = settings.load_or_default();
                        let results = ingestor.flush_due(Utc::now(), &policy, true);
                        handle_ingest_results(results, &orchestrator);
                    }
                }
            }

            // ソースが閉じてもバッファの残りは適用する
            let policy = settings.load_or_default();
            let results = ingestor.flush_due(Utc::now() + chrono::Duration::hours(1), &policy, true);
            handle_ingest_results(results, &orchestrator);
        });
    }

    // Ctrl+Cで停止
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;
    shutdown_rx.recv().await;

    info!("🛑 Shutdown signal received");
    server.stop().await;
    info!("👋 playq shutting down");
    Ok(())
}

/// 取り込み結果のログ出力とアンケート投票の転送
fn handle_ingest_results(
    results: Vec<playq::PlayqResult<Option<playq::IngestOutcome>>>,
    orchestrator: &PlaybackOrchestrator,
) {
    for result in results {
        match result {
            Ok(Some(outcome)) => {
                if let Some(vote) = outcome.poll_vote {
                    orchestrator.record_vote(&vote.voter_id, vote.yes);
                }
            }
            Ok(None) => {}
            Err(PlayqError::EmptyMessage) => {}
            Err(e) => warn!("⚠️ Comment ingestion failed: {}", e),
        }
    }
}
