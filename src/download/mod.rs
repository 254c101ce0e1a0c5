//! ダウンロードワーカー
//!
//! QUEUEDのリクエストを拾い、メタデータ検証→ポリシー適用→
//! キャッシュ確認→ダウンロード→マニフェスト構築→READYまでを
//! 1リクエストずつ進める。ワーカーはtick駆動で、同時実行数は
//! DB上のDOWNLOADING件数から毎tick計算する。

pub mod fetcher;
pub mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::database::{Request, RequestStatus};
use crate::error::{PlayqError, PlayqResult};
use crate::queue::{RequestQueue, LIVE_BUCKET};
use crate::settings::{PolicySettings, SettingsManager};

pub use fetcher::{
    attempt_ladder, run_ladder, AttemptConfig, DownloadFailure, MediaDownloader, MediaProbe, YtDlp,
};
pub use manifest::{cache_key, Manifest, MediaKind};

/// デフォルトのキャッシュルート（XDGキャッシュ配下）
pub fn default_cache_root() -> PathBuf {
    directories::ProjectDirs::from("dev", "sifyfy", "playq")
        .map(|dirs| dirs.cache_dir().join("media"))
        .unwrap_or_else(|| PathBuf::from(".playq-cache"))
}

/// ダウンロードワーカー
pub struct DownloadWorker {
    queue: Arc<RequestQueue>,
    probe: Arc<dyn MediaProbe>,
    downloader: Arc<dyn MediaDownloader>,
    settings: Arc<SettingsManager>,
    cache_root: PathBuf,
}

impl DownloadWorker {
    pub fn new(
        queue: Arc<RequestQueue>,
        probe: Arc<dyn MediaProbe>,
        downloader: Arc<dyn MediaDownloader>,
        settings: Arc<SettingsManager>,
        cache_root: PathBuf,
    ) -> Self {
        Self {
            queue,
            probe,
            downloader,
            settings,
            cache_root,
        }
    }

    /// 定期tickループを起動
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.tick().await {
                    error!("❌ Download worker tick failed: {}", e);
                }
            }
        })
    }

    /// 1回のtick: 空きスロット分のQUEUEDを拾って処理する
    ///
    /// ポリシーは毎tick読み直すので、設定変更は次のtickから効く。
    pub async fn tick(self: &Arc<Self>) -> PlayqResult<usize> {
        let policy = self.settings.load_or_default();

        let downloading = self
            .queue
            .database()
            .lock()
            .count_status(RequestStatus::Downloading)?;
        let slots = (policy.max_concurrent_downloads as i64 - downloading).max(0) as usize;
        if slots == 0 {
            return Ok(0);
        }

        let candidates = self.pick_candidates(slots)?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let cache_root = policy
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.cache_root.clone());
        let policy = Arc::new(policy);

        let mut set = JoinSet::new();
        let count = candidates.len();
        for request in candidates {
            let worker = Arc::clone(self);
            let policy = Arc::clone(&policy);
            let cache_root = cache_root.clone();
            set.spawn(async move {
                let id = request.id.clone();
                if let Err(e) = worker.process_request(request, &policy, &cache_root).await {
                    error!(request_id = %id, "❌ Request processing failed: {}", e);
                    // 二重Failed遷移は行が既に消えていればRequestNotFoundになるだけ
                    if let Err(e2) =
                        worker
                            .queue
                            .set_status(&id, RequestStatus::Failed, Some("internal-error"))
                    {
                        debug!(request_id = %id, "Failed-transition skipped: {}", e2);
                    }
                }
            });
        }
        while set.join_next().await.is_some() {}

        Ok(count)
    }

    /// ライブキュー優先、残りのバケットはラウンドロビンで拾う
    fn pick_candidates(&self, slots: usize) -> PlayqResult<Vec<Request>> {
        let db = self.queue.database();
        let db = db.lock();

        let mut candidates: Vec<Request> = db
            .list_by_status(LIVE_BUCKET, RequestStatus::Queued)?
            .into_iter()
            .take(slots)
            .collect();

        if candidates.len() < slots {
            let mut per_bucket: Vec<Vec<Request>> = Vec::new();
            for bucket in db.list_buckets()? {
                if bucket == LIVE_BUCKET {
                    continue;
                }
                let queued = db.list_by_status(&bucket, RequestStatus::Queued)?;
                if !queued.is_empty() {
                    per_bucket.push(queued);
                }
            }
            let mut round = 0;
            while candidates.len() < slots {
                let mut picked_any = false;
                for bucket in per_bucket.iter_mut() {
                    if round < bucket.len() && candidates.len() < slots {
                        candidates.push(bucket[round].clone());
                        picked_any = true;
                    }
                }
                if !picked_any {
                    break;
                }
                round += 1;
            }
        }

        Ok(candidates)
    }

    /// 1リクエストの処理パイプライン
    async fn process_request(
        &self,
        request: Request,
        policy: &PolicySettings,
        cache_root: &Path,
    ) -> PlayqResult<()> {
        self.queue
            .set_status(&request.id, RequestStatus::Validating, None)?;

        let metadata = match self.probe.fetch_metadata(&request.url).await {
            Some(meta) => meta,
            None => {
                warn!(request_id = %request.id, url = %request.url, "⚠️ Metadata fetch failed");
                return self
                    .queue
                    .set_status(&request.id, RequestStatus::Failed, Some("metadata-fetch"));
            }
        };

        self.queue
            .database()
            .lock()
            .update_request_metadata(&request.id, &metadata)?;

        if let (Some(limit), Some(duration)) = (policy.max_duration_sec, metadata.duration_sec) {
            if duration > limit as i64 {
                info!(
                    request_id = %request.id,
                    duration = duration,
                    limit = limit,
                    "⏱️ Request rejected: too long"
                );
                return self.queue.set_status(
                    &request.id,
                    RequestStatus::Rejected,
                    Some("duration-limit"),
                );
            }
        }

        let key = cache_key(&request.site, &request.video_id);
        let cache_dir = cache_root.join(&key);
        std::fs::create_dir_all(&cache_dir)?;

        if let Some(existing) = manifest::read_manifest(&cache_dir)? {
            // 実体が消えたマニフェストは無効化して通常のダウンロードへ
            if !existing.entries_present(&cache_dir) {
                warn!(
                    request_id = %request.id,
                    key = %key,
                    "💾 Cached manifest refers to evicted files, re-downloading"
                );
                if let Err(e) = std::fs::remove_file(cache_dir.join(manifest::MANIFEST_FILE)) {
                    warn!(key = %key, "⚠️ Failed to remove stale manifest: {}", e);
                }
            } else if let Some(file) = existing.primary_file() {
                info!(request_id = %request.id, key = %key, "💾 Cache hit, skipping download");
                self.queue.database().lock().set_request_cache(
                    &request.id,
                    file,
                    &cache_dir.to_string_lossy(),
                )?;
                return self
                    .queue
                    .set_status(&request.id, RequestStatus::Ready, None);
            }
        }

        self.queue
            .set_status(&request.id, RequestStatus::Downloading, None)?;

        let template = cache_dir.join("media.%(ext)s");
        if let Err(e) = run_ladder(
            self.downloader.as_ref(),
            &request.url,
            &template.to_string_lossy(),
            &policy.downloader,
        )
        .await
        {
            let reason = match &e {
                PlayqError::Downloader(diag) if !diag.is_empty() => format!("download: {}", diag),
                _ => "download-error".to_string(),
            };
            return self
                .queue
                .set_status(&request.id, RequestStatus::Failed, Some(&reason));
        }

        manifest::cleanup_fragments(&cache_dir)?;
        let built = manifest::build_manifest(&cache_dir, &request.id, &request.url)?;
        manifest::write_manifest(&cache_dir, &built)?;

        let file = built
            .primary_file()
            .ok_or_else(|| PlayqError::NoPlayableArtifact(cache_dir.clone()))?;
        self.queue.database().lock().set_request_cache(
            &request.id,
            file,
            &cache_dir.to_string_lossy(),
        )?;

        info!(
            request_id = %request.id,
            key = %key,
            size_bytes = built.total_bytes,
            file = file,
            "📦 Download complete"
        );
        self.queue
            .set_status(&request.id, RequestStatus::Ready, None)
    }
}
