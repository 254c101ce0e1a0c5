//! yt-dlpによるメタデータ取得とメディアダウンロード
//!
//! ダウンロードは試行設定のラダーで実行する。前回の失敗内容に
//! 応じて次の試行（別HLSデムクサ、Cookieなし）を選ぶ。

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::database::VideoMetadata;
use crate::error::{PlayqError, PlayqResult};
use crate::settings::DownloaderSettings;

/// 動画メタデータの取得元
///
/// 実装はyt-dlpの`-j`出力を使うが、テストではモックに差し替える。
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// メタデータを取得。失敗時はNone。
    async fn fetch_metadata(&self, url: &str) -> Option<VideoMetadata>;
}

/// メディア本体のダウンロード実行
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    async fn run(
        &self,
        url: &str,
        output_template: &str,
        attempt: &AttemptConfig,
        settings: &DownloaderSettings,
    ) -> Result<(), DownloadFailure>;
}

/// 1回のダウンロード試行の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptConfig {
    pub label: &'static str,
    /// ブラウザCookieを渡すか
    pub use_cookies: bool,
    /// ネイティブHLSではなくffmpegデムクサを使う
    pub alternate_hls: bool,
}

/// ダウンロード失敗の診断情報
#[derive(Debug, Clone)]
pub struct DownloadFailure {
    pub exit_code: Option<i32>,
    /// stderr末尾の診断テキスト（空のこともある）
    pub diagnostic: String,
}

impl DownloadFailure {
    /// ストリームフォーマット系の失敗か（HLSデムクサ切替の対象）
    pub fn is_stream_format_error(&self) -> bool {
        let diag = self.diagnostic.to_ascii_lowercase();
        ["m3u8", "hls", "fragment", "requested format is not available"]
            .iter()
            .any(|needle| diag.contains(needle))
    }

    /// Cookie起因が疑われる失敗か
    ///
    /// 診断が空のままプロセスが落ちるケースはブラウザCookie読み取りの
    /// 失敗で起きるため、Cookie疑いに含める。
    pub fn is_cookie_suspected(&self) -> bool {
        if self.diagnostic.trim().is_empty() {
            return true;
        }
        let diag = self.diagnostic.to_ascii_lowercase();
        ["cookie", "sign in", "403", "account"]
            .iter()
            .any(|needle| diag.contains(needle))
    }
}

type AttemptTrigger = fn(Option<&DownloadFailure>) -> bool;

/// 試行ラダー: (設定, 発動条件) の順序付きリスト
///
/// 発動条件は直前までの最後の失敗を受け取る。
pub fn attempt_ladder() -> Vec<(AttemptConfig, AttemptTrigger)> {
    vec![
        (
            AttemptConfig {
                label: "default",
                use_cookies: true,
                alternate_hls: false,
            },
            |_| true,
        ),
        (
            AttemptConfig {
                label: "alternate-hls",
                use_cookies: true,
                alternate_hls: true,
            },
            |prior| prior.map(|f| f.is_stream_format_error()).unwrap_or(false),
        ),
        (
            AttemptConfig {
                label: "no-cookies",
                use_cookies: false,
                alternate_hls: false,
            },
            |prior| prior.map(|f| f.is_cookie_suspected()).unwrap_or(false),
        ),
    ]
}

/// ラダーに沿ってダウンロードを実行
///
/// いずれかの試行が成功すればOk。全試行が尽きたら最後の失敗の
/// 診断を持つエラーを返す。
pub async fn run_ladder(
    downloader: &dyn MediaDownloader,
    url: &str,
    output_template: &str,
    settings: &DownloaderSettings,
) -> PlayqResult<()> {
    let mut last_failure: Option<DownloadFailure> = None;

    for (mut attempt, trigger) in attempt_ladder() {
        if !trigger(last_failure.as_ref()) {
            continue;
        }
        if settings.cookies_browser.is_none() {
            attempt.use_cookies = false;
        }

        debug!(url = url, attempt = attempt.label, "⬇️ Download attempt");
        match downloader.run(url, output_template, &attempt, settings).await {
            Ok(()) => {
                info!(url = url, attempt = attempt.label, "✅ Download succeeded");
                return Ok(());
            }
            Err(failure) => {
                warn!(
                    url = url,
                    attempt = attempt.label,
                    exit_code = ?failure.exit_code,
                    "⚠️ Download attempt failed: {}",
                    truncate(&failure.diagnostic, 200)
                );
                last_failure = Some(failure);
            }
        }
    }

    let diagnostic = last_failure
        .map(|f| truncate(&f.diagnostic, 500).to_string())
        .unwrap_or_else(|| "no attempt executed".to_string());
    Err(PlayqError::Downloader(diagnostic))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// yt-dlpを子プロセスとして使う実装
pub struct YtDlp;

impl YtDlp {
    fn base_args(settings: &DownloaderSettings) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-continue".to_string(),
            "--write-info-json".to_string(),
            "--write-thumbnail".to_string(),
            "--newline".to_string(),
            "--concurrent-fragments".to_string(),
            settings.fragment_concurrency.to_string(),
            "--fragment-retries".to_string(),
            settings.fragment_retries.to_string(),
        ];
        if let Some(proxy) = &settings.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(user_agent) = &settings.user_agent {
            args.push("--user-agent".to_string());
            args.push(user_agent.clone());
        }
        args
    }

    fn attempt_args(attempt: &AttemptConfig, settings: &DownloaderSettings) -> Vec<String> {
        let mut args = Vec::new();
        if attempt.use_cookies {
            if let Some(browser) = &settings.cookies_browser {
                args.push("--cookies-from-browser".to_string());
                args.push(browser.clone());
            }
        }
        if attempt.alternate_hls {
            args.push("--hls-prefer-ffmpeg".to_string());
        } else {
            args.push("--hls-prefer-native".to_string());
        }
        args
    }

    /// 子プロセスを起動し、無出力が続いたらkillする
    async fn run_process(
        program: &str,
        args: &[String],
        stall_timeout: Duration,
    ) -> Result<(), DownloadFailure> {
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadFailure {
                exit_code: None,
                diagnostic: format!("failed to spawn {}: {}", program, e),
            })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                let _ = child.kill().await;
                return Err(DownloadFailure {
                    exit_code: None,
                    diagnostic: "child process pipes unavailable".to_string(),
                });
            }
        };
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut diagnostics: Vec<String> = Vec::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            let next = tokio::time::timeout(stall_timeout, async {
                tokio::select! {
                    line = stdout_lines.next_line(), if stdout_open => (true, line),
                    line = stderr_lines.next_line(), if stderr_open => (false, line),
                }
            })
            .await;

            match next {
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(DownloadFailure {
                        exit_code: None,
                        diagnostic: format!(
                            "stalled: no output for {}s",
                            stall_timeout.as_secs()
                        ),
                    });
                }
                Ok((true, Ok(Some(_line)))) => {}
                Ok((true, Ok(None))) => stdout_open = false,
                Ok((true, Err(_))) => stdout_open = false,
                Ok((false, Ok(Some(line)))) => {
                    if diagnostics.len() >= 20 {
                        diagnostics.remove(0);
                    }
                    diagnostics.push(line);
                }
                Ok((false, Ok(None))) => stderr_open = false,
                Ok((false, Err(_))) => stderr_open = false,
            }
        }

        let status = child.wait().await.map_err(|e| DownloadFailure {
            exit_code: None,
            diagnostic: format!("wait failed: {}", e),
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(DownloadFailure {
                exit_code: status.code(),
                diagnostic: diagnostics.join("\n"),
            })
        }
    }
}

#[async_trait]
impl MediaDownloader for YtDlp {
    async fn run(
        &self,
        url: &str,
        output_template: &str,
        attempt: &AttemptConfig,
        settings: &DownloaderSettings,
    ) -> Result<(), DownloadFailure> {
        let mut args = Self::base_args(settings);
        args.extend(Self::attempt_args(attempt, settings));
        args.push("-o".to_string());
        args.push(output_template.to_string());
        args.push(url.to_string());

        Self::run_process(
            &settings.program,
            &args,
            Duration::from_secs(settings.stall_timeout_sec),
        )
        .await
    }
}

#[async_trait]
impl MediaProbe for YtDlp {
    async fn fetch_metadata(&self, url: &str) -> Option<VideoMetadata> {
        // メタデータ取得はダウンロードより短い猶予で十分
        let settings = DownloaderSettings::default();
        let args = vec![
            "-j".to_string(),
            "--no-playlist".to_string(),
            url.to_string(),
        ];

        let output = match Command::new(&settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(url = url, "⚠️ Metadata probe failed to spawn: {}", e);
                return None;
            }
        };

        if !output.status.success() {
            warn!(url = url, code = ?output.status.code(), "⚠️ Metadata probe failed");
            return None;
        }

        let json: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        Some(parse_metadata(&json))
    }
}

/// yt-dlpの`-j`出力からメタデータを組み立てる
pub fn parse_metadata(json: &serde_json::Value) -> VideoMetadata {
    VideoMetadata {
        title: json
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("(no title)")
            .to_string(),
        duration_sec: json.get("duration").and_then(|v| v.as_f64()).map(|d| d as i64),
        uploader: json
            .get("uploader")
            .and_then(|v| v.as_str())
            .map(String::from),
        upload_date_ms: json
            .get("upload_date")
            .and_then(|v| v.as_str())
            .and_then(parse_upload_date_ms),
        view_count: json.get("view_count").and_then(|v| v.as_i64()),
        like_count: json.get("like_count").and_then(|v| v.as_i64()),
        comment_count: json.get("comment_count").and_then(|v| v.as_i64()),
        thumbnail_url: json
            .get("thumbnail")
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

/// "YYYYMMDD"をUTC 0時のUnixミリ秒へ
fn parse_upload_date_ms(date: &str) -> Option<i64> {
    let parsed = chrono::NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let datetime = parsed.and_hms_opt(0, 0, 0)?;
    Some(datetime.and_utc().timestamp_millis())
}
