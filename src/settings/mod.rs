//! ポリシー設定管理モジュール
//!
//! XDGディレクトリを使用した設定ファイルの永続化と管理を提供します。
//! ダウンロードワーカーはtickごとに再読み込みするため、
//! 運用中の設定変更は即座に反映される。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// カスタムサイト規則
///
/// 組み込みパーサー（YouTube / ニコニコ動画）以外のサイトを
/// 正規表現で追加するための運用者定義ルール。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomSiteRule {
    /// サイト別名（canonical identityのsiteとして使用）
    pub site: String,
    /// 動画IDをキャプチャグループ1で抽出する正規表現
    pub pattern: String,
}

/// 継続アンケート設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollSettings {
    pub enabled: bool,
    /// 再生開始から質問提示までの秒数
    pub interval_sec: u64,
    /// 投票受付ウィンドウの秒数
    pub window_sec: u64,
    /// no多数決定から強制スキップまでの猶予秒数
    pub stop_delay_sec: u64,
    /// 「続行」として数える語彙
    pub yes_words: Vec<String>,
    /// 「停止」として数える語彙
    pub no_words: Vec<String>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_sec: 300,
            window_sec: 60,
            stop_delay_sec: 10,
            yes_words: vec!["yes".to_string(), "続行".to_string()],
            no_words: vec!["no".to_string(), "停止".to_string()],
        }
    }
}

/// 外部ダウンローダー設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloaderSettings {
    /// 実行バイナリ名
    pub program: String,
    /// Cookie取得元ブラウザ（Noneで無効）
    pub cookies_browser: Option<String>,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    /// 無出力がこの秒数続いたらプロセスをkillする
    pub stall_timeout_sec: u64,
    /// フラグメント並列数
    pub fragment_concurrency: u32,
    /// フラグメント再試行回数
    pub fragment_retries: u32,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            cookies_browser: Some("firefox".to_string()),
            proxy: None,
            user_agent: None,
            stall_timeout_sec: 120,
            fragment_concurrency: 4,
            fragment_retries: 10,
        }
    }
}

/// 再生出力設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackSettings {
    /// 再生コマンドに載せる音量（0-100）
    pub volume: u32,
    /// ループ再生フラグ
    pub looped: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            volume: 80,
            looped: false,
        }
    }
}

/// ポリシー設定（Policy Store読み出し契約）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySettings {
    /// 最大再生時間（秒）。Noneで制限無効。
    pub max_duration_sec: Option<u32>,

    /// 同一動画の重複リクエストを拒否するか
    pub disallow_duplicates: bool,

    /// 同一動画の再生後クールダウン（分）。0で無効。
    pub cooldown_minutes: u32,

    /// サイト別許可フラグ。未登録サイトは`allow_unknown_sites`に従う。
    #[serde(default)]
    pub site_allowances: HashMap<String, bool>,

    /// 許可リストに無いサイトを受け付けるか
    pub allow_unknown_sites: bool,

    /// カスタムサイト規則
    #[serde(default)]
    pub custom_sites: Vec<CustomSiteRule>,

    /// NGユーザーID一覧
    #[serde(default)]
    pub ng_user_ids: Vec<String>,

    /// 1ユーザーあたりの同時リクエスト上限。0で無制限。
    pub owner_concurrent_limit: u32,

    /// 同時ダウンロード上限
    pub max_concurrent_downloads: u32,

    /// 新規リクエストを先頭（position 1）に挿入するか
    pub insert_front: bool,

    /// キャッシュディレクトリ（Noneの場合はXDGデフォルト使用）
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub poll: PollSettings,

    #[serde(default)]
    pub downloader: DownloaderSettings,

    #[serde(default)]
    pub playback: PlaybackSettings,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_duration_sec: Some(600),
            disallow_duplicates: true,
            cooldown_minutes: 60,
            site_allowances: HashMap::new(),
            allow_unknown_sites: false,
            custom_sites: Vec::new(),
            ng_user_ids: Vec::new(),
            owner_concurrent_limit: 3,
            max_concurrent_downloads: 2,
            insert_front: true,
            cache_dir: None,
            poll: PollSettings::default(),
            downloader: DownloaderSettings::default(),
            playback: PlaybackSettings::default(),
        }
    }
}

impl PolicySettings {
    /// サイトが許可されているか判定
    pub fn is_site_allowed(&self, site: &str) -> bool {
        match self.site_allowances.get(site) {
            Some(allowed) => *allowed,
            None => {
                // 組み込みサイトとカスタム規則で定義済みのサイトはデフォルト許可
                if site == "youtube" || site == "niconico" {
                    return true;
                }
                if self.custom_sites.iter().any(|r| r.site == site) {
                    return true;
                }
                self.allow_unknown_sites
            }
        }
    }

    /// メッセージをアンケート投票として解釈（yes=true / no=false）
    pub fn parse_poll_vote(&self, message: &str) -> Option<bool> {
        let trimmed = message.trim();
        if self.poll.yes_words.iter().any(|w| w == trimmed) {
            Some(true)
        } else if self.poll.no_words.iter().any(|w| w == trimmed) {
            Some(false)
        } else {
            None
        }
    }
}

/// 設定管理マネージャー
pub struct SettingsManager {
    config_path: PathBuf,
}

impl SettingsManager {
    /// 新しい設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        // 設定ディレクトリを作成（存在しない場合）
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    /// 明示パス指定で作成（テスト用）
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// XDGディレクトリに基づく設定ファイルパスを取得
    fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "sifyfy", "playq")
            .context("Failed to get project directories")?;

        let config_dir = project_dirs.config_dir();
        let config_file = config_dir.join("policy.toml");

        debug!("Policy file path: {}", config_file.display());

        Ok(config_file)
    }

    /// 設定を読み込み
    pub fn load(&self) -> Result<PolicySettings> {
        if !self.config_path.exists() {
            debug!("Policy file not found, using defaults");
            return Ok(PolicySettings::default());
        }

        let content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read policy file: {}", self.config_path.display())
        })?;

        let settings: PolicySettings =
            toml::from_str(&content).context("Failed to parse policy file")?;

        Ok(settings)
    }

    /// 読み込み失敗時はデフォルトにフォールバック
    pub fn load_or_default(&self) -> PolicySettings {
        self.load().unwrap_or_else(|e| {
            warn!("設定読み込みエラー、デフォルト設定を使用: {}", e);
            PolicySettings::default()
        })
    }

    /// 設定を保存
    pub fn save(&self, settings: &PolicySettings) -> Result<()> {
        let content = toml::to_string_pretty(settings).context("Failed to serialize policy")?;
        fs::write(&self.config_path, content).with_context(|| {
            format!("Failed to write policy file: {}", self.config_path.display())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PolicySettings::default();
        assert_eq!(settings.max_duration_sec, Some(600));
        assert!(settings.disallow_duplicates);
        assert_eq!(settings.max_concurrent_downloads, 2);
        assert!(settings.insert_front);
    }

    #[test]
    fn test_site_allowance() {
        let mut settings = PolicySettings::default();
        assert!(settings.is_site_allowed("youtube"));
        assert!(settings.is_site_allowed("niconico"));
        assert!(!settings.is_site_allowed("example"));

        settings
            .site_allowances
            .insert("youtube".to_string(), false);
        assert!(!settings.is_site_allowed("youtube"));

        settings.custom_sites.push(CustomSiteRule {
            site: "example".to_string(),
            pattern: r"https://example\.com/v/(\w+)".to_string(),
        });
        assert!(settings.is_site_allowed("example"));
    }

    #[test]
    fn test_parse_poll_vote() {
        let settings = PolicySettings::default();
        assert_eq!(settings.parse_poll_vote("yes"), Some(true));
        assert_eq!(settings.parse_poll_vote(" 続行 "), Some(true));
        assert_eq!(settings.parse_poll_vote("no"), Some(false));
        assert_eq!(settings.parse_poll_vote("こんにちは"), None);
    }

    #[test]
    fn test_save_and_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = SettingsManager::with_path(dir.path().join("policy.toml"));

        let mut settings = PolicySettings::default();
        settings.cooldown_minutes = 15;
        settings.ng_user_ids.push("spammer".to_string());

        manager.save(&settings)?;
        let loaded = manager.load()?;
        assert_eq!(loaded, settings);
        Ok(())
    }

    #[test]
    fn test_load_missing_file_falls_back_to_default() {
        let manager = SettingsManager::with_path(PathBuf::from("/nonexistent/policy.toml"));
        let settings = manager.load_or_default();
        assert_eq!(settings, PolicySettings::default());
    }
}
