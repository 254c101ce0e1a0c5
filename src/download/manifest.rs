//! キャッシュキー計算と再生マニフェスト構築
//!
//! ダウンローダーが生成したファイル群を拡張子ヒューリスティクスで分類し、
//! 再生可能なアーティファクトを記述する小さなマニフェストを永続化する。

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{PlayqError, PlayqResult};

/// マニフェストのファイル名（キャッシュディレクトリ直下）
pub const MANIFEST_FILE: &str = "manifest.json";

/// マニフェストフォーマットのバージョン
pub const MANIFEST_VERSION: u32 = 1;

/// (サイト, 動画id)から安定なキャッシュキーを計算
pub fn cache_key(site: &str, video_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(site.as_bytes());
    hasher.update(b":");
    hasher.update(video_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// アーティファクトの分類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// 映像のみのストリーム
    Video,
    /// 音声のみのストリーム
    Audio,
    /// 映像+音声の単一コンテナ
    Container,
    Thumbnail,
}

/// マニフェストの1エントリ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub kind: MediaKind,
    /// キャッシュディレクトリからの相対ファイル名
    pub file: String,
    pub mime_type: String,
}

/// 再生マニフェスト
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version: u32,
    pub request_id: String,
    pub source_url: String,
    pub thumbnail: Option<String>,
    /// 参照アーティファクトの合計バイト数
    #[serde(default)]
    pub total_bytes: u64,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// 再生に使う主アーティファクト（コンテナまたは映像）のファイル名
    pub fn primary_file(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| matches!(e.kind, MediaKind::Container | MediaKind::Video))
            .map(|e| e.file.as_str())
    }

    /// 参照する全ファイルがディレクトリ内に存在するか（キャッシュヒット判定用）
    pub fn entries_present(&self, dir: &Path) -> bool {
        self.entries.iter().all(|e| dir.join(&e.file).exists())
    }
}

/// コンテナ拡張子の優先順位（先頭ほど優先）
const CONTAINER_PRIORITY: &[&str] = &["mp4", "mkv", "webm", "mov", "flv", "ts"];
/// 映像ストリーム拡張子の優先順位
const VIDEO_PRIORITY: &[&str] = &["mp4", "webm", "mkv"];
/// 音声ストリーム拡張子の優先順位
const AUDIO_PRIORITY: &[&str] = &["m4a", "opus", "aac", "mp3", "ogg", "wav"];
const THUMBNAIL_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp"];

fn mime_type_for(ext: &str) -> String {
    match ext {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "flv" => "video/x-flv",
        "ts" => "video/mp2t",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "mp3" => "audio/mpeg",
        "opus" => "audio/opus",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// ファイル名からアーティファクトを分類
///
/// `.fNNN.`付きのファイルはフォーマット別ストリーム（映像/音声分離）、
/// それ以外の動画拡張子は結合済みコンテナとみなす。
pub fn classify(file_name: &str) -> Option<MediaKind> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())?;

    if THUMBNAIL_EXTS.contains(&ext.as_str()) {
        return Some(MediaKind::Thumbnail);
    }
    if AUDIO_PRIORITY.contains(&ext.as_str()) {
        return Some(MediaKind::Audio);
    }

    let is_split_stream = is_format_coded(file_name);
    if CONTAINER_PRIORITY.contains(&ext.as_str()) {
        if is_split_stream {
            return Some(MediaKind::Video);
        }
        return Some(MediaKind::Container);
    }
    if VIDEO_PRIORITY.contains(&ext.as_str()) {
        return Some(MediaKind::Video);
    }

    None
}

/// yt-dlpのフォーマットコード付きファイル名か（例: media.f137.mp4）
fn is_format_coded(file_name: &str) -> bool {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    match stem.rsplit_once(".f") {
        Some((_, code)) => !code.is_empty() && code.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

fn extension_rank(file_name: &str, priority: &[&str]) -> usize {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    priority
        .iter()
        .position(|p| *p == ext)
        .unwrap_or(priority.len())
}

/// 部分ダウンロードの残骸を掃除
///
/// `.part` / `.ytdl` / `Frag`付きの一時ファイルを削除する。
pub fn cleanup_fragments(dir: &Path) -> PlayqResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".part") || name.ends_with(".ytdl") || name.contains("Frag") {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(file = %name, "⚠️ Failed to remove fragment artifact: {}", e);
            } else {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed = removed, "Fragment artifacts cleaned up");
    }
    Ok(removed)
}

/// ディレクトリを走査してマニフェストを構築
///
/// 結合済みコンテナが1つあればそれのみ、無ければ映像+音声の
/// ペアを拡張子優先順位で選ぶ。再生可能なアーティファクトが
/// 見つからなければエラー。
pub fn build_manifest(dir: &Path, request_id: &str, source_url: &str) -> PlayqResult<Manifest> {
    let mut containers = Vec::new();
    let mut videos = Vec::new();
    let mut audios = Vec::new();
    let mut thumbnails = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == MANIFEST_FILE {
            continue;
        }
        match classify(&name) {
            Some(MediaKind::Container) => containers.push(name),
            Some(MediaKind::Video) => videos.push(name),
            Some(MediaKind::Audio) => audios.push(name),
            Some(MediaKind::Thumbnail) => thumbnails.push(name),
            None => {}
        }
    }

    containers.sort_by_key(|n| extension_rank(n, CONTAINER_PRIORITY));
    videos.sort_by_key(|n| extension_rank(n, VIDEO_PRIORITY));
    audios.sort_by_key(|n| extension_rank(n, AUDIO_PRIORITY));
    thumbnails.sort();

    let mut entries = Vec::new();
    if let Some(container) = containers.first() {
        entries.push(ManifestEntry {
            kind: MediaKind::Container,
            mime_type: mime_type_for(ext_of(container)),
            file: container.clone(),
        });
    } else {
        if let Some(video) = videos.first() {
            entries.push(ManifestEntry {
                kind: MediaKind::Video,
                mime_type: mime_type_for(ext_of(video)),
                file: video.clone(),
            });
        }
        if let Some(audio) = audios.first() {
            entries.push(ManifestEntry {
                kind: MediaKind::Audio,
                mime_type: mime_type_for(ext_of(audio)),
                file: audio.clone(),
            });
        }
    }

    if entries.is_empty() {
        return Err(PlayqError::NoPlayableArtifact(dir.to_path_buf()));
    }

    let thumbnail = thumbnails.first().cloned();
    if let Some(thumb) = &thumbnail {
        entries.push(ManifestEntry {
            kind: MediaKind::Thumbnail,
            mime_type: mime_type_for(ext_of(thumb)),
            file: thumb.clone(),
        });
    }

    let mut total_bytes = 0;
    for entry in &entries {
        total_bytes += fs::metadata(dir.join(&entry.file))?.len();
    }

    Ok(Manifest {
        version: MANIFEST_VERSION,
        request_id: request_id.to_string(),
        source_url: source_url.to_string(),
        thumbnail,
        total_bytes,
        entries,
    })
}

fn ext_of(file_name: &str) -> &str {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
}

/// マニフェストを書き出す
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> PlayqResult<PathBuf> {
    let path = dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, json)?;
    Ok(path)
}

/// マニフェストを読み込む（存在しなければNone）
pub fn read_manifest(dir: &Path) -> PlayqResult<Option<Manifest>> {
    let path = dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(&path)?;
    let manifest: Manifest = serde_json::from_str(&json)?;
    Ok(Some(manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_stable() {
        let a = cache_key("youtube", "dQw4w9WgXcQ");
        let b = cache_key("youtube", "dQw4w9WgXcQ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40); // sha1 hex

        assert_ne!(a, cache_key("youtube", "other"));
        assert_ne!(a, cache_key("niconico", "dQw4w9WgXcQ"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("media.mp4"), Some(MediaKind::Container));
        assert_eq!(classify("media.f137.mp4"), Some(MediaKind::Video));
        assert_eq!(classify("media.f140.m4a"), Some(MediaKind::Audio));
        assert_eq!(classify("media.opus"), Some(MediaKind::Audio));
        assert_eq!(classify("media.jpg"), Some(MediaKind::Thumbnail));
        assert_eq!(classify("media.webp"), Some(MediaKind::Thumbnail));
        assert_eq!(classify("media.info.json"), None);
        assert_eq!(classify("noextension"), None);
    }

    #[test]
    fn test_build_manifest_prefers_single_container() -> PlayqResult<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("media.mp4"), b"av")?;
        std::fs::write(dir.path().join("media.f137.mp4"), b"v")?;
        std::fs::write(dir.path().join("media.f140.m4a"), b"a")?;
        std::fs::write(dir.path().join("media.jpg"), b"t")?;

        let manifest = build_manifest(dir.path(), "r1", "https://example")?;
        assert_eq!(manifest.entries[0].kind, MediaKind::Container);
        assert_eq!(manifest.entries[0].file, "media.mp4");
        assert_eq!(manifest.primary_file(), Some("media.mp4"));
        assert_eq!(manifest.thumbnail.as_deref(), Some("media.jpg"));
        Ok(())
    }

    #[test]
    fn test_build_manifest_split_streams() -> PlayqResult<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("media.f137.mp4"), b"video")?;
        std::fs::write(dir.path().join("media.f140.m4a"), b"audio")?;

        let manifest = build_manifest(dir.path(), "r1", "https://example")?;
        let kinds: Vec<MediaKind> = manifest.entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);
        Ok(())
    }

    #[test]
    fn test_build_manifest_without_playable_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("media.info.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("media.jpg"), b"thumb").unwrap();

        assert!(matches!(
            build_manifest(dir.path(), "r1", "https://example"),
            Err(PlayqError::NoPlayableArtifact(_))
        ));
    }

    #[test]
    fn test_manifest_roundtrip_and_size() -> PlayqResult<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("media.webm"), b"12345")?;

        let manifest = build_manifest(dir.path(), "r1", "https://example")?;
        assert_eq!(manifest.total_bytes, 5);
        write_manifest(dir.path(), &manifest)?;

        let loaded = read_manifest(dir.path())?.unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.total_bytes, 5);

        // 存在しないディレクトリのマニフェストはNone
        assert!(read_manifest(&dir.path().join("missing"))?.is_none());
        Ok(())
    }

    #[test]
    fn test_entries_present_detects_evicted_file() -> PlayqResult<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("media.mp4"), b"av")?;

        let manifest = build_manifest(dir.path(), "r1", "https://example")?;
        assert!(manifest.entries_present(dir.path()));

        std::fs::remove_file(dir.path().join("media.mp4"))?;
        assert!(!manifest.entries_present(dir.path()));
        Ok(())
    }

    #[test]
    fn test_cleanup_fragments() -> PlayqResult<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("media.mp4.part"), b"x")?;
        std::fs::write(dir.path().join("media.mp4.ytdl"), b"x")?;
        std::fs::write(dir.path().join("media.mp4-Frag0001"), b"x")?;
        std::fs::write(dir.path().join("media.mp4"), b"keep")?;

        let removed = cleanup_fragments(dir.path())?;
        assert_eq!(removed, 3);
        assert!(dir.path().join("media.mp4").exists());
        Ok(())
    }
}
