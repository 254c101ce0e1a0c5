//! チャットメッセージからの動画URL抽出
//!
//! 組み込みパーサー（YouTube / ニコニコ動画）と運用者定義の
//! カスタムサイト規則でcanonical identityを求める。

use regex::Regex;
use tracing::warn;

use crate::database::ParsedVideo;
use crate::settings::CustomSiteRule;

/// メッセージ中のURLらしきトークンを拾う正規表現
fn url_token_regex() -> Regex {
    Regex::new(r"https?://[^\s　]+").unwrap()
}

/// URL抽出器
pub struct UrlParser {
    token_re: Regex,
    youtube_res: Vec<Regex>,
    niconico_res: Vec<Regex>,
    custom: Vec<(String, Regex)>,
}

impl UrlParser {
    /// カスタムサイト規則付きで作成
    ///
    /// 不正な正規表現を含む規則は警告を出してスキップする。
    pub fn new(rules: &[CustomSiteRule]) -> Self {
        let youtube_res = vec![
            Regex::new(r"youtu\.be/([A-Za-z0-9_-]{6,})").unwrap(),
            Regex::new(r"(?:www\.|m\.|music\.)?youtube\.com/watch\?(?:[^\s]*&)?v=([A-Za-z0-9_-]{6,})")
                .unwrap(),
            Regex::new(r"youtube\.com/shorts/([A-Za-z0-9_-]{6,})").unwrap(),
            Regex::new(r"youtube\.com/embed/([A-Za-z0-9_-]{6,})").unwrap(),
        ];
        let niconico_res = vec![
            Regex::new(r"nicovideo\.jp/watch/((?:sm|nm|so)\d+)").unwrap(),
            Regex::new(r"nico\.ms/((?:sm|nm|so)\d+)").unwrap(),
        ];

        let mut custom = Vec::new();
        for rule in rules {
            match Regex::new(&rule.pattern) {
                Ok(re) => custom.push((rule.site.clone(), re)),
                Err(e) => {
                    warn!(site = %rule.site, "⚠️ Invalid custom site pattern skipped: {}", e);
                }
            }
        }

        Self {
            token_re: url_token_regex(),
            youtube_res,
            niconico_res,
            custom,
        }
    }

    /// メッセージにURLらしきトークンが含まれるか
    ///
    /// リクエスト試行かどうかの判定に使う。URLを含まない通常の
    /// チャットは拒否通知の対象にしない。
    pub fn contains_url(&self, message: &str) -> bool {
        self.token_re.is_match(message)
    }

    /// メッセージからcanonical identityを抽出
    ///
    /// 複数URLがある場合は最初に解釈できたものを採用する。
    pub fn extract(&self, message: &str) -> Option<ParsedVideo> {
        for token in self.token_re.find_iter(message) {
            if let Some(parsed) = self.parse_url(token.as_str()) {
                return Some(parsed);
            }
        }
        None
    }

    /// 単一URLを解釈
    pub fn parse_url(&self, url: &str) -> Option<ParsedVideo> {
        for re in &self.youtube_res {
            if let Some(cap) = re.captures(url) {
                let video_id = cap.get(1)?.as_str().to_string();
                return Some(ParsedVideo {
                    site: "youtube".to_string(),
                    url: format!("https://www.youtube.com/watch?v={}", video_id),
                    video_id,
                });
            }
        }

        for re in &self.niconico_res {
            if let Some(cap) = re.captures(url) {
                let video_id = cap.get(1)?.as_str().to_string();
                return Some(ParsedVideo {
                    site: "niconico".to_string(),
                    url: format!("https://www.nicovideo.jp/watch/{}", video_id),
                    video_id,
                });
            }
        }

        for (site, re) in &self.custom {
            if let Some(cap) = re.captures(url) {
                let video_id = cap.get(1)?.as_str().to_string();
                return Some(ParsedVideo {
                    site: site.clone(),
                    video_id,
                    url: cap.get(0).map(|m| m.as_str().to_string())?,
                });
            }
        }

        None
    }
}

impl Default for UrlParser {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_youtube_short_url() {
        let parser = UrlParser::default();
        let parsed = parser
            .extract("check this out https://youtu.be/dQw4w9WgXcQ")
            .unwrap();
        assert_eq!(parsed.site, "youtube");
        assert_eq!(parsed.video_id, "dQw4w9WgXcQ");
        assert_eq!(parsed.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn test_extract_youtube_watch_variants() {
        let parser = UrlParser::default();
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=10",
            "https://m.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
        ] {
            let parsed = parser.parse_url(url).unwrap();
            assert_eq!(parsed.video_id, "dQw4w9WgXcQ", "failed for {}", url);
            assert_eq!(parsed.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        }
    }

    #[test]
    fn test_canonical_identity_independent_of_formatting() {
        let parser = UrlParser::default();
        let a = parser.parse_url("https://youtu.be/dQw4w9WgXcQ").unwrap();
        let b = parser
            .parse_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ&feature=share")
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_niconico() {
        let parser = UrlParser::default();
        let parsed = parser
            .extract("これ見て https://www.nicovideo.jp/watch/sm9")
            .unwrap();
        assert_eq!(parsed.site, "niconico");
        assert_eq!(parsed.video_id, "sm9");

        let short = parser.parse_url("https://nico.ms/sm9").unwrap();
        assert_eq!(short, parsed);
    }

    #[test]
    fn test_custom_site_rule() {
        let rules = vec![CustomSiteRule {
            site: "example".to_string(),
            pattern: r"https://example\.com/v/(\w+)".to_string(),
        }];
        let parser = UrlParser::new(&rules);
        let parsed = parser.extract("see https://example.com/v/abc99").unwrap();
        assert_eq!(parsed.site, "example");
        assert_eq!(parsed.video_id, "abc99");
    }

    #[test]
    fn test_invalid_custom_pattern_is_skipped() {
        let rules = vec![CustomSiteRule {
            site: "broken".to_string(),
            pattern: "(unclosed".to_string(),
        }];
        let parser = UrlParser::new(&rules);
        assert!(parser.extract("https://broken/abc").is_none());
    }

    #[test]
    fn test_no_url_message() {
        let parser = UrlParser::default();
        assert!(!parser.contains_url("こんにちは"));
        assert!(parser.extract("こんにちは").is_none());

        assert!(parser.contains_url("https://example.com/plain"));
        assert!(parser.extract("https://example.com/plain").is_none());
    }
}
