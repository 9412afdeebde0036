//! セッション資格情報
//!
//! Bearer トークンとセッション Cookie は排他。どちらか一方をセッションが保持し、
//! 視聴ページ・コメントサーバーへのリクエストに付与する。

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, COOKIE, ORIGIN, REFERER};
use reqwest::RequestBuilder;
use std::fmt;

/// ニコニコのログインセッション Cookie 名
pub const SESSION_COOKIE_NAME: &str = "user_session";

const WATCH_SITE_ORIGIN: &str = "https://live.nicovideo.jp";
const WATCH_SITE_REFERER: &str = "https://live.nicovideo.jp/";

/// セッション資格情報
#[derive(Clone, PartialEq, Eq)]
pub enum SessionCredential {
    /// OAuth アクセストークン
    Bearer(String),
    /// `user_session` の値、または `name=value; ...` 形式の Cookie 文字列
    Cookie(String),
}

impl SessionCredential {
    /// 所有者から渡された文字列を解釈する
    ///
    /// `Bearer` で始まればトークン、それ以外は Cookie として扱う。
    /// トークン部分が空なら `None`。
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        match input.strip_prefix("Bearer") {
            Some(rest) if rest.is_empty() => None,
            Some(rest) if rest.starts_with(char::is_whitespace) => {
                Some(Self::Bearer(rest.trim_start().to_string()))
            }
            _ => Some(Self::Cookie(input.to_string())),
        }
    }

    pub fn is_bearer(&self) -> bool {
        matches!(self, Self::Bearer(_))
    }

    /// Cookie ヘッダー値（Bearer の場合は `None`）
    pub fn cookie_header(&self) -> Option<String> {
        match self {
            Self::Bearer(_) => None,
            Self::Cookie(value) if value.contains('=') => Some(value.clone()),
            Self::Cookie(value) => Some(format!("{}={}", SESSION_COOKIE_NAME, value)),
        }
    }

    /// `user_session` の値を取り出す
    pub fn session_value(&self) -> Option<String> {
        let Self::Cookie(value) = self else {
            return None;
        };
        if !value.contains('=') {
            return Some(value.clone());
        }
        value.split(';').find_map(|part| {
            let (key, val) = part.trim().split_once('=')?;
            (key == SESSION_COOKIE_NAME).then(|| val.to_string())
        })
    }

    /// リクエストに資格情報を付与する
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Bearer(token) => request.bearer_auth(token),
            Self::Cookie(_) => match self.cookie_header() {
                Some(cookie) => request.header(COOKIE, cookie),
                None => request,
            },
        }
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer(token) => write!(f, "Bearer(<{} chars>)", token.len()),
            Self::Cookie(value) => write!(f, "Cookie(<{} chars>)", value.len()),
        }
    }
}

/// コメントサーバー (ポインタ/セグメント) 向けの共通ヘッダー
///
/// 視聴ページからの same-site リクエストとして振る舞う。
pub fn ndgr_request_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ORIGIN, HeaderValue::from_static(WATCH_SITE_ORIGIN));
    headers.insert(REFERER, HeaderValue::from_static(WATCH_SITE_REFERER));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-site"));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("ja"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_and_cookie() {
        assert_eq!(
            SessionCredential::parse("Bearer abc.def"),
            Some(SessionCredential::Bearer("abc.def".into()))
        );
        assert_eq!(
            SessionCredential::parse("  user_session_123  "),
            Some(SessionCredential::Cookie("user_session_123".into()))
        );
        assert_eq!(SessionCredential::parse(""), None);
        assert_eq!(SessionCredential::parse("Bearer "), None);
    }

    #[test]
    fn test_parse_bearer_keyword_boundaries() {
        assert_eq!(SessionCredential::parse("Bearer"), None);
        assert_eq!(SessionCredential::parse("  Bearer \t "), None);
        assert_eq!(
            SessionCredential::parse("Bearer\ttok"),
            Some(SessionCredential::Bearer("tok".into()))
        );
        assert_eq!(
            SessionCredential::parse("Bearerish=1"),
            Some(SessionCredential::Cookie("Bearerish=1".into()))
        );
    }

    #[test]
    fn test_cookie_header_bare_value() {
        let credential = SessionCredential::Cookie("abc123".into());
        assert_eq!(
            credential.cookie_header().as_deref(),
            Some("user_session=abc123")
        );
        assert_eq!(credential.session_value().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_cookie_header_full_string() {
        let raw = "nicosid=1.2; user_session=user_session_9_abc; lang=ja-jp";
        let credential = SessionCredential::Cookie(raw.into());
        assert_eq!(credential.cookie_header().as_deref(), Some(raw));
        assert_eq!(
            credential.session_value().as_deref(),
            Some("user_session_9_abc")
        );
    }

    #[test]
    fn test_bearer_has_no_cookie() {
        let credential = SessionCredential::Bearer("token".into());
        assert!(credential.is_bearer());
        assert!(credential.cookie_header().is_none());
        assert!(credential.session_value().is_none());
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let credential = SessionCredential::Cookie("very-secret".into());
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("very-secret"));
        assert_eq!(printed, "Cookie(<11 chars>)");
    }

    #[test]
    fn test_ndgr_request_headers() {
        let headers = ndgr_request_headers();
        assert_eq!(headers[ORIGIN], "https://live.nicovideo.jp");
        assert_eq!(headers["sec-fetch-site"], "same-site");
        assert_eq!(headers[ACCEPT_LANGUAGE], "ja");
        assert_eq!(headers.len(), 6);
    }

    #[test]
    fn test_apply_sets_header() {
        let client = reqwest::Client::new();
        let request = SessionCredential::Cookie("abc".into())
            .apply(client.get("https://mpn.live.nicovideo.jp/api/view"))
            .build()
            .unwrap();
        assert_eq!(request.headers()[COOKIE], "user_session=abc");

        let request = SessionCredential::Bearer("tok".into())
            .apply(client.get("https://live.nicovideo.jp/watch/lv1"))
            .build()
            .unwrap();
        assert_eq!(
            request.headers()[reqwest::header::AUTHORIZATION],
            "Bearer tok"
        );
    }
}
