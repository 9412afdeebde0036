//! 視聴ページの解決
//!
//! 視聴ページ HTML の `data-props` 属性に埋め込まれた JSON から、
//! コントロール WebSocket の URL と番組ステータスを取り出す。

use super::auth::SessionCredential;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static BROADCAST_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"lv\d+").expect("broadcast id pattern"));

static DATA_PROPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"data-props="([^"]+)""#).expect("data-props pattern"));

/// ソケット URL を探す JSON ポインタ (優先順)
const WEB_SOCKET_URL_POINTERS: [&str; 4] = [
    "/site/relive/webSocketUrl",
    "/program/supplier/wsUrl",
    "/site/url/webSocketUrl",
    "/webSocketUrl",
];

const PROGRAM_STATUS_POINTERS: [&str; 2] = ["/program/status", "/status"];

/// 配信終了を示す番組ステータス
pub const PROGRAM_STATUS_ENDED: &str = "ENDED";

#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Watch page returned {0}")]
    Status(u16),
    #[error("data-props not found")]
    PropsNotFound,
    #[error("Failed to parse data-props: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 放送 ID (`lv` + 数字)
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(pub String);

impl BroadcastId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 放送 ID または視聴 URL から放送 ID を取り出す
pub fn extract_broadcast_id(input: &str) -> Option<BroadcastId> {
    BROADCAST_ID_RE
        .find(input)
        .map(|m| BroadcastId(m.as_str().to_string()))
}

/// 視聴ページから得られる接続情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchData {
    pub web_socket_url: Option<String>,
    pub program_status: Option<String>,
}

impl WatchData {
    pub fn is_ended(&self) -> bool {
        self.program_status.as_deref() == Some(PROGRAM_STATUS_ENDED)
    }
}

/// HTML から `data-props` の JSON 文字列を取り出す
pub fn extract_data_props(html: &str) -> Option<String> {
    DATA_PROPS_RE
        .captures(html)
        .and_then(|cap| cap.get(1))
        .map(|m| {
            m.as_str()
                .replace("&quot;", "\"")
                .replace("&amp;", "&")
                .replace("&lt;", "<")
                .replace("&gt;", ">")
        })
}

fn first_string(props: &Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|pointer| props.pointer(pointer))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// 視聴ページ HTML を解析する
pub fn parse_watch_page(html: &str) -> Result<WatchData, WatchError> {
    let props_json = extract_data_props(html).ok_or(WatchError::PropsNotFound)?;
    let props: Value = serde_json::from_str(&props_json)?;

    let data = WatchData {
        web_socket_url: first_string(&props, &WEB_SOCKET_URL_POINTERS),
        program_status: first_string(&props, &PROGRAM_STATUS_POINTERS),
    };

    if let Some(status) = &data.program_status {
        tracing::debug!("Program status: {}", status);
    }
    if data.web_socket_url.is_none() {
        let keys = props
            .as_object()
            .map(|o| o.keys().cloned().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        tracing::warn!(
            "⚠️ WebSocket URL not found in props (keys: {}, status: {})",
            keys,
            data.program_status.as_deref().unwrap_or("unknown")
        );
    }

    Ok(data)
}

/// 放送 ID から接続情報を得る
#[async_trait]
pub trait BroadcastResolver: Send + Sync {
    async fn resolve(
        &self,
        broadcast_id: &BroadcastId,
        credential: Option<&SessionCredential>,
    ) -> Result<WatchData, WatchError>;
}

/// 視聴ページを HTTP で取得する実装
pub struct HttpWatchResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWatchResolver {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn watch_url(&self, broadcast_id: &BroadcastId) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), broadcast_id)
    }
}

#[async_trait]
impl BroadcastResolver for HttpWatchResolver {
    async fn resolve(
        &self,
        broadcast_id: &BroadcastId,
        credential: Option<&SessionCredential>,
    ) -> Result<WatchData, WatchError> {
        let url = self.watch_url(broadcast_id);
        tracing::debug!("🌐 Fetching watch page: {}", url);

        let mut request = self.client.get(&url);
        if let Some(credential) = credential {
            request = credential.apply(request);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            tracing::warn!("❌ Watch page fetch failed: {}", response.status());
            return Err(WatchError::Status(response.status().as_u16()));
        }

        let html = response.text().await?;
        parse_watch_page(&html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_props(json: &str) -> String {
        let escaped = json
            .replace('&', "&amp;")
            .replace('"', "&quot;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        format!(
            r#"<html><body><script id="embedded-data" data-props="{}"></script></body></html>"#,
            escaped
        )
    }

    #[test]
    fn test_extract_broadcast_id() {
        assert_eq!(
            extract_broadcast_id("https://live.nicovideo.jp/watch/lv345678901?ref=top"),
            Some(BroadcastId("lv345678901".into()))
        );
        assert_eq!(
            extract_broadcast_id("lv1").map(|id| id.to_string()),
            Some("lv1".to_string())
        );
        assert_eq!(extract_broadcast_id("https://live.nicovideo.jp/"), None);
    }

    #[test]
    fn test_extract_data_props_unescapes() {
        let html = page_with_props(r#"{"a":"x&y","b":"<tag>"}"#);
        assert_eq!(
            extract_data_props(&html).unwrap(),
            r#"{"a":"x&y","b":"<tag>"}"#
        );
    }

    #[test]
    fn test_parse_watch_page_relive_url() {
        let html = page_with_props(
            r#"{"site":{"relive":{"webSocketUrl":"wss://a.live2.nicovideo.jp/wsapi/v2/watch/1?audience_token=x&frontend_id=9"}},"program":{"status":"ON_AIR"}}"#,
        );
        let data = parse_watch_page(&html).unwrap();
        assert_eq!(
            data.web_socket_url.as_deref(),
            Some("wss://a.live2.nicovideo.jp/wsapi/v2/watch/1?audience_token=x&frontend_id=9")
        );
        assert_eq!(data.program_status.as_deref(), Some("ON_AIR"));
        assert!(!data.is_ended());
    }

    #[test]
    fn test_parse_watch_page_fallback_pointers() {
        let html = page_with_props(
            r#"{"site":{"relive":{"webSocketUrl":""}},"program":{"supplier":{"wsUrl":"wss://b/ws"}}}"#,
        );
        let data = parse_watch_page(&html).unwrap();
        assert_eq!(data.web_socket_url.as_deref(), Some("wss://b/ws"));

        let html = page_with_props(r#"{"webSocketUrl":"wss://c/ws","status":"ENDED"}"#);
        let data = parse_watch_page(&html).unwrap();
        assert_eq!(data.web_socket_url.as_deref(), Some("wss://c/ws"));
        assert!(data.is_ended());
    }

    #[test]
    fn test_parse_watch_page_ended_without_socket() {
        let html = page_with_props(r#"{"program":{"status":"ENDED"}}"#);
        let data = parse_watch_page(&html).unwrap();
        assert!(data.web_socket_url.is_none());
        assert!(data.is_ended());
    }

    #[test]
    fn test_parse_watch_page_errors() {
        assert!(matches!(
            parse_watch_page("<html></html>"),
            Err(WatchError::PropsNotFound)
        ));
        assert!(matches!(
            parse_watch_page(r#"<div data-props="{broken"></div>"#),
            Err(WatchError::Parse(_))
        ));
    }

    #[test]
    fn test_watch_url() {
        let resolver = HttpWatchResolver::new(
            reqwest::Client::new(),
            "https://live.nicovideo.jp/watch/",
        );
        assert_eq!(
            resolver.watch_url(&BroadcastId("lv9".into())),
            "https://live.nicovideo.jp/watch/lv9"
        );
    }
}
