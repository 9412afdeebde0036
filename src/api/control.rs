//! 視聴コントロールチャネル (WebSocket)
//!
//! 視聴セッションの WebSocket に接続し、JSON のコントロールメッセージを
//! [`ControlMessage`] に変換してセッションへ渡す。送信側は [`ControlHandle`]
//! 経由でキューに積み、ソケットタスクが順番に書き出す。
//!
//! ## メッセージ
//!
//! | type | 内容 |
//! |---|---|
//! | `seat` | 座席確保。`keepIntervalSec` ごとに `keepSeat` が必要 |
//! | `ping` | 即座に `pong` を返す |
//! | `statistics` | 視聴者数・コメント数 |
//! | `room` | 旧コメントサーバー情報 (互換のみ) |
//! | `messageServer` | コメント配信 (NDGR) の入口 URI |
//! | `disconnect` | サーバー側からの切断 (`END_PROGRAM`, `CROWDED` など) |
//! | `postCommentResult` | コメント投稿結果 |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// 配信終了を示す切断理由
pub const REASON_END_PROGRAM: &str = "END_PROGRAM";
/// 混雑による切断理由
pub const REASON_CROWDED: &str = "CROWDED";
/// 通常クローズのステータスコード
pub const CLOSE_NORMAL: u16 = 1000;
/// postkey 期限切れを示す投稿結果コード
pub const RESULT_POSTKEY_EXPIRED: i64 = 4;

/// コントロールチャネルのエラー
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// サーバーから届くコントロールメッセージ
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Seat {
        keep_interval_sec: Option<u64>,
    },
    Ping,
    Statistics {
        viewers: u32,
        comments: Option<u32>,
    },
    Room {
        thread_id: Option<String>,
    },
    MessageServer {
        view_uri: Option<String>,
        vpos_base_time: Option<DateTime<Utc>>,
    },
    AkashicMessageServer,
    Disconnect {
        reason: Option<String>,
    },
    PostCommentResult {
        result_code: Option<i64>,
    },
    Unknown {
        kind: String,
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeatData {
    keep_interval_sec: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StatisticsData {
    viewers: Option<u32>,
    comments: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomData {
    thread_id: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageServerData {
    view_uri: Option<String>,
    vpos_base_uri: Option<String>,
    vpos_base_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DisconnectData {
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PostCommentResultData {
    chat: Option<PostCommentResultChat>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostCommentResultChat {
    result_code: Option<i64>,
}

fn data_or_default<T: DeserializeOwned + Default>(data: Value) -> Result<T, serde_json::Error> {
    if data.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(data)
    }
}

impl ControlMessage {
    /// JSON テキストを解釈する
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_str(text)?;

        let message = match raw.kind.as_str() {
            "seat" => {
                let data: SeatData = data_or_default(raw.data)?;
                Self::Seat {
                    keep_interval_sec: data.keep_interval_sec,
                }
            }
            "ping" => Self::Ping,
            "statistics" => {
                let data: StatisticsData = data_or_default(raw.data)?;
                Self::Statistics {
                    viewers: data.viewers.unwrap_or(0),
                    comments: data.comments,
                }
            }
            "room" => {
                let data: RoomData = data_or_default(raw.data)?;
                Self::Room {
                    thread_id: data.thread_id.map(|id| match id {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }),
                }
            }
            "messageServer" => {
                let data: MessageServerData = data_or_default(raw.data)?;
                Self::MessageServer {
                    view_uri: data
                        .view_uri
                        .filter(|uri| !uri.is_empty())
                        .or(data.vpos_base_uri.filter(|uri| !uri.is_empty())),
                    vpos_base_time: data
                        .vpos_base_time
                        .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                        .map(|t| t.with_timezone(&Utc)),
                }
            }
            "akashicMessageServer" => Self::AkashicMessageServer,
            "disconnect" => {
                let data: DisconnectData = data_or_default(raw.data)?;
                Self::Disconnect {
                    reason: data.reason,
                }
            }
            "postCommentResult" => {
                let data: PostCommentResultData = data_or_default(raw.data)?;
                Self::PostCommentResult {
                    result_code: data.chat.and_then(|chat| chat.result_code),
                }
            }
            _ => Self::Unknown {
                kind: raw.kind,
                data: raw.data,
            },
        };

        Ok(message)
    }
}

/// クライアントから送るメッセージ
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum OutboundMessage {
    StartWatching(StartWatching),
    Pong,
    KeepSeat,
    PostComment(PostComment),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWatching {
    pub stream: StreamRequest,
    pub room: RoomRequest,
    pub reconnect: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub quality: String,
    pub protocol: String,
    pub latency: String,
    pub chase_play: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub protocol: String,
    pub commentable: bool,
}

impl StartWatching {
    /// 公式プレイヤーと同じ形式のハンドシェイク (コメント可能な部屋を要求)
    pub fn new(quality: &str, latency: &str) -> Self {
        Self {
            stream: StreamRequest {
                quality: quality.to_string(),
                protocol: "hls+fmp4".to_string(),
                latency: latency.to_string(),
                chase_play: false,
            },
            room: RoomRequest {
                protocol: "webSocket".to_string(),
                commentable: true,
            },
            reconnect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostComment {
    pub text: String,
    pub vpos: i64,
    pub is_anonymous: bool,
}

/// ソケットタスクからセッションへのイベント
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Message(ControlMessage),
    /// 明示的なクローズ以外でソケットが閉じた
    Closed { code: Option<u16>, reason: String },
}

impl ControlEvent {
    /// 配信終了によるクローズか
    pub fn is_program_end(&self) -> bool {
        matches!(
            self,
            Self::Closed { code: Some(CLOSE_NORMAL), reason } if reason == REASON_END_PROGRAM
        )
    }
}

/// 送信キューへのハンドル
#[derive(Debug, Clone)]
pub struct ControlHandle {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    cancel: CancellationToken,
}

impl ControlHandle {
    /// 送信キューに積む。チャネルが閉じていれば `false`
    pub fn send(&self, message: OutboundMessage) -> bool {
        !self.cancel.is_cancelled() && self.outbound.send(message).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// ソケットを閉じる (Closed イベントは発行されない)
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// 接続済みチャネル (セッション側)
#[derive(Debug)]
pub struct ControlConnection {
    pub handle: ControlHandle,
    pub events: mpsc::UnboundedReceiver<ControlEvent>,
}

/// 接続済みチャネル (トランスポート側)
#[derive(Debug)]
pub struct ControlPeer {
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    pub events: mpsc::UnboundedSender<ControlEvent>,
    pub cancel: CancellationToken,
}

impl ControlConnection {
    /// セッション側とトランスポート側の組を作る
    pub fn pair() -> (Self, ControlPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        (
            Self {
                handle: ControlHandle {
                    outbound: outbound_tx,
                    cancel: cancel.clone(),
                },
                events: events_rx,
            },
            ControlPeer {
                outbound: outbound_rx,
                events: events_tx,
                cancel,
            },
        )
    }
}

/// コントロールチャネルの接続方法
#[async_trait]
pub trait ControlConnector: Send + Sync {
    /// 接続し、`handshake` を最初のメッセージとして送る
    async fn connect(
        &self,
        url: &str,
        handshake: OutboundMessage,
    ) -> Result<ControlConnection, ControlError>;
}

/// WebSocket によるコントロールチャネル
pub struct WebSocketConnector {
    user_agent: String,
}

impl WebSocketConnector {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl ControlConnector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
        handshake: OutboundMessage,
    ) -> Result<ControlConnection, ControlError> {
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_str(&self.user_agent)?);

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        tracing::info!("🔌 Control socket connected");

        let (connection, peer) = ControlConnection::pair();
        connection.handle.send(handshake);
        tokio::spawn(run_socket(ws_stream, peer));

        Ok(connection)
    }
}

async fn run_socket(ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>, mut peer: ControlPeer) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = peer.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                tracing::debug!("🔌 Control socket closed by owner");
                break;
            }
            outbound = peer.outbound.recv() => {
                let Some(message) = outbound else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("⚠️ Failed to serialize control message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    tracing::warn!("❌ Control socket send failed: {}", e);
                    let _ = peer.events.send(ControlEvent::Closed {
                        code: None,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ControlMessage::parse(&text) {
                        Ok(message) => {
                            let _ = peer.events.send(ControlEvent::Message(message));
                        }
                        Err(e) => tracing::debug!("Unparseable control message: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        tracing::info!("🔌 Control socket closed: code={:?} reason={}", code, reason);
                        let _ = peer.events.send(ControlEvent::Closed { code, reason });
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("❌ Control socket error: {}", e);
                        let _ = peer.events.send(ControlEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        let _ = peer.events.send(ControlEvent::Closed {
                            code: None,
                            reason: String::new(),
                        });
                        break;
                    }
                }
            }
        }
    }

    peer.cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_seat_and_ping() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"seat","data":{"keepIntervalSec":30}}"#).unwrap(),
            ControlMessage::Seat {
                keep_interval_sec: Some(30)
            }
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ControlMessage::Ping
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type":"seat","data":null}"#).unwrap(),
            ControlMessage::Seat {
                keep_interval_sec: None
            }
        );
    }

    #[test]
    fn test_parse_statistics() {
        let message = ControlMessage::parse(
            r#"{"type":"statistics","data":{"viewers":1234,"comments":56,"adPoints":0}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            ControlMessage::Statistics {
                viewers: 1234,
                comments: Some(56)
            }
        );
    }

    #[test]
    fn test_parse_message_server() {
        let message = ControlMessage::parse(
            r#"{"type":"messageServer","data":{"viewUri":"https://mpn.live.nicovideo.jp/api/view/v4/abc","vposBaseTime":"2024-08-05T12:00:00+09:00","hashedUserId":"a:xyz"}}"#,
        )
        .unwrap();

        let ControlMessage::MessageServer {
            view_uri,
            vpos_base_time,
        } = message
        else {
            panic!("expected messageServer");
        };
        assert_eq!(
            view_uri.as_deref(),
            Some("https://mpn.live.nicovideo.jp/api/view/v4/abc")
        );
        assert_eq!(vpos_base_time.unwrap().timestamp(), 1722826800);
    }

    #[test]
    fn test_parse_message_server_fallback_uri() {
        let message = ControlMessage::parse(
            r#"{"type":"messageServer","data":{"viewUri":"","vposBaseUri":"https://example.com/view"}}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            ControlMessage::MessageServer {
                view_uri: Some("https://example.com/view".into()),
                vpos_base_time: None
            }
        );
    }

    #[test]
    fn test_parse_disconnect_and_post_result() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"disconnect","data":{"reason":"END_PROGRAM"}}"#)
                .unwrap(),
            ControlMessage::Disconnect {
                reason: Some(REASON_END_PROGRAM.into())
            }
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type":"postCommentResult","data":{"chat":{"resultCode":4}}}"#)
                .unwrap(),
            ControlMessage::PostCommentResult {
                result_code: Some(RESULT_POSTKEY_EXPIRED)
            }
        );
    }

    #[test]
    fn test_parse_room_numeric_thread_id() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"room","data":{"threadId":12345}}"#).unwrap(),
            ControlMessage::Room {
                thread_id: Some("12345".into())
            }
        );
    }

    #[test]
    fn test_parse_unknown_kind() {
        let message = ControlMessage::parse(r#"{"type":"schedule","data":{"begin":"x"}}"#).unwrap();
        assert_eq!(
            message,
            ControlMessage::Unknown {
                kind: "schedule".into(),
                data: json!({"begin": "x"})
            }
        );
        assert!(ControlMessage::parse("not json").is_err());
    }

    #[test]
    fn test_outbound_start_watching_format() {
        let message = OutboundMessage::StartWatching(StartWatching::new("abr", "low"));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "startWatching",
                "data": {
                    "stream": {
                        "quality": "abr",
                        "protocol": "hls+fmp4",
                        "latency": "low",
                        "chasePlay": false
                    },
                    "room": { "protocol": "webSocket", "commentable": true },
                    "reconnect": false
                }
            })
        );
    }

    #[test]
    fn test_outbound_unit_and_post_format() {
        assert_eq!(
            serde_json::to_value(OutboundMessage::Pong).unwrap(),
            json!({"type": "pong"})
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::KeepSeat).unwrap(),
            json!({"type": "keepSeat"})
        );
        let post = OutboundMessage::PostComment(PostComment {
            text: "こんにちは".into(),
            vpos: 1500,
            is_anonymous: true,
        });
        assert_eq!(
            serde_json::to_value(post).unwrap(),
            json!({"type": "postComment", "data": {"text": "こんにちは", "vpos": 1500, "isAnonymous": true}})
        );
    }

    #[test]
    fn test_close_event_program_end() {
        let end = ControlEvent::Closed {
            code: Some(1000),
            reason: "END_PROGRAM".into(),
        };
        assert!(end.is_program_end());

        let other = ControlEvent::Closed {
            code: Some(1006),
            reason: "END_PROGRAM".into(),
        };
        assert!(!other.is_program_end());
    }

    #[tokio::test]
    async fn test_connection_pair_routes_messages() {
        let (mut connection, mut peer) = ControlConnection::pair();

        assert!(connection.handle.send(OutboundMessage::Pong));
        assert_eq!(peer.outbound.recv().await, Some(OutboundMessage::Pong));

        peer.events
            .send(ControlEvent::Message(ControlMessage::Ping))
            .unwrap();
        assert_eq!(
            connection.events.recv().await,
            Some(ControlEvent::Message(ControlMessage::Ping))
        );

        connection.handle.close();
        assert!(!connection.handle.is_open());
        assert!(!connection.handle.send(OutboundMessage::KeepSeat));
        assert!(peer.cancel.is_cancelled());
    }
}
