//! オーナーへの通知 (コメント・状態変化)

use crate::api::ndgr::DecodedComment;
use crate::api::watch::BroadcastId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// ユーザー ID の無いコメントの表示名
pub const DEFAULT_NICKNAME: &str = "ニコ生";

/// 配信終了時に `BridgeState::error` へ入る文言
pub const PROGRAM_ENDED_MESSAGE: &str = "配信終了";

/// 接続状態
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    #[default]
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("error")]
    Error,
}

/// 状態変化通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeState {
    pub status: BridgeStatus,
    pub viewer_count: u32,
    pub has_session: bool,
    pub broadcast_id: BroadcastId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeState {
    /// 配信終了による切断か。この後セッションは再接続しない
    pub fn is_program_end(&self) -> bool {
        self.status == BridgeStatus::Disconnected
            && self.error.as_deref() == Some(PROGRAM_ENDED_MESSAGE)
    }
}

/// 転送されるコメント
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeComment {
    pub id: String,
    pub no: u32,
    pub text: String,
    pub nickname: String,
    /// 投稿時刻 (unix ミリ秒)
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpos: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub premium: Option<bool>,
}

impl BridgeComment {
    /// デコード結果から作る。投稿時刻が無ければ `now_ms` を使う
    pub fn from_decoded(comment: &DecodedComment, now_ms: i64) -> Self {
        let nickname = match &comment.user_id {
            Some(user_id) => format!("nico:{}", user_id.chars().take(8).collect::<String>()),
            None => DEFAULT_NICKNAME.to_string(),
        };

        Self {
            id: format!("nico-{}", comment.no),
            no: comment.no,
            text: comment.content.clone(),
            nickname,
            timestamp_ms: comment.posted_at.map(|t| t * 1000).unwrap_or(now_ms),
            user_id: comment.user_id.clone(),
            vpos: comment.vpos,
            premium: comment.premium,
        }
    }
}

/// セッションのイベントを受け取る側
///
/// コールバックはセッション内部のタスクから同期的に呼ばれる。重い処理や
/// セッションの `destroy` をここで直接行わないこと。
pub trait BridgeObserver: Send + Sync {
    fn on_comment(&self, comment: BridgeComment);
    fn on_state_change(&self, state: BridgeState);
}

/// イベントをチャネルに流すオブザーバー
pub struct ChannelObserver {
    comments: mpsc::UnboundedSender<BridgeComment>,
    states: mpsc::UnboundedSender<BridgeState>,
}

/// [`ChannelObserver`] の受信側
#[derive(Debug)]
pub struct BridgeEvents {
    pub comments: mpsc::UnboundedReceiver<BridgeComment>,
    pub states: mpsc::UnboundedReceiver<BridgeState>,
}

impl ChannelObserver {
    pub fn new() -> (Self, BridgeEvents) {
        let (comments_tx, comments_rx) = mpsc::unbounded_channel();
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        (
            Self {
                comments: comments_tx,
                states: states_tx,
            },
            BridgeEvents {
                comments: comments_rx,
                states: states_rx,
            },
        )
    }
}

impl BridgeObserver for ChannelObserver {
    fn on_comment(&self, comment: BridgeComment) {
        let _ = self.comments.send(comment);
    }

    fn on_state_change(&self, state: BridgeState) {
        let _ = self.states.send(state);
    }
}

/// 取り外し可能なオブザーバー参照
///
/// `detach` 後はどのイベントも届かない。
pub(crate) struct Emitter {
    observer: RwLock<Option<Arc<dyn BridgeObserver>>>,
}

impl Emitter {
    pub(crate) fn new(observer: Arc<dyn BridgeObserver>) -> Self {
        Self {
            observer: RwLock::new(Some(observer)),
        }
    }

    fn current(&self) -> Option<Arc<dyn BridgeObserver>> {
        self.observer.read().clone()
    }

    pub(crate) fn comment(&self, comment: BridgeComment) {
        if let Some(observer) = self.current() {
            observer.on_comment(comment);
        }
    }

    pub(crate) fn state(&self, state: BridgeState) {
        if let Some(observer) = self.current() {
            observer.on_state_change(state);
        }
    }

    pub(crate) fn detach(&self) {
        self.observer.write().take();
    }
}
