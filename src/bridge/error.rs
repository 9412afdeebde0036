use crate::api::control::ControlError;
use crate::api::watch::WatchError;
use crate::bridge::events::PROGRAM_ENDED_MESSAGE;

/// ブリッジのエラー
///
/// ライフサイクル API からは返さず、`BridgeState::error` として通知する。
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// 視聴ページの取得失敗
    #[error("Failed to fetch watch data: {0}")]
    Watch(#[from] WatchError),

    /// コントロールチャネルの接続失敗
    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    /// HTTP クライアントの構築失敗
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// ポインタ要求が続けて失敗した
    #[error("Comment stream failed {failures} times in a row: {message}")]
    Stream { failures: u32, message: String },

    /// サーバー応答が想定外 (ソケット URL なし等)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 配信終了。再接続しない
    #[error("{}", PROGRAM_ENDED_MESSAGE)]
    ProgramEnded,
}

impl BridgeError {
    /// 再接続せずに停止すべきか
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ProgramEnded)
    }
}
