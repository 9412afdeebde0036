//! ニコニコ生放送のコメントを取得・投稿するブリッジ
//!
//! - [`api`]: 視聴ページ解決、コントロールチャネル、NDGR デコーダ、認証
//! - [`bridge`]: 重複排除台帳、ストリームパイプライン、セッション状態機械
//! - [`io`]: NDJSON 出力

pub mod api;
pub mod bridge;
pub mod config;
pub mod io;
pub mod utils;

pub use api::auth::{OAuthToken, SessionCredential, TokenStore};
pub use api::ndgr::{DecodedComment, FormatError, NdgrStreamDecoder};
pub use api::watch::{extract_broadcast_id, BroadcastId};
pub use bridge::{
    BridgeComment, BridgeError, BridgeEvents, BridgeObserver, BridgeSession, BridgeState,
    BridgeStatus, ChannelObserver,
};
pub use config::{AppConfig, BridgeConfig, ConfigManager, LogConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        assert!(std::any::type_name::<BridgeSession>().contains("BridgeSession"));
        assert!(std::any::type_name::<api::ndgr::NdgrStreamDecoder>().contains("NdgrStreamDecoder"));
        assert!(std::any::type_name::<bridge::Ledger>().contains("Ledger"));
    }

    #[test]
    fn test_extract_broadcast_id_reexport() {
        let id = extract_broadcast_id("https://live.nicovideo.jp/watch/lv345678?ref=top").unwrap();
        assert_eq!(id, BroadcastId("lv345678".to_string()));
    }
}
