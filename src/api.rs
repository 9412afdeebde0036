pub mod auth; // セッション資格情報・OAuth
pub mod control; // 視聴コントロール WebSocket
pub mod ndgr; // NDGR ワイヤーフォーマット
pub mod watch; // 視聴ページ解決
