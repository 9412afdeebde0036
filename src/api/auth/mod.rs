//! ニコニコ認証モジュール
//!
//! ブリッジの各リクエストに付与するセッション資格情報と、OAuth2 トークンの管理を提供します。
//!
//! ## 機能
//!
//! - セッション資格情報（Bearer トークン / セッション Cookie のどちらか一方）
//! - OAuth2 認可コード交換・リフレッシュ
//! - トークンの保存・読み込み（TOML）

mod credential;
pub mod oauth;
mod token_store;

pub use credential::{ndgr_request_headers, SessionCredential, SESSION_COOKIE_NAME};
pub use oauth::{OAuthClientConfig, OAuthToken};
pub use token_store::TokenStore;

/// 認証関連のエラー型
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// トークンが見つからない
    #[error("OAuth token not found: {0}")]
    TokenNotFound(String),

    /// トークン期限切れ（リフレッシュ不可）
    #[error("OAuth token expired")]
    Expired,

    /// トークンエンドポイントのエラー応答
    #[error("Token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    /// 認可フローのエラー
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// HTTPエラー
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// トークン保存エラー
    #[error("Failed to save token: {0}")]
    SaveError(String),

    /// I/Oエラー
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML解析エラー
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOMLシリアライズエラー
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub type AuthResult<T> = Result<T, AuthError>;
