//! ニコニコ OAuth2 (認可コードフロー)
//!
//! 認可画面の表示はブラウザ側の責務。ここでは認可 URL の組み立て、
//! コールバック URL からのコード取り出し、トークン交換とリフレッシュを行う。

use super::{AuthError, AuthResult, SessionCredential};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const AUTHORIZE_URL: &str = "https://oauth.nicovideo.jp/oauth2/authorize";
pub const TOKEN_URL: &str = "https://oauth.nicovideo.jp/oauth2/token";

/// 期限切れ判定のマージン
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// OAuth クライアント設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// アクセストークン
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    /// `now + margin` までに期限が切れるか
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at < now + margin
    }

    /// セッション資格情報に変換
    pub fn credential(&self) -> SessionCredential {
        SessionCredential::Bearer(self.access_token.clone())
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// トークンエンドポイントの応答
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>, previous_refresh: Option<&str>) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(default_token_type),
            expires_at: now + Duration::seconds(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
        }
    }
}

/// 認可画面の URL を組み立てる
pub fn authorize_url(config: &OAuthClientConfig) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}",
        AUTHORIZE_URL,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(&config.redirect_uri)
    )
}

/// コールバック URL から認可コードを取り出す
pub fn extract_authorization_code(callback_url: &str) -> AuthResult<String> {
    let url = reqwest::Url::parse(callback_url)
        .map_err(|e| AuthError::Authorization(format!("invalid callback URL: {}", e)))?;

    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => return Ok(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    Err(AuthError::Authorization(
        error.unwrap_or_else(|| "No authorization code".to_string()),
    ))
}

async fn request_token(
    client: &reqwest::Client,
    form: &[(&str, &str)],
    previous_refresh: Option<&str>,
) -> AuthResult<OAuthToken> {
    let response = client.post(TOKEN_URL).form(form).send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!("❌ Token endpoint error: {}", status);
        return Err(AuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    let data: TokenResponse = response.json().await?;
    Ok(data.into_token(Utc::now(), previous_refresh))
}

/// 認可コードをアクセストークンに交換
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &OAuthClientConfig,
    code: &str,
) -> AuthResult<OAuthToken> {
    let token = request_token(
        client,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
            ("redirect_uri", &config.redirect_uri),
        ],
        None,
    )
    .await?;

    tracing::info!("🔑 Authorization code exchanged");
    Ok(token)
}

/// リフレッシュトークンでアクセストークンを更新
///
/// 応答にリフレッシュトークンが無ければ、渡されたものを引き継ぐ。
pub async fn refresh_token(
    client: &reqwest::Client,
    config: &OAuthClientConfig,
    refresh_token: &str,
) -> AuthResult<OAuthToken> {
    let token = request_token(
        client,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
        ],
        Some(refresh_token),
    )
    .await?;

    tracing::info!("🔄 OAuth token refreshed");
    Ok(token)
}
