//! OAuth トークンの保存・読み込み

use super::oauth::{self, OAuthClientConfig, OAuthToken, REFRESH_MARGIN_SECS};
use super::{AuthError, AuthResult};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// トークンファイルの構造
#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    niconico: OAuthToken,
}

/// トークン保存先
pub struct TokenStore {
    /// 保存ファイルのパス
    path: PathBuf,
}

impl TokenStore {
    /// 新しいTokenStoreを作成
    ///
    /// # Arguments
    ///
    /// * `config_dir` - 設定ディレクトリのパス（例: ~/.config/nicobridge）
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            path: config_dir.join("oauth_token.toml"),
        }
    }

    /// デフォルトの設定ディレクトリを使用してTokenStoreを作成
    pub fn with_default_dir() -> AuthResult<Self> {
        let config_dir = crate::config::project_dirs()
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| {
                AuthError::TokenNotFound("Failed to determine config directory".into())
            })?;

        Ok(Self::new(config_dir))
    }

    /// トークンを保存
    pub fn save(&self, token: &OAuthToken) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = TokenFile {
            niconico: token.clone(),
        };
        let toml_string = toml::to_string_pretty(&file)?;
        fs::write(&self.path, toml_string)
            .map_err(|e| AuthError::SaveError(format!("{}: {}", self.path.display(), e)))?;

        tracing::info!("💾 OAuth token saved");
        Ok(())
    }

    /// トークンをそのまま読み込む（期限は確認しない）
    pub fn load(&self) -> AuthResult<OAuthToken> {
        if !self.path.exists() {
            return Err(AuthError::TokenNotFound(self.path.display().to_string()));
        }

        let content = fs::read_to_string(&self.path)?;
        let file: TokenFile = toml::from_str(&content)?;
        Ok(file.niconico)
    }

    /// 有効なトークンを読み込む
    ///
    /// 期限切れ間近ならリフレッシュして保存し直す。リフレッシュできない場合は
    /// 保存済みトークンを削除して `None` を返す。
    pub async fn load_valid(
        &self,
        client: &reqwest::Client,
        config: Option<&OAuthClientConfig>,
    ) -> AuthResult<Option<OAuthToken>> {
        let token = match self.load() {
            Ok(token) => token,
            Err(AuthError::TokenNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if !token.expires_within(Duration::seconds(REFRESH_MARGIN_SECS), Utc::now()) {
            return Ok(Some(token));
        }

        let (Some(refresh), Some(config)) = (token.refresh_token.as_deref(), config) else {
            tracing::info!("⌛ OAuth token expired and cannot be refreshed");
            self.delete()?;
            return Ok(None);
        };

        tracing::info!("⌛ OAuth token expiring, refreshing...");
        match oauth::refresh_token(client, config, refresh).await {
            Ok(fresh) => {
                self.save(&fresh)?;
                Ok(Some(fresh))
            }
            Err(e) => {
                tracing::warn!("❌ Token refresh failed: {}", e);
                self.delete()?;
                Ok(None)
            }
        }
    }

    /// トークンが存在するか確認
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// トークンを削除（連携解除）
    pub fn delete(&self) -> AuthResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            tracing::info!("🗑️ OAuth token cleared");
        }
        Ok(())
    }

    /// 保存ファイルのパスを取得
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
