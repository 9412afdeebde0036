//! 設定 (TOML)
//!
//! `[bridge]` `[log]` `[oauth]` の 3 テーブル。省略したキーは既定値になる。

use crate::api::auth::OAuthClientConfig;
use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// ブラウザと同等の User-Agent
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// XDG プロジェクトディレクトリ
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "nicobridge", "nicobridge")
}

/// ブリッジ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// 視聴ページの URL プレフィックス
    pub watch_base_url: String,
    pub user_agent: String,
    /// 1 秒あたりの転送上限
    pub max_comments_per_second: u32,
    /// これより古いコメントは転送しない (秒)
    pub max_comment_age_secs: i64,
    /// 終了からこれ以上経ったセグメントは取得しない (秒)
    pub max_segment_age_secs: i64,
    pub seen_comment_capacity: usize,
    pub seen_segment_capacity: usize,
    /// 自分の投稿のエコー抑制期間 (秒)
    pub echo_ttl_secs: u64,
    pub echo_capacity: usize,
    /// ポインタ要求の最小間隔 (ミリ秒)
    pub min_view_interval_ms: u64,
    /// 次ポインタ待ちの上限 (ミリ秒)
    pub view_safety_timeout_ms: u64,
    /// ポインタ要求失敗後の再試行間隔の初期値 (ミリ秒、失敗ごとに倍)
    pub view_retry_min_ms: u64,
    /// ポインタ要求がこの回数続けて失敗したらセッションを再接続させる
    pub max_view_failures: u32,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    /// seat に間隔が無い場合の keepSeat 間隔 (秒)
    pub default_keep_seat_secs: u64,
    pub stream_quality: String,
    pub stream_latency: String,
    pub post_anonymously: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            watch_base_url: "https://live.nicovideo.jp/watch".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_comments_per_second: 50,
            max_comment_age_secs: 10,
            max_segment_age_secs: 20,
            seen_comment_capacity: 10_000,
            seen_segment_capacity: 1_000,
            echo_ttl_secs: 30,
            echo_capacity: 1_000,
            min_view_interval_ms: 200,
            view_safety_timeout_ms: 30_000,
            view_retry_min_ms: 1_000,
            max_view_failures: 3,
            reconnect_min_ms: 3_000,
            reconnect_max_ms: 60_000,
            default_keep_seat_secs: 30,
            stream_quality: "abr".to_string(),
            stream_latency: "low".to_string(),
            post_anonymously: true,
        }
    }
}

impl BridgeConfig {
    pub fn echo_ttl(&self) -> Duration {
        Duration::from_secs(self.echo_ttl_secs)
    }

    pub fn min_view_interval(&self) -> Duration {
        Duration::from_millis(self.min_view_interval_ms)
    }

    pub fn view_safety_timeout(&self) -> Duration {
        Duration::from_millis(self.view_safety_timeout_ms)
    }

    pub fn view_retry_min(&self) -> Duration {
        Duration::from_millis(self.view_retry_min_ms)
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn default_keep_seat(&self) -> Duration {
        Duration::from_secs(self.default_keep_seat_secs)
    }

    /// 動作しない組み合わせを弾く
    pub fn validate(&self) -> Result<()> {
        if self.max_comments_per_second == 0 {
            bail!("bridge.max_comments_per_second must be at least 1");
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            bail!(
                "bridge.reconnect_min_ms ({}) must be in 1..=reconnect_max_ms ({})",
                self.reconnect_min_ms,
                self.reconnect_max_ms
            );
        }
        if self.max_view_failures == 0 {
            bail!("bridge.max_view_failures must be at least 1");
        }
        if self.seen_comment_capacity == 0 || self.seen_segment_capacity == 0 {
            bail!("bridge seen-set capacities must be at least 1");
        }
        if !self.watch_base_url.starts_with("http") {
            bail!("bridge.watch_base_url must be an http(s) URL");
        }
        Ok(())
    }
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 未指定ならデータディレクトリ配下の `logs`
    pub log_dir: Option<PathBuf>,
    /// `RUST_LOG` 未設定時のフィルタ
    pub log_level: String,
    /// 日次ローテーションのファイル出力
    pub enable_file_logging: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".into(),
            enable_file_logging: false,
        }
    }
}

/// 設定ファイル全体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bridge: BridgeConfig,
    pub log: LogConfig,
    /// OAuth クライアント (`login` と トークン更新に必要)
    pub oauth: Option<OAuthClientConfig>,
}

/// 設定ファイルの読み書き
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// 既定の場所 (`<config_dir>/config.toml`)
    pub fn new() -> Result<Self> {
        let dirs = project_dirs().context("No home directory to place config.toml in")?;
        Self::with_path(dirs.config_dir().join("config.toml"))
    }

    /// 親ディレクトリが無ければ作る
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        tracing::debug!("Config path: {}", path.display());
        Ok(Self { path })
    }

    /// 読み込んで検証する。ファイルが無ければ既定値
    pub fn load_config(&self) -> Result<AppConfig> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(text) => toml::from_str::<AppConfig>(&text)
                .with_context(|| format!("Invalid TOML in {}", self.path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("📄 No config at {}, using defaults", self.path.display());
                return Ok(AppConfig::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", self.path.display()))
            }
        };

        config
            .bridge
            .validate()
            .with_context(|| format!("Invalid settings in {}", self.path.display()))?;
        tracing::info!("✅ Config loaded: {}", self.path.display());
        Ok(config)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let text = toml::to_string_pretty(config).context("Cannot serialize config")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("Cannot write {}", self.path.display()))?;
        tracing::info!("💾 Config saved: {}", self.path.display());
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }

    pub fn config_exists(&self) -> bool {
        self.path.exists()
    }
}
