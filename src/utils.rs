//! ロギング初期化・時刻ユーティリティ

use crate::config::LogConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "nicobridge.log";

/// ログ出力を初期化
///
/// `RUST_LOG` が設定されていればそれを優先する。ファイル出力を有効にした場合は
/// 返された [`WorkerGuard`] を保持し続けること (drop すると書き込みが止まる)。
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .or_else(|_| EnvFilter::try_new("info"))?;

    let (file_layer, guard) = if config.enable_file_logging {
        let dir = resolve_log_dir(config);
        std::fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

/// ログディレクトリ（未指定ならXDGデータディレクトリ配下）
pub fn resolve_log_dir(config: &LogConfig) -> PathBuf {
    config.log_dir.clone().unwrap_or_else(|| {
        crate::config::project_dirs()
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"))
    })
}

/// 現在の unix 秒
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 現在の unix ミリ秒
pub fn unix_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// ログ用に本文を短くする
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_log_dir_custom() {
        let config = LogConfig {
            log_dir: Some(PathBuf::from("/tmp/nicobridge-logs")),
            ..LogConfig::default()
        };
        assert_eq!(resolve_log_dir(&config), PathBuf::from("/tmp/nicobridge-logs"));
    }

    #[test]
    fn test_preview_truncates_by_chars() {
        assert_eq!(preview("こんにちは", 10), "こんにちは");
        assert_eq!(preview("こんにちは世界", 5), "こんにちは…");
    }

    #[test]
    fn test_unix_now_consistency() {
        let secs = unix_now();
        let millis = unix_now_ms();
        assert!((millis / 1000 - secs).abs() <= 1);
    }
}
