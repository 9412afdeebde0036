//! nicobridge CLI
//!
//! 放送に接続してコメントを標準出力 (と任意で NDJSON ファイル) に流す。
//! `--post` を付けると標準入力の各行をコメントとして投稿する。

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nicobridge::api::auth::{oauth, SessionCredential, TokenStore};
use nicobridge::api::watch::extract_broadcast_id;
use nicobridge::bridge::{BridgeSession, BridgeState, ChannelObserver};
use nicobridge::config::{AppConfig, BridgeConfig, ConfigManager};
use nicobridge::io::{NdjsonWriter, OutputRecord};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nicobridge", version)]
#[command(about = "ニコニコ生放送のコメントブリッジ")]
struct Cli {
    /// 設定ファイル (省略時は XDG 設定ディレクトリの config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// ログレベル (設定ファイルより優先)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 放送に接続してコメントを受信する
    Watch(WatchArgs),
    /// OAuth で認可してトークンを保存する
    Login,
    /// 保存済みの OAuth トークンを削除する
    Logout,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// 放送 ID (lv...) または視聴ページの URL
    broadcast: String,

    /// `user_session` Cookie (値のみ、または `name=value; ...` 形式)
    #[arg(long, conflicts_with = "oauth")]
    cookie: Option<String>,

    /// 保存済みの OAuth トークンを使う
    #[arg(long)]
    oauth: bool,

    /// NDJSON の出力先
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 出力ファイルに追記する
    #[arg(long, requires = "output")]
    append: bool,

    /// 標準入力の各行をコメントとして投稿する
    #[arg(long)]
    post: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };
    let mut config = config_manager.load_config().unwrap_or_else(|e| {
        eprintln!("設定読み込みエラー、デフォルト設定を使用: {:#}", e);
        AppConfig::default()
    });
    if let Some(level) = cli.log_level {
        config.log.log_level = level;
    }

    // ファイル出力時はガードを最後まで保持する
    let _log_guard = nicobridge::utils::init_logging(&config.log)?;

    match cli.command {
        Command::Watch(args) => watch(args, config).await,
        Command::Login => login(config).await,
        Command::Logout => {
            let store = TokenStore::with_default_dir()?;
            store.delete()?;
            info!("🗑️ OAuth token deleted: {}", store.path().display());
            Ok(())
        }
    }
}

fn http_client(config: &BridgeConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .build()
        .context("Failed to build HTTP client")
}

async fn resolve_credential(
    args: &WatchArgs,
    config: &AppConfig,
) -> Result<Option<SessionCredential>> {
    if let Some(cookie) = &args.cookie {
        return Ok(SessionCredential::parse(cookie));
    }
    if !args.oauth {
        return Ok(None);
    }

    let client = http_client(&config.bridge)?;
    let store = TokenStore::with_default_dir()?;
    let token = store.load_valid(&client, config.oauth.as_ref()).await?;
    if token.is_none() {
        warn!("⚠️ No valid OAuth token, run `nicobridge login` first (continuing read-only)");
    }
    Ok(token.map(|t| t.credential()))
}

async fn watch(args: WatchArgs, config: AppConfig) -> Result<()> {
    let broadcast_id = extract_broadcast_id(&args.broadcast)
        .with_context(|| format!("Invalid broadcast id or URL: {}", args.broadcast))?;

    let mut writer = args
        .output
        .as_ref()
        .map(|path| NdjsonWriter::create(path, args.append))
        .transpose()?;

    let (observer, mut events) = ChannelObserver::new();
    let session = BridgeSession::new(broadcast_id.clone(), config.bridge.clone(), Arc::new(observer))?;
    session.set_session_credential(resolve_credential(&args, &config).await?);

    info!("🎬 Starting nicobridge for {}", broadcast_id);
    session.connect().await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = args.post;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 終了シグナルを受信しました");
                break;
            }
            Some(comment) = events.comments.recv() => {
                println!("[{}] {}: {}", comment.no, comment.nickname, comment.text);
                if let Some(writer) = writer.as_mut() {
                    writer.write_entry(&OutputRecord::Comment(&comment))?;
                }
            }
            Some(state) = events.states.recv() => {
                log_state(&state);
                if let Some(writer) = writer.as_mut() {
                    writer.write_entry(&OutputRecord::State(&state))?;
                }
                if state.is_program_end() {
                    info!("🏁 Program ended");
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(text)) => {
                    let text = text.trim();
                    if !text.is_empty() && !session.post_comment(text) {
                        warn!("⚠️ Comment not posted (no session or not connected)");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("❌ Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    session.destroy();
    if let Some(writer) = writer {
        info!("💾 {} records written to {}", writer.written(), writer.path().display());
    }
    info!("👋 nicobridge shutting down");
    Ok(())
}

fn log_state(state: &BridgeState) {
    match &state.error {
        Some(error) => info!(
            "📡 {} ({}), viewers={}",
            state.status, error, state.viewer_count
        ),
        None => info!("📡 {}, viewers={}", state.status, state.viewer_count),
    }
}

async fn login(config: AppConfig) -> Result<()> {
    let oauth_config = config
        .oauth
        .context("[oauth] section is missing in the config file")?;

    println!("ブラウザで次の URL を開いて認可してください:");
    println!("{}", oauth::authorize_url(&oauth_config));
    println!("リダイレクト先の URL を貼り付けてください:");

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read callback URL")?;
    let code = oauth::extract_authorization_code(line.trim())?;

    let client = http_client(&config.bridge)?;
    let token = oauth::exchange_code(&client, &oauth_config, &code).await?;

    let store = TokenStore::with_default_dir()?;
    store.save(&token)?;
    info!("💾 OAuth token saved to {}", store.path().display());
    Ok(())
}
