//! NDGR 2 段ストリーミング (ポインタ → セグメント)
//!
//! ポインタ (view) エンドポイントをロングポールし、届いたエントリから
//! セグメントの取得と次のポインタ要求を行う。
//!
//! - 次ポインタを受信した瞬間に次のポインタ要求を始める。前の要求の残りは
//!   そのポインタ専用のトークンで打ち切るが、そこから始めたセグメント取得は
//!   パイプライン全体のトークンの下で続行する。
//! - セグメントは到着したチャンクごとに即デコードし、コメントを 1 件ずつ流す。
//! - 次ポインタが一定時間来なければ `?at=now` からやり直す。
//! - ポインタ要求どうしの間隔は最小値を下回らない。
//! - ポインタ要求の失敗は間隔を倍にしながら再試行し、続けて失敗したら
//!   シンクへ通知して停止する。

use crate::api::auth::{ndgr_request_headers, SessionCredential};
use crate::api::ndgr::dump::{debug_fields, describe_message};
use crate::api::ndgr::wire::FrameBuffer;
use crate::api::ndgr::{
    parse_single_view_entry, ChunkedMessage, NdgrStreamDecoder, NextPointer, SegmentSource,
    Statistics, ViewEntry,
};
use crate::bridge::backoff::Backoff;
use crate::bridge::error::BridgeError;
use crate::bridge::events::BridgeComment;
use crate::bridge::ledger::{CommentVerdict, Ledger, SegmentVerdict};
use crate::config::BridgeConfig;
use crate::utils::{preview, unix_now, unix_now_ms};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SUMMARY_EVERY_VIEWS: u64 = 10;
const MAX_UNKNOWN_ENTRY_DUMPS: usize = 5;
const DUMP_PREVIEW_CHARS: usize = 200;
const VIEW_RETRY_MAX_FACTOR: u32 = 8;

/// パイプラインの出力先
pub trait PipelineSink: Send + Sync {
    /// 台帳を通過したコメント
    fn on_comment(&self, comment: BridgeComment);
    /// セグメント内の視聴者数・コメント数
    fn on_statistics(&self, statistics: Statistics);
    /// ポインタ要求が続けて失敗し、パイプラインが停止した
    fn on_error(&self, error: BridgeError);
}

/// パイプライン設定
#[derive(Clone)]
pub struct PipelineOptions {
    pub client: reqwest::Client,
    pub credential: Option<SessionCredential>,
    pub min_view_interval: Duration,
    pub view_safety_timeout: Duration,
    pub view_retry_min: Duration,
    pub max_view_failures: u32,
}

impl PipelineOptions {
    pub fn from_config(
        client: reqwest::Client,
        credential: Option<SessionCredential>,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            client,
            credential,
            min_view_interval: config.min_view_interval(),
            view_safety_timeout: config.view_safety_timeout(),
            view_retry_min: config.view_retry_min(),
            max_view_failures: config.max_view_failures.max(1),
        }
    }
}

/// ポインタエントリ 1 件に対する処理内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewPlan {
    /// 取得するセグメント URI
    pub fetch: Option<String>,
    /// セグメントがあった場合の判定
    pub segment_verdict: Option<SegmentVerdict>,
    pub next: Option<NextPointer>,
}

/// エントリから、取得すべきセグメントと次ポインタを決める
pub fn plan_view_entry(entry: &ViewEntry, ledger: &mut Ledger, now: i64) -> ViewPlan {
    let segment_verdict = entry
        .segment
        .as_ref()
        .map(|segment| ledger.check_segment(segment, now));

    let fetch = match (&entry.segment, segment_verdict) {
        (Some(segment), Some(SegmentVerdict::Fetch)) => Some(segment.uri.clone()),
        _ => None,
    };

    ViewPlan {
        fetch,
        segment_verdict,
        next: entry.next.clone(),
    }
}

/// クエリを除いたポインタ URI
pub fn base_view_uri(view_uri: &str) -> &str {
    view_uri.split('?').next().unwrap_or(view_uri)
}

/// 次のポインタ要求 URL
///
/// URI ならそのまま、時刻なら `?at=<時刻>`、無ければ `?at=now`。
pub fn next_view_url(base: &str, next: Option<&NextPointer>) -> String {
    match next {
        Some(NextPointer::Uri(uri)) => uri.clone(),
        Some(NextPointer::At(at)) => format!("{}?at={}", base, at),
        None => format!("{}?at=now", base),
    }
}

/// ポインタ要求 1 本の結末
#[derive(Debug)]
enum ViewOutcome {
    Next(NextPointer),
    Failed(reqwest::Error),
}

/// パイプラインのカウンタ
#[derive(Debug, Default)]
struct PipelineCounters {
    segments_received: AtomicU64,
    comments_dispatched: AtomicU64,
}

struct PipelineShared {
    options: PipelineOptions,
    ledger: Arc<Mutex<Ledger>>,
    sink: Arc<dyn PipelineSink>,
    counters: PipelineCounters,
}

impl PipelineShared {
    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .options
            .client
            .get(url)
            .headers(ndgr_request_headers());
        match &self.options.credential {
            Some(credential) => credential.apply(request),
            None => request,
        }
    }

    /// デコード結果を台帳に通してシンクへ流す
    fn dispatch(&self, decoded: ChunkedMessage) {
        if let Some(statistics) = decoded.statistics {
            self.sink.on_statistics(statistics);
        }

        let now_unix = unix_now();
        for comment in decoded.comments {
            let verdict =
                self.ledger
                    .lock()
                    .check_comment(&comment, std::time::Instant::now(), now_unix);
            if verdict != CommentVerdict::Accepted {
                tracing::trace!(no = comment.no, %verdict, "Comment dropped");
                continue;
            }

            let dispatched = self.counters.comments_dispatched.fetch_add(1, Ordering::Relaxed) + 1;
            let age = comment.posted_at.map(|t| now_unix - t).unwrap_or(0);
            tracing::debug!(
                "💬 Comment #{} no={} age={}s \"{}\"",
                dispatched,
                comment.no,
                age,
                preview(&comment.content, 30)
            );
            self.sink
                .on_comment(BridgeComment::from_decoded(&comment, unix_now_ms()));
        }
    }

    fn log_summary(&self, view_count: u64) {
        let (segments_planned, unique_nos) = {
            let ledger = self.ledger.lock();
            (ledger.segments_fetched(), ledger.unique_comment_count())
        };
        tracing::info!(
            "📊 Summary: {} views, {} segs planned, {} segs completed, {} comments dispatched, {} unique nos",
            view_count,
            segments_planned,
            self.counters.segments_received.load(Ordering::Relaxed),
            self.counters.comments_dispatched.load(Ordering::Relaxed),
            unique_nos
        );
    }
}

/// 実行中のストリームパイプライン
///
/// drop するとすべてのポインタ要求・セグメント取得が止まる。
pub struct StreamPipeline {
    cancel: CancellationToken,
}

impl StreamPipeline {
    /// `view_uri` からパイプラインを開始する
    pub fn start(
        view_uri: &str,
        options: PipelineOptions,
        ledger: Arc<Mutex<Ledger>>,
        sink: Arc<dyn PipelineSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let shared = Arc::new(PipelineShared {
            options,
            ledger,
            sink,
            counters: PipelineCounters::default(),
        });

        tracing::info!("📡 NDGR stream starting: {}", base_view_uri(view_uri));
        tokio::spawn(run_view_loop(shared, view_uri.to_string(), cancel.clone()));

        Self { cancel }
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_view_loop(shared: Arc<PipelineShared>, view_uri: String, cancel: CancellationToken) {
    let base = base_view_uri(&view_uri).to_string();
    let mut current_url = next_view_url(&base, None);
    let mut view_count = 0u64;
    let mut previous_view: Option<CancellationToken> = None;
    let mut failures = 0u32;
    let mut retry = Backoff::new(
        shared.options.view_retry_min,
        shared.options.view_retry_min * VIEW_RETRY_MAX_FACTOR,
    );

    while !cancel.is_cancelled() {
        view_count += 1;
        let view_start = Instant::now();

        // 前のポインタ要求は打ち切る (セグメント取得は続行)
        if let Some(previous) = previous_view.take() {
            previous.cancel();
        }
        let view_cancel = cancel.child_token();
        previous_view = Some(view_cancel.clone());

        tracing::debug!(
            "🔗 View #{} → {}",
            view_count,
            current_url.replacen(&base, "...", 1)
        );
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(stream_view(
            shared.clone(),
            current_url.clone(),
            view_count,
            view_cancel,
            cancel.clone(),
            outcome_tx,
        ));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio::time::timeout(shared.options.view_safety_timeout, outcome_rx) => match result {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(_)) => None,
                Err(_) => {
                    tracing::warn!(
                        "⏱️ View #{}: no next pointer within {:?}, restarting at now",
                        view_count,
                        shared.options.view_safety_timeout
                    );
                    None
                }
            },
        };

        let mut wait = shared
            .options
            .min_view_interval
            .saturating_sub(view_start.elapsed());
        let next = match outcome {
            Some(ViewOutcome::Next(next)) => {
                failures = 0;
                retry.reset();
                Some(next)
            }
            Some(ViewOutcome::Failed(e)) => {
                failures += 1;
                if failures >= shared.options.max_view_failures {
                    tracing::error!(
                        "❌ View #{}: {} consecutive failures, stopping stream: {}",
                        view_count,
                        failures,
                        e
                    );
                    cancel.cancel();
                    shared.sink.on_error(BridgeError::Stream {
                        failures,
                        message: e.to_string(),
                    });
                    break;
                }
                wait = wait.max(retry.next_delay());
                tracing::warn!(
                    "❌ View #{} failed ({}/{}), retrying in {}ms: {}",
                    view_count,
                    failures,
                    shared.options.max_view_failures,
                    wait.as_millis(),
                    e
                );
                None
            }
            None => None,
        };
        current_url = next_view_url(&base, next.as_ref());

        if !wait.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if view_count % SUMMARY_EVERY_VIEWS == 0 {
            shared.log_summary(view_count);
        }
    }

    if let Some(previous) = previous_view {
        previous.cancel();
    }
    tracing::info!("📡 NDGR stream loop ended after {} views", view_count);
}

/// ポインタ要求 1 本分
///
/// 次ポインタより前に失敗した場合だけ、その失敗をループへ返す。
async fn stream_view(
    shared: Arc<PipelineShared>,
    url: String,
    view_num: u64,
    view_cancel: CancellationToken,
    segment_cancel: CancellationToken,
    outcome_tx: oneshot::Sender<ViewOutcome>,
) {
    let mut outcome_tx = Some(outcome_tx);
    let result = tokio::select! {
        _ = view_cancel.cancelled() => return,
        result = read_view(&shared, &url, view_num, &segment_cancel, &mut outcome_tx) => result,
    };

    if let Err(e) = result {
        match outcome_tx.take() {
            Some(tx) => {
                let _ = tx.send(ViewOutcome::Failed(e));
            }
            None => tracing::warn!("❌ View #{} stream error after next pointer: {}", view_num, e),
        }
    }
}

async fn read_view(
    shared: &Arc<PipelineShared>,
    url: &str,
    view_num: u64,
    segment_cancel: &CancellationToken,
    outcome_tx: &mut Option<oneshot::Sender<ViewOutcome>>,
) -> Result<(), reqwest::Error> {
    let started = Instant::now();
    let response = shared.request(url).send().await?.error_for_status()?;

    let mut body = response.bytes_stream();
    let mut frames = FrameBuffer::new();
    let mut entry_count = 0usize;
    let mut segment_count = 0usize;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;

        let mut plans = Vec::new();
        frames.push(&chunk, |message| {
            let Some(entry) = parse_single_view_entry(message) else {
                if entry_count < MAX_UNKNOWN_ENTRY_DUMPS {
                    tracing::debug!(
                        "❓ View #{}: entry[{}] UNKNOWN: {}",
                        view_num,
                        entry_count,
                        preview(&describe_message(message), DUMP_PREVIEW_CHARS)
                    );
                }
                entry_count += 1;
                return;
            };
            entry_count += 1;
            plans.push(entry);
        });

        let now = unix_now();
        for entry in plans {
            let plan = plan_view_entry(&entry, &mut shared.ledger.lock(), now);

            if let Some(segment) = &entry.segment {
                segment_count += 1;
                let source = match segment.source {
                    SegmentSource::Open => "SEG",
                    SegmentSource::Closed => "PREV",
                };
                tracing::debug!(
                    "🧩 View #{}: seg[{}] [{}] {} +{}ms from={:?} until={:?}",
                    view_num,
                    segment_count,
                    source,
                    plan.segment_verdict.map(|v| v.to_string()).unwrap_or_default(),
                    started.elapsed().as_millis(),
                    segment.from,
                    segment.until
                );
            }

            if let Some(uri) = plan.fetch {
                spawn_segment(shared.clone(), uri, segment_cancel.clone());
            }

            if let Some(next) = plan.next {
                if let Some(tx) = outcome_tx.take() {
                    tracing::debug!(
                        "➡️ View #{}: next {} +{}ms ({} segs)",
                        view_num,
                        next,
                        started.elapsed().as_millis(),
                        segment_count
                    );
                    let _ = tx.send(ViewOutcome::Next(next));
                }
            }
        }
    }

    tracing::debug!(
        "View #{} stream ended: {}ms, {} entries, {} segs",
        view_num,
        started.elapsed().as_millis(),
        entry_count,
        segment_count
    );
    Ok(())
}

fn spawn_segment(shared: Arc<PipelineShared>, uri: String, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = read_segment(&shared, &uri) => {
                if let Err(e) = result {
                    tracing::warn!("❌ Segment stream error: {}", e);
                }
            }
        }
    });
}

/// セグメントをチャンク単位で逐次デコードする
async fn read_segment(shared: &PipelineShared, uri: &str) -> Result<(), reqwest::Error> {
    let started = Instant::now();
    let response = shared.request(uri).send().await?.error_for_status()?;
    let first_byte = started.elapsed();

    let mut body = response.bytes_stream();
    let mut decoder = NdgrStreamDecoder::new();
    let mut chunk_count = 0usize;
    let mut comment_count = 0usize;
    let mut first_comment: Option<Duration> = None;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        chunk_count += 1;
        if chunk_count == 1 && tracing::enabled!(tracing::Level::TRACE) {
            for line in debug_fields(&chunk) {
                tracing::trace!("🔬 {}", line);
            }
        }

        let decoded = decoder.feed(&chunk);
        if !decoded.comments.is_empty() && first_comment.is_none() {
            first_comment = Some(started.elapsed());
        }
        comment_count += decoded.comments.len();
        shared.dispatch(decoded);
    }

    shared
        .counters
        .segments_received
        .fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
        "📦 Segment: TTFB={}ms 1st-comment={}ms total={}ms {} chunks {} comments",
        first_byte.as_millis(),
        first_comment.map(|d| d.as_millis()).unwrap_or(0),
        started.elapsed().as_millis(),
        chunk_count,
        comment_count
    );
    Ok(())
}
