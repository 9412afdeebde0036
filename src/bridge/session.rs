//! ブリッジセッション (状態機械)
//!
//! ```text
//! disconnected → connecting → connected → {error, disconnected}
//!        ↑______________ 再接続 (バックオフ) ______________|
//! ```
//!
//! 配信終了とオーナーによる明示的な切断は終端状態で、再度 `connect` されるまで
//! 再接続しない。接続ごとに世代番号を振り、古い接続からのイベントは無視する。

use crate::api::auth::SessionCredential;
use crate::api::control::{
    ControlConnection, ControlConnector, ControlEvent, ControlHandle, ControlMessage,
    OutboundMessage, PostComment, StartWatching, WebSocketConnector, REASON_CROWDED,
    REASON_END_PROGRAM, RESULT_POSTKEY_EXPIRED,
};
use crate::api::ndgr::Statistics;
use crate::api::watch::{BroadcastId, BroadcastResolver, HttpWatchResolver};
use crate::bridge::backoff::Backoff;
use crate::bridge::error::BridgeError;
use crate::bridge::events::{
    BridgeComment, BridgeObserver, BridgeState, BridgeStatus, Emitter, PROGRAM_ENDED_MESSAGE,
};
use crate::bridge::ledger::Ledger;
use crate::bridge::pipeline::{PipelineOptions, PipelineSink, StreamPipeline};
use crate::config::BridgeConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MIN_KEEP_SEAT_INTERVAL: Duration = Duration::from_secs(1);

/// セッションが使う外部接続
pub struct SessionTransport {
    pub client: reqwest::Client,
    pub resolver: Arc<dyn BroadcastResolver>,
    pub connector: Arc<dyn ControlConnector>,
}

impl SessionTransport {
    /// 視聴ページ (HTTP) と WebSocket を使う標準構成
    pub fn http(config: &BridgeConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            resolver: Arc::new(HttpWatchResolver::new(
                client.clone(),
                config.watch_base_url.clone(),
            )),
            connector: Arc::new(WebSocketConnector::new(config.user_agent.clone())),
            client,
        })
    }
}

struct SessionState {
    status: BridgeStatus,
    viewer_count: u32,
    credential: Option<SessionCredential>,
    user_disconnected: bool,
    destroyed: bool,
    generation: u64,
    backoff: Backoff,
    ledger: Arc<Mutex<Ledger>>,
    control: Option<ControlHandle>,
    pipeline: Option<StreamPipeline>,
    keep_seat: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
    thread_id: Option<String>,
    vpos_base_time: Option<DateTime<Utc>>,
}

impl SessionState {
    /// 現在の接続に紐づくリソースをすべて解放する
    fn teardown(&mut self) {
        if let Some(control) = self.control.take() {
            control.close();
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
        self.clear_keep_seat();
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.cancel();
        }
        self.vpos_base_time = None;
    }

    /// 現在の接続を退役させ、以降そのイベントを無視する
    fn retire_connection(&mut self) {
        self.generation += 1;
        self.teardown();
    }

    fn clear_keep_seat(&mut self) {
        if let Some(keep_seat) = self.keep_seat.take() {
            keep_seat.cancel();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.destroyed && self.generation == generation
    }
}

struct SessionInner {
    broadcast_id: BroadcastId,
    config: BridgeConfig,
    transport: SessionTransport,
    emitter: Emitter,
    state: Mutex<SessionState>,
}

/// 1 放送分のブリッジセッション
///
/// 終了時は必ず [`destroy`](Self::destroy) を呼ぶこと。内部タスクがセッションを
/// 参照しているため、ハンドルを drop しただけでは接続は切れない。
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<SessionInner>,
}

impl BridgeSession {
    /// 標準の HTTP/WebSocket 構成でセッションを作る
    pub fn new(
        broadcast_id: BroadcastId,
        config: BridgeConfig,
        observer: Arc<dyn BridgeObserver>,
    ) -> Result<Self, BridgeError> {
        let transport = SessionTransport::http(&config)?;
        Ok(Self::with_transport(broadcast_id, config, observer, transport))
    }

    pub fn with_transport(
        broadcast_id: BroadcastId,
        config: BridgeConfig,
        observer: Arc<dyn BridgeObserver>,
        transport: SessionTransport,
    ) -> Self {
        let state = SessionState {
            status: BridgeStatus::Disconnected,
            viewer_count: 0,
            credential: None,
            user_disconnected: false,
            destroyed: false,
            generation: 0,
            backoff: Backoff::new(config.reconnect_min(), config.reconnect_max()),
            ledger: Arc::new(Mutex::new(Ledger::new(&config))),
            control: None,
            pipeline: None,
            keep_seat: None,
            reconnect: None,
            thread_id: None,
            vpos_base_time: None,
        };

        Self {
            inner: Arc::new(SessionInner {
                broadcast_id,
                config,
                transport,
                emitter: Emitter::new(observer),
                state: Mutex::new(state),
            }),
        }
    }

    /// 接続を開始する
    ///
    /// 既存の接続は先に破棄する。コントロールチャネルの接続まで (または失敗まで) 待つ。
    pub async fn connect(&self) {
        self.inner.connect().await;
    }

    /// 切断する。再接続は行わない
    pub fn disconnect(&self, reason: Option<&str>) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.retire_connection();
            state.status = BridgeStatus::Disconnected;
            self.inner.snapshot(&state, reason.map(str::to_string))
        };
        tracing::info!("🔌 Bridge disconnected ({})", reason.unwrap_or("requested"));
        self.inner.emitter.state(snapshot);
    }

    /// 完全に破棄する。以降イベントは発行されない
    pub fn destroy(&self) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.retire_connection();
            state.destroyed = true;
            state.status = BridgeStatus::Disconnected;
            state.ledger = Arc::new(Mutex::new(Ledger::new(&self.inner.config)));
            self.inner.snapshot(&state, Some("destroyed".to_string()))
        };
        self.inner.emitter.state(snapshot);
        self.inner.emitter.detach();
        tracing::info!("🗑️ Bridge session destroyed: {}", self.inner.broadcast_id);
    }

    /// コメントを投稿する。送信キューに積めたら `true`
    pub fn post_comment(&self, text: &str) -> bool {
        let state = self.inner.state.lock();
        let Some(control) = state.control.as_ref() else {
            return false;
        };
        if state.credential.is_none() || !control.is_open() {
            return false;
        }

        let vpos = state
            .vpos_base_time
            .map(|base| (Utc::now() - base).num_milliseconds() / 10)
            .unwrap_or(0);
        let sent = control.send(OutboundMessage::PostComment(PostComment {
            text: text.to_string(),
            vpos,
            is_anonymous: self.inner.config.post_anonymously,
        }));

        if sent {
            state.ledger.lock().record_sent(text);
            tracing::debug!("📝 Comment posted (vpos={})", vpos);
        }
        sent
    }

    /// 資格情報を設定する (`None` で解除)
    pub fn set_session_credential(&self, credential: Option<SessionCredential>) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            if credential.as_ref().is_some_and(SessionCredential::is_bearer) {
                tracing::info!("🔑 OAuth token set");
            }
            state.credential = credential;
            self.inner.snapshot(&state, None)
        };
        self.inner.emitter.state(snapshot);
    }

    /// ユーザーによる切断フラグ。立てている間は再接続しない
    pub fn set_user_disconnected(&self, flag: bool) {
        let mut state = self.inner.state.lock();
        state.user_disconnected = flag;
        if flag {
            if matches!(state.credential, Some(SessionCredential::Cookie(_))) {
                state.credential = None;
            }
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.cancel();
            }
        }
    }

    pub fn get_status(&self) -> BridgeStatus {
        self.inner.state.lock().status
    }

    /// 現在の状態 (エラー情報なし)
    pub fn state(&self) -> BridgeState {
        let state = self.inner.state.lock();
        self.inner.snapshot(&state, None)
    }

    pub fn has_session(&self) -> bool {
        self.inner.state.lock().credential.is_some()
    }

    pub fn broadcast_id(&self) -> &BroadcastId {
        &self.inner.broadcast_id
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

impl SessionInner {
    fn snapshot(&self, state: &SessionState, error: Option<String>) -> BridgeState {
        BridgeState {
            status: state.status,
            viewer_count: state.viewer_count,
            has_session: state.credential.is_some(),
            broadcast_id: self.broadcast_id.clone(),
            error,
        }
    }

    async fn connect(self: &Arc<Self>) {
        let (generation, credential, snapshot) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.retire_connection();
            state.status = BridgeStatus::Connecting;
            state.ledger = Arc::new(Mutex::new(Ledger::new(&self.config)));
            (
                state.generation,
                state.credential.clone(),
                self.snapshot(&state, None),
            )
        };
        tracing::info!("🔄 Connecting to {}", self.broadcast_id);
        self.emitter.state(snapshot);

        match self.open_control(credential.as_ref()).await {
            Ok(connection) => self.attach_control(generation, connection),
            Err(e) => self.fail(generation, e),
        }
    }

    async fn open_control(
        &self,
        credential: Option<&SessionCredential>,
    ) -> Result<ControlConnection, BridgeError> {
        let watch = self
            .transport
            .resolver
            .resolve(&self.broadcast_id, credential)
            .await?;

        let Some(url) = watch.web_socket_url.clone() else {
            if watch.is_ended() {
                return Err(BridgeError::ProgramEnded);
            }
            return Err(BridgeError::Protocol("WebSocket URL not found".to_string()));
        };

        let handshake = OutboundMessage::StartWatching(StartWatching::new(
            &self.config.stream_quality,
            &self.config.stream_latency,
        ));
        Ok(self.transport.connector.connect(&url, handshake).await?)
    }

    fn attach_control(self: &Arc<Self>, generation: u64, connection: ControlConnection) {
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            connection.handle.close();
            return;
        }
        state.control = Some(connection.handle);
        drop(state);

        tokio::spawn(run_control_events(
            self.clone(),
            generation,
            connection.events,
        ));
    }

    fn fail(self: &Arc<Self>, generation: u64, error: BridgeError) {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.is_current(generation) {
                return;
            }
            state.retire_connection();

            if error.is_terminal() {
                tracing::info!("🏁 Program ENDED, not retrying");
                state.status = BridgeStatus::Disconnected;
                self.snapshot(&state, Some(PROGRAM_ENDED_MESSAGE.to_string()))
            } else {
                tracing::warn!("❌ Connection error: {}", error);
                state.status = BridgeStatus::Error;
                self.schedule_reconnect(&mut state);
                self.snapshot(&state, Some(error.to_string()))
            }
        };
        self.emitter.state(snapshot);
    }

    /// 再接続を予約する。予約済み・破棄済み・ユーザー切断中は何もしない
    fn schedule_reconnect(self: &Arc<Self>, state: &mut SessionState) {
        if state.destroyed || state.user_disconnected || state.reconnect.is_some() {
            return;
        }

        let delay = state.backoff.next_delay();
        let token = CancellationToken::new();
        state.reconnect = Some(token.clone());
        tracing::info!("⏳ Reconnecting in {}ms", delay.as_millis());

        tokio::spawn(reconnect_after(self.clone(), delay, token));
    }

    /// 現在の世代のイベントなら処理して `true`
    fn handle_control_event(self: &Arc<Self>, generation: u64, event: ControlEvent) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            return false;
        }

        let program_end = event.is_program_end();
        let snapshot = match event {
            ControlEvent::Message(message) => {
                self.handle_control_message(&mut state, generation, message)
            }
            ControlEvent::Closed { .. } if program_end => {
                tracing::info!("🏁 Control socket closed: END_PROGRAM");
                state.retire_connection();
                state.status = BridgeStatus::Disconnected;
                Some(self.snapshot(&state, Some(PROGRAM_ENDED_MESSAGE.to_string())))
            }
            ControlEvent::Closed { code, reason } => {
                tracing::info!("🔌 Control socket closed: code={:?} reason={}", code, reason);
                state.retire_connection();
                state.status = BridgeStatus::Disconnected;
                self.schedule_reconnect(&mut state);
                Some(self.snapshot(&state, None))
            }
        };
        drop(state);

        if let Some(snapshot) = snapshot {
            self.emitter.state(snapshot);
        }
        true
    }

    fn handle_control_message(
        self: &Arc<Self>,
        state: &mut SessionState,
        generation: u64,
        message: ControlMessage,
    ) -> Option<BridgeState> {
        match message {
            ControlMessage::Seat { keep_interval_sec } => {
                let interval = keep_interval_sec
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.default_keep_seat());
                tracing::debug!("💺 Seat received (keep interval {:?})", interval);
                if let Some(control) = state.control.clone() {
                    start_keep_seat(state, control, interval);
                }
                None
            }
            ControlMessage::Ping => {
                if let Some(control) = &state.control {
                    control.send(OutboundMessage::Pong);
                }
                None
            }
            ControlMessage::Statistics { viewers, .. } => {
                state.viewer_count = viewers;
                Some(self.snapshot(state, None))
            }
            ControlMessage::Room { thread_id } => {
                tracing::debug!("Room (legacy): thread_id={:?}", thread_id);
                state.thread_id = thread_id;
                None
            }
            ControlMessage::MessageServer {
                view_uri,
                vpos_base_time,
            } => {
                state.vpos_base_time = vpos_base_time;
                state.status = BridgeStatus::Connected;
                match view_uri {
                    Some(view_uri) => {
                        tracing::info!("✅ messageServer → viewUri: {}", view_uri);
                        state.backoff.reset();
                        self.start_pipeline(state, generation, &view_uri);
                    }
                    None => tracing::info!("✅ messageServer received but no viewUri"),
                }
                Some(self.snapshot(state, None))
            }
            ControlMessage::AkashicMessageServer => {
                tracing::debug!("akashicMessageServer ignored");
                None
            }
            ControlMessage::Disconnect { reason } => {
                let reason = reason.unwrap_or_default();
                tracing::info!("🔌 Server disconnect: {}", reason);
                state.retire_connection();
                state.status = BridgeStatus::Disconnected;

                if reason == REASON_END_PROGRAM {
                    return Some(self.snapshot(state, Some(PROGRAM_ENDED_MESSAGE.to_string())));
                }
                if reason == REASON_CROWDED {
                    tracing::warn!(
                        "⚠️ CROWDED, retrying in {}ms",
                        self.config.reconnect_min().as_millis()
                    );
                    state.backoff.reset();
                } else {
                    tracing::warn!("⚠️ Disconnected: {}", reason);
                }
                self.schedule_reconnect(state);
                Some(self.snapshot(state, Some(reason)))
            }
            ControlMessage::PostCommentResult { result_code } => {
                if result_code == Some(RESULT_POSTKEY_EXPIRED) {
                    tracing::warn!("⚠️ Post key expired, comment was not posted");
                } else {
                    tracing::debug!("postCommentResult: {:?}", result_code);
                }
                None
            }
            ControlMessage::Unknown { kind, data } => {
                let data = data.to_string();
                tracing::debug!(
                    "Unknown control message [{}]: {}",
                    kind,
                    crate::utils::preview(&data, 300)
                );
                None
            }
        }
    }

    fn start_pipeline(self: &Arc<Self>, state: &mut SessionState, generation: u64, view_uri: &str) {
        if let Some(previous) = state.pipeline.take() {
            previous.abort();
        }
        state.ledger.lock().reset_stream_state();

        let options = PipelineOptions::from_config(
            self.transport.client.clone(),
            state.credential.clone(),
            &self.config,
        );
        let sink = Arc::new(SessionSink {
            inner: Arc::downgrade(self),
            generation,
        });
        state.pipeline = Some(StreamPipeline::start(
            view_uri,
            options,
            state.ledger.clone(),
            sink,
        ));
    }
}

/// パイプラインの出力をセッションのイベントに変換する
struct SessionSink {
    inner: Weak<SessionInner>,
    generation: u64,
}

impl PipelineSink for SessionSink {
    fn on_comment(&self, comment: BridgeComment) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !inner.state.lock().is_current(self.generation) {
            return;
        }
        inner.emitter.comment(comment);
    }

    fn on_statistics(&self, statistics: Statistics) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let snapshot = {
            let mut state = inner.state.lock();
            if !state.is_current(self.generation) {
                return;
            }
            state.viewer_count = statistics.viewers;
            inner.snapshot(&state, None)
        };
        inner.emitter.state(snapshot);
    }

    fn on_error(&self, error: BridgeError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.fail(self.generation, error);
        }
    }
}

async fn run_control_events(
    inner: Arc<SessionInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ControlEvent>,
) {
    while let Some(event) = events.recv().await {
        if !inner.handle_control_event(generation, event) {
            break;
        }
    }
    tracing::debug!("Control event loop ended (generation {})", generation);
}

fn reconnect_after(inner: Arc<SessionInner>, delay: Duration, token: CancellationToken) -> BoxFuture {
    Box::pin(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut state = inner.state.lock();
            if token.is_cancelled() || state.destroyed {
                return;
            }
            state.reconnect = None;
        }
        inner.connect().await;
    })
}

fn start_keep_seat(state: &mut SessionState, control: ControlHandle, interval: Duration) {
    state.clear_keep_seat();
    let interval = interval.max(MIN_KEEP_SEAT_INTERVAL);
    let token = CancellationToken::new();
    state.keep_seat = Some(token.clone());

    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !control.send(OutboundMessage::KeepSeat) {
                        break;
                    }
                    tracing::trace!("keepSeat sent");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::control::{ControlError, ControlPeer};
    use crate::api::watch::{WatchData, WatchError};
    use crate::bridge::events::{BridgeEvents, ChannelObserver};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::{timeout, Instant};

    struct FakeResolver {
        responses: Mutex<VecDeque<Result<WatchData, WatchError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl BroadcastResolver for FakeResolver {
        async fn resolve(
            &self,
            _broadcast_id: &BroadcastId,
            _credential: Option<&SessionCredential>,
        ) -> Result<WatchData, WatchError> {
            self.calls.lock().push(Instant::now());
            self.responses.lock().pop_front().unwrap_or_else(|| {
                Ok(WatchData {
                    web_socket_url: Some("wss://example.invalid/wsapi".to_string()),
                    program_status: Some("ON_AIR".to_string()),
                })
            })
        }
    }

    struct FakeConnector {
        peers: mpsc::UnboundedSender<(OutboundMessage, ControlPeer)>,
    }

    #[async_trait]
    impl ControlConnector for FakeConnector {
        async fn connect(
            &self,
            _url: &str,
            handshake: OutboundMessage,
        ) -> Result<ControlConnection, ControlError> {
            let (connection, peer) = ControlConnection::pair();
            let _ = self.peers.send((handshake, peer));
            Ok(connection)
        }
    }

    struct Harness {
        session: BridgeSession,
        events: BridgeEvents,
        peers: mpsc::UnboundedReceiver<(OutboundMessage, ControlPeer)>,
        resolver: Arc<FakeResolver>,
    }

    fn harness(responses: Vec<Result<WatchData, WatchError>>) -> Harness {
        let (observer, events) = ChannelObserver::new();
        let resolver = Arc::new(FakeResolver {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        });
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let transport = SessionTransport {
            client: reqwest::Client::new(),
            resolver: resolver.clone(),
            connector: Arc::new(FakeConnector { peers: peers_tx }),
        };
        let session = BridgeSession::with_transport(
            BroadcastId("lv123".to_string()),
            BridgeConfig::default(),
            Arc::new(observer),
            transport,
        );

        Harness {
            session,
            events,
            peers,
            resolver,
        }
    }

    impl Harness {
        async fn next_state(&mut self) -> BridgeState {
            timeout(Duration::from_secs(5), self.events.states.recv())
                .await
                .expect("state timeout")
                .expect("state channel closed")
        }

        async fn next_peer(&mut self) -> ControlPeer {
            let (_, peer) = timeout(Duration::from_secs(120), self.peers.recv())
                .await
                .expect("no connection attempt")
                .expect("connector dropped");
            peer
        }

        /// 接続して Connecting 通知まで読み進める
        async fn connect(&mut self) -> ControlPeer {
            self.session.connect().await;
            let peer = self.next_peer().await;
            assert_eq!(self.next_state().await.status, BridgeStatus::Connecting);
            peer
        }

        async fn assert_no_reconnect(&mut self) {
            tokio::time::sleep(Duration::from_secs(120)).await;
            assert!(self.peers.try_recv().is_err());
        }
    }

    fn send(peer: &ControlPeer, message: ControlMessage) {
        peer.events.send(ControlEvent::Message(message)).unwrap();
    }

    fn message_server(view_uri: Option<&str>) -> ControlMessage {
        ControlMessage::MessageServer {
            view_uri: view_uri.map(str::to_string),
            vpos_base_time: None,
        }
    }

    fn disconnect(reason: &str) -> ControlMessage {
        ControlMessage::Disconnect {
            reason: Some(reason.to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_start_watching_and_becomes_connected() {
        let mut h = harness(vec![]);
        h.session.connect().await;

        let (handshake, peer) = h.peers.recv().await.unwrap();
        match handshake {
            OutboundMessage::StartWatching(start) => {
                assert_eq!(start.stream.quality, "abr");
                assert_eq!(start.stream.latency, "low");
            }
            other => panic!("unexpected handshake: {:?}", other),
        }
        assert_eq!(h.next_state().await.status, BridgeStatus::Connecting);

        send(&peer, message_server(None));
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Connected);
        assert_eq!(state.broadcast_id.as_str(), "lv123");
        assert_eq!(h.session.get_status(), BridgeStatus::Connected);

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_with_pong() {
        let mut h = harness(vec![]);
        let mut peer = h.connect().await;

        send(&peer, ControlMessage::Ping);
        let reply = timeout(Duration::from_secs(5), peer.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, OutboundMessage::Pong);

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_seat_starts_keep_seat() {
        let mut h = harness(vec![]);
        let mut peer = h.connect().await;

        send(
            &peer,
            ControlMessage::Seat {
                keep_interval_sec: Some(30),
            },
        );
        let started = Instant::now();
        let keep = timeout(Duration::from_secs(60), peer.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(keep, OutboundMessage::KeepSeat);
        assert!(started.elapsed() >= Duration::from_secs(30));

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistics_updates_viewer_count() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        send(
            &peer,
            ControlMessage::Statistics {
                viewers: 1234,
                comments: Some(56),
            },
        );
        let state = h.next_state().await;
        assert_eq!(state.viewer_count, 1234);
        assert_eq!(h.session.state().viewer_count, 1234);

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_program_disconnect_is_terminal() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        send(&peer, disconnect(REASON_END_PROGRAM));
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Disconnected);
        assert_eq!(state.error.as_deref(), Some(PROGRAM_ENDED_MESSAGE));
        assert!(peer.cancel.is_cancelled());

        h.assert_no_reconnect().await;
        assert_eq!(h.resolver.calls.lock().len(), 1);

        // 明示的な connect で復帰する
        let peer = h.connect().await;
        assert!(!peer.cancel.is_cancelled());
        send(&peer, message_server(None));
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Connected);
        assert_eq!(state.error, None);
        assert_eq!(h.resolver.calls.lock().len(), 2);

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crowded_reconnects_after_minimum_delay() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        send(&peer, disconnect(REASON_CROWDED));
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Disconnected);
        assert_eq!(state.error.as_deref(), Some(REASON_CROWDED));

        let started = Instant::now();
        let _peer = h.next_peer().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_back_off_exponentially() {
        let mut h = harness(vec![
            Err(WatchError::Status(503)),
            Err(WatchError::Status(503)),
            Err(WatchError::Status(503)),
        ]);

        h.session.connect().await;
        assert_eq!(h.next_state().await.status, BridgeStatus::Connecting);
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Error);
        assert!(state.error.unwrap().contains("503"));

        let _peer = h.next_peer().await;

        let calls = h.resolver.calls.lock().clone();
        assert_eq!(calls.len(), 4);
        let expected = [3, 6, 12];
        for (pair, secs) in calls.windows(2).zip(expected) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(secs), "gap {:?}", gap);
            assert!(gap < Duration::from_secs(secs) + Duration::from_millis(100));
        }

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_server_resets_backoff() {
        let mut h = harness(vec![Err(WatchError::Status(500))]);
        h.session.connect().await;
        let peer = h.next_peer().await;
        assert_eq!(
            h.session.inner.state.lock().backoff.peek(),
            Duration::from_secs(6)
        );

        send(&peer, message_server(Some("http://127.0.0.1:9/api/view/v4/abc")));
        loop {
            if h.next_state().await.status == BridgeStatus::Connected {
                break;
            }
        }
        assert_eq!(
            h.session.inner.state.lock().backoff.peek(),
            Duration::from_secs(3)
        );

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_failure_surfaces_error_and_reconnects() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;
        send(&peer, message_server(None));
        assert_eq!(h.next_state().await.status, BridgeStatus::Connected);

        let sink = SessionSink {
            inner: Arc::downgrade(&h.session.inner),
            generation: h.session.inner.state.lock().generation,
        };
        sink.on_error(BridgeError::Stream {
            failures: 3,
            message: "HTTP status client error (403 Forbidden)".to_string(),
        });

        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Error);
        assert!(state.error.unwrap().contains("403"));
        assert!(peer.cancel.is_cancelled());

        let started = Instant::now();
        let _peer = h.next_peer().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(h.next_state().await.status, BridgeStatus::Connecting);

        // 退役した接続のパイプラインからの通知は無視する
        sink.on_error(BridgeError::Stream {
            failures: 3,
            message: "late".to_string(),
        });
        assert!(h.events.states.try_recv().is_err());
        assert_eq!(h.session.get_status(), BridgeStatus::Connecting);

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_program_is_not_retried() {
        let mut h = harness(vec![Ok(WatchData {
            web_socket_url: None,
            program_status: Some("ENDED".to_string()),
        })]);

        h.session.connect().await;
        assert_eq!(h.next_state().await.status, BridgeStatus::Connecting);
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Disconnected);
        assert_eq!(state.error.as_deref(), Some(PROGRAM_ENDED_MESSAGE));

        h.assert_no_reconnect().await;
        assert_eq!(h.resolver.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        peer.events
            .send(ControlEvent::Closed {
                code: Some(1006),
                reason: String::new(),
            })
            .unwrap();
        assert_eq!(h.next_state().await.status, BridgeStatus::Disconnected);

        let _peer = h.next_peer().await;
        assert_eq!(h.resolver.calls.lock().len(), 2);

        h.session.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_program_close_is_terminal() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        peer.events
            .send(ControlEvent::Closed {
                code: Some(1000),
                reason: REASON_END_PROGRAM.to_string(),
            })
            .unwrap();
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Disconnected);
        assert_eq!(state.error.as_deref(), Some(PROGRAM_ENDED_MESSAGE));

        h.assert_no_reconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnected_suppresses_reconnect() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        h.session.set_user_disconnected(true);
        peer.events
            .send(ControlEvent::Closed {
                code: Some(1006),
                reason: String::new(),
            })
            .unwrap();
        assert_eq!(h.next_state().await.status, BridgeStatus::Disconnected);

        h.assert_no_reconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_ignores_late_close() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        h.session.disconnect(Some("bye"));
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Disconnected);
        assert_eq!(state.error.as_deref(), Some("bye"));
        assert!(peer.cancel.is_cancelled());

        let _ = peer.events.send(ControlEvent::Closed {
            code: Some(1006),
            reason: String::new(),
        });
        h.assert_no_reconnect().await;
        assert!(h.events.states.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_comment_requires_session() {
        let mut h = harness(vec![]);
        let mut peer = h.connect().await;

        assert!(!h.session.post_comment("テスト"));

        h.session
            .set_session_credential(Some(SessionCredential::Cookie("abc".to_string())));
        assert!(h.next_state().await.has_session);

        assert!(h.session.post_comment("テスト"));
        let posted = timeout(Duration::from_secs(5), peer.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            posted,
            OutboundMessage::PostComment(PostComment {
                text: "テスト".to_string(),
                vpos: 0,
                is_anonymous: true,
            })
        );
        assert_eq!(h.session.inner.state.lock().ledger.lock().echo_len(), 1);

        h.session.destroy();
        assert!(!h.session.post_comment("テスト"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnected_drops_cookie_only() {
        let h = harness(vec![]);

        h.session
            .set_session_credential(Some(SessionCredential::Cookie("abc".to_string())));
        h.session.set_user_disconnected(true);
        assert!(!h.session.has_session());

        h.session
            .set_session_credential(Some(SessionCredential::Bearer("token".to_string())));
        h.session.set_user_disconnected(true);
        assert!(h.session.has_session());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_all_events() {
        let mut h = harness(vec![]);
        let peer = h.connect().await;

        h.session.destroy();
        let state = h.next_state().await;
        assert_eq!(state.status, BridgeStatus::Disconnected);
        assert!(peer.cancel.is_cancelled());

        let _ = peer.events.send(ControlEvent::Message(ControlMessage::Statistics {
            viewers: 10,
            comments: None,
        }));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.events.states.try_recv().is_err());

        // 破棄後の connect は何もしない
        h.session.connect().await;
        assert!(h.peers.try_recv().is_err());
        assert_eq!(h.session.get_status(), BridgeStatus::Disconnected);
    }
}
