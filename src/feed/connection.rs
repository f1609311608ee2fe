//! Connection Manager
//!
//! Owns the single streaming connection to the exchange feed:
//! - signs every connection attempt with a fresh timestamp
//! - subscribes the lifecycle channel once per connection, plus every market
//!   the registry marks as subscribed
//! - treats the connection as dead after `heartbeat_timeout` without inbound
//!   traffic
//! - reconnects with jittered exponential backoff, invalidating every
//!   market's continuity so each one is rebuilt from a fresh snapshot
//!
//! Raw text frames are forwarded to the event processor tagged with the
//! session they arrived on.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{BackoffConfig, FeedConfig};
use crate::error::ConnectionError;
use crate::feed::auth::{build_request, Credentials};
use crate::feed::messages::{lifecycle_subscribe_command, subscribe_command, unsubscribe_command};
use crate::models::{now_ms, TimestampMs};
use crate::registry::MarketRegistry;

/// Markets per subscribe command.
const SUBSCRIBE_CHUNK: usize = 100;

// =============================================================================
// Frames and commands
// =============================================================================

/// One text frame as received, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub session: u64,
    pub received_at: TimestampMs,
    pub text: String,
}

/// Subscription requests addressed to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Drop and re-establish one market's subscription to force a snapshot.
    Resubscribe(String),
}

/// Cloneable sender side used by the processor and discovery.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    cmd_tx: mpsc::Sender<FeedCommand>,
}

impl FeedHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FeedCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        (Self { cmd_tx }, cmd_rx)
    }

    pub async fn subscribe(&self, tickers: Vec<String>) -> bool {
        self.send(FeedCommand::Subscribe(tickers)).await
    }

    pub async fn unsubscribe(&self, tickers: Vec<String>) -> bool {
        self.send(FeedCommand::Unsubscribe(tickers)).await
    }

    pub async fn resubscribe(&self, ticker: String) -> bool {
        self.send(FeedCommand::Resubscribe(ticker)).await
    }

    async fn send(&self, cmd: FeedCommand) -> bool {
        match self.cmd_tx.send(cmd).await {
            Ok(()) => true,
            Err(e) => {
                debug!(command = ?e.0, "Connection manager gone; command dropped");
                false
            }
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential reconnect delay with symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            jitter: config.jitter,
            attempt: 0,
        }
    }

    /// Un-jittered delay for the current attempt.
    pub fn base_delay(&self) -> Duration {
        let multiplier = 1u32.checked_shl(self.attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(multiplier).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub frames_received: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub commands_sent: AtomicU64,
    pub subscriptions_refused: AtomicU64,
}

impl ConnectionStats {
    pub fn summary(&self) -> String {
        format!(
            "connects={}, disconnects={}, frames={}, heartbeat_timeouts={}, commands={}, refused={}",
            self.connects.load(Ordering::Relaxed),
            self.disconnects.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.heartbeat_timeouts.load(Ordering::Relaxed),
            self.commands_sent.load(Ordering::Relaxed),
            self.subscriptions_refused.load(Ordering::Relaxed),
        )
    }
}

/// How a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
}

// =============================================================================
// Connection manager
// =============================================================================

pub struct ConnectionManager {
    config: FeedConfig,
    backoff: Backoff,
    credentials: Credentials,
    registry: Arc<MarketRegistry>,
    frame_tx: mpsc::Sender<InboundFrame>,
    cmd_rx: mpsc::Receiver<FeedCommand>,
    commands_open: bool,
    next_command_id: u64,
    stats: Arc<ConnectionStats>,
}

impl ConnectionManager {
    pub fn new(
        config: FeedConfig,
        backoff: &BackoffConfig,
        credentials: Credentials,
        registry: Arc<MarketRegistry>,
        frame_tx: mpsc::Sender<InboundFrame>,
        cmd_rx: mpsc::Receiver<FeedCommand>,
    ) -> Self {
        Self {
            config,
            backoff: Backoff::new(backoff),
            credentials,
            registry,
            frame_tx,
            cmd_rx,
            commands_open: true,
            next_command_id: 1,
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Keep the connection up until shutdown. Returns an error only for
    /// rejected credentials.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConnectionError> {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = self.connect_and_stream(&mut shutdown).await;

            // Whatever happened, nothing after this point continues the old stream.
            let interrupted = self.registry.invalidate_all();

            match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Feed rejected credentials; halting");
                    return Err(e);
                }
                Err(e) => {
                    self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        interrupted_markets = interrupted,
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Feed disconnected; reconnecting"
                    );
                    if self.wait_offline(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(stats = %self.stats.summary(), "Connection manager stopped");
        Ok(())
    }

    /// Sleep out a backoff delay while still accepting commands. Returns true
    /// if shutdown was requested.
    async fn wait_offline(&mut self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                _ = shutdown_requested(shutdown) => return true,
                cmd = self.cmd_rx.recv(), if self.commands_open => {
                    match cmd {
                        // Registry bookkeeping only; the next session subscribes from it.
                        Some(cmd) => {
                            self.apply_command(&cmd);
                        }
                        None => self.commands_open = false,
                    }
                }
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_command_id;
        self.next_command_id += 1;
        id
    }

    /// Update the registry for a command and return the wire messages it needs.
    fn apply_command(&mut self, cmd: &FeedCommand) -> Vec<String> {
        match cmd {
            FeedCommand::Subscribe(tickers) => {
                let mut added = Vec::new();
                for ticker in tickers {
                    if self.registry.with_cell(ticker, |c| c.subscribed) == Some(true) {
                        continue;
                    }
                    if self.registry.subscription_count() >= self.config.max_subscriptions {
                        self.stats.subscriptions_refused.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            ticker = %ticker,
                            max = self.config.max_subscriptions,
                            "Subscription limit reached; refusing market"
                        );
                        continue;
                    }
                    if self.registry.mark_subscribed(ticker, now_ms()) {
                        added.push(ticker.clone());
                    }
                }
                self.subscribe_messages(&added)
            }
            FeedCommand::Unsubscribe(tickers) => {
                let removed: Vec<String> = tickers
                    .iter()
                    .filter(|t| self.registry.mark_unsubscribed(t))
                    .cloned()
                    .collect();
                if removed.is_empty() {
                    return Vec::new();
                }
                vec![unsubscribe_command(self.next_id(), &removed)]
            }
            FeedCommand::Resubscribe(ticker) => {
                if self.registry.with_cell(ticker, |c| c.subscribed) != Some(true) {
                    return Vec::new();
                }
                let tickers = vec![ticker.clone()];
                let mut msgs = vec![unsubscribe_command(self.next_id(), &tickers)];
                msgs.extend(self.subscribe_messages(&tickers));
                msgs
            }
        }
    }

    fn subscribe_messages(&mut self, tickers: &[String]) -> Vec<String> {
        let mut msgs = Vec::new();
        for chunk in tickers.chunks(SUBSCRIBE_CHUNK) {
            let id = self.next_id();
            self.registry.note_pending_command(id, chunk.to_vec());
            msgs.push(subscribe_command(id, chunk));
        }
        msgs
    }

    async fn connect_and_stream(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ConnectionError> {
        // Signatures are timestamp-bound: sign every attempt afresh.
        let headers = self.credentials.signed_headers(&self.config.sign_path, now_ms())?;
        let request = build_request(&self.config.ws_url, &headers)?;

        let heartbeat_timeout = self.config.heartbeat_timeout();

        info!(url = %self.config.ws_url, "Connecting to feed");
        let connect = tokio::time::timeout(heartbeat_timeout, connect_async(request));
        let (ws_stream, resp) = tokio::select! {
            res = connect => match res {
                Ok(res) => res.map_err(classify_connect_error)?,
                Err(_) => return Err(ConnectionError::Network("connect timed out".to_string())),
            },
            _ = shutdown_requested(shutdown) => return Ok(SessionEnd::Shutdown),
        };
        let session = self.registry.session_id();
        self.registry.clear_pending_commands();
        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        self.backoff.reset();
        info!(status = %resp.status(), session, "Feed connected");

        let (mut write, mut read) = ws_stream.split();

        let mut outbound = vec![lifecycle_subscribe_command(self.next_id())];
        let tickers = self.registry.subscribed_tickers();
        outbound.extend(self.subscribe_messages(&tickers));
        for msg in outbound {
            write
                .send(Message::Text(msg))
                .await
                .map_err(|e| ConnectionError::Network(format!("send subscription: {e}")))?;
            self.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        }
        info!(markets = tickers.len(), "Subscriptions requested; awaiting snapshots");

        let liveness = sleep_until(Instant::now() + heartbeat_timeout);
        tokio::pin!(liveness);

        let mut ping = interval(self.config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut liveness => {
                    self.stats.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(ConnectionError::Closed(format!(
                        "no inbound traffic for {}ms",
                        heartbeat_timeout.as_millis()
                    )));
                }
                _ = shutdown_requested(shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = ping.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| ConnectionError::Network(format!("send ping: {e}")))?;
                }
                cmd = self.cmd_rx.recv(), if self.commands_open => {
                    let Some(cmd) = cmd else {
                        self.commands_open = false;
                        continue;
                    };
                    for msg in self.apply_command(&cmd) {
                        write
                            .send(Message::Text(msg))
                            .await
                            .map_err(|e| ConnectionError::Network(format!("send command: {e}")))?;
                        self.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Err(ConnectionError::Closed("stream ended".to_string()));
                    };
                    let ws_msg = ws_msg.map_err(|e| ConnectionError::Network(e.to_string()))?;

                    // Any inbound frame proves liveness.
                    liveness.as_mut().reset(Instant::now() + heartbeat_timeout);

                    match ws_msg {
                        Message::Text(text) => {
                            self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            let frame = InboundFrame {
                                session,
                                received_at: now_ms(),
                                text,
                            };
                            if self.frame_tx.send(frame).await.is_err() {
                                info!("Frame consumer gone; closing feed");
                                let _ = write.send(Message::Close(None)).await;
                                return Ok(SessionEnd::Shutdown);
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            debug!(?frame, "Feed sent close");
                            return Err(ConnectionError::Closed(format!("closed by peer: {frame:?}")));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Resolves once shutdown is signalled or the signal sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// 401/403 during the upgrade means bad credentials; everything else is transient.
fn classify_connect_error(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(resp) => {
            let status = resp.status().as_u16();
            if status == 401 || status == 403 {
                ConnectionError::Auth {
                    status,
                    reason: resp
                        .status()
                        .canonical_reason()
                        .unwrap_or("rejected")
                        .to_string(),
                }
            } else {
                ConnectionError::Network(format!("upgrade rejected with status {status}"))
            }
        }
        tungstenite::Error::Url(e) => ConnectionError::Protocol(format!("bad url: {e}")),
        other => ConnectionError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::http;

    fn backoff_config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 1_000,
            max_ms: 8_000,
            jitter,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(&backoff_config(0.0));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff = Backoff::new(&backoff_config(0.25));
        for _ in 0..50 {
            backoff.reset();
            let d = backoff.next_delay().as_millis() as u64;
            assert!((750..=1_250).contains(&d), "delay {d} outside jitter band");
        }
    }

    fn feed_config(url: String, max_subscriptions: usize) -> FeedConfig {
        FeedConfig {
            ws_url: url,
            heartbeat_timeout_ms: 2_000,
            ping_interval_ms: 500,
            max_subscriptions,
            ..FeedConfig::default()
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 10,
            max_ms: 50,
            jitter: 0.0,
        }
    }

    fn manager(
        url: String,
        registry: Arc<MarketRegistry>,
        max_subscriptions: usize,
    ) -> (ConnectionManager, FeedHandle, mpsc::Receiver<InboundFrame>) {
        manager_with(feed_config(url, max_subscriptions), fast_backoff(), registry)
    }

    fn manager_with(
        config: FeedConfig,
        backoff: BackoffConfig,
        registry: Arc<MarketRegistry>,
    ) -> (ConnectionManager, FeedHandle, mpsc::Receiver<InboundFrame>) {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (handle, cmd_rx) = FeedHandle::channel(16);
        let mgr = ConnectionManager::new(
            config,
            &backoff,
            Credentials::new("key", "secret"),
            registry,
            frame_tx,
            cmd_rx,
        );
        (mgr, handle, frame_rx)
    }

    async fn next_text<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected ws item: {other:?}"),
            }
        }
    }

    #[test]
    fn test_apply_command_enforces_limit() {
        let registry = Arc::new(MarketRegistry::new());
        let (mut mgr, _handle, _rx) = manager("ws://unused".into(), Arc::clone(&registry), 2);

        let msgs = mgr.apply_command(&FeedCommand::Subscribe(vec![
            "A".into(),
            "B".into(),
            "C".into(),
        ]));
        assert_eq!(msgs.len(), 1);
        assert_eq!(registry.subscribed_tickers(), vec!["A", "B"]);
        assert_eq!(mgr.stats.subscriptions_refused.load(Ordering::Relaxed), 1);

        // Already subscribed: nothing to send
        assert!(mgr.apply_command(&FeedCommand::Subscribe(vec!["A".into()])).is_empty());

        let msgs = mgr.apply_command(&FeedCommand::Resubscribe("A".into()));
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].contains("unsubscribe"));

        // Unknown market: no resubscribe
        assert!(mgr.apply_command(&FeedCommand::Resubscribe("Z".into())).is_empty());

        let msgs = mgr.apply_command(&FeedCommand::Unsubscribe(vec!["B".into(), "Z".into()]));
        assert_eq!(msgs.len(), 1);
        assert_eq!(registry.subscribed_tickers(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_signed_connect_subscribe_and_resubscribe_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = Arc::new(MarketRegistry::new());
        registry.mark_subscribed("MKT", 0);
        let (mgr, _handle, mut frames) = manager(format!("ws://{addr}/ws/v2"), Arc::clone(&registry), 10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(mgr.run(shutdown_rx));

        for round in 0..2 {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| {
                assert!(req.headers().contains_key("FEED-ACCESS-SIGNATURE"));
                assert!(req.headers().contains_key("FEED-ACCESS-TIMESTAMP"));
                Ok(resp)
            })
            .await
            .unwrap();
            let (mut tx, mut rx) = ws.split();

            let lifecycle = next_text(&mut rx).await;
            assert_eq!(lifecycle["params"]["channels"][0], "market_lifecycle");
            let sub = next_text(&mut rx).await;
            assert_eq!(sub["params"]["market_tickers"][0], "MKT");

            let snapshot = format!(
                r#"{{"type":"orderbook_snapshot","market_ticker":"MKT","seq":{},"yes":[],"no":[]}}"#,
                round
            );
            tx.send(Message::Text(snapshot.clone())).await.unwrap();
            let frame = frames.recv().await.unwrap();
            assert_eq!(frame.text, snapshot);
            assert_eq!(frame.session, round);

            // Drop the connection; the manager must reconnect and resubscribe.
            drop(tx);
            drop(rx);
        }

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }

    #[tokio::test]
    async fn test_auth_rejection_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = tokio_tungstenite::accept_hdr_async(tcp, |_req: &Request, _resp: Response| {
                let reject: ErrorResponse = http::Response::builder()
                    .status(http::StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap();
                Err(reject)
            })
            .await;
        });

        let registry = Arc::new(MarketRegistry::new());
        let (mgr, _handle, _frames) = manager(format!("ws://{addr}/ws/v2"), registry, 10);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(5), mgr.run(shutdown_rx))
            .await
            .expect("manager should halt on auth failure");
        assert!(matches!(result, Err(ConnectionError::Auth { status: 401, .. })));
    }

    #[tokio::test]
    async fn test_silent_connection_times_out_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = Arc::new(MarketRegistry::new());
        registry.mark_subscribed("MKT", 0);
        let config = FeedConfig {
            heartbeat_timeout_ms: 300,
            ping_interval_ms: 10_000,
            ..feed_config(format!("ws://{addr}/ws/v2"), 10)
        };
        let (mgr, _handle, _frames) = manager_with(config, fast_backoff(), Arc::clone(&registry));
        let stats = mgr.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(mgr.run(shutdown_rx));

        // Accept and take the subscriptions, then go quiet without closing.
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let (_silent_tx, mut silent_rx) = ws.split();
        next_text(&mut silent_rx).await;
        let sub = next_text(&mut silent_rx).await;
        assert_eq!(sub["params"]["market_tickers"][0], "MKT");

        let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("manager should reconnect after the liveness deadline")
            .unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let (_tx, mut rx) = ws.split();
        let lifecycle = next_text(&mut rx).await;
        assert_eq!(lifecycle["params"]["channels"][0], "market_lifecycle");
        let sub = next_text(&mut rx).await;
        assert_eq!(sub["params"]["market_tickers"][0], "MKT");

        assert_eq!(stats.heartbeat_timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connects.load(Ordering::Relaxed), 2);
        assert_eq!(stats.disconnects.load(Ordering::Relaxed), 1);
        assert_eq!(registry.session_id(), 1);

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_returns_promptly() {
        // Nothing listens here, so the connect fails and the manager backs off.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let backoff = BackoffConfig {
            initial_ms: 60_000,
            max_ms: 60_000,
            jitter: 0.0,
        };
        let registry = Arc::new(MarketRegistry::new());
        let (mgr, _handle, _frames) =
            manager_with(feed_config(format!("ws://{addr}/ws/v2"), 10), backoff, registry);
        let stats = mgr.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(mgr.run(shutdown_rx));

        for _ in 0..200 {
            if stats.disconnects.load(Ordering::Relaxed) > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.disconnects.load(Ordering::Relaxed), 1);

        let started = std::time::Instant::now();
        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("manager should stop without sitting out the backoff")
            .unwrap();
        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.connects.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_wait_sits_out_delay_and_keeps_commands() {
        let registry = Arc::new(MarketRegistry::new());
        let (mut mgr, handle, _frames) = manager("ws://unused".into(), Arc::clone(&registry), 10);
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        handle.subscribe(vec!["A".into()]).await;
        let started = Instant::now();
        assert!(!mgr.wait_offline(Duration::from_secs(30), &mut shutdown).await);
        assert!(started.elapsed() >= Duration::from_secs(30));

        // Recorded for the next session; nothing was sent.
        assert_eq!(registry.subscribed_tickers(), vec!["A"]);
        assert_eq!(mgr.stats.commands_sent.load(Ordering::Relaxed), 0);

        let waiter = tokio::spawn(async move {
            let started = Instant::now();
            let stopped = mgr.wait_offline(Duration::from_secs(30), &mut shutdown).await;
            (stopped, started.elapsed())
        });
        sleep(Duration::from_secs(5)).await;
        shutdown_tx.send(true).unwrap();
        let (stopped, waited) = waiter.await.unwrap();
        assert!(stopped);
        assert!(waited < Duration::from_secs(30));
    }
}
