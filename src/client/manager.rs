//! Connection manager
//!
//! Owns the single socket to the election-updates server and everything about
//! its lifecycle: token acquisition, the open/close state machine, reconnects
//! with exponential backoff, the token-refresh fast path for auth rejections,
//! heartbeat pings and connection metrics.
//!
//! All state lives behind one mutex that is never held across an `.await` or
//! while user callbacks run. Every background task (event pump, heartbeat,
//! reconnect timer) captures the epoch it was started in and does nothing once
//! the epoch has moved on, so a `disconnect()` racing with a slow token fetch
//! or a late transport event cannot resurrect the connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::endpoint::redact;
use super::{
    ClientError, ConnectionMetrics, Connector, HealthStatus, TokenProvider, Transport,
    TransportEvent, TransportEvents,
};
use crate::config::ClientConfig;
use crate::dispatch::{Dispatched, Dispatcher, Listeners, Subscription, Topic};
use crate::protocol::{CloseDisposition, CloseInfo, Message, CLOSE_NORMAL};

const CLIENT_DISCONNECT: &str = "Client disconnect";

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Transport created, handshake in progress
    Connecting,
    /// Handshake complete
    Open,
    /// Client-initiated close in progress
    Closing,
    /// Closed; may re-enter `Connecting` through a reconnect
    Closed,
}

impl ConnectionState {
    /// Whether a transport exists that a new connect would duplicate
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

struct PendingReconnect {
    delay: Duration,
    task: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    /// Bumped by every transport open and every disconnect
    epoch: u64,
    should_reconnect: bool,
    /// Cleared by a manual connect or the first delivered frame, not by an open
    auth_refresh_tried: bool,
    token: Option<String>,
    connection_id: Option<Uuid>,
    transport: Option<Box<dyn Transport>>,
    attempts: u32,
    reconnect: Option<PendingReconnect>,
    heartbeat: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    metrics: ConnectionMetrics,
    last_message: Option<Instant>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            epoch: 0,
            should_reconnect: false,
            auth_refresh_tried: false,
            token: None,
            connection_id: None,
            transport: None,
            attempts: 0,
            reconnect: None,
            heartbeat: None,
            pump: None,
            metrics: ConnectionMetrics::default(),
            last_message: None,
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            pending.task.abort();
        }
    }

    fn replace_reconnect(&mut self, pending: PendingReconnect) {
        if let Some(previous) = self.reconnect.replace(pending) {
            previous.task.abort();
        }
    }
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    on_connect: Listeners<()>,
    on_disconnect: Listeners<CloseInfo>,
    on_error: Listeners<ClientError>,
    token_provider: Mutex<Option<Arc<dyn TokenProvider>>>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.cancel_reconnect();
        inner.stop_heartbeat();
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
    }
}

/// Handle to the shared connection
///
/// Construct one per process and clone it into every consumer; clones share
/// the same socket, handlers and metrics.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager that opens transports through `connector`
    pub fn new(config: ClientConfig, connector: impl Connector + 'static) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                connector: Arc::new(connector),
                dispatcher: Dispatcher::new(),
                on_connect: Listeners::new(),
                on_disconnect: Listeners::new(),
                on_error: Listeners::new(),
                token_provider: Mutex::new(None),
                state_tx,
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    /// Install the provider used whenever a token must be (re)fetched
    pub fn set_token_provider(&self, provider: impl TokenProvider + 'static) {
        let provider: Arc<dyn TokenProvider> = Arc::new(provider);
        *self
            .shared
            .token_provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a handler for inbound messages of a type, or `"*"` for all
    pub fn on<F>(&self, topic: impl Into<Topic>, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(topic, handler)
    }

    /// Register a callback for every successful open
    pub fn on_connect<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.on_connect.add(Arc::new(move |_: &()| handler()))
    }

    /// Register a callback for every close, server- or client-initiated
    pub fn on_disconnect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&CloseInfo) + Send + Sync + 'static,
    {
        self.shared.on_disconnect.add(Arc::new(handler))
    }

    /// Register a callback for transport and token errors
    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.shared.on_error.add(Arc::new(handler))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.lock().metrics.clone()
    }

    pub fn health(&self) -> HealthStatus {
        let inner = self.lock();
        let age = inner.last_message.map(|at| at.elapsed());
        HealthStatus::evaluate(
            inner.state,
            age,
            self.shared.config.heartbeat.stale_after(),
            inner.metrics.clone(),
        )
    }

    /// Reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Delay of the pending reconnect timer, if one is scheduled
    pub fn pending_reconnect_delay(&self) -> Option<Duration> {
        self.lock().reconnect.as_ref().map(|pending| pending.delay)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the connection
    ///
    /// Without a token the installed provider is asked for one. Does nothing
    /// if a connection is already open or being opened. Failures are reported
    /// to error hooks, never returned.
    pub async fn connect(&self, token: Option<String>) {
        let epoch = {
            let mut inner = self.lock();
            if inner.state.is_live() {
                debug!("connect() ignored: connection is {:?}", inner.state);
                return;
            }
            inner.attempts = 0;
            inner.auth_refresh_tried = false;
            inner.epoch
        };

        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => Some(token),
            None => self.fetch_token().await,
        };

        match token {
            Some(token) => self.open_transport(epoch, token),
            None => {
                warn!("Cannot connect: no authentication token available");
                self.report_error(ClientError::MissingToken);
            }
        }
    }

    /// Close the connection and stop all reconnection
    ///
    /// Safe to call in any state, any number of times.
    pub fn disconnect(&self) {
        let was_live = {
            let mut inner = self.lock();
            inner.should_reconnect = false;
            inner.epoch += 1;
            inner.cancel_reconnect();
            inner.stop_heartbeat();
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }

            let was_live = inner.state.is_live();
            if let Some(transport) = inner.transport.take() {
                if was_live {
                    self.transition(&mut inner, ConnectionState::Closing);
                    transport.close(CLOSE_NORMAL, CLIENT_DISCONNECT);
                }
            }
            if inner.state != ConnectionState::Idle {
                self.transition(&mut inner, ConnectionState::Closed);
            }
            if let Some(connection_id) = inner.connection_id.take() {
                info!(%connection_id, "Disconnected");
            }
            was_live
        };

        if was_live {
            self.shared
                .on_disconnect
                .emit(&CloseInfo::new(CLOSE_NORMAL, CLIENT_DISCONNECT));
        }
    }

    /// Send a message if the connection is open
    ///
    /// Returns whether the frame was handed to the transport. Messages sent
    /// while not open are dropped with a warning; there is no queue.
    pub fn send(&self, message: &Message) -> bool {
        let outcome = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Open {
                warn!(
                    "Dropping outbound {} message: connection is {:?}",
                    message.kind, inner.state
                );
                return false;
            }

            let outcome = message
                .to_json()
                .map_err(ClientError::from)
                .and_then(|json| match inner.transport.as_ref() {
                    Some(transport) => transport.send_text(json),
                    None => Err(ClientError::Transport("no transport".to_string())),
                });
            if outcome.is_ok() {
                inner.metrics.messages_sent += 1;
            }
            outcome
        };

        match outcome {
            Ok(()) => {
                debug!("Sent {} message", message.kind);
                true
            }
            Err(e) => {
                self.report_error(e);
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state != next {
            debug!("Connection state {:?} -> {:?}", inner.state, next);
            inner.state = next;
            self.shared.state_tx.send_replace(next);
        }
    }

    async fn fetch_token(&self) -> Option<String> {
        let provider = self
            .shared
            .token_provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match provider {
            Some(provider) => provider.token().await,
            None => {
                debug!("No token provider installed");
                None
            }
        }
    }

    fn report_error(&self, error: ClientError) {
        self.lock().metrics.errors += 1;
        warn!("Connection error: {}", error);
        self.shared.on_error.emit(&error);
    }

    /// Create a transport, unless `expected_epoch` has been superseded
    fn open_transport(&self, expected_epoch: u64, token: String) {
        let url = match self.shared.config.endpoint.socket_url(&token) {
            Ok(url) => url,
            Err(e) => {
                self.report_error(e);
                return;
            }
        };

        let opened = {
            let mut inner = self.lock();
            if inner.epoch != expected_epoch || inner.state.is_live() {
                debug!("Discarding superseded connect attempt");
                return;
            }

            match self.shared.connector.open(&url) {
                Ok((transport, events)) => {
                    inner.epoch += 1;
                    let epoch = inner.epoch;
                    let connection_id = Uuid::new_v4();
                    info!(%connection_id, "Connecting to {}", redact(&url));

                    inner.cancel_reconnect();
                    inner.should_reconnect = true;
                    inner.token = Some(token);
                    inner.connection_id = Some(connection_id);
                    inner.transport = Some(transport);
                    if let Some(previous) = inner.pump.replace(self.spawn_pump(epoch, events)) {
                        previous.abort();
                    }
                    self.transition(&mut inner, ConnectionState::Connecting);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = opened {
            self.report_error(e);
        }
    }

    fn spawn_pump(&self, epoch: u64, mut events: TransportEvents) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = Self::upgrade(&shared) else {
                    break;
                };
                if !manager.handle_event(epoch, event) {
                    break;
                }
            }
        })
    }

    /// Returns false once the transport has closed
    fn handle_event(&self, epoch: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Opened => self.handle_open(epoch),
            TransportEvent::Text(text) => self.handle_text(epoch, &text),
            TransportEvent::Error(message) => {
                if self.lock().epoch == epoch {
                    self.report_error(ClientError::Transport(message));
                }
            }
            TransportEvent::Closed { code, reason } => {
                self.handle_close(epoch, CloseInfo::new(code, reason));
                return false;
            }
        }
        true
    }

    fn handle_open(&self, epoch: u64) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.attempts = 0;
            inner.metrics.reconnect_count = 0;
            inner.metrics.connected_at = Some(Utc::now());
            self.transition(&mut inner, ConnectionState::Open);
            self.start_heartbeat(&mut inner, epoch);
            if let Some(connection_id) = inner.connection_id {
                info!(%connection_id, "Connected");
            }
        }
        self.shared.on_connect.emit(&());
    }

    fn handle_text(&self, epoch: u64, text: &str) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.metrics.messages_received += 1;
            inner.metrics.last_message_at = Some(Utc::now());
            inner.last_message = Some(Instant::now());
        }

        match self.shared.dispatcher.dispatch_text(text) {
            Ok(Dispatched::Pong) => {}
            Ok(Dispatched::Delivered(_)) => {
                // The server accepted the token for real
                let mut inner = self.lock();
                if inner.epoch == epoch {
                    inner.auth_refresh_tried = false;
                }
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.lock().metrics.errors += 1;
            }
        }
    }

    fn handle_close(&self, epoch: u64, close: CloseInfo) {
        let refresh = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.transport = None;
            // Dropping our own handle detaches; the pump exits after this event
            inner.pump = None;
            inner.stop_heartbeat();
            self.transition(&mut inner, ConnectionState::Closed);
            info!("Connection closed (code {}) {}", close.code, close.reason);

            let refresh = close.disposition() == CloseDisposition::AuthRejected
                && !inner.auth_refresh_tried;
            if refresh {
                inner.auth_refresh_tried = true;
            }
            refresh
        };

        self.shared.on_disconnect.emit(&close);

        if refresh {
            self.spawn_token_refresh(epoch, close.code);
        } else {
            self.schedule_reconnect(epoch, close.code);
        }
    }

    /// Apply the backoff policy after a close with `code`
    fn schedule_reconnect(&self, epoch: u64, code: u16) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        match CloseDisposition::of(code) {
            CloseDisposition::Normal => {
                debug!("Normal closure; not reconnecting");
                return;
            }
            CloseDisposition::Abnormal => {
                warn!("Connection lost without a close frame; reconnect manually");
                return;
            }
            CloseDisposition::AuthRejected | CloseDisposition::Retry => {}
        }
        if !inner.should_reconnect {
            return;
        }

        let policy = &self.shared.config.reconnect;
        if !policy.allows(inner.attempts) {
            warn!(
                "Giving up after {} reconnect attempts; call connect() to retry",
                inner.attempts
            );
            return;
        }

        inner.attempts += 1;
        inner.metrics.reconnect_count += 1;
        let delay = policy.delay_for(inner.attempts);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, inner.attempts, policy.max_attempts
        );

        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = Self::upgrade(&shared) {
                manager.run_reconnect(epoch).await;
            }
        });
        inner.replace_reconnect(PendingReconnect { delay, task });
    }

    async fn run_reconnect(&self, epoch: u64) {
        let last_token = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.reconnect = None;
            inner.token.clone()
        };

        match self.fetch_token().await.or(last_token) {
            Some(token) => self.open_transport(epoch, token),
            None => self.report_error(ClientError::MissingToken),
        }
    }

    /// Fast path for auth rejections: fetch a new token and reconnect now
    fn spawn_token_refresh(&self, epoch: u64, code: u16) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }

        info!("Server rejected the token (code {}); refreshing", code);
        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            if let Some(manager) = Self::upgrade(&shared) {
                manager.refresh_and_reconnect(epoch, code).await;
            }
        });
        inner.replace_reconnect(PendingReconnect {
            delay: Duration::ZERO,
            task,
        });
    }

    async fn refresh_and_reconnect(&self, epoch: u64, code: u16) {
        let token = self.fetch_token().await;
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.reconnect = None;
            if token.is_some() {
                inner.attempts = 0;
            }
        }

        match token {
            Some(token) => self.open_transport(epoch, token),
            None => {
                warn!("Token refresh returned nothing; falling back to backoff");
                self.schedule_reconnect(epoch, code);
            }
        }
    }

    fn start_heartbeat(&self, inner: &mut Inner, epoch: u64) {
        inner.stop_heartbeat();
        let period = self.shared.config.heartbeat.interval();
        if period.is_zero() {
            return;
        }

        let shared = Arc::downgrade(&self.shared);
        inner.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = Self::upgrade(&shared) else {
                    break;
                };
                if manager.lock().epoch != epoch {
                    break;
                }
                manager.send(&Message::ping());
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockConnector;
    use crate::client::token_fn;
    use crate::protocol::{MessageType, CLOSE_ABNORMAL, CLOSE_AUTH_FAILED, CLOSE_TOKEN_EXPIRED};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn manager(connector: &MockConnector) -> ConnectionManager {
        ConnectionManager::new(ClientConfig::default(), connector.clone())
    }

    async fn connected(connector: &MockConnector) -> ConnectionManager {
        let manager = manager(connector);
        manager.connect(Some("T1".to_string())).await;
        connector.last().open();
        settle().await;
        manager
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&count), count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_opens_and_resets_counters() {
        let connector = MockConnector::default();
        let manager = manager(&connector);
        let (hook, connects) = counter();
        let _sub = manager.on_connect(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        manager.connect(Some("T1".to_string())).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!manager.is_connected());

        connector.last().open();
        settle().await;

        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempts(), 0);
        let metrics = manager.metrics();
        assert_eq!(metrics.reconnect_count, 0);
        assert!(metrics.connected_at.is_some());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.last().token().as_deref(), Some("T1"));
        assert_eq!(connector.last().url.path(), "/ws/election-updates/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_right_after_connect() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;

        let health = manager.health();
        assert!(health.is_healthy);
        assert!(health.last_message_age.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_uses_token_provider() {
        let connector = MockConnector::default();
        let manager = manager(&connector);
        manager.set_token_provider(token_fn(|| async { Some("P1".to_string()) }));

        manager.connect(None).await;
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.last().token().as_deref(), Some("P1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_token_reports_error() {
        let connector = MockConnector::default();
        let manager = manager(&connector);
        let (hook, errors) = counter();
        let _sub = manager.on_error(move |e| {
            assert!(matches!(e, ClientError::MissingToken));
            hook.fetch_add(1, Ordering::SeqCst);
        });

        manager.connect(None).await;

        assert_eq!(connector.opened(), 0);
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.metrics().errors, 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_noop_while_connecting_or_open() {
        let connector = MockConnector::default();
        let manager = manager(&connector);

        manager.connect(Some("T1".to_string())).await;
        manager.connect(Some("T1".to_string())).await;
        assert_eq!(connector.opened(), 1);

        connector.last().open();
        settle().await;
        manager.connect(Some("T2".to_string())).await;
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_counted() {
        let connector = MockConnector::default();
        connector.fail_next_opens(true);
        let manager = manager(&connector);

        manager.connect(Some("T1".to_string())).await;

        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.metrics().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_connection() {
        let connector = MockConnector::default();
        let manager = manager(&connector);
        let ping = Message::ping();

        assert!(!manager.send(&ping));

        manager.connect(Some("T1".to_string())).await;
        assert!(!manager.send(&ping));
        assert!(connector.last().sent().is_empty());

        connector.last().open();
        settle().await;
        assert!(manager.send(&ping));
        assert_eq!(connector.last().sent().len(), 1);
        assert_eq!(manager.metrics().messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_are_dispatched_and_counted() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = manager.on("guarantee_update", move |msg| sink.lock().unwrap().push(msg.clone()));
        let (hook, error_hooks) = counter();
        let _err = manager.on_error(move |_| {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        let socket = connector.last();
        socket.text(r#"{"type":"guarantee_update","action":"created","data":{"id":3}}"#);
        socket.text(r#"{"type":"pong"}"#);
        socket.text("garbage");
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, MessageType::GuaranteeUpdate);

        let metrics = manager.metrics();
        assert_eq!(metrics.messages_received, 3);
        assert_eq!(metrics.errors, 1);
        assert!(metrics.last_message_at.is_some());
        assert_eq!(error_hooks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_and_abnormal_close_do_not_reconnect() {
        for code in [CLOSE_NORMAL, CLOSE_ABNORMAL] {
            let connector = MockConnector::default();
            let manager = connected(&connector).await;
            let (hook, disconnects) = counter();
            let _sub = manager.on_disconnect(move |close| {
                assert_eq!(close.code, code);
                hook.fetch_add(1, Ordering::SeqCst);
            });

            connector.last().close(code);
            settle().await;

            assert_eq!(manager.state(), ConnectionState::Closed);
            assert_eq!(manager.pending_reconnect_delay(), None);
            assert_eq!(disconnects.load(Ordering::SeqCst), 1);

            tokio::time::advance(Duration::from_secs(120)).await;
            settle().await;
            assert_eq!(connector.opened(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_close_schedules_one_backoff_timer() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;

        connector.last().close(1011);
        settle().await;

        assert_eq!(manager.pending_reconnect_delay(), Some(Duration::from_millis(3000)));
        assert_eq!(manager.reconnect_attempts(), 1);
        assert_eq!(manager.metrics().reconnect_count, 1);

        tokio::time::advance(Duration::from_millis(2999)).await;
        settle().await;
        assert_eq!(connector.opened(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.opened(), 2);
        assert_eq!(connector.last().token().as_deref(), Some("T1"));
        assert_eq!(manager.pending_reconnect_delay(), None);

        connector.last().open();
        settle().await;
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(manager.metrics().reconnect_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_prefers_fresh_token() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        manager.set_token_provider(token_fn(|| async { Some("FRESH".to_string()) }));

        connector.last().close(1011);
        settle().await;
        tokio::time::advance(Duration::from_millis(3000)).await;
        settle().await;

        assert_eq!(connector.last().token().as_deref(), Some("FRESH"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_stops_after_max_attempts() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;

        let expected = [3000, 6000, 12000, 24000, 48000];
        for (attempt, delay_ms) in expected.iter().enumerate() {
            connector.last().close(1011);
            settle().await;
            assert_eq!(
                manager.pending_reconnect_delay(),
                Some(Duration::from_millis(*delay_ms)),
                "attempt {}",
                attempt + 1
            );
            tokio::time::advance(Duration::from_millis(*delay_ms)).await;
            settle().await;
            assert_eq!(connector.opened(), attempt + 2);
        }

        connector.last().close(1011);
        settle().await;
        assert_eq!(manager.pending_reconnect_delay(), None);
        assert_eq!(manager.reconnect_attempts(), 5);

        // Manual connect resumes
        manager.connect(Some("T1".to_string())).await;
        assert_eq!(connector.opened(), 7);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_refreshes_token_immediately() {
        for code in [CLOSE_AUTH_FAILED, CLOSE_TOKEN_EXPIRED] {
            let connector = MockConnector::default();
            let manager = connected(&connector).await;
            manager.set_token_provider(token_fn(|| async { Some("T2".to_string()) }));

            connector.last().close(code);
            settle().await;

            assert_eq!(connector.opened(), 2);
            assert_eq!(connector.last().token().as_deref(), Some("T2"));
            assert_eq!(manager.pending_reconnect_delay(), None);
            assert_eq!(manager.reconnect_attempts(), 0);
            assert_eq!(manager.state(), ConnectionState::Connecting);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_falls_back_to_backoff() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        manager.set_token_provider(token_fn(|| async { None }));

        connector.last().close(CLOSE_AUTH_FAILED);
        settle().await;

        assert_eq!(connector.opened(), 1);
        assert_eq!(manager.pending_reconnect_delay(), Some(Duration::from_millis(3000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_auth_rejection_uses_backoff() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        manager.set_token_provider(token_fn(|| async { Some("T2".to_string()) }));

        connector.last().close(CLOSE_AUTH_FAILED);
        settle().await;
        assert_eq!(connector.opened(), 2);

        // Rejected again before ever opening
        connector.last().close(CLOSE_AUTH_FAILED);
        settle().await;
        assert_eq!(connector.opened(), 2);
        assert_eq!(manager.pending_reconnect_delay(), Some(Duration::from_millis(3000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_after_open_refreshes_once() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        manager.set_token_provider(token_fn(|| async { Some("STALE".to_string()) }));

        // Server accepts every handshake, then rejects the token
        for _ in 0..10 {
            connector.last().close(CLOSE_AUTH_FAILED);
            settle().await;
            if manager.pending_reconnect_delay().is_some() {
                break;
            }
            connector.last().open();
            settle().await;
        }

        assert_eq!(connector.opened(), 2);
        assert_eq!(manager.reconnect_attempts(), 1);
        assert_eq!(manager.pending_reconnect_delay(), Some(Duration::from_millis(3000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_frame_rearms_auth_refresh() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        manager.set_token_provider(token_fn(|| async { Some("T2".to_string()) }));

        connector.last().close(CLOSE_TOKEN_EXPIRED);
        settle().await;
        connector.last().open();
        connector.last().text(r#"{"type":"dashboard_update"}"#);
        settle().await;

        connector.last().close(CLOSE_TOKEN_EXPIRED);
        settle().await;
        assert_eq!(connector.opened(), 3);
        assert_eq!(manager.pending_reconnect_delay(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_cancels_pending_reconnect() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;

        connector.last().close(1011);
        settle().await;
        assert!(manager.pending_reconnect_delay().is_some());

        manager.connect(Some("T2".to_string())).await;
        assert_eq!(manager.pending_reconnect_delay(), None);
        connector.last().open();
        settle().await;
        assert!(manager.is_connected());

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(connector.opened(), 2);
        assert_eq!(manager.pending_reconnect_delay(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_after_open() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        let (hook, disconnects) = counter();
        let _sub = manager.on_disconnect(move |close| {
            assert_eq!(close.code, CLOSE_NORMAL);
            hook.fetch_add(1, Ordering::SeqCst);
        });

        manager.disconnect();

        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.pending_reconnect_delay(), None);
        assert_eq!(connector.last().closed_with(), Some(CLOSE_NORMAL));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        // No heartbeat survives
        tokio::time::advance(Duration::from_secs(90)).await;
        settle().await;
        assert!(connector.last().sent().is_empty());

        manager.disconnect();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_on_idle_manager() {
        let connector = MockConnector::default();
        let manager = manager(&connector);
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;

        connector.last().close(1011);
        settle().await;
        assert!(manager.pending_reconnect_delay().is_some());

        manager.disconnect();
        assert_eq!(manager.pending_reconnect_delay(), None);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_after_disconnect_are_ignored() {
        let connector = MockConnector::default();
        let manager = manager(&connector);

        manager.connect(Some("T1".to_string())).await;
        manager.disconnect();
        connector.last().open();
        settle().await;

        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_token_fetch_discards_connect() {
        let connector = MockConnector::default();
        let manager = manager(&connector);
        manager.set_token_provider(token_fn(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Some("SLOW".to_string())
        }));

        let pending = manager.clone();
        let handle = tokio::spawn(async move { pending.connect(None).await });
        settle().await;
        manager.disconnect();
        handle.await.unwrap();

        assert_eq!(connector.opened(), 0);
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_pings_while_open() {
        let connector = MockConnector::default();
        let _manager = connected(&connector).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert!(connector.last().sent().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        let sent = connector.last().sent();
        assert_eq!(sent.len(), 1);
        let ping = Message::from_json(&sent[0]).unwrap();
        assert_eq!(ping.kind, MessageType::Ping);
        assert!(ping.timestamp.is_some());

        connector.last().close(1011);
        settle().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(connector.socket(0).sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_becomes_unhealthy() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;

        connector.last().text(r#"{"type":"dashboard_update"}"#);
        settle().await;
        assert!(manager.health().is_healthy);

        tokio::time::advance(Duration::from_secs(121)).await;
        settle().await;
        let health = manager.health();
        assert!(health.is_connected);
        assert!(!health.is_healthy);
        assert!(health.last_message_age.unwrap() >= Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_reaches_error_hooks() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;
        let (hook, errors) = counter();
        let _sub = manager.on_error(move |e| {
            assert!(matches!(e, ClientError::Transport(_)));
            hook.fetch_add(1, Ordering::SeqCst);
        });

        connector
            .last()
            .emit(TransportEvent::Error("connection reset".to_string()));
        settle().await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(manager.metrics().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_watch_follows_transitions() {
        let connector = MockConnector::default();
        let manager = manager(&connector);
        let state = manager.subscribe_state();
        assert_eq!(*state.borrow(), ConnectionState::Idle);

        manager.connect(Some("T1".to_string())).await;
        assert_eq!(*state.borrow(), ConnectionState::Connecting);

        connector.last().open();
        settle().await;
        assert_eq!(*state.borrow(), ConnectionState::Open);

        manager.disconnect();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_are_copies() {
        let connector = MockConnector::default();
        let manager = connected(&connector).await;

        let mut snapshot = manager.metrics();
        snapshot.errors = 99;
        assert_eq!(snapshot.errors, 99);
        assert_eq!(manager.metrics().errors, 0);
    }
}
