//! Websocket connection lifecycle.
//!
//! [`ConnectionManager`] owns the socket through one background worker per
//! explicit `connect()`. The worker performs the handshake, streams every
//! inbound frame to the [`Dispatcher`], writes queued outbound frames, and
//! reopens the socket with capped exponential backoff after transient
//! failures.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{inline_credentials_url, redacted, token_url, ClientConfig, ConnectMode, Credentials};
use crate::error::SessionError;
use crate::retry::{with_timeout, ReconnectPolicy, RetryDecision, RetryState};
use crate::session::dispatch::Dispatcher;
use crate::session::proto::{ConnectionAck, RequestFrame};

/// Liveness of the managed connection.
///
/// Transitions: `Starting -> Connected -> (Disconnected -> Starting)* -> Stopped`.
/// Only an explicit `connect()` leaves `Stopped`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Starting,
    Connected,
    Disconnected,
    Stopped,
}

/// Why the connection reached [`ConnectionState::Stopped`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// `disconnect()` was called.
    Requested,
    /// The server answered the handshake with an `invalid` acknowledgement.
    InvalidCredentials(String),
    /// The websocket upgrade was refused or the endpoint is unusable.
    Rejected(String),
    /// Consecutive transient failures reached the reconnect ceiling.
    RetriesExhausted(u32),
}

impl StopReason {
    fn into_error(self) -> SessionError {
        match self {
            Self::InvalidCredentials(message) => SessionError::InvalidCredentials(message),
            Self::Rejected(message) => SessionError::Protocol(message),
            Self::Requested | Self::RetriesExhausted(_) => SessionError::NotConnected,
        }
    }
}

/// Outcome of a connect attempt, kept so that callers queued behind it observe it.
#[derive(Clone, Debug)]
enum ConnectFailure {
    InvalidCredentials(String),
    Timeout(Duration),
    NotConnected,
    Rejected(String),
    Unavailable(String),
}

impl From<&SessionError> for ConnectFailure {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::InvalidCredentials(message) => Self::InvalidCredentials(message.clone()),
            SessionError::ConnectionTimeout(timeout) => Self::Timeout(*timeout),
            SessionError::NotConnected => Self::NotConnected,
            SessionError::Protocol(message) => Self::Rejected(message.clone()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<ConnectFailure> for SessionError {
    fn from(failure: ConnectFailure) -> Self {
        match failure {
            ConnectFailure::InvalidCredentials(message) => Self::InvalidCredentials(message),
            ConnectFailure::Timeout(timeout) => Self::ConnectionTimeout(timeout),
            ConnectFailure::NotConnected => Self::NotConnected,
            ConnectFailure::Rejected(message) => Self::Protocol(message),
            ConnectFailure::Unavailable(message) => Self::TransientNetwork(message),
        }
    }
}

struct Shared {
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
    heartbeat_interval: Duration,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    stop_reason: Mutex<Option<StopReason>>,
    reconnect_now: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Applies an automatic transition. Refused once `Stopped`.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut allowed = true;
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Stopped && next != ConnectionState::Stopped {
                allowed = false;
                return false;
            }
            if *current == next {
                return false;
            }
            debug!(event = "connection_state", from = ?*current, to = ?next);
            *current = next;
            true
        });
        allowed
    }

    /// Moves to `Stopped`, recording the first reason.
    fn stop(&self, reason: StopReason) {
        let mut reason = Some(reason);
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Stopped {
                return false;
            }
            *lock(&self.stop_reason) = reason.take();
            debug!(event = "connection_state", from = ?*current, to = ?ConnectionState::Stopped);
            *current = ConnectionState::Stopped;
            true
        });
    }

    /// Explicit restart by `connect()`: the only way out of `Stopped`.
    fn restart(&self) {
        *lock(&self.stop_reason) = None;
        self.state.send_replace(ConnectionState::Starting);
    }

    fn stop_error(&self) -> SessionError {
        lock(&self.stop_reason)
            .clone()
            .map_or(SessionError::NotConnected, StopReason::into_error)
    }
}

struct Worker {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of the websocket and its reconnect state machine.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    ws_url: String,
    credentials: Credentials,
    connect_mode: ConnectMode,
    connect_lock: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
    attempts: AtomicU64,
    last_failure: Mutex<Option<ConnectFailure>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("ws_url", &self.ws_url)
            .field("connect_mode", &self.connect_mode)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                handshake_timeout: config.handshake_timeout,
                // `interval_at` rejects a zero period.
                heartbeat_interval: config.heartbeat_interval.max(Duration::from_millis(1)),
                reconnect: config.reconnect.clone(),
                state,
                stop_reason: Mutex::new(None),
                reconnect_now: Notify::new(),
            }),
            ws_url: config.ws_url.clone(),
            credentials: config.credentials.clone(),
            connect_mode: config.connect_mode.clone(),
            connect_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver observing every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Cause of the last `Stopped` transition, if any.
    pub fn stop_reason(&self) -> Option<StopReason> {
        lock(&self.shared.stop_reason).clone()
    }

    /// True when stopped, or when no live worker owns a socket.
    pub fn is_disconnected(&self) -> bool {
        if self.state() == ConnectionState::Stopped {
            return true;
        }
        lock(&self.worker)
            .as_ref()
            .map_or(true, |worker| worker.task.is_finished() || worker.outbound.is_closed())
    }

    /// Ensures the connection is established.
    ///
    /// Returns immediately when already connected. Concurrent callers are
    /// serialized; a caller that waited behind another attempt gets that
    /// attempt's outcome instead of starting a new one.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidCredentials`] when the login or the handshake is rejected.
    /// - [`SessionError::ConnectionTimeout`] when no acknowledgement arrives in time.
    /// - [`SessionError::NotConnected`] when the worker stopped for another reason.
    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let observed = self.attempts.load(Ordering::Acquire);
        let _guard = self.connect_lock.lock().await;

        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        if self.attempts.load(Ordering::Acquire) != observed {
            if let Some(failure) = lock(&self.last_failure).clone() {
                debug!(event = "connect_collapsed", ?failure);
                return Err(failure.into());
            }
        }

        let result = self.establish().await;
        *lock(&self.last_failure) = result.as_ref().err().map(ConnectFailure::from);
        self.attempts.fetch_add(1, Ordering::Release);
        result
    }

    /// Queues one encoded frame for the socket. Does not wait for a reply.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] unless the state is `Connected`.
    pub fn send(&self, frame: &RequestFrame) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let text = frame.to_text()?;

        let worker = lock(&self.worker);
        let worker = worker.as_ref().ok_or(SessionError::NotConnected)?;
        worker
            .outbound
            .send(text)
            .map_err(|_| SessionError::NotConnected)?;
        debug!(event = "request_queued", id = frame.id, path = %frame.path);
        Ok(())
    }

    /// Stops the connection and waits for the receive loop to exit. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.stop(StopReason::Requested);
        if let Some(worker) = lock(&self.worker).as_ref() {
            worker.cancel.cancel();
        }

        // An in-flight connect may have spawned a fresh worker; stop that one too.
        let _guard = self.connect_lock.lock().await;
        self.shared.stop(StopReason::Requested);
        let worker = lock(&self.worker).take();

        if let Some(worker) = worker {
            worker.cancel.cancel();
            drop(worker.outbound);
            if let Err(err) = worker.task.await {
                warn!(event = "receive_loop_join_failed", error = %err);
            }
            info!(event = "disconnected");
        }
    }

    async fn establish(&self) -> Result<(), SessionError> {
        let loop_running = self.state() != ConnectionState::Stopped
            && lock(&self.worker)
                .as_ref()
                .is_some_and(|worker| !worker.task.is_finished());

        if loop_running {
            debug!(event = "connect_joins_reconnect_loop", state = ?self.state());
            self.shared.reconnect_now.notify_waiters();
        } else {
            self.reap_worker().await;
            let url = self.connection_url().await?;
            self.spawn_worker(url);
        }

        self.wait_until_connected().await
    }

    async fn connection_url(&self) -> Result<Url, SessionError> {
        match &self.connect_mode {
            ConnectMode::SessionToken(auth) => {
                let token = auth.login(&self.credentials).await?;
                debug!(event = "login_succeeded");
                Ok(token_url(&self.ws_url, &token)?)
            }
            ConnectMode::InlineCredentials => {
                Ok(inline_credentials_url(&self.ws_url, &self.credentials)?)
            }
        }
    }

    fn spawn_worker(&self, url: Url) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.shared.restart();
        let task = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            url,
            outbound_rx,
            cancel.clone(),
        ));

        *lock(&self.worker) = Some(Worker {
            outbound: outbound_tx,
            cancel,
            task,
        });
    }

    async fn reap_worker(&self) {
        let previous = lock(&self.worker).take();
        if let Some(worker) = previous {
            worker.cancel.cancel();
            if let Err(err) = worker.task.await {
                warn!(event = "receive_loop_join_failed", error = %err);
            }
        }
    }

    async fn wait_until_connected(&self) -> Result<(), SessionError> {
        let timeout = self.shared.handshake_timeout;
        let mut state_rx = self.shared.state.subscribe();

        let waited = with_timeout(timeout, async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Stopped => return Err(self.shared.stop_error()),
                    ConnectionState::Starting | ConnectionState::Disconnected => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::NotConnected);
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => {
                error!(event = "connection_ack_timeout", timeout_ms = timeout.as_millis() as u64);
                Err(SessionError::ConnectionTimeout(timeout))
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).as_ref() {
            worker.cancel.cancel();
        }
    }
}

enum SessionOutcome {
    Shutdown,
}

#[derive(Debug)]
enum LinkFailure {
    Transient(String),
    Fatal(StopReason),
}

async fn receive_loop(
    shared: Arc<Shared>,
    url: Url,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let endpoint = redacted(&url);
    let mut retry = RetryState::new(shared.reconnect.clone());
    let mut pending = VecDeque::new();

    while !cancel.is_cancelled() && shared.transition(ConnectionState::Starting) {
        info!(
            event = "ws_connecting",
            %endpoint,
            failed_attempts = retry.failed_attempts()
        );

        let result = run_connected_session(
            &shared,
            &url,
            &mut outbound_rx,
            &mut pending,
            &mut retry,
            &cancel,
        )
        .await;

        match result {
            Ok(SessionOutcome::Shutdown) => break,
            Err(LinkFailure::Fatal(reason)) => {
                error!(event = "ws_stopped", ?reason);
                shared.stop(reason);
                break;
            }
            Err(LinkFailure::Transient(detail)) => {
                if cancel.is_cancelled() {
                    break;
                }
                match retry.on_transient_failure() {
                    RetryDecision::GiveUp => {
                        error!(
                            event = "ws_retries_exhausted",
                            failed_attempts = retry.failed_attempts(),
                            error = %detail,
                            "too many retries to reconnect to server"
                        );
                        shared.stop(StopReason::RetriesExhausted(retry.failed_attempts()));
                        break;
                    }
                    RetryDecision::RetryAfter(delay) => {
                        // Registered before the transition so a connect() that
                        // observes Disconnected always reaches this waiter.
                        let wake = shared.reconnect_now.notified();
                        tokio::pin!(wake);
                        if !shared.transition(ConnectionState::Disconnected) {
                            break;
                        }
                        warn!(
                            event = "ws_reconnect_scheduled",
                            failed_attempts = retry.failed_attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %detail
                        );
                        if !wait_before_reconnect(
                            delay,
                            wake.as_mut(),
                            &cancel,
                            &mut outbound_rx,
                            &mut pending,
                        )
                        .await
                        {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!(event = "receive_loop_exit", state = ?shared.state());
}

async fn run_connected_session(
    shared: &Shared,
    url: &Url,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    pending: &mut VecDeque<String>,
    retry: &mut RetryState,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, LinkFailure> {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionOutcome::Shutdown),
        opened = connect_async(url.as_str()) => opened,
    };
    let (mut socket, _) = opened.map_err(classify_open_error)?;
    debug!(event = "ws_opened");

    let acknowledged = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = socket.close(None).await;
            return Ok(SessionOutcome::Shutdown);
        }
        ack = with_timeout(
            shared.handshake_timeout,
            recv_acknowledgement(&mut socket, &shared.dispatcher),
        ) => ack,
    };

    match acknowledged {
        Err(_) => {
            let _ = socket.close(None).await;
            return Err(LinkFailure::Transient(format!(
                "no connection acknowledgement within {:?}",
                shared.handshake_timeout
            )));
        }
        Ok(Err(failure)) => return Err(failure),
        Ok(Ok(ConnectionAck::InvalidCredentials)) => {
            let _ = socket.close(None).await;
            return Err(invalid_credentials());
        }
        Ok(Ok(ConnectionAck::Accepted)) => {}
    }

    retry.reset();
    if !shared.transition(ConnectionState::Connected) {
        let _ = socket.close(None).await;
        return Ok(SessionOutcome::Shutdown);
    }
    info!(event = "ws_connected");

    while let Some(next) = pending.pop_front() {
        if let Err(err) = socket.send(Message::Text(next.clone().into())).await {
            pending.push_front(next);
            return Err(LinkFailure::Transient(err.to_string()));
        }
    }

    let period = shared.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.close(None).await;
                return Ok(SessionOutcome::Shutdown);
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    warn!(event = "heartbeat_missed", interval_ms = period.as_millis() as u64);
                    return Err(LinkFailure::Transient(format!(
                        "no pong within heartbeat interval {period:?}"
                    )));
                }
                if let Err(err) = socket.send(Message::Ping(Vec::new())).await {
                    return Err(LinkFailure::Transient(err.to_string()));
                }
                awaiting_pong = true;
            }
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(err) = socket.send(Message::Text(text.clone().into())).await {
                            pending.push_front(text);
                            return Err(LinkFailure::Transient(err.to_string()));
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return Ok(SessionOutcome::Shutdown);
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        debug!(event = "ws_frame_received", bytes = text.len());
                        match shared.dispatcher.dispatch_text(&text) {
                            Some(ConnectionAck::InvalidCredentials) => {
                                let _ = socket.close(None).await;
                                return Err(invalid_credentials());
                            }
                            Some(ConnectionAck::Accepted) => {
                                debug!(event = "duplicate_connection_ack");
                            }
                            None => {}
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            return Err(LinkFailure::Transient(err.to_string()));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(frame))) => {
                        return Err(LinkFailure::Transient(format!(
                            "connection closed by server: {frame:?}"
                        )));
                    }
                    Some(Ok(_)) => {
                        warn!(event = "protocol_error", "dropping non-text websocket frame");
                    }
                    Some(Err(err)) => return Err(LinkFailure::Transient(err.to_string())),
                    None => {
                        return Err(LinkFailure::Transient("websocket stream ended".to_string()));
                    }
                }
            }
        }
    }
}

async fn recv_acknowledgement<S>(
    socket: &mut tokio_tungstenite::WebSocketStream<S>,
    dispatcher: &Dispatcher,
) -> Result<ConnectionAck, LinkFailure>
where
    tokio_tungstenite::WebSocketStream<S>: futures_util::Sink<Message, Error = WsError>
        + Stream<Item = Result<Message, WsError>>
        + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(ack) = dispatcher.dispatch_text(&text) {
                    return Ok(ack);
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| LinkFailure::Transient(err.to_string()))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(LinkFailure::Transient(
                    "socket closed before connection acknowledgement".to_string(),
                ));
            }
            Some(Ok(_)) => {
                warn!(event = "protocol_error", "dropping non-text frame before acknowledgement");
            }
            Some(Err(err)) => return Err(LinkFailure::Transient(err.to_string())),
            None => {
                return Err(LinkFailure::Transient(
                    "socket ended before connection acknowledgement".to_string(),
                ));
            }
        }
    }
}

async fn wait_before_reconnect(
    delay: Duration,
    mut wake: Pin<&mut Notified<'_>>,
    cancel: &CancellationToken,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    pending: &mut VecDeque<String>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = &mut sleep => return true,
            _ = wake.as_mut() => {
                debug!(event = "reconnect_requested");
                return true;
            }
            maybe_message = outbound_rx.recv() => {
                match maybe_message {
                    Some(message) => pending.push_back(message),
                    None => return false,
                }
            }
        }
    }
}

fn classify_open_error(err: WsError) -> LinkFailure {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                LinkFailure::Fatal(StopReason::InvalidCredentials(format!(
                    "websocket upgrade rejected with status {status}"
                )))
            } else {
                LinkFailure::Fatal(StopReason::Rejected(format!(
                    "websocket upgrade rejected with status {status}"
                )))
            }
        }
        WsError::Url(err) => {
            LinkFailure::Fatal(StopReason::Rejected(format!("invalid websocket url: {err}")))
        }
        WsError::HttpFormat(err) => {
            LinkFailure::Fatal(StopReason::Rejected(format!("malformed upgrade request: {err}")))
        }
        other => LinkFailure::Transient(other.to_string()),
    }
}

fn invalid_credentials() -> LinkFailure {
    LinkFailure::Fatal(StopReason::InvalidCredentials(
        "Invalid username/password.".to_string(),
    ))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{
        classify_open_error, wait_before_reconnect, ConnectionManager, ConnectionState,
        LinkFailure, StopReason,
    };
    use crate::config::{ClientConfig, ConnectMode, Credentials};
    use crate::error::SessionError;
    use crate::session::correlator::Correlator;
    use crate::session::dispatch::Dispatcher;
    use crate::session::events::EventRouter;
    use crate::session::proto::{Method, RequestFrame};

    fn manager() -> ConnectionManager {
        let config = ClientConfig::new(
            Credentials::new("toto@toto.com", SecretString::new("DUMMY_PASS".to_string())),
            ConnectMode::InlineCredentials,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Correlator::new(Duration::from_millis(10))),
            Arc::new(EventRouter::new()),
        ));
        ConnectionManager::new(&config, dispatcher)
    }

    #[test]
    fn fresh_manager_is_disconnected() {
        let manager = manager();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.is_disconnected());
        assert_eq!(manager.stop_reason(), None);
    }

    #[test]
    fn send_requires_connected_state() {
        let manager = manager();
        let frame = RequestFrame {
            method: Method::Get,
            path: "/user".to_string(),
            parameters: json!({}),
            id: 1,
        };
        assert!(matches!(manager.send(&frame), Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_twice_leaves_stopped() {
        let manager = manager();
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Stopped);
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Stopped);
        assert_eq!(manager.stop_reason(), Some(StopReason::Requested));
        assert!(manager.is_disconnected());
    }

    #[test]
    fn stopped_state_refuses_automatic_transitions() {
        let manager = manager();
        manager.shared.stop(StopReason::RetriesExhausted(5));
        assert!(!manager.shared.transition(ConnectionState::Starting));
        assert!(!manager.shared.transition(ConnectionState::Connected));
        assert_eq!(manager.state(), ConnectionState::Stopped);

        manager.shared.stop(StopReason::Requested);
        assert_eq!(manager.stop_reason(), Some(StopReason::RetriesExhausted(5)));
        assert!(matches!(manager.shared.stop_error(), SessionError::NotConnected));

        manager.shared.restart();
        assert_eq!(manager.state(), ConnectionState::Starting);
        assert_eq!(manager.stop_reason(), None);
    }

    #[tokio::test]
    async fn backoff_queues_outbound_frames_and_wakes_on_request() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut pending = VecDeque::new();

        let wake = manager.shared.reconnect_now.notified();
        tokio::pin!(wake);

        outbound_tx.send("first".to_string()).unwrap();
        outbound_tx.send("second".to_string()).unwrap();
        manager.shared.reconnect_now.notify_waiters();

        let resumed = tokio::time::timeout(
            Duration::from_secs(2),
            wait_before_reconnect(
                Duration::from_secs(60),
                wake.as_mut(),
                &cancel,
                &mut outbound_rx,
                &mut pending,
            ),
        )
        .await
        .expect("wake should end the backoff early");

        assert!(resumed);
        let queued: Vec<_> = pending.into_iter().collect();
        assert!(queued.len() <= 2);
        assert!(queued.iter().all(|frame| frame == "first" || frame == "second"));
    }

    #[tokio::test]
    async fn backoff_keeps_frames_until_the_delay_elapses() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let mut pending = VecDeque::new();
        let wake = manager.shared.reconnect_now.notified();
        tokio::pin!(wake);

        outbound_tx.send("queued".to_string()).unwrap();
        let resumed = wait_before_reconnect(
            Duration::from_millis(50),
            wake.as_mut(),
            &cancel,
            &mut outbound_rx,
            &mut pending,
        )
        .await;

        assert!(resumed);
        assert_eq!(pending, VecDeque::from(vec!["queued".to_string()]));
    }

    #[tokio::test]
    async fn backoff_ends_on_cancellation() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let (_outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let mut pending = VecDeque::new();
        let wake = manager.shared.reconnect_now.notified();
        tokio::pin!(wake);

        cancel.cancel();
        let resumed = wait_before_reconnect(
            Duration::from_secs(60),
            wake.as_mut(),
            &cancel,
            &mut outbound_rx,
            &mut pending,
        )
        .await;
        assert!(!resumed);
    }

    #[test]
    fn io_errors_are_transient_and_url_errors_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            classify_open_error(io.into()),
            LinkFailure::Transient(_)
        ));

        let url_error = tokio_tungstenite::tungstenite::error::UrlError::NoHostName;
        assert!(matches!(
            classify_open_error(url_error.into()),
            LinkFailure::Fatal(StopReason::Rejected(_))
        ));
    }
}
