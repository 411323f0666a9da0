//! Authenticated, multiplexed WS2P session over a WebSocket.
//!
//! Each [`Connection`] owns one background task driving the socket. That task
//! decodes frames, runs both halves of the handshake, matches responses to
//! pending requests and queues pushes for the application handler. Pushes are
//! handled one at a time in arrival order by a second task; incoming requests
//! are answered concurrently.
//!
//! Every protocol or authentication fault is counted. When the count reaches
//! [`ConnectionOptions::max_errors`] the socket is dropped without a closing
//! handshake.

use crate::auth::{LocalAuth, RemoteAuth};
use crate::error::{AuthError, ConnectionError, ErrorCause};
use crate::handler::MessageHandler;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use ws2p_wire::{
    HeadPayload, PushKind, PushMessage, Request, RequestBody, Response, WireError, WireMessage,
};

/// Errors tolerated before the socket is terminated
pub const MAXIMUM_ERRORS_COUNT: u32 = 5;
/// Default delay for a request to be answered
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default delay for the handshake to complete
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeouts and fault ceiling of a session
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Delay for the handshake to complete
    pub connection_timeout: Duration,
    /// Delay for a request to be answered
    pub request_timeout: Duration,
    /// Faults tolerated before terminating the socket
    pub max_errors: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connection_timeout: CONNECTION_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            max_errors: MAXIMUM_ERRORS_COUNT,
        }
    }
}

/// Per-session settings
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Timeouts and fault ceiling
    pub options: ConnectionOptions,
    /// Pin: the remote must present this key in CONNECT and ACK
    pub expected_pubkey: Option<String>,
    /// Instance id of the remote endpoint, when dialing a known endpoint
    pub instance_id: Option<String>,
    /// Dialed WebSocket URL (outbound sessions)
    pub address: Option<String>,
    /// Remote socket address
    pub peer_addr: Option<SocketAddr>,
}

/// Snapshot of session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Requests sent
    pub requests: u64,
    /// Responses received
    pub responses: u64,
    /// Pushes sent
    pub pushes_to_remote: u64,
    /// Pushes received
    pub pushes_by_remote: u64,
    /// Protocol and authentication faults
    pub errors: u32,
}

#[derive(Debug, Clone, PartialEq)]
enum AuthProgress {
    Pending,
    Done,
    Failed(AuthError),
}

#[derive(Debug, Clone)]
struct HandshakeState {
    /// We verified the remote ACK
    local: AuthProgress,
    /// The remote verified our OK
    remote: AuthProgress,
    remote_pubkey: Option<String>,
    closed: bool,
}

impl HandshakeState {
    fn outcome(&self) -> Option<Result<(), ConnectionError>> {
        if let AuthProgress::Failed(e) = &self.local {
            return Some(Err(e.clone().into()));
        }
        if let AuthProgress::Failed(e) = &self.remote {
            return Some(Err(e.clone().into()));
        }
        if self.local == AuthProgress::Done && self.remote == AuthProgress::Done {
            return Some(Ok(()));
        }
        if self.closed {
            return Some(Err(ConnectionError::Closed));
        }
        None
    }
}

enum Command {
    Send(String),
    StartHandshake,
    Close,
    Terminate,
}

type Exchange = oneshot::Sender<Result<Value, ConnectionError>>;

/// State shared by the handles and the socket task
#[derive(Default)]
struct Shared {
    exchanges: DashMap<String, Exchange>,
    requests: AtomicU64,
    responses: AtomicU64,
    pushes_to_remote: AtomicU64,
    pushes_by_remote: AtomicU64,
    errors: AtomicU32,
}

impl Shared {
    /// Count a fault; true when the ceiling is reached
    fn error_detected(&self, id: &str, cause: ErrorCause, max_errors: u32) -> bool {
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        error!("WS2P error on connection {} ({}/{}): {}", id, count, max_errors, cause);
        count >= max_errors
    }
}

struct Inner {
    id: String,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<HandshakeState>,
    connected: OnceCell<Result<(), ConnectionError>>,
}

/// Handle to a WS2P session.
///
/// Cloning is cheap. The socket task stops when the socket closes, when
/// [`Connection::close`] is called or when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("pubkey", &self.pubkey())
            .field("address", &self.inner.config.address)
            .finish()
    }
}

impl Connection {
    /// Wrap an open WebSocket into a session and start its socket task.
    ///
    /// Nothing is sent until [`Connection::connect`] is called, but incoming
    /// handshake messages are answered right away.
    pub fn new<S>(
        stream: WebSocketStream<S>,
        local_auth: Box<dyn LocalAuth>,
        remote_auth: Box<dyn RemoteAuth>,
        handler: Arc<dyn MessageHandler>,
        config: ConnectionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let shared = Arc::new(Shared::default());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (pushes_tx, pushes_rx) = mpsc::unbounded_channel();
        let initial = HandshakeState {
            local: progress(local_auth.is_remote_authenticated()),
            remote: progress(remote_auth.is_authenticated_by_remote()),
            remote_pubkey: remote_auth.remote_pubkey().map(str::to_string),
            closed: false,
        };
        let (state_tx, state_rx) = watch::channel(initial);

        let inner = Arc::new(Inner {
            id: id.clone(),
            config,
            shared: shared.clone(),
            commands: commands_tx,
            state: state_rx,
            connected: OnceCell::new(),
        });

        let driver = Driver {
            id,
            stream,
            commands: commands_rx,
            state: state_tx,
            shared,
            options: inner.config.options,
            expected_pubkey: inner.config.expected_pubkey.clone(),
            local_auth,
            remote_auth,
            handler: handler.clone(),
            pushes: pushes_tx,
            handle: Arc::downgrade(&inner),
        };
        tokio::spawn(driver.run());
        tokio::spawn(run_push_worker(
            pushes_rx,
            handler,
            Arc::downgrade(&inner),
        ));

        Self { inner }
    }

    /// Run the handshake and wait until both sides are authenticated.
    ///
    /// The first call sends our CONNECT; later calls return the same outcome.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner
            .connected
            .get_or_init(|| async {
                if self.inner.commands.send(Command::StartHandshake).is_err() {
                    return Err(ConnectionError::Closed);
                }
                let mut state = self.inner.state.clone();
                let wait = async move {
                    loop {
                        let outcome = state.borrow_and_update().outcome();
                        if let Some(outcome) = outcome {
                            return outcome;
                        }
                        if state.changed().await.is_err() {
                            return Err(ConnectionError::Closed);
                        }
                    }
                };
                match tokio::time::timeout(self.inner.config.options.connection_timeout, wait).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ConnectionError::ConnectionTimeout),
                }
            })
            .await
            .clone()
    }

    /// Send a request and wait for its answer.
    ///
    /// Waits for the handshake first. A request unanswered within the request
    /// timeout fails and counts as a fault; its late answer, if any, is then
    /// treated as an answer to an unknown request.
    pub async fn request(&self, body: RequestBody) -> Result<Value, ConnectionError> {
        self.connect().await?;
        let req_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.shared.exchanges.insert(req_id.clone(), tx);
        self.inner.shared.requests.fetch_add(1, Ordering::Relaxed);

        let message = WireMessage::Request(Request {
            req_id: req_id.clone(),
            body,
        });
        if let Err(e) = self.send(&message) {
            self.inner.shared.exchanges.remove(&req_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.options.request_timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.inner.shared.exchanges.remove(&req_id);
                self.error_detected(ErrorCause::RequestTimeout);
                Err(ConnectionError::RequestTimeout)
            }
        }
    }

    /// Push a document to the remote once the handshake is done
    pub async fn push(&self, push: PushMessage) -> Result<(), ConnectionError> {
        self.connect().await?;
        self.inner
            .shared
            .pushes_to_remote
            .fetch_add(1, Ordering::Relaxed);
        self.send(&WireMessage::Push(push))
    }

    /// Push a block
    pub async fn push_block(&self, block: Value) -> Result<(), ConnectionError> {
        self.push(PushMessage::new(PushKind::Block, block)).await
    }

    /// Push an identity
    pub async fn push_identity(&self, identity: Value) -> Result<(), ConnectionError> {
        self.push(PushMessage::new(PushKind::Identity, identity)).await
    }

    /// Push a certification
    pub async fn push_certification(&self, cert: Value) -> Result<(), ConnectionError> {
        self.push(PushMessage::new(PushKind::Certification, cert)).await
    }

    /// Push a membership
    pub async fn push_membership(&self, membership: Value) -> Result<(), ConnectionError> {
        self.push(PushMessage::new(PushKind::Membership, membership)).await
    }

    /// Push a transaction
    pub async fn push_transaction(&self, tx: Value) -> Result<(), ConnectionError> {
        self.push(PushMessage::new(PushKind::Transaction, tx)).await
    }

    /// Push a peer document
    pub async fn push_peer(&self, peer: Value) -> Result<(), ConnectionError> {
        self.push(PushMessage::new(PushKind::Peer, peer)).await
    }

    /// Push a batch of heads
    pub async fn push_heads(&self, heads: &[HeadPayload]) -> Result<(), ConnectionError> {
        self.push(PushMessage::heads(heads)).await
    }

    /// Close gracefully and wait for the socket task to stop
    pub async fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
        self.closed().await;
    }

    /// Drop the socket without a closing handshake
    pub fn terminate(&self) {
        let _ = self.inner.commands.send(Command::Terminate);
    }

    /// Resolve once the socket task has stopped
    pub async fn closed(&self) {
        let mut state = self.inner.state.clone();
        loop {
            let closed = state.borrow_and_update().closed;
            if closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// True once the socket task has stopped
    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// True once both sides are authenticated
    pub fn is_connected(&self) -> bool {
        matches!(self.inner.state.borrow().outcome(), Some(Ok(())))
    }

    /// Local identifier of this session
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Key the remote authenticated with
    pub fn pubkey(&self) -> Option<String> {
        self.inner.state.borrow().remote_pubkey.clone()
    }

    /// Instance id of the remote endpoint, when known
    pub fn instance_id(&self) -> Option<&str> {
        self.inner.config.instance_id.as_deref()
    }

    /// Dialed URL for outbound sessions
    pub fn address(&self) -> Option<&str> {
        self.inner.config.address.as_deref()
    }

    /// Remote socket address
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.config.peer_addr
    }

    /// Current counters
    pub fn stats(&self) -> ConnectionStats {
        let shared = &self.inner.shared;
        ConnectionStats {
            requests: shared.requests.load(Ordering::Relaxed),
            responses: shared.responses.load(Ordering::Relaxed),
            pushes_to_remote: shared.pushes_to_remote.load(Ordering::Relaxed),
            pushes_by_remote: shared.pushes_by_remote.load(Ordering::Relaxed),
            errors: shared.errors.load(Ordering::SeqCst),
        }
    }

    /// Number of requests still waiting for an answer
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.exchanges.len()
    }

    /// True when both handles point to the same session
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn send(&self, message: &WireMessage) -> Result<(), ConnectionError> {
        self.inner
            .commands
            .send(Command::Send(message.encode()))
            .map_err(|_| ConnectionError::Closed)
    }

    fn error_detected(&self, cause: ErrorCause) {
        if self.inner.shared.error_detected(
            &self.inner.id,
            cause,
            self.inner.config.options.max_errors,
        ) {
            self.terminate();
        }
    }
}

fn progress(done: bool) -> AuthProgress {
    if done {
        AuthProgress::Done
    } else {
        AuthProgress::Pending
    }
}

async fn run_push_worker(
    mut pushes: mpsc::UnboundedReceiver<PushMessage>,
    handler: Arc<dyn MessageHandler>,
    handle: Weak<Inner>,
) {
    while let Some(push) = pushes.recv().await {
        let Some(inner) = handle.upgrade() else {
            break;
        };
        let connection = Connection { inner };
        let kind = push.kind;
        if let Err(e) = handler.handle_push(push, &connection).await {
            warn!(
                "Push handler failed for {} from connection {}: {:#}",
                kind,
                connection.id(),
                e
            );
        }
    }
}

/// Socket task of a session
struct Driver<S> {
    id: String,
    stream: WebSocketStream<S>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<HandshakeState>,
    shared: Arc<Shared>,
    options: ConnectionOptions,
    expected_pubkey: Option<String>,
    local_auth: Box<dyn LocalAuth>,
    remote_auth: Box<dyn RemoteAuth>,
    handler: Arc<dyn MessageHandler>,
    pushes: mpsc::UnboundedSender<PushMessage>,
    handle: Weak<Inner>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        debug!("Connection {} started", self.id);
        loop {
            tokio::select! {
                frame = self.stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if !self.on_text(&text).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            if self.error_detected(ErrorCause::MessageMustBeAnObject) {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Connection {} closed by remote", self.id);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("Connection {} read error: {}", self.id, e);
                            break;
                        }
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Send(text)) => {
                            if let Err(e) = self.stream.send(Message::Text(text)).await {
                                warn!("Connection {} write error: {}", self.id, e);
                                break;
                            }
                        }
                        Some(Command::StartHandshake) => {
                            if let Some(connect) = self.local_auth.connect_message() {
                                if !self.write(&connect).await {
                                    break;
                                }
                            }
                        }
                        Some(Command::Close) => {
                            let _ = self.stream.close(None).await;
                            break;
                        }
                        Some(Command::Terminate) => {
                            info!("Connection {} terminated", self.id);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        self.shutdown();
    }

    /// Process one text frame; false when the socket must be dropped
    async fn on_text(&mut self, text: &str) -> bool {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Connection {} got undecodable frame: {}", self.id, e);
                let cause = match e {
                    WireError::ConnectFields => ErrorCause::AuthInvalidAskFields,
                    WireError::AckFields => ErrorCause::AuthInvalidAckFields,
                    WireError::OkFields => ErrorCause::AuthInvalidOkFields,
                    WireError::UnknownAuth(_) => ErrorCause::UnknownAuthMessage,
                    _ => ErrorCause::MessageMustBeAnObject,
                };
                return !self.error_detected(cause);
            }
        };

        let keep = match message {
            WireMessage::Connect(connect) => self.on_connect(connect).await,
            WireMessage::Ack(ack) => self.on_ack(ack).await,
            WireMessage::Ok(ok) => self.on_ok(ok),
            other => self.on_application(other),
        };
        self.publish_state();
        keep
    }

    async fn on_connect(&mut self, connect: ws2p_wire::Connect) -> bool {
        if self.remote_auth.is_authenticated_by_remote() {
            return !self.error_detected(ErrorCause::AlreadyAuthenticatedByRemote);
        }
        if let Some(expected) = self.pinned_mismatch(&connect.pubkey) {
            self.fail_remote(AuthError::IncorrectPubkey {
                expected,
                got: connect.pubkey,
            });
            return !self.error_detected(ErrorCause::IncorrectPubkeyForRemote);
        }
        match self.remote_auth.register_connect(&connect).await {
            Ok(()) => match self.remote_auth.ack_message() {
                Some(ack) => self.write(&ack).await,
                None => true,
            },
            Err(e) => {
                self.fail_remote(e);
                !self.error_detected(ErrorCause::RejectedPubkeyOrIncorrectAskSignature)
            }
        }
    }

    async fn on_ack(&mut self, ack: ws2p_wire::Ack) -> bool {
        if self.local_auth.is_remote_authenticated() {
            return !self.error_detected(ErrorCause::AlreadyAuthenticatedRemote);
        }
        if let Some(expected) = self.pinned_mismatch(&ack.pubkey) {
            self.fail_local(AuthError::IncorrectPubkey {
                expected,
                got: ack.pubkey,
            });
            return !self.error_detected(ErrorCause::IncorrectPubkeyForRemote);
        }
        match self.local_auth.register_ack(&ack).await {
            Ok(()) => match self.local_auth.ok_message() {
                Some(ok) => self.write(&ok).await,
                None => true,
            },
            Err(e) => {
                let cause = match e {
                    AuthError::WrongAckSignature => ErrorCause::IncorrectAckSignature,
                    _ => ErrorCause::RejectedAckPubkey,
                };
                let terminate = self.error_detected(cause);
                self.fail_local(e);
                !terminate
            }
        }
    }

    fn on_ok(&mut self, ok: ws2p_wire::AuthOk) -> bool {
        if self.remote_auth.is_authenticated_by_remote() {
            return !self.error_detected(ErrorCause::AlreadyAuthenticatedAndConfirmedByRemote);
        }
        match self.remote_auth.register_ok(&ok) {
            Ok(()) => true,
            Err(e) => {
                self.fail_remote(e);
                !self.error_detected(ErrorCause::IncorrectOkSignature)
            }
        }
    }

    fn on_application(&mut self, message: WireMessage) -> bool {
        if !self.local_auth.is_remote_authenticated() {
            return !self.error_detected(ErrorCause::MustBeAuthenticatedFirst);
        }
        match message {
            WireMessage::Request(request) => {
                let Some(inner) = self.handle.upgrade() else {
                    return false;
                };
                let connection = Connection { inner };
                let handler = self.handler.clone();
                tokio::spawn(async move {
                    let outcome = match handler.answer_to_request(request.body, &connection).await {
                        Ok(answer) => Ok(answer),
                        Err(e) => {
                            debug!("Request {} failed: {:#}", request.req_id, e);
                            Err(Value::String(e.to_string()))
                        }
                    };
                    let response = WireMessage::Response(Response {
                        res_id: request.req_id,
                        outcome,
                    });
                    let _ = connection.send(&response);
                });
                true
            }
            WireMessage::Response(response) => {
                self.shared.responses.fetch_add(1, Ordering::Relaxed);
                let Some((_, exchange)) = self.shared.exchanges.remove(&response.res_id) else {
                    return !self.error_detected(ErrorCause::AnswerToUndefinedRequest);
                };
                match response.outcome {
                    Ok(body) => {
                        let _ = exchange.send(Ok(body));
                        true
                    }
                    Err(err) => {
                        let reason = err
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| err.to_string());
                        let terminate = self.error_detected(ErrorCause::RequestFailed);
                        let _ = exchange.send(Err(ConnectionError::RequestFailed(reason)));
                        !terminate
                    }
                }
            }
            WireMessage::Push(push) => {
                self.shared.pushes_by_remote.fetch_add(1, Ordering::Relaxed);
                let _ = self.pushes.send(push);
                true
            }
            _ => true,
        }
    }

    fn pinned_mismatch(&self, pubkey: &str) -> Option<String> {
        self.expected_pubkey
            .as_ref()
            .filter(|expected| !expected.is_empty() && expected.as_str() != pubkey)
            .cloned()
    }

    fn fail_local(&mut self, e: AuthError) {
        warn!("Connection {}: remote authentication failed: {}", self.id, e);
        self.state.send_modify(|s| s.local = AuthProgress::Failed(e));
    }

    fn fail_remote(&mut self, e: AuthError) {
        warn!("Connection {}: remote handshake refused: {}", self.id, e);
        self.state.send_modify(|s| s.remote = AuthProgress::Failed(e));
    }

    fn publish_state(&mut self) {
        let local_done = self.local_auth.is_remote_authenticated();
        let remote_done = self.remote_auth.is_authenticated_by_remote();
        let remote_pubkey = self.remote_auth.remote_pubkey().map(str::to_string);
        self.state.send_if_modified(|s| {
            let mut changed = false;
            if local_done && s.local == AuthProgress::Pending {
                s.local = AuthProgress::Done;
                changed = true;
            }
            if remote_done && s.remote == AuthProgress::Pending {
                s.remote = AuthProgress::Done;
                changed = true;
            }
            if s.remote_pubkey != remote_pubkey && remote_pubkey.is_some() {
                s.remote_pubkey = remote_pubkey;
                changed = true;
            }
            changed
        });
    }

    async fn write(&mut self, message: &WireMessage) -> bool {
        match self.stream.send(Message::Text(message.encode())).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Connection {} write error: {}", self.id, e);
                false
            }
        }
    }

    fn error_detected(&self, cause: ErrorCause) -> bool {
        self.shared
            .error_detected(&self.id, cause, self.options.max_errors)
    }

    fn shutdown(&mut self) {
        let pending: Vec<String> = self
            .shared
            .exchanges
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for req_id in pending {
            if let Some((_, exchange)) = self.shared.exchanges.remove(&req_id) {
                let _ = exchange.send(Err(ConnectionError::Closed));
            }
        }
        self.state.send_modify(|s| s.closed = true);
        debug!("Connection {} stopped", self.id);
    }
}
