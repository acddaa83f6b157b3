//! `HTTP2Transport` (spec component C3): the per-connection state machine
//! that owns the downchannel, the outbound message queue, the idle-ping
//! cadence, and the reconnect backoff ladder.
//!
//! Per the single-task design sanctioned by the coroutine note in spec
//! section 9, there is no dedicated OS thread here: the whole state machine
//! is one task (spawned through [`Exec`]) that `select!`s over commands,
//! handler-reported events, and timers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Request};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, trace, warn};

use crate::attachment::AttachmentManager;
use crate::auth::AuthDelegate;
use crate::common::exec::Exec;
use crate::common::retry::{RetryTable, TRANSPORT_RETRY_TABLE_MS};
use crate::common::time::Time;
use crate::handler::{
    DownchannelHandler, ExchangeHandler, ExchangeHandlerCallbacks, FinishReason, MessageRequestHandler, PingHandler,
};
use crate::message::{ChangedReason, ConnectionStatus, ConnectionStatusObserver, ConnectionStatusUpdate, MessageObserver, MessageRequest};
use crate::postconnect::{PostConnectFactory, PostConnectSequencer, PostConnectSequencerObserver};

/// Any I/O object the transport can speak HTTP/2 over. TLS, if any, has
/// already been negotiated by the caller's [`ConnectionFactory`].
pub(crate) trait HttpIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> HttpIo for T {}

/// Supplies a fresh, connected transport-layer stream on demand. The
/// seam named `HTTP2ConnectionFactory` in spec section 6.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> Pin<Box<dyn Future<Output = crate::Result<Box<dyn HttpIo>>> + Send>>;
}

/// Literal constants and per-instance knobs for one [`Transport`], per spec
/// section 4.3.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub endpoint: String,
    pub downchannel_path: String,
    pub events_path: String,
    pub ping_path: String,
    pub idle_ping_threshold: Duration,
    pub ping_timeout: Duration,
    pub message_activity_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            endpoint: String::new(),
            downchannel_path: "/v20160207/directives".to_owned(),
            events_path: "/v20160207/events".to_owned(),
            ping_path: "/ping".to_owned(),
            idle_ping_threshold: Duration::from_secs(5 * 60),
            ping_timeout: Duration::from_secs(30),
            message_activity_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Connecting,
    WaitingToRetryConnect,
    WaitingPostConnect,
    Connected,
    ServerSideDisconnectOrderly,
    Disconnecting,
    Disconnected,
    Shutdown,
}

enum Command {
    Connect,
    Send(MessageRequest),
    Disconnect(ChangedReason),
    RetryNow,
    VerifyConnectivity,
    Shutdown(oneshot::Sender<()>),
}

/// What a handler reported back to the owning transport. Tagged with an
/// opaque exchange id so the run loop can tell which in-flight handler an
/// event belongs to without handlers ever touching transport state
/// directly (see spec section 9's note on removing self-referential
/// handler ownership).
enum HandlerEvent {
    DownchannelConnected,
    DownchannelFinished(FinishReason),
    AuthFailure(String),
    MessageAcknowledged(u64),
    MessageFinished(u64),
    PingAcknowledged(bool),
    PingTimeout,
}

struct EventSink {
    id: u64,
    tx: mpsc::UnboundedSender<HandlerEvent>,
}

impl ExchangeHandlerCallbacks for EventSink {
    fn downchannel_connected(&self) {
        let _ = self.tx.send(HandlerEvent::DownchannelConnected);
    }
    fn downchannel_finished(&self, reason: FinishReason) {
        let _ = self.tx.send(HandlerEvent::DownchannelFinished(reason));
    }
    fn auth_failure(&self, token: &str) {
        let _ = self.tx.send(HandlerEvent::AuthFailure(token.to_owned()));
    }
    fn message_acknowledged(&self) {
        let _ = self.tx.send(HandlerEvent::MessageAcknowledged(self.id));
    }
    fn message_finished(&self) {
        let _ = self.tx.send(HandlerEvent::MessageFinished(self.id));
    }
    fn ping_acknowledged(&self, success: bool) {
        let _ = self.tx.send(HandlerEvent::PingAcknowledged(success));
    }
    fn ping_timeout(&self) {
        let _ = self.tx.send(HandlerEvent::PingTimeout);
    }
}

/// A handle a [`crate::router::MessageRouter`] holds to one transport
/// instance; the transport itself runs inside a spawned task.
pub(crate) struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
}

impl crate::message::MessageSender for TransportHandle {
    fn send(&self, request: MessageRequest) {
        TransportHandle::send(self, request);
    }
}

impl TransportHandle {
    pub(crate) fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub(crate) fn send(&self, request: MessageRequest) {
        let _ = self.commands.send(Command::Send(request));
    }

    pub(crate) fn disconnect(&self, reason: ChangedReason) {
        let _ = self.commands.send(Command::Disconnect(reason));
    }

    pub(crate) fn request_retry_wake(&self) {
        let _ = self.commands.send(Command::RetryNow);
    }

    /// Ask an already-connected transport to probe liveness immediately,
    /// rather than waiting for the idle-ping threshold (used when an
    /// internet-connectivity monitor reports the link just dropped).
    pub(crate) fn verify_connectivity(&self) {
        let _ = self.commands.send(Command::VerifyConnectivity);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Synchronous from the caller's perspective: signals the network task
    /// and waits for it to acknowledge before returning, satisfying
    /// testable property 7.
    pub(crate) async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Collaborators {
    connection_factory: Arc<dyn ConnectionFactory>,
    auth: Arc<dyn AuthDelegate>,
    attachment_manager: Arc<dyn AttachmentManager>,
    consumer: Arc<dyn MessageObserver>,
    post_connect_factory: Arc<dyn PostConnectFactory>,
    observer: Arc<dyn ConnectionStatusObserver>,
}

/// Runs the state machine described in spec section 4.3.
struct Transport {
    config: TransportConfig,
    collaborators: Collaborators,
    exec: Exec,
    time: Time,
    commands: mpsc::UnboundedReceiver<Command>,
    self_commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<HandlerEvent>,
    events_rx: mpsc::UnboundedReceiver<HandlerEvent>,
    connected_flag: Arc<AtomicBool>,

    state: State,
    attempt: u32,
    retry_table: RetryTable,
    queue: std::collections::VecDeque<MessageRequest>,
    inflight_messages: HashMap<u64, bool>,
    next_message_id: u64,
    last_activity: std::time::Instant,
    ping_in_flight: bool,
    last_status: Option<ConnectionStatusUpdate>,
    disconnect_reason: ChangedReason,
    post_connect: Option<PostConnectSequencer>,
    post_connect_result: Option<oneshot::Receiver<bool>>,
    send_request: Option<h2::client::SendRequest<Bytes>>,

    /// Cancellation for every task spawned against the current connection
    /// (the h2 connection driver, the downchannel/ping/message-request
    /// exchanges): set on a successful handshake, fired on disconnect so
    /// that no in-flight task keeps driving network I/O past the point
    /// `do_disconnect` returns.
    conn_cancel_tx: Option<watch::Sender<bool>>,
    conn_cancel_rx: Option<watch::Receiver<bool>>,
    /// Count of tasks spawned via `spawn_tracked` that have not yet
    /// observed cancellation or finished; `do_disconnect` waits for this
    /// to reach zero before declaring the transport quiesced.
    inflight_tasks: Arc<AtomicUsize>,
    tasks_idle: Arc<Notify>,
    /// Set by any `Command::Shutdown`; acknowledged only once
    /// `do_disconnect` has actually cancelled and awaited every in-flight
    /// task, so the caller's `shutdown().await` truly means no further
    /// network I/O will be initiated.
    pending_shutdown: Option<oneshot::Sender<()>>,
}

pub(crate) fn spawn(
    config: TransportConfig,
    connection_factory: Arc<dyn ConnectionFactory>,
    auth: Arc<dyn AuthDelegate>,
    attachment_manager: Arc<dyn AttachmentManager>,
    consumer: Arc<dyn MessageObserver>,
    post_connect_factory: Arc<dyn PostConnectFactory>,
    observer: Arc<dyn ConnectionStatusObserver>,
    exec: Exec,
    time: Time,
) -> TransportHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let connected_flag = Arc::new(AtomicBool::new(false));

    let transport = Transport {
        config,
        collaborators: Collaborators {
            connection_factory,
            auth,
            attachment_manager,
            consumer,
            post_connect_factory,
            observer,
        },
        exec: exec.clone(),
        time,
        commands: cmd_rx,
        self_commands: cmd_tx.clone(),
        events: ev_tx,
        events_rx: ev_rx,
        connected_flag: connected_flag.clone(),
        state: State::Init,
        attempt: 0,
        retry_table: RetryTable::new(TRANSPORT_RETRY_TABLE_MS),
        queue: std::collections::VecDeque::new(),
        inflight_messages: HashMap::new(),
        next_message_id: 0,
        last_activity: std::time::Instant::now(),
        ping_in_flight: false,
        last_status: None,
        disconnect_reason: ChangedReason::None,
        post_connect: None,
        post_connect_result: None,
        send_request: None,
        conn_cancel_tx: None,
        conn_cancel_rx: None,
        inflight_tasks: Arc::new(AtomicUsize::new(0)),
        tasks_idle: Arc::new(Notify::new()),
        pending_shutdown: None,
    };

    exec.execute(transport.run());

    TransportHandle {
        commands: cmd_tx,
        connected: connected_flag,
    }
}

impl Transport {
    async fn run(mut self) {
        loop {
            match self.state {
                State::Init => {
                    if !self.wait_for_connect().await {
                        return;
                    }
                }
                State::Connecting => self.do_connect().await,
                State::WaitingToRetryConnect => self.wait_to_retry().await,
                State::WaitingPostConnect => self.wait_post_connect().await,
                State::Connected => self.run_connected().await,
                State::ServerSideDisconnectOrderly => self.drain_server_disconnect().await,
                State::Disconnecting => self.do_disconnect().await,
                State::Disconnected => {
                    self.notify_status(ConnectionStatus::Disconnected, self.disconnect_reason);
                    if !self.wait_after_disconnected().await {
                        return;
                    }
                }
                State::Shutdown => return,
            }
        }
    }

    /// Run `fut` on the executor, racing it against the current
    /// connection's cancellation signal so that `do_disconnect` can
    /// actually stop it rather than merely dropping a handle to it.
    /// Tracked so `do_disconnect` can wait for every such task to
    /// finish before the transport calls itself quiesced.
    fn spawn_tracked<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let counter = self.inflight_tasks.clone();
        let idle = self.tasks_idle.clone();
        let mut cancel_rx = self.conn_cancel_rx.clone();
        counter.fetch_add(1, Ordering::SeqCst);
        self.exec.execute(async move {
            match cancel_rx.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = fut => {}
                        _ = rx.changed() => {}
                    }
                }
                None => fut.await,
            }
            if counter.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_one();
            }
        });
    }

    fn notify_status(&mut self, status: ConnectionStatus, reason: ChangedReason) {
        let update = ConnectionStatusUpdate { status, reason };
        if self.last_status == Some(update) {
            return;
        }
        self.last_status = Some(update);
        self.connected_flag.store(status == ConnectionStatus::Connected, Ordering::Release);
        self.collaborators.observer.on_status_changed(update);
    }

    async fn wait_for_connect(&mut self) -> bool {
        match self.commands.recv().await {
            Some(Command::Connect) => {
                self.state = State::Connecting;
                self.notify_status(ConnectionStatus::Pending, ChangedReason::AclClientRequest);
                true
            }
            Some(Command::Shutdown(ack)) => {
                self.pending_shutdown = Some(ack);
                self.disconnect_reason = ChangedReason::AclClientRequest;
                self.state = State::Disconnecting;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    async fn token_or_disconnect(&mut self) -> Option<String> {
        let token = self.collaborators.auth.token().await;
        if token.is_empty() {
            self.disconnect_reason = ChangedReason::InvalidAuth;
            self.state = State::Disconnecting;
            None
        } else {
            Some(token)
        }
    }

    async fn do_connect(&mut self) {
        trace!(attempt = self.attempt, "connecting");
        let token = match self.token_or_disconnect().await {
            Some(t) => t,
            None => return,
        };

        let io = match self.collaborators.connection_factory.connect().await {
            Ok(io) => io,
            Err(err) => {
                debug!(%err, "connect failed");
                self.attempt += 1;
                self.state = State::WaitingToRetryConnect;
                return;
            }
        };

        let handshake = h2::client::handshake(io).await;
        let (mut send_request, connection) = match handshake {
            Ok(pair) => pair,
            Err(err) => {
                debug!(%err, "h2 handshake failed");
                self.attempt += 1;
                self.state = State::WaitingToRetryConnect;
                return;
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.conn_cancel_tx = Some(cancel_tx);
        self.conn_cancel_rx = Some(cancel_rx);

        self.spawn_tracked(async move {
            if let Err(err) = connection.await {
                debug!(%err, "h2 connection driver ended");
            }
        });

        if send_request.ready().await.is_err() {
            self.attempt += 1;
            self.state = State::WaitingToRetryConnect;
            return;
        }

        self.send_request = Some(send_request);

        let uri = format!("{}{}", self.config.endpoint, self.config.downchannel_path);
        let request = match Request::get(uri).header(http::header::AUTHORIZATION, bearer(&token)).body(()) {
            Ok(r) => r,
            Err(_) => {
                self.attempt += 1;
                self.state = State::WaitingToRetryConnect;
                return;
            }
        };

        let callbacks: Arc<dyn ExchangeHandlerCallbacks> = Arc::new(EventSink {
            id: 0,
            tx: self.events.clone(),
        });
        let handler = DownchannelHandler::new(
            callbacks,
            self.collaborators.consumer.clone(),
            self.collaborators.attachment_manager.clone(),
            "downchannel",
            token,
        );

        self.drive_request_response(request, Box::new(handler));

        // The downchannel-response-code=200 transition to WAITING_POST_CONNECT
        // happens when the HandlerEvent::DownchannelConnected arrives, handled
        // uniformly by run_connected-style event processing below.
        self.pump_until_downchannel_settled().await;
    }

    /// Spawn the task that actually drives one HTTP/2 exchange: send the
    /// request, feed the handler response code + body chunks, report how it
    /// finished.
    fn drive_request_response(&mut self, request: Request<()>, mut handler: Box<dyn ExchangeHandler>) {
        let send_request = match self.send_request.clone() {
            Some(sr) => sr,
            None => return,
        };
        self.spawn_tracked(async move {
            drive_exchange(send_request, request, &mut *handler).await;
        });
    }

    /// Block until the downchannel either connects (200), fails, or the
    /// state machine is told to give up, consuming handler events as they
    /// arrive. Mirrors the CONNECTING → WAITING_POST_CONNECT transition.
    async fn pump_until_downchannel_settled(&mut self) {
        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(HandlerEvent::DownchannelConnected) => {
                            self.attempt = 0;
                            self.start_post_connect();
                            return;
                        }
                        Some(HandlerEvent::DownchannelFinished(_)) | None => {
                            self.attempt += 1;
                            self.state = State::WaitingToRetryConnect;
                            return;
                        }
                        Some(HandlerEvent::AuthFailure(token)) => {
                            self.collaborators.auth.on_auth_failure(&token);
                        }
                        _ => {}
                    }
                }
                cmd = self.commands.recv() => {
                    if self.handle_command_while_connecting(cmd) {
                        return;
                    }
                }
            }
        }
    }

    fn handle_command_while_connecting(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Disconnect(reason)) => {
                self.disconnect_reason = reason;
                self.state = State::Disconnecting;
                true
            }
            Some(Command::Shutdown(ack)) => {
                self.pending_shutdown = Some(ack);
                self.disconnect_reason = ChangedReason::AclClientRequest;
                self.state = State::Disconnecting;
                true
            }
            Some(Command::Send(request)) => {
                self.queue.push_back(request);
                false
            }
            Some(Command::Connect) | Some(Command::RetryNow) | Some(Command::VerifyConnectivity) | None => false,
        }
    }

    fn start_post_connect(&mut self) {
        self.state = State::WaitingPostConnect;
        let operations = self.collaborators.post_connect_factory.create();
        let sequencer = PostConnectSequencer::new(operations, self.exec.clone());
        let (tx, rx) = oneshot::channel();
        sequencer.do_post_connect(self.message_sender(), PostConnectOneshotObserver(Some(tx)));
        self.post_connect = Some(sequencer);
        self.post_connect_result = Some(rx);
    }

    fn message_sender(&self) -> Arc<dyn crate::message::MessageSender> {
        // Post-connect operations send through the same admission path as
        // user requests once CONNECTED; before that they are exempted from
        // the at-most-one-outstanding rule (only one post-connect op runs
        // at a time by construction).
        Arc::new(self.handle_for_self())
    }

    fn handle_for_self(&self) -> TransportHandle {
        TransportHandle {
            commands: self.self_commands.clone(),
            connected: self.connected_flag.clone(),
        }
    }

    async fn wait_to_retry(&mut self) {
        let delay = self.retry_table.delay_for_attempt(self.attempt.max(1));
        let sleep = self.time.sleep(delay);
        tokio::select! {
            _ = sleep => {
                self.state = State::Connecting;
            }
            cmd = self.commands.recv() => {
                if !self.handle_command_while_connecting(cmd) {
                    self.state = State::Connecting;
                }
            }
        }
    }

    async fn wait_post_connect(&mut self) {
        self.maybe_admit_next_message();
        if self.post_connect_result.is_none() {
            self.disconnect_reason = ChangedReason::InternalError;
            self.state = State::Disconnecting;
            return;
        }
        tokio::select! {
            result = self.post_connect_result.as_mut().unwrap() => {
                self.post_connect_result = None;
                match result {
                    Ok(true) => {
                        self.last_activity = self.time.now();
                        self.notify_status(ConnectionStatus::Connected, ChangedReason::AclClientRequest);
                        self.state = State::Connected;
                    }
                    _ => {
                        self.disconnect_reason = ChangedReason::InternalError;
                        self.state = State::Disconnecting;
                    }
                }
            }
            event = self.events_rx.recv() => {
                if let Some(HandlerEvent::DownchannelFinished(_)) = event {
                    self.disconnect_reason = ChangedReason::InternalError;
                    self.state = State::Disconnecting;
                }
            }
            cmd = self.commands.recv() => {
                let _ = self.handle_command_while_connecting(cmd);
            }
        }
    }

    async fn run_connected(&mut self) {
        self.maybe_admit_next_message();

        let idle_deadline = self.last_activity + self.config.idle_ping_threshold;
        let idle_sleep = self.time.sleep(idle_deadline.saturating_duration_since(self.time.now()));

        tokio::select! {
            _ = idle_sleep => {
                if !self.ping_in_flight {
                    self.create_ping_handler().await;
                }
            }
            event = self.events_rx.recv() => self.handle_connected_event(event),
            cmd = self.commands.recv() => {
                if let Some(Command::VerifyConnectivity) = cmd {
                    if !self.ping_in_flight {
                        self.create_ping_handler().await;
                    }
                } else {
                    self.handle_connected_command(cmd);
                }
            }
        }
    }

    fn handle_connected_event(&mut self, event: Option<HandlerEvent>) {
        match event {
            Some(HandlerEvent::DownchannelFinished(_)) => {
                self.state = State::ServerSideDisconnectOrderly;
                self.notify_status(ConnectionStatus::Pending, ChangedReason::ServerSideDisconnect);
            }
            Some(HandlerEvent::AuthFailure(token)) => {
                self.collaborators.auth.on_auth_failure(&token);
            }
            Some(HandlerEvent::MessageAcknowledged(id)) => {
                self.inflight_messages.insert(id, true);
                self.last_activity = self.time.now();
            }
            Some(HandlerEvent::MessageFinished(id)) => {
                self.inflight_messages.remove(&id);
                self.last_activity = self.time.now();
            }
            Some(HandlerEvent::PingAcknowledged(success)) => {
                self.ping_in_flight = false;
                self.last_activity = self.time.now();
                if !success {
                    self.disconnect_reason = ChangedReason::PingTimedOut;
                    self.state = State::Disconnecting;
                }
            }
            Some(HandlerEvent::PingTimeout) => {
                self.ping_in_flight = false;
                self.disconnect_reason = ChangedReason::PingTimedOut;
                self.state = State::Disconnecting;
            }
            Some(HandlerEvent::DownchannelConnected) | None => {}
        }
    }

    fn handle_connected_command(&mut self, cmd: Option<Command>) {
        match cmd {
            Some(Command::Send(request)) => {
                self.queue.push_back(request);
            }
            Some(Command::Disconnect(reason)) => {
                self.disconnect_reason = reason;
                self.state = State::Disconnecting;
            }
            Some(Command::Shutdown(ack)) => {
                self.pending_shutdown = Some(ack);
                self.disconnect_reason = ChangedReason::AclClientRequest;
                self.state = State::Disconnecting;
            }
            Some(Command::Connect) | Some(Command::RetryNow) | Some(Command::VerifyConnectivity) | None => {}
        }
    }

    /// Admission control (testable property 2): a new message handler is
    /// created only if every in-flight one has already been acknowledged.
    fn maybe_admit_next_message(&mut self) {
        // Also runs during WAITING_POST_CONNECT: the one post-connect
        // operation this crate ships sends its synchronize event through
        // the same admission path, not a side channel.
        if !matches!(self.state, State::Connected | State::WaitingPostConnect) {
            return;
        }
        if self.inflight_messages.values().any(|acked| !acked) {
            return;
        }
        let request = match self.queue.pop_front() {
            Some(r) => r,
            None => return,
        };

        let id = self.next_message_id;
        self.next_message_id += 1;
        self.inflight_messages.insert(id, false);
        self.last_activity = self.time.now();

        let callbacks: Arc<dyn ExchangeHandlerCallbacks> = Arc::new(EventSink {
            id,
            tx: self.events.clone(),
        });

        self.spawn_message_request(id, callbacks, request);
    }

    fn spawn_message_request(&mut self, id: u64, callbacks: Arc<dyn ExchangeHandlerCallbacks>, request: MessageRequest) {
        let send_request = match self.send_request.clone() {
            Some(sr) => sr,
            None => return,
        };
        let path = request
            .uri_override
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.config.endpoint, self.config.events_path));
        let extra_headers = request.extra_headers.clone();
        let consumer = self.collaborators.consumer.clone();
        let attachment_manager = self.collaborators.attachment_manager.clone();
        let auth = self.collaborators.auth.clone();

        self.spawn_tracked(async move {
            let token = auth.token().await;
            let mut builder = Request::post(path).header(http::header::AUTHORIZATION, bearer(&token));
            for (name, value) in extra_headers {
                builder = builder.header(name, value);
            }
            let http_request = match builder.body(()) {
                Ok(r) => r,
                Err(_) => return,
            };

            let mut handler = MessageRequestHandler::new(
                callbacks,
                consumer,
                attachment_manager,
                format!("msg-{id}"),
                request,
                token,
            );

            drive_exchange(send_request, http_request, &mut handler).await;
        });
    }

    async fn create_ping_handler(&mut self) {
        self.ping_in_flight = true;
        let token = self.collaborators.auth.token().await;
        let uri = format!("{}{}", self.config.endpoint, self.config.ping_path);
        let request = match Request::get(uri).header(http::header::AUTHORIZATION, bearer(&token)).body(()) {
            Ok(r) => r,
            Err(_) => return,
        };
        let callbacks: Arc<dyn ExchangeHandlerCallbacks> = Arc::new(EventSink {
            id: u64::MAX,
            tx: self.events.clone(),
        });
        let handler = PingHandler::new(callbacks);
        self.drive_request_response(request, Box::new(handler));
    }

    async fn drain_server_disconnect(&mut self) {
        if self.inflight_messages.is_empty() {
            self.state = State::Disconnecting;
            return;
        }
        match self.events_rx.recv().await {
            Some(HandlerEvent::MessageFinished(id)) => {
                self.inflight_messages.remove(&id);
                if self.inflight_messages.is_empty() {
                    self.state = State::Disconnecting;
                }
            }
            Some(_) => {}
            None => self.state = State::Disconnecting,
        }
    }

    async fn do_disconnect(&mut self) {
        // Fail every request still on the shared queue.
        for request in self.queue.drain(..) {
            request.notify_status(crate::message::Status::NotConnected, None);
        }
        // Fire the cancellation watch so the connection-driver task and
        // every in-flight exchange task (see `spawn_tracked`) stop racing
        // their network I/O against it and exit, then wait for them to
        // actually finish before reporting disconnected.
        if let Some(cancel_tx) = self.conn_cancel_tx.take() {
            let _ = cancel_tx.send(true);
        }
        self.conn_cancel_rx = None;
        self.send_request = None;
        self.inflight_messages.clear();
        self.ping_in_flight = false;
        if let Some(seq) = self.post_connect.take() {
            seq.stop();
        }
        if self.inflight_tasks.load(Ordering::SeqCst) > 0 {
            self.tasks_idle.notified().await;
        }
        match self.pending_shutdown.take() {
            Some(ack) => {
                let _ = ack.send(());
                self.state = State::Shutdown;
            }
            None => self.state = State::Disconnected,
        }
    }

    async fn wait_after_disconnected(&mut self) -> bool {
        match self.commands.recv().await {
            Some(Command::Connect) => {
                self.attempt = 0;
                self.state = State::Connecting;
                self.notify_status(ConnectionStatus::Pending, ChangedReason::AclClientRequest);
                true
            }
            Some(Command::Shutdown(ack)) => {
                // Already fully torn down: do_disconnect's cleanup has
                // already run, so it is safe to acknowledge immediately.
                let _ = ack.send(());
                self.state = State::Shutdown;
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}

fn bearer(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {token}")).unwrap_or_else(|_| HeaderValue::from_static("Bearer"))
}

/// Send one request, feed the handler its response code and body chunks,
/// and report how the exchange finished. Shared by the downchannel, every
/// message request, and pings.
async fn drive_exchange(
    mut send_request: h2::client::SendRequest<Bytes>,
    request: Request<()>,
    handler: &mut dyn ExchangeHandler,
) {
    let mut body = handler.outbound_body();
    let end_of_stream = body.is_none();
    let (response_fut, mut send_stream) = match send_request.send_request(request, end_of_stream) {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%err, "failed to send request");
            handler.on_finished(FinishReason::InternalError);
            return;
        }
    };

    if let Some(body) = body.as_deref_mut() {
        let mut chunk = Vec::new();
        loop {
            chunk.clear();
            match body.pull(&mut chunk) {
                crate::mime::PullOutcome::Progress => {
                    if send_stream.send_data(Bytes::copy_from_slice(&chunk), false).is_err() {
                        break;
                    }
                }
                crate::mime::PullOutcome::Complete => {
                    let _ = send_stream.send_data(Bytes::copy_from_slice(&chunk), true);
                    break;
                }
                crate::mime::PullOutcome::Pause => {
                    tokio::task::yield_now().await;
                }
                crate::mime::PullOutcome::Abort => {
                    send_stream.send_reset(h2::Reason::INTERNAL_ERROR);
                    handler.on_finished(FinishReason::InternalError);
                    return;
                }
            }
        }
    }

    let response = match response_fut.await {
        Ok(response) => response,
        Err(err) => {
            debug!(%err, "response future failed");
            handler.on_finished(FinishReason::InternalError);
            return;
        }
    };

    handler.on_response_code(Some(response.status().as_u16()), response.headers());

    let mut recv = response.into_body();
    loop {
        match recv.data().await {
            Some(Ok(chunk)) => {
                let _ = recv.flow_control().release_capacity(chunk.len());
                handler.on_body_chunk(&chunk);
            }
            Some(Err(err)) => {
                debug!(%err, "error reading response body");
                handler.on_finished(FinishReason::InternalError);
                return;
            }
            None => break,
        }
    }
    handler.on_finished(FinishReason::Complete);
}

struct PostConnectOneshotObserver(Option<oneshot::Sender<bool>>);

impl PostConnectSequencerObserver for PostConnectOneshotObserver {
    fn on_post_connected(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(true);
        }
    }

    fn on_unrecoverable_post_connect_failure(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(false);
        }
    }
}
