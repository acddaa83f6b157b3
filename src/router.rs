//! `MessageRouter` (spec component C5): owns transport lifecycle, fans
//! connection-status and message notifications out to one upstream
//! observer pair, and forwards outbound sends to whichever transport is
//! currently active.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::attachment::AttachmentManager;
use crate::auth::AuthDelegate;
use crate::common::exec::Exec;
use crate::common::time::Time;
use crate::message::{
    ChangedReason, ConnectionStatus, ConnectionStatusObserver, ConnectionStatusUpdate, MessageObserver, MessageRequest,
    MessageSender, Status,
};
use crate::postconnect::PostConnectFactory;
use crate::rt::BoxSendFuture;
use crate::transport::{self, ConnectionFactory, TransportConfig, TransportHandle};

/// Runs futures submitted to it one at a time, in submission order,
/// standing in for the dedicated single-thread send/receive executors of
/// spec section 5 without pinning an OS thread per instance.
#[derive(Clone)]
struct SerialExecutor {
    tx: tokio::sync::mpsc::UnboundedSender<BoxSendFuture>,
}

impl SerialExecutor {
    fn new(exec: &Exec) -> SerialExecutor {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<BoxSendFuture>();
        exec.execute(async move {
            while let Some(fut) = rx.recv().await {
                fut.await;
            }
        });
        SerialExecutor { tx }
    }

    fn execute(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let _ = self.tx.send(Box::pin(fut));
    }
}

struct DispatchingStatusObserver {
    exec: SerialExecutor,
    inner: Arc<dyn ConnectionStatusObserver>,
}

impl ConnectionStatusObserver for DispatchingStatusObserver {
    fn on_status_changed(&self, update: ConnectionStatusUpdate) {
        let inner = self.inner.clone();
        self.exec.execute(async move { inner.on_status_changed(update) });
    }
}

struct DispatchingMessageObserver {
    exec: SerialExecutor,
    inner: Arc<dyn MessageObserver>,
}

impl MessageObserver for DispatchingMessageObserver {
    fn on_message(&self, context_id: &str, json: &str) {
        let inner = self.inner.clone();
        let context_id = context_id.to_owned();
        let json = json.to_owned();
        self.exec.execute(async move { inner.on_message(&context_id, &json) });
    }
}

fn aggregate_status(statuses: &HashMap<usize, ConnectionStatus>) -> ConnectionStatus {
    if statuses.values().any(|s| *s == ConnectionStatus::Connected) {
        ConnectionStatus::Connected
    } else if statuses.values().any(|s| *s == ConnectionStatus::Pending) {
        ConnectionStatus::Pending
    } else {
        ConnectionStatus::Disconnected
    }
}

/// Per-transport observer the router hands to [`transport::spawn`]; folds
/// one transport's status reports into the router's aggregate view before
/// forwarding to the (dispatching) upstream observer, per spec section
/// 4.5's status-aggregation rule, and triggers the active-transport
/// rotation that an orderly server disconnect requires.
struct TransportStatusSink {
    router: Arc<RouterInner>,
    transport_id: usize,
}

impl ConnectionStatusObserver for TransportStatusSink {
    fn on_status_changed(&self, update: ConnectionStatusUpdate) {
        let combined = {
            let mut state = self.router.state.lock().unwrap();
            state.transport_status.insert(self.transport_id, update.status);
            let aggregate = aggregate_status(&state.transport_status);
            let combined = ConnectionStatusUpdate {
                status: aggregate,
                reason: update.reason,
            };
            if state.last_emitted == Some(combined) {
                None
            } else {
                state.last_emitted = Some(combined);
                Some(combined)
            }
        };
        if let Some(combined) = combined {
            self.router.status_observer.on_status_changed(combined);
        }
        if update.reason == ChangedReason::ServerSideDisconnect {
            self.router.rotate_after_orderly_disconnect(self.transport_id);
        }
    }
}

struct RouterState {
    config: TransportConfig,
    active: Option<(usize, Arc<TransportHandle>)>,
    /// Transports kept alive only to drain an in-flight downchannel after
    /// an orderly server disconnect or endpoint change; never receive new
    /// sends.
    draining: Vec<(usize, Arc<TransportHandle>)>,
    next_transport_id: usize,
    transport_status: HashMap<usize, ConnectionStatus>,
    last_emitted: Option<ConnectionStatusUpdate>,
}

struct RouterInner {
    connection_factory: Arc<dyn ConnectionFactory>,
    auth: Arc<dyn AuthDelegate>,
    attachment_manager: Arc<dyn AttachmentManager>,
    consumer: Arc<dyn MessageObserver>,
    post_connect_factory: Arc<dyn PostConnectFactory>,
    exec: Exec,
    time: Time,
    send_exec: SerialExecutor,
    status_observer: Arc<dyn ConnectionStatusObserver>,
    state: Mutex<RouterState>,
}

impl RouterInner {
    /// Spawn a fresh transport under the router's own aggregating status
    /// sink. Caller holds `state` locked and inserts the result.
    fn spawn_transport(self: &Arc<Self>, state: &mut RouterState) -> (usize, Arc<TransportHandle>) {
        let id = state.next_transport_id;
        state.next_transport_id += 1;
        state.transport_status.insert(id, ConnectionStatus::Disconnected);

        let sink: Arc<dyn ConnectionStatusObserver> = Arc::new(TransportStatusSink {
            router: self.clone(),
            transport_id: id,
        });

        let handle = Arc::new(transport::spawn(
            state.config.clone(),
            self.connection_factory.clone(),
            self.auth.clone(),
            self.attachment_manager.clone(),
            self.consumer.clone(),
            self.post_connect_factory.clone(),
            sink,
            self.exec.clone(),
            self.time.clone(),
        ));
        (id, handle)
    }

    /// `transport_id` just reported `SERVER_SIDE_DISCONNECT`. If it is
    /// still the active transport, demote it to draining (its downchannel
    /// keeps running until it finishes) and spin up a replacement so new
    /// sends are not blocked on the old transport tearing down.
    fn rotate_after_orderly_disconnect(self: &Arc<Self>, transport_id: usize) {
        let mut state = self.state.lock().unwrap();
        let is_active = matches!(&state.active, Some((id, _)) if *id == transport_id);
        if !is_active {
            return;
        }
        if let Some(old) = state.active.take() {
            state.draining.push(old);
        }
        let (id, handle) = self.spawn_transport(&mut state);
        state.active = Some((id, handle.clone()));
        drop(state);
        handle.connect();
    }
}

/// Owns the active-transport pointer, the set of transports still
/// draining, the endpoint URL, and the single upstream observer pair.
pub(crate) struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: TransportConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
        auth: Arc<dyn AuthDelegate>,
        attachment_manager: Arc<dyn AttachmentManager>,
        consumer: Arc<dyn MessageObserver>,
        post_connect_factory: Arc<dyn PostConnectFactory>,
        observer: Arc<dyn ConnectionStatusObserver>,
        exec: Exec,
        time: Time,
    ) -> MessageRouter {
        let send_exec = SerialExecutor::new(&exec);
        let receive_exec = SerialExecutor::new(&exec);

        let consumer: Arc<dyn MessageObserver> = Arc::new(DispatchingMessageObserver {
            exec: receive_exec.clone(),
            inner: consumer,
        });
        let status_observer: Arc<dyn ConnectionStatusObserver> = Arc::new(DispatchingStatusObserver {
            exec: receive_exec,
            inner: observer,
        });

        MessageRouter {
            inner: Arc::new(RouterInner {
                connection_factory,
                auth,
                attachment_manager,
                consumer,
                post_connect_factory,
                exec,
                time,
                send_exec,
                status_observer,
                state: Mutex::new(RouterState {
                    config,
                    active: None,
                    draining: Vec::new(),
                    next_transport_id: 0,
                    transport_status: HashMap::new(),
                    last_emitted: None,
                }),
            }),
        }
    }

    /// If not already connected, create a new active transport and start
    /// connecting it.
    pub(crate) fn enable(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.active.is_some() {
            return;
        }
        let (id, handle) = self.inner.spawn_transport(&mut state);
        state.active = Some((id, handle.clone()));
        drop(state);
        handle.connect();
    }

    /// Disconnect every transport (active and draining) with `reason` and
    /// wait for each to fully shut down, satisfying testable property 7
    /// ("no further network I/O after disable() returns").
    pub(crate) async fn disable(&self, reason: ChangedReason) {
        let transports: Vec<Arc<TransportHandle>> = {
            let mut state = self.inner.state.lock().unwrap();
            let mut all: Vec<Arc<TransportHandle>> = state.draining.drain(..).map(|(_, h)| h).collect();
            if let Some((_, active)) = state.active.take() {
                all.push(active);
            }
            all
        };
        for transport in &transports {
            transport.disconnect(reason);
        }
        for transport in transports {
            transport.shutdown().await;
        }
    }

    /// Replace the active transport with one pointed at `endpoint`,
    /// keeping the old one around to drain per spec section 4.5's
    /// endpoint-change path.
    pub(crate) fn set_gateway(&self, endpoint: String) {
        let mut state = self.inner.state.lock().unwrap();
        if state.config.endpoint == endpoint {
            return;
        }
        state.config.endpoint = endpoint;
        let was_enabled = state.active.is_some();
        if let Some((id, old_active)) = state.active.take() {
            old_active.disconnect(ChangedReason::ServerEndpointChanged);
            state.draining.push((id, old_active));
        }
        if was_enabled {
            let (id, handle) = self.inner.spawn_transport(&mut state);
            state.active = Some((id, handle.clone()));
            drop(state);
            handle.connect();
        }
    }

    pub(crate) fn gateway(&self) -> String {
        self.inner.state.lock().unwrap().config.endpoint.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map(|(_, t)| t.is_connected())
            .unwrap_or(false)
    }

    /// Non-blocking: submitted to the router's send executor, which then
    /// only forwards to the active transport's own (also non-blocking)
    /// send, per spec section 4.5's observer/send-executor split. Requests
    /// submitted with no active transport fail immediately.
    pub(crate) fn send(&self, request: MessageRequest) {
        let active = self.inner.state.lock().unwrap().active.as_ref().map(|(_, t)| t.clone());
        match active {
            Some(transport) => self.inner.send_exec.execute(async move { transport.send(request) }),
            None => {
                request.notify_status(Status::NotConnected, None);
            }
        }
    }

    pub(crate) fn request_retry_wake(&self) {
        let active = self.inner.state.lock().unwrap().active.as_ref().map(|(_, t)| t.clone());
        if let Some(active) = active {
            active.request_retry_wake();
        }
    }

    pub(crate) fn verify_connectivity(&self) {
        let active = self.inner.state.lock().unwrap().active.as_ref().map(|(_, t)| t.clone());
        if let Some(active) = active {
            active.verify_connectivity();
        }
    }
}

impl MessageSender for MessageRouter {
    fn send(&self, request: MessageRequest) {
        MessageRouter::send(self, request);
    }
}
