//! `GatewayConnectionManager` (spec component C6): the public façade. Thin
//! wrapper around [`MessageRouter`] that adds an idempotent enabled/disabled
//! flag, aggregates observer sets the router only ever sees one of, and
//! reacts to connectivity-monitor push notifications.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::attachment::AttachmentManager;
use crate::auth::AuthDelegate;
use crate::common::exec::Exec;
use crate::common::time::Time;
use crate::message::{ChangedReason, ConnectionStatusObserver, ConnectionStatusUpdate, MessageObserver, MessageRequest};
use crate::postconnect::PostConnectFactory;
use crate::router::MessageRouter;
use crate::transport::{ConnectionFactory, TransportConfig};

struct StatusFanOut {
    observers: Mutex<Vec<Arc<dyn ConnectionStatusObserver>>>,
}

impl ConnectionStatusObserver for StatusFanOut {
    fn on_status_changed(&self, update: ConnectionStatusUpdate) {
        for observer in self.observers.lock().unwrap().iter() {
            observer.on_status_changed(update);
        }
    }
}

struct MessageFanOut {
    observers: Mutex<Vec<Arc<dyn MessageObserver>>>,
}

impl MessageObserver for MessageFanOut {
    fn on_message(&self, context_id: &str, json: &str) {
        for observer in self.observers.lock().unwrap().iter() {
            observer.on_message(context_id, json);
        }
    }
}

/// The crate's top-level entry point: one gateway connection, behind an
/// enable/disable switch, observed by any number of callers.
pub struct GatewayConnectionManager {
    router: MessageRouter,
    status_observers: Arc<StatusFanOut>,
    message_observers: Arc<MessageFanOut>,
    enabled: Mutex<bool>,
}

impl GatewayConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TransportConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
        auth: Arc<dyn AuthDelegate>,
        attachment_manager: Arc<dyn AttachmentManager>,
        post_connect_factory: Arc<dyn PostConnectFactory>,
    ) -> GatewayConnectionManager {
        let status_observers = Arc::new(StatusFanOut {
            observers: Mutex::new(Vec::new()),
        });
        let message_observers = Arc::new(MessageFanOut {
            observers: Mutex::new(Vec::new()),
        });

        let router = MessageRouter::new(
            config,
            connection_factory,
            auth,
            attachment_manager,
            message_observers.clone(),
            post_connect_factory,
            status_observers.clone(),
            Exec::default(),
            Time::default(),
        );

        GatewayConnectionManager {
            router,
            status_observers,
            message_observers,
            enabled: Mutex::new(false),
        }
    }

    pub fn add_connection_status_observer(&self, observer: Arc<dyn ConnectionStatusObserver>) {
        self.status_observers.observers.lock().unwrap().push(observer);
    }

    pub fn remove_connection_status_observer(&self, observer: &Arc<dyn ConnectionStatusObserver>) {
        self.status_observers
            .observers
            .lock()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn add_message_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.message_observers.observers.lock().unwrap().push(observer);
    }

    pub fn remove_message_observer(&self, observer: &Arc<dyn MessageObserver>) {
        self.message_observers
            .observers
            .lock()
            .unwrap()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn enable(&self) {
        let mut enabled = self.enabled.lock().unwrap();
        if *enabled {
            return;
        }
        *enabled = true;
        self.router.enable();
    }

    pub async fn disable(&self) {
        {
            let mut enabled = self.enabled.lock().unwrap();
            if !*enabled {
                return;
            }
            *enabled = false;
        }
        self.router.disable(ChangedReason::AclClientRequest).await;
    }

    /// `disable()` then `enable()` if currently enabled; a no-op otherwise.
    pub async fn reconnect(&self) {
        if !self.is_enabled() {
            return;
        }
        self.disable().await;
        self.enable();
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.router.is_connected()
    }

    pub fn set_gateway(&self, endpoint: impl Into<String>) {
        self.router.set_gateway(endpoint.into());
    }

    pub fn gateway(&self) -> String {
        self.router.gateway()
    }

    /// `None` mirrors the source's `send(nullptr)`: logged and dropped.
    /// `Some` while disabled is still forwarded — the router fails it with
    /// `NOT_CONNECTED` rather than the manager special-casing it.
    pub fn send(&self, request: Option<MessageRequest>) {
        match request {
            Some(request) => self.router.send(request),
            None => warn!("dropping a None message request"),
        }
    }

    /// Feed from an injected connectivity monitor: `true` wakes the active
    /// transport's backoff wait early; `false` asks it to verify liveness
    /// with an immediate ping.
    pub fn on_connectivity(&self, connected: bool) {
        if connected {
            self.router.request_retry_wake();
        } else {
            self.router.verify_connectivity();
        }
    }
}

impl fmt::Debug for GatewayConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConnectionManager")
            .field("enabled", &self.is_enabled())
            .field("connected", &self.is_connected())
            .field("gateway", &self.gateway())
            .finish()
    }
}
