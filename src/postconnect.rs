//! `PostConnectSequencer` (spec component C4): runs a fixed, ordered list
//! of one-shot operations after the downchannel connects and before user
//! events may be sent, grounded on `PostConnectSequencer.cpp`'s
//! mainloop/stop contract.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

use crate::common::exec::Exec;
use crate::common::retry::{RetryTable, POST_CONNECT_RETRY_TABLE_MS};
use crate::common::time::Time;
use crate::message::{MessageRequest, MessageRequestObserver, MessageSender, Status};

/// One domain-specific action that must succeed before a transport may
/// leave `WAITING_POST_CONNECT`.
pub trait PostConnectOperation: Send + Sync {
    /// Ascending priority; the sequencer runs operations in this order.
    fn priority(&self) -> u32;

    /// Perform the operation, returning `false` on unrecoverable failure.
    fn perform(&self, sender: Arc<dyn MessageSender>) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>>;

    /// Unblock an in-progress `perform` call so `stop` can return quickly.
    fn abort(&self);
}

/// Produces the ordered operation list for one connection attempt. Injected
/// into `MessageRouter`/`GatewayConnectionManager` construction, per spec
/// section 3's supplement on `PostConnectObject.cpp` assembly.
pub trait PostConnectFactory: Send + Sync {
    fn create(&self) -> Vec<Box<dyn PostConnectOperation>>;
}

/// Supplies the device-state JSON a [`StateSynchronizeOperation`] bundles
/// into its `System.SynchronizeState` event. Mirrors the asynchronous
/// `ContextManagerInterface::getContext`/`onContextAvailable` callback pair
/// from the original source as a plain async method.
pub trait ContextProvider: Send + Sync {
    fn context_json(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>>;
}

struct SyncObserver(Mutex<Option<oneshot::Sender<Status>>>);

impl MessageRequestObserver for SyncObserver {
    fn on_status(&self, status: Status, _diagnostic_request_id: Option<&str>) {
        if let Some(tx) = self.0.lock().unwrap().take() {
            let _ = tx.send(status);
        }
    }
}

fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

fn synchronize_state_event(context_json: &str) -> String {
    format!(
        r#"{{"context":{},"event":{{"header":{{"namespace":"System","name":"SynchronizeState","messageId":"{}"}},"payload":{{}}}}}}"#,
        context_json,
        generate_message_id(),
    )
}

/// The one concrete [`PostConnectOperation`] this crate ships, corresponding
/// to `PostConnectSynchronizer.cpp`: send a `System.SynchronizeState` event
/// carrying the caller's context, retrying on its own 6-entry backoff table
/// (separate from the transport's 8-entry reconnect table) until it
/// succeeds or `abort` is called.
struct StateSynchronizeOperation {
    context: Arc<dyn ContextProvider>,
    retry_table: RetryTable,
    time: Time,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl PostConnectOperation for StateSynchronizeOperation {
    fn priority(&self) -> u32 {
        0
    }

    fn perform(&self, sender: Arc<dyn MessageSender>) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            let mut stop_rx = self.stop_rx.clone();
            let mut attempt: u32 = 0;
            loop {
                if *stop_rx.borrow() {
                    return false;
                }

                let context_json = self.context.context_json().await;
                let json = synchronize_state_event(&context_json);
                let (tx, rx) = oneshot::channel();
                let request = MessageRequest::new(json).with_observer(Box::new(SyncObserver(Mutex::new(Some(tx)))));
                sender.send(request);

                let status = tokio::select! {
                    result = rx => result.ok(),
                    _ = stop_rx.changed() => None,
                };

                match status {
                    Some(Status::Success) | Some(Status::SuccessNoContent) | Some(Status::SuccessAccepted) => {
                        return true;
                    }
                    _ => {
                        if *stop_rx.borrow() {
                            return false;
                        }
                        attempt += 1;
                        let delay = self.retry_table.delay_for_attempt(attempt);
                        tokio::select! {
                            _ = self.time.sleep(delay) => {}
                            _ = stop_rx.changed() => {}
                        }
                    }
                }
            }
        })
    }

    fn abort(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Default [`PostConnectFactory`]: one [`StateSynchronizeOperation`] built
/// from a caller-supplied [`ContextProvider`].
pub struct DefaultPostConnectFactory {
    context: Arc<dyn ContextProvider>,
    time: Time,
}

impl DefaultPostConnectFactory {
    pub fn new(context: Arc<dyn ContextProvider>) -> DefaultPostConnectFactory {
        DefaultPostConnectFactory {
            context,
            time: Time::default(),
        }
    }
}

impl PostConnectFactory for DefaultPostConnectFactory {
    fn create(&self) -> Vec<Box<dyn PostConnectOperation>> {
        let (stop_tx, stop_rx) = watch::channel(false);
        vec![Box::new(StateSynchronizeOperation {
            context: self.context.clone(),
            retry_table: RetryTable::new(POST_CONNECT_RETRY_TABLE_MS),
            time: self.time.clone(),
            stop_tx,
            stop_rx,
        })]
    }
}

impl fmt::Debug for DefaultPostConnectFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultPostConnectFactory").finish()
    }
}

/// Callbacks the sequencer reports its single terminal outcome through.
pub(crate) trait PostConnectSequencerObserver: Send {
    fn on_post_connected(&mut self);
    fn on_unrecoverable_post_connect_failure(&mut self);
}

struct Shared {
    stopping: AtomicBool,
    current: Mutex<Option<Arc<dyn PostConnectOperation>>>,
}

/// Drives `doPostConnect`'s operations in order on a spawned task
/// (the teacher's worker-thread-per-call becomes one executor task here).
/// A second `do_post_connect` call on the same instance is rejected, and
/// `stop` both aborts the in-flight operation and is idempotent.
pub(crate) struct PostConnectSequencer {
    operations: Vec<Arc<dyn PostConnectOperation>>,
    exec: Exec,
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl PostConnectSequencer {
    pub(crate) fn new(operations: Vec<Box<dyn PostConnectOperation>>, exec: Exec) -> PostConnectSequencer {
        let mut operations: Vec<Arc<dyn PostConnectOperation>> = operations.into_iter().map(Arc::from).collect();
        operations.sort_by_key(|op| op.priority());
        PostConnectSequencer {
            operations,
            exec,
            shared: Arc::new(Shared {
                stopping: AtomicBool::new(false),
                current: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn do_post_connect(
        &self,
        sender: Arc<dyn MessageSender>,
        observer: impl PostConnectSequencerObserver + 'static,
    ) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            error!("doPostConnect: main loop already running");
            return false;
        }

        let operations = self.operations.clone();
        let shared = self.shared.clone();
        let mut observer = observer;

        self.exec.execute(async move {
            info!("post-connect main loop starting");
            for operation in operations {
                if shared.stopping.load(Ordering::Acquire) {
                    debug!("stop called, exiting post-connect loop");
                    return;
                }
                *shared.current.lock().unwrap() = Some(operation.clone());

                let ok = operation.perform(sender.clone()).await;

                *shared.current.lock().unwrap() = None;

                if !ok {
                    if !shared.stopping.load(Ordering::Acquire) {
                        observer.on_unrecoverable_post_connect_failure();
                    }
                    error!("post-connect operation failed, exiting loop");
                    return;
                }
            }
            observer.on_post_connected();
            info!("post-connect main loop returning");
        });

        true
    }

    /// Mirrors `onDisconnect`/the destructor: both funnel into `stop`.
    pub(crate) fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(current) = self.shared.current.lock().unwrap().as_ref() {
            current.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRequest;
    use std::sync::Mutex as StdMutex;

    struct RecordingSender;
    impl MessageSender for RecordingSender {
        fn send(&self, _request: MessageRequest) {}
    }

    struct ScriptedOperation {
        priority: u32,
        succeeds: bool,
        aborted: Arc<AtomicBool>,
    }

    impl PostConnectOperation for ScriptedOperation {
        fn priority(&self) -> u32 {
            self.priority
        }

        fn perform(&self, _sender: Arc<dyn MessageSender>) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
            let succeeds = self.succeeds;
            Box::pin(async move { succeeds })
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::Release);
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        connected: Arc<StdMutex<u32>>,
        failed: Arc<StdMutex<u32>>,
    }

    impl PostConnectSequencerObserver for RecordingObserver {
        fn on_post_connected(&mut self) {
            *self.connected.lock().unwrap() += 1;
        }
        fn on_unrecoverable_post_connect_failure(&mut self) {
            *self.failed.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn all_operations_succeeding_notifies_connected() {
        let ops: Vec<Box<dyn PostConnectOperation>> = vec![
            Box::new(ScriptedOperation { priority: 1, succeeds: true, aborted: Arc::new(AtomicBool::new(false)) }),
            Box::new(ScriptedOperation { priority: 2, succeeds: true, aborted: Arc::new(AtomicBool::new(false)) }),
        ];
        let seq = PostConnectSequencer::new(ops, Exec::default());
        let observer = RecordingObserver::default();
        let connected = observer.connected.clone();
        seq.do_post_connect(Arc::new(RecordingSender), observer);

        for _ in 0..100 {
            if *connected.lock().unwrap() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*connected.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_operation_notifies_failure_and_stops_the_chain() {
        let ops: Vec<Box<dyn PostConnectOperation>> = vec![
            Box::new(ScriptedOperation { priority: 1, succeeds: false, aborted: Arc::new(AtomicBool::new(false)) }),
            Box::new(ScriptedOperation { priority: 2, succeeds: true, aborted: Arc::new(AtomicBool::new(false)) }),
        ];
        let seq = PostConnectSequencer::new(ops, Exec::default());
        let observer = RecordingObserver::default();
        let failed = observer.failed.clone();
        seq.do_post_connect(Arc::new(RecordingSender), observer);

        for _ in 0..100 {
            if *failed.lock().unwrap() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*failed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn second_do_post_connect_call_is_rejected() {
        let ops: Vec<Box<dyn PostConnectOperation>> = vec![];
        let seq = PostConnectSequencer::new(ops, Exec::default());
        assert!(seq.do_post_connect(Arc::new(RecordingSender), RecordingObserver::default()));
        assert!(!seq.do_post_connect(Arc::new(RecordingSender), RecordingObserver::default()));
    }

    struct StubContext;

    impl ContextProvider for StubContext {
        fn context_json(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>> {
            Box::pin(async { "{}".to_owned() })
        }
    }

    #[derive(Default)]
    struct CapturingSender {
        sent: StdMutex<Vec<MessageRequest>>,
    }

    impl MessageSender for CapturingSender {
        fn send(&self, request: MessageRequest) {
            self.sent.lock().unwrap().push(request);
        }
    }

    fn test_operation() -> StateSynchronizeOperation {
        let (stop_tx, stop_rx) = watch::channel(false);
        StateSynchronizeOperation {
            context: Arc::new(StubContext),
            retry_table: RetryTable::new(POST_CONNECT_RETRY_TABLE_MS),
            time: Time::default(),
            stop_tx,
            stop_rx,
        }
    }

    #[tokio::test]
    async fn state_synchronize_operation_succeeds_once_transport_acknowledges() {
        let op: Arc<dyn PostConnectOperation> = Arc::new(test_operation());
        let sender = Arc::new(CapturingSender::default());

        let op_task = op.clone();
        let sender_task = sender.clone();
        let join = tokio::spawn(async move { op_task.perform(sender_task).await });

        let request = loop {
            if let Some(r) = sender.sent.lock().unwrap().pop() {
                break r;
            }
            tokio::task::yield_now().await;
        };
        assert!(request.json.contains("SynchronizeState"));
        request.notify_status(Status::Success, None);

        assert!(join.await.unwrap());
    }

    #[tokio::test]
    async fn state_synchronize_operation_retries_a_non_success_status() {
        let op: Arc<dyn PostConnectOperation> = Arc::new(test_operation());
        let sender = Arc::new(CapturingSender::default());

        let op_task = op.clone();
        let sender_task = sender.clone();
        let join = tokio::spawn(async move { op_task.perform(sender_task).await });

        let first = loop {
            if let Some(r) = sender.sent.lock().unwrap().pop() {
                break r;
            }
            tokio::task::yield_now().await;
        };
        first.notify_status(Status::ServerInternalErrorV2, None);

        let second = loop {
            if let Some(r) = sender.sent.lock().unwrap().pop() {
                break r;
            }
            tokio::task::yield_now().await;
        };
        second.notify_status(Status::Success, None);

        assert!(join.await.unwrap());
    }

    #[tokio::test]
    async fn abort_while_awaiting_response_returns_false_without_retrying() {
        let op: Arc<dyn PostConnectOperation> = Arc::new(test_operation());
        let sender = Arc::new(CapturingSender::default());

        let op_task = op.clone();
        let sender_task = sender.clone();
        let join = tokio::spawn(async move { op_task.perform(sender_task).await });

        loop {
            if !sender.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        op.abort();

        assert!(!join.await.unwrap());
    }
}
