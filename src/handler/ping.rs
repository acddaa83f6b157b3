use std::sync::Arc;

use http::HeaderMap;
use tracing::trace;

use super::{ExchangeHandler, ExchangeHandlerCallbacks, FinishReason};

/// Drives a single GET to `<endpoint>/ping`, per spec section 4.2.3: it
/// never reads a body, only reacts to the response code and how the
/// exchange finished.
pub(crate) struct PingHandler {
    callbacks: Arc<dyn ExchangeHandlerCallbacks>,
    code: Option<u16>,
}

impl PingHandler {
    pub(crate) fn new(callbacks: Arc<dyn ExchangeHandlerCallbacks>) -> PingHandler {
        PingHandler { callbacks, code: None }
    }
}

impl ExchangeHandler for PingHandler {
    fn on_response_code(&mut self, code: Option<u16>, _headers: &HeaderMap) {
        trace!(?code, "ping response code");
        self.code = code;
        self.callbacks.ping_acknowledged(code == Some(204));
    }

    fn on_body_chunk(&mut self, _chunk: &[u8]) {}

    fn on_finished(&mut self, reason: FinishReason) {
        trace!(?reason, code = ?self.code, "ping finished");
        match reason {
            FinishReason::Timeout | FinishReason::InternalError => self.callbacks.ping_timeout(),
            FinishReason::Cancelled => {}
            FinishReason::Complete => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallbacks {
        acknowledged: Mutex<Vec<bool>>,
        timeouts: Mutex<u32>,
    }

    impl ExchangeHandlerCallbacks for RecordingCallbacks {
        fn ping_acknowledged(&self, success: bool) {
            self.acknowledged.lock().unwrap().push(success);
        }

        fn ping_timeout(&self) {
            *self.timeouts.lock().unwrap() += 1;
        }
    }

    #[test]
    fn no_content_response_is_a_successful_ping() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut handler = PingHandler::new(callbacks.clone());
        handler.on_response_code(Some(204), &HeaderMap::new());
        assert_eq!(callbacks.acknowledged.lock().unwrap().as_slice(), &[true]);
    }

    #[test]
    fn other_code_is_an_unsuccessful_ping() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut handler = PingHandler::new(callbacks.clone());
        handler.on_response_code(Some(500), &HeaderMap::new());
        assert_eq!(callbacks.acknowledged.lock().unwrap().as_slice(), &[false]);
    }

    #[test]
    fn timeout_notifies_ping_timeout() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut handler = PingHandler::new(callbacks.clone());
        handler.on_finished(FinishReason::Timeout);
        assert_eq!(*callbacks.timeouts.lock().unwrap(), 1);
    }

    #[test]
    fn cancelled_is_silently_dropped() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut handler = PingHandler::new(callbacks.clone());
        handler.on_finished(FinishReason::Cancelled);
        assert_eq!(*callbacks.timeouts.lock().unwrap(), 0);
    }
}
