use std::sync::Arc;

use http::HeaderMap;
use tracing::{debug, trace};

use crate::attachment::AttachmentManager;
use crate::message::{MessageObserver, MessageRequest, Status};
use crate::mime::{MimeEncoder, MimeResponseSink, Part, PullOutcome};

use super::{diagnostic_request_id, extract_boundary, ExchangeHandler, ExchangeHandlerCallbacks, FinishReason, OutboundBody};

/// Drives one POST to the events endpoint: streams `request`'s body as
/// `multipart/form-data` and parses the response, per spec section 4.2.2.
pub(crate) struct MessageRequestHandler {
    callbacks: Arc<dyn ExchangeHandlerCallbacks>,
    consumer: Arc<dyn MessageObserver>,
    attachment_manager: Arc<dyn AttachmentManager>,
    context_id: String,
    request: Option<MessageRequest>,
    part: Part,
    first_byte_sent: bool,
    sink: Option<MimeResponseSink>,
    code: Option<u16>,
    diagnostic_request_id: Option<String>,
    token: String,
    acknowledged: bool,
}

impl MessageRequestHandler {
    pub(crate) fn new(
        callbacks: Arc<dyn ExchangeHandlerCallbacks>,
        consumer: Arc<dyn MessageObserver>,
        attachment_manager: Arc<dyn AttachmentManager>,
        context_id: impl Into<String>,
        request: MessageRequest,
        token: impl Into<String>,
    ) -> MessageRequestHandler {
        MessageRequestHandler {
            callbacks,
            consumer,
            attachment_manager,
            context_id: context_id.into(),
            request: Some(request),
            part: Part::initial(),
            first_byte_sent: false,
            sink: None,
            code: None,
            diagnostic_request_id: None,
            token: token.into(),
            acknowledged: false,
        }
    }

    fn finish(&mut self, status: Status) {
        if let Some(request) = self.request.take() {
            request.notify_status(status, self.diagnostic_request_id.as_deref());
            if status != Status::Success
                && status != Status::SuccessAccepted
                && status != Status::SuccessNoContent
            {
                if let Some(body) = self.sink.as_ref().and_then(|s| s.non_mime_body()) {
                    request.notify_exception(&body);
                }
            }
        }
    }
}

impl ExchangeHandler for MessageRequestHandler {
    fn on_response_code(&mut self, code: Option<u16>, headers: &HeaderMap) {
        trace!(?code, "message request response code");
        self.code = code;
        self.diagnostic_request_id = diagnostic_request_id(headers);

        let boundary = extract_boundary(headers);
        let mut sink = MimeResponseSink::new(
            self.consumer.clone(),
            self.attachment_manager.clone(),
            self.context_id.clone(),
            boundary.as_deref().unwrap_or(""),
        );
        if boundary.is_none() {
            sink.set_non_mime();
        }
        self.sink = Some(sink);

        if !self.acknowledged {
            self.acknowledged = true;
            self.callbacks.message_acknowledged();
        }
        if code == Some(403) {
            self.callbacks.auth_failure(&self.token);
        }
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) {
        if let Some(sink) = self.sink.as_mut() {
            sink.feed(chunk);
        }
    }

    fn on_finished(&mut self, reason: FinishReason) {
        debug!(?reason, code = ?self.code, "message request finished");
        if !self.acknowledged {
            self.acknowledged = true;
            self.callbacks.message_acknowledged();
        }
        self.callbacks.message_finished();

        let status = match reason {
            FinishReason::Timeout => Status::TimedOut,
            FinishReason::Cancelled => Status::Canceled,
            FinishReason::InternalError => Status::InternalError,
            FinishReason::Complete => {
                if self.code.is_none() {
                    Status::InternalError
                } else {
                    Status::from_response_code(self.code)
                }
            }
        };
        self.finish(status);
    }

    fn outbound_body(&mut self) -> Option<&mut dyn OutboundBody> {
        Some(self)
    }
}

impl OutboundBody for MessageRequestHandler {
    fn pull(&mut self, buf: &mut Vec<u8>) -> PullOutcome {
        let request = match self.request.as_mut() {
            Some(r) => r,
            None => return PullOutcome::Complete,
        };
        let mut encoder = MimeEncoder::resume(request, self.part, self.first_byte_sent);
        let outcome = encoder.pull(buf);
        let (part, first_byte_sent) = encoder.into_parts();
        self.part = part;
        self.first_byte_sent = first_byte_sent;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::test_support::InMemoryAttachmentManager;
    use crate::message::{MessageRequestObserver, Status};
    use std::sync::Mutex;

    struct RecordingConsumer;
    impl MessageObserver for RecordingConsumer {
        fn on_message(&self, _context_id: &str, _json: &str) {}
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        acknowledged: Mutex<u32>,
        finished: Mutex<u32>,
    }

    impl ExchangeHandlerCallbacks for RecordingCallbacks {
        fn message_acknowledged(&self) {
            *self.acknowledged.lock().unwrap() += 1;
        }
        fn message_finished(&self) {
            *self.finished.lock().unwrap() += 1;
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        statuses: Mutex<Vec<Status>>,
    }

    impl MessageRequestObserver for Arc<RecordingObserver> {
        fn on_status(&self, status: Status, _diagnostic_request_id: Option<&str>) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    fn handler(callbacks: Arc<RecordingCallbacks>, observer: Arc<RecordingObserver>) -> MessageRequestHandler {
        let request = MessageRequest::new("{}").with_observer(Box::new(observer));
        MessageRequestHandler::new(
            callbacks,
            Arc::new(RecordingConsumer),
            Arc::new(InMemoryAttachmentManager::new()),
            "ctx-1",
            request,
            "token-1",
        )
    }

    #[test]
    fn acknowledged_fires_exactly_once_across_multiple_response_codes() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let observer = Arc::new(RecordingObserver::default());
        let mut h = handler(callbacks.clone(), observer);
        h.on_response_code(Some(200), &HeaderMap::new());
        h.on_response_code(Some(200), &HeaderMap::new());
        assert_eq!(*callbacks.acknowledged.lock().unwrap(), 1);
    }

    #[test]
    fn success_code_maps_to_success_status() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let observer = Arc::new(RecordingObserver::default());
        let mut h = handler(callbacks, observer.clone());
        h.on_response_code(Some(200), &HeaderMap::new());
        h.on_finished(FinishReason::Complete);
        assert_eq!(observer.statuses.lock().unwrap().as_slice(), &[Status::Success]);
    }

    #[test]
    fn timeout_overrides_response_code() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let observer = Arc::new(RecordingObserver::default());
        let mut h = handler(callbacks, observer.clone());
        h.on_response_code(Some(200), &HeaderMap::new());
        h.on_finished(FinishReason::Timeout);
        assert_eq!(observer.statuses.lock().unwrap().as_slice(), &[Status::TimedOut]);
    }

    #[test]
    fn complete_with_no_code_is_internal_error() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let observer = Arc::new(RecordingObserver::default());
        let mut h = handler(callbacks.clone(), observer.clone());
        h.on_finished(FinishReason::Complete);
        assert_eq!(observer.statuses.lock().unwrap().as_slice(), &[Status::InternalError]);
        // message_acknowledged still fires once even without a response code.
        assert_eq!(*callbacks.acknowledged.lock().unwrap(), 1);
    }
}
