use std::sync::Arc;

use http::HeaderMap;
use tracing::{debug, trace};

use crate::attachment::AttachmentManager;
use crate::message::MessageObserver;
use crate::mime::MimeResponseSink;

use super::{diagnostic_request_id, extract_boundary, ExchangeHandler, ExchangeHandlerCallbacks, FinishReason};

/// Drives the long-lived GET to `/v20160207/directives`, per spec section
/// 4.2.1: only `200` and `403` cause a session-visible state change, every
/// other accepted code is consumed silently until the exchange finishes.
pub(crate) struct DownchannelHandler {
    callbacks: Arc<dyn ExchangeHandlerCallbacks>,
    consumer: Arc<dyn MessageObserver>,
    attachment_manager: Arc<dyn AttachmentManager>,
    context_id: String,
    sink: Option<MimeResponseSink>,
    code: Option<u16>,
    diagnostic_request_id: Option<String>,
    token: String,
}

impl DownchannelHandler {
    pub(crate) fn new(
        callbacks: Arc<dyn ExchangeHandlerCallbacks>,
        consumer: Arc<dyn MessageObserver>,
        attachment_manager: Arc<dyn AttachmentManager>,
        context_id: impl Into<String>,
        token: impl Into<String>,
    ) -> DownchannelHandler {
        DownchannelHandler {
            callbacks,
            consumer,
            attachment_manager,
            context_id: context_id.into(),
            sink: None,
            code: None,
            diagnostic_request_id: None,
            token: token.into(),
        }
    }
}

impl ExchangeHandler for DownchannelHandler {
    fn on_response_code(&mut self, code: Option<u16>, headers: &HeaderMap) {
        trace!(?code, "downchannel response code");
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

        match code {
            Some(200) => self.callbacks.downchannel_connected(),
            Some(403) => self.callbacks.auth_failure(&self.token),
            _ => {}
        }
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) {
        if let Some(sink) = self.sink.as_mut() {
            sink.feed(chunk);
        }
    }

    fn on_finished(&mut self, reason: FinishReason) {
        debug!(?reason, code = ?self.code, "downchannel finished");
        self.callbacks.downchannel_finished(reason);
    }
}
