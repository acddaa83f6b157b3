//! Outbound requests, their terminal statuses, and the observer contracts
//! the core notifies.

use std::fmt;

use http::{HeaderName, HeaderValue};

use crate::attachment::AttachmentReader;

/// The terminal status delivered to a [`MessageRequest`]'s observer(s).
///
/// Closed set, matching spec invariant 5. Never extended with a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    SuccessNoContent,
    SuccessAccepted,
    NotConnected,
    TimedOut,
    InvalidAuth,
    BadRequest,
    Throttled,
    ServerInternalErrorV2,
    Refused,
    Canceled,
    ServerOtherError,
    InternalError,
}

impl Status {
    /// Map an HTTP response code to its nominal status, before any
    /// finished-status override is applied.
    pub(crate) fn from_response_code(code: Option<u16>) -> Status {
        match code {
            None => Status::InternalError,
            Some(200) => Status::Success,
            Some(202) => Status::SuccessAccepted,
            Some(204) => Status::SuccessNoContent,
            Some(400) => Status::BadRequest,
            Some(403) => Status::InvalidAuth,
            Some(429) => Status::Throttled,
            Some(500) => Status::ServerInternalErrorV2,
            Some(503) => Status::Refused,
            Some(_) => Status::ServerOtherError,
        }
    }
}

/// Why a connection status transition occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangedReason {
    /// No disconnect has occurred yet.
    None,
    TransientNetwork,
    ConnectionTimedOut,
    DnsTimedOut,
    ReadTimedOut,
    WriteTimedOut,
    PingTimedOut,
    ServerSideDisconnect,
    ServerEndpointChanged,
    FailureProtocolError,
    ServerInternalError,
    InvalidAuth,
    ConnectionThrottled,
    AclClientRequest,
    AclDisabled,
    InternalError,
}

/// Aggregate connection status reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Pending,
    Connected,
}

/// A single `(status, reason)` pair, as delivered to a
/// [`ConnectionStatusObserver`]. Spec invariant 3 requires this never
/// repeat identically in succession.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatusUpdate {
    pub status: ConnectionStatus,
    pub reason: ChangedReason,
}

/// Observes the aggregate connection status of the router/manager.
pub trait ConnectionStatusObserver: Send + Sync {
    fn on_status_changed(&self, update: ConnectionStatusUpdate);
}

/// Observes JSON directives parsed out of downchannel and event responses.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, context_id: &str, json: &str);
}

/// Observes the terminal outcome of one [`MessageRequest`].
pub trait MessageRequestObserver: Send + Sync {
    fn on_status(&self, status: Status, diagnostic_request_id: Option<&str>);

    /// Called in addition to `on_status` when a non-200 response carried a
    /// non-MIME body (the "exception body" of spec section 4.1).
    fn on_exception_received(&self, _body: &str) {}
}

/// One named binary attachment to send alongside an event's JSON body.
pub struct OutboundAttachment {
    pub name: String,
    pub reader: Box<dyn AttachmentReader>,
}

impl fmt::Debug for OutboundAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundAttachment").field("name", &self.name).finish()
    }
}

/// An immutable client-originated request: an event JSON body plus zero or
/// more attachments, optionally overriding the default event path or
/// carrying extra headers.
pub struct MessageRequest {
    pub json: String,
    pub attachments: Vec<OutboundAttachment>,
    pub uri_override: Option<String>,
    /// Extra headers appended after `Authorization`, in order, without
    /// deduplication (spec section 9, REDESIGN FLAGS note 3).
    pub extra_headers: Vec<(HeaderName, HeaderValue)>,
    pub observers: Vec<Box<dyn MessageRequestObserver>>,
}

impl fmt::Debug for MessageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRequest")
            .field("json", &self.json)
            .field("attachments", &self.attachments)
            .field("uri_override", &self.uri_override)
            .field("extra_headers", &self.extra_headers.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl MessageRequest {
    pub fn new(json: impl Into<String>) -> MessageRequest {
        MessageRequest {
            json: json.into(),
            attachments: Vec::new(),
            uri_override: None,
            extra_headers: Vec::new(),
            observers: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, name: impl Into<String>, reader: Box<dyn AttachmentReader>) -> Self {
        self.attachments.push(OutboundAttachment {
            name: name.into(),
            reader,
        });
        self
    }

    pub fn with_uri_override(mut self, uri: impl Into<String>) -> Self {
        self.uri_override = Some(uri.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.extra_headers.push((name, value));
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn MessageRequestObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub(crate) fn notify_status(&self, status: Status, diagnostic_request_id: Option<&str>) {
        for observer in &self.observers {
            observer.on_status(status, diagnostic_request_id);
        }
    }

    pub(crate) fn notify_exception(&self, body: &str) {
        for observer in &self.observers {
            observer.on_exception_received(body);
        }
    }
}

/// Non-blocking entry point for sending a [`MessageRequest`]; a request
/// submitted here always eventually reaches its observer(s) with exactly
/// one terminal [`Status`] (spec invariant 5).
pub trait MessageSender: Send + Sync {
    fn send(&self, request: MessageRequest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_maps_to_nominal_status() {
        assert_eq!(Status::from_response_code(Some(200)), Status::Success);
        assert_eq!(Status::from_response_code(Some(202)), Status::SuccessAccepted);
        assert_eq!(Status::from_response_code(Some(204)), Status::SuccessNoContent);
        assert_eq!(Status::from_response_code(Some(400)), Status::BadRequest);
        assert_eq!(Status::from_response_code(Some(403)), Status::InvalidAuth);
        assert_eq!(Status::from_response_code(Some(429)), Status::Throttled);
        assert_eq!(Status::from_response_code(Some(500)), Status::ServerInternalErrorV2);
        assert_eq!(Status::from_response_code(Some(503)), Status::Refused);
        assert_eq!(Status::from_response_code(Some(599)), Status::ServerOtherError);
        assert_eq!(Status::from_response_code(None), Status::InternalError);
    }
}
