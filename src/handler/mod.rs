//! `ExchangeHandler`s (spec component C2): the per-request-kind logic that
//! turns one HTTP/2 exchange's callbacks into a session-level notification,
//! matching the division `hyper` draws between the protocol driver
//! (`proto/h2`) and the thing reacting to it (`client/dispatch`).

mod downchannel;
mod message_request;
mod ping;

pub(crate) use downchannel::DownchannelHandler;
pub(crate) use message_request::MessageRequestHandler;
pub(crate) use ping::PingHandler;

use http::HeaderMap;

/// How an exchange ended, mirroring the finished-status vocabulary of spec
/// section 4.2.2 that every concrete handler maps into its own terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinishReason {
    /// The response (and, for requests with a body, the request) completed
    /// normally.
    Complete,
    /// No progress was observed within the exchange's activity timeout.
    Timeout,
    /// The exchange was cancelled locally (e.g. transport shutdown).
    Cancelled,
    /// An internal or protocol-level error ended the exchange.
    InternalError,
}

/// Callbacks an [`ExchangeHandler`] uses to notify `Transport` of
/// exchange-level events. `Transport` implements this; handlers never see
/// the transport's full state.
pub(crate) trait ExchangeHandlerCallbacks: Send + Sync {
    /// The downchannel's GET received a response code.
    fn downchannel_connected(&self) {}
    /// The downchannel's GET finished (always called exactly once).
    fn downchannel_finished(&self, _reason: FinishReason) {}
    /// A `403` named `token` as rejected, from any handler kind.
    fn auth_failure(&self, _token: &str) {}
    /// A message POST's response code arrived; the next queued request may
    /// now be admitted.
    fn message_acknowledged(&self) {}
    /// A message POST finished (always called exactly once).
    fn message_finished(&self) {}
    /// A ping's response code arrived.
    fn ping_acknowledged(&self, _success: bool) {}
    /// A ping exchange timed out or hit an internal error.
    fn ping_timeout(&self) {}
}

/// Per-exchange reactor driven by whatever owns the actual `h2` stream.
/// Every method may be called from the single network task only.
pub(crate) trait ExchangeHandler: Send {
    /// The response's status code arrived (headers received).
    fn on_response_code(&mut self, code: Option<u16>, headers: &HeaderMap);

    /// A chunk of the response body arrived.
    fn on_body_chunk(&mut self, chunk: &[u8]);

    /// The exchange ended; called exactly once regardless of how many
    /// times `on_response_code`/`on_body_chunk` ran.
    fn on_finished(&mut self, reason: FinishReason);

    /// Handlers that stream an outbound request body override this to
    /// return themselves; everything else is a bodyless GET.
    fn outbound_body(&mut self) -> Option<&mut dyn OutboundBody> {
        None
    }
}

/// Implemented only by handlers that stream an outbound request body
/// (presently [`MessageRequestHandler`]).
pub(crate) trait OutboundBody: Send {
    /// Pull the next chunk of outbound body bytes, per the semantics of
    /// [`crate::mime::PullOutcome`].
    fn pull(&mut self, buf: &mut Vec<u8>) -> crate::mime::PullOutcome;
}

pub(crate) fn diagnostic_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-amzn-requestid")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned())
}

/// Pull the `boundary` parameter out of a `multipart/...` `Content-Type`
/// header, if present.
pub(crate) fn extract_boundary(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(http::header::CONTENT_TYPE)?.to_str().ok()?;
    if !content_type.starts_with("multipart/") {
        return None;
    }
    content_type.split(';').skip(1).find_map(|param| {
        let param = param.trim();
        param.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_owned())
    })
}
