//! `MimeResponseSink` (spec component C1): stitches chunks from one HTTP/2
//! response body into MIME parts, routing JSON parts to a
//! [`MessageConsumer`] and binary parts to [`AttachmentWriter`]s, with a
//! capped buffer for non-MIME error bodies.

mod decode;
mod encode;

pub(crate) use decode::{FeedOutcome, MimeResponseSink};
pub(crate) use encode::{MimeEncoder, Part, PullOutcome};

/// Boundary used on every outbound event POST.
pub(crate) const OUTBOUND_BOUNDARY: &str = "WhooHooZeerOoonie=";

/// Cap on accumulated non-MIME error bodies (spec section 4.1).
pub(crate) const NON_MIME_BODY_CAP: usize = 4096;
