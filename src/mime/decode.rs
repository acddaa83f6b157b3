use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::attachment::{AttachmentManager, AttachmentWriter, WriteOutcome};
use crate::message::MessageObserver;

use super::NON_MIME_BODY_CAP;

/// What the caller of [`MimeResponseSink::feed`] should do next, mirroring
/// the receive-data statuses of spec section 4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedOutcome {
    /// Keep delivering chunks.
    Continue,
    /// An attachment writer's buffer is full; pause until drained.
    Pause,
    /// An attachment writer rejected the data outright; the enclosing
    /// handler should report an error and tear down the stream.
    Abort,
}

enum State {
    SeekingPreamble,
    ParsingHeaders,
    StreamingBody {
        kind: PartKind,
    },
    Done,
}

enum PartKind {
    Json { buf: String },
    Attachment {
        id: String,
        writer: Option<Box<dyn AttachmentWriter>>,
    },
    Ignored,
}

pub(crate) struct MimeResponseSink {
    consumer: Arc<dyn MessageObserver>,
    attachment_manager: Arc<dyn AttachmentManager>,
    context_id: String,
    boundary_marker: Vec<u8>,
    buf: Vec<u8>,
    state: State,
    is_mime: bool,
    non_mime_body: Vec<u8>,
    non_mime_truncated: bool,
}

impl MimeResponseSink {
    pub(crate) fn new(
        consumer: Arc<dyn MessageObserver>,
        attachment_manager: Arc<dyn AttachmentManager>,
        context_id: String,
        boundary: &str,
    ) -> MimeResponseSink {
        MimeResponseSink {
            consumer,
            attachment_manager,
            context_id,
            boundary_marker: format!("--{boundary}").into_bytes(),
            buf: Vec::new(),
            state: State::SeekingPreamble,
            is_mime: true,
            non_mime_body: Vec::new(),
            non_mime_truncated: false,
        }
    }

    /// Mark this response as not carrying a MIME body at all (no boundary
    /// in its `Content-Type`); all bytes go to the non-MIME error buffer.
    pub(crate) fn set_non_mime(&mut self) {
        self.is_mime = false;
    }

    /// The accumulated non-MIME body, capped at [`NON_MIME_BODY_CAP`] bytes.
    pub(crate) fn non_mime_body(&self) -> Option<String> {
        if self.non_mime_body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.non_mime_body).into_owned())
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
        if !self.is_mime {
            self.accumulate_non_mime(chunk);
            return FeedOutcome::Continue;
        }

        self.buf.extend_from_slice(chunk);

        loop {
            match self.advance() {
                Advance::NeedMore => return FeedOutcome::Continue,
                Advance::Aborted => return FeedOutcome::Abort,
                Advance::Paused => return FeedOutcome::Pause,
                Advance::Progressed => continue,
            }
        }
    }

    fn accumulate_non_mime(&mut self, chunk: &[u8]) {
        if self.non_mime_body.len() >= NON_MIME_BODY_CAP {
            self.non_mime_truncated = true;
            return;
        }
        let remaining = NON_MIME_BODY_CAP - self.non_mime_body.len();
        let take = remaining.min(chunk.len());
        self.non_mime_body.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            self.non_mime_truncated = true;
        }
    }

    fn advance(&mut self) -> Advance {
        match &mut self.state {
            State::SeekingPreamble => self.seek_preamble(),
            State::ParsingHeaders => self.parse_headers(),
            State::StreamingBody { .. } => self.stream_body(),
            State::Done => {
                // Epilogue bytes after the final boundary are discarded.
                self.buf.clear();
                Advance::NeedMore
            }
        }
    }

    fn seek_preamble(&mut self) -> Advance {
        if let Some(pos) = find(&self.buf, &self.boundary_marker) {
            let after = pos + self.boundary_marker.len();
            // Could be end-of-body marker ("--boundary--") with nothing
            // following; treat that as done.
            if self.buf[after..].starts_with(b"--") {
                self.state = State::Done;
                self.buf.drain(..after + 2);
                return Advance::Progressed;
            }
            self.buf.drain(..after);
            self.state = State::ParsingHeaders;
            Advance::Progressed
        } else {
            self.retain_tail(self.boundary_marker.len());
            Advance::NeedMore
        }
    }

    /// Drop everything from `buf` except a tail of `marker_len - 1` bytes,
    /// the most that could still be the prefix of a not-yet-fully-arrived
    /// marker.
    fn retain_tail(&mut self, marker_len: usize) {
        let keep = marker_len.saturating_sub(1);
        if self.buf.len() > keep {
            let drop = self.buf.len() - keep;
            self.buf.drain(..drop);
        }
    }

    fn parse_headers(&mut self) -> Advance {
        if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
            let header_bytes = self.buf[..pos].to_vec();
            self.buf.drain(..pos + 4);
            let headers = parse_header_lines(&header_bytes);
            self.state = State::StreamingBody {
                kind: self.classify(&headers),
            };
            Advance::Progressed
        } else {
            Advance::NeedMore
        }
    }

    fn classify(&mut self, headers: &[(String, String)]) -> PartKind {
        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
            .unwrap_or_default();
        let content_ids: Vec<&str> = headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("content-id"))
            .map(|(_, v)| v.as_str())
            .collect();

        if content_type.contains("application/json") {
            trace!(context_id = %self.context_id, "mime part classified as json");
            PartKind::Json { buf: String::new() }
        } else if content_type.contains("application/octet-stream") && content_ids.len() == 1 {
            let sanitized = sanitize_content_id(content_ids[0]);
            let id = self.attachment_manager.generate_id(&self.context_id, &sanitized);
            trace!(context_id = %self.context_id, attachment_id = %id, "mime part classified as attachment");
            // The manager outlives this sink (it is shared across
            // reconnects), so it, not this sink, is the authority on
            // whether a writer for `id` already exists; a redelivered part
            // after a reconnect must still ask and get refused here rather
            // than silently skip the call.
            let writer = self.attachment_manager.create_writer(&id);
            PartKind::Attachment { id, writer }
        } else {
            debug!(context_id = %self.context_id, content_type, "ignoring mime part with unrecognized content-type");
            PartKind::Ignored
        }
    }

    fn stream_body(&mut self) -> Advance {
        // Need "\r\n" + boundary to unambiguously find the delimiter that
        // terminates this part's body.
        let mut delim = Vec::with_capacity(self.boundary_marker.len() + 2);
        delim.extend_from_slice(b"\r\n");
        delim.extend_from_slice(&self.boundary_marker);

        if let Some(pos) = find(&self.buf, &delim) {
            let body: Vec<u8> = self.buf.drain(..pos).collect();
            let outcome = self.deliver_body(&body, true);
            if outcome != Advance::Progressed {
                return outcome;
            }

            // consume the delimiter itself
            self.buf.drain(..delim.len());
            if self.buf.starts_with(b"--") {
                self.state = State::Done;
                self.buf.drain(..2);
            } else {
                self.state = State::ParsingHeaders;
            }
            Advance::Progressed
        } else {
            // Safe to flush everything except a tail that could be the
            // start of the delimiter.
            let safe_len = self.buf.len().saturating_sub(delim.len().saturating_sub(1));
            if safe_len == 0 {
                return Advance::NeedMore;
            }
            let body: Vec<u8> = self.buf.drain(..safe_len).collect();
            let outcome = self.deliver_body(&body, false);
            if outcome == Advance::Progressed {
                Advance::NeedMore
            } else {
                outcome
            }
        }
    }

    fn deliver_body(&mut self, body: &[u8], part_end: bool) -> Advance {
        let State::StreamingBody { kind } = &mut self.state else {
            unreachable!("deliver_body called outside StreamingBody state")
        };
        match kind {
            PartKind::Json { buf } => {
                if !body.is_empty() {
                    buf.push_str(&String::from_utf8_lossy(body));
                }
                if part_end {
                    if !buf.is_empty() {
                        self.consumer.on_message(&self.context_id, buf);
                    }
                    // Empty buffer on part end means this is a re-drive of
                    // an already-consumed part; drop silently (dedup).
                }
                Advance::Progressed
            }
            PartKind::Attachment { id, writer } => {
                if body.is_empty() {
                    return Advance::Progressed;
                }
                let Some(w) = writer else {
                    // No writer (manager refused, or redelivery after the
                    // writer was already opened once); drop the bytes.
                    return Advance::Progressed;
                };
                let (written, result) = w.write(body);
                match result {
                    WriteOutcome::Ok => Advance::Progressed,
                    WriteOutcome::OkBufferFull => {
                        if written < body.len() {
                            warn!(attachment_id = %id, "attachment writer buffer full with unwritten bytes");
                        }
                        Advance::Paused
                    }
                    WriteOutcome::Closed
                    | WriteOutcome::InternalError
                    | WriteOutcome::ErrorBytesLessThanWordSize
                    | WriteOutcome::TimedOut => Advance::Aborted,
                }
            }
            PartKind::Ignored => Advance::Progressed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    Progressed,
    NeedMore,
    Paused,
    Aborted,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_header_lines(bytes: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(bytes)
        .split("\r\n")
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

/// Strip a surrounding `<...>` pair from a `Content-ID` header value, per
/// spec section 4.1. Does not decode `cid:`-style URL escapes; this is
/// intentionally preserved source behavior (spec section 9, open question 1).
fn sanitize_content_id(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('<') && raw.ends_with('>') {
        raw[1..raw.len() - 1].to_owned()
    } else {
        raw.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::test_support::InMemoryAttachmentManager;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingConsumer {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl MessageObserver for RecordingConsumer {
        fn on_message(&self, context_id: &str, json: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((context_id.to_owned(), json.to_owned()));
        }
    }

    fn build(consumer: Arc<RecordingConsumer>, am: Arc<InMemoryAttachmentManager>) -> MimeResponseSink {
        MimeResponseSink::new(consumer, am, "ctx1".to_owned(), "boundary")
    }

    #[test]
    fn sanitize_strips_angle_brackets() {
        assert_eq!(sanitize_content_id("<id1>"), "id1");
        assert_eq!(sanitize_content_id("id1"), "id1");
    }

    #[test]
    fn parses_single_json_part() {
        let consumer = Arc::new(RecordingConsumer::default());
        let am = Arc::new(InMemoryAttachmentManager::new());
        let mut sink = build(consumer.clone(), am);

        let body = concat!(
            "--boundary\r\n",
            "Content-Type: application/json\r\n",
            "\r\n",
            "{\"x\":1}",
            "\r\n--boundary--\r\n"
        );
        assert_eq!(sink.feed(body.as_bytes()), FeedOutcome::Continue);

        let messages = consumer.messages.lock().unwrap();
        assert_eq!(*messages, vec![("ctx1".to_owned(), "{\"x\":1}".to_owned())]);
    }

    #[test]
    fn redelivery_across_reconnect_creates_attachment_writer_exactly_once() {
        let consumer = Arc::new(RecordingConsumer::default());
        let am = Arc::new(InMemoryAttachmentManager::new());

        let body = concat!(
            "--boundary\r\n",
            "Content-Type: application/json\r\n",
            "\r\n",
            "{\"x\":1}",
            "\r\n--boundary\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-ID: <id1>\r\n",
            "\r\n",
            "ABCD",
            "\r\n--boundary--\r\n"
        );

        // First delivery.
        let mut sink = build(consumer.clone(), am.clone());
        assert_eq!(sink.feed(body.as_bytes()), FeedOutcome::Continue);

        // Second feed (re-drive) through a *new* sink sharing the same
        // attachment manager, as happens across a reconnect that rebuilds
        // the handler/sink but keeps the manager alive. The sink has no
        // memory of the first sink's writer; the manager must still refuse
        // to hand out a second one.
        let mut sink2 = build(consumer.clone(), am.clone());
        assert_eq!(sink2.feed(body.as_bytes()), FeedOutcome::Continue);

        // The manager is asked twice (once per sink) but only ever creates
        // one real writer, per spec's "exactly one writer is ever created"
        // contract; the second ask is refused with `None`.
        assert_eq!(am.create_call_count("ctx1:id1"), 2);
        assert_eq!(am.writers_created("ctx1:id1"), 1);
        assert_eq!(
            consumer.messages.lock().unwrap().len(),
            2,
            "message consumer sees the JSON once per feed"
        );
        assert_eq!(am.written_bytes("ctx1:id1").unwrap(), b"ABCD");
    }

    #[test]
    fn chunked_feed_across_boundary_split() {
        let consumer = Arc::new(RecordingConsumer::default());
        let am = Arc::new(InMemoryAttachmentManager::new());
        let mut sink = build(consumer.clone(), am);

        let body = concat!(
            "--boundary\r\n",
            "Content-Type: application/json\r\n",
            "\r\n",
            "{\"a\":true}",
            "\r\n--boundary--\r\n"
        );
        // Feed one byte at a time to exercise partial-boundary buffering.
        for byte in body.as_bytes() {
            sink.feed(&[*byte]);
        }
        assert_eq!(
            *consumer.messages.lock().unwrap(),
            vec![("ctx1".to_owned(), "{\"a\":true}".to_owned())]
        );
    }

    #[test]
    fn non_mime_body_capped() {
        let consumer = Arc::new(RecordingConsumer::default());
        let am = Arc::new(InMemoryAttachmentManager::new());
        let mut sink = build(consumer, am);
        sink.set_non_mime();
        let chunk = vec![b'x'; NON_MIME_BODY_CAP + 100];
        sink.feed(&chunk);
        assert_eq!(sink.non_mime_body().unwrap().len(), NON_MIME_BODY_CAP);
    }

    #[test]
    fn ignores_unknown_content_type_part() {
        let consumer = Arc::new(RecordingConsumer::default());
        let am = Arc::new(InMemoryAttachmentManager::new());
        let mut sink = build(consumer.clone(), am);
        let body = concat!(
            "--boundary\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "hello",
            "\r\n--boundary--\r\n"
        );
        sink.feed(body.as_bytes());
        assert!(consumer.messages.lock().unwrap().is_empty());
    }
}
