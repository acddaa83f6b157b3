use crate::attachment::{AttachmentReader, ReadOutcome};
use crate::message::MessageRequest;

use super::OUTBOUND_BOUNDARY;

/// Result of one [`MimeEncoder::pull`] call, mirroring the HTTP/2 library's
/// body-pull callback contract from spec section 4.2.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullOutcome {
    /// Bytes were written into the caller's buffer; forward progress.
    Progress,
    /// Nothing could be produced right now; caller should pause and retry.
    Pause,
    /// The entire body has been produced.
    Complete,
    /// An unrecoverable error occurred producing the body.
    Abort,
}

#[derive(Clone, Copy)]
pub(crate) enum Part {
    Metadata { offset: usize },
    Attachment { index: usize, header_offset: usize },
    Trailer { offset: usize },
    Done,
}

impl Part {
    pub(crate) fn initial() -> Part {
        Part::Metadata { offset: 0 }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, Part::Done)
    }
}

/// Encodes a [`MessageRequest`] as a `multipart/form-data` body with a
/// `metadata` JSON part followed by one `application/octet-stream` part per
/// attachment, per spec section 4.2.2.
pub(crate) struct MimeEncoder<'a> {
    request: &'a mut MessageRequest,
    part: Part,
    first_byte_sent: bool,
}

fn metadata_header() -> Vec<u8> {
    format!(
        "--{boundary}\r\nContent-Type: application/json\r\nContent-Disposition: form-data; name=\"metadata\"\r\n\r\n",
        boundary = OUTBOUND_BOUNDARY
    )
    .into_bytes()
}

fn attachment_header(name: &str) -> Vec<u8> {
    format!(
        "\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n",
        boundary = OUTBOUND_BOUNDARY
    )
    .into_bytes()
}

fn trailer() -> Vec<u8> {
    format!("\r\n--{boundary}--\r\n", boundary = OUTBOUND_BOUNDARY).into_bytes()
}

impl<'a> MimeEncoder<'a> {
    pub(crate) fn new(request: &'a mut MessageRequest) -> MimeEncoder<'a> {
        MimeEncoder {
            request,
            part: Part::initial(),
            first_byte_sent: false,
        }
    }

    /// Resume encoding a request whose `part`/`first_byte_sent` progress
    /// was previously obtained from [`MimeEncoder::into_parts`]. Lets a
    /// caller that cannot hold a `MimeEncoder` across calls (because it
    /// owns the `MessageRequest` itself) drive the same state machine one
    /// borrow at a time.
    pub(crate) fn resume(request: &'a mut MessageRequest, part: Part, first_byte_sent: bool) -> MimeEncoder<'a> {
        MimeEncoder {
            request,
            part,
            first_byte_sent,
        }
    }

    /// Extract this encoder's progress so the borrow on `request` can end
    /// while the caller retains enough state to `resume` later.
    pub(crate) fn into_parts(self) -> (Part, bool) {
        (self.part, self.first_byte_sent)
    }

    /// Whether the encoded body carries any attachment parts.
    pub(crate) fn has_attachments(&self) -> bool {
        !self.request.attachments.is_empty()
    }

    /// Whether at least one byte of the body has been produced yet — the
    /// trigger for the "start-of-event" metric hook of spec section 4.2.2.
    pub(crate) fn first_byte_sent(&self) -> bool {
        self.first_byte_sent
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.part.is_done()
    }

    /// Produce the next chunk of body bytes into `buf`, returning how the
    /// HTTP/2 library should interpret this pull.
    pub(crate) fn pull(&mut self, buf: &mut Vec<u8>) -> PullOutcome {
        let state = self.part;
        let (outcome, next) = match state {
            Part::Metadata { offset } => self.pull_metadata(offset, buf),
            Part::Attachment { index, header_offset } => self.pull_attachment(index, header_offset, buf),
            Part::Trailer { offset } => Self::pull_trailer(offset, buf),
            Part::Done => (PullOutcome::Complete, Part::Done),
        };
        self.part = next;
        if outcome == PullOutcome::Progress {
            self.first_byte_sent = true;
        }
        outcome
    }

    fn pull_metadata(&mut self, offset: usize, buf: &mut Vec<u8>) -> (PullOutcome, Part) {
        let header = metadata_header();
        if offset < header.len() {
            let remaining = &header[offset..];
            buf.extend_from_slice(remaining);
            return (PullOutcome::Progress, Part::Metadata {
                offset: offset + remaining.len(),
            });
        }
        let json_offset = offset - header.len();
        let json_bytes = self.request.json.as_bytes();
        if json_offset < json_bytes.len() {
            let remaining = &json_bytes[json_offset..];
            buf.extend_from_slice(remaining);
            return (PullOutcome::Progress, Part::Metadata {
                offset: offset + remaining.len(),
            });
        }
        let next = if self.request.attachments.is_empty() {
            Part::Trailer { offset: 0 }
        } else {
            Part::Attachment {
                index: 0,
                header_offset: 0,
            }
        };
        (PullOutcome::Complete, next)
    }

    fn pull_attachment(&mut self, index: usize, header_offset: usize, buf: &mut Vec<u8>) -> (PullOutcome, Part) {
        let header = attachment_header(&self.request.attachments[index].name);
        if header_offset < header.len() {
            let remaining = &header[header_offset..];
            buf.extend_from_slice(remaining);
            return (PullOutcome::Progress, Part::Attachment {
                index,
                header_offset: header_offset + remaining.len(),
            });
        }

        let mut scratch = [0u8; 8192];
        let (n, read_outcome) = self.request.attachments[index].reader.read(&mut scratch);
        match read_outcome {
            ReadOutcome::Progress => {
                buf.extend_from_slice(&scratch[..n]);
                (PullOutcome::Progress, Part::Attachment { index, header_offset })
            }
            ReadOutcome::Complete => {
                let next_index = index + 1;
                let next = if next_index < self.request.attachments.len() {
                    Part::Attachment {
                        index: next_index,
                        header_offset: 0,
                    }
                } else {
                    Part::Trailer { offset: 0 }
                };
                (PullOutcome::Complete, next)
            }
            ReadOutcome::WouldBlock | ReadOutcome::TimedOut | ReadOutcome::BytesLessThanWordSize => {
                (PullOutcome::Pause, Part::Attachment { index, header_offset })
            }
            ReadOutcome::OverrunReset | ReadOutcome::Overrun | ReadOutcome::InternalError => {
                (PullOutcome::Abort, Part::Attachment { index, header_offset })
            }
        }
    }

    fn pull_trailer(offset: usize, buf: &mut Vec<u8>) -> (PullOutcome, Part) {
        let trailer = trailer();
        let remaining = &trailer[offset..];
        if remaining.is_empty() {
            return (PullOutcome::Complete, Part::Done);
        }
        buf.extend_from_slice(remaining);
        (PullOutcome::Progress, Part::Trailer {
            offset: offset + remaining.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentReader;

    struct StaticReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AttachmentReader for StaticReader {
        fn read(&mut self, buf: &mut [u8]) -> (usize, ReadOutcome) {
            if self.pos >= self.data.len() {
                return (0, ReadOutcome::Complete);
            }
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            (n, ReadOutcome::Progress)
        }
    }

    fn drain(mut request: MessageRequest) -> Vec<u8> {
        let mut encoder = MimeEncoder::new(&mut request);
        let mut out = Vec::new();
        loop {
            let mut chunk = Vec::new();
            match encoder.pull(&mut chunk) {
                PullOutcome::Progress => out.extend_from_slice(&chunk),
                PullOutcome::Complete => {
                    out.extend_from_slice(&chunk);
                    if encoder.is_complete() {
                        break;
                    }
                }
                PullOutcome::Pause | PullOutcome::Abort => panic!("unexpected outcome in test"),
            }
        }
        out
    }

    #[test]
    fn metadata_only_body_is_well_formed() {
        let request = MessageRequest::new("{\"event\":true}");
        let body = String::from_utf8(drain(request)).unwrap();
        assert!(body.starts_with("--WhooHooZeerOoonie=\r\nContent-Type: application/json"));
        assert!(body.contains("{\"event\":true}"));
        assert!(body.trim_end().ends_with("--WhooHooZeerOoonie=--"));
    }

    #[test]
    fn attachment_part_is_named_and_streamed() {
        let request = MessageRequest::new("{}").with_attachment(
            "audio",
            Box::new(StaticReader {
                data: b"ABCD".to_vec(),
                pos: 0,
            }),
        );
        let body = String::from_utf8(drain(request)).unwrap();
        assert!(body.contains("name=\"audio\""));
        assert!(body.contains("application/octet-stream"));
        assert!(body.contains("ABCD"));
    }

    #[test]
    fn first_byte_sent_flips_on_first_progress() {
        let mut request = MessageRequest::new("{}");
        let mut encoder = MimeEncoder::new(&mut request);
        assert!(!encoder.first_byte_sent());
        let mut buf = Vec::new();
        encoder.pull(&mut buf);
        assert!(encoder.first_byte_sent());
    }
}
