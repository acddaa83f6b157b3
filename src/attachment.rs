//! The attachment-manager collaborator, and the outcome of writing/reading
//! attachment bytes through it.

/// Outcome of a write into an [`AttachmentWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All bytes were accepted.
    Ok,
    /// Some bytes were accepted, but the writer's buffer is now full;
    /// the caller should pause until more room is available.
    OkBufferFull,
    /// The writer has been closed and cannot accept more data.
    Closed,
    /// An internal error occurred in the writer.
    InternalError,
    /// Fewer bytes than the writer's minimum word size were supplied.
    ErrorBytesLessThanWordSize,
    /// The write did not complete within the writer's internal timeout.
    TimedOut,
}

/// A sink for one attachment's bytes.
pub trait AttachmentWriter: Send {
    /// Write `bytes`, returning how much was accepted and the outcome.
    ///
    /// `accepted` is always `<= bytes.len()`; on anything other than `Ok`
    /// or `OkBufferFull`, `accepted` should be treated as meaningless.
    fn write(&mut self, bytes: &[u8]) -> (usize, WriteOutcome);
}

/// Outcome of reading from an outbound attachment reader, mirroring the
/// return values a `MessageRequestHandler`'s body-pull callback must map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Forward progress: bytes were produced.
    Progress,
    /// The reader would block; caller should pause and retry later.
    WouldBlock,
    /// The reader timed out waiting for data.
    TimedOut,
    /// Fewer bytes than the minimum word size are available.
    BytesLessThanWordSize,
    /// The reader has been reset/overrun and must abort the stream.
    OverrunReset,
    /// An overrun error occurred.
    Overrun,
    /// An internal error occurred.
    InternalError,
    /// The reader is exhausted; no more data will ever be produced.
    Complete,
}

/// A pull-style source of one attachment's outbound bytes.
pub trait AttachmentReader: Send {
    /// Attempt to read up to `buf.len()` bytes into `buf`.
    ///
    /// Returns the number of bytes written into `buf` (meaningful only when
    /// the outcome is [`ReadOutcome::Progress`]) and the outcome.
    fn read(&mut self, buf: &mut [u8]) -> (usize, ReadOutcome);
}

/// Creates attachment ids and writers for inbound attachment parts, and is
/// assumed to be internally thread-safe (shared across every handler on a
/// transport).
pub trait AttachmentManager: Send + Sync {
    /// Derive a globally-unique id for an attachment named `content_id`
    /// within the scope of `context_id` (the owning HTTP/2 request id).
    fn generate_id(&self, context_id: &str, content_id: &str) -> String {
        format!("{context_id}:{content_id}")
    }

    /// Create a writer for `id`, or `None` if one already exists or the
    /// manager has no room left.
    ///
    /// Implementations are the sole durable authority on this: at most one
    /// real writer is ever handed out for a given id, for the lifetime of
    /// the manager, even though [`crate::mime::MimeResponseSink`] (rebuilt
    /// fresh on every reconnect, with no memory of earlier connections) may
    /// call this more than once for the same id when a part is redelivered.
    fn create_writer(&self, id: &str) -> Option<Box<dyn AttachmentWriter>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingWriter {
        pub(crate) bytes: Vec<u8>,
    }

    impl AttachmentWriter for RecordingWriter {
        fn write(&mut self, bytes: &[u8]) -> (usize, WriteOutcome) {
            self.bytes.extend_from_slice(bytes);
            (bytes.len(), WriteOutcome::Ok)
        }
    }

    /// An `AttachmentManager` double that hands out exactly one
    /// [`RecordingWriter`] per id and records every `generate_id`/
    /// `create_writer` call for test assertions.
    #[derive(Default)]
    pub(crate) struct InMemoryAttachmentManager {
        created: Mutex<HashMap<String, std::sync::Arc<Mutex<RecordingWriter>>>>,
        create_calls: Mutex<Vec<String>>,
    }

    impl InMemoryAttachmentManager {
        pub(crate) fn new() -> InMemoryAttachmentManager {
            InMemoryAttachmentManager::default()
        }

        pub(crate) fn create_call_count(&self, id: &str) -> usize {
            self.create_calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| *c == id)
                .count()
        }

        pub(crate) fn written_bytes(&self, id: &str) -> Option<Vec<u8>> {
            self.created
                .lock()
                .unwrap()
                .get(id)
                .map(|w| w.lock().unwrap().bytes.clone())
        }

        /// How many real writers (as opposed to calls refused with `None`)
        /// have ever been handed out for `id`: always 0 or 1.
        pub(crate) fn writers_created(&self, id: &str) -> usize {
            self.created.lock().unwrap().contains_key(id) as usize
        }
    }

    struct SharedWriter(std::sync::Arc<Mutex<RecordingWriter>>);

    impl AttachmentWriter for SharedWriter {
        fn write(&mut self, bytes: &[u8]) -> (usize, WriteOutcome) {
            self.0.lock().unwrap().write(bytes)
        }
    }

    impl AttachmentManager for InMemoryAttachmentManager {
        fn create_writer(&self, id: &str) -> Option<Box<dyn AttachmentWriter>> {
            self.create_calls.lock().unwrap().push(id.to_owned());
            let mut created = self.created.lock().unwrap();
            if created.contains_key(id) {
                // Second call for the same id: the real contract is "exactly
                // once"; returning None mirrors the manager refusing a
                // duplicate, the sink is expected not to call twice.
                return None;
            }
            let writer = std::sync::Arc::new(Mutex::new(RecordingWriter::default()));
            created.insert(id.to_owned(), writer.clone());
            Some(Box::new(SharedWriter(writer)))
        }
    }
}
