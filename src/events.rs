use crate::error::UploadError;
use crate::metadata::ObjectMetadata;

/// Progress information emitted each time a chunk traverses the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadProgress {
    /// Bytes the producer has pushed so far, before the current chunk.
    pub bytes_written: u64,
    /// Declared total length, when known up front.
    pub content_length: Option<u64>,
}

impl UploadProgress {
    pub fn new(bytes_written: u64, content_length: Option<u64>) -> Self {
        Self {
            bytes_written,
            content_length,
        }
    }
}

/// Lifecycle notifications delivered on the upload's event channel.
///
/// Ordering guarantees: `Progress` values are monotonic, `Metadata` precedes
/// `Finish`, `Restart` precedes the creation of the replacement session, and
/// `Error` is terminal (the channel closes afterwards).
#[derive(Clone, Debug)]
pub enum UploadEvent {
    /// The first byte of caller data was observed.
    Writing,
    Progress(UploadProgress),
    /// The server produced a final response to a chunk stream, carrying this
    /// status.
    Response(u16),
    /// The finalized object resource, parsed.
    Metadata(ObjectMetadata),
    /// The current session was discarded and a fresh one is being created.
    Restart,
    Error(UploadError),
    Finish,
}
