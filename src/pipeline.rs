//! The buffer-and-forward stage between the caller's writes and the HTTP PUT
//! body.
//!
//! Chunks are retained from the last server-acknowledged offset onward so an
//! interrupted attempt can be replayed after a reconnect. Per chunk, strictly
//! in order: progress accounting, first-chunk fingerprint check, offset skip,
//! forward.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::constants::FIRST_CHUNK_FINGERPRINT_LEN;
use crate::error::{internal_error, UploadResult};
use crate::events::UploadProgress;

/// What the pipeline decided to do with one incoming chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkDisposition {
    /// Send these bytes downstream (already trimmed of any acknowledged
    /// prefix).
    Forward(Bytes),
    /// The chunk lies entirely below the server-acknowledged offset.
    Skip,
    /// The first chunk does not match the fingerprint the session was created
    /// for; the chunk stays buffered and the upload must restart.
    Drift,
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub disposition: ChunkDisposition,
    /// Progress to report, when this traversal advanced past the high-water
    /// mark (replays stay silent so progress remains monotonic).
    pub progress: Option<UploadProgress>,
    /// A fingerprint captured from this chunk, to be persisted alongside the
    /// session URI.
    pub captured_fingerprint: Option<Vec<u8>>,
}

pub struct UploadPipeline {
    buffer: VecDeque<Bytes>,
    /// Absolute object offset of the front of `buffer`.
    base_offset: u64,
    /// Attempt-local counter of producer bytes, in absolute object positions.
    bytes_written: u64,
    /// Highest `bytes_written` already reported via a progress value.
    last_reported: Option<u64>,
    fingerprint: Option<Vec<u8>>,
    /// Whether the fingerprint was captured or matched during this process's
    /// lifetime. Until then the buffered bytes may belong to a different
    /// object than the acknowledged ones, so nothing may be released.
    fingerprint_validated: bool,
    content_length: Option<u64>,
}

impl UploadPipeline {
    pub fn new(content_length: Option<u64>, cached_fingerprint: Option<Vec<u8>>) -> Self {
        Self {
            buffer: VecDeque::new(),
            base_offset: 0,
            bytes_written: 0,
            last_reported: None,
            fingerprint: cached_fingerprint,
            fingerprint_validated: false,
            content_length,
        }
    }

    pub fn fingerprint_validated(&self) -> bool {
        self.fingerprint_validated
    }

    /// Absolute object offset below which buffered history has been released.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn fingerprint(&self) -> Option<&[u8]> {
        self.fingerprint.as_deref()
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.len()
    }

    pub fn chunk_at(&self, index: usize) -> Option<Bytes> {
        self.buffer.get(index).cloned()
    }

    /// Appends a freshly produced chunk to the replay buffer.
    pub fn push(&mut self, chunk: Bytes) {
        self.buffer.push_back(chunk);
    }

    /// Resets the attempt-local byte counter to the start of the replay
    /// buffer. Call before (re)streaming.
    pub fn begin_attempt(&mut self) {
        self.bytes_written = self.base_offset;
    }

    /// Runs one chunk through the §progress → fingerprint → offset-skip
    /// sequence against the server-acknowledged `offset`.
    pub fn process(&mut self, chunk: &Bytes, offset: u64) -> ProcessOutcome {
        let progress = if self.last_reported.map_or(true, |last| self.bytes_written > last) {
            self.last_reported = Some(self.bytes_written);
            Some(UploadProgress::new(self.bytes_written, self.content_length))
        } else {
            None
        };

        let mut captured_fingerprint = None;
        if self.bytes_written == 0 {
            let next = &chunk[..chunk.len().min(FIRST_CHUNK_FINGERPRINT_LEN)];
            match &self.fingerprint {
                None => {
                    self.fingerprint = Some(next.to_vec());
                    self.fingerprint_validated = true;
                    captured_fingerprint = self.fingerprint.clone();
                }
                Some(cached) => {
                    // Compare the shorter of the two prefixes; any differing
                    // byte means the caller is sending a different object.
                    let compared = cached.len().min(next.len());
                    if cached[..compared] != next[..compared] {
                        return ProcessOutcome {
                            disposition: ChunkDisposition::Drift,
                            progress,
                            captured_fingerprint: None,
                        };
                    }
                    self.fingerprint_validated = true;
                }
            }
        }

        let length = chunk.len() as u64;
        let skip = offset.saturating_sub(self.bytes_written).min(length);
        self.bytes_written += length;

        let disposition = if self.bytes_written > offset {
            ChunkDisposition::Forward(chunk.slice(skip as usize..))
        } else {
            ChunkDisposition::Skip
        };

        ProcessOutcome {
            disposition,
            progress,
            captured_fingerprint,
        }
    }

    /// Drops buffered chunks that lie entirely below the server-acknowledged
    /// offset; a partially acknowledged chunk stays and is trimmed by the
    /// offset skip on replay. A no-op until the fingerprint has been
    /// validated, since before that the acknowledged bytes may belong to a
    /// different object than the buffered ones.
    pub fn release(&mut self, acked: u64) {
        if !self.fingerprint_validated {
            return;
        }
        while let Some(front) = self.buffer.front() {
            let end = self.base_offset + front.len() as u64;
            if end <= acked {
                self.base_offset = end;
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prepares the pipeline for a full restart: the upload begins again at
    /// offset zero with a fresh fingerprint. Fails when acknowledged history
    /// has already been released, since the bytes below it cannot be
    /// replayed.
    pub fn reset_for_restart(&mut self) -> UploadResult<()> {
        if self.base_offset > 0 {
            return Err(internal_error(
                "cannot restart: buffered data below the acknowledged offset was already released",
            ));
        }
        self.fingerprint = None;
        self.fingerprint_validated = false;
        self.bytes_written = 0;
        self.last_reported = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_len(outcome: &ProcessOutcome) -> usize {
        match &outcome.disposition {
            ChunkDisposition::Forward(bytes) => bytes.len(),
            _ => 0,
        }
    }

    #[test]
    fn captures_fingerprint_on_first_chunk() {
        let mut pipeline = UploadPipeline::new(Some(100), None);
        pipeline.begin_attempt();

        let chunk = Bytes::from_static(b"hello resumable world");
        let outcome = pipeline.process(&chunk, 0);
        assert_eq!(
            outcome.captured_fingerprint.as_deref(),
            Some(&b"hello resumable "[..])
        );
        assert_eq!(forward_len(&outcome), chunk.len());
    }

    #[test]
    fn short_first_chunk_stores_short_fingerprint() {
        let mut pipeline = UploadPipeline::new(None, None);
        pipeline.begin_attempt();
        let outcome = pipeline.process(&Bytes::from_static(b"abc"), 0);
        assert_eq!(outcome.captured_fingerprint.as_deref(), Some(&b"abc"[..]));

        // A later attempt sending a longer chunk with the same prefix matches.
        let mut resumed = UploadPipeline::new(None, Some(b"abc".to_vec()));
        resumed.begin_attempt();
        let outcome = resumed.process(&Bytes::from_static(b"abcdef"), 0);
        assert_eq!(outcome.disposition, ChunkDisposition::Forward(Bytes::from_static(b"abcdef")));
    }

    #[test]
    fn detects_content_drift() {
        let mut pipeline = UploadPipeline::new(None, Some(b"original content".to_vec()));
        pipeline.push(Bytes::from_static(b"different bytes!"));
        pipeline.begin_attempt();

        let chunk = pipeline.chunk_at(0).unwrap();
        let outcome = pipeline.process(&chunk, 0);
        assert_eq!(outcome.disposition, ChunkDisposition::Drift);
        // The chunk stays buffered for the restart.
        assert_eq!(pipeline.buffered_chunks(), 1);

        pipeline.reset_for_restart().unwrap();
        pipeline.begin_attempt();
        let outcome = pipeline.process(&chunk, 0);
        assert!(matches!(outcome.disposition, ChunkDisposition::Forward(_)));
        assert_eq!(
            outcome.captured_fingerprint.as_deref(),
            Some(&b"different bytes!"[..])
        );
    }

    #[test]
    fn skips_acknowledged_prefix() {
        let mut pipeline = UploadPipeline::new(Some(30), None);
        pipeline.begin_attempt();

        // Entirely below the offset: nothing is forwarded.
        let outcome = pipeline.process(&Bytes::from_static(b"0123456789"), 15);
        assert_eq!(outcome.disposition, ChunkDisposition::Skip);

        // Straddling the offset: exactly bytes_written + len - offset emerge.
        let outcome = pipeline.process(&Bytes::from_static(b"0123456789"), 15);
        assert_eq!(forward_len(&outcome), 5);

        // Fully above: passes through untouched.
        let outcome = pipeline.process(&Bytes::from_static(b"0123456789"), 15);
        assert_eq!(forward_len(&outcome), 10);
    }

    #[test]
    fn progress_is_monotonic_across_replays() {
        let mut pipeline = UploadPipeline::new(Some(20), None);
        pipeline.push(Bytes::from_static(b"0123456789"));
        pipeline.push(Bytes::from_static(b"abcdefghij"));

        pipeline.begin_attempt();
        let first = pipeline.process(&pipeline.chunk_at(0).unwrap(), 0);
        let second = pipeline.process(&pipeline.chunk_at(1).unwrap(), 0);
        assert_eq!(first.progress.unwrap().bytes_written, 0);
        assert_eq!(second.progress.unwrap().bytes_written, 10);

        // Replay after a reconnect reports nothing until new ground is
        // covered.
        pipeline.begin_attempt();
        let first = pipeline.process(&pipeline.chunk_at(0).unwrap(), 10);
        let second = pipeline.process(&pipeline.chunk_at(1).unwrap(), 10);
        assert!(first.progress.is_none());
        assert!(second.progress.is_none());

        pipeline.push(Bytes::from_static(b"KLMNOPQRST"));
        let third = pipeline.process(&pipeline.chunk_at(2).unwrap(), 10);
        assert_eq!(third.progress.unwrap().bytes_written, 20);
    }

    #[test]
    fn releases_acknowledged_chunks() {
        let mut pipeline = UploadPipeline::new(None, None);
        pipeline.push(Bytes::from_static(b"0123456789"));
        pipeline.push(Bytes::from_static(b"abcdefghij"));
        pipeline.push(Bytes::from_static(b"KLMNOPQRST"));

        // Nothing may be released before the fingerprint is established.
        pipeline.release(15);
        assert_eq!(pipeline.buffered_chunks(), 3);

        pipeline.begin_attempt();
        pipeline.process(&pipeline.chunk_at(0).unwrap(), 0);
        assert!(pipeline.fingerprint_validated());

        // Acknowledgement mid-chunk keeps the straddling chunk.
        pipeline.release(15);
        assert_eq!(pipeline.buffered_chunks(), 2);

        pipeline.release(20);
        assert_eq!(pipeline.buffered_chunks(), 1);

        // Restarting after history was released is refused.
        assert!(pipeline.reset_for_restart().is_err());
    }
}
