//! Chunk manager: split the source into frame-sized ranges, accumulate received chunks, reassemble.

use bytes::{Bytes, BytesMut};

use crate::integrity;
use crate::protocol::FileInfo;

/// Default chunk size in bytes. Stays under the 16 KiB message size that
/// browser data channels deliver reliably.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024; // 16 KiB

/// Byte range `[start, end)` of one binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn byte_len(&self) -> u64 {
        self.end - self.start
    }
}

/// Next range to send from `offset`, or `None` once `offset` reaches `total_len`.
/// A zero `chunk_size` falls back to the default.
pub fn next_chunk(offset: u64, total_len: u64, chunk_size: usize) -> Option<ChunkRange> {
    if offset >= total_len {
        return None;
    }
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    } as u64;
    Some(ChunkRange {
        start: offset,
        end: offset.saturating_add(size).min(total_len),
    })
}

/// The reassembled file, tagged with its metadata (and so its MIME type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub info: FileInfo,
    pub bytes: Bytes,
}

impl Artifact {
    pub fn mime_type(&self) -> &str {
        &self.info.mime_type
    }

    /// SHA-256 of the content, hex encoded.
    pub fn sha256_hex(&self) -> String {
        integrity::digest_hex(&self.bytes)
    }
}

/// A chunk would push the total past the announced file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("received {received} bytes but file size is {expected}")]
pub struct OverflowError {
    pub received: u64,
    pub expected: u64,
}

/// Downloader-side accumulator. Ordering comes from the channel, so chunks are appended as they arrive.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    expected: u64,
    chunks: Vec<Bytes>,
    received: u64,
    final_seen: bool,
}

impl ReceiveBuffer {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    /// Append a chunk. Returns the running total, or an error (and leaves the buffer untouched)
    /// if the chunk overruns the expected size.
    pub fn push(&mut self, chunk: Bytes) -> Result<u64, OverflowError> {
        let total = self.received.saturating_add(chunk.len() as u64);
        if total > self.expected {
            return Err(OverflowError {
                received: total,
                expected: self.expected,
            });
        }
        self.received = total;
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
        Ok(total)
    }

    /// Record that the sender announced the last chunk.
    pub fn mark_final(&mut self) {
        self.final_seen = true;
    }

    pub fn final_seen(&self) -> bool {
        self.final_seen
    }

    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Both signals hold: final flag observed and every byte present.
    pub fn is_complete(&self) -> bool {
        self.final_seen && self.received == self.expected
    }

    /// Concatenate chunks in arrival order. Call only when `is_complete()`.
    pub fn reassemble(self, info: FileInfo) -> Artifact {
        let bytes = match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.into_iter().next().unwrap_or_default(),
            _ => {
                let mut out = BytesMut::with_capacity(self.received as usize);
                for chunk in &self.chunks {
                    out.extend_from_slice(chunk);
                }
                out.freeze()
            }
        };
        Artifact { info, bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(size: u64) -> FileInfo {
        FileInfo {
            name: "char.charx".into(),
            size,
            mime_type: "application/zip".into(),
        }
    }

    fn split_into_chunks(offset: u64, total_len: u64, chunk_size: usize) -> Vec<ChunkRange> {
        let mut out = Vec::new();
        let mut cursor = offset;
        while let Some(range) = next_chunk(cursor, total_len, chunk_size) {
            cursor = range.end;
            out.push(range);
        }
        out
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(0, 100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkRange { start: 0, end: 30 });
        assert_eq!(chunks[3], ChunkRange { start: 90, end: 100 });
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(0, 90, 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end, 90);
    }

    #[test]
    fn split_from_offset() {
        let chunks = split_into_chunks(50, 100, 30);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start, 50);
        assert_eq!(chunks[1], ChunkRange { start: 80, end: 100 });
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(0, 0, 30).is_empty());
        assert_eq!(next_chunk(0, 0, 30), None);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks = split_into_chunks(0, DEFAULT_CHUNK_SIZE as u64 * 2, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].byte_len(), DEFAULT_CHUNK_SIZE as u64);
    }

    #[test]
    fn buffer_reassembles_in_order() {
        let mut buf = ReceiveBuffer::new(100);
        let data: Vec<u8> = (0..100).map(|i| i as u8).collect();
        for range in split_into_chunks(0, 100, 30) {
            let chunk = Bytes::copy_from_slice(&data[range.start as usize..range.end as usize]);
            buf.push(chunk).unwrap();
        }
        assert!(!buf.is_complete(), "final flag not seen yet");
        buf.mark_final();
        assert!(buf.is_complete());
        let artifact = buf.reassemble(info(100));
        assert_eq!(artifact.bytes.as_ref(), data.as_slice());
        assert_eq!(artifact.mime_type(), "application/zip");
    }

    #[test]
    fn final_before_last_bytes_is_not_complete() {
        let mut buf = ReceiveBuffer::new(10);
        buf.push(Bytes::from_static(&[1; 6])).unwrap();
        buf.mark_final();
        assert!(!buf.is_complete());
        buf.push(Bytes::from_static(&[2; 4])).unwrap();
        assert!(buf.is_complete());
    }

    #[test]
    fn overflow_is_rejected_without_mutation() {
        let mut buf = ReceiveBuffer::new(10);
        buf.push(Bytes::from_static(&[0; 8])).unwrap();
        let err = buf.push(Bytes::from_static(&[0; 3])).unwrap_err();
        assert_eq!(
            err,
            OverflowError {
                received: 11,
                expected: 10
            }
        );
        assert_eq!(buf.bytes_received(), 8);
    }

    #[test]
    fn empty_file_completes_on_final() {
        let mut buf = ReceiveBuffer::new(0);
        buf.mark_final();
        assert!(buf.is_complete());
        assert!(buf.reassemble(info(0)).bytes.is_empty());
    }
}
