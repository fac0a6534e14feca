//! Body buffering for encapsulated payloads.
//!
//! Two shapes, matched to how each direction is inspected:
//!
//! | Buffer | Used for | Memory behavior |
//! |---|---|---|
//! | [`BoundedBuffer`] | response scan window | caps at `max_scan_buffer`, keeps a rolling tail |
//! | [`SpillBuffer`] | bit-exact pass-through | in memory up to a threshold, then a temp file |
//!
//! The bounded buffer deliberately drops middle bytes of oversized
//! payloads: the head plus a rolling tail is what gets scanned, while the
//! spill buffer retains the exact bytes for forwarding.

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::LimitsConfig;
use crate::error::{Result, TollgateError};

/// Capped head plus rolling tail, for scanning oversized bodies.
pub struct BoundedBuffer {
    head: Vec<u8>,
    tail: Vec<u8>,
    cap: usize,
    tail_cap: usize,
    total: u64,
}

impl BoundedBuffer {
    pub fn new(limits: &LimitsConfig) -> Self {
        BoundedBuffer {
            head: Vec::new(),
            tail: Vec::new(),
            cap: limits.max_scan_buffer,
            tail_cap: limits.tail_buffer,
            total: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.total += data.len() as u64;
        let room = self.cap.saturating_sub(self.head.len());
        let take = room.min(data.len());
        self.head.extend_from_slice(&data[..take]);
        let rest = &data[take..];
        if rest.is_empty() {
            return;
        }
        if rest.len() >= self.tail_cap {
            self.tail.clear();
            self.tail
                .extend_from_slice(&rest[rest.len() - self.tail_cap..]);
        } else {
            let overflow = (self.tail.len() + rest.len()).saturating_sub(self.tail_cap);
            self.tail.drain(..overflow);
            self.tail.extend_from_slice(rest);
        }
    }

    /// Total bytes seen, including any dropped from the middle.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// True when the payload exceeded the cap and the window is partial.
    pub fn truncated(&self) -> bool {
        self.total > self.cap as u64
    }

    /// The bytes available for scanning: the head, plus the rolling tail
    /// when the payload overflowed.
    pub fn window(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.head.len() + self.tail.len());
        out.extend_from_slice(&self.head);
        out.extend_from_slice(&self.tail);
        out
    }

    /// Length of the head portion of the window. Everything past it is
    /// the rolling tail.
    pub fn head_len(&self) -> usize {
        self.head.len()
    }
}

/// Threshold past which a pass-through body moves from memory to disk.
const SPILL_THRESHOLD: usize = 256 * 1024;

/// Full-fidelity body buffer: memory-backed for typical payloads, temp
/// file past the threshold. The forwarded bytes are always exactly what
/// was received.
pub struct SpillBuffer {
    mem: Vec<u8>,
    mem_pos: usize,
    file: Option<File>,
    len: u64,
    threshold: usize,
}

impl SpillBuffer {
    pub fn new() -> Self {
        Self::with_threshold(SPILL_THRESHOLD)
    }

    fn with_threshold(threshold: usize) -> Self {
        SpillBuffer {
            mem: Vec::new(),
            mem_pos: 0,
            file: None,
            len: 0,
            threshold,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn push(&mut self, data: &[u8]) -> Result<()> {
        self.len += data.len() as u64;
        if self.file.is_none() && self.mem.len() + data.len() <= self.threshold {
            self.mem.extend_from_slice(data);
            return Ok(());
        }
        if self.file.is_none() {
            let std_file = tempfile::tempfile().map_err(TollgateError::Io)?;
            let mut file = File::from_std(std_file);
            file.write_all(&self.mem).await.map_err(TollgateError::Io)?;
            self.mem = Vec::new();
            self.file = Some(file);
        }
        let file = self.file.as_mut().ok_or_else(|| {
            TollgateError::Protocol("spill file missing".to_string())
        })?;
        file.write_all(data).await.map_err(TollgateError::Io)?;
        Ok(())
    }

    /// Position the read cursor. Later `read_block` calls return bytes
    /// from this offset onward.
    pub async fn seek_to(&mut self, pos: u64) -> Result<()> {
        match self.file.as_mut() {
            None => {
                self.mem_pos = pos.min(self.mem.len() as u64) as usize;
            }
            Some(file) => {
                file.flush().await.map_err(TollgateError::Io)?;
                file.seek(std::io::SeekFrom::Start(pos))
                    .await
                    .map_err(TollgateError::Io)?;
            }
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the cursor; `Ok(0)` at the end.
    pub async fn read_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.as_mut() {
            None => {
                let n = (self.mem.len() - self.mem_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.mem[self.mem_pos..self.mem_pos + n]);
                self.mem_pos += n;
                Ok(n)
            }
            Some(file) => file.read(buf).await.map_err(TollgateError::Io),
        }
    }

    /// Read the whole buffer back as contiguous bytes.
    #[cfg(test)]
    async fn contents(&mut self) -> Result<Vec<u8>> {
        self.seek_to(0).await?;
        let mut out = Vec::with_capacity(self.len as usize);
        let mut block = vec![0u8; 4096];
        loop {
            let n = self.read_block(&mut block).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&block[..n]);
        }
    }
}

impl Default for SpillBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(cap: usize, tail: usize) -> LimitsConfig {
        LimitsConfig {
            max_scan_buffer: cap,
            tail_buffer: tail,
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn small_payload_is_kept_whole() {
        let mut buf = BoundedBuffer::new(&limits(64, 8));
        buf.push(b"hello");
        buf.push(b" world");
        assert!(!buf.truncated());
        assert_eq!(buf.window(), b"hello world");
        assert_eq!(buf.total(), 11);
    }

    #[test]
    fn oversized_payload_keeps_head_and_tail() {
        let mut buf = BoundedBuffer::new(&limits(8, 4));
        buf.push(b"AAAAAAAA");
        buf.push(b"BBBBBBBB");
        buf.push(b"TAIL");
        assert!(buf.truncated());
        assert_eq!(buf.total(), 20);
        // Head is the first 8 bytes, tail the last 4.
        assert_eq!(buf.window(), b"AAAAAAAATAIL");
    }

    #[test]
    fn single_push_larger_than_both_caps() {
        let mut buf = BoundedBuffer::new(&limits(4, 4));
        buf.push(b"0123456789");
        assert_eq!(buf.window(), b"01236789");
    }

    #[test]
    fn tail_slides_across_pushes() {
        let mut buf = BoundedBuffer::new(&limits(2, 4));
        for chunk in [b"ab".as_ref(), b"cd", b"ef", b"gh"] {
            buf.push(chunk);
        }
        assert_eq!(buf.window(), b"abefgh");
    }

    #[tokio::test]
    async fn spill_buffer_stays_in_memory_below_threshold() {
        let mut buf = SpillBuffer::with_threshold(1024);
        buf.push(b"hello").await.unwrap();
        buf.push(b" world").await.unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.contents().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn spill_buffer_round_trips_through_disk() {
        let mut buf = SpillBuffer::with_threshold(8);
        let payload: Vec<u8> = (0..100u8).cycle().take(5000).collect();
        for chunk in payload.chunks(17) {
            buf.push(chunk).await.unwrap();
        }
        assert_eq!(buf.len(), 5000);
        assert_eq!(buf.contents().await.unwrap(), payload);
        // Reading twice returns the same bytes.
        assert_eq!(buf.contents().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn spill_buffer_reads_blocks_from_an_offset() {
        let mut buf = SpillBuffer::with_threshold(8);
        let payload: Vec<u8> = (0..251u8).cycle().take(5000).collect();
        buf.push(&payload).await.unwrap();

        buf.seek_to(4000).await.unwrap();
        let mut got = Vec::new();
        let mut block = [0u8; 100];
        loop {
            let n = buf.read_block(&mut block).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&block[..n]);
        }
        assert_eq!(got, &payload[4000..]);
    }

    #[tokio::test]
    async fn empty_spill_buffer() {
        let mut buf = SpillBuffer::new();
        assert!(buf.is_empty());
        assert!(buf.contents().await.unwrap().is_empty());
    }
}
