//! Pooled Segmented Buffers for Allocation-Free Message Payloads
//!
//! ## Purpose
//!
//! Every message payload lives in a [`PooledBuffer`]: a growable byte store made
//! of fixed-size segments. Buffers are rented from a [`BufferPool`] and go back
//! to it when dropped, so once a channel reaches steady state no payload causes
//! a heap allocation.
//!
//! ## Architecture Role
//!
//! ```text
//! Serializer → [PooledBuffer] → Outgoing Queue → Socket Write
//!                   ↑                                  │
//!              BufferPool ←──────── drop ──────────────┘
//! ```
//!
//! ## Ownership
//!
//! A buffer has exactly one owner at a time. Passing a `Message` across a queue
//! moves the buffer with it; dropping the last owner resets the buffer and
//! hands its segments back to the pool. Move semantics make double returns and
//! use-after-return impossible, so the pool only has to guard against being
//! handed a dirty buffer, which is treated as a defect and panics.

use parking_lot::Mutex;
use std::cmp::min;
use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default segment size, sized for typical small messages
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;

/// Default number of idle buffers a pool keeps around
pub const DEFAULT_MAX_RETAINED: usize = 1024;

/// Segments a buffer keeps across a reset; anything beyond is freed
const RETAINED_SEGMENTS_PER_BUFFER: usize = 16;

/// Backing storage shared between a live buffer and the pool's free list
#[derive(Default)]
struct Storage {
    segments: Vec<Box<[u8]>>,
    len: usize,
    position: usize,
}

impl Storage {
    fn is_clean(&self) -> bool {
        self.len == 0 && self.position == 0
    }

    fn reset(&mut self) {
        self.len = 0;
        self.position = 0;
        self.segments.truncate(RETAINED_SEGMENTS_PER_BUFFER);
    }

    /// Writable tail of the segment that holds `len`, allocating it if needed
    fn spare_mut(&mut self, segment_size: usize) -> &mut [u8] {
        let index = self.len / segment_size;
        let offset = self.len % segment_size;
        if index == self.segments.len() {
            self.segments.push(vec![0u8; segment_size].into_boxed_slice());
        }
        &mut self.segments[index][offset..]
    }

    fn write(&mut self, mut data: &[u8], segment_size: usize) {
        while !data.is_empty() {
            let spare = self.spare_mut(segment_size);
            let n = min(spare.len(), data.len());
            spare[..n].copy_from_slice(&data[..n]);
            self.len += n;
            data = &data[n..];
        }
    }

    fn read(&mut self, out: &mut [u8], segment_size: usize) -> usize {
        let mut copied = 0;
        while copied < out.len() && self.position < self.len {
            let index = self.position / segment_size;
            let offset = self.position % segment_size;
            let available = min(segment_size - offset, self.len - self.position);
            let n = min(available, out.len() - copied);
            out[copied..copied + n].copy_from_slice(&self.segments[index][offset..offset + n]);
            self.position += n;
            copied += n;
        }
        copied
    }
}

struct PoolInner {
    segment_size: usize,
    max_retained: usize,
    idle: Mutex<Vec<Storage>>,
    rented: AtomicU64,
    returned: AtomicU64,
    allocated: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn give_back(&self, mut storage: Storage) {
        storage.reset();
        self.returned.fetch_add(1, Ordering::Relaxed);

        let mut idle = self.idle.lock();
        if idle.len() < self.max_retained {
            idle.push(storage);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Pool of reusable payload buffers
///
/// Cloning the pool clones a handle; all clones share one free list. Pools are
/// created explicitly and passed to whoever rents from them, typically one
/// per hub.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub segment_size: usize,
    pub max_retained: usize,
    pub idle: usize,
    pub rented: u64,
    pub returned: u64,
    pub allocated: u64,
    pub discarded: u64,
}

impl PoolStats {
    /// Buffers currently held outside the pool
    pub fn outstanding(&self) -> u64 {
        self.rented.saturating_sub(self.returned)
    }
}

impl BufferPool {
    /// Create a pool with the given segment size and idle buffer cap
    pub fn new(segment_size: usize, max_retained: usize) -> Self {
        assert!(segment_size > 0, "buffer segment size must be non-zero");
        Self {
            inner: Arc::new(PoolInner {
                segment_size,
                max_retained,
                idle: Mutex::new(Vec::new()),
                rented: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Rent an empty buffer, reusing an idle one when available
    pub fn rent(&self) -> PooledBuffer {
        let storage = match self.inner.idle.lock().pop() {
            Some(storage) => storage,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Storage::default()
            }
        };
        assert!(
            storage.is_clean(),
            "rented a pooled buffer that was not reset (len {}, position {})",
            storage.len,
            storage.position
        );
        self.inner.rented.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            storage,
            segment_size: self.inner.segment_size,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.inner.segment_size
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            segment_size: self.inner.segment_size,
            max_retained: self.inner.max_retained,
            idle: self.inner.idle.lock().len(),
            rented: self.inner.rented.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_SIZE, DEFAULT_MAX_RETAINED)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Segmented byte buffer with a write length and an independent read cursor
///
/// Single writer, single reader. Writes append at `len`; reads consume from
/// `position`. Dropping the buffer returns it to the pool it was rented from.
pub struct PooledBuffer {
    storage: Storage,
    segment_size: usize,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// Create a buffer that is not tied to any pool
    pub fn unpooled(segment_size: usize) -> Self {
        assert!(segment_size > 0, "buffer segment size must be non-zero");
        Self {
            storage: Storage::default(),
            segment_size,
            pool: None,
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.storage.len
    }

    pub fn is_empty(&self) -> bool {
        self.storage.len == 0
    }

    /// Bytes consumed by reads so far
    pub fn position(&self) -> usize {
        self.storage.position
    }

    /// Bytes written but not yet read
    pub fn remaining(&self) -> usize {
        self.storage.len - self.storage.position
    }

    /// Allocated bytes across all segments
    pub fn capacity(&self) -> usize {
        self.storage.segments.len() * self.segment_size
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Append bytes, growing the segment list as needed
    pub fn write_slice(&mut self, data: &[u8]) {
        self.storage.write(data, self.segment_size);
    }

    /// Copy unread bytes into `out`; returns 0 once drained
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        self.storage.read(out, self.segment_size)
    }

    /// Read at most `count` bytes from `reader` straight into segment memory
    ///
    /// Performs a single read, so the result may be shorter than `count`.
    /// Returns 0 when `count` is 0 or the reader is at end of stream.
    pub async fn write_from<R>(&mut self, reader: &mut R, count: usize) -> io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if count == 0 {
            return Ok(0);
        }
        let spare = self.storage.spare_mut(self.segment_size);
        let limit = min(spare.len(), count);
        let read = reader.read(&mut spare[..limit]).await?;
        self.storage.len += read;
        Ok(read)
    }

    /// Loop [`write_from`](Self::write_from) until exactly `count` bytes arrived
    pub async fn write_from_exact<R>(&mut self, reader: &mut R, count: usize) -> io::Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut remaining = count;
        while remaining > 0 {
            let read = self.write_from(reader, remaining).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended with {} of {} bytes outstanding", remaining, count),
                ));
            }
            remaining -= read;
        }
        Ok(())
    }

    /// Write the unread bytes to `writer` segment by segment without consuming them
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        for chunk in self.chunks() {
            writer.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Unread bytes as a sequence of segment slices
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let segment_size = self.segment_size;
        let mut cursor = self.storage.position;
        let end = self.storage.len;
        std::iter::from_fn(move || {
            if cursor >= end {
                return None;
            }
            let index = cursor / segment_size;
            let offset = cursor % segment_size;
            let n = min(segment_size - offset, end - cursor);
            cursor += n;
            Some(&self.storage.segments[index][offset..offset + n])
        })
    }

    /// Copy the unread bytes out (allocates; meant for tests and diagnostics)
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Return to the empty state required before pool return
    pub fn reset(&mut self) {
        self.storage.reset();
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(mem::take(&mut self.storage));
        }
    }
}

impl io::Write for PooledBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for PooledBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf))
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.storage.len)
            .field("position", &self.storage.position)
            .field("segments", &self.storage.segments.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_across_segment_boundaries() {
        let pool = BufferPool::new(16, 8);
        for size in [0usize, 1, 15, 16, 17, 256, 64 * 1024 + 3] {
            let data = pattern(size);
            let mut buffer = pool.rent();
            buffer.write_slice(&data);
            assert_eq!(buffer.len(), size);

            let mut out = vec![0u8; size];
            assert_eq!(buffer.read_into(&mut out), size);
            assert_eq!(out, data, "mismatch for {} bytes", size);
            assert_eq!(buffer.position(), size);

            let mut extra = [0u8; 8];
            assert_eq!(buffer.read_into(&mut extra), 0);
        }
    }

    #[test]
    fn test_small_reads_preserve_order() {
        let mut buffer = PooledBuffer::unpooled(16);
        let data = pattern(100);
        buffer.write_slice(&data[..40]);
        buffer.write_slice(&data[40..]);

        let mut collected = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = buffer.read_into(&mut chunk);
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(collected, data);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_drop_returns_buffer_to_pool() {
        let pool = BufferPool::new(16, 8);
        {
            let mut buffer = pool.rent();
            buffer.write_slice(&pattern(40));
        }
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.outstanding(), 0);

        // Reuse must not allocate and must come back clean
        let buffer = pool.rent();
        assert!(buffer.is_empty());
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.capacity(), 48);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_pool_caps_idle_buffers() {
        let pool = BufferPool::new(16, 2);
        let rented: Vec<_> = (0..5).map(|_| pool.rent()).collect();
        drop(rented);

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.discarded, 3);
        assert_eq!(stats.returned, 5);
    }

    #[test]
    fn test_reset_trims_segments() {
        let mut buffer = PooledBuffer::unpooled(16);
        buffer.write_slice(&pattern(16 * 40));
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 16 * RETAINED_SEGMENTS_PER_BUFFER);
    }

    #[test]
    fn test_chunks_skip_consumed_prefix() {
        let mut buffer = PooledBuffer::unpooled(16);
        buffer.write_slice(&pattern(40));
        let mut skip = [0u8; 10];
        buffer.read_into(&mut skip);

        let lengths: Vec<usize> = buffer.chunks().map(|c| c.len()).collect();
        assert_eq!(lengths, vec![6, 16, 8]);
        assert_eq!(buffer.to_vec(), pattern(40)[10..].to_vec());
    }

    #[tokio::test]
    async fn test_write_from_stops_at_segment_end() {
        let data = pattern(50);
        let mut reader: &[u8] = &data;
        let mut buffer = PooledBuffer::unpooled(16);

        let first = buffer.write_from(&mut reader, 50).await.unwrap();
        assert_eq!(first, 16);

        buffer.write_from_exact(&mut reader, 34).await.unwrap();
        assert_eq!(buffer.len(), 50);
        assert_eq!(buffer.to_vec(), data);
    }

    #[tokio::test]
    async fn test_write_from_exact_reports_truncation() {
        let data = pattern(10);
        let mut reader: &[u8] = &data;
        let mut buffer = PooledBuffer::unpooled(16);

        let err = buffer.write_from_exact(&mut reader, 20).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_write_to_emits_unread_bytes() {
        let mut buffer = PooledBuffer::unpooled(16);
        buffer.write_slice(&pattern(33));

        let mut sink = Vec::new();
        buffer.write_to(&mut sink).await.unwrap();
        assert_eq!(sink, pattern(33));
        // Writing out does not consume
        assert_eq!(buffer.remaining(), 33);
    }
}
