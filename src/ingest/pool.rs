//! Packet buffer pool
//!
//! Fixed-size pool of reusable [`BytesMut`] buffers for the ingest worker.
//! Acquired buffers are filled, split off as immutable [`bytes::Bytes`] for
//! delivery, and the remainder recycled; `reserve` reclaims the retired
//! region once the downstream consumer has released it, so steady-state
//! ingest allocates nothing. On pool exhaustion acquisition falls back to a
//! fresh allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

pub struct PacketPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_free: usize,
    misses: AtomicU64,
}

impl PacketPool {
    /// Create a pool of `buffer_size`-byte buffers, pre-warmed with `warm`
    /// buffers and keeping at most `max_free` idle ones.
    pub fn new(buffer_size: usize, warm: usize, max_free: usize) -> Self {
        let warm = warm.min(max_free);
        let free = (0..warm)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        Self {
            free: Mutex::new(free),
            buffer_size,
            max_free,
            misses: AtomicU64::new(0),
        }
    }

    /// Take a buffer with at least the pool's buffer size available.
    pub fn acquire(&self) -> BytesMut {
        let mut buf = match self.free.lock().pop() {
            Some(buf) => buf,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::new()
            }
        };
        buf.reserve(self.buffer_size);
        buf
    }

    /// Return a buffer to the pool, or drop it when the pool is full.
    pub fn recycle(&self, buf: BytesMut) {
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buf);
        }
    }

    /// Acquisitions that missed the pool and allocated instead
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warm_buffers_are_reused() {
        let pool = PacketPool::new(4096, 2, 4);
        assert_eq!(pool.idle(), 2);

        let mut buf = pool.acquire();
        assert!(buf.capacity() >= 4096);
        assert_eq!(pool.idle(), 1);

        buf.extend_from_slice(b"datagram");
        let packet = buf.split().freeze();
        pool.recycle(buf);
        assert_eq!(pool.idle(), 2);
        assert_eq!(&packet[..], b"datagram");
        assert_eq!(pool.misses(), 0);
    }

    #[test]
    fn exhaustion_falls_back_to_allocation() {
        let pool = PacketPool::new(1024, 1, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.misses(), 1);
        assert!(b.capacity() >= 1024);
        pool.recycle(a);
        pool.recycle(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn pool_never_keeps_more_than_cap() {
        let pool = PacketPool::new(64, 0, 2);
        let bufs: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        for buf in bufs {
            pool.recycle(buf);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn reserve_reclaims_after_downstream_release() {
        let pool = PacketPool::new(512, 1, 1);
        let mut buf = pool.acquire();
        buf.extend_from_slice(&[7u8; 100]);
        let packet = buf.split().freeze();
        pool.recycle(buf);

        drop(packet);
        let buf = pool.acquire();
        assert!(buf.capacity() >= 512);
    }
}
