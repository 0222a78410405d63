//! Single-producer single-consumer byte queue.
//!
//! Models the interrupt-driven UART buffers on the arm microcontroller: one
//! side deposits bytes from an ISR, the other drains them from the main
//! loop. Capacity is a power of two (256) so index arithmetic reduces to a
//! mask. Head and tail are monotonically increasing counters; a slot is
//! only read after the head store that published it (Release/Acquire
//! pairing on the counters).

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Buffer capacity in bytes. Power of two.
pub const RING_SIZE: usize = 256;

/// Lock-free SPSC byte ring.
///
/// `put` may be called by one producer and `get` by one consumer
/// concurrently; `flush` belongs to the consumer side.
pub struct RingBuffer {
    data: [AtomicU8; RING_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl RingBuffer {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self {
            data: [0u8; RING_SIZE].map(AtomicU8::new),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Append one byte. Returns `false` when the ring is full.
    pub fn put(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= RING_SIZE {
            return false;
        }
        self.data[head & (RING_SIZE - 1)].store(byte, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Remove and return the oldest byte, if any.
    pub fn get(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let byte = self.data[tail & (RING_SIZE - 1)].load(Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// Number of bytes ready to read.
    pub fn available(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Discard all buffered bytes.
    pub fn flush(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }

    /// Drain everything currently buffered into a vector.
    pub fn drain(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.available());
        while let Some(b) = self.get() {
            out.push(b);
        }
        out
    }

    /// Append a slice; returns how many bytes fit.
    pub fn put_all(&self, bytes: &[u8]) -> usize {
        bytes.iter().take_while(|&&b| self.put(b)).count()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_get_order() {
        let ring = RingBuffer::new();
        assert!(ring.put(1));
        assert!(ring.put(2));
        assert!(ring.put(3));
        assert_eq!(ring.available(), 3);
        assert_eq!(ring.get(), Some(1));
        assert_eq!(ring.get(), Some(2));
        assert_eq!(ring.get(), Some(3));
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn test_full_ring_rejects() {
        let ring = RingBuffer::new();
        for i in 0..RING_SIZE {
            assert!(ring.put(i as u8));
        }
        assert!(!ring.put(0xAA));
        assert_eq!(ring.get(), Some(0));
        assert!(ring.put(0xAA));
    }

    #[test]
    fn test_flush_empties() {
        let ring = RingBuffer::new();
        ring.put_all(&[1, 2, 3, 4]);
        ring.flush();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn test_wraparound() {
        let ring = RingBuffer::new();
        for round in 0..4 {
            for i in 0..200u8 {
                assert!(ring.put(i.wrapping_add(round)));
            }
            for i in 0..200u8 {
                assert_eq!(ring.get(), Some(i.wrapping_add(round)));
            }
        }
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let ring = Arc::new(RingBuffer::new());
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for i in 0..10_000u32 {
                    while !ring.put(i as u8) {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some(b) = ring.get() {
                assert_eq!(b, expected as u8);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
