//! Receive pools sit between a socket and a transport's frame parser. Two variants share the
//! same surface: a ring pool tolerates partial frames across successive reads (TCP/TLS); a
//! linear pool holds exactly one datagram that must be drained in a single call (UDP/multicast).

use crate::buffer::Buffer;
use std::io;

pub const DEFAULT_CAPACITY: usize = 64 * 1024 + 1024;

/// Common recv-pool contract. If the reactor reports readability and `free_size() == 0`, the
/// caller must close the socket with an error rather than attempt another read.
pub trait RecvPool {
    /// Pull as much data as is available from `source` into the pool.
    fn ingress<R: io::Read>(&mut self, source: R) -> io::Result<usize>;

    /// Number of contiguous readable bytes currently available to `peek_into`.
    fn peek_size(&self) -> usize;

    /// A view of the readable bytes.
    fn peek_into(&self) -> &[u8];

    /// Advance the read position past `n` bytes, for example after a frame has been parsed.
    fn flush(&mut self, n: usize);

    /// Remaining free capacity for the next `ingress` call.
    fn free_size(&self) -> usize;
}

/// Ring recv pool for stream transports (TCP/TLS). Bytes not yet consumed by the frame parser
/// stay in the ring across reads, so a frame split across two `OnRecv` calls reassembles
/// correctly.
pub struct RingRecvPool {
    buffer: Buffer,
}

impl RingRecvPool {
    pub fn new(capacity: usize) -> RingRecvPool {
        RingRecvPool {
            buffer: Buffer::new(capacity),
        }
    }
}

impl RecvPool for RingRecvPool {
    fn ingress<R: io::Read>(&mut self, source: R) -> io::Result<usize> {
        match self.buffer.ingress(source) {
            Ok(n) => Ok(n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn peek_size(&self) -> usize {
        self.buffer.len()
    }

    fn peek_into(&self) -> &[u8] {
        self.buffer.read_slice()
    }

    fn flush(&mut self, n: usize) {
        self.buffer.move_head(n);
    }

    fn free_size(&self) -> usize {
        self.buffer.free_capacity()
    }
}

/// Linear recv pool for datagram transports (UDP/multicast). A single `recvfrom` fills the pool
/// from offset 0; the caller must fully drain (`flush` the whole `peek_size`) before the next
/// datagram overwrites it.
pub struct LinearRecvPool {
    data: Vec<u8>,
    filled: usize,
    capacity: usize,
}

impl LinearRecvPool {
    pub fn new(capacity: usize) -> LinearRecvPool {
        LinearRecvPool {
            data: vec![0u8; capacity],
            filled: 0,
            capacity,
        }
    }

    /// Fill the pool with exactly one datagram read via `recv_fn`, which must behave like
    /// `UdpSocket::recv` (returning the number of bytes written into the supplied slice).
    pub fn ingress_datagram<F>(&mut self, recv_fn: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let n = recv_fn(&mut self.data[..])?;
        self.filled = n;
        Ok(n)
    }
}

impl RecvPool for LinearRecvPool {
    fn ingress<R: io::Read>(&mut self, mut source: R) -> io::Result<usize> {
        let n = source.read(&mut self.data[..])?;
        self.filled = n;
        Ok(n)
    }

    fn peek_size(&self) -> usize {
        self.filled
    }

    fn peek_into(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    fn flush(&mut self, n: usize) {
        // A linear pool holds one datagram; any partial flush discards the rest, since the next
        // datagram always starts back at offset 0.
        debug_assert!(n <= self.filled);
        self.filled = 0;
    }

    fn free_size(&self) -> usize {
        self.capacity - self.filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ring_roundtrip() {
        let mut pool = RingRecvPool::new(65536);
        let mut source = Cursor::new(vec![1u8, 2, 3, 4, 5]);

        pool.ingress(&mut source).unwrap();
        assert_eq!(pool.peek_size(), 5);
        assert_eq!(pool.peek_into(), &[1, 2, 3, 4, 5]);

        pool.flush(2);
        assert_eq!(pool.peek_size(), 3);
        assert_eq!(pool.peek_into(), &[3, 4, 5]);
    }

    #[test]
    fn test_linear_pool_one_shot_drain() {
        let mut pool = LinearRecvPool::new(DEFAULT_CAPACITY);
        let before_free = pool.free_size();

        pool.ingress_datagram(|buf| {
            buf[..3].copy_from_slice(&[9, 8, 7]);
            Ok(3)
        })
        .unwrap();

        assert_eq!(pool.peek_size(), 3);
        assert_eq!(pool.peek_into(), &[9, 8, 7]);

        pool.flush(3);
        assert_eq!(pool.peek_size(), 0);
        assert_eq!(pool.free_size(), before_free);
    }
}
