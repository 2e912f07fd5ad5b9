//! TCP transport. Holds at most one in-flight logical send (`Busy` while the write buffer still
//! has unsent bytes); the caller is expected to buffer and retry after `OnSend`.

use crate::buffer::Buffer;
use crate::reactor::Interest;
use crate::recvpool::{RecvPool, RingRecvPool};
use crate::transport::{SendOutcome, Transport};
use flux::shared::{ErrorUtils, NetworkError, NetworkResult};
use mio::net::TcpStream;
use std::net::SocketAddr;

const WRITE_BUF_SIZE: usize = 8 * 65536;
const READ_POOL_SIZE: usize = 65536;

pub struct TcpTransport {
    stream: TcpStream,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,

    recv_pool: RingRecvPool,
    write_buffer: Buffer,

    recv_suspended: bool,
    send_requested: bool,
    pending_action_id: Option<u64>,
    completed_action_id: Option<u64>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> TcpTransport {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();

        TcpTransport {
            stream,
            local,
            remote,
            recv_pool: RingRecvPool::new(READ_POOL_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            recv_suspended: false,
            send_requested: false,
            pending_action_id: None,
            completed_action_id: None,
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Pull any available bytes off the socket into the recv pool. Returns the number of bytes
    /// read; `Ok(0)` means no data was available (would-block), not EOF.
    pub fn receive(&mut self) -> NetworkResult<usize> {
        self.recv_pool.ingress(&self.stream).map_err(Into::into)
    }

    pub fn recv_pool(&self) -> &RingRecvPool {
        &self.recv_pool
    }

    pub fn recv_pool_mut(&mut self) -> &mut RingRecvPool {
        &mut self.recv_pool
    }

    /// Drain the write buffer to the socket, clearing the busy state once empty.
    pub fn flush(&mut self) -> NetworkResult<usize> {
        let result = self.write_buffer.egress(&mut self.stream);

        if self.write_buffer.is_empty() {
            if let Some(action_id) = self.pending_action_id.take() {
                self.completed_action_id = Some(action_id);
            }
        }

        result.map_err(Into::into)
    }

    pub fn is_busy(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Take the `action_id` of the send that most recently drained, if any drained since the
    /// last call. The session/transport-observer loop polls this after each `flush` to decide
    /// whether to fire `OnSend`.
    pub fn take_completed_action_id(&mut self) -> Option<u64> {
        self.completed_action_id.take()
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, buf: &[u8], action_id: u64, _remote: Option<SocketAddr>) -> NetworkResult<SendOutcome> {
        if self.is_busy() {
            return Ok(SendOutcome::Busy);
        }

        if buf.len() > self.write_buffer.free_capacity() {
            return Ok(SendOutcome::Busy);
        }

        self.write_buffer.write_slice()[..buf.len()].copy_from_slice(buf);
        self.write_buffer.move_tail(buf.len());
        self.pending_action_id = Some(action_id);

        let result = self.flush();
        if result.has_failed() {
            return Err(result.unwrap_err());
        }

        Ok(if self.is_busy() { SendOutcome::Busy } else { SendOutcome::Ok })
    }

    fn request_on_send(&mut self) {
        self.send_requested = true;
    }

    fn suspend_recv(&mut self) {
        self.recv_suspended = true;
    }

    fn resume_recv(&mut self) {
        self.recv_suspended = false;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn interest(&self) -> Interest {
        Interest {
            readable: !self.recv_suspended,
            writable: self.is_busy() || self.send_requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_reflects_suspend_and_backpressure() {
        // Can't easily build a real TcpTransport without a live socket in a unit test; the
        // interest computation itself is exercised via the write_buffer/flag state directly
        // through the public `Transport` surface in integration-style session tests instead.
        assert_eq!(
            Interest {
                readable: true,
                writable: false
            },
            Interest::READ
        );
    }
}
