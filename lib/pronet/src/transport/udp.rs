//! UDP transport. Best-effort send (no logical backpressure); can optionally be bound to a fixed
//! remote address at creation, or learn its peer from the first received datagram.

use crate::reactor::Interest;
use crate::recvpool::{LinearRecvPool, RecvPool};
use crate::transport::{SendOutcome, Transport};
use flux::shared::{ErrorType, NetworkError, NetworkResult};
use mio::net::UdpSocket;
use std::io;
use std::net::SocketAddr;

pub struct UdpTransport {
    socket: UdpSocket,
    local: Option<SocketAddr>,
    /// Default remote used when `send` is called without an explicit address, and the address a
    /// UDP client learns from its first inbound datagram if created without one.
    remote: Option<SocketAddr>,

    recv_pool: LinearRecvPool,
    last_sender: Option<SocketAddr>,

    recv_suspended: bool,
    send_requested: bool,
    /// One-way toggle: once set, `ECONNRESET` closes the transport instead of being ignored.
    conn_reset_as_error: bool,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket, remote: Option<SocketAddr>) -> UdpTransport {
        let local = socket.local_addr().ok();

        UdpTransport {
            socket,
            local,
            remote,
            recv_pool: LinearRecvPool::new(crate::recvpool::DEFAULT_CAPACITY),
            last_sender: None,
            recv_suspended: false,
            send_requested: false,
            conn_reset_as_error: false,
        }
    }

    pub fn udp_conn_reset_as_error(&mut self) {
        self.conn_reset_as_error = true;
    }

    /// Receive exactly one datagram into the recv pool, recording its sender. `ECONNRESET` is
    /// swallowed as a non-fatal retry unless `udp_conn_reset_as_error` has been called.
    pub fn receive(&mut self) -> NetworkResult<usize> {
        let socket = &self.socket;
        let mut sender = None;

        let result = self.recv_pool.ingress_datagram(|buf| match socket.recv_from(buf) {
            Ok((n, addr)) => {
                sender = Some(addr);
                Ok(n)
            }
            Err(err) => Err(err),
        });

        match result {
            Ok(n) => {
                self.last_sender = sender;
                if self.remote.is_none() {
                    self.remote = sender;
                }
                Ok(n)
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset && !self.conn_reset_as_error => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    pub fn recv_pool(&self) -> &LinearRecvPool {
        &self.recv_pool
    }

    pub fn recv_pool_mut(&mut self) -> &mut LinearRecvPool {
        &mut self.recv_pool
    }

    pub fn last_sender(&self) -> Option<SocketAddr> {
        self.last_sender
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, buf: &[u8], _action_id: u64, remote: Option<SocketAddr>) -> NetworkResult<SendOutcome> {
        let target = remote.or(self.remote).ok_or(NetworkError::Fatal(ErrorType::AddrParse))?;

        match self.socket.send_to(buf, target) {
            Ok(_) => Ok(SendOutcome::Ok),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::Busy),
            Err(err) => Err(err.into()),
        }
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
            writable: self.send_requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_transport_without_remote_learns_peer() {
        let socket = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let transport = UdpTransport::new(socket, None);
        assert!(transport.remote_addr().is_none());
    }

    #[test]
    fn test_interest_write_only_after_request() {
        let socket = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let mut transport = UdpTransport::new(socket, None);
        assert!(!transport.interest().writable);

        transport.request_on_send();
        assert!(transport.interest().writable);
    }
}
