//! Multicast transport. A thin wrapper over a UDP socket that has joined a group; sends always
//! target the group address rather than a per-call remote.

use crate::reactor::Interest;
use crate::recvpool::LinearRecvPool;
use crate::socket;
use crate::transport::udp::UdpTransport;
use crate::transport::{SendOutcome, Transport};
use flux::shared::NetworkResult;
use mio::net::UdpSocket;
use std::net::{Ipv4Addr, SocketAddr};

pub struct McastTransport {
    inner: UdpTransport,
    group: SocketAddr,
}

impl McastTransport {
    /// Bind `socket` to `iface`, join `group`, and wrap it as a multicast transport that always
    /// sends to the group address.
    pub fn new(sock: UdpSocket, group: Ipv4Addr, port: u16, iface: Ipv4Addr) -> NetworkResult<McastTransport> {
        socket::join_multicast(&sock, group, iface)?;

        let group_addr = SocketAddr::new(group.into(), port);
        Ok(McastTransport {
            inner: UdpTransport::new(sock, Some(group_addr)),
            group: group_addr,
        })
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn receive(&mut self) -> NetworkResult<usize> {
        self.inner.receive()
    }

    pub fn recv_pool(&self) -> &LinearRecvPool {
        self.inner.recv_pool()
    }

    pub fn recv_pool_mut(&mut self) -> &mut LinearRecvPool {
        self.inner.recv_pool_mut()
    }
}

impl Transport for McastTransport {
    fn send(&mut self, buf: &[u8], action_id: u64, _remote: Option<SocketAddr>) -> NetworkResult<SendOutcome> {
        // Multicast sends always target the group, ignoring any caller-supplied remote.
        self.inner.send(buf, action_id, Some(self.group))
    }

    fn request_on_send(&mut self) {
        self.inner.request_on_send()
    }

    fn suspend_recv(&mut self) {
        self.inner.suspend_recv()
    }

    fn resume_recv(&mut self) {
        self.inner.resume_recv()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.group)
    }

    fn interest(&self) -> Interest {
        self.inner.interest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_address_is_used_as_remote() {
        let socket = UdpSocket::bind(&"0.0.0.0:0".parse().unwrap()).unwrap();
        let group = Ipv4Addr::new(239, 1, 1, 1);
        let transport = McastTransport::new(socket, group, 9001, Ipv4Addr::UNSPECIFIED).unwrap();

        assert_eq!(transport.group(), SocketAddr::new(group.into(), 9001));
        assert_eq!(transport.remote_addr(), Some(transport.group()));
    }
}
