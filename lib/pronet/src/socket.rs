//! Thin, portable wrappers over the socket primitives the rest of the crate needs. Actual
//! cross-platform socket handling (bind/listen/accept/connect, epoll/select demultiplexing) is
//! delegated to `mio`'s `TcpListener`/`TcpStream`/`UdpSocket`; this module supplies the handful
//! of helpers the original BSD-wrapper layer exposed that `mio` doesn't: multicast join/leave,
//! and the same-host IPC fallback path used by the service-hub/host pipe.

use mio::net::UdpSocket;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::{io, net};

/// Join a multicast group on the given socket, binding the interface by its local address.
pub fn join_multicast(socket: &UdpSocket, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
    socket.join_multicast_v4(&group, &iface)
}

/// Leave a previously joined multicast group.
pub fn leave_multicast(socket: &UdpSocket, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
    socket.leave_multicast_v4(&group, &iface)
}

/// The well-known same-host IPC path used by the service-hub/host pipe on Unix platforms, per
/// the fallback convention `/tmp/libpronet_127001_<port>`. Platforms without Unix-domain sockets
/// (the hub falls back to a loopback TCP pipe there) don't call this.
pub fn ipc_path(port: u16) -> PathBuf {
    PathBuf::from(format!("/tmp/libpronet_127001_{}", port))
}

/// The loopback address/port pair used as the IPC fallback pipe on platforms without Unix-domain
/// sockets (the service-hub binds both its external listener and this pipe, so the loopback
/// address is reserved and can't also serve external clients on those platforms).
pub fn ipc_loopback_addr(port: u16) -> SocketAddr {
    SocketAddr::new(net::IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_path_format() {
        assert_eq!(ipc_path(4000).to_str().unwrap(), "/tmp/libpronet_127001_4000");
    }

    #[test]
    fn test_ipc_loopback_addr() {
        let addr = ipc_loopback_addr(4000);
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(addr.port(), 4000);
    }
}
