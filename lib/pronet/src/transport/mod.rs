//! Transport family: TCP, UDP, multicast and TLS, unified behind one send/recv/backpressure
//! contract. Sessions are built on top of whichever transport they were configured with and
//! never touch the socket directly.

pub mod mcast;
pub mod tcp;
pub mod tls;
pub mod udp;

use flux::shared::NetworkResult;
use std::net::SocketAddr;

/// Outcome of a `send` call: either the bytes were queued/sent, or the transport is backed up
/// and the caller should buffer and retry after `OnSend`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendOutcome {
    Ok,
    Busy,
}

/// Upcalls delivered to whatever owns a transport (typically a `Session`). Exactly one `on_close`
/// fires per transport; no further upcalls occur afterward.
pub trait TransportObserver {
    fn on_recv(&mut self, remote: Option<SocketAddr>);
    fn on_send(&mut self, action_id: u64);
    fn on_close(&mut self, err: NetworkResult<()>);
    fn on_heartbeat(&mut self);
}

/// Common operations every transport variant exposes, independent of the underlying socket kind.
pub trait Transport {
    /// Queue `buf` for transmission. TCP/TLS apply backpressure (`Busy` while a send is
    /// in-flight); UDP/multicast are best-effort and essentially never report `Busy`.
    fn send(&mut self, buf: &[u8], action_id: u64, remote: Option<SocketAddr>) -> NetworkResult<SendOutcome>;

    /// Arm a one-shot `on_send` upcall for the next time the socket becomes writable.
    fn request_on_send(&mut self);

    /// Detach the READ interest without closing the transport.
    fn suspend_recv(&mut self);

    /// Re-attach the READ interest.
    fn resume_recv(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// The interest mask the reactor should currently register for this transport's socket,
    /// reflecting `suspend_recv`/`resume_recv` and whether a write is pending or was requested.
    fn interest(&self) -> crate::reactor::Interest;
}
