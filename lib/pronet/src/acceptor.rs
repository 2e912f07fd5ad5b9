//! Passive socket establishment (§4.5). A plain acceptor hands off a freshly accepted stream
//! as-is; an extended acceptor additionally drives the nonce/preamble exchange from
//! `handshake::ExAcceptHandshake` before the connection is considered accepted.

use crate::handshake::{ExAcceptHandshake, Nonce, Preamble, DEFAULT_ACCEPT_TIMEOUT};
use flux::shared::NetworkResult;
use mio::net::{TcpListener, TcpStream};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A freshly accepted plain connection, not yet wrapped in a transport.
pub struct Accepted {
    pub stream: TcpStream,
    pub unix_socket: bool,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

/// Listens on one address and hands back raw accepted streams with no further negotiation.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub fn bind(addr: SocketAddr) -> NetworkResult<Acceptor> {
        Ok(Acceptor {
            listener: TcpListener::bind(&addr)?,
        })
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Accept one pending connection, if any. `Ok(None)` means no connection was pending
    /// (would-block), not an error.
    pub fn accept(&self) -> NetworkResult<Option<Accepted>> {
        match self.listener.accept() {
            Ok((stream, remote_addr)) => {
                let local_addr = stream.local_addr().ok();
                Ok(Some(Accepted {
                    stream,
                    unix_socket: false,
                    local_addr,
                    remote_addr: Some(remote_addr),
                }))
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// One connection in flight through the extended preamble exchange: accepted but not yet handed
/// to the caller as `OnAccept`.
pub struct PendingExAccept {
    pub stream: TcpStream,
    pub unix_socket: bool,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    handshake: ExAcceptHandshake,
}

impl PendingExAccept {
    /// Drive the handshake one step. `Ok(None)` means still in progress (would-block on this
    /// attempt); `Ok(Some(preamble))` means the exchange completed and the connection should be
    /// handed to the caller's `OnAccept`. An `Err` means the connection should be closed with no
    /// `OnAccept` at all (bad preamble, or the handshake timer expired).
    pub fn poll(&mut self, now: Instant) -> NetworkResult<Option<Preamble>> {
        self.handshake.poll(&mut self.stream, now)
    }

    pub fn nonce(&self) -> Nonce {
        self.handshake.nonce()
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Listens on one address; every accepted connection is held pending until the extended
/// nonce/preamble exchange (§4.5 fig.) completes or times out.
pub struct ExtendedAcceptor {
    listener: TcpListener,
    timeout: Duration,
}

impl ExtendedAcceptor {
    pub fn bind(addr: SocketAddr) -> NetworkResult<ExtendedAcceptor> {
        Self::bind_with_timeout(addr, DEFAULT_ACCEPT_TIMEOUT)
    }

    pub fn bind_with_timeout(addr: SocketAddr, timeout: Duration) -> NetworkResult<ExtendedAcceptor> {
        Ok(ExtendedAcceptor {
            listener: TcpListener::bind(&addr)?,
            timeout,
        })
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Accept one pending connection and start its extended handshake, if any is waiting.
    pub fn accept(&self, now: Instant) -> NetworkResult<Option<PendingExAccept>> {
        match self.listener.accept() {
            Ok((stream, remote_addr)) => {
                let local_addr = stream.local_addr().ok();
                Ok(Some(PendingExAccept {
                    stream,
                    unix_socket: false,
                    local_addr,
                    remote_addr: Some(remote_addr),
                    handshake: ExAcceptHandshake::new(now, self.timeout),
                }))
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_plain_acceptor_hands_back_stream() {
        let listener = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.listener().local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"hi").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let accepted = listener.accept().unwrap().expect("connection should be pending");
        assert!(!accepted.unix_socket);

        let mut buf = [0u8; 2];
        let mut stream = accepted.stream;
        loop {
            match stream.read(&mut buf) {
                Ok(_) => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("unexpected read error: {}", err),
            }
        }
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_extended_acceptor_rejects_garbled_preamble_without_accept() {
        let acceptor = ExtendedAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.listener().local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let now = Instant::now();
        let mut pending = acceptor.accept(now).unwrap().expect("connection should be pending");

        // Drain the nonce the server already queued for send.
        let mut nonce_buf = [0u8; 32];
        client.read_exact(&mut nonce_buf).unwrap();
        // Send a garbled preamble (echoed token does not match token + 1).
        client.write_all(&[11, 0, 0x42, 0x42, 0x00, 0x00]).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let result = pending.poll(Instant::now());
        assert!(result.is_err(), "garbled preamble must be rejected without OnAccept");
    }
}
