//! TLS transport, layered over a TCP socket using `rustls`. The handshake/config surface is all
//! this crate consumes; the TLS library's record-layer internals are opaque (per the stated
//! external-collaborator boundary).

use crate::reactor::Interest;
use crate::recvpool::{RecvPool, RingRecvPool};
use crate::transport::{SendOutcome, Transport};
use flux::shared::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use rustls::Session;
use std::io;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

const READ_POOL_SIZE: usize = 65536;

enum TlsRole {
    Client(rustls::ClientSession),
    Server(rustls::ServerSession),
}

impl TlsRole {
    fn session_mut(&mut self) -> &mut dyn Session {
        match self {
            TlsRole::Client(session) => session,
            TlsRole::Server(session) => session,
        }
    }
}

/// TLS-flavor transport. The plaintext recv pool is filled by draining decrypted application
/// data out of the rustls session after every `process_new_packets`.
pub struct TlsTransport {
    stream: TcpStream,
    session: TlsRole,

    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,

    recv_pool: RingRecvPool,
    recv_suspended: bool,
    send_requested: bool,
    pending_action_id: Option<u64>,
    completed_action_id: Option<u64>,
}

impl TlsTransport {
    pub fn client(stream: TcpStream, config: Arc<rustls::ClientConfig>, server_name: webpki::DNSNameRef) -> TlsTransport {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let session = rustls::ClientSession::new(&config, server_name);

        TlsTransport {
            stream,
            session: TlsRole::Client(session),
            local,
            remote,
            recv_pool: RingRecvPool::new(READ_POOL_SIZE),
            recv_suspended: false,
            send_requested: false,
            pending_action_id: None,
            completed_action_id: None,
        }
    }

    pub fn server(stream: TcpStream, config: Arc<rustls::ServerConfig>) -> TlsTransport {
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let session = rustls::ServerSession::new(&config);

        TlsTransport {
            stream,
            session: TlsRole::Server(session),
            local,
            remote,
            recv_pool: RingRecvPool::new(READ_POOL_SIZE),
            recv_suspended: false,
            send_requested: false,
            pending_action_id: None,
            completed_action_id: None,
        }
    }

    pub fn is_handshaking(&mut self) -> bool {
        self.session.session_mut().is_handshaking()
    }

    /// Pull ciphertext off the socket, feed it to rustls, and drain any decrypted application
    /// data into the recv pool. Returns the number of plaintext bytes newly available.
    pub fn receive(&mut self) -> NetworkResult<usize> {
        let session = self.session.session_mut();

        match session.read_tls(&mut self.stream) {
            Ok(0) => return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::UnexpectedEof))),
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }

        if let Err(_tls_err) = session.process_new_packets() {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        let mut plaintext = [0u8; READ_POOL_SIZE];
        let mut total = 0;

        loop {
            match session.read(&mut plaintext) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    self.recv_pool_ingest(&plaintext[..n])?;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(total)
    }

    fn recv_pool_ingest(&mut self, data: &[u8]) -> NetworkResult<()> {
        if data.len() > self.recv_pool.free_size() {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        self.recv_pool.ingress(data).map_err(|err: io::Error| err.into())?;
        Ok(())
    }

    pub fn recv_pool(&self) -> &RingRecvPool {
        &self.recv_pool
    }

    pub fn recv_pool_mut(&mut self) -> &mut RingRecvPool {
        &mut self.recv_pool
    }

    /// Flush any ciphertext rustls has queued for the socket, completing the in-flight
    /// `action_id` (if any) once the session no longer wants to write.
    pub fn flush(&mut self) -> NetworkResult<usize> {
        let session = self.session.session_mut();
        let mut total = 0;

        while session.wants_write() {
            match session.write_tls(&mut self.stream) {
                Ok(n) => total += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }

        if !session.wants_write() {
            if let Some(action_id) = self.pending_action_id.take() {
                self.completed_action_id = Some(action_id);
            }
        }

        Ok(total)
    }

    pub fn take_completed_action_id(&mut self) -> Option<u64> {
        self.completed_action_id.take()
    }
}

impl Transport for TlsTransport {
    fn send(&mut self, buf: &[u8], action_id: u64, _remote: Option<SocketAddr>) -> NetworkResult<SendOutcome> {
        let session = self.session.session_mut();

        match session.write(buf) {
            Ok(n) if n == buf.len() => {}
            Ok(_) => return Ok(SendOutcome::Busy),
            Err(err) => return Err(err.into()),
        }

        self.pending_action_id = Some(action_id);
        self.flush()?;
        Ok(if self.pending_action_id.is_some() { SendOutcome::Busy } else { SendOutcome::Ok })
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
    use std::thread;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || listener.accept().unwrap().0);
        let client_std = std::net::TcpStream::connect(addr).unwrap();
        let server_std = server.join().unwrap();

        client_std.set_nonblocking(true).unwrap();
        server_std.set_nonblocking(true).unwrap();

        (TcpStream::from_stream(server_std).unwrap(), TcpStream::from_stream(client_std).unwrap())
    }

    #[test]
    fn test_request_on_send_toggles_writable_interest() {
        let (_server, client) = connected_pair();
        let config = Arc::new(rustls::ClientConfig::new());
        let name = webpki::DNSNameRef::try_from_ascii_str("localhost").unwrap();
        let mut transport = TlsTransport::client(client, config, name);

        assert!(!transport.interest().writable);
        transport.request_on_send();
        assert!(transport.interest().writable);
    }

    #[test]
    fn test_suspend_and_resume_recv_toggle_readable_interest() {
        let (server, _client) = connected_pair();
        let config = Arc::new(rustls::ServerConfig::new(rustls::NoClientAuth::new()));
        let mut transport = TlsTransport::server(server, config);

        assert!(transport.interest().readable);
        transport.suspend_recv();
        assert!(!transport.interest().readable);
        transport.resume_recv();
        assert!(transport.interest().readable);
    }
}
