//! The extended-protocol preamble exchanged right after `accept`/`connect`, before any session
//! or messaging semantics apply, plus the bounded send/recv-then-complete "handshaker" step
//! (§4.6) that drives it to completion over a non-blocking socket.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flux::crypto;
use flux::shared::{ErrorType, NetworkError, NetworkResult};
use flux::shared::{SizedRead, SizedWrite};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

pub const NONCE_SIZE: usize = 32;
pub const PREAMBLE_SIZE: usize = 6;

/// The 32-byte random value the server sends right after accepting a connection, used both to
/// prove freshness of the preamble response and as input to the handshake password hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    pub fn generate() -> Nonce {
        let mut bytes = [0u8; NONCE_SIZE];
        crypto::random_bytes(&mut bytes);
        Nonce(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The 4-value preamble the client sends after receiving the nonce: the target service, an
/// opaque option byte, and a client-chosen 16-bit token echoed back as `token + 1` so the server
/// can detect a replayed/garbled preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub service_id: u8,
    pub service_opt: u8,
    pub token: u16,
}

impl Preamble {
    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u8(self.service_id)?;
        stream.write_u8(self.service_opt)?;
        stream.write_u16::<BigEndian>(self.token)?;
        stream.write_u16::<BigEndian>(self.token.wrapping_add(1))?;
        Ok(())
    }

    /// Parse and validate the preamble, returning `None` if the echoed `token + 1` doesn't match
    /// (a malformed or replayed preamble per the handshake invariant).
    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<Option<Preamble>> {
        let service_id = stream.read_u8()?;
        let service_opt = stream.read_u8()?;
        let token = stream.read_u16::<BigEndian>()?;
        let echoed = stream.read_u16::<BigEndian>()?;

        if echoed != token.wrapping_add(1) {
            return Ok(None);
        }

        Ok(Some(Preamble {
            service_id,
            service_opt,
            token,
        }))
    }
}

/// `password_hash = SHA-256(nonce ‖ password)`, used by the session handshake (§4.9) and the
/// messaging handshake (§4.10) alike.
pub fn password_hash(nonce: &Nonce, password: &[u8]) -> [u8; crypto::SHA256_SIZE] {
    crypto::sha256(&[nonce.as_bytes(), password])
}

/// Read exactly `PREAMBLE_SIZE` bytes and parse them as a `Preamble`; used by callers that
/// already have the raw bytes off the wire rather than a `SizedRead` cursor.
pub fn parse_preamble_bytes(buf: &[u8; PREAMBLE_SIZE]) -> Option<Preamble> {
    let mut cursor = std::io::Cursor::new(&buf[..]);
    let service_id = cursor.read_u8().ok()?;
    let service_opt = cursor.read_u8().ok()?;
    let token = cursor.read_u16::<BigEndian>().ok()?;
    let echoed = cursor.read_u16::<BigEndian>().ok()?;

    if echoed != token.wrapping_add(1) {
        return None;
    }

    Some(Preamble {
        service_id,
        service_opt,
        token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_roundtrip() {
        let mut buf = [0u8; PREAMBLE_SIZE];
        let preamble = Preamble {
            service_id: 11,
            service_opt: 0,
            token: 0x4242,
        };

        {
            let mut cursor = std::io::Cursor::new(&mut buf[..]);
            preamble.write(&mut cursor).unwrap();
        }

        let parsed = parse_preamble_bytes(&buf).unwrap();
        assert_eq!(parsed, preamble);
    }

    #[test]
    fn test_preamble_garbled_token_rejected() {
        let mut buf = [0u8; PREAMBLE_SIZE];
        buf[2] = 0x42;
        buf[3] = 0x42;
        buf[4] = 0x00; // wrong echo, should be 0x4243
        buf[5] = 0x00;

        assert!(parse_preamble_bytes(&buf).is_none());
    }

    #[test]
    fn test_password_hash_matches_spec_example() {
        let nonce = Nonce([0x01; NONCE_SIZE]);
        let hash_a = password_hash(&nonce, b"test");
        let hash_b = password_hash(&nonce, b"test");
        assert_eq!(hash_a, hash_b);

        let hash_wrong = password_hash(&nonce, b"wrong");
        assert_ne!(hash_a, hash_wrong);
    }
}

/// Default timeout for the extended acceptor side of the handshake (§4.5).
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for the extended connector side of the handshake (§4.5).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// A fixed-size, partially-written-or-read buffer driven across repeated non-blocking
/// `read`/`write` calls. One `BoundedStep` covers exactly one "send N bytes" or "recv N bytes"
/// leg of a handshake; a handshaker chains two of these (§4.6: "bounded send/recv-then-complete").
struct BoundedStep {
    buf: Vec<u8>,
    done: usize,
}

impl BoundedStep {
    fn for_write(payload: Vec<u8>) -> BoundedStep {
        BoundedStep { buf: payload, done: 0 }
    }

    fn for_read(size: usize) -> BoundedStep {
        BoundedStep {
            buf: vec![0u8; size],
            done: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.done == self.buf.len()
    }

    /// Push as much of `buf` to `stream` as is currently writable; returns `true` once exhausted.
    fn drive_write<W: Write>(&mut self, stream: &mut W) -> io::Result<bool> {
        while self.done < self.buf.len() {
            match stream.write(&self.buf[self.done..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.done += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Pull as much of `buf` from `stream` as is currently readable; returns `true` once filled.
    fn drive_read<R: Read>(&mut self, stream: &mut R) -> io::Result<bool> {
        while self.done < self.buf.len() {
            match stream.read(&mut self.buf[self.done..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => self.done += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}

fn check_deadline(deadline: Instant, now: Instant) -> NetworkResult<()> {
    if now >= deadline {
        Err(NetworkError::Fatal(ErrorType::Expired))
    } else {
        Ok(())
    }
}

enum AcceptStage {
    SendNonce(BoundedStep),
    RecvPreamble(BoundedStep),
}

/// Server-side leg of the extended handshake: send a freshly generated nonce, then read back the
/// 6-byte preamble within `timeout`. Lives entirely in memory plus two small fixed buffers, so it
/// can be driven from repeated reactor readiness callbacks without blocking.
pub struct ExAcceptHandshake {
    nonce: Nonce,
    stage: AcceptStage,
    deadline: Instant,
}

impl ExAcceptHandshake {
    pub fn new(now: Instant, timeout: Duration) -> ExAcceptHandshake {
        let nonce = Nonce::generate();
        ExAcceptHandshake {
            stage: AcceptStage::SendNonce(BoundedStep::for_write(nonce.as_bytes().to_vec())),
            nonce,
            deadline: now + timeout,
        }
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Drive one step against `stream`. Returns `Some(preamble)` once the exchange completes,
    /// `None` while still in progress. A malformed preamble or a deadline overrun closes the
    /// connection without ever surfacing `OnAccept`, per the framing invariant in §8.
    pub fn poll<S: Read + Write>(&mut self, stream: &mut S, now: Instant) -> NetworkResult<Option<Preamble>> {
        check_deadline(self.deadline, now)?;

        loop {
            match &mut self.stage {
                AcceptStage::SendNonce(step) => {
                    if !step.drive_write(stream)? {
                        return Ok(None);
                    }
                    self.stage = AcceptStage::RecvPreamble(BoundedStep::for_read(PREAMBLE_SIZE));
                }
                AcceptStage::RecvPreamble(step) => {
                    if !step.drive_read(stream)? {
                        return Ok(None);
                    }

                    let mut raw = [0u8; PREAMBLE_SIZE];
                    raw.copy_from_slice(&step.buf);

                    return match parse_preamble_bytes(&raw) {
                        Some(preamble) => Ok(Some(preamble)),
                        None => Err(NetworkError::Fatal(ErrorType::ProtocolMismatch)),
                    };
                }
            }
        }
    }
}

enum ConnectStage {
    RecvNonce(BoundedStep),
    SendPreamble(BoundedStep),
}

/// Client-side leg of the extended handshake: read the server's 32-byte nonce, then send back the
/// 6-byte preamble built from the caller-chosen `service_id`/`service_opt`/`token`.
pub struct ExConnectHandshake {
    service_id: u8,
    service_opt: u8,
    token: u16,
    stage: ConnectStage,
    nonce: Option<Nonce>,
    deadline: Instant,
}

impl ExConnectHandshake {
    pub fn new(service_id: u8, service_opt: u8, token: u16, now: Instant, timeout: Duration) -> ExConnectHandshake {
        ExConnectHandshake {
            service_id,
            service_opt,
            token,
            stage: ConnectStage::RecvNonce(BoundedStep::for_read(NONCE_SIZE)),
            nonce: None,
            deadline: now + timeout,
        }
    }

    /// Drive one step against `stream`. Returns `Some(nonce)` once the preamble has been sent in
    /// full, `None` while still in progress.
    pub fn poll<S: Read + Write>(&mut self, stream: &mut S, now: Instant) -> NetworkResult<Option<Nonce>> {
        check_deadline(self.deadline, now)?;

        loop {
            match &mut self.stage {
                ConnectStage::RecvNonce(step) => {
                    if !step.drive_read(stream)? {
                        return Ok(None);
                    }

                    let mut raw = [0u8; NONCE_SIZE];
                    raw.copy_from_slice(&step.buf);
                    let nonce = Nonce(raw);
                    self.nonce = Some(nonce);

                    let preamble = Preamble {
                        service_id: self.service_id,
                        service_opt: self.service_opt,
                        token: self.token,
                    };
                    let mut payload = vec![0u8; PREAMBLE_SIZE];
                    {
                        let mut cursor = std::io::Cursor::new(&mut payload[..]);
                        preamble.write(&mut cursor).map_err(|_| NetworkError::Fatal(ErrorType::Serialization))?;
                    }

                    self.stage = ConnectStage::SendPreamble(BoundedStep::for_write(payload));
                }
                ConnectStage::SendPreamble(step) => {
                    if !step.drive_write(stream)? {
                        return Ok(None);
                    }
                    return Ok(self.nonce);
                }
            }
        }
    }
}

#[cfg(test)]
mod handshaker_tests {
    use super::*;
    use std::io::Cursor;

    /// An in-memory duplex pipe good enough to drive `ExAcceptHandshake`/`ExConnectHandshake`
    /// against each other without a live socket.
    struct Pipe {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl Pipe {
        fn new(inbound: Vec<u8>) -> Pipe {
            Pipe {
                inbound: Cursor::new(inbound),
                outbound: Vec::new(),
            }
        }
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inbound.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_accept_handshake_round_trips_with_in_memory_pipe() {
        let now = Instant::now();

        let preamble = Preamble {
            service_id: 11,
            service_opt: 0,
            token: 0x4242,
        };
        let mut preamble_bytes = vec![0u8; PREAMBLE_SIZE];
        {
            let mut cursor = Cursor::new(&mut preamble_bytes[..]);
            preamble.write(&mut cursor).unwrap();
        }

        let mut pipe = Pipe::new(preamble_bytes);
        let mut accept = ExAcceptHandshake::new(now, DEFAULT_ACCEPT_TIMEOUT);

        let result = accept.poll(&mut pipe, now).unwrap();
        let got = result.expect("single poll should drain an always-ready in-memory pipe");
        assert_eq!(got, preamble);
        assert_eq!(pipe.outbound, accept.nonce().as_bytes());
    }

    #[test]
    fn test_accept_handshake_rejects_garbled_preamble() {
        let now = Instant::now();
        let mut pipe = Pipe::new(vec![0u8; PREAMBLE_SIZE]);
        let mut accept = ExAcceptHandshake::new(now, DEFAULT_ACCEPT_TIMEOUT);

        let err = accept.poll(&mut pipe, now).unwrap_err();
        assert_eq!(err, NetworkError::Fatal(ErrorType::ProtocolMismatch));
    }

    #[test]
    fn test_accept_handshake_expires_past_deadline() {
        let now = Instant::now();
        let mut pipe = Pipe::new(vec![]);
        let mut accept = ExAcceptHandshake::new(now, Duration::from_millis(1));

        let err = accept.poll(&mut pipe, now + Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Expired));
    }
}
