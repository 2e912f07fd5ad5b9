//! The session state machine (§4.9): `Init -> Handshaking -> Ready -> Closed`, layered on top of
//! one transport. Plain session flavors skip straight to `Ready`; extended flavors exchange
//! `RTP_SESSION_INFO`/`RTP_SESSION_ACK` first, binding the password hash derived from the nonce
//! the accept/connect handshake produced.

pub mod info;

use crate::error::{ErrorType, NetworkError, NetworkResult, SessionError};
use crate::frame::{find_frame_boundary, write_heartbeat, FrameBoundary, PackMode};
use crate::handshake::{password_hash, Nonce};
use crate::recvpool::RecvPool;
use crate::session::info::{SessionAck, SessionInfo, SessionType, UdpxSync, PASSWORD_HASH_SIZE, USER_DATA_SIZE};
use crate::transport::mcast::McastTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::TlsTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{SendOutcome, Transport};
use flux::crypto;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Protocol version this build speaks; exchanged (and currently not negotiated further) in
/// `RTP_SESSION_INFO`/`RTP_SESSION_ACK`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Deadline for the post-accept session handshake (UDP-Ex sync leg plus `RTP_SESSION_INFO`/
/// `RTP_SESSION_ACK`), mirroring the extended acceptor's own default (§4.5).
const SESSION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Init,
    Handshaking,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum HandshakeStage {
    /// UDP-Ex server: waiting on the client's initial `RTP_UDPX_SYNC`.
    AwaitUdpxSync,
    /// UDP-Ex server: sent its own sync back (payload is the nonce it's waiting to see echoed)
    /// and is rebroadcasting it each time a non-matching sync arrives, until the client's
    /// reciprocal sync shows up or the handshake deadline trips.
    AwaitUdpxReciprocal([u8; 14]),
    /// UDP-Ex client: sent the initial sync, waiting on the server's reply to echo back.
    AwaitUdpxSyncAck,
    /// Server: waiting on the client's `RTP_SESSION_INFO`.
    AwaitInfo,
    /// Client: waiting on the server's `RTP_SESSION_ACK`.
    AwaitAck,
}

/// UDP-Ex session flavors perform a 3-way `RTP_UDPX_SYNC` exchange ahead of the framed
/// `RTP_SESSION_INFO`/`RTP_SESSION_ACK` leg (§4.9); every other extended flavor skips straight to
/// the framed leg.
fn is_udp_ex(session_type: SessionType) -> bool {
    matches!(session_type, SessionType::UdpClientEx | SessionType::UdpServerEx)
}

fn generate_sync_nonce() -> [u8; 14] {
    let mut nonce = [0u8; 14];
    crypto::random_bytes(&mut nonce);
    nonce
}

/// Caller-facing identity fields threaded into `RTP_SESSION_INFO` on extended sessions; zero
/// values are valid (most deployments only care about `mm_type`/`mm_id` for multiplexed media).
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionIdentity {
    pub mm_type: u8,
    pub mm_id: u32,
    pub some_id: u32,
    pub in_src_mm_id: u32,
    pub out_src_mm_id: u32,
}

/// Upcalls a session driver delivers to whatever owns the `Session`. Keyed by session id rather
/// than carrying the `Session` itself, so an owner can look up its bookkeeping (e.g. in a
/// `HashMap<u64, Session>`) without re-entrant borrows of the session being driven.
pub trait SessionObserver {
    fn on_ready(&mut self, session_id: u64);
    fn on_recv(&mut self, session_id: u64, payload: &[u8]);
    fn on_send(&mut self, session_id: u64, action_id: u64);
    fn on_close(&mut self, session_id: u64, err: SessionError);
    fn on_heartbeat(&mut self, session_id: u64);
}

/// The transport family a session can be built on. `Session` only ever calls through the common
/// surface below; it never touches a socket directly.
pub enum SessionTransport {
    Tcp(TcpTransport),
    Udp(UdpTransport),
    Mcast(McastTransport),
    Tls(TlsTransport),
}

impl SessionTransport {
    fn receive(&mut self) -> NetworkResult<usize> {
        match self {
            SessionTransport::Tcp(t) => t.receive(),
            SessionTransport::Udp(t) => t.receive(),
            SessionTransport::Mcast(t) => t.receive(),
            SessionTransport::Tls(t) => t.receive(),
        }
    }

    fn send_raw(&mut self, buf: &[u8], action_id: u64, remote: Option<SocketAddr>) -> NetworkResult<SendOutcome> {
        match self {
            SessionTransport::Tcp(t) => t.send(buf, action_id, remote),
            SessionTransport::Udp(t) => t.send(buf, action_id, remote),
            SessionTransport::Mcast(t) => t.send(buf, action_id, remote),
            SessionTransport::Tls(t) => t.send(buf, action_id, remote),
        }
    }

    /// Drain any buffered outbound ciphertext/bytes and surface a completed `action_id`, if any
    /// send fully drained since the last call. UDP/multicast never report one: they have no
    /// internal write buffer to drain.
    fn flush(&mut self) -> NetworkResult<Option<u64>> {
        match self {
            SessionTransport::Tcp(t) => {
                t.flush()?;
                Ok(t.take_completed_action_id())
            }
            SessionTransport::Tls(t) => {
                t.flush()?;
                Ok(t.take_completed_action_id())
            }
            SessionTransport::Udp(_) | SessionTransport::Mcast(_) => Ok(None),
        }
    }

    fn peek_size(&self) -> usize {
        match self {
            SessionTransport::Tcp(t) => t.recv_pool().peek_size(),
            SessionTransport::Udp(t) => t.recv_pool().peek_size(),
            SessionTransport::Mcast(t) => t.recv_pool().peek_size(),
            SessionTransport::Tls(t) => t.recv_pool().peek_size(),
        }
    }

    fn peek_into(&self) -> &[u8] {
        match self {
            SessionTransport::Tcp(t) => t.recv_pool().peek_into(),
            SessionTransport::Udp(t) => t.recv_pool().peek_into(),
            SessionTransport::Mcast(t) => t.recv_pool().peek_into(),
            SessionTransport::Tls(t) => t.recv_pool().peek_into(),
        }
    }

    fn flush_pool(&mut self, n: usize) {
        match self {
            SessionTransport::Tcp(t) => t.recv_pool_mut().flush(n),
            SessionTransport::Udp(t) => t.recv_pool_mut().flush(n),
            SessionTransport::Mcast(t) => t.recv_pool_mut().flush(n),
            SessionTransport::Tls(t) => t.recv_pool_mut().flush(n),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            SessionTransport::Tcp(t) => t.local_addr(),
            SessionTransport::Udp(t) => t.local_addr(),
            SessionTransport::Mcast(t) => t.local_addr(),
            SessionTransport::Tls(t) => t.local_addr(),
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            SessionTransport::Tcp(t) => t.remote_addr(),
            SessionTransport::Udp(t) => t.remote_addr(),
            SessionTransport::Mcast(t) => t.remote_addr(),
            SessionTransport::Tls(t) => t.remote_addr(),
        }
    }

    fn request_on_send(&mut self) {
        match self {
            SessionTransport::Tcp(t) => t.request_on_send(),
            SessionTransport::Udp(t) => t.request_on_send(),
            SessionTransport::Mcast(t) => t.request_on_send(),
            SessionTransport::Tls(t) => t.request_on_send(),
        }
    }

    pub fn interest(&self) -> crate::reactor::Interest {
        match self {
            SessionTransport::Tcp(t) => t.interest(),
            SessionTransport::Udp(t) => t.interest(),
            SessionTransport::Mcast(t) => t.interest(),
            SessionTransport::Tls(t) => t.interest(),
        }
    }
}

/// A session bound to one transport, speaking one `PackMode` once `Ready`. Owned by whatever
/// dispatches reactor readiness to it (the service-hub/message-server layer); `Session` itself
/// never touches `mio` directly.
pub struct Session {
    id: u64,
    transport: SessionTransport,
    session_type: SessionType,
    pack_mode: PackMode,
    state: SessionState,

    stage: Option<HandshakeStage>,
    password: Vec<u8>,
    nonce: Option<Nonce>,
    identity: SessionIdentity,
    user_data: [u8; USER_DATA_SIZE],

    send_tick: u64,
    on_send_tick: u64,
    peer_alive_tick: Instant,
    close_reported: bool,
    /// Deadline for the whole handshake (sync leg plus `RTP_SESSION_INFO`/`RTP_SESSION_ACK`);
    /// `None` for plain sessions, which never handshake at all.
    handshake_deadline: Option<Instant>,
}

impl Session {
    /// Build a plain session: no preamble, no `RTP_SESSION_INFO` exchange, `Ready` immediately.
    pub fn new_plain(id: u64, transport: SessionTransport, session_type: SessionType, pack_mode: PackMode, now: Instant) -> Session {
        debug_assert!(!session_type.is_extended());

        Session {
            id,
            transport,
            session_type,
            pack_mode,
            state: SessionState::Ready,
            stage: None,
            password: Vec::new(),
            nonce: None,
            identity: SessionIdentity::default(),
            user_data: [0u8; USER_DATA_SIZE],
            send_tick: 0,
            on_send_tick: 0,
            peer_alive_tick: now,
            close_reported: false,
            handshake_deadline: None,
        }
    }

    /// Build the server side of an extended session. `nonce` is the one the accept handshake
    /// sent; the session now waits on `RTP_SESSION_INFO` to arrive and validates its password
    /// hash against it before replying with `RTP_SESSION_ACK`. UDP-Ex flavors wait on the initial
    /// `RTP_UDPX_SYNC` first (§4.9).
    pub fn new_extended_server(
        id: u64,
        transport: SessionTransport,
        session_type: SessionType,
        pack_mode: PackMode,
        nonce: Nonce,
        password: Vec<u8>,
        now: Instant,
    ) -> Session {
        debug_assert!(session_type.is_extended());

        let stage = if is_udp_ex(session_type) {
            HandshakeStage::AwaitUdpxSync
        } else {
            HandshakeStage::AwaitInfo
        };

        Session {
            id,
            transport,
            session_type,
            pack_mode,
            state: SessionState::Handshaking,
            stage: Some(stage),
            password,
            nonce: Some(nonce),
            identity: SessionIdentity::default(),
            user_data: [0u8; USER_DATA_SIZE],
            send_tick: 0,
            on_send_tick: 0,
            peer_alive_tick: now,
            close_reported: false,
            handshake_deadline: Some(now + SESSION_HANDSHAKE_TIMEOUT),
        }
    }

    /// Build the client side of an extended session. `nonce` is the one the connect handshake
    /// received. UDP-Ex flavors send the initial `RTP_UDPX_SYNC` first (§4.9); every other
    /// flavor sends `RTP_SESSION_INFO` immediately, keyed to the configured identity and
    /// `password`.
    pub fn new_extended_client(
        id: u64,
        transport: SessionTransport,
        session_type: SessionType,
        pack_mode: PackMode,
        nonce: Nonce,
        password: Vec<u8>,
        identity: SessionIdentity,
        user_data: [u8; USER_DATA_SIZE],
        now: Instant,
    ) -> NetworkResult<Session> {
        debug_assert!(session_type.is_extended());

        let stage = if is_udp_ex(session_type) {
            HandshakeStage::AwaitUdpxSyncAck
        } else {
            HandshakeStage::AwaitAck
        };

        let mut session = Session {
            id,
            transport,
            session_type,
            pack_mode,
            state: SessionState::Handshaking,
            stage: Some(stage),
            password,
            nonce: Some(nonce),
            identity,
            user_data,
            send_tick: 0,
            on_send_tick: 0,
            peer_alive_tick: now,
            close_reported: false,
            handshake_deadline: Some(now + SESSION_HANDSHAKE_TIMEOUT),
        };

        if is_udp_ex(session_type) {
            session.send_udpx_sync(generate_sync_nonce())?;
        } else {
            session.send_session_info()?;
        }
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn pack_mode(&self) -> PackMode {
        self.pack_mode
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr()
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    /// `true` once `send_tick == on_send_tick`, i.e. every send issued so far has fully drained
    /// to the socket.
    pub fn is_send_idle(&self) -> bool {
        self.on_send_tick >= self.send_tick
    }

    fn next_action_id(&mut self) -> u64 {
        self.send_tick += 1;
        self.send_tick
    }

    fn encode_session_info(&self) -> NetworkResult<Vec<u8>> {
        let nonce = self.nonce.as_ref().expect("extended session always carries a nonce");
        let mut password_hash_bytes = [0u8; PASSWORD_HASH_SIZE];
        password_hash_bytes.copy_from_slice(&password_hash(nonce, &self.password));

        let info = SessionInfo {
            local_version: PROTOCOL_VERSION,
            remote_version: 0,
            session_type: self.session_type as u8,
            mm_type: self.identity.mm_type,
            pack_mode: pack_mode_wire(self.pack_mode),
            some_id: self.identity.some_id,
            mm_id: self.identity.mm_id,
            in_src_mm_id: self.identity.in_src_mm_id,
            out_src_mm_id: self.identity.out_src_mm_id,
            password_hash: password_hash_bytes,
            user_data: self.user_data,
        };

        let mut buf = vec![0u8; SessionInfo::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            info.write(&mut cursor)?;
        }
        Ok(buf)
    }

    fn send_session_info(&mut self) -> NetworkResult<()> {
        let buf = self.encode_session_info()?;
        let action_id = self.next_action_id();
        self.transport.send_raw(&buf, action_id, None)?;
        Ok(())
    }

    fn send_session_ack(&mut self) -> NetworkResult<()> {
        let ack = SessionAck { version: PROTOCOL_VERSION };
        let mut buf = vec![0u8; SessionAck::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            ack.write(&mut cursor)?;
        }
        let action_id = self.next_action_id();
        self.transport.send_raw(&buf, action_id, None)?;
        Ok(())
    }

    fn send_udpx_sync(&mut self, nonce: [u8; 14]) -> NetworkResult<()> {
        let sync = UdpxSync { version: PROTOCOL_VERSION, nonce };
        let mut buf = vec![0u8; UdpxSync::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            sync.write(&mut cursor)?;
        }
        let action_id = self.next_action_id();
        self.transport.send_raw(&buf, action_id, None)?;
        Ok(())
    }

    /// Encode `payload` under the session's pack mode. `Default` mode stamps a minimal `Ext` (no
    /// RTP header fields beyond the defaults) ahead of the payload; `Tcp2`/`Tcp4` are a bare
    /// length prefix.
    fn encode_frame(&self, payload: &[u8]) -> NetworkResult<Vec<u8>> {
        use crate::frame::{Ext, RtpHeader, RTP_HEADER_SIZE};
        use byteorder::{BigEndian, WriteBytesExt};

        match self.pack_mode {
            PackMode::Default => {
                let ext = Ext {
                    mm_id: self.identity.mm_id,
                    mm_type: self.identity.mm_type,
                    key_frame: false,
                    first_packet: false,
                    hdr_and_payload_size: (RTP_HEADER_SIZE + payload.len()) as u16,
                };
                let mut buf = Vec::with_capacity(crate::frame::EXT_SIZE + RTP_HEADER_SIZE + payload.len());
                ext.write(&mut buf)?;
                RtpHeader::default().write(&mut buf)?;
                buf.extend_from_slice(payload);
                Ok(buf)
            }
            PackMode::Tcp2 => {
                let mut buf = Vec::with_capacity(2 + payload.len());
                buf.write_u16::<BigEndian>(payload.len() as u16)?;
                buf.extend_from_slice(payload);
                Ok(buf)
            }
            PackMode::Tcp4 => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.write_u32::<BigEndian>(payload.len() as u32)?;
                buf.extend_from_slice(payload);
                Ok(buf)
            }
        }
    }

    /// Queue `payload` for transmission. Only valid once `Ready`; callers must buffer and retry
    /// on `NetworkError::Wait` (session not ready) or `SendOutcome::Busy` (transport backed up).
    pub fn send(&mut self, payload: &[u8]) -> NetworkResult<SendOutcome> {
        if self.state != SessionState::Ready {
            return Err(NetworkError::Wait);
        }
        if payload.len() > self.pack_mode.max_payload() {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let framed = self.encode_frame(payload)?;
        let action_id = self.next_action_id();
        self.transport.send_raw(&framed, action_id, None)
    }

    /// Fire a zero-length heartbeat frame. Called by the owner when the session's heartbeat
    /// timer comes due; not driven internally since `Session` owns no timer of its own.
    pub fn send_heartbeat(&mut self) -> NetworkResult<SendOutcome> {
        if self.state != SessionState::Ready {
            return Err(NetworkError::Wait);
        }

        let mut buf = [0u8; crate::frame::EXT_SIZE];
        let n = write_heartbeat(self.pack_mode, &mut buf)?;
        let action_id = self.next_action_id();
        self.transport.send_raw(&buf[..n], action_id, None)
    }

    /// Pull any newly arrived bytes and advance the session, dispatching `on_recv`/`on_ready`/
    /// `on_heartbeat` as appropriate. `now` feeds `peer_alive_tick` bookkeeping.
    pub fn on_readable(&mut self, observer: &mut dyn SessionObserver, now: Instant) -> NetworkResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        let received = self.transport.receive();
        if let Err(err) = received {
            self.fail(observer, err.into());
            return Ok(());
        }

        match self.state {
            SessionState::Handshaking => self.advance_handshake(observer, now),
            SessionState::Ready => self.drain_frames(observer, now),
            SessionState::Init | SessionState::Closed => Ok(()),
        }
    }

    /// Drain any completed write, firing `on_send` for the action that finished.
    pub fn on_writable(&mut self, observer: &mut dyn SessionObserver) -> NetworkResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        match self.transport.flush() {
            Ok(Some(action_id)) => {
                self.on_send_tick = self.on_send_tick.max(action_id);
                observer.on_send(self.id, action_id);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                self.fail(observer, err.into());
                Ok(())
            }
        }
    }

    fn advance_handshake(&mut self, observer: &mut dyn SessionObserver, now: Instant) -> NetworkResult<()> {
        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline {
                self.fail(observer, SessionError::HandshakeTimeout);
                return Ok(());
            }
        }

        match self.stage {
            Some(HandshakeStage::AwaitUdpxSync) => {
                if self.transport.peek_size() < UdpxSync::WIRE_SIZE {
                    return Ok(());
                }

                // The transport's own `receive()` (already called by `on_readable` before we got
                // here) learns `remote_addr` from this first datagram's sender.
                {
                    let buf = &self.transport.peek_into()[..UdpxSync::WIRE_SIZE];
                    let mut cursor = Cursor::new(buf);
                    let _client_sync = UdpxSync::read(&mut cursor)?;
                }
                self.transport.flush_pool(UdpxSync::WIRE_SIZE);

                let server_nonce = generate_sync_nonce();
                self.send_udpx_sync(server_nonce)?;
                self.stage = Some(HandshakeStage::AwaitUdpxReciprocal(server_nonce));
                Ok(())
            }
            Some(HandshakeStage::AwaitUdpxReciprocal(expected)) => {
                if self.transport.peek_size() < UdpxSync::WIRE_SIZE {
                    return Ok(());
                }

                let sync = {
                    let buf = &self.transport.peek_into()[..UdpxSync::WIRE_SIZE];
                    let mut cursor = Cursor::new(buf);
                    UdpxSync::read(&mut cursor)?
                };
                self.transport.flush_pool(UdpxSync::WIRE_SIZE);

                if sync.nonce == expected {
                    self.stage = Some(HandshakeStage::AwaitInfo);
                } else {
                    // Not our reciprocal yet, most likely the client's original sync arriving
                    // again while our reply is still in flight. Rebroadcast until it matches or
                    // the handshake deadline trips.
                    self.send_udpx_sync(expected)?;
                }
                Ok(())
            }
            Some(HandshakeStage::AwaitUdpxSyncAck) => {
                if self.transport.peek_size() < UdpxSync::WIRE_SIZE {
                    return Ok(());
                }

                let sync = {
                    let buf = &self.transport.peek_into()[..UdpxSync::WIRE_SIZE];
                    let mut cursor = Cursor::new(buf);
                    UdpxSync::read(&mut cursor)?
                };
                self.transport.flush_pool(UdpxSync::WIRE_SIZE);

                self.send_udpx_sync(sync.nonce)?;
                self.send_session_info()?;
                self.stage = Some(HandshakeStage::AwaitAck);
                Ok(())
            }
            Some(HandshakeStage::AwaitInfo) => {
                if self.transport.peek_size() < SessionInfo::WIRE_SIZE {
                    return Ok(());
                }

                let info = {
                    let buf = &self.transport.peek_into()[..SessionInfo::WIRE_SIZE];
                    let mut cursor = Cursor::new(buf);
                    SessionInfo::read(&mut cursor)?
                };
                self.transport.flush_pool(SessionInfo::WIRE_SIZE);

                let nonce = self.nonce.as_ref().expect("server session always carries its accept nonce");
                let expected = password_hash(nonce, &self.password);
                if info.password_hash[..] != expected[..] {
                    self.fail(observer, SessionError::AuthenticationFailed);
                    return Ok(());
                }

                self.identity = SessionIdentity {
                    mm_type: info.mm_type,
                    mm_id: info.mm_id,
                    some_id: info.some_id,
                    in_src_mm_id: info.in_src_mm_id,
                    out_src_mm_id: info.out_src_mm_id,
                };
                self.user_data = info.user_data;
                if let Some(pack_mode) = info.pack_mode() {
                    self.pack_mode = pack_mode;
                }

                self.send_session_ack()?;
                self.stage = None;
                self.state = SessionState::Ready;
                observer.on_ready(self.id);
                Ok(())
            }
            Some(HandshakeStage::AwaitAck) => {
                if self.transport.peek_size() < SessionAck::WIRE_SIZE {
                    return Ok(());
                }

                {
                    let buf = &self.transport.peek_into()[..SessionAck::WIRE_SIZE];
                    let mut cursor = Cursor::new(buf);
                    let _ack = SessionAck::read(&mut cursor)?;
                }
                self.transport.flush_pool(SessionAck::WIRE_SIZE);

                self.stage = None;
                self.state = SessionState::Ready;
                observer.on_ready(self.id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn drain_frames(&mut self, observer: &mut dyn SessionObserver, now: Instant) -> NetworkResult<()> {
        loop {
            let boundary = find_frame_boundary(self.transport.peek_into(), self.pack_mode)?;
            match boundary {
                FrameBoundary::Incomplete => return Ok(()),
                FrameBoundary::Complete {
                    total_len,
                    payload_offset,
                    payload_len,
                } => {
                    self.peer_alive_tick = now;

                    if payload_len == 0 {
                        self.transport.flush_pool(total_len);
                        observer.on_heartbeat(self.id);
                    } else {
                        let payload = self.transport.peek_into()[payload_offset..payload_offset + payload_len].to_vec();
                        self.transport.flush_pool(total_len);
                        observer.on_recv(self.id, &payload);
                    }
                }
            }
        }
    }

    /// Check the peer-alive deadline; closes with `KeepaliveTimeout` if `now` has overrun it.
    pub fn check_keepalive(&mut self, observer: &mut dyn SessionObserver, now: Instant, timeout: std::time::Duration) {
        if self.state != SessionState::Ready {
            return;
        }
        if now.duration_since(self.peer_alive_tick) >= timeout {
            self.fail(observer, SessionError::KeepaliveTimeout);
        }
    }

    /// Re-arm the transport's write-readiness notification; called by the owner once a send
    /// returns `Busy` so it finds out when retrying might succeed.
    pub fn request_on_send(&mut self) {
        self.transport.request_on_send();
    }

    pub fn interest(&self) -> crate::reactor::Interest {
        self.transport.interest()
    }

    fn fail(&mut self, observer: &mut dyn SessionObserver, err: SessionError) {
        if self.close_reported {
            return;
        }
        self.state = SessionState::Closed;
        self.close_reported = true;
        observer.on_close(self.id, err);
    }

    /// Close the session from the outside (e.g. the owner shutting down), reporting `on_close`
    /// exactly once.
    pub fn close(&mut self, observer: &mut dyn SessionObserver, err: SessionError) {
        self.fail(observer, err);
    }
}

fn pack_mode_wire(mode: PackMode) -> u8 {
    match mode {
        PackMode::Default => 0,
        PackMode::Tcp2 => 2,
        PackMode::Tcp4 => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpTransport;
    use crate::transport::udp::UdpTransport;
    use mio::net::{TcpStream, UdpSocket};
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingObserver {
        ready: Vec<u64>,
        recvd: Vec<(u64, Vec<u8>)>,
        sent: Vec<(u64, u64)>,
        closed: Vec<(u64, String)>,
        heartbeats: Vec<u64>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_ready(&mut self, session_id: u64) {
            self.ready.push(session_id);
        }
        fn on_recv(&mut self, session_id: u64, payload: &[u8]) {
            self.recvd.push((session_id, payload.to_vec()));
        }
        fn on_send(&mut self, session_id: u64, action_id: u64) {
            self.sent.push((session_id, action_id));
        }
        fn on_close(&mut self, session_id: u64, err: SessionError) {
            self.closed.push((session_id, err.to_string()));
        }
        fn on_heartbeat(&mut self, session_id: u64) {
            self.heartbeats.push(session_id);
        }
    }

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

    fn wait_until<F: FnMut() -> bool>(mut cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_plain_session_is_ready_immediately_and_round_trips_frames() {
        let (server_stream, client_stream) = connected_pair();

        let mut server = Session::new_plain(
            1,
            SessionTransport::Tcp(TcpTransport::new(server_stream)),
            SessionType::TcpServer,
            PackMode::Tcp4,
            Instant::now(),
        );
        let mut client = Session::new_plain(
            2,
            SessionTransport::Tcp(TcpTransport::new(client_stream)),
            SessionType::TcpClient,
            PackMode::Tcp4,
            Instant::now(),
        );

        assert_eq!(server.state(), SessionState::Ready);
        assert_eq!(client.state(), SessionState::Ready);

        let mut obs = RecordingObserver::default();
        client.send(b"hello").unwrap();

        wait_until(|| {
            server.on_readable(&mut obs, Instant::now()).unwrap();
            !obs.recvd.is_empty()
        });

        assert_eq!(obs.recvd[0], (1, b"hello".to_vec()));
    }

    #[test]
    fn test_extended_session_handshake_reaches_ready_on_both_sides() {
        let (server_stream, client_stream) = connected_pair();
        let nonce = Nonce::generate();
        let now = Instant::now();

        let mut server = Session::new_extended_server(
            1,
            SessionTransport::Tcp(TcpTransport::new(server_stream)),
            SessionType::TcpServerEx,
            PackMode::Tcp4,
            nonce,
            b"secret".to_vec(),
            now,
        );

        let mut client = Session::new_extended_client(
            2,
            SessionTransport::Tcp(TcpTransport::new(client_stream)),
            SessionType::TcpClientEx,
            PackMode::Tcp4,
            nonce,
            b"secret".to_vec(),
            SessionIdentity::default(),
            [0u8; USER_DATA_SIZE],
            now,
        )
        .unwrap();

        let mut obs = RecordingObserver::default();

        wait_until(|| {
            server.on_readable(&mut obs, Instant::now()).unwrap();
            client.on_readable(&mut obs, Instant::now()).unwrap();
            server.state() == SessionState::Ready && client.state() == SessionState::Ready
        });

        assert!(obs.ready.contains(&1));
        assert!(obs.ready.contains(&2));
    }

    #[test]
    fn test_extended_session_rejects_wrong_password() {
        let (server_stream, client_stream) = connected_pair();
        let nonce = Nonce::generate();
        let now = Instant::now();

        let mut server = Session::new_extended_server(
            1,
            SessionTransport::Tcp(TcpTransport::new(server_stream)),
            SessionType::TcpServerEx,
            PackMode::Tcp4,
            nonce,
            b"secret".to_vec(),
            now,
        );

        let mut client = Session::new_extended_client(
            2,
            SessionTransport::Tcp(TcpTransport::new(client_stream)),
            SessionType::TcpClientEx,
            PackMode::Tcp4,
            nonce,
            b"wrong".to_vec(),
            SessionIdentity::default(),
            [0u8; USER_DATA_SIZE],
            now,
        )
        .unwrap();

        let mut obs = RecordingObserver::default();

        wait_until(|| {
            server.on_readable(&mut obs, Instant::now()).unwrap();
            let _ = client.on_readable(&mut obs, Instant::now());
            server.state() == SessionState::Closed
        });

        assert_eq!(obs.closed[0].0, 1);
    }

    #[test]
    fn test_udp_ex_session_performs_sync_exchange_then_reaches_ready() {
        let server_socket = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let client_socket = UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let client_addr = client_socket.local_addr().unwrap();

        let nonce = Nonce::generate();
        let now = Instant::now();

        // Server doesn't know the client's address yet; it learns it from the first SYNC.
        let mut server = Session::new_extended_server(
            1,
            SessionTransport::Udp(UdpTransport::new(server_socket, None)),
            SessionType::UdpServerEx,
            PackMode::Tcp4,
            nonce,
            b"secret".to_vec(),
            now,
        );
        assert!(server.remote_addr().is_none());

        let mut client = Session::new_extended_client(
            2,
            SessionTransport::Udp(UdpTransport::new(client_socket, Some(server_addr))),
            SessionType::UdpClientEx,
            PackMode::Tcp4,
            nonce,
            b"secret".to_vec(),
            SessionIdentity::default(),
            [0u8; USER_DATA_SIZE],
            now,
        )
        .unwrap();

        let mut obs = RecordingObserver::default();

        wait_until(|| {
            server.on_readable(&mut obs, Instant::now()).unwrap();
            client.on_readable(&mut obs, Instant::now()).unwrap();
            server.state() == SessionState::Ready && client.state() == SessionState::Ready
        });

        assert!(obs.ready.contains(&1));
        assert!(obs.ready.contains(&2));
        // The sync leg is what binds the server's remote endpoint; it never has it configured.
        assert_eq!(server.remote_addr(), Some(client_addr));
    }

    #[test]
    fn test_keepalive_timeout_closes_session() {
        let (server_stream, _client_stream) = connected_pair();
        let mut server = Session::new_plain(
            1,
            SessionTransport::Tcp(TcpTransport::new(server_stream)),
            SessionType::TcpServer,
            PackMode::Tcp4,
            Instant::now(),
        );

        let mut obs = RecordingObserver::default();
        server.check_keepalive(&mut obs, Instant::now() + Duration::from_secs(120), Duration::from_secs(60));

        assert_eq!(server.state(), SessionState::Closed);
        assert_eq!(obs.closed[0].1, SessionError::KeepaliveTimeout.to_string());
    }

    #[test]
    fn test_heartbeat_frame_recognized_by_peer() {
        let (server_stream, client_stream) = connected_pair();
        let mut server = Session::new_plain(
            1,
            SessionTransport::Tcp(TcpTransport::new(server_stream)),
            SessionType::TcpServer,
            PackMode::Tcp4,
            Instant::now(),
        );
        let mut client = Session::new_plain(
            2,
            SessionTransport::Tcp(TcpTransport::new(client_stream)),
            SessionType::TcpClient,
            PackMode::Tcp4,
            Instant::now(),
        );

        let mut obs = RecordingObserver::default();
        client.send_heartbeat().unwrap();

        wait_until(|| {
            server.on_readable(&mut obs, Instant::now()).unwrap();
            !obs.heartbeats.is_empty()
        });

        assert_eq!(obs.heartbeats[0], 1);
    }
}
