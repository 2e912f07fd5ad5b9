//! The `classId`/`userId`/`instId` messaging overlay (§4.10): wire shapes for the per-user
//! identity and message header, server-side admission/routing bookkeeping, and the thin
//! client/C2S wrappers around it. Routing decisions are made here; the actual byte transfer is
//! left to whichever `Session` the caller has matched a session id to, same split as `session`
//! has with its owner.

use crate::error::{MsgError, NetworkResult};
use crate::handshake::Nonce;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flux::crypto;
use flux::shared::{SizedRead, SizedWrite};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::Ipv4Addr;

/// `RTP_MSG_USER`: an 8-byte identity, `class_id` (the application-defined group/room id),
/// `user_id` (40 bits, big-endian on the wire), `inst_id` (a per-device instance disambiguator).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct RtpMsgUser {
    pub class_id: u8,
    pub user_id: u64,
    pub inst_id: u16,
}

pub const USER_ID_MASK: u64 = (1 << 40) - 1;

impl RtpMsgUser {
    pub const WIRE_SIZE: usize = 1 + 5 + 2;

    pub fn new(class_id: u8, user_id: u64, inst_id: u16) -> RtpMsgUser {
        RtpMsgUser {
            class_id,
            user_id: user_id & USER_ID_MASK,
            inst_id,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.user_id == 0
    }

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u8(self.class_id)?;
        stream.write_u8(((self.user_id >> 32) & 0xff) as u8)?;
        stream.write_u32::<BigEndian>((self.user_id & 0xffff_ffff) as u32)?;
        stream.write_u16::<BigEndian>(self.inst_id)?;
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<RtpMsgUser> {
        let class_id = stream.read_u8()?;
        let high = stream.read_u8()? as u64;
        let low = stream.read_u32::<BigEndian>()? as u64;
        let inst_id = stream.read_u16::<BigEndian>()?;

        Ok(RtpMsgUser {
            class_id,
            user_id: (high << 32) | low,
            inst_id,
        })
    }
}

/// `RTP_MSG_HEADER0`, sent server-to-client once immediately after the messaging handshake
/// completes, carrying the (possibly server-assigned) user identity and the client's observed
/// public IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader0 {
    pub version: u16,
    pub user: RtpMsgUser,
    pub public_ip: Ipv4Addr,
}

impl MsgHeader0 {
    pub const WIRE_SIZE: usize = 2 + RtpMsgUser::WIRE_SIZE + 2 + 24;

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u16::<BigEndian>(self.version)?;
        self.user.write(stream)?;
        stream.write_all(&[0u8; 2])?; // reserved1
        stream.write_u32::<BigEndian>(u32::from(self.public_ip))?;
        stream.write_all(&[0u8; 20])?; // remainder of the reserved2/publicIp union
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<MsgHeader0> {
        let version = stream.read_u16::<BigEndian>()?;
        let user = RtpMsgUser::read(stream)?;

        let mut reserved1 = [0u8; 2];
        stream.read_exact(&mut reserved1)?;

        let public_ip = Ipv4Addr::from(stream.read_u32::<BigEndian>()?);

        let mut reserved2 = [0u8; 20];
        stream.read_exact(&mut reserved2)?;

        Ok(MsgHeader0 { version, user, public_ip })
    }
}

/// `RTP_MSG_HEADER`, prepended to every message frame (the payload follows immediately after).
/// Zero-length payload (not represented here; the caller checks the framed length) is a
/// messaging-layer heartbeat and is never forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub charset: u16,
    pub src_user: RtpMsgUser,
    pub dst_users: Vec<RtpMsgUser>,
}

impl MsgHeader {
    /// Maximum destinations a single frame can carry; `dst_user_count` is one wire byte.
    pub const MAX_DESTINATIONS: usize = 255;

    pub fn encoded_len(&self) -> usize {
        2 + RtpMsgUser::WIRE_SIZE + 1 + 1 + self.dst_users.len() * RtpMsgUser::WIRE_SIZE
    }

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u16::<BigEndian>(self.charset)?;
        self.src_user.write(stream)?;
        stream.write_u8(0)?; // reserved
        stream.write_u8(self.dst_users.len() as u8)?;
        for user in &self.dst_users {
            user.write(stream)?;
        }
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<MsgHeader> {
        let charset = stream.read_u16::<BigEndian>()?;
        let src_user = RtpMsgUser::read(stream)?;
        let _reserved = stream.read_u8()?;
        let count = stream.read_u8()? as usize;

        let mut dst_users = Vec::with_capacity(count);
        for _ in 0..count {
            dst_users.push(RtpMsgUser::read(stream)?);
        }

        Ok(MsgHeader {
            charset,
            src_user,
            dst_users,
        })
    }
}

/// Per-destination outbound queue depth, enforcing a redline: once a destination's queued bytes
/// reach its redline, further sends to it return busy until earlier sends drain.
#[derive(Debug, Default)]
pub struct RedlineTracker {
    depth: HashMap<u64, usize>,
}

impl RedlineTracker {
    pub fn new() -> RedlineTracker {
        RedlineTracker { depth: HashMap::new() }
    }

    /// Returns `true` (and credits `bytes`) if `session_id`'s queue is still under `redline`
    /// after adding `bytes`; otherwise leaves the counter untouched and returns `false`.
    pub fn try_reserve(&mut self, session_id: u64, bytes: usize, redline: usize) -> bool {
        let entry = self.depth.entry(session_id).or_insert(0);
        if *entry + bytes > redline {
            return false;
        }
        *entry += bytes;
        true
    }

    /// Release `bytes` once a send to `session_id` completes (the transport's `on_send`).
    pub fn release(&mut self, session_id: u64, bytes: usize) {
        if let Some(entry) = self.depth.get_mut(&session_id) {
            *entry = entry.saturating_sub(bytes);
        }
    }

    pub fn sending_bytes(&self, session_id: u64) -> usize {
        self.depth.get(&session_id).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, session_id: u64) {
        self.depth.remove(&session_id);
    }
}

/// Where a routed message should go next.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RouteTarget {
    /// Deliver directly to this locally-authenticated session.
    Local(u64),
    /// Forward through this C2S relay session (the destination is one of its sub-users).
    C2s(u64),
}

/// The decision an observer makes for an inbound `OnCheckUser` challenge (§4.10 step 2).
#[derive(Debug, Clone, Copy)]
pub struct CheckUserDecision {
    pub accepted: bool,
    pub assigned_user: RtpMsgUser,
    pub is_c2s: bool,
}

/// Upcalls specific to admission; routing itself has no observer since it's pure bookkeeping
/// the caller drives explicitly via `route_message`/`on_disconnect`.
pub trait MsgServerObserver {
    fn on_check_user(&mut self, requested: RtpMsgUser, public_ip: Ipv4Addr, app_data: &[u8], is_c2s_hint: bool) -> CheckUserDecision;
}

/// Server-side admission and routing table for the messaging overlay. Does not itself touch any
/// socket; the owner calls `accept_pending`/`check_user`/`route_message`/`on_disconnect` as
/// sessions progress.
pub struct MsgServer {
    password: Vec<u8>,
    pending: HashMap<u64, Nonce>,
    users: HashMap<RtpMsgUser, u64>,
    sessions: HashMap<u64, RtpMsgUser>,
    c2s_sessions: HashSet<u64>,
    sub_users: HashMap<u64, HashSet<RtpMsgUser>>,
    c2s_redline: usize,
    user_redline: usize,
    outbound: RedlineTracker,
}

impl MsgServer {
    pub fn new(password: Vec<u8>, c2s_redline: usize, user_redline: usize) -> MsgServer {
        MsgServer {
            password,
            pending: HashMap::new(),
            users: HashMap::new(),
            sessions: HashMap::new(),
            c2s_sessions: HashSet::new(),
            sub_users: HashMap::new(),
            c2s_redline,
            user_redline,
            outbound: RedlineTracker::new(),
        }
    }

    /// Record a freshly accepted, not-yet-authenticated session and the nonce its extended
    /// accept handshake generated.
    pub fn accept_pending(&mut self, session_id: u64, nonce: Nonce) {
        self.pending.insert(session_id, nonce);
    }

    /// Validate `hash == SHA-256(nonce ‖ password)` for `session_id`, then delegate the final
    /// accept/reject and identity assignment to `observer`. On success the session is moved from
    /// pending into the authenticated tables.
    pub fn check_user(
        &mut self,
        session_id: u64,
        requested_user: RtpMsgUser,
        public_ip: Ipv4Addr,
        hash: &[u8],
        app_data: &[u8],
        is_c2s_hint: bool,
        observer: &mut dyn MsgServerObserver,
    ) -> Result<RtpMsgUser, MsgError> {
        let nonce = self.pending.get(&session_id).copied().ok_or(MsgError::UserRejected)?;
        let expected = crypto::sha256(&[nonce.as_bytes(), &self.password]);

        if hash != &expected[..] {
            self.pending.remove(&session_id);
            return Err(MsgError::UserRejected);
        }

        let decision = observer.on_check_user(requested_user, public_ip, app_data, is_c2s_hint);
        self.pending.remove(&session_id);

        if !decision.accepted {
            return Err(MsgError::UserRejected);
        }

        self.users.insert(decision.assigned_user, session_id);
        self.sessions.insert(session_id, decision.assigned_user);
        if decision.is_c2s {
            self.c2s_sessions.insert(session_id);
            self.sub_users.insert(session_id, HashSet::new());
        }

        Ok(decision.assigned_user)
    }

    /// Record that `user` now hangs off C2S relay `c2s_session_id` (the relay forwarded its own
    /// `OnCheckUser` upstream and is reporting the result downstream).
    pub fn attach_sub_user(&mut self, c2s_session_id: u64, user: RtpMsgUser) {
        self.sub_users.entry(c2s_session_id).or_insert_with(HashSet::new).insert(user);
    }

    pub fn is_c2s(&self, session_id: u64) -> bool {
        self.c2s_sessions.contains(&session_id)
    }

    pub fn user_of(&self, session_id: u64) -> Option<RtpMsgUser> {
        self.sessions.get(&session_id).copied()
    }

    /// Resolve every destination in `dst_users` to a delivery target. Unknown destinations are
    /// silently omitted (dropped), per the routing rule.
    pub fn resolve(&self, dst_users: &[RtpMsgUser]) -> Vec<RouteTarget> {
        let mut targets = Vec::with_capacity(dst_users.len());

        for dst in dst_users {
            if let Some(&session_id) = self.users.get(dst) {
                targets.push(RouteTarget::Local(session_id));
                continue;
            }

            for (&c2s_session_id, members) in &self.sub_users {
                if members.contains(dst) {
                    targets.push(RouteTarget::C2s(c2s_session_id));
                    break;
                }
            }
        }

        targets
    }

    /// Reserve `bytes` against the redline for `target`, returning `false` (busy) if the
    /// destination's outbound queue is already at its limit.
    pub fn try_reserve(&mut self, target: RouteTarget) -> bool {
        match target {
            RouteTarget::Local(session_id) => self.outbound.try_reserve(session_id, 0, self.user_redline),
            RouteTarget::C2s(session_id) => self.outbound.try_reserve(session_id, 0, self.c2s_redline),
        }
    }

    pub fn reserve_bytes(&mut self, target: RouteTarget, bytes: usize) -> bool {
        match target {
            RouteTarget::Local(session_id) => self.outbound.try_reserve(session_id, bytes, self.user_redline),
            RouteTarget::C2s(session_id) => self.outbound.try_reserve(session_id, bytes, self.c2s_redline),
        }
    }

    pub fn release_bytes(&mut self, session_id: u64, bytes: usize) {
        self.outbound.release(session_id, bytes);
    }

    pub fn sending_bytes(&self, session_id: u64) -> usize {
        self.outbound.sending_bytes(session_id)
    }

    /// Tear down `session_id`'s bookkeeping. If it was a C2S relay, returns the session ids of
    /// every sub-user that must now also be disconnected (the cascading-disconnect invariant).
    pub fn on_disconnect(&mut self, session_id: u64) -> Vec<u64> {
        self.pending.remove(&session_id);
        self.outbound.forget(session_id);

        if let Some(user) = self.sessions.remove(&session_id) {
            self.users.remove(&user);
        }

        if self.c2s_sessions.remove(&session_id) {
            if let Some(members) = self.sub_users.remove(&session_id) {
                return members.into_iter().filter_map(|user| self.users.get(&user).copied()).collect();
            }
        }

        Vec::new()
    }
}

/// Client-side redline bookkeeping for `IRtpMsgClient`. The client always has exactly one
/// upstream session (to a server or a C2S); `SendMsg`/`SendMsg2` build a `MsgHeader` and hand it
/// plus the payload to that session, subject to this redline.
pub struct MsgClient {
    upstream_session: u64,
    redline: usize,
    outbound: RedlineTracker,
}

impl MsgClient {
    pub const DEFAULT_REDLINE: usize = 1024 * 1024;

    pub fn new(upstream_session: u64) -> MsgClient {
        MsgClient {
            upstream_session,
            redline: Self::DEFAULT_REDLINE,
            outbound: RedlineTracker::new(),
        }
    }

    pub fn set_output_redline(&mut self, redline: usize) {
        self.redline = redline;
    }

    /// Build the `MsgHeader` + payload for a `SendMsg`/`SendMsg2` call, reserving `bytes` against
    /// the client's own output redline. Returns `None` (busy) if the redline would be exceeded.
    pub fn prepare_send(&mut self, src_user: RtpMsgUser, charset: u16, dst_users: Vec<RtpMsgUser>, bytes: usize) -> Option<MsgHeader> {
        if dst_users.len() > MsgHeader::MAX_DESTINATIONS {
            return None;
        }
        if !self.outbound.try_reserve(self.upstream_session, bytes, self.redline) {
            return None;
        }

        Some(MsgHeader {
            charset,
            src_user,
            dst_users,
        })
    }

    pub fn on_send_complete(&mut self, bytes: usize) {
        self.outbound.release(self.upstream_session, bytes);
    }

    pub fn sending_bytes(&self) -> usize {
        self.outbound.sending_bytes(self.upstream_session)
    }
}

/// Dual-role C2S relay bookkeeping: a `MsgClient` toward the upstream server plus a `MsgServer`
/// fronting its own downstream clients. Routing mirrors both directions; if the upstream link
/// drops, every downstream user must be closed (the caller does the actual session teardown,
/// driven by the session ids this returns).
pub struct MsgC2s {
    pub upstream: MsgClient,
    pub downstream: MsgServer,
}

impl MsgC2s {
    pub fn new(upstream_session: u64, password: Vec<u8>, c2s_redline: usize, user_redline: usize) -> MsgC2s {
        MsgC2s {
            upstream: MsgClient::new(upstream_session),
            downstream: MsgServer::new(password, c2s_redline, user_redline),
        }
    }

    /// Destinations not attached downstream are forwarded upstream; destinations attached
    /// downstream resolve locally. Used for traffic arriving from the upstream server that needs
    /// mirroring down to an attached user.
    pub fn resolve_downstream(&self, dst_users: &[RtpMsgUser]) -> Vec<RouteTarget> {
        self.downstream.resolve(dst_users)
    }

    /// All downstream session ids currently attached, for the upstream-link-dropped cascade.
    pub fn all_downstream_sessions(&self) -> Vec<u64> {
        self.downstream.sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    #[test]
    fn test_rtp_msg_user_roundtrip() {
        let user = RtpMsgUser::new(7, 0x12_3456_789a, 42);
        let mut buf = vec![0u8; RtpMsgUser::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            user.write(&mut cursor).unwrap();
        }
        let mut cursor = Cursor::new(&buf[..]);
        let parsed = RtpMsgUser::read(&mut cursor).unwrap();
        assert_eq!(parsed, user);
    }

    #[test]
    fn test_msg_user_id_masked_to_40_bits() {
        let user = RtpMsgUser::new(1, u64::max_value(), 0);
        assert_eq!(user.user_id, USER_ID_MASK);
    }

    #[test]
    fn test_msg_header0_roundtrip() {
        let header = MsgHeader0 {
            version: 2,
            user: RtpMsgUser::new(1, 99, 0),
            public_ip: Ipv4Addr::new(10, 0, 0, 1),
        };
        let mut buf = vec![0u8; MsgHeader0::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            header.write(&mut cursor).unwrap();
        }
        let mut cursor = Cursor::new(&buf[..]);
        let parsed = MsgHeader0::read(&mut cursor).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_msg_header_roundtrip_with_destinations() {
        let header = MsgHeader {
            charset: 0,
            src_user: RtpMsgUser::new(1, 5, 0),
            dst_users: vec![RtpMsgUser::new(1, 6, 0), RtpMsgUser::new(1, 7, 0)],
        };
        let mut buf = vec![0u8; header.encoded_len()];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            header.write(&mut cursor).unwrap();
        }
        let mut cursor = Cursor::new(&buf[..]);
        let parsed = MsgHeader::read(&mut cursor).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_redline_blocks_once_full() {
        let mut tracker = RedlineTracker::new();
        assert!(tracker.try_reserve(1, 900, 1000));
        assert!(!tracker.try_reserve(1, 200, 1000));
        tracker.release(1, 900);
        assert!(tracker.try_reserve(1, 200, 1000));
    }

    struct AcceptAllObserver;
    impl MsgServerObserver for AcceptAllObserver {
        fn on_check_user(&mut self, requested: RtpMsgUser, _public_ip: Ipv4Addr, _app_data: &[u8], is_c2s_hint: bool) -> CheckUserDecision {
            CheckUserDecision {
                accepted: true,
                assigned_user: requested,
                is_c2s: is_c2s_hint,
            }
        }
    }

    #[test]
    fn test_check_user_wrong_hash_rejected() {
        let nonce = Nonce::generate();
        let mut server = MsgServer::new(b"secret".to_vec(), 8 * 1024 * 1024, 1024 * 1024);
        server.accept_pending(1, nonce);

        let mut obs = AcceptAllObserver;
        let result = server.check_user(1, RtpMsgUser::new(1, 5, 0), Ipv4Addr::new(127, 0, 0, 1), b"garbage", b"", false, &mut obs);

        assert_eq!(result.unwrap_err(), MsgError::UserRejected);
    }

    #[test]
    fn test_check_user_accepts_and_routes() {
        let nonce = Nonce::generate();
        let mut server = MsgServer::new(b"secret".to_vec(), 8 * 1024 * 1024, 1024 * 1024);
        server.accept_pending(1, nonce);

        let hash = crypto::sha256(&[nonce.as_bytes(), b"secret"]);
        let mut obs = AcceptAllObserver;
        let user = server
            .check_user(1, RtpMsgUser::new(1, 5, 0), Ipv4Addr::new(127, 0, 0, 1), &hash, b"", false, &mut obs)
            .unwrap();

        assert_eq!(server.user_of(1), Some(user));

        let targets = server.resolve(&[user]);
        assert_eq!(targets, vec![RouteTarget::Local(1)]);
    }

    #[test]
    fn test_c2s_disconnect_cascades_to_sub_users() {
        let mut server = MsgServer::new(b"secret".to_vec(), 8 * 1024 * 1024, 1024 * 1024);
        let nonce = Nonce::generate();
        server.accept_pending(10, nonce);

        struct C2sObserver;
        impl MsgServerObserver for C2sObserver {
            fn on_check_user(&mut self, requested: RtpMsgUser, _public_ip: Ipv4Addr, _app_data: &[u8], _is_c2s_hint: bool) -> CheckUserDecision {
                CheckUserDecision {
                    accepted: true,
                    assigned_user: requested,
                    is_c2s: true,
                }
            }
        }

        let hash = crypto::sha256(&[nonce.as_bytes(), b"secret"]);
        let mut obs = C2sObserver;
        server
            .check_user(10, RtpMsgUser::new(9, 1, 0), Ipv4Addr::new(127, 0, 0, 1), &hash, b"", true, &mut obs)
            .unwrap();
        assert!(server.is_c2s(10));

        let sub_user = RtpMsgUser::new(1, 55, 0);
        server.attach_sub_user(10, sub_user);
        server.users.insert(sub_user, 55);
        server.sessions.insert(55, sub_user);

        let cascaded = server.on_disconnect(10);
        assert_eq!(cascaded, vec![55]);
        assert!(!server.is_c2s(10));
    }
}
