//! Standalone messaging root (§4.10): terminates extended sessions directly (no service-hub in
//! front), admits each one into a `MsgServer` from its first payload, then routes subsequent
//! `RTP_MSG_HEADER`-framed payloads to whatever local session the destination user resolves to.
//! C2S relay destinations are logged and dropped; a standalone binary has no upstream to forward
//! them through (that's the `MsgC2s` wiring a service-host process would do).

use byteorder::ReadBytesExt;
use clap::{App, Arg};
use flux::logging::{self, debug, info, o, warn};
use mio::net::TcpStream;
use mio::Token;
use pronet::acceptor::{ExtendedAcceptor, PendingExAccept};
use pronet::config::MsgServerConfig;
use pronet::error::SessionError;
use pronet::handshake::Nonce;
use pronet::msg::{CheckUserDecision, MsgHeader, MsgHeader0, MsgServer, MsgServerObserver, RouteTarget, RtpMsgUser};
use pronet::reactor::{Interest, Reactor};
use pronet::session::info::SessionType;
use pronet::session::{Session, SessionObserver, SessionTransport};
use pronet::frame::PackMode;
use pronet::transport::tcp::TcpTransport;
use std::collections::HashMap;
use std::io::Cursor;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKEN_LISTENER: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;

/// Pass-through admission policy: a standalone messaging root has no external user directory, so
/// every requester is accepted under the identity it asked for. Real deployments wire an
/// application-specific `MsgServerObserver` in here instead.
struct OpenAdmission;

impl MsgServerObserver for OpenAdmission {
    fn on_check_user(&mut self, requested: RtpMsgUser, _public_ip: Ipv4Addr, _app_data: &[u8], is_c2s_hint: bool) -> CheckUserDecision {
        CheckUserDecision {
            accepted: !requested.is_nil(),
            assigned_user: requested,
            is_c2s: is_c2s_hint,
        }
    }
}

enum SessionEvent {
    Ready(u64),
    Recv(u64, Vec<u8>),
    Send(u64, u64),
    Close(u64, SessionError),
    Heartbeat(u64),
}

#[derive(Default)]
struct EventLog {
    events: Vec<SessionEvent>,
}

impl SessionObserver for EventLog {
    fn on_ready(&mut self, session_id: u64) {
        self.events.push(SessionEvent::Ready(session_id));
    }
    fn on_recv(&mut self, session_id: u64, payload: &[u8]) {
        self.events.push(SessionEvent::Recv(session_id, payload.to_vec()));
    }
    fn on_send(&mut self, session_id: u64, action_id: u64) {
        self.events.push(SessionEvent::Send(session_id, action_id));
    }
    fn on_close(&mut self, session_id: u64, err: SessionError) {
        self.events.push(SessionEvent::Close(session_id, err));
    }
    fn on_heartbeat(&mut self, session_id: u64) {
        self.events.push(SessionEvent::Heartbeat(session_id));
    }
}

/// A connection still inside the nonce/preamble exchange, before a `Session` exists for it.
struct PendingConn {
    pending: PendingExAccept,
}

/// A connection with a live extended `Session`, either still unadmitted (waiting on the first
/// payload to carry a messaging identity) or fully admitted into `MsgServer`.
struct ActiveConn {
    session: Session,
    admitted: bool,
}

/// Decode the standalone admission challenge a client sends as its first payload once the
/// session layer is `Ready`: `RtpMsgUser | is_c2s:u8 | password_hash:32B | app_data...`.
fn read_admission_request(payload: &[u8]) -> Option<(RtpMsgUser, bool, [u8; 32], Vec<u8>)> {
    if payload.len() < RtpMsgUser::WIRE_SIZE + 1 + 32 {
        return None;
    }

    let mut cursor = Cursor::new(payload);
    let user = RtpMsgUser::read(&mut cursor).ok()?;
    let is_c2s = cursor.read_u8().ok()? != 0;

    let mut hash = [0u8; 32];
    std::io::Read::read_exact(&mut cursor, &mut hash).ok()?;

    let pos = cursor.position() as usize;
    Some((user, is_c2s, hash, payload[pos..].to_vec()))
}

fn build_header0(assigned: RtpMsgUser, public_ip: Ipv4Addr) -> Vec<u8> {
    let mut buf = vec![0u8; MsgHeader0::WIRE_SIZE];
    let header = MsgHeader0 {
        version: 1,
        user: assigned,
        public_ip,
    };
    let mut cursor = Cursor::new(&mut buf[..]);
    header.write(&mut cursor).expect("fixed-size header always fits");
    buf
}

fn build_delivery_frame(src_user: RtpMsgUser, charset: u16, body: &[u8]) -> Vec<u8> {
    let header = MsgHeader {
        charset,
        src_user,
        dst_users: Vec::new(),
    };
    let mut buf = vec![0u8; header.encoded_len()];
    {
        let mut cursor = Cursor::new(&mut buf[..]);
        header.write(&mut cursor).expect("header fits its own encoded_len");
    }
    buf.extend_from_slice(body);
    buf
}

fn public_ip_of(session: &Session) -> Ipv4Addr {
    match session.remote_addr() {
        Some(std::net::SocketAddr::V4(addr)) => *addr.ip(),
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

pub fn main() {
    let matches = App::new("msg-server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs a standalone classId/userId/instId messaging root.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the msg-server TOML config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = MsgServerConfig::load(config_path).expect("failed to load msg-server config");

    let log = logging::init(None::<&str>).expect("failed to initialize logging");
    let log = log.new(o!("component" => "msg-server"));

    let bind_addr = config.address.parse().expect("invalid bind address");
    let acceptor = ExtendedAcceptor::bind(bind_addr).expect("failed to bind listener");

    let heartbeat_interval = Duration::from_secs(20);
    let keepalive_timeout = Duration::from_secs(60);
    let mut reactor = Reactor::new(heartbeat_interval, 4096).expect("failed to create reactor");

    reactor
        .register(acceptor.listener(), TOKEN_LISTENER, Interest::READ)
        .expect("failed to register listener");

    let mut msg_server = MsgServer::new(
        config.password.as_bytes().to_vec(),
        config.redlines.c2s_bytes,
        config.redlines.user_bytes,
    );
    let mut admission = OpenAdmission;

    let mut pending: HashMap<usize, PendingConn> = HashMap::new();
    let mut active: HashMap<usize, ActiveConn> = HashMap::new();
    let mut next_token = FIRST_DYNAMIC_TOKEN;
    let mut next_session_id: u64 = 1;
    let mut last_keepalive_sweep = Instant::now();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in &[
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGQUIT,
    ] {
        signal_hook::flag::register(*signal, Arc::clone(&shutdown)).expect("failed to install signal handler");
    }

    info!(log, "msg-server listening"; "address" => %bind_addr);

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        let (io_events, _timer_fires) = reactor
            .turn(now, Some(Duration::from_millis(200)))
            .expect("reactor turn failed");

        if now.duration_since(last_keepalive_sweep) >= heartbeat_interval {
            let mut closed = Vec::new();
            for (&token, conn) in active.iter_mut() {
                let mut events = EventLog::default();
                conn.session.check_keepalive(&mut events, now, keepalive_timeout);
                if events.events.iter().any(|e| matches!(e, SessionEvent::Close(_, _))) {
                    closed.push(token);
                }
            }
            for token in closed {
                teardown(token, &mut active, &mut reactor, &mut msg_server, &log);
            }
            last_keepalive_sweep = now;
        }

        for event in io_events {
            match event.token {
                TOKEN_LISTENER => {
                    if event.readable {
                        accept_loop(&acceptor, &mut reactor, &mut pending, &mut next_token, now, &log);
                    }
                }
                Token(raw) => {
                    if pending.contains_key(&raw) {
                        drive_pending(
                            raw,
                            &mut pending,
                            &mut active,
                            &mut reactor,
                            &mut msg_server,
                            &mut next_session_id,
                            now,
                            &log,
                        );
                    } else if active.contains_key(&raw) {
                        drive_active(raw, event.readable, event.writable, &mut active, &mut reactor, &mut msg_server, &mut admission, now, &log);
                    }
                }
            }
        }
    }

    info!(log, "msg-server shutting down");
}

fn accept_loop(
    acceptor: &ExtendedAcceptor,
    reactor: &mut Reactor,
    pending: &mut HashMap<usize, PendingConn>,
    next_token: &mut usize,
    now: Instant,
    log: &logging::Logger,
) {
    loop {
        match acceptor.accept(now) {
            Ok(Some(conn)) => {
                let token = *next_token;
                *next_token += 1;
                debug!(log, "connection accepted, handshake pending"; "token" => token);

                if reactor.register(&conn.stream, Token(token), Interest::READ).is_ok() {
                    pending.insert(token, PendingConn { pending: conn });
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn drive_pending(
    token: usize,
    pending: &mut HashMap<usize, PendingConn>,
    active: &mut HashMap<usize, ActiveConn>,
    reactor: &mut Reactor,
    msg_server: &mut MsgServer,
    next_session_id: &mut u64,
    now: Instant,
    log: &logging::Logger,
) {
    let outcome = {
        let entry = pending.get_mut(&token).expect("token tracked");
        entry.pending.poll(now)
    };

    match outcome {
        Ok(None) => {}
        Ok(Some(preamble)) => {
            let entry = pending.remove(&token).expect("token tracked");
            let nonce: Nonce = entry.pending.nonce();
            let stream: TcpStream = entry.pending.into_stream();

            let session_id = *next_session_id;
            *next_session_id += 1;

            let transport = SessionTransport::Tcp(TcpTransport::new(stream));
            let session = Session::new_extended_server(
                session_id,
                transport,
                SessionType::TcpServerEx,
                PackMode::Default,
                nonce,
                Vec::new(), // password hash validated at the messaging layer, not the session layer
                now,
            );

            msg_server.accept_pending(session_id, nonce);
            debug!(log, "session established, awaiting admission"; "token" => token, "session_id" => session_id, "service_opt" => preamble.service_opt);
            active.insert(token, ActiveConn { session, admitted: false });
        }
        Err(err) => {
            let entry = pending.remove(&token).expect("token tracked");
            let _ = reactor.deregister(&entry.pending.stream);
            debug!(log, "handshake failed"; "token" => token, "error" => %err);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn drive_active(
    token: usize,
    readable: bool,
    writable: bool,
    active: &mut HashMap<usize, ActiveConn>,
    reactor: &mut Reactor,
    msg_server: &mut MsgServer,
    admission: &mut dyn MsgServerObserver,
    now: Instant,
    log: &logging::Logger,
) {
    let mut events = EventLog::default();
    {
        let conn = active.get_mut(&token).expect("token tracked");
        if readable {
            let _ = conn.session.on_readable(&mut events, now);
        }
        if writable {
            let _ = conn.session.on_writable(&mut events);
        }
    }

    let mut should_teardown = false;
    let mut deliveries: Vec<(u64, Vec<u8>)> = Vec::new();

    for evt in events.events {
        match evt {
            SessionEvent::Ready(session_id) => {
                debug!(log, "session ready"; "session_id" => session_id);
            }
            SessionEvent::Recv(session_id, payload) => {
                let conn = active.get_mut(&token).expect("token tracked");
                if !conn.admitted {
                    handle_admission(session_id, &payload, conn, msg_server, admission, log);
                } else if let Some((header, body)) = parse_message(&payload) {
                    for target in msg_server.resolve(&header.dst_users) {
                        match target {
                            RouteTarget::Local(dst_session_id) => {
                                if msg_server.try_reserve(RouteTarget::Local(dst_session_id)) {
                                    let frame = build_delivery_frame(header.src_user, header.charset, &body);
                                    deliveries.push((dst_session_id, frame));
                                } else {
                                    warn!(log, "dropping message, destination over redline"; "dst_session_id" => dst_session_id);
                                }
                            }
                            RouteTarget::C2s(relay_session_id) => {
                                warn!(log, "c2s destination not reachable from a standalone msg-server"; "relay_session_id" => relay_session_id);
                            }
                        }
                    }
                } else {
                    warn!(log, "malformed message frame"; "session_id" => session_id);
                }
            }
            SessionEvent::Send(_, _) => {}
            SessionEvent::Heartbeat(_) => {}
            SessionEvent::Close(session_id, err) => {
                debug!(log, "session closed"; "session_id" => session_id, "error" => %err);
                should_teardown = true;
            }
        }
    }

    deliver(active, &deliveries, log);

    if should_teardown {
        teardown(token, active, reactor, msg_server, log);
    }
}

fn handle_admission(
    session_id: u64,
    payload: &[u8],
    conn: &mut ActiveConn,
    msg_server: &mut MsgServer,
    admission: &mut dyn MsgServerObserver,
    log: &logging::Logger,
) {
    let parsed = read_admission_request(payload);
    let (requested, is_c2s, hash, app_data) = match parsed {
        Some(parsed) => parsed,
        None => {
            warn!(log, "malformed admission request"; "session_id" => session_id);
            return;
        }
    };

    let public_ip = public_ip_of(&conn.session);
    match msg_server.check_user(session_id, requested, public_ip, &hash, &app_data, is_c2s, admission) {
        Ok(assigned) => {
            conn.admitted = true;
            let header0 = build_header0(assigned, public_ip);
            let _ = conn.session.send(&header0);
            info!(log, "user admitted"; "session_id" => session_id, "user_id" => assigned.user_id, "class_id" => assigned.class_id);
        }
        Err(err) => {
            warn!(log, "admission rejected"; "session_id" => session_id, "error" => %err);
        }
    }
}

fn parse_message(payload: &[u8]) -> Option<(MsgHeader, Vec<u8>)> {
    let mut cursor = Cursor::new(payload);
    let header = MsgHeader::read(&mut cursor).ok()?;
    let pos = cursor.position() as usize;
    let body = payload[pos..].to_vec();
    Some((header, body))
}

fn deliver(active: &mut HashMap<usize, ActiveConn>, deliveries: &[(u64, Vec<u8>)], log: &logging::Logger) {
    for (dst_session_id, frame) in deliveries {
        let target = active.values_mut().find(|conn| conn.session.id() == *dst_session_id);
        match target {
            Some(conn) => {
                let _ = conn.session.send(frame);
            }
            None => warn!(log, "destination session vanished before delivery"; "dst_session_id" => dst_session_id),
        }
    }
}

fn teardown(
    token: usize,
    active: &mut HashMap<usize, ActiveConn>,
    reactor: &mut Reactor,
    msg_server: &mut MsgServer,
    log: &logging::Logger,
) {
    if let Some(conn) = active.remove(&token) {
        let session_id = conn.session.id();
        if let SessionTransport::Tcp(t) = conn.session.transport() {
            let _ = reactor.deregister(t.stream());
        }
        let cascaded = msg_server.on_disconnect(session_id);
        for sub_session_id in cascaded {
            debug!(log, "cascading disconnect"; "parent_session_id" => session_id, "sub_session_id" => sub_session_id);
        }
    }
}
