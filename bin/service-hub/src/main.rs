//! Standalone binary for the service-hub (§4.7): accepts service-host registrations on one port
//! and client connections (via the extended preamble handshake) on another, dispatching each
//! client to a live host per the configured policy. The actual socket hand-off to the chosen
//! host is a deployment-specific relay this binary only logs the decision for; see the dispatch
//! note next to `ServiceHub` in the library.

use clap::{App, Arg};
use flux::logging::{self, debug, info, o, warn};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use pronet::acceptor::{ExtendedAcceptor, PendingExAccept};
use pronet::config::HubConfig;
use pronet::reactor::{Interest, Reactor};
use pronet::servicehub::{HostRecord, ServiceHub, ServiceHubObserver};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKEN_HOST_LISTENER: Token = Token(0);
const TOKEN_CLIENT_LISTENER: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

struct LoggingObserver {
    log: logging::Logger,
}

impl ServiceHubObserver for LoggingObserver {
    fn on_host_connected(&mut self, host_id: u64, service_id: u8) {
        info!(self.log, "host registered"; "host_id" => host_id, "service_id" => service_id);
    }

    fn on_host_disconnected(&mut self, host_id: u64, service_id: u8, timed_out: bool) {
        warn!(self.log, "host disconnected"; "host_id" => host_id, "service_id" => service_id, "timed_out" => timed_out);
    }
}

struct PendingHost {
    stream: TcpStream,
    buf: Vec<u8>,
}

struct RegisteredHost {
    stream: TcpStream,
    host_id: u64,
}

struct PendingClient {
    pending: PendingExAccept,
}

pub fn main() {
    let matches = App::new("service-hub")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the service-hub dispatcher.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the hub TOML config file")
                .required(true),
        )
        .arg(
            Arg::with_name("registration_port")
                .long("registration-port")
                .help("Port service-hosts register themselves on")
                .takes_value(true)
                .default_value("3999"),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = HubConfig::load(config_path).expect("failed to load hub config");
    let registration_port: u16 = matches
        .value_of("registration_port")
        .unwrap()
        .parse()
        .expect("registration port must be a valid u16");

    let log = logging::init(None::<&str>).expect("failed to initialize logging");
    let log = log.new(o!("component" => "service-hub"));

    let bind_ip = config.address.clone();
    let host_addr = format!("{}:{}", bind_ip, registration_port)
        .parse()
        .expect("invalid registration bind address");
    let client_addr = format!("{}:{}", bind_ip, config.default_port)
        .parse()
        .expect("invalid client bind address");

    let host_listener = TcpListener::bind(&host_addr).expect("failed to bind registration listener");
    let client_acceptor = ExtendedAcceptor::bind(client_addr).expect("failed to bind client listener");

    let heartbeat_interval = Duration::from_secs(20);
    let mut reactor = Reactor::new(heartbeat_interval, 4096).expect("failed to create reactor");

    reactor
        .register(&host_listener, TOKEN_HOST_LISTENER, Interest::READ)
        .expect("failed to register registration listener");
    reactor
        .register(client_acceptor.listener(), TOKEN_CLIENT_LISTENER, Interest::READ)
        .expect("failed to register client listener");

    let mut hub = ServiceHub::new(config.dispatch_policy);
    let mut observer = LoggingObserver { log: log.clone() };

    let mut pending_hosts: HashMap<usize, PendingHost> = HashMap::new();
    let mut registered_hosts: HashMap<usize, RegisteredHost> = HashMap::new();
    let mut pending_clients: HashMap<usize, PendingClient> = HashMap::new();
    let mut next_token = FIRST_DYNAMIC_TOKEN;
    let mut last_prune = Instant::now();

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in &[
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGQUIT,
    ] {
        signal_hook::flag::register(*signal, Arc::clone(&shutdown)).expect("failed to install signal handler");
    }

    info!(log, "service-hub listening"; "hosts" => %host_addr, "clients" => %client_addr);

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        let (io_events, _timer_fires) = reactor
            .turn(now, Some(Duration::from_millis(200)))
            .expect("reactor turn failed");

        if now.duration_since(last_prune) >= heartbeat_interval {
            hub.prune_dead_hosts(now, heartbeat_interval, &mut observer);
            last_prune = now;
        }

        for event in io_events {
            if !event.readable {
                continue;
            }

            match event.token {
                TOKEN_HOST_LISTENER => accept_hosts(
                    &host_listener,
                    &mut reactor,
                    &mut pending_hosts,
                    &mut next_token,
                    &log,
                ),
                TOKEN_CLIENT_LISTENER => accept_clients(
                    &client_acceptor,
                    &mut reactor,
                    &mut pending_clients,
                    &mut next_token,
                    now,
                    &log,
                ),
                Token(raw) => {
                    if pending_hosts.contains_key(&raw) {
                        drive_pending_host(raw, &mut pending_hosts, &mut registered_hosts, &mut reactor, &mut hub, now, &mut observer, &log);
                    } else if registered_hosts.contains_key(&raw) {
                        drive_registered_host(raw, &mut registered_hosts, &mut reactor, &mut hub, now, &mut observer);
                    } else if pending_clients.contains_key(&raw) {
                        drive_pending_client(raw, &mut pending_clients, &mut reactor, &mut hub, now, &log);
                    }
                }
            }
        }
    }

    info!(log, "service-hub shutting down");
}

fn accept_hosts(
    listener: &TcpListener,
    reactor: &mut Reactor,
    pending_hosts: &mut HashMap<usize, PendingHost>,
    next_token: &mut usize,
    log: &logging::Logger,
) {
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                let token = *next_token;
                *next_token += 1;
                debug!(log, "registration connection accepted"; "remote" => %remote, "token" => token);

                if reactor.register(&stream, Token(token), Interest::READ).is_ok() {
                    pending_hosts.insert(token, PendingHost { stream, buf: Vec::new() });
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

fn accept_clients(
    acceptor: &ExtendedAcceptor,
    reactor: &mut Reactor,
    pending_clients: &mut HashMap<usize, PendingClient>,
    next_token: &mut usize,
    now: Instant,
    log: &logging::Logger,
) {
    loop {
        match acceptor.accept(now) {
            Ok(Some(pending)) => {
                let token = *next_token;
                *next_token += 1;
                debug!(log, "client connection accepted, handshake pending"; "token" => token);

                if reactor.register(&pending.stream, Token(token), Interest::READ).is_ok() {
                    pending_clients.insert(token, PendingClient { pending });
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn drive_pending_host(
    token: usize,
    pending_hosts: &mut HashMap<usize, PendingHost>,
    registered_hosts: &mut HashMap<usize, RegisteredHost>,
    reactor: &mut Reactor,
    hub: &mut ServiceHub,
    now: Instant,
    observer: &mut dyn ServiceHubObserver,
    log: &logging::Logger,
) {
    let done = {
        let entry = pending_hosts.get_mut(&token).expect("token tracked");
        let mut chunk = [0u8; 64];
        match entry.stream.read(&mut chunk) {
            Ok(0) => true,
            Ok(n) => {
                entry.buf.extend_from_slice(&chunk[..n]);
                entry.buf.len() >= HostRecord::WIRE_SIZE
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    };

    if !done {
        return;
    }

    let entry = pending_hosts.remove(&token).expect("token tracked");
    let _ = reactor.deregister(&entry.stream);

    if entry.buf.len() < HostRecord::WIRE_SIZE {
        debug!(log, "registration connection closed before sending a full record"; "token" => token);
        return;
    }

    let mut cursor = std::io::Cursor::new(&entry.buf[..HostRecord::WIRE_SIZE]);
    match HostRecord::read(&mut cursor) {
        Ok(record) => {
            let host_id = hub.register_host(record, now, observer);
            if reactor.register(&entry.stream, Token(token), Interest::READ).is_ok() {
                registered_hosts.insert(token, RegisteredHost { stream: entry.stream, host_id });
            }
        }
        Err(err) => {
            warn!(log, "malformed host record"; "token" => token, "error" => %err);
        }
    }
}

fn drive_registered_host(
    token: usize,
    registered_hosts: &mut HashMap<usize, RegisteredHost>,
    reactor: &mut Reactor,
    hub: &mut ServiceHub,
    now: Instant,
    observer: &mut dyn ServiceHubObserver,
) {
    let mut chunk = [0u8; 64];
    let closed = {
        let entry = registered_hosts.get_mut(&token).expect("token tracked");
        match entry.stream.read(&mut chunk) {
            Ok(0) => true,
            Ok(_) => {
                hub.touch_heartbeat(entry.host_id, now);
                false
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    };

    if closed {
        let entry = registered_hosts.remove(&token).expect("token tracked");
        let _ = reactor.deregister(&entry.stream);
        hub.unregister_host(entry.host_id, observer);
    }
}

fn drive_pending_client(
    token: usize,
    pending_clients: &mut HashMap<usize, PendingClient>,
    reactor: &mut Reactor,
    hub: &mut ServiceHub,
    now: Instant,
    log: &logging::Logger,
) {
    let outcome = {
        let entry = pending_clients.get_mut(&token).expect("token tracked");
        entry.pending.poll(now)
    };

    match outcome {
        Ok(None) => {}
        Ok(Some(preamble)) => {
            let entry = pending_clients.remove(&token).expect("token tracked");
            let _ = reactor.deregister(&entry.pending.stream);

            match hub.select_host(preamble.service_id) {
                Some(host_id) => info!(
                    log,
                    "dispatch decision";
                    "token" => token,
                    "service_id" => preamble.service_id,
                    "host_id" => host_id
                ),
                None => warn!(log, "no live host for service"; "token" => token, "service_id" => preamble.service_id),
            }
        }
        Err(err) => {
            let entry = pending_clients.remove(&token).expect("token tracked");
            let _ = reactor.deregister(&entry.pending.stream);
            debug!(log, "client handshake failed"; "token" => token, "error" => %err);
        }
    }
}
