//! Service-Hub/Service-Host dispatch (§4.7): one hub listens on a port and fans each accepted
//! connection out to a sibling process that has registered a `service_id` on the hub's
//! registration pipe. This module owns the registration/liveness/selection *protocol*; the
//! actual socket hand-off (fd-passing on Unix, or a proxy-connect relay where that isn't
//! available) is a deployment/wiring concern left to the binary that drives a `ServiceHub` — see
//! the dispatch note in the design ledger.

use crate::config::DispatchPolicy;
use crate::handshake::Nonce;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flux::shared::{NetworkResult, SizedRead, SizedWrite};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type HostId = u64;

/// The fixed-size record a Service-Host writes over the registration pipe on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRecord {
    pub service_id: u8,
    pub priority: u8,
    pub process_id: u64,
}

impl HostRecord {
    pub const WIRE_SIZE: usize = 1 + 1 + 8;

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u8(self.service_id)?;
        stream.write_u8(self.priority)?;
        stream.write_u64::<BigEndian>(self.process_id)?;
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<HostRecord> {
        let service_id = stream.read_u8()?;
        let priority = stream.read_u8()?;
        let process_id = stream.read_u64::<BigEndian>()?;
        Ok(HostRecord {
            service_id,
            priority,
            process_id,
        })
    }
}

/// A notice the hub sends down a host's registration connection once it has picked that host
/// for a newly accepted connection. The proxy-connect fallback has the host dial `relay_addr`
/// and identify itself by writing `sock_id` as the first 8 bytes, at which point the hub splices
/// the original client connection to whatever arrives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchNotice {
    pub sock_id: u64,
    pub service_opt: u8,
    pub nonce: Option<Nonce>,
}

struct HostEntry {
    service_id: u8,
    priority: u8,
    process_id: u64,
    last_heartbeat: Instant,
}

/// Upcalls fired as hosts join/leave the dispatch set.
pub trait ServiceHubObserver {
    fn on_host_connected(&mut self, host_id: HostId, service_id: u8);
    fn on_host_disconnected(&mut self, host_id: HostId, service_id: u8, timed_out: bool);
}

/// The registration table and dispatch-policy selector for one hub. Driven by the owner: feed it
/// `HostRecord`s as they arrive on the registration pipe, heartbeats as they're observed, and ask
/// it to `select_host` for each newly accepted connection.
pub struct ServiceHub {
    policy: DispatchPolicy,
    hosts: HashMap<HostId, HostEntry>,
    next_host_id: HostId,
    /// Round-robin cursor per `service_id`, used by `LoadBalance`.
    rr_cursor: HashMap<u8, usize>,
}

impl ServiceHub {
    pub fn new(policy: DispatchPolicy) -> ServiceHub {
        ServiceHub {
            policy,
            hosts: HashMap::new(),
            next_host_id: 1,
            rr_cursor: HashMap::new(),
        }
    }

    /// Register a newly connected host, returning the `HostId` used to refer to it afterward.
    pub fn register_host(&mut self, record: HostRecord, now: Instant, observer: &mut dyn ServiceHubObserver) -> HostId {
        let host_id = self.next_host_id;
        self.next_host_id += 1;

        self.hosts.insert(
            host_id,
            HostEntry {
                service_id: record.service_id,
                priority: record.priority,
                process_id: record.process_id,
                last_heartbeat: now,
            },
        );

        observer.on_host_connected(host_id, record.service_id);
        host_id
    }

    pub fn touch_heartbeat(&mut self, host_id: HostId, now: Instant) {
        if let Some(entry) = self.hosts.get_mut(&host_id) {
            entry.last_heartbeat = now;
        }
    }

    /// Explicit disconnect (pipe EOF), as opposed to a heartbeat timeout.
    pub fn unregister_host(&mut self, host_id: HostId, observer: &mut dyn ServiceHubObserver) {
        if let Some(entry) = self.hosts.remove(&host_id) {
            observer.on_host_disconnected(host_id, entry.service_id, false);
        }
    }

    /// Drop any host whose last heartbeat is older than `2 * heartbeat_interval` (the "2x miss"
    /// rule), firing `on_host_disconnected` with `timed_out = true` for each.
    pub fn prune_dead_hosts(&mut self, now: Instant, heartbeat_interval: Duration, observer: &mut dyn ServiceHubObserver) {
        let deadline = heartbeat_interval * 2;
        let dead: Vec<HostId> = self
            .hosts
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_heartbeat) >= deadline)
            .map(|(&id, _)| id)
            .collect();

        for host_id in dead {
            if let Some(entry) = self.hosts.remove(&host_id) {
                observer.on_host_disconnected(host_id, entry.service_id, true);
            }
        }
    }

    /// Pick a live host for `service_id` per the configured dispatch policy. `None` means no host
    /// has registered that service (the caller should close the connection).
    pub fn select_host(&mut self, service_id: u8) -> Option<HostId> {
        match self.policy {
            DispatchPolicy::ActiveStandby => self
                .hosts
                .iter()
                .filter(|(_, entry)| entry.service_id == service_id)
                .max_by_key(|(_, entry)| entry.priority)
                .map(|(&id, _)| id),
            DispatchPolicy::LoadBalance => {
                let mut candidates: Vec<HostId> = self
                    .hosts
                    .iter()
                    .filter(|(_, entry)| entry.service_id == service_id)
                    .map(|(&id, _)| id)
                    .collect();
                candidates.sort_unstable();

                if candidates.is_empty() {
                    return None;
                }

                let cursor = self.rr_cursor.entry(service_id).or_insert(0);
                let picked = candidates[*cursor % candidates.len()];
                *cursor = (*cursor + 1) % candidates.len();
                Some(picked)
            }
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn host_service_id(&self, host_id: HostId) -> Option<u8> {
        self.hosts.get(&host_id).map(|entry| entry.service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        connected: Vec<(HostId, u8)>,
        disconnected: Vec<(HostId, u8, bool)>,
    }

    impl ServiceHubObserver for RecordingObserver {
        fn on_host_connected(&mut self, host_id: HostId, service_id: u8) {
            self.connected.push((host_id, service_id));
        }
        fn on_host_disconnected(&mut self, host_id: HostId, service_id: u8, timed_out: bool) {
            self.disconnected.push((host_id, service_id, timed_out));
        }
    }

    #[test]
    fn test_host_record_roundtrip() {
        use std::io::Cursor;

        let record = HostRecord {
            service_id: 11,
            priority: 5,
            process_id: 0xdead_beef,
        };
        let mut buf = vec![0u8; HostRecord::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            record.write(&mut cursor).unwrap();
        }
        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(HostRecord::read(&mut cursor).unwrap(), record);
    }

    #[test]
    fn test_active_standby_picks_highest_priority() {
        let mut hub = ServiceHub::new(DispatchPolicy::ActiveStandby);
        let mut obs = RecordingObserver::default();
        let now = Instant::now();

        let low = hub.register_host(HostRecord { service_id: 11, priority: 1, process_id: 1 }, now, &mut obs);
        let high = hub.register_host(HostRecord { service_id: 11, priority: 9, process_id: 2 }, now, &mut obs);

        assert_eq!(hub.select_host(11), Some(high));

        hub.unregister_host(high, &mut obs);
        assert_eq!(hub.select_host(11), Some(low));
    }

    #[test]
    fn test_load_balance_round_robins() {
        let mut hub = ServiceHub::new(DispatchPolicy::LoadBalance);
        let mut obs = RecordingObserver::default();
        let now = Instant::now();

        let a = hub.register_host(HostRecord { service_id: 12, priority: 0, process_id: 1 }, now, &mut obs);
        let b = hub.register_host(HostRecord { service_id: 12, priority: 0, process_id: 2 }, now, &mut obs);

        let first = hub.select_host(12).unwrap();
        let second = hub.select_host(12).unwrap();
        let third = hub.select_host(12).unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
        assert!([a, b].contains(&first));
    }

    #[test]
    fn test_dispatch_to_unregistered_service_is_none() {
        let mut hub = ServiceHub::new(DispatchPolicy::LoadBalance);
        assert_eq!(hub.select_host(42), None);
    }

    #[test]
    fn test_prune_dead_hosts_fires_timeout_disconnect() {
        let mut hub = ServiceHub::new(DispatchPolicy::ActiveStandby);
        let mut obs = RecordingObserver::default();
        let now = Instant::now();

        let host = hub.register_host(HostRecord { service_id: 11, priority: 1, process_id: 1 }, now, &mut obs);
        hub.prune_dead_hosts(now + Duration::from_secs(41), Duration::from_secs(20), &mut obs);

        assert_eq!(hub.select_host(11), None);
        assert_eq!(obs.disconnected, vec![(host, 11, true)]);
    }

    #[test]
    fn test_fresh_heartbeat_survives_prune() {
        let mut hub = ServiceHub::new(DispatchPolicy::ActiveStandby);
        let mut obs = RecordingObserver::default();
        let now = Instant::now();

        let host = hub.register_host(HostRecord { service_id: 11, priority: 1, process_id: 1 }, now, &mut obs);
        hub.touch_heartbeat(host, now + Duration::from_secs(30));
        hub.prune_dead_hosts(now + Duration::from_secs(41), Duration::from_secs(20), &mut obs);

        assert_eq!(hub.select_host(11), Some(host));
    }
}
