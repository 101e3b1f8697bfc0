// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Session table: per-flow state and deadline, indexed by the full endpoint 4-tuple and by
//! deadline order for the expiry sweeper.

pub mod tcp;

use std::cmp::Reverse;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use priority_queue::PriorityQueue;

use crate::bib::BibTable;
use crate::config::GlobalConfig;
use crate::error::{NatError, NatResult};
use crate::tuple::{L4Proto, Tuple4Endpoint, Tuple6Endpoint};

pub use tcp::{TcpDeadlineKind, TcpEvent, TcpState};

const V4_INIT_GRACE: Duration = Duration::from_secs(6);

/// Identifies a BIB entry without borrowing it: `(proto, ipv6, ipv4)`, the same triple
/// [`BibTable`] indexes by.
pub type BibKey = (L4Proto, Tuple6Endpoint, Tuple4Endpoint);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub remote6: Tuple6Endpoint,
    pub local6: Tuple6Endpoint,
    pub local4: Tuple4Endpoint,
    pub remote4: Tuple4Endpoint,
    pub proto: L4Proto,
}

#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub key: SessionKey,
    pub bib: BibKey,
    pub state: TcpState,
    pub deadline: Instant,
}

fn proto_index(proto: L4Proto) -> usize {
    match proto {
        L4Proto::Udp => 0,
        L4Proto::Tcp => 1,
        L4Proto::Icmp => 2,
    }
}

fn ttl_for(kind: TcpDeadlineKind, cfg: &GlobalConfig) -> Duration {
    match kind {
        TcpDeadlineKind::Est => cfg.ttl.tcp_est.as_duration(),
        TcpDeadlineKind::Trans => cfg.ttl.tcp_trans.as_duration(),
        TcpDeadlineKind::V4InitGrace => V4_INIT_GRACE,
    }
}

struct Deadlines {
    queues: [Mutex<PriorityQueue<SessionKey, Reverse<Instant>>>; 3],
}

impl Deadlines {
    fn new() -> Self {
        Self {
            queues: [
                Mutex::new(PriorityQueue::new()),
                Mutex::new(PriorityQueue::new()),
                Mutex::new(PriorityQueue::new()),
            ],
        }
    }

    fn push(&self, proto: L4Proto, key: SessionKey, deadline: Instant) {
        let mut q = self.queues[proto_index(proto)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        q.push(key, Reverse(deadline));
    }

    fn update(&self, proto: L4Proto, key: SessionKey, deadline: Instant) {
        let mut q = self.queues[proto_index(proto)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if q.change_priority(&key, Reverse(deadline)).is_none() {
            q.push(key, Reverse(deadline));
        }
    }

    fn remove(&self, proto: L4Proto, key: &SessionKey) {
        let mut q = self.queues[proto_index(proto)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        q.remove(key);
    }

    fn pop_expired(&self, proto: L4Proto, now: Instant) -> Vec<SessionKey> {
        let mut q = self.queues[proto_index(proto)]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        while let Some((_, Reverse(deadline))) = q.peek() {
            if *deadline > now {
                break;
            }
            if let Some((key, _)) = q.pop() {
                out.push(key);
            }
        }
        out
    }
}

/// Holds every live session plus the deadline queues the sweeper drains. A session pins its BIB
/// entry only through the refcount in `bib_refs`, never through an `Arc` back-pointer stored on
/// the entry itself.
pub struct SessionTable {
    sessions: DashMap<SessionKey, Session>,
    bib_refs: DashMap<BibKey, AtomicUsize>,
    deadlines: Deadlines,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            bib_refs: DashMap::new(),
            deadlines: Deadlines::new(),
        }
    }

    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.get(key).map(|s| *s)
    }

    /// Installs a new session pinning `bib`, with an initial deadline `ttl` in the future. Bumps
    /// the BIB entry's session refcount.
    #[tracing::instrument(skip(self), fields(proto = %key.proto))]
    pub fn create(
        &self,
        key: SessionKey,
        bib: BibKey,
        initial_state: TcpState,
        ttl: Duration,
        log: bool,
    ) -> NatResult<()> {
        if self.sessions.contains_key(&key) {
            return Err(NatError::AlreadyExists);
        }
        let deadline = Instant::now() + ttl;
        self.sessions.insert(
            key,
            Session {
                key,
                bib,
                state: initial_state,
                deadline,
            },
        );
        self.bib_refs
            .entry(bib)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::SeqCst);
        self.deadlines.push(key.proto, key, deadline);
        if log {
            tracing::info!(proto = %key.proto, "session created");
        } else {
            tracing::debug!(proto = %key.proto, "session created");
        }
        Ok(())
    }

    /// Refreshes a UDP/ICMP session's deadline on traffic.
    pub fn refresh(&self, key: &SessionKey, ttl: Duration) -> NatResult<()> {
        let mut entry = self.sessions.get_mut(key).ok_or(NatError::NotFound)?;
        entry.deadline = Instant::now() + ttl;
        let deadline = entry.deadline;
        drop(entry);
        self.deadlines.update(key.proto, *key, deadline);
        Ok(())
    }

    /// Drives a TCP session through [`tcp::transition`]. A `None` transition (the event has no
    /// effect in the current state) is a no-op, not an error.
    pub fn on_tcp_event(
        &self,
        key: &SessionKey,
        event: TcpEvent,
        cfg: &GlobalConfig,
    ) -> NatResult<TcpState> {
        let mut entry = self.sessions.get_mut(key).ok_or(NatError::NotFound)?;
        match tcp::transition(entry.state, event, cfg.handle_rst_during_fin_rcv) {
            Some((next, deadline_kind)) => {
                entry.state = next;
                entry.deadline = Instant::now() + ttl_for(deadline_kind, cfg);
            }
            None if entry.state == TcpState::Established => {
                entry.deadline = Instant::now() + cfg.ttl.tcp_est.as_duration();
            }
            None => {}
        }
        let next = entry.state;
        let deadline = entry.deadline;
        drop(entry);
        self.deadlines.update(key.proto, *key, deadline);
        Ok(next)
    }

    /// Removes every expired session across all protocols and, for each BIB entry whose last
    /// session just disappeared, removes it from `bib` unless it is static. Returns the number of
    /// sessions reaped.
    pub fn sweep_expired(&self, bib: &BibTable) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for proto in [L4Proto::Udp, L4Proto::Tcp, L4Proto::Icmp] {
            for key in self.deadlines.pop_expired(proto, now) {
                let Some((_, session)) = self.sessions.remove(&key) else {
                    continue;
                };
                reaped += 1;
                tracing::debug!(proto = %key.proto, "session expired");
                self.release_bib_ref(session.bib, bib);
            }
        }
        reaped
    }

    fn release_bib_ref(&self, bib_key: BibKey, bib: &BibTable) {
        let Some(count) = self.bib_refs.get(&bib_key) else {
            return;
        };
        if count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        drop(count);
        self.bib_refs.remove(&bib_key);

        let (proto, ipv6, ipv4) = bib_key;
        let Some(entry) = bib.get4(proto, ipv4) else {
            return;
        };
        if entry.is_static {
            return;
        }
        let _ = bib.remove(proto, ipv6, ipv4);
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the background expiry sweeper. Gated behind the `sweeper` feature so deterministic unit
/// tests can drive `sweep_expired` manually instead.
#[cfg(feature = "sweeper")]
pub fn spawn_sweeper(
    table: Arc<SessionTable>,
    bib: Arc<BibTable>,
    poll_interval: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(poll_interval);
        table.sweep_expired(&bib);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    use crate::bib::BibEntry;

    fn key(proto: L4Proto) -> SessionKey {
        SessionKey {
            remote6: Tuple6Endpoint::new(Ipv6Addr::LOCALHOST, 1000),
            local6: Tuple6Endpoint::new(Ipv6Addr::UNSPECIFIED, 53),
            local4: Tuple4Endpoint::new(Ipv4Addr::new(192, 0, 2, 1), 4000),
            remote4: Tuple4Endpoint::new(Ipv4Addr::new(198, 51, 100, 1), 53),
            proto,
        }
    }

    fn install_bib(bib: &BibTable, k: &SessionKey, is_static: bool) -> BibKey {
        let entry = BibEntry {
            ipv6: k.remote6,
            ipv4: k.local4,
            proto: k.proto,
            mark: 0,
            is_static,
        };
        bib.add_dynamic(entry).unwrap();
        (k.proto, k.remote6, k.local4)
    }

    #[test]
    fn create_then_expire_removes_dynamic_bib_entry() {
        let bib = BibTable::new();
        let sessions = SessionTable::new();
        let k = key(L4Proto::Udp);
        let bib_key = install_bib(&bib, &k, false);

        sessions
            .create(k, bib_key, TcpState::Established, Duration::from_millis(1), false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let reaped = sessions.sweep_expired(&bib);
        assert_eq!(reaped, 1);
        assert!(!bib.contains4(L4Proto::Udp, k.local4));
    }

    #[test]
    fn static_bib_entry_survives_session_expiry() {
        let bib = BibTable::new();
        let sessions = SessionTable::new();
        let k = key(L4Proto::Tcp);
        let bib_key = install_bib(&bib, &k, true);

        sessions
            .create(k, bib_key, TcpState::Established, Duration::from_millis(1), false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        sessions.sweep_expired(&bib);
        assert!(bib.contains4(L4Proto::Tcp, k.local4));
    }

    #[test]
    fn tcp_handshake_then_deadline_closes_entry() {
        let bib = BibTable::new();
        let sessions = SessionTable::new();
        let k = key(L4Proto::Tcp);
        let bib_key = install_bib(&bib, &k, false);
        let mut cfg = GlobalConfig::default();
        cfg.ttl.tcp_trans = crate::config::NatDuration::from_millis(1);

        sessions
            .create(
                k,
                bib_key,
                TcpState::Established,
                Duration::from_secs(3600),
                false,
            )
            .unwrap();
        let st = sessions.on_tcp_event(&k, TcpEvent::Fin4In, &cfg).unwrap();
        assert_eq!(st, TcpState::V4FinRcv);
        let st = sessions.on_tcp_event(&k, TcpEvent::Fin6In, &cfg).unwrap();
        assert_eq!(st, TcpState::V4V6FinRcv);

        std::thread::sleep(Duration::from_millis(20));
        let reaped = sessions.sweep_expired(&bib);
        assert_eq!(reaped, 1);
        assert!(sessions.get(&k).is_none());
    }
}
