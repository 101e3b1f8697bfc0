// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Datapath dispatcher: derives a tuple's BIB/session state and produces a translation verdict.
//!
//! This is the one place a [`crate::error::NatError`] is allowed to stop meaning "propagate to
//! caller": every internal anomaly here becomes [`Verdict::Drop`] plus a rate-limited log line,
//! per the error model in [`crate::error`].

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::allocator::PortAllocator;
use crate::bib::{BibEntry, BibTable};
use crate::config::ConfigStore;
use crate::error::NatResult;
use crate::pool4::Pool4Db;
use crate::session::{SessionKey, SessionTable, TcpEvent, TcpState};
use crate::tuple::{L4Proto, Tuple4, Tuple4Endpoint, Tuple6, Tuple6Endpoint};

/// The outcome of processing one packet. Mirrors the reference implementation's verdict set;
/// `Stolen` means a collaborator (e.g. fragment reassembly) has taken ownership of the packet and
/// the dispatcher has nothing further to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Translate,
    Drop,
    Stolen,
    Accept,
}

/// What kind of event this packet represents for the purpose of session-state bookkeeping. For
/// TCP this is the SYN/FIN/RST/data classification the state machine in [`crate::session::tcp`]
/// consumes; deriving it from the actual header is an external collaborator's job (packet
/// parsing is out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketEvent {
    Udp,
    Icmp,
    Tcp(TcpEvent),
}

/// Deduplicates a rate-limited log line so a sustained condition (e.g. pool exhaustion) doesn't
/// flood the log: at most one warning per `window` for a given reason.
struct RateLimiter {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

pub struct Dispatcher {
    pub config: ConfigStore,
    pub pool4: Pool4Db,
    pub bib: BibTable,
    pub sessions: SessionTable,
    allocator: PortAllocator,
    drop_log: RateLimiter,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: ConfigStore, pool4: Pool4Db) -> Self {
        Self {
            config,
            pool4,
            bib: BibTable::new(),
            sessions: SessionTable::new(),
            allocator: PortAllocator::new(),
            drop_log: RateLimiter::new(Duration::from_secs(1)),
        }
    }

    fn initial_ttl(proto: L4Proto, event: PacketEvent, cfg: &crate::config::GlobalConfig) -> Duration {
        match (proto, event) {
            (L4Proto::Udp, _) => cfg.ttl.udp.as_duration(),
            (L4Proto::Icmp, _) => cfg.ttl.icmp.as_duration(),
            (L4Proto::Tcp, PacketEvent::Tcp(TcpEvent::Syn4In)) => Duration::from_secs(6),
            (L4Proto::Tcp, _) => cfg.ttl.tcp_trans.as_duration(),
        }
    }

    fn initial_state(proto: L4Proto, event: PacketEvent) -> TcpState {
        match (proto, event) {
            (L4Proto::Tcp, PacketEvent::Tcp(TcpEvent::Syn6In)) => TcpState::V6Init,
            (L4Proto::Tcp, PacketEvent::Tcp(TcpEvent::Syn4In)) => TcpState::V4Init,
            _ => TcpState::Established,
        }
    }

    /// Processes an inbound IPv6→IPv4 packet. `remote4` is the already-embedded IPv4 destination
    /// endpoint (derived by the external header-translation collaborator); `event` classifies the
    /// packet for the session state machine.
    pub fn process_6in(&self, tuple: Tuple6, remote4: Tuple4Endpoint, event: PacketEvent) -> Verdict {
        match self.try_process_6in(tuple, remote4, event) {
            Ok(v) => v,
            Err(e) => {
                if self.drop_log.allow() {
                    tracing::warn!(error = %e, mark = tuple.mark, proto = %tuple.proto, "dropping inbound ipv6 packet");
                }
                Verdict::Drop
            }
        }
    }

    fn try_process_6in(
        &self,
        tuple: Tuple6,
        remote4: Tuple4Endpoint,
        event: PacketEvent,
    ) -> NatResult<Verdict> {
        let cfg = self.config.current();

        if tuple.proto == L4Proto::Icmp && cfg.drop_icmp6_info {
            return Ok(Verdict::Drop);
        }

        let bib_entry = match self.bib.get6(tuple.proto, tuple.src) {
            Some(e) => e,
            None => {
                let candidate = self.allocator.allocate(
                    &tuple,
                    tuple.proto,
                    None,
                    cfg.f_args,
                    &self.pool4,
                    &self.bib,
                )?;
                self.bib.add_dynamic(BibEntry {
                    ipv6: tuple.src,
                    ipv4: candidate,
                    proto: tuple.proto,
                    mark: tuple.mark,
                    is_static: false,
                })?
            }
        };

        let key = SessionKey {
            remote6: tuple.src,
            local6: tuple.dst,
            local4: bib_entry.ipv4,
            remote4,
            proto: tuple.proto,
        };

        if self.sessions.get(&key).is_none() {
            let ttl = Self::initial_ttl(tuple.proto, event, &cfg);
            let initial_state = Self::initial_state(tuple.proto, event);
            let bib_key = (tuple.proto, bib_entry.ipv6, bib_entry.ipv4);
            self.sessions.create(
                key,
                bib_key,
                initial_state,
                ttl,
                cfg.bib_logging || cfg.session_logging,
            )?;
        } else if let (L4Proto::Tcp, PacketEvent::Tcp(tcp_event)) = (tuple.proto, event) {
            self.sessions.on_tcp_event(&key, tcp_event, &cfg)?;
        } else {
            self.sessions.refresh(&key, Self::initial_ttl(tuple.proto, event, &cfg))?;
        }

        Ok(Verdict::Translate)
    }

    /// Processes an inbound IPv4→IPv6 packet. `local4` (the packet's destination) is looked up in
    /// the BIB; `remote6` is the already-embedded IPv6 source (external collaborator's job).
    pub fn process_4in(&self, tuple: Tuple4, remote6: Tuple6Endpoint, event: PacketEvent) -> Verdict {
        match self.try_process_4in(tuple, remote6, event) {
            Ok(v) => v,
            Err(e) => {
                if self.drop_log.allow() {
                    tracing::warn!(error = %e, mark = tuple.mark, proto = %tuple.proto, "dropping inbound ipv4 packet");
                }
                Verdict::Drop
            }
        }
    }

    fn try_process_4in(
        &self,
        tuple: Tuple4,
        remote6: Tuple6Endpoint,
        event: PacketEvent,
    ) -> NatResult<Verdict> {
        let cfg = self.config.current();

        let bib_entry = match self.bib.get4(tuple.proto, tuple.dst) {
            Some(e) => e,
            None => return Ok(Verdict::Drop),
        };

        let key = SessionKey {
            remote6,
            local6: bib_entry.ipv6,
            local4: bib_entry.ipv4,
            remote4: tuple.src,
            proto: tuple.proto,
        };

        if self.sessions.get(&key).is_none() {
            if cfg.drop_by_addr {
                return Ok(Verdict::Drop);
            }
            match (tuple.proto, event) {
                (L4Proto::Tcp, PacketEvent::Tcp(TcpEvent::Syn4In)) => {
                    if cfg.drop_external_tcp {
                        return Ok(Verdict::Drop);
                    }
                }
                (L4Proto::Tcp, _) => return Ok(Verdict::Drop),
                _ => {}
            }
            let ttl = Self::initial_ttl(tuple.proto, event, &cfg);
            let initial_state = Self::initial_state(tuple.proto, event);
            let bib_key = (tuple.proto, bib_entry.ipv6, bib_entry.ipv4);
            self.sessions.create(
                key,
                bib_key,
                initial_state,
                ttl,
                cfg.bib_logging || cfg.session_logging,
            )?;
        } else if let (L4Proto::Tcp, PacketEvent::Tcp(tcp_event)) = (tuple.proto, event) {
            self.sessions.on_tcp_event(&key, tcp_event, &cfg)?;
        } else {
            self.sessions.refresh(&key, Self::initial_ttl(tuple.proto, event, &cfg))?;
        }

        Ok(Verdict::Translate)
    }
}
