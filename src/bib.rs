// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! BIB: the Binding Information Base, a dual-indexed bijection between IPv6 and IPv4 transport
//! endpoints, per protocol.
//!
//! Each entry is owned jointly by the two index maps and by every [`crate::session::Session`]
//! that pins it, all via plain `Arc` clones — there is no back-pointer from an entry to its
//! sessions, so no reference cycle is ever formed. Removing the last session for a dynamic entry
//! is what lets [`BibTable::remove`] actually free it.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::error::{NatError, NatResult};
use crate::tuple::{L4Proto, Tuple4Endpoint, Tuple6Endpoint};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BibEntry {
    pub ipv6: Tuple6Endpoint,
    pub ipv4: Tuple4Endpoint,
    pub proto: L4Proto,
    pub mark: u32,
    pub is_static: bool,
}

/// Dual-indexed BIB table. Reads (`get4`/`get6`/`contains4`) go straight through DashMap's
/// sharded locking. Mutations that must touch both indexes atomically (`add_static`,
/// `add_dynamic`, `remove`) take a short table-wide lock, matching "the same mutex" from the
/// concurrency model: the datapath only ever holds it for the duration of a single lookup-or-
/// insert, and the expiry sweeper takes the identical lock, never across an allocation.
pub struct BibTable {
    by6: DashMap<(L4Proto, Tuple6Endpoint), Arc<BibEntry>>,
    by4: DashMap<(L4Proto, Tuple4Endpoint), Arc<BibEntry>>,
    write_lock: Mutex<()>,
}

impl BibTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by6: DashMap::new(),
            by4: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn get6(&self, proto: L4Proto, taddr: Tuple6Endpoint) -> Option<Arc<BibEntry>> {
        self.by6.get(&(proto, taddr)).map(|e| Arc::clone(&e))
    }

    #[must_use]
    pub fn get4(&self, proto: L4Proto, taddr: Tuple4Endpoint) -> Option<Arc<BibEntry>> {
        self.by4.get(&(proto, taddr)).map(|e| Arc::clone(&e))
    }

    #[must_use]
    pub fn contains4(&self, proto: L4Proto, taddr: Tuple4Endpoint) -> bool {
        self.by4.contains_key(&(proto, taddr))
    }

    #[tracing::instrument(skip(self, entry))]
    pub fn add_static(&self, entry: BibEntry) -> NatResult<Arc<BibEntry>> {
        self.insert(entry)
    }

    /// Installs a dynamically-allocated entry. Reports `ALREADY_EXISTS` if a racing allocation
    /// beat this one to either key; the caller should retry the allocator call with a fresh
    /// candidate.
    pub fn add_dynamic(&self, entry: BibEntry) -> NatResult<Arc<BibEntry>> {
        self.insert(entry)
    }

    fn insert(&self, entry: BibEntry) -> NatResult<Arc<BibEntry>> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let key6 = (entry.proto, entry.ipv6);
        let key4 = (entry.proto, entry.ipv4);
        if self.by6.contains_key(&key6) || self.by4.contains_key(&key4) {
            return Err(NatError::AlreadyExists);
        }
        let arc = Arc::new(entry);
        self.by6.insert(key6, Arc::clone(&arc));
        self.by4.insert(key4, Arc::clone(&arc));
        if arc.is_static {
            tracing::debug!(proto = %arc.proto, "bib static entry added");
        } else {
            tracing::debug!(proto = %arc.proto, "bib dynamic entry added");
        }
        Ok(arc)
    }

    /// Removes an entry. The caller (the session table) must have already established that no
    /// session still references it; this call does not itself re-check session refcounts.
    pub fn remove(&self, proto: L4Proto, ipv6: Tuple6Endpoint, ipv4: Tuple4Endpoint) -> NatResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let removed6 = self.by6.remove(&(proto, ipv6));
        let removed4 = self.by4.remove(&(proto, ipv4));
        if removed6.is_none() && removed4.is_none() {
            return Err(NatError::NotFound);
        }
        tracing::debug!(%proto, "bib entry removed");
        Ok(())
    }
}

impl Default for BibTable {
    fn default() -> Self {
        Self::new()
    }
}
