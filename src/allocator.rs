// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Port allocator: RFC 6056 Algorithm 3 applied over Pool4, using the keyed hash `F` for the
//! starting offset and a process-wide atomic counter to bias concurrent allocations apart.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::bib::BibTable;
use crate::config::FArgs;
use crate::error::{NatError, NatResult};
use crate::hash;
use crate::pool4::Pool4Db;
use crate::tuple::{L4Proto, Tuple4Endpoint, Tuple6};

pub struct PortAllocator {
    counter: AtomicU32,
}

impl PortAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Picks a free `(addr, port)` for `tuple` under `proto`, optionally restricted to `daddr`.
    /// Candidates already bound in `bib` are skipped; the counter advances on every candidate
    /// considered, not only on acceptance, per RFC 6056 Algorithm 3.
    #[tracing::instrument(skip(self, pool4, bib), fields(mark = tuple.mark, proto = %proto))]
    pub fn allocate(
        &self,
        tuple: &Tuple6,
        proto: L4Proto,
        daddr: Option<Ipv4Addr>,
        f_args: FArgs,
        pool4: &Pool4Db,
        bib: &BibTable,
    ) -> NatResult<Tuple4Endpoint> {
        let base = hash::f(tuple, f_args);
        let offset = base.wrapping_add(self.counter.fetch_add(1, Ordering::Relaxed));

        let mut found = None;
        let mark = tuple.mark;
        pool4.foreach_taddr4(mark, proto, offset, |addr, port| {
            self.counter.fetch_add(1, Ordering::Relaxed);
            if let Some(want) = daddr {
                if want != addr {
                    return false;
                }
            }
            if bib.contains4(proto, Tuple4Endpoint::new(addr, port)) {
                return false;
            }
            found = Some(Tuple4Endpoint::new(addr, port));
            true
        })?;

        found.ok_or_else(|| {
            tracing::warn!(mark, %proto, "pool4 exhausted");
            NatError::Exhausted { mark, proto }
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
