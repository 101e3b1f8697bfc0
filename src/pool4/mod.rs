// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pool4: the pool of IPv4 (address, port-range) pairs available to the port allocator, keyed by
//! firewall mark and transport protocol.
//!
//! The table is partitioned into a power-of-two number of independently-published slots so that
//! readers on the datapath never contend with a control-plane `add`/`rm` touching an unrelated
//! mark. Each slot is an [`ArcSwap`] snapshot: writers build a full replacement map and publish it
//! atomically, readers pay only an `Arc` clone.

use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use ordermap::OrderMap;

use crate::error::{NatError, NatResult};
use crate::tuple::L4Proto;

const DEFAULT_SLOTS: u32 = 16;

/// An inclusive port range, `lo..=hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    #[must_use]
    pub fn new(lo: u16, hi: u16) -> Self {
        debug_assert!(lo <= hi);
        Self { lo, hi }
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        u32::from(self.hi) - u32::from(self.lo) + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }

    /// Two ranges merge into a contiguous one if they overlap or touch. `u16::MAX` is handled via
    /// widening so adjacency at the top of the port space doesn't overflow.
    fn touches(&self, other: &PortRange) -> bool {
        let a_hi = u32::from(self.hi) + 1;
        let b_lo = u32::from(other.lo);
        let b_hi = u32::from(other.hi) + 1;
        let a_lo = u32::from(self.lo);
        a_lo <= b_hi && b_lo <= a_hi
    }

    fn merge(&self, other: &PortRange) -> PortRange {
        PortRange::new(self.lo.min(other.lo), self.hi.max(other.hi))
    }

    /// Subtracts `cut` from `self`, returning zero, one, or two surviving pieces.
    fn subtract(&self, cut: &PortRange) -> (Option<PortRange>, Option<PortRange>) {
        if cut.hi < self.lo || cut.lo > self.hi {
            return (Some(*self), None);
        }
        let left = if cut.lo > self.lo {
            Some(PortRange::new(self.lo, cut.lo - 1))
        } else {
            None
        };
        let right = if cut.hi < self.hi {
            Some(PortRange::new(cut.hi + 1, self.hi))
        } else {
            None
        };
        (left, right)
    }
}

type Pool4Key = (u32, L4Proto);
type AddrRanges = OrderMap<Ipv4Addr, Vec<PortRange>>;
type Pool4Slot = OrderMap<Pool4Key, AddrRanges>;

/// A snapshot-friendly IPv4 transport pool, sharded by `hash32(mark) & (slots() - 1)`.
pub struct Pool4Db {
    slots: Vec<ArcSwap<Pool4Slot>>,
}

/// Largest `capacity` this pool accepts: its next power of two (`2^31`) still fits in a `u32`.
const MAX_CAPACITY: u32 = 1u32 << 31;

fn next_pow2(n: u32) -> u32 {
    if n <= 1 {
        1
    } else {
        1u32 << (32 - (n - 1).leading_zeros())
    }
}

fn prefix_addrs(prefix: Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    let lo = u32::from(prefix.network());
    let hi = u32::from(prefix.broadcast());
    (lo..=hi).map(Ipv4Addr::from)
}

fn hash32(mark: u32) -> u32 {
    let mut hasher = ahash::AHasher::default();
    mark.hash(&mut hasher);
    hasher.finish() as u32
}

impl Pool4Db {
    /// Builds an empty pool sized for `capacity` entries. `capacity == 0` selects the default of
    /// 16 slots; otherwise the slot count is the next power of two at or above `capacity`. Rejects
    /// `capacity` greater than `2^31`, whose next power of two would overflow `u32`.
    pub fn init_power(capacity: u32) -> NatResult<Self> {
        if capacity > MAX_CAPACITY {
            return Err(NatError::InvalidArgument(format!(
                "capacity {capacity} exceeds the maximum of {MAX_CAPACITY}"
            )));
        }
        let n = if capacity == 0 {
            DEFAULT_SLOTS
        } else {
            next_pow2(capacity)
        };
        let slots = (0..n)
            .map(|_| ArcSwap::new(Arc::new(Pool4Slot::new())))
            .collect();
        Ok(Self { slots })
    }

    #[must_use]
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    fn slot_index(&self, mark: u32) -> usize {
        let mask = self.slots.len() as u32 - 1;
        (hash32(mark) & mask) as usize
    }

    /// Merges `lo..=hi` for `addr` into the pool under `(mark, proto)`. Ranges for the same
    /// address that overlap or touch the new range are merged into one; the merged range is moved
    /// to the end of that address's range list, matching the order a reader observes them being
    /// "last touched".
    pub fn add(&self, mark: u32, proto: L4Proto, addr: Ipv4Addr, lo: u16, hi: u16) -> NatResult<()> {
        if lo > hi {
            return Err(NatError::InvalidArgument(format!(
                "port range {lo}..={hi} is inverted"
            )));
        }
        let idx = self.slot_index(mark);
        let slot = self.slots[idx].load();
        let mut next: Pool4Slot = (**slot).clone();
        let addrs = next.entry((mark, proto)).or_default();
        let ranges = addrs.entry(addr).or_default();

        let incoming = PortRange::new(lo, hi);
        let mut merged = incoming;
        let mut kept = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            if r.touches(&merged) {
                merged = merged.merge(&r);
            } else {
                kept.push(r);
            }
        }
        kept.push(merged);
        *ranges = kept;

        self.slots[idx].store(Arc::new(next));
        Ok(())
    }

    /// Removes `lo..=hi` from `addr`'s ranges under `(mark, proto)`. Unlike `add`, surviving
    /// fragments keep their original position; only ranges emptied entirely are dropped.
    pub fn rm(&self, mark: u32, proto: L4Proto, addr: Ipv4Addr, lo: u16, hi: u16) -> NatResult<()> {
        if lo > hi {
            return Err(NatError::InvalidArgument(format!(
                "port range {lo}..={hi} is inverted"
            )));
        }
        let idx = self.slot_index(mark);
        let slot = self.slots[idx].load();
        let mut next: Pool4Slot = (**slot).clone();

        let key_empty;
        {
            let addrs = next
                .get_mut(&(mark, proto))
                .ok_or(NatError::NoKey { mark, proto })?;
            let ranges = addrs.get_mut(&addr).ok_or(NatError::NotFound)?;
            let cut = PortRange::new(lo, hi);
            let mut rebuilt = Vec::with_capacity(ranges.len());
            for r in ranges.iter() {
                let (left, right) = r.subtract(&cut);
                rebuilt.extend(left);
                rebuilt.extend(right);
            }
            if rebuilt.is_empty() {
                addrs.swap_remove(&addr);
            } else {
                *ranges = rebuilt;
            }
            key_empty = addrs.is_empty();
        }
        if key_empty {
            next.swap_remove(&(mark, proto));
        }

        self.slots[idx].store(Arc::new(next));
        Ok(())
    }

    /// Applies [`Pool4Db::add`] to every address covered by `prefix` (network and broadcast
    /// addresses included: Pool4 ranges are plain transport addresses, not host routes).
    pub fn add_prefix(
        &self,
        mark: u32,
        proto: L4Proto,
        prefix: Ipv4Net,
        lo: u16,
        hi: u16,
    ) -> NatResult<()> {
        for addr in prefix_addrs(prefix) {
            self.add(mark, proto, addr, lo, hi)?;
        }
        Ok(())
    }

    /// Applies [`Pool4Db::rm`] to every address covered by `prefix`. Addresses with no entry for
    /// `(mark, proto)` are tolerated silently, matching the "missing sub-intervals are silently
    /// tolerated" rule for the single-address case.
    pub fn rm_prefix(
        &self,
        mark: u32,
        proto: L4Proto,
        prefix: Ipv4Net,
        lo: u16,
        hi: u16,
    ) -> NatResult<()> {
        for addr in prefix_addrs(prefix) {
            match self.rm(mark, proto, addr, lo, hi) {
                Ok(()) | Err(NatError::NoKey { .. }) | Err(NatError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// True iff some range under any mark for `proto` covers `(addr, port)`. Unlike `add`/`rm`,
    /// this does not take a `mark`: a transport address is either claimed by the pool or not,
    /// regardless of which mark's entry claims it, so every slot is consulted.
    #[must_use]
    pub fn contains(&self, proto: L4Proto, addr: Ipv4Addr, port: u16) -> bool {
        self.slots.iter().any(|slot| {
            let snapshot = slot.load();
            snapshot.iter().any(|(&(_, p), addrs)| {
                p == proto
                    && addrs
                        .get(&addr)
                        .is_some_and(|ranges| ranges.iter().any(|r| r.contains(port)))
            })
        })
    }

    /// Walks every `(mark, proto, addr, range)` quadruple in stable display order: slot index,
    /// then insertion order within the slot. `f` returns `false` to stop early.
    pub fn foreach_sample(&self, mut f: impl FnMut(u32, L4Proto, Ipv4Addr, PortRange) -> bool) {
        for slot in &self.slots {
            let snapshot = slot.load();
            for (&(mark, proto), addrs) in snapshot.iter() {
                for (&addr, ranges) in addrs.iter() {
                    for &range in ranges {
                        if !f(mark, proto, addr, range) {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Like [`Pool4Db::foreach_sample`], but resumes after a previously yielded element instead of
    /// starting from the beginning: the first quadruple fed to `f` is the one that immediately
    /// follows `(mark, proto, addr, range)` in display order, not that element itself. Useful for
    /// a control-plane listing that pages through the pool across several calls. If `offset`
    /// doesn't match any currently-present element (e.g. it was removed between calls), iteration
    /// starts from the beginning, matching `foreach_sample`'s behavior with no offset.
    pub fn foreach_sample_after(
        &self,
        offset: (u32, L4Proto, Ipv4Addr, PortRange),
        mut f: impl FnMut(u32, L4Proto, Ipv4Addr, PortRange) -> bool,
    ) {
        let mut past_offset = false;
        self.foreach_sample(|mark, proto, addr, range| {
            if past_offset {
                return f(mark, proto, addr, range);
            }
            if (mark, proto, addr, range.lo, range.hi)
                == (offset.0, offset.1, offset.2, offset.3.lo, offset.3.hi)
            {
                past_offset = true;
            }
            true
        });
        if !past_offset {
            self.foreach_sample(f);
        }
    }

    /// Enumerates `(addr, port)` transport-address candidates for `(mark, proto)`, starting at
    /// `offset` into the flattened, display-ordered sequence and wrapping around once. Stops
    /// early when `f` returns `true` (a usable candidate was found).
    pub fn foreach_taddr4(
        &self,
        mark: u32,
        proto: L4Proto,
        offset: u32,
        mut f: impl FnMut(Ipv4Addr, u16) -> bool,
    ) -> NatResult<()> {
        let idx = self.slot_index(mark);
        let slot = self.slots[idx].load();
        let addrs = slot.get(&(mark, proto)).ok_or(NatError::NoKey { mark, proto })?;

        let mut entries: Vec<(Ipv4Addr, PortRange)> = Vec::new();
        for (&addr, ranges) in addrs.iter() {
            for &r in ranges {
                entries.push((addr, r));
            }
        }
        let total: u64 = entries.iter().map(|(_, r)| u64::from(r.len())).sum();
        if total == 0 {
            return Err(NatError::NoKey { mark, proto });
        }

        let mut start = u64::from(offset) % total;
        let mut entry_idx = 0usize;
        while start >= u64::from(entries[entry_idx].1.len()) {
            start -= u64::from(entries[entry_idx].1.len());
            entry_idx += 1;
        }
        let mut port_off = start as u32;

        for _ in 0..total {
            let (addr, range) = entries[entry_idx];
            let port = range.lo + port_off as u16;
            if f(addr, port) {
                return Ok(());
            }
            port_off += 1;
            if port_off >= range.len() {
                port_off = 0;
                entry_idx = (entry_idx + 1) % entries.len();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_power_defaults_and_rounds_up() {
        assert_eq!(Pool4Db::init_power(0).unwrap().slots(), 16);
        assert_eq!(Pool4Db::init_power(1234).unwrap().slots(), 2048);
        assert_eq!(Pool4Db::init_power(16).unwrap().slots(), 16);
        assert_eq!(Pool4Db::init_power(17).unwrap().slots(), 32);
    }

    #[test]
    fn init_power_rejects_capacity_past_the_u32_doubling_limit() {
        // 0x8000_0001 is one past 2^31: its next power of two would overflow u32.
        assert_eq!(
            Pool4Db::init_power(0x8000_0001).unwrap_err(),
            NatError::InvalidArgument(
                "capacity 2147483649 exceeds the maximum of 2147483648".to_string()
            )
        );
    }

    #[test]
    fn add_merges_touching_ranges_to_the_end() {
        let db = Pool4Db::init_power(16).unwrap();
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        db.add(1, L4Proto::Tcp, addr, 100, 110).unwrap();
        db.add(1, L4Proto::Tcp, addr, 200, 210).unwrap();
        db.add(1, L4Proto::Tcp, addr, 111, 150).unwrap();

        let mut seen = Vec::new();
        db.foreach_sample(|_, _, _, r| {
            seen.push((r.lo, r.hi));
            true
        });
        assert_eq!(seen, vec![(200, 210), (100, 150)]);
    }

    #[test]
    fn rm_splits_without_reordering() {
        let db = Pool4Db::init_power(16).unwrap();
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        db.add(1, L4Proto::Udp, addr, 100, 200).unwrap();
        db.rm(1, L4Proto::Udp, addr, 140, 160).unwrap();

        let mut seen = Vec::new();
        db.foreach_sample(|_, _, _, r| {
            seen.push((r.lo, r.hi));
            true
        });
        assert_eq!(seen, vec![(100, 139), (161, 200)]);
    }

    #[test]
    fn rm_prefix_drops_only_covered_addresses() {
        let db = Pool4Db::init_power(16).unwrap();
        for last in 20..=23u8 {
            db.add(1, L4Proto::Tcp, Ipv4Addr::new(192, 0, 2, last), 5, 25)
                .unwrap();
        }
        let prefix: Ipv4Net = "192.0.2.22/31".parse().unwrap();
        db.rm_prefix(1, L4Proto::Tcp, prefix, 0, 65535).unwrap();

        let mut seen = Vec::new();
        db.foreach_sample(|_, _, addr, _| {
            seen.push(addr);
            true
        });
        assert_eq!(
            seen,
            vec![Ipv4Addr::new(192, 0, 2, 20), Ipv4Addr::new(192, 0, 2, 21)]
        );
    }

    #[test]
    fn rm_unknown_key_is_nokey() {
        let db = Pool4Db::init_power(16).unwrap();
        let err = db
            .rm(7, L4Proto::Tcp, Ipv4Addr::new(192, 0, 2, 1), 1, 2)
            .unwrap_err();
        assert_eq!(
            err,
            NatError::NoKey {
                mark: 7,
                proto: L4Proto::Tcp
            }
        );
    }

    #[test]
    fn foreach_taddr4_wraps_from_offset() {
        let db = Pool4Db::init_power(16).unwrap();
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        db.add(9, L4Proto::Tcp, addr, 100, 102).unwrap();

        let mut seen = Vec::new();
        db.foreach_taddr4(9, L4Proto::Tcp, 2, |a, p| {
            seen.push((a, p));
            seen.len() == 3
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![(addr, 102), (addr, 100), (addr, 101)]
        );
    }

    #[test]
    fn add_prefix_only_touches_new_addresses() {
        let db = Pool4Db::init_power(16).unwrap();
        let base = Ipv4Addr::new(192, 0, 2, 20);
        db.add(1, L4Proto::Tcp, base, 5, 25).unwrap();

        let prefix: Ipv4Net = "192.0.2.20/30".parse().unwrap();
        db.add_prefix(1, L4Proto::Tcp, prefix, 5, 25).unwrap();

        let mut seen = Vec::new();
        db.foreach_sample(|_, _, addr, r| {
            seen.push((addr, r.lo, r.hi));
            true
        });
        assert_eq!(
            seen,
            vec![
                (Ipv4Addr::new(192, 0, 2, 20), 5, 25),
                (Ipv4Addr::new(192, 0, 2, 21), 5, 25),
                (Ipv4Addr::new(192, 0, 2, 22), 5, 25),
                (Ipv4Addr::new(192, 0, 2, 23), 5, 25),
            ]
        );
    }

    #[test]
    fn foreach_sample_after_resumes_past_the_given_element() {
        let db = Pool4Db::init_power(16).unwrap();
        db.add(1, L4Proto::Tcp, Ipv4Addr::new(192, 0, 2, 1), 10, 10).unwrap();
        db.add(1, L4Proto::Tcp, Ipv4Addr::new(192, 0, 2, 2), 20, 20).unwrap();
        db.add(1, L4Proto::Tcp, Ipv4Addr::new(192, 0, 2, 3), 30, 30).unwrap();

        let mut all = Vec::new();
        db.foreach_sample(|m, p, a, r| {
            all.push((m, p, a, r));
            true
        });
        let (mark, proto, addr, range) = all[0];

        let mut resumed = Vec::new();
        db.foreach_sample_after((mark, proto, addr, range), |_, _, a, r| {
            resumed.push((a.octets()[3], r.lo));
            true
        });
        assert_eq!(resumed, vec![(2, 20), (3, 30)]);
    }

    #[test]
    fn foreach_sample_after_unknown_offset_restarts_from_the_beginning() {
        let db = Pool4Db::init_power(16).unwrap();
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        db.add(1, L4Proto::Tcp, addr, 10, 10).unwrap();

        let stale_offset = (9, L4Proto::Tcp, addr, PortRange::new(999, 999));
        let mut seen = Vec::new();
        db.foreach_sample_after(stale_offset, |_, _, a, r| {
            seen.push((a, r.lo));
            true
        });
        assert_eq!(seen, vec![(addr, 10)]);
    }

    #[test]
    fn contains_checks_membership() {
        let db = Pool4Db::init_power(16).unwrap();
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        db.add(1, L4Proto::Tcp, addr, 100, 110).unwrap();
        assert!(db.contains(L4Proto::Tcp, addr, 105));
        assert!(!db.contains(L4Proto::Tcp, addr, 111));
        assert!(!db.contains(L4Proto::Udp, addr, 105));
    }

    #[test]
    fn contains_ignores_which_mark_claims_the_address() {
        let db = Pool4Db::init_power(16).unwrap();
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        db.add(7, L4Proto::Tcp, addr, 100, 110).unwrap();
        assert!(db.contains(L4Proto::Tcp, addr, 105));
        assert!(!db.contains(L4Proto::Udp, addr, 105));
    }
}
