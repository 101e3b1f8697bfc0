// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Global configuration: the read-mostly settings object consulted on every packet.
//!
//! Publication follows a publish/grace-period discipline realized with [`arc_swap::ArcSwap`]: a
//! reader calls [`ConfigStore::current`] to get a [`arc_swap::Guard`] good for the lifetime of one
//! packet; a writer validates a whole replacement [`GlobalConfig`] up front and swaps it in with
//! [`ConfigStore::replace`]. The previous snapshot is freed once the last guard referencing it is
//! dropped — `ArcSwap`'s refcount stands in for an explicit grace-period epoch.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, Guard};

use crate::error::{NatError, NatResult};

pub const UDP_MIN_MS: u32 = 300_000;
pub const TCP_EST_MIN_MS: u32 = 7_440_000;
pub const TCP_TRANS_MIN_MS: u32 = 240_000;
pub const FRAGMENT_MIN_MS: u32 = 2_000;

const UDP_DEFAULT_MS: u32 = UDP_MIN_MS;
const ICMP_DEFAULT_MS: u32 = 60_000;
const TCP_EST_DEFAULT_MS: u32 = TCP_EST_MIN_MS;
const TCP_TRANS_DEFAULT_MS: u32 = TCP_TRANS_MIN_MS;
const FRAGMENT_DEFAULT_MS: u32 = FRAGMENT_MIN_MS;

const DEFAULT_PLATEAUS: &[u16] = &[
    65535, 32000, 17914, 8166, 4352, 2002, 1492, 1280, 1006, 508, 296, 68,
];

/// A TTL or timer value in the translator's monotonic time unit. Millisecond conversion only
/// happens at the `u32`-bounded boundary (control messages, display), matching the rule that
/// values at or above `2^32` ms are rejected outright: `u32` cannot represent them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NatDuration(Duration);

impl NatDuration {
    #[must_use]
    pub fn from_millis(ms: u32) -> Self {
        Self(Duration::from_millis(u64::from(ms)))
    }

    #[must_use]
    pub fn as_millis(self) -> u64 {
        self.0.as_millis() as u64
    }

    #[must_use]
    pub fn as_duration(self) -> Duration {
        self.0
    }
}

/// Fields selected for the keyed hash `F` (see [`crate::hash`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FArgs(u8);

impl FArgs {
    pub const SRC_ADDR: FArgs = FArgs(0b0001);
    pub const SRC_PORT: FArgs = FArgs(0b0010);
    pub const DST_ADDR: FArgs = FArgs(0b0100);
    pub const DST_PORT: FArgs = FArgs(0b1000);

    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b1111)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, flag: FArgs) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[must_use]
    pub const fn union(self, other: FArgs) -> Self {
        Self(self.0 | other.0)
    }
}

impl Default for FArgs {
    fn default() -> Self {
        Self::SRC_ADDR
            .union(Self::SRC_PORT)
            .union(Self::DST_ADDR)
            .union(Self::DST_PORT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtomicFragsConfig {
    pub df_always_on: bool,
    pub build_ipv6_fh: bool,
    pub build_ipv4_id: bool,
    pub lower_mtu_fail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlConfig {
    pub udp: NatDuration,
    pub icmp: NatDuration,
    pub tcp_est: NatDuration,
    pub tcp_trans: NatDuration,
    pub frag: NatDuration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            udp: NatDuration::from_millis(UDP_DEFAULT_MS),
            icmp: NatDuration::from_millis(ICMP_DEFAULT_MS),
            tcp_est: NatDuration::from_millis(TCP_EST_DEFAULT_MS),
            tcp_trans: NatDuration::from_millis(TCP_TRANS_DEFAULT_MS),
            frag: NatDuration::from_millis(FRAGMENT_DEFAULT_MS),
        }
    }
}

/// Sorts descending, truncates at the first zero, drops consecutive duplicates, and rejects an
/// all-zero (or otherwise empty) result.
pub fn normalize_plateaus(mut plateaus: Vec<u16>) -> NatResult<Vec<u16>> {
    plateaus.sort_unstable_by(|a, b| b.cmp(a));
    if let Some(pos) = plateaus.iter().position(|&p| p == 0) {
        plateaus.truncate(pos);
    }
    plateaus.dedup();
    if plateaus.is_empty() {
        return Err(NatError::InvalidArgument(
            "mtu_plateaus has no non-zero entries".to_string(),
        ));
    }
    Ok(plateaus)
}

fn validate_ttl_ms(ms: u32, min_ms: u32, field: &str) -> NatResult<NatDuration> {
    if ms < min_ms {
        return Err(NatError::InvalidArgument(format!(
            "{field} ttl {ms}ms is below the minimum of {min_ms}ms"
        )));
    }
    Ok(NatDuration::from_millis(ms))
}

/// The read-mostly settings object consulted by the datapath on every packet. Build one with
/// [`GlobalConfig::default`] and mutate it only through [`GlobalConfigUpdate`], which applies the
/// same validation a direct field write would.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub reset_traffic_class: bool,
    pub reset_tos: bool,
    pub new_tos: u8,
    pub atomic_frags: AtomicFragsConfig,
    pub ttl: TtlConfig,
    pub max_stored_pkts: u32,
    pub src_icmp6errs_better: bool,
    pub f_args: FArgs,
    pub handle_rst_during_fin_rcv: bool,
    pub drop_by_addr: bool,
    pub drop_external_tcp: bool,
    pub drop_icmp6_info: bool,
    pub bib_logging: bool,
    pub session_logging: bool,
    pub mtu_plateaus: Vec<u16>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            reset_traffic_class: false,
            reset_tos: false,
            new_tos: 0,
            atomic_frags: AtomicFragsConfig::default(),
            ttl: TtlConfig::default(),
            max_stored_pkts: 10,
            src_icmp6errs_better: false,
            f_args: FArgs::default(),
            handle_rst_during_fin_rcv: false,
            drop_by_addr: false,
            drop_external_tcp: false,
            drop_icmp6_info: false,
            bib_logging: false,
            session_logging: false,
            mtu_plateaus: DEFAULT_PLATEAUS.to_vec(),
        }
    }
}

impl GlobalConfig {
    pub fn validate(&self) -> NatResult<()> {
        validate_ttl_ms(self.ttl.udp.as_millis() as u32, UDP_MIN_MS, "udp")?;
        validate_ttl_ms(
            self.ttl.tcp_est.as_millis() as u32,
            TCP_EST_MIN_MS,
            "tcp_est",
        )?;
        validate_ttl_ms(
            self.ttl.tcp_trans.as_millis() as u32,
            TCP_TRANS_MIN_MS,
            "tcp_trans",
        )?;
        validate_ttl_ms(self.ttl.frag.as_millis() as u32, FRAGMENT_MIN_MS, "frag")?;
        if self.mtu_plateaus.is_empty() {
            return Err(NatError::InvalidArgument(
                "mtu_plateaus is empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn enabled(&self, disabled: bool, pool6_empty: bool, eamt_empty: bool) -> bool {
        !disabled && !(pool6_empty && eamt_empty)
    }
}

/// A partial change to [`GlobalConfig`], matching the `SET(key, value)` control operation: one
/// field at a time, applied through the same validation as a direct write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigUpdate {
    pub reset_traffic_class: Option<bool>,
    pub reset_tos: Option<bool>,
    pub new_tos: Option<u8>,
    pub atomic_frags: Option<AtomicFragsConfig>,
    pub ttl_udp_ms: Option<u32>,
    pub ttl_icmp_ms: Option<u32>,
    pub ttl_tcp_est_ms: Option<u32>,
    pub ttl_tcp_trans_ms: Option<u32>,
    pub ttl_frag_ms: Option<u32>,
    pub max_stored_pkts: Option<u32>,
    pub src_icmp6errs_better: Option<bool>,
    pub f_args: Option<FArgs>,
    pub handle_rst_during_fin_rcv: Option<bool>,
    pub drop_by_addr: Option<bool>,
    pub drop_external_tcp: Option<bool>,
    pub drop_icmp6_info: Option<bool>,
    pub bib_logging: Option<bool>,
    pub session_logging: Option<bool>,
    pub mtu_plateaus: Option<Vec<u16>>,
}

impl GlobalConfigUpdate {
    pub fn apply_to(self, base: &GlobalConfig) -> NatResult<GlobalConfig> {
        let mut next = base.clone();
        if let Some(v) = self.reset_traffic_class {
            next.reset_traffic_class = v;
        }
        if let Some(v) = self.reset_tos {
            next.reset_tos = v;
        }
        if let Some(v) = self.new_tos {
            next.new_tos = v;
        }
        if let Some(v) = self.atomic_frags {
            next.atomic_frags = v;
        }
        if let Some(ms) = self.ttl_udp_ms {
            next.ttl.udp = validate_ttl_ms(ms, UDP_MIN_MS, "udp")?;
        }
        if let Some(ms) = self.ttl_icmp_ms {
            next.ttl.icmp = NatDuration::from_millis(ms);
        }
        if let Some(ms) = self.ttl_tcp_est_ms {
            next.ttl.tcp_est = validate_ttl_ms(ms, TCP_EST_MIN_MS, "tcp_est")?;
        }
        if let Some(ms) = self.ttl_tcp_trans_ms {
            next.ttl.tcp_trans = validate_ttl_ms(ms, TCP_TRANS_MIN_MS, "tcp_trans")?;
        }
        if let Some(ms) = self.ttl_frag_ms {
            next.ttl.frag = validate_ttl_ms(ms, FRAGMENT_MIN_MS, "frag")?;
        }
        if let Some(v) = self.max_stored_pkts {
            next.max_stored_pkts = v;
        }
        if let Some(v) = self.src_icmp6errs_better {
            next.src_icmp6errs_better = v;
        }
        if let Some(v) = self.f_args {
            next.f_args = v;
        }
        if let Some(v) = self.handle_rst_during_fin_rcv {
            next.handle_rst_during_fin_rcv = v;
        }
        if let Some(v) = self.drop_by_addr {
            next.drop_by_addr = v;
        }
        if let Some(v) = self.drop_external_tcp {
            next.drop_external_tcp = v;
        }
        if let Some(v) = self.drop_icmp6_info {
            next.drop_icmp6_info = v;
        }
        if let Some(v) = self.bib_logging {
            next.bib_logging = v;
        }
        if let Some(v) = self.session_logging {
            next.session_logging = v;
        }
        if let Some(p) = self.mtu_plateaus {
            next.mtu_plateaus = normalize_plateaus(p)?;
        }
        next.validate()?;
        Ok(next)
    }
}

/// The publish/grace-period store for [`GlobalConfig`]. See the module docs for the read/write
/// discipline.
pub struct ConfigStore {
    inner: ArcSwap<GlobalConfig>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(cfg: GlobalConfig) -> Self {
        Self {
            inner: ArcSwap::new(Arc::new(cfg)),
        }
    }

    /// Returns a guard scoped to the current packet's processing. Never hold this across a
    /// blocking call or store it past the call that obtained it.
    #[must_use]
    pub fn current(&self) -> Guard<Arc<GlobalConfig>> {
        self.inner.load()
    }

    #[tracing::instrument(skip(self, new))]
    pub fn replace(&self, new: GlobalConfig) -> NatResult<()> {
        new.validate()?;
        self.inner.store(Arc::new(new));
        tracing::debug!("global configuration replaced");
        Ok(())
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(GlobalConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        GlobalConfig::default().validate().unwrap();
    }

    #[test]
    fn plateaus_normalize_sorts_truncates_and_dedups() {
        let got = normalize_plateaus(vec![100, 100, 0, 9999, 50, 50]).unwrap();
        assert_eq!(got, vec![9999, 100, 50]);
    }

    #[test]
    fn plateaus_all_zero_is_rejected() {
        assert!(normalize_plateaus(vec![0, 0]).is_err());
    }

    #[test]
    fn ttl_below_minimum_is_rejected() {
        let update = GlobalConfigUpdate {
            ttl_udp_ms: Some(1_000),
            ..Default::default()
        };
        assert!(update.apply_to(&GlobalConfig::default()).is_err());
    }

    #[test]
    fn config_store_rejects_invalid_replace_without_mutating() {
        let store = ConfigStore::default();
        let mut bad = store.current().as_ref().clone();
        bad.ttl.tcp_trans = NatDuration::from_millis(1);
        assert!(store.replace(bad).is_err());
        assert_eq!(
            store.current().ttl.tcp_trans,
            NatDuration::from_millis(TCP_TRANS_MIN_MS)
        );
    }

    #[test]
    fn f_args_default_selects_all_four_fields() {
        let f = FArgs::default();
        assert!(f.contains(FArgs::SRC_ADDR));
        assert!(f.contains(FArgs::SRC_PORT));
        assert!(f.contains(FArgs::DST_ADDR));
        assert!(f.contains(FArgs::DST_PORT));
    }
}
