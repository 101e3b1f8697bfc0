// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control-plane records: decoding an already length-checked, untrusted buffer into a typed
//! [`ControlOp`], and applying it to the [`ConfigStore`]/[`Pool4Db`]. Framing these records onto
//! an actual transport (netlink socket or equivalent) is an external collaborator's job; this
//! module starts at "here is one complete record's bytes".

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnet::Ipv4Net;

use crate::config::{AtomicFragsConfig, ConfigStore, FArgs, GlobalConfig, GlobalConfigUpdate};
use crate::error::{NatError, NatResult};
use crate::pool4::Pool4Db;
use crate::tuple::L4Proto;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> NatResult<&'a [u8]> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(NatError::InvalidArgument(format!(
                "truncated control record: need {n} bytes, have {remaining}"
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> NatResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> NatResult<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> NatResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> NatResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn ipv4(&mut self) -> NatResult<Ipv4Addr> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }
}

fn decode_proto(tag: u8) -> NatResult<L4Proto> {
    match tag {
        0 => Ok(L4Proto::Udp),
        1 => Ok(L4Proto::Tcp),
        2 => Ok(L4Proto::Icmp),
        other => Err(NatError::InvalidArgument(format!(
            "unknown protocol tag {other}"
        ))),
    }
}

/// A decoded, validated-shape control record. Field-level validation (TTL minima, plateau
/// normalization) happens when it is applied, not when it is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOp {
    Enable,
    Disable,
    Set(GlobalConfigUpdate),
    Display,
    Pool4Add {
        mark: u32,
        proto: L4Proto,
        prefix: Ipv4Net,
        port_lo: u16,
        port_hi: u16,
    },
    Pool4Rm {
        mark: u32,
        proto: L4Proto,
        prefix: Ipv4Net,
        port_lo: u16,
        port_hi: u16,
    },
}

/// Decodes one control record. Every read checks the remaining buffer first, so a record
/// truncated anywhere (even mid-field) is reported as `INVALID_ARGUMENT`, never as a panic or an
/// out-of-bounds read.
pub fn decode(buf: &[u8]) -> NatResult<ControlOp> {
    let mut r = Reader::new(buf);
    match r.u8()? {
        0 => Ok(ControlOp::Enable),
        1 => Ok(ControlOp::Disable),
        2 => decode_set(&mut r),
        3 => Ok(ControlOp::Display),
        4 => decode_pool4(&mut r, true),
        5 => decode_pool4(&mut r, false),
        other => Err(NatError::InvalidArgument(format!(
            "unknown control opcode {other}"
        ))),
    }
}

fn decode_pool4(r: &mut Reader, is_add: bool) -> NatResult<ControlOp> {
    let mark = r.u32()?;
    let proto = decode_proto(r.u8()?)?;
    let addr = r.ipv4()?;
    let prefix_len = r.u8()?;
    let port_lo = r.u16()?;
    let port_hi = r.u16()?;
    let prefix = Ipv4Net::new(addr, prefix_len)
        .map_err(|e| NatError::InvalidArgument(format!("bad pool4 prefix: {e}")))?;
    Ok(if is_add {
        ControlOp::Pool4Add {
            mark,
            proto,
            prefix,
            port_lo,
            port_hi,
        }
    } else {
        ControlOp::Pool4Rm {
            mark,
            proto,
            prefix,
            port_lo,
            port_hi,
        }
    })
}

fn decode_set(r: &mut Reader) -> NatResult<ControlOp> {
    let mut update = GlobalConfigUpdate::default();
    match r.u8()? {
        0 => update.reset_traffic_class = Some(r.bool()?),
        1 => update.reset_tos = Some(r.bool()?),
        2 => update.new_tos = Some(r.u8()?),
        3 => {
            update.atomic_frags = Some(AtomicFragsConfig {
                df_always_on: r.bool()?,
                build_ipv6_fh: r.bool()?,
                build_ipv4_id: r.bool()?,
                lower_mtu_fail: r.bool()?,
            });
        }
        4 => update.ttl_udp_ms = Some(r.u32()?),
        5 => update.ttl_icmp_ms = Some(r.u32()?),
        6 => update.ttl_tcp_est_ms = Some(r.u32()?),
        7 => update.ttl_tcp_trans_ms = Some(r.u32()?),
        8 => update.ttl_frag_ms = Some(r.u32()?),
        9 => update.max_stored_pkts = Some(r.u32()?),
        10 => update.src_icmp6errs_better = Some(r.bool()?),
        11 => update.f_args = Some(FArgs::from_bits_truncate(r.u8()?)),
        12 => update.handle_rst_during_fin_rcv = Some(r.bool()?),
        13 => update.drop_by_addr = Some(r.bool()?),
        14 => update.drop_external_tcp = Some(r.bool()?),
        15 => update.drop_icmp6_info = Some(r.bool()?),
        16 => update.bib_logging = Some(r.bool()?),
        17 => update.session_logging = Some(r.bool()?),
        18 => {
            let count = usize::from(r.u8()?);
            let mut plateaus = Vec::with_capacity(count);
            for _ in 0..count {
                plateaus.push(r.u16()?);
            }
            update.mtu_plateaus = Some(plateaus);
        }
        other => {
            return Err(NatError::InvalidArgument(format!(
                "unknown configuration key {other}"
            )));
        }
    }
    Ok(ControlOp::Set(update))
}

/// What a `DISPLAY` control op returns: the config blob plus the millisecond-converted durations
/// and the derived `enabled` flag, matching the external interface contract.
#[derive(Debug, Clone)]
pub struct DisplaySnapshot {
    pub config: GlobalConfig,
    pub ttl_udp_ms: u64,
    pub ttl_icmp_ms: u64,
    pub ttl_tcp_est_ms: u64,
    pub ttl_tcp_trans_ms: u64,
    pub ttl_frag_ms: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Ack,
    Display(Box<DisplaySnapshot>),
}

/// Tracks the `ENABLE`/`DISABLE` switch, which lives alongside the config rather than inside it
/// (enabling/disabling doesn't go through the validate-then-publish path other settings do).
#[derive(Default)]
pub struct EnableSwitch(AtomicBool);

impl EnableSwitch {
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Applies a decoded control op to live state. `pool6_empty`/`eamt_empty` are supplied by the
/// SIIT side (out of scope here) purely to compute the displayed `enabled` flag.
pub fn apply(
    op: ControlOp,
    config: &ConfigStore,
    pool4: &Pool4Db,
    enable_switch: &EnableSwitch,
    pool6_empty: bool,
    eamt_empty: bool,
) -> NatResult<ControlOutcome> {
    match op {
        ControlOp::Enable => {
            enable_switch.0.store(false, Ordering::SeqCst);
            Ok(ControlOutcome::Ack)
        }
        ControlOp::Disable => {
            enable_switch.0.store(true, Ordering::SeqCst);
            Ok(ControlOutcome::Ack)
        }
        ControlOp::Set(update) => {
            let next = update.apply_to(&config.current())?;
            config.replace(next)?;
            Ok(ControlOutcome::Ack)
        }
        ControlOp::Display => {
            let cfg = config.current();
            let enabled = cfg.enabled(enable_switch.is_disabled(), pool6_empty, eamt_empty);
            Ok(ControlOutcome::Display(Box::new(DisplaySnapshot {
                ttl_udp_ms: cfg.ttl.udp.as_millis(),
                ttl_icmp_ms: cfg.ttl.icmp.as_millis(),
                ttl_tcp_est_ms: cfg.ttl.tcp_est.as_millis(),
                ttl_tcp_trans_ms: cfg.ttl.tcp_trans.as_millis(),
                ttl_frag_ms: cfg.ttl.frag.as_millis(),
                config: cfg.as_ref().clone(),
                enabled,
            })))
        }
        ControlOp::Pool4Add {
            mark,
            proto,
            prefix,
            port_lo,
            port_hi,
        } => {
            pool4.add_prefix(mark, proto, prefix, port_lo, port_hi)?;
            Ok(ControlOutcome::Ack)
        }
        ControlOp::Pool4Rm {
            mark,
            proto,
            prefix,
            port_lo,
            port_hi,
        } => {
            pool4.rm_prefix(mark, proto, prefix, port_lo, port_hi)?;
            Ok(ControlOutcome::Ack)
        }
    }
}

impl PartialEq for DisplaySnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.ttl_udp_ms == other.ttl_udp_ms
            && self.ttl_icmp_ms == other.ttl_icmp_ms
            && self.ttl_tcp_est_ms == other.ttl_tcp_est_ms
            && self.ttl_tcp_trans_ms == other.ttl_tcp_trans_ms
            && self.ttl_frag_ms == other.ttl_frag_ms
            && self.enabled == other.enabled
            && self.config == other.config
    }
}

impl Eq for DisplaySnapshot {}
