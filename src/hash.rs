// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The keyed hash `F`: an MD5-based pseudo-random function over a subset of a [`Tuple6`]'s
//! fields, used by the port allocator to compute its starting offset into Pool4.

use std::sync::Mutex;

use md5::{Digest, Md5};
use once_cell::sync::OnceCell;
use rand::RngCore;

use crate::config::FArgs;
use crate::tuple::Tuple6;

const SECRET_LEN: usize = 128;

static SECRET: OnceCell<[u8; SECRET_LEN]> = OnceCell::new();
// Guards the shared MD5 transform context, matching the reference implementation's `tfm_lock`.
// Held only for the duration of one hash computation, a handful of microseconds.
static TFM_LOCK: Mutex<()> = Mutex::new(());

fn secret() -> &'static [u8; SECRET_LEN] {
    SECRET.get_or_init(|| {
        let mut buf = [0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut buf);
        buf
    })
}

/// Computes `F(tuple)`: MD5 over the fields selected by `f_args`, in `SRC_ADDR, SRC_PORT,
/// DST_ADDR, DST_PORT` order, followed by the process-wide secret; returns the low 32 bits of the
/// digest.
#[must_use]
pub fn f(tuple: &Tuple6, f_args: FArgs) -> u32 {
    let _tfm = TFM_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut hasher = Md5::new();
    if f_args.contains(FArgs::SRC_ADDR) {
        hasher.update(tuple.src.addr.octets());
    }
    if f_args.contains(FArgs::SRC_PORT) {
        hasher.update(tuple.src.port.to_be_bytes());
    }
    if f_args.contains(FArgs::DST_ADDR) {
        hasher.update(tuple.dst.addr.octets());
    }
    if f_args.contains(FArgs::DST_PORT) {
        hasher.update(tuple.dst.port.to_be_bytes());
    }
    hasher.update(secret());
    let digest = hasher.finalize();
    u32::from_be_bytes(digest[12..16].try_into().expect("md5 digest is 16 bytes"))
}
