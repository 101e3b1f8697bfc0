// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Error kinds shared by every public operation in this crate.

use crate::tuple::L4Proto;

/// `NatError` is the single error type returned by the control-plane and data-model operations of
/// this crate. The datapath itself never propagates a `NatError` past [`crate::dispatcher`]: any
/// internal anomaly there becomes a `Verdict::Drop` plus a rate-limited log line instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NatError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("pool4 is exhausted for mark {mark} proto {proto:?}")]
    Exhausted { mark: u32, proto: L4Proto },

    #[error("no pool4 entries for mark {mark} proto {proto:?}")]
    NoKey { mark: u32, proto: L4Proto },

    #[error("permission denied")]
    PermissionDenied,
}

pub type NatResult<T> = Result<T, NatError>;
