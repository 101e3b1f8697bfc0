// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The TCP session state machine. UDP and ICMP sessions never leave `Established`; only TCP
//! exercises the rest of [`TcpState`].

/// A TCP session's state. Shared by every protocol's [`crate::session::Session`] so the table
/// doesn't need a separate enum per protocol; UDP/ICMP sessions are simply pinned at
/// `Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    V4Init,
    V6Init,
    Established,
    V4FinRcv,
    V6FinRcv,
    V4V6FinRcv,
    Trans,
}

/// The event that can drive a transition: a SYN/FIN/RST observed in either direction, a deadline
/// sweep, or any other data packet (used only to pull a `Trans` session back to `Established`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    Syn6In,
    Syn4In,
    Fin6In,
    Fin4In,
    Rst,
    Data,
}

/// Which TTL a transition's resulting deadline is computed from. `V4InitGrace` is the one fixed,
/// non-configurable timer (6 seconds) from the state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpDeadlineKind {
    Est,
    Trans,
    V4InitGrace,
}

/// Looks up the transition for `(state, event)`. Returns `None` when the event has no effect in
/// that state (e.g. a second SYN in `Established`, or an RST in a `*_FIN_RCV` state when
/// `handle_rst_during_fin_rcv` is false).
#[must_use]
pub fn transition(
    state: TcpState,
    event: TcpEvent,
    handle_rst_during_fin_rcv: bool,
) -> Option<(TcpState, TcpDeadlineKind)> {
    use TcpEvent::{Data, Fin4In, Fin6In, Rst, Syn4In, Syn6In};
    use TcpState::{
        Closed, Established, Trans, V4FinRcv, V4Init, V4V6FinRcv, V6FinRcv, V6Init,
    };

    match (state, event) {
        (Closed, Syn6In) => Some((V6Init, TcpDeadlineKind::Trans)),
        (Closed, Syn4In) => Some((V4Init, TcpDeadlineKind::V4InitGrace)),
        (V6Init, Syn4In) => Some((Established, TcpDeadlineKind::Est)),
        (V4Init, Syn6In) => Some((Established, TcpDeadlineKind::Est)),
        (Established, Fin6In) => Some((V6FinRcv, TcpDeadlineKind::Est)),
        (Established, Fin4In) => Some((V4FinRcv, TcpDeadlineKind::Est)),
        (V4FinRcv, Fin6In) => Some((V4V6FinRcv, TcpDeadlineKind::Trans)),
        (V6FinRcv, Fin4In) => Some((V4V6FinRcv, TcpDeadlineKind::Trans)),
        (Trans, Data) => Some((Established, TcpDeadlineKind::Est)),
        (s, Rst) if s != V4V6FinRcv => {
            let in_fin_rcv = matches!(s, V4FinRcv | V6FinRcv);
            if in_fin_rcv && !handle_rst_during_fin_rcv {
                None
            } else {
                Some((Trans, TcpDeadlineKind::Trans))
            }
        }
        _ => None,
    }
}
