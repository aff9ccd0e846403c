// SPDX-License-Identifier: MIT
//! Session lifecycle.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Finalized
//!            |           |                      ^
//!            +-----------+------> Aborted ------+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::EndReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Aborted = 4,
    Finalized = 5,
}

impl Phase {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Aborted,
            5 => Self::Finalized,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Aborted => "aborted",
            Self::Finalized => "finalized",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Start,
    WarmupComplete,
    Stop(EndReason),
    Abort(EndReason),
    /// Workers have stopped (or the grace period ran out).
    Settled { timed_out: bool },
}

impl Trigger {
    fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::WarmupComplete => "warm-up complete",
            Self::Stop(_) => "stop",
            Self::Abort(_) => "abort",
            Self::Settled { .. } => "settled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping { reason: EndReason },
    Aborted { reason: EndReason },
    Finalized { reason: EndReason, degraded: bool },
}

impl SessionState {
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Starting => Phase::Starting,
            Self::Running => Phase::Running,
            Self::Stopping { .. } => Phase::Stopping,
            Self::Aborted { .. } => Phase::Aborted,
            Self::Finalized { .. } => Phase::Finalized,
        }
    }

    /// Applies `trigger`, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] for any pair not in the lifecycle,
    /// including stop triggers carrying an abort reason and vice versa.
    pub fn on(self, trigger: Trigger) -> Result<Self> {
        let next = match (self, trigger) {
            (Self::Idle, Trigger::Start) => Self::Starting,
            (Self::Starting, Trigger::WarmupComplete) => Self::Running,
            (Self::Running, Trigger::Stop(reason)) if !reason.is_abort() => {
                Self::Stopping { reason }
            }
            (Self::Starting | Self::Running, Trigger::Abort(reason)) if reason.is_abort() => {
                Self::Aborted { reason }
            }
            (Self::Stopping { reason }, Trigger::Settled { timed_out }) => Self::Finalized {
                reason,
                degraded: timed_out,
            },
            (Self::Aborted { reason }, Trigger::Settled { .. }) => Self::Finalized {
                reason,
                degraded: true,
            },
            (state, trigger) => {
                return Err(Error::IllegalTransition {
                    from: state.phase(),
                    trigger: trigger.name(),
                });
            }
        };
        Ok(next)
    }
}

/// Advisory, lock-free view of the current phase for other threads.
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    #[must_use]
    pub fn new(phase: Phase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    pub fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    #[must_use]
    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let state = SessionState::Idle
            .on(Trigger::Start)
            .and_then(|s| s.on(Trigger::WarmupComplete))
            .and_then(|s| s.on(Trigger::Stop(EndReason::DurationElapsed)))
            .and_then(|s| s.on(Trigger::Settled { timed_out: false }))
            .unwrap();
        assert_eq!(
            state,
            SessionState::Finalized {
                reason: EndReason::DurationElapsed,
                degraded: false
            }
        );
    }

    #[test]
    fn abort_from_starting_finalizes_degraded() {
        let state = SessionState::Starting
            .on(Trigger::Abort(EndReason::HardwareFailure))
            .and_then(|s| s.on(Trigger::Settled { timed_out: false }))
            .unwrap();
        assert_eq!(
            state,
            SessionState::Finalized {
                reason: EndReason::HardwareFailure,
                degraded: true
            }
        );
    }

    #[test]
    fn grace_timeout_marks_stop_degraded() {
        let state = SessionState::Stopping {
            reason: EndReason::Cancelled,
        }
        .on(Trigger::Settled { timed_out: true })
        .unwrap();
        assert!(matches!(state, SessionState::Finalized { degraded: true, .. }));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let cases = [
            (SessionState::Idle, Trigger::WarmupComplete),
            (SessionState::Idle, Trigger::Stop(EndReason::Cancelled)),
            (SessionState::Starting, Trigger::Stop(EndReason::Cancelled)),
            (SessionState::Running, Trigger::Start),
            (SessionState::Running, Trigger::Stop(EndReason::WorkloadAborted)),
            (SessionState::Running, Trigger::Abort(EndReason::Cancelled)),
            (SessionState::Running, Trigger::Settled { timed_out: false }),
            (
                SessionState::Finalized {
                    reason: EndReason::Cancelled,
                    degraded: false,
                },
                Trigger::Start,
            ),
        ];
        for (state, trigger) in cases {
            assert!(
                matches!(state.on(trigger), Err(Error::IllegalTransition { .. })),
                "{state:?} accepted {trigger:?}"
            );
        }
    }

    #[test]
    fn phase_cell_round_trips_every_phase() {
        let cell = PhaseCell::new(Phase::Idle);
        for phase in [
            Phase::Idle,
            Phase::Starting,
            Phase::Running,
            Phase::Stopping,
            Phase::Aborted,
            Phase::Finalized,
        ] {
            cell.set(phase);
            assert_eq!(cell.get(), phase);
        }
    }
}
