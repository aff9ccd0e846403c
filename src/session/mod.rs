// SPDX-License-Identifier: MIT
pub mod arena;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use self::arena::LogReader;
use crate::config::SessionConfig;
use crate::sync::state::Phase;
use crate::telemetry::TelemetryReading;
use crate::workload::WorkloadEvent;

/// Monotonic time base shared by every thread of one session.
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    #[must_use]
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the session epoch.
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        self.ns_at(Instant::now())
    }

    #[must_use]
    pub fn ns_at(&self, instant: Instant) -> u64 {
        u64::try_from(instant.saturating_duration_since(self.epoch).as_nanos())
            .unwrap_or(u64::MAX)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// A process-unique id derived from wall-clock time and a counter.
    #[must_use]
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(nanos ^ (u64::from(std::process::id()) << 32) ^ seq.rotate_left(48))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub started_at: SystemTime,
    pub sensor: String,
    pub workload_backend: String,
    pub config: SessionConfig,
}

/// Why the session left the running state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    DurationElapsed,
    IterationLimit,
    CapacityExhausted,
    Cancelled,
    WorkloadAborted,
    HardwareFailure,
    ThermalLimit,
}

impl EndReason {
    /// Reasons that take the session through `Aborted` rather than `Stopping`.
    #[must_use]
    pub fn is_abort(self) -> bool {
        matches!(
            self,
            Self::WorkloadAborted | Self::HardwareFailure | Self::ThermalLimit
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DurationElapsed => "duration elapsed",
            Self::IterationLimit => "iteration limit reached",
            Self::CapacityExhausted => "log capacity exhausted",
            Self::Cancelled => "cancelled",
            Self::WorkloadAborted => "workload aborted after consecutive failures",
            Self::HardwareFailure => "telemetry hardware failure",
            Self::ThermalLimit => "thermal limit exceeded",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub phase: Phase,
    pub at_ns: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub end_reason: EndReason,
    pub degraded: bool,
    pub ended_at: SystemTime,
    /// Session-clock time at which `Running` was entered, if it ever was.
    pub running_started_ns: Option<u64>,
    /// Session-clock time at which the session was finalized.
    pub finished_ns: u64,
}

/// A session while the synchronizer still owns it. Its logs are being
/// appended to by the worker threads.
pub struct ActiveSession {
    metadata: SessionMetadata,
    clock: SessionClock,
    telemetry: LogReader<TelemetryReading>,
    events: LogReader<WorkloadEvent>,
    transitions: Vec<TransitionRecord>,
}

impl ActiveSession {
    #[must_use]
    pub fn new(
        metadata: SessionMetadata,
        clock: SessionClock,
        telemetry: LogReader<TelemetryReading>,
        events: LogReader<WorkloadEvent>,
    ) -> Self {
        Self {
            metadata,
            clock,
            telemetry,
            events,
            transitions: Vec::with_capacity(6),
        }
    }

    pub fn record_transition(&mut self, phase: Phase) {
        self.transitions.push(TransitionRecord {
            phase,
            at_ns: self.clock.now_ns(),
        });
    }

    #[must_use]
    pub fn telemetry(&self) -> &LogReader<TelemetryReading> {
        &self.telemetry
    }

    #[must_use]
    pub fn events(&self) -> &LogReader<WorkloadEvent> {
        &self.events
    }

    #[must_use]
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Freezes the session. Consumes the active session so it can only happen
    /// once.
    #[must_use]
    pub fn finalize(mut self, end_reason: EndReason, degraded: bool) -> Session {
        self.record_transition(Phase::Finalized);
        let running_started_ns = self
            .transitions
            .iter()
            .find(|t| t.phase == Phase::Running)
            .map(|t| t.at_ns);
        let finished_ns = self.transitions.last().map_or(0, |t| t.at_ns);

        Session {
            readings: self.telemetry.snapshot(),
            events: self.events.snapshot(),
            transitions: self.transitions,
            outcome: Outcome {
                end_reason,
                degraded,
                ended_at: SystemTime::now(),
                running_started_ns,
                finished_ns,
            },
            metadata: self.metadata,
        }
    }
}

/// A finalized session. Read-only.
#[derive(Clone, Debug)]
pub struct Session {
    metadata: SessionMetadata,
    readings: Vec<TelemetryReading>,
    events: Vec<WorkloadEvent>,
    transitions: Vec<TransitionRecord>,
    outcome: Outcome,
}

impl Session {
    /// Rebuilds a finalized session from its recorded parts.
    #[must_use]
    pub fn from_parts(
        metadata: SessionMetadata,
        readings: Vec<TelemetryReading>,
        events: Vec<WorkloadEvent>,
        transitions: Vec<TransitionRecord>,
        outcome: Outcome,
    ) -> Self {
        Self {
            metadata,
            readings,
            events,
            transitions,
            outcome,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.metadata.session_id
    }

    #[must_use]
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.metadata.config
    }

    #[must_use]
    pub fn readings(&self) -> &[TelemetryReading] {
        &self.readings
    }

    #[must_use]
    pub fn events(&self) -> &[WorkloadEvent] {
        &self.events
    }

    #[must_use]
    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    #[cfg(test)]
    #[must_use]
    pub fn went_through(&self, phase: Phase) -> bool {
        self.transitions.iter().any(|t| t.phase == phase)
    }
}
