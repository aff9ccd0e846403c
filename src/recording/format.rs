// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::session::{Outcome, SessionMetadata, TransitionRecord};
use crate::telemetry::TelemetryReading;
use crate::workload::WorkloadEvent;

pub const MAGIC: [u8; 4] = *b"GBRN";
pub const FORMAT_VERSION: u8 = 1;
pub const EOF_MARKER: [u8; 4] = *b"GEOF";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub format_version: u8,
    pub metadata: SessionMetadata,
}

/// One length-prefixed entry after the header. The trailer comes last.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Record {
    Reading(TelemetryReading),
    Event(WorkloadEvent),
    Transition(TransitionRecord),
    Trailer(Outcome),
}
