// SPDX-License-Identifier: MIT
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result, bail};

use super::format::{EOF_MARKER, FORMAT_VERSION, MAGIC};
use crate::recording::format::{FileHeader, Record};
use crate::session::{Outcome, Session, SessionMetadata, TransitionRecord};
use crate::telemetry::TelemetryReading;
use crate::workload::WorkloadEvent;

pub struct RecordingReader {
    metadata: SessionMetadata,
    readings: Vec<TelemetryReading>,
    events: Vec<WorkloadEvent>,
    transitions: Vec<TransitionRecord>,
    outcome: Outcome,
}

impl RecordingReader {
    /// Opens a recording file, validates the header, and reads every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, the header is invalid,
    /// record data is corrupted, or the outcome trailer is missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open recording file: {}", path.display()))?;
        let buf_reader = BufReader::new(file);
        let mut decoder =
            zstd::Decoder::new(buf_reader).context("failed to create zstd decoder")?;

        let header = Self::read_header(&mut decoder)?;

        if header.magic != MAGIC {
            bail!("invalid magic bytes in recording file");
        }
        if header.format_version != FORMAT_VERSION {
            bail!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                header.format_version
            );
        }

        let mut readings = Vec::new();
        let mut events = Vec::new();
        let mut transitions = Vec::new();
        let mut outcome = None;

        while let Some(record) = Self::read_record(&mut decoder)? {
            match record {
                Record::Reading(r) => readings.push(r),
                Record::Event(e) => events.push(e),
                Record::Transition(t) => transitions.push(t),
                Record::Trailer(o) => outcome = Some(o),
            }
        }

        let Some(outcome) = outcome else {
            bail!("recording is truncated: no session outcome");
        };

        Ok(Self {
            metadata: header.metadata,
            readings,
            events,
            transitions,
            outcome,
        })
    }

    #[must_use]
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn readings(&self) -> &[TelemetryReading] {
        &self.readings
    }

    #[must_use]
    pub fn events(&self) -> &[WorkloadEvent] {
        &self.events
    }

    /// Rebuilds the finalized session.
    #[must_use]
    pub fn into_session(self) -> Session {
        Session::from_parts(
            self.metadata,
            self.readings,
            self.events,
            self.transitions,
            self.outcome,
        )
    }

    fn read_header(reader: &mut impl Read) -> Result<FileHeader> {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .context("failed to read header length")?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut data = vec![0u8; len];
        reader
            .read_exact(&mut data)
            .context("failed to read header data")?;

        postcard::from_bytes(&data).context("failed to deserialize file header")
    }

    fn read_record(reader: &mut impl Read) -> Result<Option<Record>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("failed to read record length"),
        }

        if len_buf == EOF_MARKER {
            return Ok(None);
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        let mut data = vec![0u8; len];
        reader
            .read_exact(&mut data)
            .context("failed to read record data")?;

        postcard::from_bytes(&data)
            .map(Some)
            .context("failed to deserialize record")
    }
}
