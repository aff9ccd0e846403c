// SPDX-License-Identifier: MIT
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use super::format::{EOF_MARKER, FORMAT_VERSION, MAGIC};
use crate::recording::format::{FileHeader, Record};
use crate::session::{Session, SessionMetadata};

pub struct RecordingWriter {
    encoder: zstd::Encoder<'static, BufWriter<File>>,
    records: u64,
}

impl RecordingWriter {
    /// Creates a new recording file at `path` and writes the file header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the header cannot be written.
    pub fn create(path: &Path, metadata: &SessionMetadata) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create recording file: {}", path.display()))?;
        let buf_writer = BufWriter::new(file);
        let encoder =
            zstd::Encoder::new(buf_writer, 3).context("failed to create zstd encoder")?;

        let mut writer = Self {
            encoder,
            records: 0,
        };
        let header = FileHeader {
            magic: MAGIC,
            format_version: FORMAT_VERSION,
            metadata: metadata.clone(),
        };
        writer
            .write_prefixed(&header)
            .context("failed to write file header")?;
        Ok(writer)
    }

    /// Writes a single record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.write_prefixed(record)
            .context("failed to write record")?;
        self.records += 1;
        Ok(())
    }

    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records
    }

    fn write_prefixed(&mut self, value: &impl Serialize) -> Result<()> {
        let serialized = postcard::to_stdvec(value).context("failed to serialize")?;
        let len = u32::try_from(serialized.len()).context("record too large")?;
        self.encoder
            .write_all(&len.to_le_bytes())
            .context("failed to write length")?;
        self.encoder
            .write_all(&serialized)
            .context("failed to write data")?;
        Ok(())
    }

    /// Writes the EOF marker, finishes compression, and flushes the file.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or flushing fails.
    pub fn finish(mut self) -> Result<()> {
        self.encoder
            .write_all(&EOF_MARKER)
            .context("failed to write EOF marker")?;
        let mut buf_writer = self
            .encoder
            .finish()
            .context("failed to finish zstd encoder")?;
        buf_writer
            .flush()
            .context("failed to flush recording file")?;
        Ok(())
    }
}

/// Writes a finalized session to `path`: header, readings, events,
/// transitions, then the outcome trailer.
///
/// # Errors
///
/// Returns an error if any part of the file cannot be written.
pub fn save(path: &Path, session: &Session) -> Result<u64> {
    let mut writer = RecordingWriter::create(path, session.metadata())?;
    for reading in session.readings() {
        writer.write_record(&Record::Reading(*reading))?;
    }
    for event in session.events() {
        writer.write_record(&Record::Event(*event))?;
    }
    for transition in session.transitions() {
        writer.write_record(&Record::Transition(*transition))?;
    }
    writer.write_record(&Record::Trailer(session.outcome().clone()))?;
    let written = writer.records_written();
    writer.finish()?;
    Ok(written)
}
