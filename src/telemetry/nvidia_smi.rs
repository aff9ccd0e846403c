// SPDX-License-Identifier: MIT
//! Sensor backend built on `nvidia-smi` CSV queries.

use std::process::Command;
use std::sync::Arc;

use super::hardware::SensorHandle;
use super::{SensorValues, TelemetrySource};
use crate::error::{Error, Result};

pub const NVIDIA_SMI: &str = "nvidia-smi";

const QUERY_FIELDS: &str = "utilization.gpu,temperature.gpu,clocks.gr,power.draw,memory.used";

/// Runs `nvidia-smi` with the given arguments and returns its trimmed stdout.
///
/// # Errors
///
/// Returns [`Error::HardwareUnavailable`] if the tool cannot be launched or
/// exits unsuccessfully.
pub fn query(args: &[&str]) -> Result<String> {
    let output = Command::new(NVIDIA_SMI)
        .args(args)
        .output()
        .map_err(|e| Error::HardwareUnavailable(format!("failed to run {NVIDIA_SMI}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::HardwareUnavailable(format!(
            "{NVIDIA_SMI} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub struct NvidiaSmiSource {
    handle: Arc<SensorHandle>,
    id_arg: String,
}

impl NvidiaSmiSource {
    #[must_use]
    pub fn new(handle: Arc<SensorHandle>) -> Self {
        let id_arg = format!("--id={}", handle.device_index());
        Self { handle, id_arg }
    }
}

impl TelemetrySource for NvidiaSmiSource {
    fn name(&self) -> &str {
        self.handle.device_name()
    }

    fn read(&mut self) -> Result<SensorValues> {
        let query_arg = format!("--query-gpu={QUERY_FIELDS}");
        let stdout = query(&[
            self.id_arg.as_str(),
            query_arg.as_str(),
            "--format=csv,noheader,nounits",
        ])?;
        let line = stdout
            .lines()
            .next()
            .ok_or_else(|| Error::HardwareUnavailable(format!("{NVIDIA_SMI} returned no rows")))?;
        parse_query_line(line)
    }
}

/// Parses one `--format=csv,noheader,nounits` row of [`QUERY_FIELDS`].
///
/// Fields the driver reports as `[N/A]` or `[Not Supported]` read as NaN,
/// which marks the metric unavailable; a row with no usable field at all is an
/// error.
fn parse_query_line(line: &str) -> Result<SensorValues> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return Err(Error::HardwareUnavailable(format!(
            "unexpected {NVIDIA_SMI} row: {line:?}"
        )));
    }

    let parsed: Vec<Option<f32>> = fields.iter().map(|f| f.parse::<f32>().ok()).collect();
    if parsed.iter().all(Option::is_none) {
        return Err(Error::HardwareUnavailable(format!(
            "no readable sensor in {NVIDIA_SMI} row: {line:?}"
        )));
    }

    let value = |i: usize| parsed[i].unwrap_or(f32::NAN);
    Ok(SensorValues {
        utilization_pct: value(0),
        temperature_c: value(1),
        clock_mhz: value(2),
        power_w: value(3),
        memory_used_mb: value(4),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_row() {
        let values = parse_query_line("97, 71, 1845, 213.45, 6021").unwrap();
        assert!((values.utilization_pct - 97.0).abs() < f32::EPSILON);
        assert!((values.temperature_c - 71.0).abs() < f32::EPSILON);
        assert!((values.clock_mhz - 1845.0).abs() < f32::EPSILON);
        assert!((values.power_w - 213.45).abs() < 0.001);
        assert!((values.memory_used_mb - 6021.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unsupported_fields_are_unavailable() {
        let values = parse_query_line("12, 40, 300, [N/A], 512").unwrap();
        assert!(values.power_w.is_nan());
        assert!((values.memory_used_mb - 512.0).abs() < f32::EPSILON);
    }

    #[test]
    fn short_row_is_rejected() {
        assert!(matches!(
            parse_query_line("12, 40"),
            Err(Error::HardwareUnavailable(_))
        ));
    }

    #[test]
    fn row_without_any_value_is_rejected() {
        assert!(parse_query_line("[N/A], [N/A], [N/A], [N/A], [N/A]").is_err());
    }
}
