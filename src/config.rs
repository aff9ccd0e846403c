// SPDX-License-Identifier: MIT
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::workload::WorkloadSpec;

/// Upper bound on preallocated telemetry slots for a single session.
pub const MAX_TELEMETRY_CAPACITY: usize = 1 << 20;
/// Upper bound on preallocated workload event slots for a single session.
pub const MAX_EVENT_CAPACITY: usize = 1 << 21;

const TELEMETRY_SLACK: usize = 8;
const MAX_TEMPERATURE_LIMIT_C: f32 = 150.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub sample_interval_ms: u64,
    pub duration_ms: Option<u64>,
    pub max_iterations: Option<u64>,
    pub warmup_readings: u32,
    pub hardware_read_timeout_ms: u64,
    pub hardware_failure_threshold: u32,
    pub workload_timeout_ms: u64,
    pub consecutive_failure_limit: u32,
    pub grace_timeout_ms: u64,
    pub temperature_limit_c: Option<f32>,
    pub workload: WorkloadSpec,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            duration_ms: Some(60_000),
            max_iterations: None,
            warmup_readings: 3,
            hardware_read_timeout_ms: 500,
            hardware_failure_threshold: 5,
            workload_timeout_ms: 2000,
            consecutive_failure_limit: 3,
            grace_timeout_ms: 2000,
            temperature_limit_c: None,
            workload: WorkloadSpec::default(),
        }
    }
}

impl SessionConfig {
    /// Loads a config from a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML for
    /// this schema.
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Checks every field that would otherwise surface as a failure once the
    /// session is already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(Error::invalid("sample interval must be greater than zero"));
        }
        if self.duration_ms.is_none() && self.max_iterations.is_none() {
            return Err(Error::invalid(
                "a duration or an iteration limit is required",
            ));
        }
        if self.duration_ms == Some(0) {
            return Err(Error::invalid("duration must be greater than zero"));
        }
        if self.max_iterations == Some(0) {
            return Err(Error::invalid("iteration limit must be greater than zero"));
        }
        if self.hardware_read_timeout_ms == 0
            || self.workload_timeout_ms == 0
            || self.grace_timeout_ms == 0
        {
            return Err(Error::invalid("timeouts must be greater than zero"));
        }
        if self.hardware_failure_threshold == 0 {
            return Err(Error::invalid("hardware failure threshold must be at least 1"));
        }
        if self.consecutive_failure_limit == 0 {
            return Err(Error::invalid("consecutive failure limit must be at least 1"));
        }
        if let Some(limit) = self.temperature_limit_c
            && !(1.0..=MAX_TEMPERATURE_LIMIT_C).contains(&limit)
        {
            return Err(Error::invalid(format!(
                "temperature limit {limit} C is outside 1..={MAX_TEMPERATURE_LIMIT_C}"
            )));
        }
        self.workload.validate()?;

        if self.hardware_read_timeout_ms > self.sample_interval_ms {
            log::warn!(
                "hardware read timeout ({} ms) exceeds the sample interval ({} ms); \
                 slow reads will skip ticks",
                self.hardware_read_timeout_ms,
                self.sample_interval_ms
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn hardware_read_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware_read_timeout_ms)
    }

    #[must_use]
    pub fn workload_timeout(&self) -> Duration {
        Duration::from_millis(self.workload_timeout_ms)
    }

    #[must_use]
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    /// Number of telemetry slots to preallocate. Without a duration the
    /// session length is bounded by the worst case of every iteration hitting
    /// its timeout.
    #[must_use]
    pub fn telemetry_capacity(&self) -> usize {
        let window_ms = match (self.duration_ms, self.max_iterations) {
            (Some(d), _) => d,
            (None, Some(n)) => n.saturating_mul(self.workload_timeout_ms),
            (None, None) => 0,
        };
        let ticks = window_ms / self.sample_interval_ms.max(1);
        usize::try_from(ticks)
            .unwrap_or(usize::MAX)
            .saturating_add(TELEMETRY_SLACK)
            .min(MAX_TELEMETRY_CAPACITY)
    }

    #[must_use]
    pub fn event_capacity(&self) -> usize {
        self.max_iterations.map_or(MAX_EVENT_CAPACITY, |n| {
            usize::try_from(n)
                .unwrap_or(usize::MAX)
                .min(MAX_EVENT_CAPACITY)
        })
    }
}
