// SPDX-License-Identifier: MIT
//! Sensor model for machines without a supported GPU.
//!
//! Utilization follows the busy fraction of the workload counters, and
//! temperature approaches a load-dependent target with a first-order lag.

use std::sync::Arc;
use std::time::Instant;

use super::{SensorValues, TelemetrySource};
use crate::error::Result;
use crate::workload::counters::ThroughputCounters;

const AMBIENT_C: f32 = 35.0;
const LOAD_HEATING_C: f32 = 50.0;
const THERMAL_TIME_CONSTANT_S: f32 = 8.0;
const THROTTLE_START_C: f32 = 83.0;
const BASE_CLOCK_MHZ: f32 = 1200.0;
const BOOST_CLOCK_MHZ: f32 = 600.0;
const IDLE_POWER_W: f32 = 25.0;
const LOAD_POWER_W: f32 = 200.0;
const BASE_MEMORY_MB: f32 = 512.0;
const JITTER: f32 = 0.02;

pub struct SimulatedSensor {
    counters: Arc<ThroughputCounters>,
    last_read: Instant,
    last_busy_ns: u64,
    temperature_c: f32,
    rng_state: u64,
}

impl SimulatedSensor {
    #[must_use]
    pub fn new(counters: Arc<ThroughputCounters>, seed: u64) -> Self {
        let last_busy_ns = counters.snapshot().busy_ns;
        Self {
            counters,
            last_read: Instant::now(),
            last_busy_ns,
            temperature_c: AMBIENT_C,
            rng_state: seed | 1,
        }
    }

    /// Uniform noise in `[-1, 1)`, xorshift64.
    fn noise(&mut self) -> f32 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        #[allow(clippy::cast_precision_loss)]
        let unit = (x >> 40) as f32 / (1u64 << 24) as f32;
        unit * 2.0 - 1.0
    }
}

impl TelemetrySource for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn read(&mut self) -> Result<SensorValues> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_read);
        let busy_ns = self.counters.snapshot().busy_ns;

        #[allow(clippy::cast_precision_loss)]
        let busy_fraction = if dt.is_zero() {
            0.0
        } else {
            (busy_ns.saturating_sub(self.last_busy_ns) as f64 / dt.as_nanos() as f64).min(1.0)
        };
        self.last_read = now;
        self.last_busy_ns = busy_ns;

        #[allow(clippy::cast_possible_truncation)]
        let load = busy_fraction as f32;
        let target_c = AMBIENT_C + LOAD_HEATING_C * load;
        let alpha = 1.0 - (-dt.as_secs_f32() / THERMAL_TIME_CONSTANT_S).exp();
        self.temperature_c += (target_c - self.temperature_c) * alpha;

        let throttle = ((self.temperature_c - THROTTLE_START_C) / 10.0).clamp(0.0, 1.0);
        let clock_mhz = BASE_CLOCK_MHZ + BOOST_CLOCK_MHZ * load * (1.0 - throttle);
        let jitter = 1.0 + JITTER * self.noise();

        Ok(SensorValues {
            utilization_pct: (load * 100.0 * jitter).clamp(0.0, 100.0),
            temperature_c: self.temperature_c,
            clock_mhz: clock_mhz * jitter,
            power_w: (IDLE_POWER_W + LOAD_POWER_W * load) * jitter,
            memory_used_mb: BASE_MEMORY_MB + 256.0 * load,
        })
    }
}
