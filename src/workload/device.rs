// SPDX-License-Identifier: MIT
//! Synthetic GPU device.
//!
//! A `gpu-device` thread owns the work buffers and executes one unit at a
//! time. Submission is a rendezvous, so a unit is only handed over when the
//! device is idle; completion is reported back by iteration number.

use std::hint::black_box;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use super::{Dispatch, WorkUnit, WorkloadBackend, WorkloadKind, WorkloadSpec};
use crate::error::{Error, Result};

pub struct DeviceBackend {
    submit: Option<Sender<WorkUnit>>,
    completions: Option<Receiver<u64>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DeviceBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            submit: None,
            completions: None,
            handle: None,
        }
    }

    fn shutdown(&mut self) {
        // Dropping the sender ends the device loop after its current unit.
        self.submit = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for DeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorkloadBackend for DeviceBackend {
    fn name(&self) -> &str {
        "synthetic-device"
    }

    fn prepare(&mut self, spec: &WorkloadSpec) -> Result<()> {
        self.shutdown();

        let mut kernel = Kernel::allocate(spec);
        let (submit, units) = crossbeam_channel::bounded::<WorkUnit>(0);
        let (done_tx, completions) = crossbeam_channel::unbounded::<u64>();

        let handle = thread::Builder::new()
            .name("gpu-device".into())
            .spawn(move || {
                while let Ok(unit) = units.recv() {
                    kernel.run(unit);
                    if done_tx.send(unit.iteration).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| Error::ThreadSpawn {
                name: "gpu-device",
                source,
            })?;

        self.submit = Some(submit);
        self.completions = Some(completions);
        self.handle = Some(handle);
        Ok(())
    }

    fn execute(&mut self, unit: WorkUnit, timeout: Duration) -> Result<Dispatch> {
        let (Some(submit), Some(completions)) = (&self.submit, &self.completions) else {
            return Err(Error::WorkloadAbort("device was never prepared".into()));
        };
        let deadline = Instant::now() + timeout;

        match submit.send_timeout(unit, timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Ok(Dispatch::Busy),
            Err(SendTimeoutError::Disconnected(_)) => {
                return Err(Error::WorkloadAbort("device thread exited".into()));
            }
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match completions.recv_timeout(remaining) {
                Ok(done) if done == unit.iteration => return Ok(Dispatch::Completed),
                // Completion of a unit that already timed out.
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::WorkloadTimeout {
                        iteration: unit.iteration,
                        timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::WorkloadAbort("device thread exited".into()));
                }
            }
        }
    }
}

/// Buffers are allocated once here; running a unit never allocates.
enum Kernel {
    Compute { data: Vec<f32> },
    Render { frame: Vec<u32>, width: usize },
}

impl Kernel {
    #[allow(clippy::cast_precision_loss)]
    fn allocate(spec: &WorkloadSpec) -> Self {
        let size = spec.work_size as usize;
        match spec.kind {
            WorkloadKind::Compute => Self::Compute {
                data: (0..size).map(|i| (i % 1024) as f32 * 0.001).collect(),
            },
            WorkloadKind::Render => Self::Render {
                frame: vec![0; size],
                width: size.isqrt().max(1),
            },
        }
    }

    fn run(&mut self, unit: WorkUnit) {
        match self {
            Self::Compute { data } => {
                for _ in 0..unit.passes {
                    for x in data.iter_mut() {
                        *x = x.mul_add(0.999_9, 0.01);
                    }
                }
                black_box(data.first().copied());
            }
            Self::Render { frame, width } => {
                #[allow(clippy::cast_precision_loss)]
                let t = (unit.iteration % 4096) as f32 * 0.05;
                for pass in 0..unit.passes {
                    #[allow(clippy::cast_precision_loss)]
                    let phase = t + pass as f32 * 0.1;
                    for (i, pixel) in frame.iter_mut().enumerate() {
                        #[allow(clippy::cast_precision_loss)]
                        let (x, y) = ((i % *width) as f32, (i / *width) as f32);
                        *pixel = shade(x, y, phase);
                    }
                }
                black_box(frame.last().copied());
            }
        }
    }
}

/// Plasma shader packed as 0x00RRGGBB.
fn shade(x: f32, y: f32, t: f32) -> u32 {
    let v = (x * 0.05 + t).sin() + (y * 0.05 - t).cos() + ((x + y) * 0.03 + t).sin();
    let n = (v / 3.0).mul_add(0.5, 0.5).clamp(0.0, 1.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let channel = |scale: f32| ((n * scale).fract() * 255.0) as u32;
    (channel(1.0) << 16) | (channel(2.0) << 8) | channel(3.0)
}
