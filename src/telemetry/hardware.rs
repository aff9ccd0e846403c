// SPDX-License-Identifier: MIT
//! Process-wide sensor handle.
//!
//! The native sensor interface is a single per-process resource. It is opened
//! on first use, shared by every source that needs it, and released by an
//! explicit [`shutdown`].

use std::sync::{Arc, Mutex};

use super::nvidia_smi;
use crate::error::{Error, Result};

static HANDLE: Mutex<Option<Arc<SensorHandle>>> = Mutex::new(None);

#[derive(Debug)]
pub struct SensorHandle {
    device_index: u32,
    device_name: String,
    driver_version: String,
}

impl SensorHandle {
    #[must_use]
    pub fn new(device_index: u32, device_name: String, driver_version: String) -> Self {
        Self {
            device_index,
            device_name,
            driver_version,
        }
    }

    /// Probes the device through `nvidia-smi`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if the tool is missing or the
    /// device index does not exist.
    pub fn open(device_index: u32) -> Result<Self> {
        let id_arg = format!("--id={device_index}");
        let stdout = nvidia_smi::query(&[
            id_arg.as_str(),
            "--query-gpu=name,driver_version",
            "--format=csv,noheader",
        ])?;
        let line = stdout.lines().next().unwrap_or_default();
        let (name, driver) = line.split_once(',').ok_or_else(|| {
            Error::HardwareUnavailable(format!("unexpected device row: {line:?}"))
        })?;
        Ok(Self::new(
            device_index,
            name.trim().to_string(),
            driver.trim().to_string(),
        ))
    }

    #[must_use]
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub fn driver_version(&self) -> &str {
        &self.driver_version
    }
}

/// Returns the shared handle for `device_index`, opening it on first use.
///
/// # Errors
///
/// Returns [`Error::HardwareUnavailable`] if the device cannot be opened or a
/// different device is already held by this process.
pub fn acquire(device_index: u32) -> Result<Arc<SensorHandle>> {
    acquire_with(device_index, SensorHandle::open)
}

/// Same as [`acquire`] with a caller-supplied opener.
///
/// # Errors
///
/// See [`acquire`].
pub fn acquire_with(
    device_index: u32,
    open: impl FnOnce(u32) -> Result<SensorHandle>,
) -> Result<Arc<SensorHandle>> {
    let mut guard = HANDLE
        .lock()
        .map_err(|_| Error::HardwareUnavailable("sensor handle lock poisoned".into()))?;

    if let Some(handle) = guard.as_ref() {
        if handle.device_index == device_index {
            return Ok(Arc::clone(handle));
        }
        return Err(Error::HardwareUnavailable(format!(
            "sensor already open for device {} (requested {device_index})",
            handle.device_index
        )));
    }

    let handle = Arc::new(open(device_index)?);
    log::info!(
        "opened sensor for device {}: {} (driver {})",
        handle.device_index,
        handle.device_name,
        handle.driver_version
    );
    *guard = Some(Arc::clone(&handle));
    Ok(handle)
}

/// Releases the shared handle. Sources still holding an `Arc` keep it alive
/// until they drop; the next [`acquire`] opens the device again.
pub fn shutdown() {
    let released = HANDLE.lock().ok().and_then(|mut guard| guard.take());
    if let Some(handle) = released {
        log::info!("released sensor for device {}", handle.device_index);
    }
}
