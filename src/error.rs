// SPDX-License-Identifier: MIT
use std::time::Duration;

use thiserror::Error;

use crate::sync::state::Phase;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The sensor backend could not produce a reading.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("workload iteration {iteration} did not complete within {timeout:?}")]
    WorkloadTimeout { iteration: u64, timeout: Duration },

    #[error("workload aborted: {0}")]
    WorkloadAbort(String),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("illegal session transition: {trigger} while {from}")]
    IllegalTransition { from: Phase, trigger: &'static str },

    #[error("failed to spawn {name} thread")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::ConfigurationInvalid(msg.into())
    }
}
