//! Service lifecycle state machine.
//!
//! Services move through `CREATED → INITIALIZED → STARTED` and back down;
//! every transition validates the current state and fails with
//! `StatusError` on violation, leaving the state unchanged.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// Lifecycle phase of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServiceStatus {
    /// Constructed, resources not yet acquired
    Created = 0,
    /// Resources acquired, not serving
    Initialized = 1,
    /// Serving
    Started = 2,
}

impl ServiceStatus {
    fn from_u8(v: u8) -> ServiceStatus {
        match v {
            1 => ServiceStatus::Initialized,
            2 => ServiceStatus::Started,
            _ => ServiceStatus::Created,
        }
    }
}

/// Atomic holder of a service's lifecycle phase.
#[derive(Debug)]
pub struct ServiceState {
    status: AtomicU8,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceState {
    /// Fresh state in `Created`.
    pub fn new() -> Self {
        ServiceState {
            status: AtomicU8::new(ServiceStatus::Created as u8),
        }
    }

    /// Current phase.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Fail unless the service is in `expected`.
    pub fn ensure(&self, expected: ServiceStatus) -> Result<()> {
        let current = self.status();
        if current != expected {
            error!(?current, ?expected, "service status error");
            return Err(Error::StatusError { current, expected });
        }
        Ok(())
    }

    /// Move `from → to`; fails with `StatusError` when not in `from`.
    pub fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> Result<()> {
        self.status
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|actual| {
                let current = ServiceStatus::from_u8(actual);
                error!(?current, expected = ?from, "service status error");
                Error::StatusError {
                    current,
                    expected: from,
                }
            })
    }
}
