//! Connection admission with a hard cap
//!
//! Bounds total concurrent connections. Exhausted means refuse, never
//! queue; a socket refused here is closed before any stage work happens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::{EngineError, Result};

/// Bounded admission counter shared by the accept loop
#[derive(Clone)]
pub struct ConnectionAdmission {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    limit: usize,
}

impl ConnectionAdmission {
    /// Create an admission counter; a limit of 0 refuses every connection
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Try to admit a connection
    ///
    /// Fails with [`EngineError::AdmissionRejected`] when the cap is
    /// reached; the caller closes the socket immediately.
    ///
    /// # Errors
    ///
    /// Returns error when no connection slot is free
    pub fn try_admit(&self) -> Result<AdmissionPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.active.fetch_add(1, Ordering::Relaxed);
                Ok(AdmissionPermit {
                    _permit: permit,
                    active: Arc::clone(&self.active),
                })
            }
            Err(_) => Err(EngineError::AdmissionRejected {
                active: self.active(),
                limit: self.limit,
            }),
        }
    }

    /// Current number of admitted connections
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Configured connection cap
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl std::fmt::Debug for ConnectionAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAdmission")
            .field("active", &self.active())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Permit held for a connection's lifetime
///
/// Dropping the permit releases the slot exactly once, whichever path led
/// to the close.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_counts() {
        let admission = ConnectionAdmission::new(2);
        assert_eq!(admission.active(), 0);
        assert_eq!(admission.limit(), 2);

        let permit1 = admission.try_admit().unwrap();
        let _permit2 = admission.try_admit().unwrap();
        assert_eq!(admission.active(), 2);

        // cap reached: refuse, never queue
        let rejected = admission.try_admit().unwrap_err();
        assert!(matches!(
            rejected,
            EngineError::AdmissionRejected { active: 2, limit: 2 }
        ));

        drop(permit1);
        assert!(admission.try_admit().is_ok());
    }

    #[test]
    fn test_zero_limit_refuses_everything() {
        let admission = ConnectionAdmission::new(0);
        assert!(admission.try_admit().is_err());
        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn test_permit_releases_exactly_once() {
        let admission = ConnectionAdmission::new(1);
        for _ in 0..10 {
            let permit = admission.try_admit().expect("slot must be free again");
            drop(permit);
        }
        assert_eq!(admission.active(), 0);
    }
}
