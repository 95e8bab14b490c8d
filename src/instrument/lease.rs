//! Exclusive driver ownership.
//!
//! A [`SharedDriver`] wraps one instrument driver behind an async mutex. Runs call
//! [`SharedDriver::acquire`] and hold the returned [`DriverGuard`] for their whole
//! duration; dropping the guard (on completion, failure, cancellation or timeout)
//! releases the driver to the next waiter. Ownership is tracked so status queries can
//! report the current holder without blocking.

use super::InstrumentDriver;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type BoxedDriver = Box<dyn InstrumentDriver>;

/// One instrument driver, leased to a single run at a time.
#[derive(Clone)]
pub struct SharedDriver {
    driver: Arc<Mutex<BoxedDriver>>,
    /// Run id of the lease holder
    owner: Arc<StdMutex<Option<String>>>,
}

impl SharedDriver {
    /// Wrap a driver for shared use.
    pub fn new<D: InstrumentDriver + 'static>(driver: D) -> Self {
        Self::from_boxed(Box::new(driver))
    }

    pub fn from_boxed(driver: BoxedDriver) -> Self {
        Self {
            driver: Arc::new(Mutex::new(driver)),
            owner: Arc::new(StdMutex::new(None)),
        }
    }

    /// Acquire exclusive access, waiting until the previous holder releases it.
    ///
    /// Waiters are served in FIFO order.
    pub async fn acquire(&self, owner: impl Into<String>) -> DriverGuard {
        let owner = owner.into();
        let guard = self.driver.clone().lock_owned().await;
        self.set_owner(Some(owner.clone()));
        debug!(owner = %owner, "Driver acquired");
        DriverGuard {
            guard,
            owner_slot: self.owner.clone(),
            owner,
        }
    }

    /// Acquire exclusive access only if the driver is free right now.
    pub fn try_acquire(&self, owner: impl Into<String>) -> Option<DriverGuard> {
        let guard = self.driver.clone().try_lock_owned().ok()?;
        let owner = owner.into();
        self.set_owner(Some(owner.clone()));
        Some(DriverGuard {
            guard,
            owner_slot: self.owner.clone(),
            owner,
        })
    }

    /// Current owner, if any. Never blocks on the driver itself.
    pub fn current_owner(&self) -> Option<String> {
        self.owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether no run holds the lease.
    pub fn is_available(&self) -> bool {
        self.current_owner().is_none()
    }

    fn set_owner(&self, owner: Option<String>) {
        *self
            .owner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = owner;
    }
}

/// Lease on the driver; dropping it hands the driver to the next waiter.
pub struct DriverGuard {
    guard: OwnedMutexGuard<BoxedDriver>,
    owner_slot: Arc<StdMutex<Option<String>>>,
    owner: String,
}

impl DriverGuard {
    /// Id of the run holding this guard.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Deref for DriverGuard {
    type Target = dyn InstrumentDriver;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for DriverGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        // Clear ownership before the mutex guard field is released.
        let mut slot = self
            .owner_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_deref() == Some(self.owner.as_str()) {
            *slot = None;
        }
        debug!(owner = %self.owner, "Driver released");
    }
}
