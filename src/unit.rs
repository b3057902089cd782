//! Unit number allocation.
//!
//! Every open session talks to the controller under a unit number between 1
//! and 255 that no other session in the process uses at the same time.

use std::sync::{Mutex, PoisonError};

use crate::error::{NcError, Result};

/// Lowest valid unit number.
pub const MIN_UNIT: u8 = 1;

/// Highest valid unit number.
pub const MAX_UNIT: u8 = 255;

static GLOBAL_POOL: UnitPool = UnitPool::new();

/// Set of unit numbers in use.
#[derive(Debug)]
pub(crate) struct UnitPool {
    used: Mutex<[bool; 256]>,
}

impl UnitPool {
    pub(crate) const fn new() -> Self {
        Self {
            used: Mutex::new([false; 256]),
        }
    }

    /// The pool shared by all sessions of the process.
    pub(crate) fn global() -> &'static UnitPool {
        &GLOBAL_POOL
    }

    /// Reserves `requested`, or the lowest free number when `None`.
    ///
    /// # Errors
    ///
    /// `NcError::InvalidParameter` if the requested unit is 0 or taken, or
    /// every unit is in use.
    pub(crate) fn acquire(&self, requested: Option<u8>) -> Result<UnitGuard<'_>> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let unit = match requested {
            Some(0) => {
                return Err(NcError::invalid_parameter(
                    "unit",
                    format!("must be between {} and {}", MIN_UNIT, MAX_UNIT),
                ))
            }
            Some(unit) if used[usize::from(unit)] => {
                return Err(NcError::invalid_parameter(
                    "unit",
                    format!("unit {} is already in use", unit),
                ))
            }
            Some(unit) => unit,
            None => (MIN_UNIT..=MAX_UNIT)
                .find(|u| !used[usize::from(*u)])
                .ok_or_else(|| NcError::invalid_parameter("unit", "all unit numbers are in use"))?,
        };
        used[usize::from(unit)] = true;
        Ok(UnitGuard { pool: self, unit })
    }

    fn release(&self, unit: u8) {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used[usize::from(unit)] = false;
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        let used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used.iter().filter(|u| **u).count()
    }
}

/// Reservation of one unit number, released on drop.
#[derive(Debug)]
pub(crate) struct UnitGuard<'a> {
    pool: &'a UnitPool,
    unit: u8,
}

impl UnitGuard<'_> {
    pub(crate) fn unit(&self) -> u8 {
        self.unit
    }
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        self.pool.release(self.unit);
    }
}
