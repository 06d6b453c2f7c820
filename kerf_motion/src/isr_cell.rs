//! Critical-section wrapper for state shared with the pulse-tick context.
//!
//! On the target this is an interrupt-disable window; here it is a mutex
//! held for the few loads/stores of one access closure. The rules that make
//! that equivalence hold:
//!
//! - sections stay short: copy data in or out, no engine calls while held
//! - the pulse tick is the only writer of step positions; the cooperative
//!   side only reads them (and writes the homing axis lock)
//! - a consistent multi-axis snapshot always comes from one closure, never
//!   from two consecutive ones

use std::sync::Mutex;

/// Shared-state cell accessed only through short closures.
#[derive(Debug, Default)]
pub struct IsrCell<T> {
    inner: Mutex<T>,
}

impl<T> IsrCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` inside the critical section.
    ///
    /// A poisoned lock is recovered rather than propagated: the guarded data
    /// stays structurally valid because every access goes through this
    /// method and closures hold no partial updates across calls.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
