//! Revert stack for multi-step storage operations.
//!
//! Every mutating backend operation pushes the inverse of each completed step
//! onto a [`Reverter`]. If the operation returns early, the guard unwinds the
//! stack in reverse order; [`Reverter::success`] disarms it at the end of the
//! happy path. Inverse actions that themselves fail are logged at warn and
//! never mask the original error.

use apollo_common::StorageResult;

type RevertFn<'a> = Box<dyn FnOnce() -> StorageResult<()> + 'a>;

/// Scope guard running registered inverse actions unless disarmed.
#[derive(Default)]
pub struct Reverter<'a> {
    actions: Vec<(&'static str, RevertFn<'a>)>,
    disarmed: bool,
}

impl<'a> Reverter<'a> {
    /// Create an armed, empty reverter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inverse of a step that just succeeded.
    ///
    /// `label` names the step in warn logs when the inverse itself fails.
    pub fn push<F>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> StorageResult<()> + 'a,
    {
        self.actions.push((label, Box::new(action)));
    }

    /// Disarm the guard: the operation completed, nothing is unwound.
    pub fn success(mut self) {
        self.disarmed = true;
    }
}

impl Drop for Reverter<'_> {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        for (label, action) in self.actions.drain(..).rev() {
            if let Err(err) = action() {
                tracing::warn!(step = label, error = %err, "Revert action failed");
            } else {
                tracing::debug!(step = label, "Reverted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn unwinds_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        {
            let mut revert = Reverter::new();
            revert.push("first", || {
                log.borrow_mut().push(1);
                Ok(())
            });
            revert.push("second", || {
                log.borrow_mut().push(2);
                Ok(())
            });
        }
        assert_eq!(*log.borrow(), vec![2, 1]);
    }

    #[test]
    fn success_disarms() {
        let log = RefCell::new(Vec::new());
        {
            let mut revert = Reverter::new();
            revert.push("step", || {
                log.borrow_mut().push(1);
                Ok(())
            });
            revert.success();
        }
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn failing_inverse_does_not_stop_unwind() {
        let log = RefCell::new(Vec::new());
        {
            let mut revert = Reverter::new();
            revert.push("first", || {
                log.borrow_mut().push(1);
                Ok(())
            });
            revert.push("second", || {
                Err(apollo_common::StorageError::config("boom"))
            });
        }
        assert_eq!(*log.borrow(), vec![1]);
    }
}
