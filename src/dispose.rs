//! Ordered cleanup of resources.
//!
//! A [`DisposableStack`] collects cleanup actions and runs them in reverse
//! registration order exactly once. Failures are recorded and do not stop
//! the remaining actions.
//!
//! # Example
//!
//! ```ignore
//! use cdp_wire::DisposableStack;
//!
//! let stack = DisposableStack::new();
//! stack.defer(|| { println!("runs second"); Ok(()) });
//! stack.defer(|| { println!("runs first"); Ok(()) });
//!
//! let errors = stack.dispose();
//! assert!(errors.is_empty());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Cleanup action.
pub type DisposeAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// Guarded state of a stack.
#[derive(Default)]
struct StackState {
    disposed: bool,
    actions: Vec<DisposeAction>,
}

// ============================================================================
// DisposableStack
// ============================================================================

/// LIFO collection of cleanup actions that runs once.
///
/// Methods take `&self` so a stack can be shared behind an `Arc` and
/// disposed from whichever task observes the end of the resource's life.
#[derive(Default)]
pub struct DisposableStack {
    state: Mutex<StackState>,
}

impl fmt::Debug for DisposableStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DisposableStack")
            .field("disposed", &state.disposed)
            .field("pending", &state.actions.len())
            .finish()
    }
}

impl DisposableStack {
    /// Creates an empty stack.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup action.
    ///
    /// If the stack is already disposed the action runs immediately and its
    /// error, if any, is logged.
    pub fn defer<F>(&self, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if !state.disposed {
                state.actions.push(Box::new(action));
                return;
            }
        }

        if let Err(e) = run_action(Box::new(action)) {
            warn!(error = %e, "Cleanup action deferred after dispose failed");
        }
    }

    /// Runs every registered action in reverse order.
    ///
    /// The disposed flag flips before any action runs, so a re-entrant or
    /// repeated call returns an empty list.
    pub fn dispose(&self) -> Vec<Error> {
        let actions = {
            let mut state = self.state.lock();
            if state.disposed {
                return Vec::new();
            }
            state.disposed = true;
            std::mem::take(&mut state.actions)
        };

        let count = actions.len();
        let mut errors = Vec::new();

        for action in actions.into_iter().rev() {
            if let Err(e) = run_action(action) {
                warn!(error = %e, "Cleanup action failed");
                errors.push(e);
            }
        }

        debug!(count, failed = errors.len(), "Disposed stack");
        errors
    }

    /// Returns `true` once [`dispose`](Self::dispose) has started.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Returns the number of actions still registered.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().actions.len()
    }

    /// Returns `true` if no actions are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DisposableStack {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Runs one action, converting a panic into an error.
fn run_action(action: DisposeAction) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(result) => result,
        Err(payload) => Err(Error::dispose(panic_message(payload.as_ref()))),
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn test_runs_in_reverse_order_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let stack = DisposableStack::new();

        for i in 1..=3 {
            let order = Arc::clone(&order);
            stack.defer(move || {
                order.lock().push(i);
                Ok(())
            });
        }

        assert_eq!(stack.len(), 3);
        assert!(stack.dispose().is_empty());
        assert!(stack.dispose().is_empty());
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert!(stack.is_disposed());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_failures_do_not_stop_remaining_actions() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let stack = DisposableStack::new();

        let r = Arc::clone(&ran);
        stack.defer(move || {
            r.lock().push("first");
            Ok(())
        });
        stack.defer(|| Err(Error::dispose("boom")));
        stack.defer(|| panic!("listener exploded"));

        let errors = stack.dispose();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("listener exploded"));
        assert!(errors[1].to_string().contains("boom"));
        assert_eq!(*ran.lock(), vec!["first"]);
    }

    #[test]
    fn test_defer_after_dispose_runs_immediately() {
        let stack = DisposableStack::new();
        stack.dispose();

        let ran = Arc::new(Mutex::new(false));
        let r = Arc::clone(&ran);
        stack.defer(move || {
            *r.lock() = true;
            Ok(())
        });

        assert!(*ran.lock());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_reentrant_dispose_is_noop() {
        let stack = Arc::new(DisposableStack::new());
        let inner = Arc::downgrade(&stack);
        let nested = Arc::new(Mutex::new(None));

        let n = Arc::clone(&nested);
        stack.defer(move || {
            if let Some(stack) = inner.upgrade() {
                *n.lock() = Some(stack.dispose().len());
            }
            Ok(())
        });

        assert!(stack.dispose().is_empty());
        assert_eq!(*nested.lock(), Some(0));
    }

    #[test]
    fn test_drop_disposes() {
        let ran = Arc::new(Mutex::new(false));
        {
            let stack = DisposableStack::new();
            let r = Arc::clone(&ran);
            stack.defer(move || {
                *r.lock() = true;
                Ok(())
            });
        }
        assert!(*ran.lock());
    }
}
