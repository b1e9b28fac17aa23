//! Deferred/promise pairs
//!
//! The native side keeps the [`Deferred`] and settles it when an
//! asynchronous engine operation completes; the host keeps the [`Promise`].
//! Dropping an unsettled deferred abandons the promise.

use super::HostException;
use std::cell::RefCell;
use std::rc::Rc;

/// Observable state of a promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Resolved(i64),
    Rejected(HostException),
    /// The owner was destroyed before settling
    Abandoned,
}

/// Settling side of a promise.
#[derive(Debug)]
pub struct Deferred {
    state: Rc<RefCell<PromiseState>>,
    settled: bool,
}

/// Observing side of a promise.
#[derive(Debug, Clone)]
pub struct Promise {
    state: Rc<RefCell<PromiseState>>,
}

/// Create a pending promise and its deferred.
pub fn promise() -> (Deferred, Promise) {
    let state = Rc::new(RefCell::new(PromiseState::Pending));
    (
        Deferred {
            state: Rc::clone(&state),
            settled: false,
        },
        Promise { state },
    )
}

impl Deferred {
    pub fn resolve(mut self, value: i64) {
        *self.state.borrow_mut() = PromiseState::Resolved(value);
        self.settled = true;
    }

    pub fn reject(mut self, exception: HostException) {
        *self.state.borrow_mut() = PromiseState::Rejected(exception);
        self.settled = true;
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        if !self.settled {
            *self.state.borrow_mut() = PromiseState::Abandoned;
        }
    }
}

impl Promise {
    pub fn state(&self) -> PromiseState {
        self.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), PromiseState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let (deferred, promise) = promise();
        assert!(promise.is_pending());
        deferred.resolve(7);
        assert_eq!(promise.state(), PromiseState::Resolved(7));
    }

    #[test]
    fn test_drop_abandons() {
        let (deferred, promise) = promise();
        drop(deferred);
        assert_eq!(promise.state(), PromiseState::Abandoned);
    }
}
