//! Process-wide observer of greenlet transfers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use greenstack::{install_trace, Event, Transition};
//!
//! install_trace(Some(Arc::new(|t: &Transition<'_>| -> greenstack::Result<()> {
//!     if t.event == Event::Throw {
//!         eprintln!("{} threw into {}", t.origin.id(), t.target.id());
//!     }
//!     Ok(())
//! })));
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::greenlet::Greenlet;

/// What is being delivered by a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A value
    Switch,
    /// An error
    Throw,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Switch => "switch",
            Event::Throw => "throw",
        }
    }
}

/// A transfer about to happen.
#[derive(Debug, Clone, Copy)]
pub struct Transition<'a> {
    pub event: Event,
    pub origin: &'a Greenlet,
    pub target: &'a Greenlet,
}

/// The observer. Called on the switching thread right before control moves
/// from `origin` to `target`. Returning an error (or panicking) cancels that
/// transfer and uninstalls the observer.
pub type TraceFn = Arc<dyn Fn(&Transition<'_>) -> Result<()> + Send + Sync>;

static TRACE: RwLock<Option<TraceFn>> = RwLock::new(None);

/// Installs `trace` (or removes the observer with `None`), returning the
/// previous one.
pub fn install_trace(trace: Option<TraceFn>) -> Option<TraceFn> {
    let mut slot = TRACE.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *slot, trace)
}

pub fn current_trace() -> Option<TraceFn> {
    TRACE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Reports a transfer to the observer, if one is installed.
pub(crate) fn emit(event: Event, origin: &Greenlet, target: &Greenlet) -> Result<()> {
    let Some(trace) = current_trace() else {
        return Ok(());
    };
    let transition = Transition {
        event,
        origin,
        target,
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| trace(&transition)))
        .unwrap_or_else(|payload| Err(Error::from_panic(payload)));

    if let Err(err) = outcome {
        let mut slot = TRACE.write().unwrap_or_else(PoisonError::into_inner);
        // Leave a hook installed meanwhile alone
        if slot.as_ref().is_some_and(|hook| Arc::ptr_eq(hook, &trace)) {
            *slot = None;
        }
        drop(slot);
        tracing::warn!(
            event = event.as_str(),
            origin = %origin.id(),
            target = %target.id(),
            error = %err,
            "trace function failed, uninstalling it"
        );
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_returns_the_previous_observer() {
        let first: TraceFn = Arc::new(|_: &Transition<'_>| -> Result<()> { Ok(()) });
        let before = install_trace(Some(Arc::clone(&first)));
        let current = current_trace().unwrap();
        assert!(Arc::ptr_eq(&current, &first));

        let replaced = install_trace(before).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
    }

    #[test]
    fn event_names() {
        assert_eq!(Event::Switch.as_str(), "switch");
        assert_eq!(Event::Throw.as_str(), "throw");
    }
}
