//! Error types shared by every greenlet operation.

use std::any::Any;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The distinguished exit signal.
///
/// Thrown by [`Greenlet::kill`](crate::Greenlet::kill) and by the runtime when
/// the last handle of a suspended greenlet goes away. A payload that lets it
/// propagate dies quietly: its parent receives a `GreenletExit` *value*
/// instead of an error. The same value is returned when switching into a
/// greenlet that is already dead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("greenlet exit")]
pub struct GreenletExit;

/// Everything that can go wrong while creating, switching or throwing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The target is owned by another OS thread.
    #[error("cannot switch to a different thread")]
    WrongThread,

    /// The target's parent chain was cleared by the collector and no longer
    /// leads to a started greenlet.
    #[error("cannot switch to a garbage collected greenlet")]
    Collected,

    #[error("cyclic parent chain")]
    CyclicParent,

    #[error("parent must not be garbage collected")]
    ParentCollected,

    #[error("parent cannot be on a different thread")]
    ParentThread,

    #[error("run cannot be set after the start of the greenlet")]
    AlreadyStarted,

    /// The greenlet was switched into without ever being given a payload.
    #[error("greenlet has no run target")]
    MissingRun,

    /// The machine stack could not be mapped. The target keeps its phase.
    #[error("failed to allocate a {size}-byte greenlet stack")]
    StackExhausted { size: usize },

    /// The calling thread's registry is being torn down.
    #[error("greenlet registry of this thread is shutting down")]
    ThreadExiting,

    #[error(transparent)]
    Exit(#[from] GreenletExit),

    /// A payload (or trace observer) panicked; the panic message is kept.
    #[error("greenlet panicked: {0}")]
    Panicked(String),

    /// An error raised by user code.
    #[error(transparent)]
    Raised(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a user error so it can be thrown into or returned from a
    /// greenlet.
    pub fn raise<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Raised(Box::new(error))
    }

    /// Returns true for the exit signal.
    pub fn is_exit(&self) -> bool {
        matches!(self, Error::Exit(_))
    }

    /// Returns the user error if this is [`Error::Raised`] and it has type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Error::Raised(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Converts a caught panic payload into an error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn raised_errors_downcast_to_their_type() {
        let err = Error::raise(Boom);
        assert!(err.downcast_ref::<Boom>().is_some());
        assert!(!err.is_exit());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn exit_converts_with_from() {
        let err: Error = GreenletExit.into();
        assert!(err.is_exit());
        assert!(err.downcast_ref::<Boom>().is_none());
    }

    #[test]
    fn panic_payloads_keep_their_message() {
        let caught = std::panic::catch_unwind(|| {
            if true {
                panic!("lost {}", 42);
            }
        })
        .unwrap_err();
        match Error::from_panic(caught) {
            Error::Panicked(msg) => assert_eq!(msg, "lost 42"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
