//! Dynamically typed values carried across switches.

use std::any::{Any, type_name};
use std::fmt;

use crate::error::GreenletExit;

/// A value handed from one greenlet to another.
///
/// Switches move arbitrary data between stacks, so the payload is type
/// erased and recovered with [`Value::downcast`].
pub struct Value {
    inner: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl Value {
    /// Wraps `value`. Wrapping a `Value` returns it unchanged.
    pub fn new<T: Any + Send>(value: T) -> Self {
        let boxed: Box<dyn Any + Send> = Box::new(value);
        match boxed.downcast::<Value>() {
            Ok(value) => *value,
            Err(inner) => Value {
                inner,
                type_name: type_name::<T>(),
            },
        }
    }

    /// The empty value, delivered when a greenlet has nothing to say.
    pub fn unit() -> Self {
        Value::new(())
    }

    /// The sentinel returned by switching or killing into a dead greenlet.
    pub fn exit() -> Self {
        Value::new(GreenletExit)
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn is_unit(&self) -> bool {
        self.is::<()>()
    }

    pub fn is_exit(&self) -> bool {
        self.is::<GreenletExit>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Recovers the concrete value, or gives the `Value` back on a type mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Value> {
        let type_name = self.type_name;
        match self.inner.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(inner) => Err(Value { inner, type_name }),
        }
    }

    /// Name of the wrapped type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::unit()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}
