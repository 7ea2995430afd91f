#![allow(dead_code)]

use std::any::Any;
use std::sync::{Arc, Mutex};

use greenstack::{Error, Greenlet, Result, Value};
use tracing_subscriber::EnvFilter;

/// Routes crate logs to the test output, filtered by `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, thiserror::Error)]
#[error("some error")]
pub struct SomeError;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Message(pub String);

/// Switches from the current greenlet to its parent.
pub fn to_parent<T: Any + Send>(value: T) -> Result<Value> {
    let parent = Greenlet::current().parent().ok_or(Error::Collected)?;
    parent.switch(value)
}

pub fn int(value: Value) -> i32 {
    match value.downcast::<i32>() {
        Ok(n) => n,
        Err(other) => panic!("expected an i32, got {other:?}"),
    }
}

pub fn text(value: Value) -> &'static str {
    match value.downcast::<&'static str>() {
        Ok(s) => s,
        Err(other) => panic!("expected a &str, got {other:?}"),
    }
}

/// Shared append-only record, cloned into payloads.
#[derive(Debug)]
pub struct Log<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Log<T> {
    fn clone(&self) -> Self {
        Log(Arc::clone(&self.0))
    }
}

impl<T: Clone> Log<T> {
    pub fn new() -> Self {
        Log(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, entry: T) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Payload that waits in its parent and records the error it is resumed
/// with, re-raising it. Resumed with a value, it fails with `SomeError`.
pub fn fmain(seen: Log<String>) -> impl FnOnce(Value) -> Result<Value> + Send + 'static {
    move |_| match to_parent(()) {
        Ok(_) => Err(Error::raise(SomeError)),
        Err(err) => {
            seen.push(describe(&err));
            Err(err)
        }
    }
}

pub fn describe(err: &Error) -> String {
    if err.is_exit() {
        "exit".to_string()
    } else if err.downcast_ref::<SomeError>().is_some() {
        "some error".to_string()
    } else {
        err.to_string()
    }
}
