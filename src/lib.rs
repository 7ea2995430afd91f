//! Stack-switching greenlets.
//!
//! A greenlet is an independent call stack inside one OS thread. It runs
//! only when some other greenlet explicitly switches into it, and it keeps
//! running until it switches somewhere else, so there is no scheduler and no
//! preemption. Every thread has an implicit main greenlet; every other
//! greenlet has a parent that receives control, with the result, when it
//! finishes.
//!
//! # Example
//!
//! ```no_run
//! use greenstack::{Greenlet, Value};
//!
//! let main = Greenlet::current();
//! let child = Greenlet::new(move |first: Value| {
//!     let n = first.downcast::<i32>().unwrap_or(0);
//!     // Suspend here until main switches back in
//!     let again = main.switch(n * 2)?;
//!     Ok(again)
//! });
//!
//! let doubled = child.switch(21_i32)?;
//! assert_eq!(doubled.downcast_ref::<i32>(), Some(&42));
//! // Resuming hands the value to the pending switch; returning ends the child
//! let last = child.switch("bye")?;
//! assert_eq!(last.downcast_ref::<&str>(), Some(&"bye"));
//! assert!(child.is_dead());
//! # Ok::<(), greenstack::Error>(())
//! ```
//!
//! # Modules
//!
//! - `arch`: register save/restore for x86_64 and aarch64
//! - `stack`: guarded stack mappings
//! - `greenlet`: handles, phases and the parent tree
//! - `registry`: per-thread current/main greenlet
//! - `switch`: the switch/throw protocol
//! - `lifecycle`, `gc`: reclaiming suspended and cyclic greenlets
//! - `trace`: process-wide transfer observer

mod arch;
mod config;
mod error;
mod gc;
mod greenlet;
mod lifecycle;
mod registry;
mod stack;
mod switch;
mod trace;
mod value;

pub use config::{Config, DEFAULT_STACK_SIZE, MIN_STACK_SIZE, STACK_SIZE_ENV};
pub use error::{Error, GreenletExit, Result};
pub use gc::{Attribute, Traverse, Visitor, collect};
pub use greenlet::{Builder, Greenlet, GreenletId, Phase, WeakGreenlet};
pub use registry::stack_count;
pub use trace::{Event, TraceFn, Transition, current_trace, install_trace};
pub use value::Value;

/// The process-wide configuration, read from the environment on first use.
pub fn config() -> &'static Config {
    config::global()
}
