//! Architecture-specific stack transfer.
//!
//! Each backend exposes the same three items:
//! - `Registers`: the callee-saved machine state of a suspended stack
//! - `Registers::new`: a register block that enters a fresh stack through the trampoline
//! - `transfer`: save the running stack into one block and resume another

use std::ffi::c_void;

/// Function a fresh stack starts in. It receives the argument given to
/// `Registers::new` and must never return.
pub(crate) type Entry = unsafe extern "C" fn(*mut c_void) -> !;

#[cfg(all(target_arch = "x86_64", not(windows)))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(windows)))]
pub(crate) use x86_64::*;

#[cfg(all(target_arch = "aarch64", not(windows)))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", not(windows)))]
pub(crate) use aarch64::*;

#[cfg(not(any(
    all(target_arch = "x86_64", not(windows)),
    all(target_arch = "aarch64", not(windows))
)))]
compile_error!("greenstack supports x86_64 and aarch64 on unix-like targets only");
