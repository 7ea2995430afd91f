//! The switch/throw protocol.
//!
//! Every transfer moves exactly one delivery, a value or an error, into the
//! pending slot of the target and then swaps stacks. A greenlet starts in
//! [`bootstrap`] on its fresh stack and, once its payload is done, never
//! returns: [`finish`] hands the outcome to the nearest live ancestor and
//! leaves the dead stack behind for the receiver to unmap.

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::arch::{self, Registers};
use crate::error::{Error, Result};
use crate::greenlet::{Core, Greenlet, Payload, Phase, RunSlot, Start};
use crate::registry::{self, ThreadRecord};
use crate::stack::Stack;
use crate::trace::{self, Event};
use crate::value::Value;

fn event_of(delivery: &Result<Value>) -> Event {
    match delivery {
        Ok(_) => Event::Switch,
        Err(_) => Event::Throw,
    }
}

/// Delivers `delivery` to `target` and runs it until control comes back.
pub(crate) fn switch_to(target: &Greenlet, delivery: Result<Value>) -> Result<Value> {
    registry::checkpoint()?;
    loop {
        if target.is_current() {
            return delivery;
        }
        let record = registry::record()?;
        if !Arc::ptr_eq(&target.core().owner()?, &record) {
            return Err(Error::WrongThread);
        }
        match target.phase() {
            Phase::Dead => return short_circuit(delivery),
            // Running on another thread
            Phase::Active => return Err(Error::WrongThread),
            Phase::NotStarted => {
                // The payload binder may have started it already
                let Some(primed) = prime(target)? else {
                    continue;
                };
                if let Err(err) = announce(event_of(&delivery), target) {
                    primed.unwind(target);
                    return Err(err);
                }
                if target.phase() != Phase::NotStarted {
                    primed.unwind(target);
                    continue;
                }
                primed.install(target, record);
                return park(target.clone(), delivery);
            }
            Phase::Suspended => {
                announce(event_of(&delivery), target)?;
                // The observer may have switched around
                if target.phase() != Phase::Suspended {
                    continue;
                }
                return park(target.clone(), delivery);
            }
        }
    }
}

/// Delivery to a dead greenlet: nothing runs, and only non-exit errors
/// come back as errors.
fn short_circuit(delivery: Result<Value>) -> Result<Value> {
    match delivery {
        Ok(_) => Ok(Value::exit()),
        Err(err) if err.is_exit() => Ok(Value::exit()),
        Err(err) => Err(err),
    }
}

fn announce(event: Event, target: &Greenlet) -> Result<()> {
    let origin = registry::current()?;
    trace::emit(event, &origin, target)
}

/// A payload and a stack ready to become a running greenlet.
struct Primed {
    run: Payload,
    stack: Stack,
}

impl Primed {
    /// Gives the payload back so the start can be retried.
    fn unwind(self, target: &Greenlet) {
        let Primed { run, stack } = self;
        drop(stack);
        restore(target.core(), run);
    }

    fn install(self, target: &Greenlet, record: Arc<ThreadRecord>) {
        let core = target.core();
        let registers = unsafe {
            Registers::new(self.stack.top(), bootstrap, Arc::as_ptr(core) as *mut c_void)
        };
        // Not started: no transfer can be reading these yet
        unsafe { *core.registers.get() = registers };
        let superseded = {
            let mut meta = core.meta();
            meta.stack = Some(self.stack);
            meta.launch = Some(self.run);
            meta.thread = Some(record);
            // Set by the binder or an observer; the primed payload wins
            std::mem::replace(&mut meta.run, RunSlot::Empty)
        };
        drop(superseded);
        registry::track(core);
        tracing::debug!(
            greenlet = %core.id,
            parent = ?core.parent().map(|p| p.id()),
            "greenlet started"
        );
    }
}

/// Resolves the payload of a greenlet that has not started and maps its
/// stack.
///
/// Returns `None` when the greenlet got started while its binder ran. On
/// failure the greenlet is left as it was, payload included.
fn prime(target: &Greenlet) -> Result<Option<Primed>> {
    let core = target.core();
    let slot = std::mem::replace(&mut core.meta().run, RunSlot::Empty);
    let run = match slot {
        RunSlot::Empty => return Err(Error::MissingRun),
        RunSlot::Ready(run) => run,
        RunSlot::Deferred(bind) => bind()?,
    };
    if target.is_started() {
        drop(run);
        return Ok(None);
    }

    let stack = registry::record().and_then(|record| {
        // Revalidate: the binder may have reparented it
        if !Arc::ptr_eq(&core.owner()?, &record) {
            return Err(Error::WrongThread);
        }
        Stack::allocate(core.stack_size, &record.stacks)
    });
    match stack {
        Ok(stack) => Ok(Some(Primed { run, stack })),
        Err(err) => {
            restore(core, run);
            Err(err)
        }
    }
}

/// Puts a resolved payload back into a greenlet whose start did not happen.
///
/// A greenlet started in the meantime keeps no payload.
fn restore(core: &Core, run: Payload) {
    let previous = {
        let mut meta = core.meta();
        if meta.phase == Phase::NotStarted {
            std::mem::replace(&mut meta.run, RunSlot::Ready(run))
        } else {
            RunSlot::Ready(run)
        }
    };
    drop(previous);
}

/// Suspends the current greenlet and resumes `target`.
fn park(target: Greenlet, delivery: Result<Value>) -> Result<Value> {
    let (from, to) = {
        let current = registry::current()?;
        tracing::trace!(
            event = event_of(&delivery).as_str(),
            origin = %current.id(),
            target = %target.id(),
            "transfer"
        );
        (
            current.core().registers.get(),
            target.core().registers.get() as *const Registers,
        )
    };
    let stale = target.core().meta().pending.replace(delivery);
    drop(stale);
    registry::swap_current(target)?;

    // No handle of the suspended greenlet may stay on its own stack
    unsafe { arch::transfer(from, to) };

    arrive()
}

/// First thing a resumed greenlet does.
fn arrive() -> Result<Value> {
    release_origin();
    let current = registry::current()?;
    let delivery = current.core().meta().pending.take();
    delivery.unwrap_or_else(|| Ok(Value::unit()))
}

/// Drops the registry's handle on the greenlet we came from, unmapping its
/// stack first if it just died.
fn release_origin() {
    let Some(origin) = registry::take_origin() else {
        return;
    };
    let stack = {
        let mut meta = origin.core().meta();
        if meta.phase == Phase::Dead {
            meta.stack.take()
        } else {
            None
        }
    };
    drop(stack);
    drop(origin);
}

/// Entry point of every greenlet stack.
///
/// The core pointer is passed via a callee-saved register.
unsafe extern "C" fn bootstrap(arg: *mut c_void) -> ! {
    let core = arg as *const Core;
    let outcome = run_payload(unsafe { &*core });
    unsafe { finish(core, outcome) }
}

fn run_payload(core: &Core) -> Result<Value> {
    release_origin();
    let (run, delivery) = {
        let mut meta = core.meta();
        let delivery = meta.pending.take().unwrap_or_else(|| Ok(Value::unit()));
        (meta.launch.take(), delivery)
    };
    let outcome = match (delivery, run) {
        // Thrown into before it ever ran
        (Err(err), _) => Err(err),
        (Ok(_), None) => Err(Error::MissingRun),
        (Ok(input), Some(run)) => catch_unwind(AssertUnwindSafe(move || run.start(input)))
            .unwrap_or_else(|payload| Err(Error::from_panic(payload))),
    };
    match outcome {
        Err(err) if err.is_exit() => Ok(Value::exit()),
        other => other,
    }
}

/// Marks the running greenlet dead and hands `outcome` to its nearest live
/// ancestor. Never returns.
///
/// # Safety
///
/// `core` must be the current greenlet, running on its own stack.
unsafe fn finish(core: *const Core, outcome: Result<Value>) -> ! {
    let from = unsafe { (*core).registers.get() };
    if let Some(to) = hand_off(unsafe { &*core }, outcome) {
        unsafe { arch::transfer(from, to) };
    }
    // Dead stacks are never resumed
    std::process::abort()
}

fn hand_off(core: &Core, mut outcome: Result<Value>) -> Option<*const Registers> {
    let me = registry::current().ok()?;
    let record = registry::record().ok()?;
    let mut next = {
        let mut meta = core.meta();
        meta.phase = Phase::Dead;
        meta.parent.clone()
    };
    match &outcome {
        Ok(_) => tracing::debug!(greenlet = %core.id, "greenlet finished"),
        Err(err) => tracing::debug!(greenlet = %core.id, error = %err, "greenlet failed"),
    }

    while let Some(parent) = next.take() {
        let owned = parent
            .core()
            .owner()
            .is_ok_and(|owner| Arc::ptr_eq(&owner, &record));
        match parent.phase() {
            Phase::Dead => {
                next = parent.parent();
                continue;
            }
            Phase::Active => {
                outcome = Err(Error::WrongThread);
                next = parent.parent();
                continue;
            }
            _ if !owned => {
                outcome = Err(Error::WrongThread);
                next = parent.parent();
                continue;
            }
            Phase::NotStarted => match prime(&parent) {
                Ok(None) => {
                    next = Some(parent);
                    continue;
                }
                Ok(Some(primed)) => {
                    if let Err(err) = trace::emit(event_of(&outcome), &me, &parent) {
                        primed.unwind(&parent);
                        outcome = Err(err);
                        next = Some(parent);
                        continue;
                    }
                    primed.install(&parent, Arc::clone(&record));
                }
                Err(err) => {
                    outcome = Err(err);
                    next = parent.parent();
                    continue;
                }
            },
            Phase::Suspended => {
                if let Err(err) = trace::emit(event_of(&outcome), &me, &parent) {
                    // The failed observer is gone; retry quietly
                    outcome = Err(err);
                    next = Some(parent);
                    continue;
                }
            }
        }

        tracing::trace!(
            event = event_of(&outcome).as_str(),
            origin = %core.id,
            target = %parent.id(),
            "transfer"
        );
        let to = parent.core().registers.get() as *const Registers;
        let stale = parent.core().meta().pending.replace(outcome);
        drop(stale);
        registry::swap_current(parent).ok()?;
        return Some(to);
    }

    tracing::error!(
        greenlet = %core.id,
        "greenlet finished with no live parent to receive its result"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GreenletExit;

    #[test]
    fn dead_targets_trade_exits_for_sentinels() {
        assert!(short_circuit(Ok(Value::new(1_u8))).unwrap().is_exit());
        assert!(short_circuit(Err(GreenletExit.into())).unwrap().is_exit());
        assert!(matches!(
            short_circuit(Err(Error::MissingRun)),
            Err(Error::MissingRun)
        ));
    }

    #[test]
    fn started_greenlet_returns_its_result_to_the_parent() {
        let child = Greenlet::new(|input| {
            let n = input.downcast::<i32>().unwrap_or_default();
            Ok(Value::new(n + 1))
        });
        let result = child.switch(5_i32).unwrap();
        assert_eq!(result.downcast::<i32>().unwrap(), 6);
        assert!(child.is_dead());
        assert!(child.core().meta().stack.is_none());
    }

    #[test]
    fn missing_run_leaves_the_greenlet_unstarted() {
        let child = Greenlet::builder().build().unwrap();
        assert!(matches!(child.switch(()), Err(Error::MissingRun)));
        assert_eq!(child.phase(), Phase::NotStarted);
    }
}
