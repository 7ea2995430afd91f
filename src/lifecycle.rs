//! Reclaiming greenlets nobody can switch into anymore.
//!
//! A suspended greenlet still has frames on its stack, so dropping its last
//! handle cannot simply free it: it is queued on its owning thread and killed
//! there at the next checkpoint. Greenlets of a thread that has exited are
//! abandoned instead; no thread ever resumes another thread's stack.

use std::sync::Arc;

use crate::greenlet::{Core, Greenlet, Handle, Phase, RunSlot, lock};
use crate::registry;

impl Drop for Handle {
    fn drop(&mut self) {
        let core = &self.core;
        if core.is_main() {
            return;
        }
        let (record, refused) = {
            let meta = core.meta();
            if meta.phase != Phase::Suspended {
                return;
            }
            match &meta.thread {
                Some(record) => (Arc::clone(record), meta.refused_exit),
                None => return,
            }
        };

        let mut doomed = lock(&record.doomed);
        if !record.is_alive() {
            drop(doomed);
            abandon(core);
        } else if refused {
            drop(doomed);
            lock(&record.leaked).push(Arc::clone(core));
        } else {
            doomed.push(Arc::clone(core));
            tracing::trace!(greenlet = %core.id, "greenlet queued for kill");
        }
    }
}

/// Kills a queued greenlet on its owning thread.
///
/// The victim's parent is temporarily the current greenlet, so the kill
/// returns here once the victim is dead.
pub(crate) fn reap(core: Arc<Core>) {
    if core.handle_count() > 0 || core.phase() != Phase::Suspended {
        // Resurrected through a weak handle, or already gone
        return;
    }
    let victim = Greenlet::from_core(core);
    let killer = match registry::current() {
        Ok(killer) => killer,
        Err(_) => {
            abandon(victim.core());
            return;
        }
    };

    let previous = victim.core().meta().parent.replace(killer.clone());
    tracing::debug!(greenlet = %victim.id(), killer = %killer.id(), "killing greenlet");
    let result = victim.kill();

    // Restore the parent; one cut by the collector stays the killer
    if let Some(previous) = previous {
        let killer_parent = victim.core().meta().parent.replace(previous);
        drop(killer_parent);
    }
    if let Err(err) = result {
        tracing::warn!(greenlet = %victim.id(), error = %err, "error while killing greenlet");
    }

    if !victim.is_dead() && victim.handle_count() == 1 {
        tracing::warn!(
            greenlet = %victim.id(),
            "greenlet did not exit when killed; leaking it"
        );
        victim.core().meta().refused_exit = true;
    }
}

/// Marks `core` dead without resuming it and releases what it owns.
///
/// Values still living on its stack are leaked.
pub(crate) fn abandon(core: &Core) {
    let (stack, pending, launch, run, parent, attrs) = {
        let mut meta = core.meta();
        if meta.phase == Phase::Dead {
            return;
        }
        meta.phase = Phase::Dead;
        (
            meta.stack.take(),
            meta.pending.take(),
            meta.launch.take(),
            std::mem::replace(&mut meta.run, RunSlot::Empty),
            meta.parent.take(),
            std::mem::take(&mut meta.attrs),
        )
    };
    tracing::debug!(greenlet = %core.id, "abandoning greenlet");
    drop((stack, pending, launch, run, parent, attrs));
}
