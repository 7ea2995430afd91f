//! Per-thread greenlet registry.
//!
//! Every OS thread that touches greenlets gets one lazily created registry:
//! its main greenlet, the current-greenlet pointer, the origin of the last
//! transfer and an arena of every core created or started here, used by the
//! collector and by thread teardown.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};
use crate::greenlet::{Core, Greenlet, Phase, lock};
use crate::lifecycle;

/// The cross-thread face of a registry.
///
/// Greenlets keep an `Arc` to the record of their owning thread, so it
/// outlives the registry. Other threads use it to queue kills.
pub(crate) struct ThreadRecord {
    pub(crate) thread: ThreadId,
    /// Cleared, under the `doomed` lock, once the registry is torn down
    alive: AtomicBool,
    /// Suspended greenlets whose last handle was dropped, waiting to be killed
    pub(crate) doomed: Mutex<Vec<Arc<Core>>>,
    /// Greenlets that swallowed their kill
    pub(crate) leaked: Mutex<Vec<Arc<Core>>>,
    /// Live stacks allocated on this thread
    pub(crate) stacks: Arc<AtomicUsize>,
}

impl ThreadRecord {
    fn new() -> Self {
        ThreadRecord {
            thread: thread::current().id(),
            alive: AtomicBool::new(true),
            doomed: Mutex::new(Vec::new()),
            leaked: Mutex::new(Vec::new()),
            stacks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Only meaningful while holding the `doomed` lock.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

struct Registry {
    record: Arc<ThreadRecord>,
    main: Greenlet,
    current: RefCell<Greenlet>,
    /// The greenlet the last transfer came from, released on arrival
    origin: RefCell<Option<Greenlet>>,
    arena: RefCell<Vec<Weak<Core>>>,
}

impl Registry {
    fn new() -> Self {
        let record = Arc::new(ThreadRecord::new());
        let main = Greenlet::from_core(Core::main(Arc::clone(&record)));
        tracing::debug!(greenlet = %main.id(), thread = ?record.thread, "main greenlet created");
        Registry {
            record,
            current: RefCell::new(main.clone()),
            main,
            origin: RefCell::new(None),
            arena: RefCell::new(Vec::new()),
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let doomed = {
            let mut doomed = lock(&self.record.doomed);
            self.record.alive.store(false, Ordering::Release);
            std::mem::take(&mut *doomed)
        };
        let leaked = std::mem::take(&mut *lock(&self.record.leaked));
        let arena = std::mem::take(self.arena.get_mut());

        let mut abandoned = 0;
        for core in doomed.iter().chain(leaked.iter()) {
            lifecycle::abandon(core);
            abandoned += 1;
        }
        for core in arena.iter().filter_map(Weak::upgrade) {
            let owned_here = {
                let meta = core.meta();
                meta.phase == Phase::Suspended
                    && meta
                        .thread
                        .as_ref()
                        .is_some_and(|t| Arc::ptr_eq(t, &self.record))
            };
            if owned_here {
                lifecycle::abandon(&core);
                abandoned += 1;
            }
        }
        // The main greenlet dies with its thread
        let attrs = {
            let mut meta = self.main.core().meta();
            meta.phase = Phase::Dead;
            std::mem::take(&mut meta.attrs)
        };
        drop(attrs);

        tracing::debug!(
            thread = ?self.record.thread,
            abandoned,
            "greenlet registry torn down"
        );
        self.origin.get_mut().take();
        drop(doomed);
        drop(leaked);
    }
}

thread_local! {
    static REGISTRY: Registry = Registry::new();
}

fn with<R>(f: impl FnOnce(&Registry) -> R) -> Result<R> {
    REGISTRY.try_with(f).map_err(|_| Error::ThreadExiting)
}

pub(crate) fn record() -> Result<Arc<ThreadRecord>> {
    with(|registry| Arc::clone(&registry.record))
}

pub(crate) fn current() -> Result<Greenlet> {
    with(|registry| registry.current.borrow().clone())
}

pub(crate) fn is_current(core: &Arc<Core>) -> bool {
    with(|registry| Arc::ptr_eq(registry.current.borrow().core(), core)).unwrap_or(false)
}

/// Makes `target` the running greenlet of this thread.
///
/// The previous one becomes the origin of the transfer and is suspended
/// unless it just died.
pub(crate) fn swap_current(target: Greenlet) -> Result<()> {
    let displaced = with(|registry| {
        target.core().meta().phase = Phase::Active;
        let previous = registry.current.replace(target);
        {
            let mut meta = previous.core().meta();
            if meta.phase != Phase::Dead {
                meta.phase = Phase::Suspended;
            }
        }
        registry.origin.replace(Some(previous))
    })?;
    drop(displaced);
    Ok(())
}

pub(crate) fn take_origin() -> Option<Greenlet> {
    with(|registry| registry.origin.borrow_mut().take()).ok().flatten()
}

/// Remembers `core` for the collector and for thread teardown.
pub(crate) fn track(core: &Arc<Core>) {
    let _ = with(|registry| {
        let mut arena = registry.arena.borrow_mut();
        if arena.len() == arena.capacity() {
            arena.retain(|weak| weak.strong_count() > 0);
        }
        arena.push(Arc::downgrade(core));
    });
}

/// Live cores tracked by this thread, without duplicates.
pub(crate) fn arena() -> Result<Vec<Arc<Core>>> {
    with(|registry| {
        let mut arena = registry.arena.borrow_mut();
        arena.retain(|weak| weak.strong_count() > 0);
        let mut seen = std::collections::HashSet::new();
        arena
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|core| seen.insert(Arc::as_ptr(core)))
            .collect()
    })
}

/// Delivers the kills deferred to this thread.
pub(crate) fn checkpoint() -> Result<()> {
    let record = record()?;
    loop {
        let batch = std::mem::take(&mut *lock(&record.doomed));
        if batch.is_empty() {
            return Ok(());
        }
        for core in batch {
            lifecycle::reap(core);
        }
    }
}

/// Number of greenlet stacks currently mapped by the calling thread.
pub fn stack_count() -> usize {
    with(|registry| registry.record.stacks.load(Ordering::Relaxed)).unwrap_or(0)
}
