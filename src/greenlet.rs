//! The greenlet object model.
//!
//! A [`Greenlet`] is a cloneable handle over a shared core. The core holds
//! the saved registers of a suspended stack plus everything the switch
//! protocol needs: phase, parent link, payload, pending delivery and owning
//! thread. All handles of one greenlet share a single `Handle`, whose drop
//! tells the runtime that nobody can switch into the greenlet anymore.

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::arch::Registers;
use crate::error::{Error, GreenletExit, Result};
use crate::gc::{Attribute, Traverse, Visitor};
use crate::registry::{self, ThreadRecord};
use crate::stack::Stack;
use crate::value::Value;
use crate::{config, switch};

/// Entry point of a greenlet.
pub(crate) trait Start: Send {
    fn start(self: Box<Self>, input: Value) -> Result<Value>;

    /// Reports the greenlets held by the payload to the collector.
    fn visit(&self, _visitor: &mut Visitor<'_>) {}
}

pub(crate) type Payload = Box<dyn Start>;

/// A bare closure; whatever it captures is invisible to the collector.
struct Plain<F>(F);

impl<F> Start for Plain<F>
where
    F: FnOnce(Value) -> Result<Value> + Send,
{
    fn start(self: Box<Self>, input: Value) -> Result<Value> {
        (self.0)(input)
    }
}

/// A closure plus state handed to it on start.
struct Stateful<S, F> {
    state: S,
    run: F,
}

impl<S, F> Start for Stateful<S, F>
where
    S: Traverse + Send,
    F: FnOnce(S, Value) -> Result<Value> + Send,
{
    fn start(self: Box<Self>, input: Value) -> Result<Value> {
        let Stateful { state, run } = *self;
        run(state, input)
    }

    fn visit(&self, visitor: &mut Visitor<'_>) {
        self.state.traverse(visitor);
    }
}

fn plain<F>(run: F) -> Payload
where
    F: FnOnce(Value) -> Result<Value> + Send + 'static,
{
    Box::new(Plain(run))
}

fn stateful<S, F>(state: S, run: F) -> Payload
where
    S: Traverse + Send + 'static,
    F: FnOnce(S, Value) -> Result<Value> + Send + 'static,
{
    Box::new(Stateful { state, run })
}

/// Produces the payload on first switch.
pub(crate) type Binder = Box<dyn FnOnce() -> Result<Payload> + Send>;

/// Locks a crate mutex. No user code runs under these locks, so a poisoned
/// lock still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-unique greenlet identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GreenletId(u64);

impl GreenletId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        GreenletId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GreenletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a greenlet is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Created, no stack yet
    NotStarted,
    /// Running on its thread right now
    Active,
    /// Started and waiting to be switched into
    Suspended,
    /// Finished; keeps identity and attributes only
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// The implicit greenlet of an OS thread
    Main,
    Spawned,
}

pub(crate) enum RunSlot {
    Empty,
    Ready(Payload),
    Deferred(Binder),
}

impl RunSlot {
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, RunSlot::Empty)
    }
}

/// Mutable half of a core.
pub(crate) struct Meta {
    pub(crate) phase: Phase,
    pub(crate) parent: Option<Greenlet>,
    pub(crate) run: RunSlot,
    /// Payload handed to the trampoline of a freshly primed stack
    pub(crate) launch: Option<Payload>,
    /// The one delivery waiting at the next resumption point
    pub(crate) pending: Option<Result<Value>>,
    /// Owning thread, stamped on first start
    pub(crate) thread: Option<Arc<ThreadRecord>>,
    pub(crate) stack: Option<Stack>,
    pub(crate) attrs: HashMap<String, Box<dyn Attribute>>,
    /// Swallowed a kill after its last handle went away
    pub(crate) refused_exit: bool,
}

pub(crate) struct Core {
    pub(crate) id: GreenletId,
    pub(crate) kind: Kind,
    pub(crate) stack_size: usize,
    /// Saved machine state while suspended
    pub(crate) registers: UnsafeCell<Registers>,
    /// The shared handle, if any handle is alive
    pub(crate) handle: Mutex<Weak<Handle>>,
    pub(crate) meta: Mutex<Meta>,
}

// `registers` is only read or written by the owning thread inside a
// transfer; everything else sits behind a mutex.
unsafe impl Send for Core {}
unsafe impl Sync for Core {}

impl Core {
    fn build(kind: Kind, stack_size: usize, meta: Meta) -> Arc<Core> {
        Arc::new(Core {
            id: GreenletId::next(),
            kind,
            stack_size,
            registers: UnsafeCell::new(Registers::default()),
            handle: Mutex::new(Weak::new()),
            meta: Mutex::new(meta),
        })
    }

    fn blank_meta(phase: Phase) -> Meta {
        Meta {
            phase,
            parent: None,
            run: RunSlot::Empty,
            launch: None,
            pending: None,
            thread: None,
            stack: None,
            attrs: HashMap::new(),
            refused_exit: false,
        }
    }

    /// The implicit, already running greenlet of a thread.
    pub(crate) fn main(record: Arc<ThreadRecord>) -> Arc<Core> {
        let mut meta = Core::blank_meta(Phase::Active);
        meta.thread = Some(record);
        Core::build(Kind::Main, 0, meta)
    }

    pub(crate) fn spawned(stack_size: usize, run: RunSlot) -> Arc<Core> {
        let mut meta = Core::blank_meta(Phase::NotStarted);
        meta.run = run;
        Core::build(Kind::Spawned, stack_size, meta)
    }

    pub(crate) fn meta(&self) -> MutexGuard<'_, Meta> {
        lock(&self.meta)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.meta().phase
    }

    pub(crate) fn is_main(&self) -> bool {
        self.kind == Kind::Main
    }

    pub(crate) fn parent(&self) -> Option<Greenlet> {
        self.meta().parent.clone()
    }

    /// Number of live `Greenlet` values pointing at this core.
    pub(crate) fn handle_count(&self) -> usize {
        lock(&self.handle).strong_count()
    }

    /// The thread allowed to drive this greenlet.
    ///
    /// A greenlet that has not started yet belongs to the first started
    /// greenlet up its parent chain. A chain that ends without reaching one
    /// was cut by the collector.
    pub(crate) fn owner(&self) -> Result<Arc<ThreadRecord>> {
        let mut next = {
            let meta = self.meta();
            if let Some(thread) = &meta.thread {
                return Ok(Arc::clone(thread));
            }
            meta.parent.clone()
        };
        while let Some(greenlet) = next {
            let meta = greenlet.core().meta();
            if let Some(thread) = &meta.thread {
                return Ok(Arc::clone(thread));
            }
            next = meta.parent.clone();
        }
        Err(Error::Collected)
    }
}

/// Shared by every clone of a `Greenlet`.
pub(crate) struct Handle {
    pub(crate) core: Arc<Core>,
}

/// A greenlet: an independent call stack that runs only when switched into.
///
/// Cloning a `Greenlet` clones the handle; equality is identity. A greenlet
/// may be moved to any thread, but only its owning thread can switch into it.
#[derive(Clone)]
pub struct Greenlet(Arc<Handle>);

impl Greenlet {
    /// Creates a greenlet whose parent is the current greenlet.
    ///
    /// Called during thread teardown, the greenlet is created without a
    /// parent and can never be switched into.
    pub fn new<F>(run: F) -> Greenlet
    where
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        let _ = registry::checkpoint();
        let parent = registry::current().ok();
        Greenlet::spawn(parent, config::global().stack_size, RunSlot::Ready(plain(run)))
    }

    /// Creates a greenlet that returns to `parent` when it finishes.
    pub fn with_parent<F>(run: F, parent: &Greenlet) -> Result<Greenlet>
    where
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        Greenlet::builder().run(run).parent(parent).build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The greenlet running on the calling thread.
    ///
    /// The first call on a thread creates that thread's main greenlet. This
    /// is a checkpoint: kills deferred to this thread are delivered first.
    ///
    /// # Panics
    ///
    /// Panics if called after the thread's greenlet registry was destroyed,
    /// e.g. from another thread-local destructor. Use
    /// [`Greenlet::try_current`] there.
    pub fn current() -> Greenlet {
        match Greenlet::try_current() {
            Ok(current) => current,
            Err(err) => panic!("Greenlet::current: {err}"),
        }
    }

    /// Like [`Greenlet::current`], failing with [`Error::ThreadExiting`]
    /// during thread teardown.
    pub fn try_current() -> Result<Greenlet> {
        registry::checkpoint()?;
        registry::current()
    }

    fn spawn(parent: Option<Greenlet>, stack_size: usize, run: RunSlot) -> Greenlet {
        let core = Core::spawned(stack_size, run);
        core.meta().parent = parent;
        registry::track(&core);
        tracing::trace!(greenlet = %core.id, "greenlet created");
        Greenlet::from_core(core)
    }

    /// Hands out a handle to `core`, reusing the shared one if still alive.
    pub(crate) fn from_core(core: Arc<Core>) -> Greenlet {
        let mut slot = lock(&core.handle);
        if let Some(handle) = slot.upgrade() {
            return Greenlet(handle);
        }
        let handle = Arc::new(Handle {
            core: Arc::clone(&core),
        });
        *slot = Arc::downgrade(&handle);
        drop(slot);
        Greenlet(handle)
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.0.core
    }

    /// Number of clones of this handle, including `self`.
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Transfers control into this greenlet, delivering `value`.
    ///
    /// Starts the greenlet with `value` as the payload input if it has not
    /// run yet; otherwise `value` becomes the result of the switch that last
    /// suspended it. Returns whatever is delivered back when control returns
    /// to the caller.
    pub fn switch<T: Any + Send>(&self, value: T) -> Result<Value> {
        switch::switch_to(self, Ok(Value::new(value)))
    }

    /// Transfers control into this greenlet and makes its pending switch
    /// fail with `error`.
    ///
    /// A greenlet that has not started never runs its payload; the error
    /// goes straight to its parent.
    pub fn throw(&self, error: impl Into<Error>) -> Result<Value> {
        switch::switch_to(self, Err(error.into()))
    }

    /// Throws [`GreenletExit`]. Killing a dead greenlet returns the exit
    /// sentinel.
    pub fn kill(&self) -> Result<Value> {
        self.throw(GreenletExit)
    }

    pub fn id(&self) -> GreenletId {
        self.core().id
    }

    pub fn phase(&self) -> Phase {
        self.core().phase()
    }

    pub fn is_dead(&self) -> bool {
        self.phase() == Phase::Dead
    }

    pub fn is_started(&self) -> bool {
        self.phase() != Phase::NotStarted
    }

    /// Started and not finished.
    pub fn is_active(&self) -> bool {
        matches!(self.phase(), Phase::Active | Phase::Suspended)
    }

    pub fn is_main(&self) -> bool {
        self.core().is_main()
    }

    pub fn is_current(&self) -> bool {
        registry::is_current(self.core())
    }

    pub fn parent(&self) -> Option<Greenlet> {
        self.core().parent()
    }

    /// Reassigns the greenlet that receives control when this one finishes.
    ///
    /// Fails without changing anything if `parent` is `self` or one of its
    /// descendants, if `parent`'s chain does not end at a main greenlet, or
    /// if this greenlet already runs on a different thread than `parent`.
    pub fn set_parent(&self, parent: &Greenlet) -> Result<()> {
        let mut root = parent.clone();
        let mut cursor = Some(parent.clone());
        while let Some(greenlet) = cursor {
            if greenlet == *self {
                return Err(Error::CyclicParent);
            }
            cursor = greenlet.parent();
            root = greenlet;
        }
        if !root.is_main() {
            return Err(Error::ParentCollected);
        }

        let root_thread = root.core().meta().thread.clone();

        let mut meta = self.core().meta();
        if let Some(thread) = &meta.thread {
            if !root_thread.is_some_and(|t| Arc::ptr_eq(&t, thread)) {
                return Err(Error::ParentThread);
            }
        }
        let previous = meta.parent.replace(parent.clone());
        drop(meta);
        drop(previous);
        Ok(())
    }

    /// Replaces the payload of a greenlet that has not started.
    pub fn set_run<F>(&self, run: F) -> Result<()>
    where
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        self.replace_run(RunSlot::Ready(plain(run)))
    }

    /// Replaces the payload with `run`, which receives `state` on start.
    ///
    /// Unlike closure captures, greenlets inside `state` are visible to
    /// [`collect`](crate::collect), so a payload holding on to its own
    /// greenlet this way does not keep it alive forever.
    pub fn set_run_with_state<S, F>(&self, state: S, run: F) -> Result<()>
    where
        S: Traverse + Send + 'static,
        F: FnOnce(S, Value) -> Result<Value> + Send + 'static,
    {
        self.replace_run(RunSlot::Ready(stateful(state, run)))
    }

    /// Defers choosing the payload to the first switch.
    ///
    /// `bind` runs exactly once, on the switching thread, before the stack
    /// is allocated. It may run arbitrary code, including setting another
    /// payload and switching into this greenlet; if the greenlet has started
    /// by the time `bind` returns, its result is discarded. Otherwise the
    /// payload `bind` returns is the one that starts, and any payload set
    /// meanwhile is dropped. An error from `bind` is returned by the switch
    /// that triggered it.
    pub fn set_run_with<B, F>(&self, bind: B) -> Result<()>
    where
        B: FnOnce() -> Result<F> + Send + 'static,
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        self.replace_run(RunSlot::Deferred(bind_payload(bind)))
    }

    fn replace_run(&self, run: RunSlot) -> Result<()> {
        let mut meta = self.core().meta();
        if meta.phase != Phase::NotStarted {
            return Err(Error::AlreadyStarted);
        }
        let previous = std::mem::replace(&mut meta.run, run);
        drop(meta);
        drop(previous);
        Ok(())
    }

    /// True while a payload or binder is waiting for the first switch.
    pub fn has_run(&self) -> bool {
        !self.core().meta().run.is_empty()
    }

    pub fn downgrade(&self) -> WeakGreenlet {
        WeakGreenlet(Arc::downgrade(self.core()))
    }

    /// Stores a named value on the greenlet, replacing any previous one.
    ///
    /// Attributes outlive the greenlet's death. Values implement
    /// [`Traverse`](crate::Traverse) so that [`collect`](crate::collect) can
    /// see the greenlets they hold.
    pub fn set_attr<T: Attribute>(&self, name: impl Into<String>, value: T) {
        let previous = self.core().meta().attrs.insert(name.into(), Box::new(value));
        drop(previous);
    }

    /// A clone of the attribute `name`, if it exists and has type `T`.
    pub fn attr<T: Any + Clone>(&self, name: &str) -> Option<T> {
        let meta = self.core().meta();
        let value: &dyn Attribute = &**meta.attrs.get(name)?;
        let value: &dyn Any = value;
        value.downcast_ref::<T>().cloned()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.core().meta().attrs.contains_key(name)
    }

    /// Removes the attribute `name`, returning whether it existed.
    pub fn remove_attr(&self, name: &str) -> bool {
        let removed = self.core().meta().attrs.remove(name);
        removed.is_some()
    }
}

fn bind_payload<B, F>(bind: B) -> Binder
where
    B: FnOnce() -> Result<F> + Send + 'static,
    F: FnOnce(Value) -> Result<Value> + Send + 'static,
{
    Box::new(move || bind().map(plain))
}

impl PartialEq for Greenlet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self.core(), other.core())
    }
}

impl Eq for Greenlet {}

impl Hash for Greenlet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(self.core()).hash(state);
    }
}

impl fmt::Debug for Greenlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Greenlet")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .field("main", &self.is_main())
            .finish()
    }
}

/// A reference that does not keep the greenlet alive.
#[derive(Clone, Default)]
pub struct WeakGreenlet(Weak<Core>);

impl WeakGreenlet {
    /// Creates a reference that never upgrades.
    pub fn new() -> Self {
        WeakGreenlet(Weak::new())
    }

    /// A strong handle, if the greenlet still exists.
    ///
    /// Upgrading a suspended greenlet whose last handle was just dropped
    /// brings it back to normal life: the pending kill is skipped.
    pub fn upgrade(&self) -> Option<Greenlet> {
        self.0.upgrade().map(Greenlet::from_core)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakGreenlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(core) => write!(f, "WeakGreenlet({})", core.id),
            None => f.write_str("WeakGreenlet(<gone>)"),
        }
    }
}

/// Configures a greenlet before creating it.
///
/// ```no_run
/// use greenstack::{Greenlet, Value};
///
/// let child = Greenlet::builder()
///     .stack_size(64 * 1024)
///     .run(|input: Value| Ok(input))
///     .build()?;
/// assert_eq!(child.switch(3_u8)?.downcast::<u8>().ok(), Some(3));
/// # Ok::<(), greenstack::Error>(())
/// ```
#[derive(Default)]
pub struct Builder {
    parent: Option<Greenlet>,
    stack_size: Option<usize>,
    run: Option<RunSlot>,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Defaults to the current greenlet.
    pub fn parent(mut self, parent: &Greenlet) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Usable stack bytes; defaults to [`Config::stack_size`](crate::Config).
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn run<F>(mut self, run: F) -> Self
    where
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        self.run = Some(RunSlot::Ready(plain(run)));
        self
    }

    /// See [`Greenlet::set_run_with_state`].
    pub fn run_with_state<S, F>(mut self, state: S, run: F) -> Self
    where
        S: Traverse + Send + 'static,
        F: FnOnce(S, Value) -> Result<Value> + Send + 'static,
    {
        self.run = Some(RunSlot::Ready(stateful(state, run)));
        self
    }

    /// See [`Greenlet::set_run_with`].
    pub fn run_with<B, F>(mut self, bind: B) -> Self
    where
        B: FnOnce() -> Result<F> + Send + 'static,
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        self.run = Some(RunSlot::Deferred(bind_payload(bind)));
        self
    }

    /// Creates the greenlet. A greenlet built without a payload fails with
    /// [`Error::MissingRun`] when first switched into.
    pub fn build(self) -> Result<Greenlet> {
        registry::checkpoint()?;
        let stack_size = match self.stack_size {
            Some(size) => config::normalize(size),
            None => config::global().stack_size,
        };
        let run = self.run.unwrap_or(RunSlot::Empty);
        match self.parent {
            Some(parent) => {
                let greenlet = Greenlet::spawn(None, stack_size, run);
                greenlet.set_parent(&parent)?;
                Ok(greenlet)
            }
            None => Ok(Greenlet::spawn(Some(registry::current()?), stack_size, run)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_identity() {
        let a = Greenlet::new(Ok);
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.handle_count(), 2);
        assert_ne!(a, Greenlet::new(Ok));
        assert_eq!(a.phase(), Phase::NotStarted);
        assert!(a.has_run());
    }

    #[test]
    fn weak_handles_upgrade_to_the_same_greenlet() {
        let a = Greenlet::new(Ok);
        let weak = a.downgrade();
        assert_eq!(weak.upgrade(), Some(a.clone()));
        drop(a);
        assert!(weak.upgrade().is_none());
        assert!(WeakGreenlet::new().upgrade().is_none());
    }

    #[test]
    fn unstarted_greenlets_belong_to_their_parents_thread() {
        let main = Greenlet::current();
        let child = Greenlet::new(Ok);
        let grandchild = Greenlet::with_parent(Ok, &child).unwrap();
        let owner = grandchild.core().owner().unwrap();
        assert!(Arc::ptr_eq(&owner, &main.core().owner().unwrap()));
    }

    #[test]
    fn parents_cannot_form_cycles() {
        let a = Greenlet::new(Ok);
        let b = Greenlet::with_parent(Ok, &a).unwrap();
        assert!(matches!(a.set_parent(&b), Err(Error::CyclicParent)));
        assert!(matches!(a.set_parent(&a), Err(Error::CyclicParent)));
        assert_eq!(a.parent(), Some(Greenlet::current()));
    }

    #[test]
    fn attributes_downcast_by_type() {
        let g = Greenlet::new(Ok);
        g.set_attr("name", "worker".to_string());
        assert_eq!(g.attr::<String>("name").as_deref(), Some("worker"));
        assert_eq!(g.attr::<u32>("name"), None);
        assert!(g.remove_attr("name"));
        assert!(!g.has_attr("name"));
    }

    #[test]
    fn run_can_be_replaced_before_start() {
        let g = Greenlet::builder().build().unwrap();
        assert!(!g.has_run());
        g.set_run(|_| Ok(Value::new(9_u8))).unwrap();
        assert_eq!(g.switch(()).unwrap().downcast::<u8>().unwrap(), 9);
        assert!(matches!(g.set_run(Ok), Err(Error::AlreadyStarted)));
    }
}
