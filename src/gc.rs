//! Cycle collection for greenlets.
//!
//! Handles are reference counted, so greenlets that point at each other
//! through parent links or attributes keep each other alive. [`collect`]
//! finds such groups on the calling thread by trial deletion: references
//! that are known to come from other candidates are subtracted from the
//! handle counts, and whatever cannot be reached from a remaining outside
//! reference gets its links cleared. Suspended members are then killed by
//! the ordinary dropped-handle path.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::Result;
use crate::greenlet::{Core, Greenlet, Phase, RunSlot, Start, WeakGreenlet};
use crate::registry;
use crate::value::Value;

/// Passed to [`Traverse::traverse`] to report held greenlets.
pub struct Visitor<'a> {
    visit: &'a mut dyn FnMut(&Greenlet),
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(visit: &'a mut dyn FnMut(&Greenlet)) -> Self {
        Visitor { visit }
    }

    pub fn visit(&mut self, greenlet: &Greenlet) {
        (self.visit)(greenlet)
    }
}

/// Reports the greenlets a value holds on to.
///
/// Implemented for greenlets, common containers and leaf types. The default
/// reports nothing, which makes any greenlet held by the value look like an
/// outside reference: safe, but such cycles are never collected.
///
/// `traverse` runs while the collector holds internal locks and must only
/// call [`Visitor::visit`].
pub trait Traverse {
    fn traverse(&self, _visitor: &mut Visitor<'_>) {}
}

/// A value that can be stored with [`Greenlet::set_attr`].
pub trait Attribute: Traverse + Any + Send {}

impl<T: Traverse + Any + Send> Attribute for T {}

macro_rules! leaf {
    ($($ty:ty),* $(,)?) => {
        $(impl Traverse for $ty {})*
    };
}

leaf!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
    String, &'static str, WeakGreenlet, Value,
);

impl Traverse for Greenlet {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        visitor.visit(self);
    }
}

impl<T: Traverse> Traverse for Option<T> {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        if let Some(value) = self {
            value.traverse(visitor);
        }
    }
}

impl<T: Traverse + ?Sized> Traverse for Box<T> {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        (**self).traverse(visitor);
    }
}

impl<T: Traverse> Traverse for Vec<T> {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        self.iter().for_each(|value| value.traverse(visitor));
    }
}

impl<T: Traverse> Traverse for VecDeque<T> {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        self.iter().for_each(|value| value.traverse(visitor));
    }
}

impl<K, V: Traverse, S> Traverse for HashMap<K, V, S> {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        self.values().for_each(|value| value.traverse(visitor));
    }
}

impl<A: Traverse, B: Traverse> Traverse for (A, B) {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        self.0.traverse(visitor);
        self.1.traverse(visitor);
    }
}

impl<A: Traverse, B: Traverse, C: Traverse> Traverse for (A, B, C) {
    fn traverse(&self, visitor: &mut Visitor<'_>) {
        self.0.traverse(visitor);
        self.1.traverse(visitor);
        self.2.traverse(visitor);
    }
}

fn is_candidate(core: &Arc<Core>, current: &Greenlet, record: &Arc<registry::ThreadRecord>) -> bool {
    if core.is_main() || Arc::ptr_eq(core, current.core()) {
        return false;
    }
    let phase = core.phase();
    let owned = match phase {
        Phase::NotStarted => core.owner().ok(),
        Phase::Suspended | Phase::Dead => core.meta().thread.clone(),
        Phase::Active => None,
    };
    owned.is_some_and(|owner| Arc::ptr_eq(&owner, record))
}

/// Greenlets referenced by `core` itself: its parent, its attributes and
/// the state of a stateful payload.
fn edges(core: &Core) -> Vec<*const Core> {
    let mut found = Vec::new();
    let meta = core.meta();
    let mut visit = |greenlet: &Greenlet| found.push(Arc::as_ptr(greenlet.core()));
    let mut visitor = Visitor::new(&mut visit);
    meta.parent.traverse(&mut visitor);
    for value in meta.attrs.values() {
        value.traverse(&mut visitor);
    }
    if let RunSlot::Ready(run) = &meta.run {
        run.visit(&mut visitor);
    }
    if let Some(run) = &meta.launch {
        run.visit(&mut visitor);
    }
    drop(meta);
    found
}

/// Breaks unreachable greenlet cycles owned by the calling thread.
///
/// Returns how many greenlets had their links cleared. Closure captures,
/// unresolved binders and values living on suspended stacks cannot be
/// inspected; greenlets they hold count as referenced from outside. State
/// given to [`Greenlet::set_run_with_state`] is traversed. Suspended greenlets freed this way are
/// killed before `collect` returns, dead and unstarted ones are simply
/// dropped.
pub fn collect() -> Result<usize> {
    let record = registry::record()?;
    let current = registry::current()?;
    let candidates: Vec<Arc<Core>> = registry::arena()?
        .into_iter()
        .filter(|core| is_candidate(core, &current, &record))
        .collect();
    drop(current);

    let index: HashMap<*const Core, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, core)| (Arc::as_ptr(core), i))
        .collect();
    let mut refs: Vec<isize> = candidates
        .iter()
        .map(|core| core.handle_count() as isize)
        .collect();
    let mut children: Vec<Vec<usize>> = Vec::with_capacity(candidates.len());
    for core in &candidates {
        let targets: Vec<usize> = edges(core)
            .into_iter()
            .filter_map(|ptr| index.get(&ptr).copied())
            .collect();
        for &target in &targets {
            refs[target] -= 1;
        }
        children.push(targets);
    }

    // Everything reachable from an outside reference survives
    let mut reachable = HashSet::new();
    let mut queue: VecDeque<usize> = (0..candidates.len()).filter(|&i| refs[i] > 0).collect();
    while let Some(i) = queue.pop_front() {
        if reachable.insert(i) {
            queue.extend(children[i].iter().copied());
        }
    }

    let mut cleared = 0;
    let mut garbage = Vec::new();
    for (i, core) in candidates.iter().enumerate() {
        if reachable.contains(&i) {
            continue;
        }
        let mut meta = core.meta();
        garbage.push((
            meta.parent.take(),
            std::mem::take(&mut meta.attrs),
            std::mem::replace(&mut meta.run, RunSlot::Empty),
        ));
        drop(meta);
        cleared += 1;
    }
    // Dropping the links may queue suspended greenlets for their kill
    drop(garbage);
    drop(candidates);

    if cleared > 0 {
        tracing::debug!(cleared, "collected greenlet cycles");
    }
    registry::checkpoint()?;
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_report_nested_greenlets() {
        let a = Greenlet::new(Ok);
        let b = Greenlet::new(Ok);
        let held = (vec![Some(a.clone())], "label", Box::new(b.clone()));

        let mut seen = Vec::new();
        let mut visit = |g: &Greenlet| seen.push(g.id());
        held.traverse(&mut Visitor::new(&mut visit));
        assert_eq!(seen, vec![a.id(), b.id()]);
    }

    #[test]
    fn referenced_greenlets_survive() {
        let a = Greenlet::new(Ok);
        let b = Greenlet::with_parent(Ok, &a).unwrap();
        a.set_attr("peer", b.clone());
        collect().unwrap();
        assert!(a.has_attr("peer"));
        assert_eq!(b.parent(), Some(a));
    }
}
