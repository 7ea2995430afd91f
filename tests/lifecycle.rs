mod common;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use common::{Log, fmain, init_logging, int, text, to_parent};
use greenstack::{Error, Greenlet, Value, WeakGreenlet, stack_count};

#[test]
fn dropped_greenlets_are_killed_at_the_next_checkpoint() {
    init_logging();
    let seen = Log::new();
    let g1 = Greenlet::new(fmain(seen.clone()));
    let g2 = Greenlet::new(fmain(seen.clone()));
    g1.switch(()).unwrap();
    g2.switch(()).unwrap();
    assert!(seen.entries().is_empty());

    drop(g1);
    assert!(seen.entries().is_empty());
    Greenlet::current();
    assert_eq!(seen.entries(), vec!["exit"]);

    drop(g2);
    Greenlet::current();
    assert_eq!(seen.entries(), vec!["exit", "exit"]);
}

#[test]
fn killed_greenlets_release_their_stack() {
    let g = Greenlet::new(|_| to_parent(()));
    g.switch(()).unwrap();
    assert_eq!(stack_count(), 1);

    let weak = g.downgrade();
    drop(g);
    assert_eq!(stack_count(), 1);
    assert!(weak.is_alive());

    Greenlet::current();
    assert_eq!(stack_count(), 0);
    assert!(weak.upgrade().is_none());
}

#[test]
fn creating_a_greenlet_is_a_checkpoint() {
    let seen = Log::new();
    let g = Greenlet::new(fmain(seen.clone()));
    g.switch(()).unwrap();
    drop(g);
    let _other = Greenlet::new(|_| Ok(Value::unit()));
    assert_eq!(seen.entries(), vec!["exit"]);
}

#[test]
fn unstarted_and_dead_greenlets_are_freed_immediately() {
    let unstarted = Greenlet::builder().build().unwrap().downgrade();
    assert!(unstarted.upgrade().is_none());

    let dead = {
        let g = Greenlet::new(|_| Ok(Value::unit()));
        g.switch(()).unwrap();
        g.downgrade()
    };
    assert!(dead.upgrade().is_none());

    // A result that holds on to the greenlet that produced it
    let value = Greenlet::new(|_| Ok(Value::new(Greenlet::current())))
        .switch(())
        .unwrap();
    let weak = value.downcast::<Greenlet>().unwrap().downgrade();
    assert!(weak.upgrade().is_none());
}

#[test]
fn dropping_on_another_thread_defers_to_the_owner() {
    let seen = Log::new();
    let (created_tx, created_rx) = mpsc::channel();
    let (released_tx, released_rx) = mpsc::channel::<()>();
    let (checked_tx, checked_rx) = mpsc::channel::<()>();

    let worker = {
        let seen = seen.clone();
        thread::spawn(move || {
            let g = Greenlet::new(fmain(seen));
            g.switch(()).unwrap();
            created_tx.send(g).unwrap();
            released_rx.recv().unwrap();
            Greenlet::current();
            checked_tx.send(()).unwrap();
        })
    };

    let g = created_rx.recv().unwrap();
    assert!(seen.entries().is_empty());
    drop(g);
    // Our checkpoints never run another thread's greenlets
    Greenlet::current();
    assert!(seen.entries().is_empty());

    released_tx.send(()).unwrap();
    checked_rx.recv().unwrap();
    assert_eq!(seen.entries(), vec!["exit"]);
    worker.join().unwrap();
}

#[test]
fn parent_is_restored_after_a_kill() {
    let main = Greenlet::current();
    let hub = Greenlet::new(|_| Ok(Value::unit()));
    let result: Log<Greenlet> = Log::new();

    let g = {
        let (main, hub_c, result) = (main.clone(), hub.clone(), result.clone());
        Greenlet::with_parent(
            move |_| match main.switch(()) {
                Err(err) if err.is_exit() => {
                    let me = Greenlet::current();
                    result.push(me.parent().ok_or(Error::Collected)?);
                    result.push(me);
                    hub_c.switch(())
                }
                other => other,
            },
            &hub,
        )
        .unwrap()
    };
    g.switch(()).unwrap();
    drop(g);
    Greenlet::current();

    let result = result.entries();
    assert_eq!(result.len(), 2);
    // The killer stood in as parent during the kill
    assert_eq!(result[0], main);
    assert_eq!(result[1].parent(), Some(hub));
}

#[test]
fn switch_values_survive_losing_the_last_handle() {
    let seen: Log<Greenlet> = Log::new();
    let worker_slot: Arc<Mutex<Option<Greenlet>>> = Arc::default();
    let initiator_slot: Arc<Mutex<Option<Greenlet>>> = Arc::default();

    let worker = {
        let seen = seen.clone();
        let worker_slot = Arc::clone(&worker_slot);
        let initiator_slot = Arc::clone(&initiator_slot);
        Greenlet::new(move |_| {
            let parent = Greenlet::current().parent().ok_or(Error::Collected)?;
            let value = parent.switch(())?;
            // Drop every handle on ourselves except the one running us
            worker_slot.lock().unwrap().take();
            if let Some(initiator) = initiator_slot.lock().unwrap().take() {
                initiator.set_parent(&parent)?;
            }
            let result = parent.switch(value);
            seen.push(Greenlet::current());
            result
        })
    };
    *worker_slot.lock().unwrap() = Some(worker.clone());
    worker.switch(()).unwrap();

    let initiator = Greenlet::with_parent(|_| Ok(Value::new(42)), &worker).unwrap();
    drop(worker);
    *initiator_slot.lock().unwrap() = Some(initiator.clone());

    let value = initiator.switch(()).unwrap();
    assert_eq!(int(value), 42);
    Greenlet::current();
    assert_eq!(seen.len(), 1);
}

#[test]
fn kill_victims_see_weak_references_of_the_dropped() {
    let seen: Log<Option<Greenlet>> = Log::new();
    let weak_slot: Arc<Mutex<WeakGreenlet>> = Arc::default();

    let g = {
        let seen = seen.clone();
        let weak_slot = Arc::clone(&weak_slot);
        Greenlet::new(move |_| {
            let result = to_parent(());
            let weak = weak_slot.lock().unwrap().clone();
            seen.push(weak.upgrade());
            result
        })
    };
    g.switch(()).unwrap();
    let g2 = Greenlet::with_parent(|_| Ok(Value::unit()), &g).unwrap();
    *weak_slot.lock().unwrap() = g2.downgrade();
    drop(g);
    drop(g2);
    Greenlet::current();

    let seen = seen.entries();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_none());
}

#[test]
fn weak_upgrade_before_the_checkpoint_resurrects() {
    let g = Greenlet::new(|_| to_parent(()).map(|_| Value::new("finished")));
    g.switch(()).unwrap();
    let weak = g.downgrade();
    drop(g);

    let g = weak.upgrade().unwrap();
    Greenlet::current();
    assert!(g.is_active());
    assert_eq!(text(g.switch(()).unwrap()), "finished");
}

#[test]
fn greenlets_that_refuse_to_die_are_leaked_not_killed_twice() {
    let kills = Log::new();
    let g = {
        let kills = kills.clone();
        Greenlet::new(move |_| loop {
            match to_parent(()) {
                Err(err) if err.is_exit() => kills.push(()),
                other => return other,
            }
        })
    };
    g.switch(()).unwrap();
    let weak = g.downgrade();
    drop(g);

    Greenlet::current();
    assert_eq!(kills.len(), 1);
    assert!(weak.is_alive());
    assert_eq!(stack_count(), 1);

    Greenlet::current();
    assert_eq!(kills.len(), 1);

    // Still usable when someone comes back for it
    let g = weak.upgrade().unwrap();
    assert_eq!(g.parent(), Some(Greenlet::current()));
    assert_eq!(int(g.switch(5).unwrap()), 5);
    assert!(g.is_dead());
    assert_eq!(stack_count(), 0);
}

#[test]
fn thread_exit_abandons_suspended_greenlets() {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let kept = Greenlet::new(|_| to_parent(()));
        kept.switch(()).unwrap();
        let queued = Greenlet::new(|_| to_parent(()));
        queued.switch(()).unwrap();
        let weak = queued.downgrade();
        // Queued for a kill that the thread never gets to deliver
        drop(queued);
        tx.send((kept, weak, stack_count())).unwrap();
    })
    .join()
    .unwrap();

    let (kept, queued, stacks) = rx.recv().unwrap();
    assert_eq!(stacks, 2);
    assert!(kept.is_dead());
    assert!(kept.parent().is_none());
    assert!(queued.upgrade().is_none());

    let child = Greenlet::new(|_| Ok(Value::unit()));
    assert!(matches!(
        child.set_parent(&kept),
        Err(Error::ParentCollected)
    ));
    assert!(matches!(kept.switch(()), Err(Error::WrongThread)));
}

#[test]
fn main_greenlet_is_released_with_its_thread() {
    let weak = thread::spawn(|| Greenlet::current().downgrade())
        .join()
        .unwrap();
    assert!(weak.upgrade().is_none());

    // Finished children kept as an attribute of main
    let weak = thread::spawn(|| {
        let main = Greenlet::current();
        let mut finished = Vec::new();
        for _ in 0..2 {
            let g = Greenlet::new(|_| Ok(Value::unit()));
            g.switch(()).unwrap();
            finished.push(g);
        }
        main.set_attr("finished", finished);
        main.downgrade()
    })
    .join()
    .unwrap();
    assert!(weak.upgrade().is_none());
}
