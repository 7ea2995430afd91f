//! Generators on top of `switch` and `parent`.
//!
//! A generator is a greenlet that yields by switching to its parent. Each
//! `next()` reparents it to the caller first, so generators can consume
//! other generators.

use std::marker::PhantomData;

use greenstack::{Error, Greenlet, Result, Value};
use tracing_subscriber::EnvFilter;

struct Done;

struct Yielder<T>(PhantomData<fn(T)>);

impl<T: Send + 'static> Yielder<T> {
    fn give(&self, value: T) -> Result<()> {
        let consumer = Greenlet::current().parent().ok_or(Error::Collected)?;
        consumer.switch(value).map(drop)
    }
}

struct Generator<T> {
    worker: Greenlet,
    _item: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Generator<T> {
    fn new<F>(body: F) -> Self
    where
        F: FnOnce(&Yielder<T>) -> Result<()> + Send + 'static,
    {
        let worker = Greenlet::new(move |_| {
            body(&Yielder(PhantomData))?;
            Ok(Value::new(Done))
        });
        Generator {
            worker,
            _item: PhantomData,
        }
    }
}

impl<T: 'static> Iterator for Generator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.worker.is_dead() {
            return None;
        }
        let result = self
            .worker
            .set_parent(&Greenlet::current())
            .and_then(|()| self.worker.switch(()));
        match result {
            // `Done` fails the downcast and ends the iteration
            Ok(value) => value.downcast::<T>().ok(),
            Err(err) => {
                tracing::error!(error = %err, "generator failed");
                None
            }
        }
    }
}

fn counter(limit: u64) -> Generator<u64> {
    Generator::new(move |y| {
        for i in 0..limit {
            y.give(i)?;
        }
        Ok(())
    })
}

fn fibonacci() -> Generator<u64> {
    Generator::new(|y| {
        let (mut a, mut b) = (0_u64, 1_u64);
        loop {
            if let Err(err) = y.give(a) {
                println!("fibonacci stopped: {err}");
                return Err(err);
            }
            (a, b) = (b, a.wrapping_add(b));
        }
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let first: Vec<u64> = fibonacci().take(10).collect();
    println!("fibonacci: {first:?}");
    // The abandoned generator is killed here
    Greenlet::current();

    // A generator pulling from another one
    let even_squares: Generator<u64> = Generator::new(|y| {
        for n in counter(10) {
            if n % 2 == 0 {
                y.give(n * n)?;
            }
        }
        Ok(())
    });
    let squares: Vec<u64> = even_squares.collect();
    println!("even squares: {squares:?}");
    println!("stacks still mapped: {}", greenstack::stack_count());
}
