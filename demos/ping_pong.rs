//! Two greenlets hitting a counter back and forth.
//!
//! Run with `RUST_LOG=greenstack=trace` to see every transfer.

use greenstack::{Error, Greenlet, Value, stack_count};
use tracing_subscriber::EnvFilter;

const ROUNDS: u32 = 5;

fn main() -> greenstack::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Built without a payload so pong can refer to it
    let ping = Greenlet::builder().build()?;

    let pong = {
        let ping = ping.downgrade();
        Greenlet::new(move |mut ball: Value| {
            let ping = ping.upgrade().ok_or(Error::Collected)?;
            loop {
                let n = ball.downcast::<u32>().unwrap_or_default();
                println!("  pong {n}");
                ball = ping.switch(n + 1)?;
            }
        })
    };

    {
        let pong = pong.downgrade();
        ping.set_run(move |_| {
            let pong = pong.upgrade().ok_or(Error::Collected)?;
            let mut n = 0;
            while n < ROUNDS * 2 {
                println!("ping {n}");
                n = pong.switch(n + 1)?.downcast::<u32>().unwrap_or(ROUNDS * 2);
            }
            Ok(Value::new(n))
        })?;
    }

    let hits = ping.switch(())?.downcast::<u32>().unwrap_or_default();
    println!("ping finished after {hits} hits");
    println!("pong is {:?}, {} stack(s) mapped", pong.phase(), stack_count());

    // Pong never returns; dropping it queues a kill for the next checkpoint
    drop(pong);
    Greenlet::current();
    println!("after dropping pong: {} stack(s) mapped", stack_count());
    Ok(())
}
