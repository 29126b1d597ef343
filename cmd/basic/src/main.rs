//! Basic strand example
//!
//! Demonstrates spawning fibers, yielding, sleeping and joining.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use strand::{sleep, spawn, yield_now, Builder};

fn main() {
    println!("=== strand basic example ===\n");

    let log = Rc::new(RefCell::new(Vec::new()));

    // Two fibers interleaving through voluntary yields.
    let l = log.clone();
    let ping = spawn(move || {
        for i in 0..3 {
            l.borrow_mut().push(format!("ping {}", i));
            yield_now();
        }
    })
    .expect("failed to spawn ping");

    let l = log.clone();
    let pong = spawn(move || {
        for i in 0..3 {
            l.borrow_mut().push(format!("pong {}", i));
            yield_now();
        }
    })
    .expect("failed to spawn pong");

    ping.join();
    pong.join();

    println!("interleaving:");
    for line in log.borrow().iter() {
        println!("  {}", line);
    }

    // Sleeping fibers wake in deadline order regardless of start order.
    let woke = Rc::new(RefCell::new(Vec::new()));
    let mut sleepers = Vec::new();
    for delay_ms in [30u64, 10, 20] {
        let w = woke.clone();
        let fiber = Builder::new()
            .name("sleeper")
            .stack_size(64 * 1024)
            .spawn(move || {
                sleep(Duration::from_millis(delay_ms));
                w.borrow_mut().push(delay_ms);
            })
            .expect("failed to spawn sleeper");
        fiber.start();
        sleepers.push(fiber);
    }

    let started = Instant::now();
    for fiber in &sleepers {
        fiber.join();
    }

    println!("\nwake order after {:?}: {:?}", started.elapsed(), woke.borrow());
    println!("\ndone");
}
