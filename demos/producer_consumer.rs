//! Runs 5 writer and 10 reader threads against each container, then reports
//! how many elements were popped concurrently and how many were left for the
//! final `clear`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use reclaim_cds::prelude::*;

const WRITERS: u64 = 5;
const READERS: usize = 10;
const PER_WRITER: u64 = 1_000_000;

fn run<C: Container<u64> + Default + 'static>(name: &str) {
    let container = Arc::new(C::default());
    let writers_done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let container = Arc::clone(&container);
            thread::spawn(move || {
                (0..PER_WRITER).filter(|i| container.push(w * PER_WRITER + i)).count() as u64
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let container = Arc::clone(&container);
            let writers_done = Arc::clone(&writers_done);
            thread::spawn(move || {
                let mut popped = 0u64;
                while !writers_done.load(Ordering::Acquire) {
                    if container.pop().is_some() {
                        popped += 1;
                    }
                }
                popped
            })
        })
        .collect();

    let pushed: u64 = writers.into_iter().map(|h| h.join().unwrap()).sum();
    writers_done.store(true, Ordering::Release);
    let popped: u64 = readers.into_iter().map(|h| h.join().unwrap()).sum();
    let cleared = container.clear() as u64;

    println!(
        "{:<20} pushed {:>8}, popped {:>8}, cleared {:>8} in {:?}",
        name,
        pushed,
        popped,
        cleared,
        start.elapsed()
    );
    assert_eq!(pushed, popped + cleared);
}

fn main() {
    run::<HazardPointerStack<u64>>("HazardPointerStack");
    run::<RefCountStack<u64>>("RefCountStack");
    run::<PopCountStack<u64>>("PopCountStack");
    run::<RefCountQueue<u64>>("RefCountQueue");
    run::<AtomicOwnedStack<u64>>("AtomicOwnedStack");
}
