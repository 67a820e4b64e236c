use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rstest::rstest;
use serial_test::serial;

use reclaim_cds::prelude::*;
use reclaim_cds::Activity;

// Trait for type-level parametrization
trait TestContainer {
    type Numbers: Container<u64> + Default + 'static;
    type Tracking: Container<Tracked> + Default + 'static;
    const FIFO: bool;
}

// Marker types for each container
struct UseHazardPointerStack;
struct UseRefCountStack;
struct UsePopCountStack;
struct UseRefCountQueue;
struct UseAtomicOwnedStack;

impl TestContainer for UseHazardPointerStack {
    type Numbers = HazardPointerStack<u64>;
    type Tracking = HazardPointerStack<Tracked>;
    const FIFO: bool = false;
}

impl TestContainer for UseRefCountStack {
    type Numbers = RefCountStack<u64>;
    type Tracking = RefCountStack<Tracked>;
    const FIFO: bool = false;
}

impl TestContainer for UsePopCountStack {
    type Numbers = PopCountStack<u64>;
    type Tracking = PopCountStack<Tracked>;
    const FIFO: bool = false;
}

impl TestContainer for UseRefCountQueue {
    type Numbers = RefCountQueue<u64>;
    type Tracking = RefCountQueue<Tracked>;
    const FIFO: bool = true;
}

impl TestContainer for UseAtomicOwnedStack {
    type Numbers = AtomicOwnedStack<u64>;
    type Tracking = AtomicOwnedStack<Tracked>;
    const FIFO: bool = false;
}

/// A payload counting how often values of its kind are dropped.
struct Tracked {
    drops: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// single-threaded
////////////////////////////////////////////////////////////////////////////////////////////////////

#[rstest]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn sequential_order<T: TestContainer>(#[case] _type: T) {
    let container = T::Numbers::default();
    for i in 0..12 {
        assert!(container.push(i));
    }

    let popped: Vec<_> = (0..12).map(|_| container.pop().unwrap()).collect();
    let expected: Vec<_> = if T::FIFO { (0..12).collect() } else { (0..12).rev().collect() };

    assert_eq!(popped, expected);
    assert_eq!(container.pop(), None);
}

#[rstest]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn pop_into_and_clear<T: TestContainer>(#[case] _type: T) {
    let container = T::Numbers::default();
    let mut out = 99;
    assert!(!container.pop_into(&mut out));
    assert_eq!(out, 99);

    container.push(1);
    container.push(2);
    assert!(container.pop_into(&mut out));
    assert_eq!(out, if T::FIFO { 1 } else { 2 });

    (0..10).for_each(|i| {
        container.push(i);
    });
    assert_eq!(container.clear(), 11);
    assert_eq!(container.clear(), 0);
    assert_eq!(container.pop(), None);
}

#[rstest]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn deactivated_push_fails_and_pop_drains<T: TestContainer>(#[case] _type: T) {
    let container = T::Numbers::default();
    assert_eq!(container.activity(), Activity::Active);
    assert!(container.push(1));
    assert!(container.push(2));

    container.deactivate();
    assert!(!container.is_active());
    assert_eq!(container.activity(), Activity::Deactivated);
    assert!(!container.push(3));

    assert!(container.pop().is_some());
    assert!(container.pop().is_some());
    assert_eq!(container.pop(), None);

    // deactivation is one-way
    container.deactivate();
    assert!(!container.is_active());
}

#[rstest]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn every_value_dropped_once<T: TestContainer>(#[case] _type: T) {
    let drops = Arc::new(AtomicUsize::new(0));
    let tracked = || Tracked { drops: Arc::clone(&drops) };

    {
        let container = T::Tracking::default();
        for _ in 0..100 {
            container.push(tracked());
        }

        for _ in 0..30 {
            drop(container.pop());
        }
        assert_eq!(drops.load(Ordering::Relaxed), 30);

        assert_eq!(container.clear(), 70);
        assert_eq!(drops.load(Ordering::Relaxed), 100);

        container.deactivate();
        assert!(!container.push(tracked()));
        assert_eq!(drops.load(Ordering::Relaxed), 101);

        for _ in 0..20 {
            container.push(tracked());
        }
    }

    // rejected pushes drop their value right away
    assert_eq!(drops.load(Ordering::Relaxed), 121);
}

#[rstest]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn remaining_values_dropped_with_container<T: TestContainer>(#[case] _type: T) {
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let container = T::Tracking::default();
        for _ in 0..1_000 {
            container.push(Tracked { drops: Arc::clone(&drops) });
        }
    }

    assert_eq!(drops.load(Ordering::Relaxed), 1_000);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// concurrent
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runs `producers` threads pushing `per_producer` values each against
/// `consumers` threads popping until all producers are done, then clears the
/// container and returns `(popped, cleared)`.
fn producer_consumer<C: Container<u64> + Default + 'static>(
    producers: u64,
    consumers: usize,
    per_producer: u64,
) -> (u64, u64) {
    let container = Arc::new(C::default());
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(producers as usize + consumers));

    let producer_handles: Vec<_> = (0..producers)
        .map(|p| {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_producer {
                    assert!(container.push(p * per_producer + i));
                }
            })
        })
        .collect();

    let consumer_handles: Vec<_> = (0..consumers)
        .map(|_| {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                barrier.wait();
                let mut popped = 0u64;
                while !done.load(Ordering::Acquire) {
                    if container.pop().is_some() {
                        popped += 1;
                    }
                }
                popped
            })
        })
        .collect();

    producer_handles.into_iter().for_each(|h| h.join().unwrap());
    done.store(true, Ordering::Release);
    let popped = consumer_handles.into_iter().map(|h| h.join().unwrap()).sum();

    (popped, container.clear() as u64)
}

#[rstest]
#[serial(stress_tests)]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn stress_producer_consumer<T: TestContainer>(#[case] _type: T) {
    let (popped, cleared) = producer_consumer::<T::Numbers>(5, 10, 20_000);
    assert_eq!(popped + cleared, 5 * 20_000);
}

#[rstest]
#[serial(stress_tests)]
#[ignore]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn stress_producer_consumer_full<T: TestContainer>(#[case] _type: T) {
    let (popped, cleared) = producer_consumer::<T::Numbers>(5, 10, 1_000_000);
    assert_eq!(popped + cleared, 5_000_000);
}

#[rstest]
#[serial(stress_tests)]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn stress_deactivation_during_pushes<T: TestContainer>(#[case] _type: T) {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;

    let container = Arc::new(T::Numbers::default());
    let barrier = Arc::new(Barrier::new(PRODUCERS + CONSUMERS + 1));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut pushed = 0u64;
                while container.push(pushed) {
                    pushed += 1;
                }

                // once a push failed, the flag must be observed as deactivated
                assert!(!container.is_active());
                assert!(!container.push(u64::max_value()));
                pushed
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut popped = 0u64;
                while container.is_active() {
                    if container.pop().is_some() {
                        popped += 1;
                    }
                }

                // deactivation is never undone and popping keeps working
                assert!(!container.is_active());
                assert_eq!(container.activity(), Activity::Deactivated);
                for _ in 0..100 {
                    if container.pop().is_some() {
                        popped += 1;
                    }
                    assert!(!container.is_active());
                }
                popped
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(5));
    container.deactivate();

    let pushed: u64 = producers.into_iter().map(|h| h.join().unwrap()).sum();
    let popped: u64 = consumers.into_iter().map(|h| h.join().unwrap()).sum();

    let mut drained = 0;
    while container.pop().is_some() {
        drained += 1;
    }

    assert_eq!(popped + drained, pushed);
    assert_eq!(container.clear(), 0);
}

#[rstest]
#[serial(stress_tests)]
#[case::hazard_pointer_stack(UseHazardPointerStack)]
#[case::ref_count_stack(UseRefCountStack)]
#[case::pop_count_stack(UsePopCountStack)]
#[case::ref_count_queue(UseRefCountQueue)]
#[case::atomic_owned_stack(UseAtomicOwnedStack)]
fn stress_no_value_dropped_twice<T: TestContainer>(#[case] _type: T) {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 5_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let container = Arc::new(T::Tracking::default());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let container = Arc::clone(&container);
            let barrier = Arc::clone(&barrier);
            let drops = Arc::clone(&drops);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    container.push(Tracked { drops: Arc::clone(&drops) });
                    if i % 2 == 0 {
                        drop(container.pop());
                    }
                }
            })
        })
        .collect();

    handles.into_iter().for_each(|h| h.join().unwrap());
    drop(container);

    assert_eq!(drops.load(Ordering::Relaxed), THREADS * PER_THREAD);
}
