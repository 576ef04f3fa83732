//! Loom models of the governor's reservation protocol and the handle
//! table's slot publication.
//!
//! These replay the atomic protocols on loom's types, so they check the
//! orderings rather than the crate's code paths.

use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use loom::sync::Arc;

fn try_reserve(allocated: &AtomicUsize, limit: usize, size: usize) -> bool {
    let mut current = allocated.load(Ordering::Acquire);
    loop {
        let free = limit - current.min(limit);
        if size > free {
            return false;
        }
        match allocated.compare_exchange_weak(
            current,
            current + size,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Two racing reservations never push the counter past the limit.
#[test]
#[ignore = "loom test - run with cargo test loom_governor --release -- --ignored"]
fn test_racing_reserves_respect_limit() {
    loom::model(|| {
        let allocated = Arc::new(AtomicUsize::new(0));
        let limit = 10;

        let threads: Vec<_> = [6, 7]
            .into_iter()
            .map(|size| {
                let allocated = Arc::clone(&allocated);
                loom::thread::spawn(move || try_reserve(&allocated, limit, size))
            })
            .collect();
        let won: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(won.iter().filter(|&&w| w).count(), 1);
        let total = allocated.load(Ordering::Acquire);
        assert!(total == 6 || total == 7);
    });
}

/// A reservation racing a release sees either the old or the new total.
#[test]
#[ignore = "loom test - run with cargo test loom_governor --release -- --ignored"]
fn test_reserve_release_race() {
    loom::model(|| {
        let allocated = Arc::new(AtomicUsize::new(8));
        let limit = 10;

        let releaser = {
            let allocated = Arc::clone(&allocated);
            loom::thread::spawn(move || {
                allocated.fetch_sub(5, Ordering::AcqRel);
            })
        };
        let reserved = try_reserve(&allocated, limit, 4);
        releaser.join().unwrap();

        let total = allocated.load(Ordering::Acquire);
        if reserved {
            assert_eq!(total, 7);
        } else {
            assert_eq!(total, 3);
        }
    });
}

/// A scanner that observes a slot as live also observes its referent.
#[test]
#[ignore = "loom test - run with cargo test loom_governor --release -- --ignored"]
fn test_slot_publication() {
    loom::model(|| {
        let referent = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicBool::new(false));

        let creator = {
            let referent = Arc::clone(&referent);
            let live = Arc::clone(&live);
            loom::thread::spawn(move || {
                referent.store(0x1000, Ordering::Release);
                live.swap(true, Ordering::AcqRel);
            })
        };

        if live.load(Ordering::Acquire) {
            assert_eq!(referent.load(Ordering::Acquire), 0x1000);
        }
        creator.join().unwrap();
    });
}
