//! Loom tests for the packed `(generation << 32) | count` handle word.
//!
//! These model the compare-exchange loops the handle table and wrapper
//! records use, outside the table itself.

use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use loom::sync::Arc;

const COUNT_MASK: u64 = 0xFFFF_FFFF;

const fn pack(generation: u32, count: u32) -> u64 {
    ((generation as u64) << 32) | count as u64
}

const fn generation_of(word: u64) -> u32 {
    (word >> 32) as u32
}

const fn count_of(word: u64) -> u32 {
    (word & COUNT_MASK) as u32
}

/// Increment unless the count already hit zero or the generation moved on.
fn try_retain(word: &AtomicU64, generation: u32) -> bool {
    let mut current = word.load(Ordering::Acquire);
    loop {
        if generation_of(current) != generation || count_of(current) == 0 {
            return false;
        }
        match word.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Decrement; returns the count observed before the decrement, or `None`
/// for a stale or already-released handle.
fn release(word: &AtomicU64, generation: u32) -> Option<u32> {
    let mut current = word.load(Ordering::Acquire);
    loop {
        if generation_of(current) != generation || count_of(current) == 0 {
            return None;
        }
        match word.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return Some(count_of(current)),
            Err(actual) => current = actual,
        }
    }
}

/// Exactly one of two concurrent releases observes the last reference.
#[test]
#[ignore = "loom test - run with cargo test loom_ref_count --release -- --ignored"]
fn test_single_disposer() {
    loom::model(|| {
        let word = Arc::new(AtomicU64::new(pack(1, 2)));
        let disposed = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let word = Arc::clone(&word);
                let disposed = Arc::clone(&disposed);
                loom::thread::spawn(move || {
                    if release(&word, 1) == Some(1) {
                        disposed.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(disposed.load(Ordering::Relaxed), 1);
        assert_eq!(count_of(word.load(Ordering::Acquire)), 0);
    });
}

/// A retain racing the final release either wins (and keeps the handle
/// alive) or fails; it never resurrects a zero count.
#[test]
#[ignore = "loom test - run with cargo test loom_ref_count --release -- --ignored"]
fn test_retain_never_resurrects() {
    loom::model(|| {
        let word = Arc::new(AtomicU64::new(pack(1, 1)));

        let retainer = loom::thread::spawn({
            let word = Arc::clone(&word);
            move || try_retain(&word, 1)
        });
        let releaser = loom::thread::spawn({
            let word = Arc::clone(&word);
            move || release(&word, 1)
        });

        let retained = retainer.join().unwrap();
        let before = releaser.join().unwrap();
        let count = count_of(word.load(Ordering::Acquire));

        if retained {
            assert_eq!(count, 1);
            assert!(matches!(before, Some(1 | 2)));
        } else {
            assert_eq!(before, Some(1));
            assert_eq!(count, 0);
        }
    });
}

/// A handle from a previous generation cannot touch the reused slot.
#[test]
#[ignore = "loom test - run with cargo test loom_ref_count --release -- --ignored"]
fn test_reuse_rejects_old_generation() {
    loom::model(|| {
        let word = Arc::new(AtomicU64::new(pack(1, 1)));

        let recycler = loom::thread::spawn({
            let word = Arc::clone(&word);
            move || {
                if release(&word, 1) == Some(1) {
                    word.store(pack(2, 1), Ordering::Release);
                }
            }
        });
        let stale = loom::thread::spawn({
            let word = Arc::clone(&word);
            move || try_retain(&word, 1)
        });

        recycler.join().unwrap();
        let stale_retained = stale.join().unwrap();

        let final_word = word.load(Ordering::Acquire);
        if stale_retained {
            // The stale retain landed before the release; nothing was reused.
            assert_eq!(final_word, pack(1, 1));
        } else {
            assert_eq!(final_word, pack(2, 1));
        }
    });
}
