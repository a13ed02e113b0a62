//! End-to-end scenario 3 (§8): obtaining and releasing many objects in
//! an overlapping pattern never aliases two live references onto the
//! same storage, and a downgraded weak ref cannot resurrect a recycled
//! slot.

use muscle_reactor::ObjectPool;
use std::collections::HashSet;

#[test]
fn overlapping_obtain_release_never_aliases_live_storage() {
    let pool = ObjectPool::<u64>::new("integration-churn", 2);
    let mut held = Vec::new();
    let mut live_ptrs: HashSet<usize> = HashSet::new();

    for round in 0..50u64 {
        for i in 0..20u64 {
            let r = pool.obtain_with(move || round * 1000 + i).unwrap();
            live_ptrs.insert((r.get() as *const u64) as usize);
            held.push(r);
        }
        // Release half of what's held so slabs actually churn.
        for _ in 0..10 {
            if let Some(r) = held.pop() {
                live_ptrs.remove(&((r.get() as *const u64) as usize));
                drop(r);
            }
        }
    }

    assert_eq!(pool.live_count(), held.len());
    while let Some(r) = held.pop() {
        drop(r);
    }
    assert_eq!(pool.live_count(), 0);
}

#[test]
fn weak_ref_does_not_resurrect_after_recycle() {
    let pool = ObjectPool::<String>::new("integration-weak", 0);
    let first = pool.obtain_with(|| "first".to_string()).unwrap();
    let weak = first.downgrade();
    drop(first);

    let _second = pool.obtain_with(|| "second".to_string()).unwrap();
    assert!(weak.upgrade().is_none());
}
