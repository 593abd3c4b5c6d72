//! Event pool growth, conservation and reuse

mod common;

use zeroforge::driver::EventHandle;

#[test]
fn test_pool_capacity_doubles_across_creations() {
    let rig = common::rig();
    let backend = &rig.backend;
    let ctx = backend.active_context();

    // hold 10 events at once; pools must grow 1, 2, 4, 8
    let events: Vec<_> = (0..10).map(|_| backend.create_event().unwrap()).collect();
    let stats = ctx.event_stats();
    let capacities: Vec<usize> = stats.pools.iter().map(|(c, _)| *c).collect();
    assert_eq!(capacities, vec![1, 2, 4, 8]);

    // native handles are distinct while held
    let mut handles: Vec<EventHandle> = events.iter().map(|e| e.handle()).collect();
    handles.sort_by_key(|h| h.0);
    handles.dedup();
    assert_eq!(handles.len(), events.len());
}

#[test]
fn test_pool_conservation() {
    let rig = common::rig();
    let backend = &rig.backend;
    let ctx = backend.active_context();

    let held: Vec<_> = (0..5).map(|_| backend.create_event().unwrap()).collect();
    let stats = ctx.event_stats();
    let free: usize = stats.pools.iter().map(|(_, free)| free).sum();
    assert_eq!(
        stats.total_capacity() - free,
        held.len(),
        "acquired minus returned equals events currently held"
    );

    drop(held);
    common::wait_until(
        || ctx.event_stats().all_full(),
        "every pool to refill once all callers return",
    );
}

#[test]
fn test_event_reuse_is_bounded_by_pool_doubling() {
    let rig = common::rig();
    let backend = &rig.backend;
    let queue = backend.active_queue().unwrap();
    let dst = backend.allocate(64).unwrap();
    let src = backend.allocate(64).unwrap();

    const SUBMISSIONS: u64 = 10_000;
    for i in 0..SUBMISSIONS {
        queue.mem_copy_async(dst, src, 64).unwrap();
        if i % 256 == 255 {
            queue.finish().unwrap();
        }
    }
    queue.finish().unwrap();

    let stats = backend.active_context().event_stats();
    assert_eq!(stats.requested, SUBMISSIONS);
    assert!(stats.reused > 0, "pool recycling must kick in");

    // base * 2^ceil(log2(SUBMISSIONS / base)) with base = 1
    let bound = 1u64 << 14;
    assert!(
        (stats.total_capacity() as u64) <= bound,
        "{} native events exceeds the doubling bound {}",
        stats.total_capacity(),
        bound
    );

    backend.free(dst).unwrap();
    backend.free(src).unwrap();
}

#[test]
fn test_events_return_after_queue_goes_idle() {
    let rig = common::rig();
    let backend = &rig.backend;
    let queue = backend.active_queue().unwrap();
    let buf = backend.allocate(256).unwrap();

    for i in 0..20u32 {
        queue.mem_fill_async(buf, 256, &[i as u8]).unwrap();
    }
    queue.finish().unwrap();

    // only LastEvent may still be held by the queue
    let ctx = backend.active_context();
    common::wait_until(
        || {
            let stats = ctx.event_stats();
            let free: usize = stats.pools.iter().map(|(_, free)| free).sum();
            stats.total_capacity() - free <= 1
        },
        "events to return once the queue goes idle",
    );

    backend.free(buf).unwrap();
}
