//! Command-list pool behavior in regular-list mode

mod common;

use anyhow::Result;
use zeroforge::DevicePtr;

#[test]
fn test_regular_mode_copies_execute() -> Result<()> {
    let rig = common::rig_regular();
    let backend = &rig.backend;
    let queue = backend.active_queue()?;
    let buf = backend.allocate(128)?;

    queue.mem_fill_async(buf, 128, &[0x5a])?;
    let mut host = [0u8; 128];
    queue.mem_copy_async(DevicePtr::from_host_slice_mut(&mut host), buf, 128)?;
    queue.finish()?;

    assert!(host.iter().all(|b| *b == 0x5a));
    backend.free(buf)?;
    Ok(())
}

#[test]
fn test_cmd_list_conservation_at_idle() -> Result<()> {
    let rig = common::rig_regular();
    let backend = &rig.backend;
    let queue = backend.active_queue()?;
    let buf = backend.allocate(512)?;

    for i in 0..20u32 {
        queue.mem_fill_async(buf, 512, &[i as u8])?;
    }
    queue.finish()?;

    let ctx = backend.active_context();
    let stats = ctx.cmd_list_stats();
    assert_eq!(stats.requested, 20);
    assert!(stats.created() >= 1);
    common::wait_until(
        || {
            let stats = ctx.cmd_list_stats();
            stats.available as u64 == stats.created()
        },
        "every acquired list to return to the pool at idle",
    );

    // a second burst reuses the recycled lists
    for i in 0..20u32 {
        queue.mem_fill_async(buf, 512, &[i as u8])?;
    }
    queue.finish()?;

    let stats = ctx.cmd_list_stats();
    assert_eq!(stats.requested, 40);
    assert!(stats.reused > 0, "recycled lists must be reused");
    common::wait_until(
        || {
            let stats = ctx.cmd_list_stats();
            stats.available as u64 == stats.created()
        },
        "lists to return after the second burst",
    );

    backend.free(buf)?;
    Ok(())
}

#[test]
fn test_cmd_lists_shared_across_queues() -> Result<()> {
    let rig = common::rig_regular();
    let backend = &rig.backend;
    let device = backend.active_device();
    let queue_a = backend.active_queue()?;
    let queue_b = device.create_queue(Default::default(), 0, zeroforge::QueueKind::Compute)?;
    let buf = backend.allocate(64)?;

    let ctx = backend.active_context();
    queue_a.mem_fill(buf, 64, &[1])?;
    common::wait_until(
        || ctx.cmd_list_stats().available >= 1,
        "queue A's list to return to the context pool",
    );
    queue_b.mem_fill(buf, 64, &[2])?;
    queue_a.mem_fill(buf, 64, &[3])?;

    let stats = ctx.cmd_list_stats();
    assert_eq!(stats.requested, 3);
    // the pool is context-scoped: the list queue A returned serves queue B
    assert!(stats.reused >= 1);

    backend.free(buf)?;
    Ok(())
}
