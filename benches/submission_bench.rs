//! Submission Throughput Benchmark
//!
//! Measures enqueue throughput of the queue submission engine and event
//! pool recycling over the software driver:
//! - async copy submissions per second (immediate command lists)
//! - async fill submissions per second
//! - event pool growth under sustained load
//!
//! Run with: `cargo bench --bench submission_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use zeroforge::{Backend, BackendConfig, SoftDriver};

const WARMUP: usize = 1_000;
const SUBMISSIONS: usize = 20_000;
const FINISH_INTERVAL: usize = 512;

fn main() {
    let driver = Arc::new(SoftDriver::new());
    let backend =
        Backend::initialize(driver, BackendConfig::default()).expect("backend initialization");
    let queue = backend.active_queue().expect("default queue");
    let dst = backend.allocate(4096).expect("destination buffer");
    let src = backend.allocate(4096).expect("source buffer");

    for _ in 0..WARMUP {
        queue.mem_copy_async(dst, src, 4096).expect("warmup copy");
    }
    queue.finish().expect("warmup finish");

    let start = Instant::now();
    for i in 0..SUBMISSIONS {
        black_box(queue.mem_copy_async(dst, src, 4096).expect("copy submission"));
        if i % FINISH_INTERVAL == FINISH_INTERVAL - 1 {
            queue.finish().expect("periodic finish");
        }
    }
    queue.finish().expect("final finish");
    let copy_elapsed = start.elapsed();

    let start = Instant::now();
    for i in 0..SUBMISSIONS {
        black_box(queue.mem_fill_async(dst, 4096, &[0xab]).expect("fill submission"));
        if i % FINISH_INTERVAL == FINISH_INTERVAL - 1 {
            queue.finish().expect("periodic finish");
        }
    }
    queue.finish().expect("final finish");
    let fill_elapsed = start.elapsed();

    let stats = backend.active_context().event_stats();

    println!("=== Submission Throughput ===");
    println!(
        "async copy: {} submissions in {:?} ({:.0} ops/s)",
        SUBMISSIONS,
        copy_elapsed,
        SUBMISSIONS as f64 / copy_elapsed.as_secs_f64()
    );
    println!(
        "async fill: {} submissions in {:?} ({:.0} ops/s)",
        SUBMISSIONS,
        fill_elapsed,
        SUBMISSIONS as f64 / fill_elapsed.as_secs_f64()
    );
    println!(
        "event pools: {} native events backing {} acquisitions ({} reused)",
        stats.total_capacity(),
        stats.requested,
        stats.reused
    );

    backend.free(dst).expect("free destination");
    backend.free(src).expect("free source");
}
