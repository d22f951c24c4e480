//! SPSC queue throughput and latency benchmark.
//!
//! Usage:
//!     cargo run --release --bin ring_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use shmring::queue::Queue;
use shmring::shm::{Creator, Opener, ShmRegion};

const REGION_SIZE: u64 = 1 << 24;
const ITERATIONS: u64 = 1 << 22;
const PAYLOAD_SIZE: usize = 32;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn unique_path(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Payload carrying its sequence number in the first 8 bytes.
fn fill_payload(buf: &mut [u8; PAYLOAD_SIZE], seq: u64) {
    buf[..8].copy_from_slice(&seq.to_ne_bytes());
}

fn read_seq(payload: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&payload[..8]);
    u64::from_ne_bytes(bytes)
}

fn bench_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let path = unique_path("shmring-throughput");
    let producer = Queue::new(
        ShmRegion::<Creator>::create(&path, REGION_SIZE)
            .unwrap()
            .into_storage()
            .unwrap(),
    );

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();
    let path_clone = path.clone();

    // Consumer thread with its own mapping, as a second process would have.
    let consumer_thread = std::thread::spawn(move || {
        let consumer = Queue::new(
            ShmRegion::<Opener>::open(&path_clone)
                .unwrap()
                .into_storage()
                .unwrap(),
        );
        pin_to_cpu(consumer_cpu);

        ready_clone.store(true, Ordering::Release);

        for expected in 0..ITERATIONS {
            loop {
                let view = consumer.dequeue_begin();
                if view.is_empty() {
                    hint::spin_loop();
                    continue;
                }
                let seq = read_seq(view.payload());
                if seq != expected {
                    panic!("Data corruption: expected {}, got {}", expected, seq);
                }
                consumer.dequeue_commit(view);
                break;
            }
        }
    });

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    let mut buf = [0u8; PAYLOAD_SIZE];
    for seq in 0..ITERATIONS {
        fill_payload(&mut buf, seq);
        while !producer.enqueue(&buf).unwrap() {
            hint::spin_loop();
        }
    }

    consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("{} ops/ms", ops_per_ms);
}

fn bench_rtt(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let q1_path = unique_path("shmring-q1");
    let q2_path = unique_path("shmring-q2");

    let q1_producer = Queue::new(
        ShmRegion::<Creator>::create(&q1_path, REGION_SIZE)
            .unwrap()
            .into_storage()
            .unwrap(),
    );

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();
    let q1_path_clone = q1_path.clone();
    let q2_path_clone = q2_path.clone();

    // Responder: echoes every message from q1 back on q2.
    let responder = std::thread::spawn(move || {
        let q1_consumer = Queue::new(
            ShmRegion::<Opener>::open(&q1_path_clone)
                .unwrap()
                .into_storage()
                .unwrap(),
        );
        let q2_producer = Queue::new(
            ShmRegion::<Creator>::create(&q2_path_clone, REGION_SIZE)
                .unwrap()
                .into_storage()
                .unwrap(),
        );
        pin_to_cpu(consumer_cpu);

        ready_clone.store(true, Ordering::Release);

        let mut buf = [0u8; PAYLOAD_SIZE];
        for _ in 0..ITERATIONS {
            loop {
                let view = q1_consumer.dequeue_begin();
                if view.is_empty() {
                    hint::spin_loop();
                    continue;
                }
                buf[..view.payload().len()].copy_from_slice(view.payload());
                let len = view.payload().len();
                q1_consumer.dequeue_commit(view);
                while !q2_producer.enqueue(&buf[..len]).unwrap() {
                    hint::spin_loop();
                }
                break;
            }
        }
    });

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    // Open q2 after the responder created it (the ready flag orders this).
    let q2_consumer = Queue::new(
        ShmRegion::<Opener>::open(&q2_path)
            .unwrap()
            .into_storage()
            .unwrap(),
    );

    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    let mut buf = [0u8; PAYLOAD_SIZE];
    for seq in 0..ITERATIONS {
        fill_payload(&mut buf, seq);
        while !q1_producer.enqueue(&buf).unwrap() {
            hint::spin_loop();
        }
        loop {
            let view = q2_consumer.dequeue_begin();
            if view.is_empty() {
                hint::spin_loop();
                continue;
            }
            q2_consumer.dequeue_commit(view);
            break;
        }
    }

    let elapsed = start.elapsed();
    responder.join().unwrap();

    let rtt_ns = elapsed.as_nanos() / ITERATIONS as u128;
    println!("{} ns RTT", rtt_ns);
}

fn main() {
    shmring::trace::init_tracing();
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!(
        "shmring SPSC (region={}, payload={}, iters={}):",
        REGION_SIZE, PAYLOAD_SIZE, ITERATIONS
    );
    bench_throughput(producer_cpu, consumer_cpu);
    bench_rtt(producer_cpu, consumer_cpu);
}
