// ==============================================
// REMATERIALIZATION CONCURRENCY TESTS (integration)
// ==============================================
//
// The engine promises that any number of threads may read, register, and
// enforce concurrently: reads coalesce per pool, the enforcer never takes a
// pool out from under a reader, and counters stay exact across interleaving.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rematkit::prelude::*;

const DEV: DeviceId = DeviceId::new(0);

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine_with_meter() -> (RematEngine<Vec<u8>>, Arc<MeterAllocator>) {
    let meter = Arc::new(MeterAllocator::unbounded());
    let engine = EngineBuilder::new(meter.clone()).build();
    (engine, meter)
}

// ==============================================
// Readers vs. Enforcer
// ==============================================

#[test]
fn readers_always_observe_correct_values_under_churn() {
    init_logs();
    let (engine, _meter) = engine_with_meter();

    let num_readers = 4;
    let rounds = 200;
    let handles: Vec<_> = (0..num_readers as u8)
        .map(|i| {
            engine
                .register_computed(
                    move |_| Ok(vec![i; 64]),
                    &[],
                    vec![i; 64],
                    64,
                    DEV,
                    Duration::from_micros(100),
                )
                .unwrap()
        })
        .collect();
    // Half the working set fits; the enforcer churns constantly.
    engine.set_budget(DEV, 128);

    let barrier = Arc::new(Barrier::new(num_readers + 1));
    let mut workers: Vec<_> = handles
        .iter()
        .enumerate()
        .map(|(i, handle)| {
            let handle = handle.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..rounds {
                    let value = handle.get().unwrap();
                    assert_eq!(value[0], i as u8, "reader must never see another pool's bytes");
                    assert_eq!(value.len(), 64);
                }
            })
        })
        .collect();
    let enforcer = {
        let engine = engine.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..rounds {
                // Exhaustion is expected while readers hold values resident.
                let _ = engine.enforce(DEV);
                thread::yield_now();
            }
        })
    };
    workers.push(enforcer);

    for worker in workers {
        worker.join().unwrap();
    }

    let snapshot = engine.metrics().snapshot();
    assert!(snapshot.remat_count > 0, "churn must have forced rematerializations");
    assert_eq!(snapshot.remat_failure_count, 0);
}

// ==============================================
// Coalescing
// ==============================================

#[test]
fn concurrent_readers_coalesce_each_round() {
    init_logs();
    let (engine, _meter) = engine_with_meter();
    let runs = Arc::new(AtomicU32::new(0));
    let handle = {
        let runs = runs.clone();
        engine
            .register_computed(
                move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    Ok(vec![0xcd; 48])
                },
                &[],
                vec![0xcd; 48],
                48,
                DEV,
                Duration::from_millis(1),
            )
            .unwrap()
    };

    for round in 0..10 {
        handle.pool().evict(EvictMode::Soft);

        let barrier = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    assert_eq!(handle.get().unwrap().len(), 48);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(
            runs.load(Ordering::SeqCst),
            round + 1,
            "every round must run the recompute exactly once"
        );
    }
}

#[test]
fn shared_input_is_recomputed_once_for_parallel_consumers() {
    let (engine, _meter) = engine_with_meter();
    let input_runs = Arc::new(AtomicU32::new(0));
    let a = {
        let runs = input_runs.clone();
        engine
            .register_computed(
                move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    Ok(vec![1u8; 32])
                },
                &[],
                vec![1u8; 32],
                32,
                DEV,
                Duration::from_millis(1),
            )
            .unwrap()
    };
    let consumers: Vec<_> = (1..=2u8)
        .map(|k| {
            engine
                .register_computed(
                    move |inputs: &[Arc<Vec<u8>>]| {
                        Ok(inputs[0].iter().map(|b| b * k).collect())
                    },
                    &[&a],
                    vec![k; 32],
                    32,
                    DEV,
                    Duration::from_millis(1),
                )
                .unwrap()
        })
        .collect();

    a.pool().evict(EvictMode::Soft);
    for consumer in &consumers {
        consumer.pool().evict(EvictMode::Soft);
    }

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = consumers
        .iter()
        .enumerate()
        .map(|(idx, consumer)| {
            let consumer = consumer.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                assert_eq!(*consumer.get().unwrap(), vec![idx as u8 + 1; 32]);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(
        input_runs.load(Ordering::SeqCst),
        1,
        "the shared ancestor must coalesce across both consumers"
    );
}

// ==============================================
// Handle Lifecycle Across Threads
// ==============================================

#[test]
fn cloned_handles_keep_counters_exact() {
    let (engine, meter) = engine_with_meter();
    let handle = engine
        .register_computed(|_| Ok(vec![7u8; 16]), &[], vec![7u8; 16], 16, DEV, Duration::from_millis(1))
        .unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let clone = handle.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    assert_eq!(clone.get().unwrap()[0], 7);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(handle.pool().counters().external, 1, "clones must all be released");
    assert_eq!(handle.pool().counters().locks, 0);
    drop(handle);
    assert_eq!(meter.resident(DEV), 0, "last release must destruct the pool");
}

#[test]
fn parallel_registration_tracks_every_pool() {
    let (engine, _meter) = engine_with_meter();
    let per_thread = 50;

    let workers: Vec<_> = (0..8u8)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| {
                        engine
                            .register_computed(
                                move |_| Ok(vec![t; 10]),
                                &[],
                                vec![t; 10],
                                10,
                                DEV,
                                Duration::from_millis(1),
                            )
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut all_handles = Vec::new();
    for worker in workers {
        all_handles.extend(worker.join().unwrap());
    }

    assert_eq!(engine.pool_count(DEV), 400);
    assert_eq!(engine.resident(DEV), 4000);

    engine.set_budget(DEV, 1000);
    engine.enforce(DEV).unwrap();
    assert!(engine.resident(DEV) <= 1000);
    drop(all_handles);
    assert_eq!(engine.resident(DEV), 0);
}
