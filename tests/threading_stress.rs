//! Concurrent use of one heap. Only meaningful with the locks compiled in.
#![cfg(feature = "locks")]

use std::{
    sync::{Arc, Barrier},
    thread,
};

use tagpool::{Heap, Tag};

const THREADS: usize = 8;
const ITERATIONS: usize = 5_000;

fn run(heap: &'static Heap, call_site_of: fn(usize) -> Tag) {
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let call_site = call_site_of(i);
                for n in 0..ITERATIONS {
                    let size = 16 + (n * 7 + i) % 512;
                    let p = heap.allocate(call_site, size);
                    assert!(!p.is_null());
                    unsafe {
                        p.write_bytes(i as u8, size);
                        let q = heap.resize(call_site, p, size * 2);
                        assert_eq!(q.read(), i as u8);
                        heap.release(q);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }
}

#[test]
fn threads_sharing_one_call_site() {
    let heap: &'static Heap = Box::leak(Box::new(Heap::with_pool_size(8 << 20)));
    run(heap, |_| 0x99);
    let stats = heap.pool_stats(0x99).unwrap().unwrap();
    assert_eq!(stats.in_use_chunks, 0);
    assert_eq!(stats.free_bytes, stats.capacity);
}

#[test]
fn threads_racing_to_create_pools() {
    let heap: &'static Heap = Box::leak(Box::new(Heap::with_pool_size(8 << 20)));
    // Pairs of threads race for each call site's first allocation
    run(heap, |i| 0x200 + (i / 2) as Tag);
    let bound: Vec<_> = heap.directory().bindings().collect();
    assert_eq!(bound.len(), THREADS / 2);
    for (call_site, pool) in bound {
        assert_eq!(heap.directory().resolve_call_site(pool), call_site);
        let stats = heap.pool_stats(call_site).unwrap().unwrap();
        assert_eq!(stats.free_bytes, stats.capacity);
    }
}
