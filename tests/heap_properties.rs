//! Allocator-level properties, checked through the public API.

use std::ptr;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tagpool::{get_pool_tag, Heap, Tag, DEFAULT_TAG};

fn heap() -> Box<Heap> {
    let _ = env_logger::builder().is_test(true).try_init();
    Box::new(Heap::with_pool_size(4 << 20))
}

#[test]
fn tag_bijection_over_many_call_sites() {
    let heap = heap();
    let call_sites: Vec<Tag> = (1..200).map(|i| i * 37).collect();
    for &call_site in &call_sites {
        let p = heap.allocate(call_site, 16);
        let pool = heap.directory().resolve_pool(call_site).unwrap();
        assert_eq!(get_pool_tag(p), pool);
    }
    for &call_site in &call_sites {
        let pool = heap.directory().resolve_pool(call_site).unwrap();
        assert_eq!(heap.directory().resolve_call_site(pool), call_site);
    }
}

#[test]
fn default_tag_gets_a_pool_but_no_feedback() {
    let heap = heap();
    let mut map = vec![0u8; 1 << 16];
    unsafe {
        heap.recorder()
            .install(map.as_mut_ptr(), map.len(), Default::default())
    };
    let p = heap.allocate(DEFAULT_TAG, 100);
    assert!(heap.directory().is_bound(get_pool_tag(p)));
    for ret in 0..100 {
        heap.on_dereference(p, ret);
    }
    heap.recorder().uninstall();
    assert!(map.iter().all(|&b| b == 0));
}

#[test]
fn resize_of_null_matches_allocate() {
    let a = heap();
    let b = heap();
    let p = a.allocate(3, 72);
    let q = unsafe { b.resize(3, ptr::null_mut(), 72) };
    // Same layout in two fresh heaps
    assert_eq!(p as usize % (1 << 32), q as usize % (1 << 32));
    assert_eq!(
        a.pool_stats(3).unwrap().unwrap(),
        b.pool_stats(3).unwrap().unwrap()
    );
}

/// Random allocate/resize/release traffic in one pool, checking that every
/// byte of the pool stays accounted for and that live blocks keep their
/// contents.
#[test]
fn random_traffic_conserves_the_pool() {
    let heap = Box::new(Heap::with_pool_size(16 << 20));
    let mut rng = StdRng::seed_from_u64(0x7a9_9001);
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

    for step in 0..5_000 {
        match rng.gen_range(0..10) {
            0..=4 if live.len() < 500 => {
                let size = rng.gen_range(1..2048);
                let p = if rng.gen_bool(0.5) {
                    heap.allocate(9, size)
                } else {
                    heap.zero_allocate(9, 1, size)
                };
                assert!(!p.is_null());
                let fill = rng.gen();
                unsafe { p.write_bytes(fill, size) };
                live.push((p, size, fill));
            }
            5..=6 if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let (p, size, fill) = live[i];
                let new_size = rng.gen_range(1..4096);
                let q = unsafe { heap.resize(9, p, new_size) };
                assert!(!q.is_null());
                let kept = size.min(new_size);
                let bytes = unsafe { std::slice::from_raw_parts(q, kept) };
                assert!(bytes.iter().all(|&b| b == fill), "resize lost data");
                unsafe { q.write_bytes(fill, new_size) };
                live[i] = (q, new_size, fill);
            }
            _ if !live.is_empty() => {
                let (p, size, fill) = live.swap_remove(rng.gen_range(0..live.len()));
                let bytes = unsafe { std::slice::from_raw_parts(p, size) };
                assert!(bytes.iter().all(|&b| b == fill), "block overwritten");
                unsafe { heap.release(p) };
            }
            _ => {}
        }

        if step % 100 == 0 {
            let stats = heap.pool_stats(9).unwrap().unwrap();
            assert_eq!(stats.in_use_bytes + stats.free_bytes, stats.capacity);
            assert_eq!(stats.in_use_chunks, live.len());
        }
    }

    for (p, _, _) in live.drain(..) {
        unsafe { heap.release(p) };
    }
    let stats = heap.pool_stats(9).unwrap().unwrap();
    assert_eq!(stats.free_chunks, 1);
    assert_eq!(stats.free_bytes, stats.capacity);
}

#[test]
fn usable_size_covers_the_request() {
    let heap = heap();
    for size in [1, 15, 16, 17, 100, 4095] {
        let p = heap.allocate(11, size);
        let usable = unsafe { heap.usable_size(p) };
        assert!(usable >= size);
        assert!(usable < size + 32);
        unsafe { heap.release(p) };
    }
}
