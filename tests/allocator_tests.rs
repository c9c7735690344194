//! Device memory allocator behaviour through the context pool

mod common;

use common::{sim_fixture, test_config, MIB};
use hipstrom::backend::CompletionMode;
use hipstrom::context::ResourceScope;
use hipstrom::{HipError, StromError};

#[test]
fn test_alloc_then_free_restores_layout() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();

    let keep = ctx.mem_alloc(0, 10_000).unwrap().unwrap();
    let before = ctx.device(0).unwrap().memory().unwrap().layout();

    let ptr = ctx.mem_alloc(0, 3 * 4096).unwrap().unwrap();
    ctx.mem_free(0, ptr).unwrap();

    let after = ctx.device(0).unwrap().memory().unwrap().layout();
    assert_eq!(before, after);
    ctx.mem_free(0, keep).unwrap();
}

#[test]
fn test_sizes_round_to_one_kib() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();
    let a = ctx.mem_alloc(0, 1).unwrap().unwrap();
    let b = ctx.mem_alloc(0, 1025).unwrap().unwrap();
    let c = ctx.mem_alloc(0, 0).unwrap().unwrap();
    assert_eq!(b.raw() - a.raw(), 1024);
    assert_eq!(c.raw() - b.raw(), 2048);
    assert_eq!(ctx.allocator_stats(0).unwrap().active_bytes, 4096);
}

#[test]
fn test_freed_holes_are_reused_without_new_blocks() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();

    let ptrs: Vec<_> = (0..8)
        .map(|_| ctx.mem_alloc(0, 64 * 1024).unwrap().unwrap())
        .collect();
    for ptr in ptrs.iter().step_by(2) {
        ctx.mem_free(0, *ptr).unwrap();
    }
    let raw_before = fx.sim.counters().raw_allocs;

    let again = ctx.mem_alloc(0, 64 * 1024).unwrap().unwrap();
    assert!(ptrs.iter().step_by(2).any(|p| *p == again));
    assert_eq!(fx.sim.counters().raw_allocs, raw_before);
    ctx.device(0).unwrap().memory().unwrap().check_invariants().unwrap();
}

#[test]
fn test_only_one_empty_block_is_cached() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();

    // Eleven 1 MiB chunks per block: two 8 MiB requests need two blocks.
    let a = ctx.mem_alloc(0, 8 * MIB).unwrap().unwrap();
    let b = ctx.mem_alloc(0, 8 * MIB).unwrap().unwrap();
    assert_eq!(fx.sim.counters().raw_allocs, 2);

    ctx.mem_free(0, a).unwrap();
    ctx.mem_free(0, b).unwrap();

    let stats = ctx.allocator_stats(0).unwrap();
    assert_eq!(stats.empty_blocks, 1);
    assert_eq!(stats.active_blocks, 0);
    assert_eq!(stats.raw_frees, 1);
    assert_eq!(fx.sim.counters().raw_frees, 1);

    // The cached block serves the next request.
    ctx.mem_alloc(0, 8 * MIB).unwrap().unwrap();
    assert_eq!(fx.sim.counters().raw_allocs, 2);
}

#[test]
fn test_out_of_memory_is_a_backoff() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    fx.sim.set_memory_limit(0, 12 * MIB);
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();

    let a = ctx.mem_alloc(0, 8 * MIB).unwrap().unwrap();
    assert_eq!(ctx.mem_alloc(0, 8 * MIB).unwrap(), None);
    assert_eq!(ctx.allocator_stats(0).unwrap().backoffs, 1);

    ctx.mem_free(0, a).unwrap();
    assert!(ctx.mem_alloc(0, 8 * MIB).unwrap().is_some());
}

#[test]
fn test_other_driver_errors_are_fatal() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();
    fx.sim
        .fail_next_alloc(HipError::MemoryAllocationFailed("ECC error".into()));
    assert!(ctx.mem_alloc(0, 4096).is_err());
}

#[test]
fn test_request_over_installation_limit() {
    let fx = sim_fixture(2, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();
    let limit = fx.devices.max_alloc_size();
    assert!(limit > 0 && limit % MIB == 0);
    assert!(ctx.mem_alloc(0, limit + 1).is_err());
}

#[test]
fn test_request_near_usize_max_does_not_alias() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();
    let first = ctx.mem_alloc(0, 4096).unwrap().unwrap();
    let err = ctx.mem_alloc(0, usize::MAX - 10).unwrap_err();
    assert!(matches!(err, StromError::AllocationTooLarge { .. }));
    let second = ctx.mem_alloc(0, 4096).unwrap().unwrap();
    assert_ne!(first, second);
    assert_eq!(ctx.allocator_stats(0).unwrap().active_chunks, 2);
}

#[test]
fn test_pool_release_returns_all_device_memory() {
    let fx = sim_fixture(2, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();
    for dev in 0..2 {
        ctx.mem_alloc(dev, 5 * MIB).unwrap().unwrap();
        ctx.mem_alloc(dev, 9 * MIB).unwrap().unwrap();
    }
    assert!(fx.sim.live_allocations() > 0);
    ctx.release();
    assert_eq!(fx.sim.live_allocations(), 0);
    assert_eq!(fx.sim.counters().implicit_frees, 0);
}

#[test]
fn test_mixed_workload_keeps_invariants() {
    let fx = sim_fixture(1, CompletionMode::Inline, test_config());
    let ctx = fx.pool.acquire(ResourceScope(1)).unwrap();

    let mut live = Vec::new();
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for step in 0..400 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        if live.is_empty() || seed % 3 != 0 {
            let bytes = (seed % (2 * MIB as u64)) as usize + 1;
            if let Some(ptr) = ctx.mem_alloc(0, bytes).unwrap() {
                live.push(ptr);
            }
        } else {
            let victim = live.swap_remove((seed as usize / 3) % live.len());
            ctx.mem_free(0, victim).unwrap();
        }
        if step % 20 == 0 {
            ctx.device(0).unwrap().memory().unwrap().check_invariants().unwrap();
        }
    }
    for ptr in live {
        ctx.mem_free(0, ptr).unwrap();
    }
    let head = ctx.device(0).unwrap().memory().unwrap();
    head.check_invariants().unwrap();
    assert_eq!(head.stats().active_chunks, 0);
    assert_eq!(head.stats().active_blocks, 0);
}
