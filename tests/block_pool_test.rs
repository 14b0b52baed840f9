//! Integration tests for BlockPool.

use nano_kvsched::core::block_pool::{BlockPool, RESERVED_BLOCK_ID};
use nano_kvsched::Error;

#[test]
fn test_pool_creation() {
    let pool = BlockPool::new(100);
    assert_eq!(pool.total_blocks(), 100);
    assert_eq!(pool.usable_blocks(), 99);
    assert_eq!(pool.free_block_nums(), 99);
    assert_eq!(pool.used_block_nums(), 0);
}

#[test]
fn test_malloc_and_free() {
    let mut pool = BlockPool::new(10);

    let blocks = pool.malloc(5).unwrap();
    assert_eq!(blocks.len(), 5);
    assert_eq!(pool.free_block_nums(), 4);
    assert_eq!(pool.used_block_nums(), 5);
    for &id in &blocks {
        assert_eq!(pool.ref_count(id), Some(1));
    }

    assert_eq!(pool.free(&blocks), 5);
    assert_eq!(pool.free_block_nums(), 9);
}

#[test]
fn test_out_of_blocks() {
    let mut pool = BlockPool::new(3);
    pool.malloc(2).unwrap();

    assert!(matches!(
        pool.malloc(1),
        Err(Error::InsufficientMemory { requested: 1, free: 0 })
    ));
}

#[test]
fn test_no_over_allocation() {
    let mut pool = BlockPool::new(8);
    let mut held = Vec::new();

    while let Ok(mut blocks) = pool.malloc(2) {
        held.append(&mut blocks);
    }

    held.sort_unstable();
    held.dedup();
    assert_eq!(held.len(), 6);
    assert!(!held.contains(&RESERVED_BLOCK_ID));
    assert_eq!(pool.free_block_nums(), 1);
}

#[test]
fn test_conservation_under_sharing() {
    let mut pool = BlockPool::new(6);
    let a = pool.malloc(3).unwrap();
    pool.increment_ref(a[0]).unwrap();
    pool.increment_ref(a[1]).unwrap();

    assert_eq!(pool.free(&a), 1);
    assert_eq!(pool.free_block_nums() + pool.used_block_nums(), pool.usable_blocks());
    assert!(pool.check_consistency().is_ok());

    assert_eq!(pool.free(&a[..2]), 2);
    assert_eq!(pool.free_block_nums(), 5);
}

#[test]
fn test_release_of_reserved_block_ignored() {
    let mut pool = BlockPool::new(4);
    assert_eq!(pool.free(&[RESERVED_BLOCK_ID, 42]), 0);
    assert_eq!(pool.free_block_nums(), 3);
    assert!(pool.check_consistency().is_ok());
}
