//! Paged KV block accounting: a fixed pool of block ids handed out to
//! sequences and shared between prompt-prefix siblings via reference counts.
//! The pool holds no memory itself; block contents live on the device and are
//! addressed through the ids recorded here.

use spate_common::{Result, SpateError};
use spate_engine::BlockId;

pub struct BlockAllocator {
    block_size: usize,
    ref_counts: Vec<u32>,
    // LIFO: recently freed ids are reused first for locality
    free_list: Vec<BlockId>,
}

impl BlockAllocator {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            block_size,
            ref_counts: vec![0; num_blocks],
            free_list: (0..num_blocks as BlockId).rev().collect(),
        }
    }

    /// Size the pool from the device KV budget.
    pub fn from_capacity(capacity_bytes: u64, block_bytes: u64, block_size: usize) -> Self {
        let num_blocks = if block_bytes == 0 { 0 } else { (capacity_bytes / block_bytes) as usize };
        Self::new(num_blocks, block_size)
    }

    pub fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>> {
        if self.free_list.len() < count {
            return Err(SpateError::OutOfBlocks { needed: count, free: self.free_list.len() });
        }
        let mut out = self.free_list.split_off(self.free_list.len() - count);
        out.reverse();
        for &id in &out {
            self.ref_counts[id as usize] = 1;
        }
        Ok(out)
    }

    /// Share every block of `src` with another sequence.
    pub fn fork(&mut self, src: &[BlockId]) -> Vec<BlockId> {
        for &id in src {
            self.ref_counts[id as usize] += 1;
        }
        src.to_vec()
    }

    /// Drop one reference per listed block; blocks reaching zero return to
    /// the free list. No-op on an empty slice.
    pub fn release(&mut self, blocks: &[BlockId]) {
        for &id in blocks {
            let rc = &mut self.ref_counts[id as usize];
            if *rc == 0 {
                tracing::error!(block = id, "release of an already-free block");
                continue;
            }
            *rc -= 1;
            if *rc == 0 {
                self.free_list.push(id);
            }
        }
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.ref_counts.len()
    }

    pub fn num_used(&self) -> usize {
        self.num_total() - self.num_free()
    }

    /// Outstanding references across the pool, i.e. the number of block-table
    /// entries alive anywhere.
    pub fn total_refs(&self) -> usize {
        self.ref_counts.iter().map(|&rc| rc as usize).sum()
    }

    pub fn ref_count(&self, id: BlockId) -> u32 {
        self.ref_counts[id as usize]
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks_for_tokens(&self, tokens: usize) -> usize {
        (tokens + self.block_size - 1) / self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_round_trip() {
        let mut alloc = BlockAllocator::new(4, 16);
        let blocks = alloc.allocate(3).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(alloc.num_free(), 1);
        alloc.release(&blocks);
        assert_eq!(alloc.num_free(), 4);
        assert_eq!(alloc.total_refs(), 0);
    }

    #[test]
    fn allocate_fails_without_partial_grab() {
        let mut alloc = BlockAllocator::new(2, 16);
        let held = alloc.allocate(1).unwrap();
        assert!(matches!(
            alloc.allocate(2),
            Err(SpateError::OutOfBlocks { needed: 2, free: 1 })
        ));
        assert_eq!(alloc.num_free(), 1);
        alloc.release(&held);
    }

    #[test]
    fn lifo_reuse() {
        let mut alloc = BlockAllocator::new(8, 16);
        let a = alloc.allocate(2).unwrap();
        alloc.release(&[a[1]]);
        let b = alloc.allocate(1).unwrap();
        assert_eq!(b[0], a[1]);
    }

    #[test]
    fn fork_shares_until_both_release() {
        let mut alloc = BlockAllocator::new(4, 16);
        let parent = alloc.allocate(2).unwrap();
        let child = alloc.fork(&parent);
        assert_eq!(child, parent);
        assert_eq!(alloc.ref_count(parent[0]), 2);
        assert_eq!(alloc.num_free(), 2);
        alloc.release(&parent);
        assert_eq!(alloc.num_free(), 2);
        alloc.release(&child);
        assert_eq!(alloc.num_free(), 4);
    }

    #[test]
    fn pool_is_sized_by_flooring_capacity() {
        let alloc = BlockAllocator::from_capacity(10_000, 4096, 16);
        assert_eq!(alloc.num_total(), 2);
    }
}
