use std::sync::Mutex;

use candle_core::{Device, Result};
use tracing::{debug, warn};

use super::{
    block_hash::hash_full_blocks, block_pool::BlockPool, block_table::BlockTable,
    cache_engine::KvCacheBuffer, config::CacheConfig,
};
use crate::get_mut_arcmutex;

/// Owns the block pool and the physical cache it indexes.
pub struct CacheManager {
    config: CacheConfig,
    pool: Mutex<BlockPool>,
    kv_cache: KvCacheBuffer,
}

impl CacheManager {
    pub fn new(config: CacheConfig, device: &Device) -> Result<Self> {
        if config.block_nums < 2 || config.seq_size_per_block == 0 {
            candle_core::bail!(
                "cache needs at least 2 blocks and a non-zero block size, got {} blocks of {}",
                config.block_nums,
                config.seq_size_per_block
            );
        }
        let kv_cache = KvCacheBuffer::new(&config, device)?;
        Ok(Self {
            pool: Mutex::new(BlockPool::new(config.block_nums, config.reuse_cache)),
            config,
            kv_cache,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn seq_size_per_block(&self) -> usize {
        self.config.seq_size_per_block
    }

    pub fn kv_cache(&self) -> &KvCacheBuffer {
        &self.kv_cache
    }

    pub fn free_blocks_num(&self) -> usize {
        get_mut_arcmutex!(self.pool).num_free_blocks()
    }

    /// All `n` blocks or none.
    pub fn malloc(&self, n: usize) -> Option<Vec<usize>> {
        let mut pool = get_mut_arcmutex!(self.pool);
        let blocks = pool.get_new_blocks(n);
        match &blocks {
            Some(_) => debug!(
                target: "kvpage::cache",
                "allocated {n} blocks, {} free",
                pool.num_free_blocks()
            ),
            None => warn!(
                target: "kvpage::cache",
                "KV cache exhausted: {n} blocks requested, {} free",
                pool.num_free_blocks()
            ),
        }
        blocks
    }

    pub fn free(&self, blocks: &[usize]) {
        if blocks.is_empty() {
            return;
        }
        let mut pool = get_mut_arcmutex!(self.pool);
        let reversed: Vec<usize> = blocks.iter().rev().copied().collect();
        pool.free_blocks(&reversed);
        debug!(
            target: "kvpage::cache",
            "released {} blocks, {} free",
            blocks.len(),
            pool.num_free_blocks()
        );
    }

    pub fn incr_ref(&self, blocks: &[usize]) {
        get_mut_arcmutex!(self.pool).touch(blocks);
    }

    /// Allocate `n` blocks, reusing cached blocks for the longest hashed prefix of
    /// `tokens`. At least one token is always left to compute.
    ///
    /// Returns the blocks in sequence order and the number of reused tokens.
    pub fn malloc_with_cache(&self, n: usize, tokens: &[u32]) -> Option<(Vec<usize>, usize)> {
        let s = self.config.seq_size_per_block;
        let mut pool = get_mut_arcmutex!(self.pool);
        let mut reused = Vec::new();
        if pool.caching_enabled() && !tokens.is_empty() {
            let usable = &tokens[..tokens.len() - 1];
            for hash in hash_full_blocks(usable, s).into_iter().take(n) {
                match pool.get_cached_block(hash) {
                    Some(id) => reused.push(id),
                    None => break,
                }
            }
        }
        pool.touch(&reused);
        match pool.get_new_blocks(n - reused.len()) {
            Some(fresh) => {
                let reuse_len = reused.len() * s;
                reused.extend(fresh);
                debug!(
                    target: "kvpage::cache",
                    "allocated {n} blocks reusing {reuse_len} cached tokens"
                );
                Some((reused, reuse_len))
            }
            None => {
                pool.free_blocks(&reused);
                warn!(
                    target: "kvpage::cache",
                    "KV cache exhausted: {n} blocks requested, {} free",
                    pool.num_free_blocks()
                );
                None
            }
        }
    }

    /// Publish the full blocks of `tokens` to the prefix cache, then release them.
    pub fn free_with_cache(&self, blocks: &[usize], tokens: &[u32]) {
        {
            let mut pool = get_mut_arcmutex!(self.pool);
            let hashes = hash_full_blocks(tokens, self.config.seq_size_per_block);
            let num_full = hashes.len().min(blocks.len());
            pool.cache_full_blocks(blocks, &hashes, 0, num_full);
        }
        self.free(blocks);
    }

    /// The same blocks at every layer, with scale handles in int8 mode.
    pub fn block_table_from(&self, blocks: &[usize]) -> BlockTable {
        BlockTable::uniform(
            self.config.layer_num,
            blocks,
            self.config.kv_cache_type.has_scale(),
        )
    }

    pub fn block_ref_cnt(&self, block: usize) -> u32 {
        get_mut_arcmutex!(self.pool).block_ref_cnt(block)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::DType;

    use super::*;
    use crate::paged_attention::KvCacheType;

    fn manager(block_nums: usize, reuse_cache: bool) -> CacheManager {
        CacheManager::new(
            CacheConfig {
                layer_num: 2,
                block_nums,
                local_head_num_kv: 1,
                size_per_head: 4,
                seq_size_per_block: 2,
                dtype: DType::F32,
                kv_cache_type: KvCacheType::Auto,
                reuse_cache,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_malloc_free() {
        let m = manager(5, false);
        assert_eq!(m.free_blocks_num(), 4);
        let b = m.malloc(3).unwrap();
        assert!(m.malloc(2).is_none());
        assert_eq!(m.free_blocks_num(), 1);
        m.free(&b);
        assert_eq!(m.free_blocks_num(), 4);
    }

    #[test]
    fn test_reuse_prefix_blocks() {
        let m = manager(9, true);
        let tokens = [1, 2, 3, 4, 5];
        let (first, reused) = m.malloc_with_cache(3, &tokens).unwrap();
        assert_eq!(reused, 0);
        m.free_with_cache(&first, &tokens);

        let (second, reused) = m.malloc_with_cache(3, &[1, 2, 3, 4, 9, 9]).unwrap();
        assert_eq!(reused, 4);
        assert_eq!(&second[..2], &first[..2]);
        assert_eq!(m.block_ref_cnt(second[0]), 1);
    }

    #[test]
    fn test_reuse_leaves_a_token_to_compute() {
        let m = manager(9, true);
        let tokens = [1, 2, 3, 4];
        let (first, _) = m.malloc_with_cache(2, &tokens).unwrap();
        m.free_with_cache(&first, &tokens);
        let (_, reused) = m.malloc_with_cache(2, &tokens).unwrap();
        assert_eq!(reused, 2);
    }

    #[test]
    fn test_failed_cached_malloc_rolls_back() {
        let m = manager(4, true);
        let tokens = [1, 2, 3];
        let (first, _) = m.malloc_with_cache(2, &tokens).unwrap();
        m.free_with_cache(&first, &tokens);
        assert!(m.malloc_with_cache(4, &tokens).is_none());
        assert_eq!(m.free_blocks_num(), 3);
    }

    #[test]
    fn test_block_table_from() {
        let m = manager(4, false);
        let t = m.block_table_from(&[2, 3]);
        assert_eq!(t.layer_num(), 2);
        assert_eq!(t.v_blocks(1), &[2, 3]);
        assert!(!t.has_scale());
    }
}
