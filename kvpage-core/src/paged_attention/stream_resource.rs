use std::sync::Arc;

use tracing::{debug, warn};

use super::{batch_addr::BatchBlockAddressing, block_table::BlockTable, cache_manager::CacheManager};

/// A cached prompt prefix whose full blocks are shared by reference count.
#[derive(Clone, Debug)]
pub struct PromptPrefix {
    pub token_ids: Vec<u32>,
    pub blocks: BlockTable,
    /// Tokens covered by `blocks`, a multiple of the block size.
    pub prefix_length: usize,
}

impl PromptPrefix {
    /// Keep only the blocks that are completely filled by `token_ids`.
    pub fn new(token_ids: Vec<u32>, mut blocks: BlockTable, seq_size_per_block: usize) -> Self {
        let full = (token_ids.len() / seq_size_per_block.max(1)).min(blocks.block_num());
        blocks.truncate(full);
        Self {
            prefix_length: full * seq_size_per_block,
            token_ids,
            blocks,
        }
    }
}

/// Prompt prefixes precomputed into the cache at startup.
#[derive(Clone, Debug, Default)]
pub struct SystemPrompt {
    prefixes: Vec<PromptPrefix>,
}

impl SystemPrompt {
    pub fn new(prefixes: Vec<PromptPrefix>) -> Self {
        Self { prefixes }
    }

    pub fn insert(&mut self, prefix: PromptPrefix) {
        self.prefixes.push(prefix);
    }

    /// The longest prefix whose tokens start `tokens` and leave at least one
    /// token of `tokens` to compute.
    pub fn match_prefix(&self, tokens: &[u32]) -> Option<&PromptPrefix> {
        self.prefixes
            .iter()
            .filter(|p| {
                p.prefix_length > 0
                    && p.prefix_length < tokens.len()
                    && tokens.starts_with(&p.token_ids[..p.prefix_length])
            })
            .max_by_key(|p| p.prefix_length)
    }
}

#[derive(Clone)]
pub struct ResourceContext {
    pub cache_manager: Arc<CacheManager>,
    pub system_prompt: Option<Arc<SystemPrompt>>,
    pub reuse_cache: bool,
}

/// What the owning stream tells its cache resource.
#[derive(Clone, Debug, Default)]
pub struct StreamInfo {
    /// Rows of the stream (beams or return sequences), each with its own table.
    pub batch_size: usize,
    pub seq_len: usize,
    pub token_ids: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Unallocated,
    Allocated,
    Releasing,
    Released,
}

/// KV blocks owned by one generation stream.
pub struct StreamCacheResource {
    kv_cache: BatchBlockAddressing,
    stream: StreamInfo,
    context: ResourceContext,
    need_release_resource: bool,
    state: ResourceState,
    reuse_length: usize,
    fallback_prefix_length: usize,
}

impl StreamCacheResource {
    pub fn new(stream: StreamInfo, context: ResourceContext, need_release_resource: bool) -> Self {
        Self {
            kv_cache: BatchBlockAddressing::new(),
            stream,
            context,
            need_release_resource,
            state: ResourceState::Unallocated,
            reuse_length: 0,
            fallback_prefix_length: 0,
        }
    }

    fn manager(&self) -> &CacheManager {
        &self.context.cache_manager
    }

    /// Block-cache reuse is only done for single-row streams.
    fn block_cache_reuse(&self) -> bool {
        self.context.reuse_cache && self.stream.batch_size <= 1
    }

    /// Attach reusable prefix blocks and allocate the rest of the prompt for every
    /// row. Returns false, leaving no blocks held, when the pool is exhausted.
    pub fn init_kv_block(&mut self) -> bool {
        assert_eq!(
            self.state,
            ResourceState::Unallocated,
            "init_kv_block on a stream resource in state {:?}",
            self.state
        );
        let rows = self.stream.batch_size.max(1);
        if self.context.reuse_cache && rows > 1 {
            warn!(
                target: "kvpage::cache",
                "Prefix cache reuse is disabled for a stream with {rows} rows."
            );
        }

        let prefix = self
            .context
            .system_prompt
            .as_ref()
            .and_then(|sp| sp.match_prefix(&self.stream.token_ids))
            .cloned();

        if prefix.is_none() && self.block_cache_reuse() {
            let need = self.stream.seq_len.div_ceil(self.seq_size_per_block());
            let Some((blocks, reuse_len)) = self
                .manager()
                .malloc_with_cache(need, &self.stream.token_ids)
            else {
                return false;
            };
            let table = self.manager().block_table_from(&blocks);
            self.kv_cache.clear();
            self.kv_cache.add_sequence(table);
            self.reuse_length = reuse_len;
            self.state = ResourceState::Allocated;
            return true;
        }

        let (prefix_table, prefix_ids, prefix_length) = match &prefix {
            Some(p) => (
                p.blocks.clone(),
                p.blocks.k_blocks(0).to_vec(),
                p.prefix_length,
            ),
            None => (BlockTable::default(), Vec::new(), 0),
        };
        for _ in 0..rows {
            self.manager().incr_ref(&prefix_ids);
        }

        let single = self
            .stream
            .seq_len
            .div_ceil(self.seq_size_per_block())
            .saturating_sub(prefix_table.block_num());
        let Some(fresh) = self.manager().malloc(single * rows) else {
            for _ in 0..rows {
                self.manager().free(&prefix_ids);
            }
            return false;
        };

        self.kv_cache.clear();
        for row in 0..rows {
            let mut table = prefix_table.clone();
            table.append(
                &self
                    .manager()
                    .block_table_from(&fresh[row * single..(row + 1) * single]),
            );
            self.kv_cache.add_sequence(table);
        }
        self.reuse_length = prefix_length;
        self.state = ResourceState::Allocated;
        debug!(
            target: "kvpage::cache",
            "stream initialized: {rows} rows, {single} new blocks each, {prefix_length} prefix tokens"
        );
        true
    }

    /// Grow every row to cover `seq_len`. All or nothing.
    pub fn incr_kv_block(&mut self) -> bool {
        assert_eq!(
            self.state,
            ResourceState::Allocated,
            "incr_kv_block on a stream resource in state {:?}",
            self.state
        );
        let single = self.single_batch_need_blocks();
        let need = self.need_kv_cache_block_nums();
        if need == 0 {
            return true;
        }
        let Some(fresh) = self.manager().malloc(need) else {
            return false;
        };
        let rows = self.stream.batch_size.max(1);
        while self.kv_cache.len() < rows {
            self.kv_cache.add_sequence(BlockTable::default());
        }
        for row in 0..rows {
            let table = self
                .manager()
                .block_table_from(&fresh[row * single..(row + 1) * single]);
            self.kv_cache.append(row, &table);
        }
        true
    }

    /// Free up to `nums` trailing blocks of every row. Returns how many blocks a
    /// row gave back.
    pub fn try_release_kv_block(&mut self, nums: usize) -> usize {
        let mut released = 0;
        let mut to_free = Vec::new();
        for row in 0..self.kv_cache.len() {
            let popped = self.kv_cache.table_mut(row).pop_back(nums);
            if let Some(ids) = popped.into_iter().next() {
                released = released.max(ids.len());
                to_free.extend(ids);
            }
        }
        self.manager().free(&to_free);
        self.fallback_prefix_length = self.max_block_size() * self.seq_size_per_block();
        self.reuse_length = self.reuse_length.min(self.fallback_prefix_length);
        released
    }

    /// Return specific blocks of one row to the pool. Each id must be held by
    /// that row; repeated ids are freed once.
    pub fn free_batch_blocks(&mut self, batch_slot: usize, blocks: &[usize]) {
        let mut ids = blocks.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let table = self.kv_cache.table_mut(batch_slot);
        let held = if table.layer_num() == 0 {
            &[][..]
        } else {
            table.k_blocks(0)
        };
        if let Some(id) = ids.iter().find(|id| !held.contains(id)) {
            panic!("free_batch_blocks: block {id} is not held by row {batch_slot}");
        }
        table.remove_blocks(&ids);
        self.manager().free(&ids);
    }

    /// Give every block back to the pool. Safe to call more than once.
    pub fn release_resource(&mut self) {
        if matches!(
            self.state,
            ResourceState::Releasing | ResourceState::Released
        ) {
            return;
        }
        self.state = ResourceState::Releasing;
        if self.need_release_resource {
            let cache_reuse = self.block_cache_reuse();
            for table in self.kv_cache.tables() {
                if table.layer_num() == 0 {
                    continue;
                }
                let ids = table.k_blocks(0);
                if cache_reuse {
                    self.manager().free_with_cache(ids, &self.stream.token_ids);
                } else {
                    self.manager().free(ids);
                }
            }
        }
        self.kv_cache.clear();
        self.state = ResourceState::Released;
    }

    pub fn need_kv_cache_block_nums(&self) -> usize {
        self.single_batch_need_blocks() * self.stream.batch_size.max(1)
    }

    pub fn single_batch_need_blocks(&self) -> usize {
        self.stream
            .seq_len
            .div_ceil(self.seq_size_per_block())
            .saturating_sub(self.max_block_size())
    }

    pub fn max_block_size(&self) -> usize {
        self.kv_cache
            .tables()
            .iter()
            .map(BlockTable::block_num)
            .max()
            .unwrap_or(0)
    }

    pub fn seq_size_per_block(&self) -> usize {
        self.manager().seq_size_per_block()
    }

    pub fn kv_cache(&self) -> &BatchBlockAddressing {
        &self.kv_cache
    }

    pub fn set_kv_cache(&mut self, kv_cache: BatchBlockAddressing) {
        self.kv_cache = kv_cache;
    }

    pub fn resource_context(&self) -> &ResourceContext {
        &self.context
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream
    }

    /// Prompt tokens whose K/V came from the cache instead of being computed.
    pub fn reuse_length(&self) -> usize {
        self.reuse_length
    }

    /// Tokens still backed by blocks after the last `try_release_kv_block`.
    pub fn fallback_prefix_length(&self) -> usize {
        self.fallback_prefix_length
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn set_seq_len(&mut self, seq_len: usize) {
        self.stream.seq_len = seq_len;
    }

    pub fn update_tokens(&mut self, new_tokens: &[u32]) {
        self.stream.token_ids.extend_from_slice(new_tokens);
        self.stream.seq_len = self.stream.token_ids.len();
    }
}

impl Drop for StreamCacheResource {
    fn drop(&mut self) {
        self.release_resource();
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;
    use crate::paged_attention::{CacheConfig, KvCacheType};

    fn context(block_nums: usize, reuse_cache: bool) -> ResourceContext {
        ResourceContext {
            cache_manager: Arc::new(
                CacheManager::new(
                    CacheConfig {
                        layer_num: 2,
                        block_nums,
                        local_head_num_kv: 1,
                        size_per_head: 4,
                        seq_size_per_block: 4,
                        dtype: DType::F32,
                        kv_cache_type: KvCacheType::Auto,
                        reuse_cache,
                    },
                    &Device::Cpu,
                )
                .unwrap(),
            ),
            system_prompt: None,
            reuse_cache,
        }
    }

    fn stream(batch_size: usize, seq_len: usize) -> StreamInfo {
        StreamInfo {
            batch_size,
            seq_len,
            token_ids: (0..seq_len as u32).collect(),
        }
    }

    #[test]
    fn test_need_blocks() {
        let mut r = StreamCacheResource::new(stream(2, 9), context(16, false), true);
        assert_eq!(r.single_batch_need_blocks(), 3);
        assert_eq!(r.need_kv_cache_block_nums(), 6);
        assert!(r.init_kv_block());
        assert_eq!(r.single_batch_need_blocks(), 0);
        r.set_seq_len(12);
        assert_eq!(r.need_kv_cache_block_nums(), 0);
        r.set_seq_len(13);
        assert_eq!(r.need_kv_cache_block_nums(), 2);
    }

    #[test]
    fn test_init_and_release() {
        let ctx = context(16, false);
        let manager = ctx.cache_manager.clone();
        let mut r = StreamCacheResource::new(stream(2, 9), ctx, true);
        assert_eq!(r.state(), ResourceState::Unallocated);
        assert!(r.init_kv_block());
        assert_eq!(r.state(), ResourceState::Allocated);
        assert_eq!(r.kv_cache().len(), 2);
        assert_eq!(r.kv_cache().table(1).block_num(), 3);
        assert_eq!(manager.free_blocks_num(), 15 - 6);

        r.release_resource();
        assert_eq!(r.state(), ResourceState::Released);
        assert_eq!(manager.free_blocks_num(), 15);
        r.release_resource();
        assert_eq!(manager.free_blocks_num(), 15);
    }

    #[test]
    fn test_init_is_atomic_on_exhaustion() {
        let ctx = context(5, false);
        let manager = ctx.cache_manager.clone();
        let mut r = StreamCacheResource::new(stream(2, 9), ctx, true);
        assert!(!r.init_kv_block());
        assert!(r.kv_cache().is_empty());
        assert_eq!(manager.free_blocks_num(), 4);
    }

    #[test]
    #[should_panic(expected = "init_kv_block on a stream resource")]
    fn test_double_init_panics() {
        let mut r = StreamCacheResource::new(stream(1, 4), context(8, false), true);
        assert!(r.init_kv_block());
        r.init_kv_block();
    }

    #[test]
    fn test_incr_is_all_or_nothing() {
        let ctx = context(6, false);
        let manager = ctx.cache_manager.clone();
        let mut r = StreamCacheResource::new(stream(2, 4), ctx, true);
        assert!(r.init_kv_block());
        assert_eq!(manager.free_blocks_num(), 3);
        r.set_seq_len(5);
        assert!(r.incr_kv_block());
        assert_eq!(r.kv_cache().table(0).block_num(), 2);
        r.set_seq_len(9);
        assert!(!r.incr_kv_block());
        assert_eq!(manager.free_blocks_num(), 1);
        assert_eq!(r.kv_cache().table(1).block_num(), 2);
        r.set_seq_len(8);
        assert!(r.incr_kv_block());
    }

    #[test]
    fn test_try_release() {
        let ctx = context(16, false);
        let manager = ctx.cache_manager.clone();
        let mut r = StreamCacheResource::new(stream(1, 12), ctx, true);
        assert!(r.init_kv_block());
        assert_eq!(r.try_release_kv_block(2), 2);
        assert_eq!(r.fallback_prefix_length(), 4);
        assert_eq!(manager.free_blocks_num(), 14);
        assert_eq!(r.try_release_kv_block(5), 1);
        assert_eq!(r.max_block_size(), 0);
    }

    #[test]
    fn test_free_batch_blocks() {
        let ctx = context(16, false);
        let manager = ctx.cache_manager.clone();
        let mut r = StreamCacheResource::new(stream(1, 8), ctx, true);
        assert!(r.init_kv_block());
        let last = r.kv_cache().table(0).k_blocks(0)[1];
        r.free_batch_blocks(0, &[last]);
        assert_eq!(r.kv_cache().table(0).block_num(), 1);
        assert_eq!(manager.free_blocks_num(), 14);
    }

    #[test]
    #[should_panic(expected = "incr_kv_block on a stream resource in state Released")]
    fn test_incr_after_release_panics() {
        let ctx = context(16, false);
        let manager = ctx.cache_manager.clone();
        let mut r = StreamCacheResource::new(stream(1, 8), ctx, true);
        assert!(r.init_kv_block());
        r.release_resource();
        assert_eq!(manager.free_blocks_num(), 15);
        r.set_seq_len(9);
        r.incr_kv_block();
    }

    #[test]
    #[should_panic(expected = "incr_kv_block on a stream resource in state Unallocated")]
    fn test_incr_before_init_panics() {
        let mut r = StreamCacheResource::new(stream(1, 8), context(16, false), true);
        r.incr_kv_block();
    }

    #[test]
    fn test_free_batch_blocks_leaves_other_streams_alone() {
        let ctx = context(16, false);
        let manager = ctx.cache_manager.clone();
        let mut a = StreamCacheResource::new(stream(1, 8), ctx.clone(), true);
        let mut b = StreamCacheResource::new(stream(1, 8), ctx, true);
        assert!(a.init_kv_block());
        assert!(b.init_kv_block());
        let a_last = a.kv_cache().table(0).k_blocks(0)[1];
        let b_blocks = b.kv_cache().table(0).k_blocks(0).to_vec();

        a.free_batch_blocks(0, &[a_last, a_last]);
        assert_eq!(a.kv_cache().table(0).block_num(), 1);
        assert_eq!(manager.block_ref_cnt(a_last), 0);
        assert_eq!(manager.free_blocks_num(), 15 - 3);
        assert!(b_blocks.iter().all(|&id| manager.block_ref_cnt(id) == 1));

        let foreign = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            a.free_batch_blocks(0, &[b_blocks[0]])
        }));
        assert!(foreign.is_err());
        assert_eq!(manager.block_ref_cnt(b_blocks[0]), 1);
        assert_eq!(a.kv_cache().table(0).block_num(), 1);
        assert_eq!(b.kv_cache().table(0).k_blocks(0), b_blocks.as_slice());
    }

    #[test]
    fn test_drop_releases() {
        let ctx = context(8, false);
        let manager = ctx.cache_manager.clone();
        {
            let mut r = StreamCacheResource::new(stream(1, 8), ctx, true);
            assert!(r.init_kv_block());
            assert_eq!(manager.free_blocks_num(), 5);
        }
        assert_eq!(manager.free_blocks_num(), 7);
    }

    #[test]
    fn test_no_release_resource_keeps_blocks() {
        let ctx = context(8, false);
        let manager = ctx.cache_manager.clone();
        let blocks = manager.malloc(1).unwrap();
        let mut r = StreamCacheResource::new(stream(1, 4), ctx, false);
        r.set_kv_cache({
            let mut b = BatchBlockAddressing::new();
            b.add_sequence(manager.block_table_from(&blocks));
            b
        });
        r.release_resource();
        assert!(r.kv_cache().is_empty());
        assert_eq!(manager.block_ref_cnt(blocks[0]), 1);
    }

    #[test]
    fn test_system_prompt_shared_by_refcount() {
        let mut ctx = context(16, false);
        let manager = ctx.cache_manager.clone();
        let prompt_blocks = manager.malloc(2).unwrap();
        let prompt_tokens: Vec<u32> = (0..9).collect();
        ctx.system_prompt = Some(Arc::new(SystemPrompt::new(vec![PromptPrefix::new(
            prompt_tokens,
            manager.block_table_from(&prompt_blocks),
            4,
        )])));

        let mut r = StreamCacheResource::new(stream(2, 10), ctx, true);
        assert!(r.init_kv_block());
        assert_eq!(r.reuse_length(), 8);
        for row in 0..2 {
            let table = r.kv_cache().table(row);
            assert_eq!(table.block_num(), 3);
            assert_eq!(&table.k_blocks(1)[..2], prompt_blocks.as_slice());
        }
        assert_eq!(manager.block_ref_cnt(prompt_blocks[0]), 3);
        drop(r);
        assert_eq!(manager.block_ref_cnt(prompt_blocks[0]), 1);
    }

    #[test]
    fn test_block_cache_reuse() {
        let ctx = context(16, true);
        let manager = ctx.cache_manager.clone();
        let mut first = StreamCacheResource::new(stream(1, 9), ctx.clone(), true);
        assert!(first.init_kv_block());
        let first_blocks = first.kv_cache().table(0).k_blocks(0).to_vec();
        drop(first);

        let mut second = StreamCacheResource::new(stream(1, 10), ctx, true);
        assert!(second.init_kv_block());
        assert_eq!(second.reuse_length(), 8);
        assert_eq!(
            &second.kv_cache().table(0).k_blocks(0)[..2],
            &first_blocks[..2]
        );
        assert_eq!(manager.block_ref_cnt(first_blocks[0]), 1);
    }
}
