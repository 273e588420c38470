//! Physical block allocator of the paged KV cache.
//!
//! Free blocks are threaded through an intrusive doubly-linked list so that
//! allocation pops the least recently freed block, freeing appends to the tail,
//! and a prefix-cache hit can pull a block out of the middle, all in O(1).
//! A freed block keeps its content hash until it is handed out again.

use std::collections::HashMap;

use super::block_hash::BlockHash;

const NO_LINK: usize = usize::MAX;

#[derive(Debug)]
struct PoolBlock {
    ref_cnt: u32,
    block_hash: Option<BlockHash>,
    prev_free: usize,
    next_free: usize,
    is_null: bool,
}

impl PoolBlock {
    fn new() -> Self {
        Self {
            ref_cnt: 0,
            block_hash: None,
            prev_free: NO_LINK,
            next_free: NO_LINK,
            is_null: false,
        }
    }
}

/// Free list with sentinel head and tail stored at the end of the block array.
struct FreeList {
    len: usize,
    head: usize,
    tail: usize,
}

impl FreeList {
    fn new(blocks: &mut [PoolBlock], ids: &[usize], head: usize, tail: usize) -> Self {
        let mut prev = head;
        for &id in ids {
            blocks[prev].next_free = id;
            blocks[id].prev_free = prev;
            prev = id;
        }
        blocks[prev].next_free = tail;
        blocks[tail].prev_free = prev;
        Self {
            len: ids.len(),
            head,
            tail,
        }
    }

    fn pop_front(&mut self, blocks: &mut [PoolBlock]) -> Option<usize> {
        let first = blocks[self.head].next_free;
        if first == self.tail {
            return None;
        }
        self.remove(blocks, first);
        Some(first)
    }

    fn remove(&mut self, blocks: &mut [PoolBlock], id: usize) {
        let (prev, next) = (blocks[id].prev_free, blocks[id].next_free);
        debug_assert!(
            prev != NO_LINK && next != NO_LINK,
            "block {id} is not in the free list"
        );
        blocks[prev].next_free = next;
        blocks[next].prev_free = prev;
        blocks[id].prev_free = NO_LINK;
        blocks[id].next_free = NO_LINK;
        self.len -= 1;
    }

    fn push_back(&mut self, blocks: &mut [PoolBlock], id: usize) {
        let last = blocks[self.tail].prev_free;
        blocks[last].next_free = id;
        blocks[id].prev_free = last;
        blocks[id].next_free = self.tail;
        blocks[self.tail].prev_free = id;
        self.len += 1;
    }
}

/// Hash to block lookup. Duplicate inserts of one hash keep every block id.
#[derive(Default)]
struct HashIndex {
    map: HashMap<BlockHash, Cached>,
}

enum Cached {
    Single(usize),
    Multiple(Vec<usize>),
}

impl HashIndex {
    fn get(&self, key: &BlockHash) -> Option<usize> {
        match self.map.get(key)? {
            Cached::Single(id) => Some(*id),
            Cached::Multiple(ids) => ids.first().copied(),
        }
    }

    fn insert(&mut self, key: BlockHash, id: usize) {
        match self.map.remove(&key) {
            None => {
                self.map.insert(key, Cached::Single(id));
            }
            Some(Cached::Single(existing)) => {
                self.map.insert(key, Cached::Multiple(vec![existing, id]));
            }
            Some(Cached::Multiple(mut ids)) => {
                ids.push(id);
                self.map.insert(key, Cached::Multiple(ids));
            }
        }
    }

    fn remove(&mut self, key: &BlockHash, id: usize) {
        match self.map.remove(key) {
            Some(Cached::Single(existing)) if existing != id => {
                self.map.insert(*key, Cached::Single(existing));
            }
            Some(Cached::Multiple(mut ids)) => {
                ids.retain(|&b| b != id);
                match ids.as_slice() {
                    [] => {}
                    [only] => {
                        self.map.insert(*key, Cached::Single(*only));
                    }
                    _ => {
                        self.map.insert(*key, Cached::Multiple(ids));
                    }
                }
            }
            _ => {}
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Reference-counted pool of `num_blocks` physical blocks. Block 0 is the null
/// block and is never handed out.
pub struct BlockPool {
    blocks: Vec<PoolBlock>,
    free: FreeList,
    index: HashIndex,
    enable_caching: bool,
    num_blocks: usize,
    null_block_id: usize,
}

impl BlockPool {
    pub fn new(num_blocks: usize, enable_caching: bool) -> Self {
        assert!(num_blocks > 0, "a block pool needs at least the null block");
        let head = num_blocks;
        let tail = num_blocks + 1;
        let mut blocks: Vec<PoolBlock> = (0..num_blocks + 2).map(|_| PoolBlock::new()).collect();
        let ids: Vec<usize> = (0..num_blocks).collect();
        let mut free = FreeList::new(&mut blocks, &ids, head, tail);

        // The first block popped becomes the null block, so its id is 0.
        let null_block_id = free.pop_front(&mut blocks).unwrap_or(0);
        blocks[null_block_id].is_null = true;

        Self {
            blocks,
            free,
            index: HashIndex::default(),
            enable_caching,
            num_blocks,
            null_block_id,
        }
    }

    pub fn null_block_id(&self) -> usize {
        self.null_block_id
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free.len
    }

    /// Physical blocks including the null block.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn caching_enabled(&self) -> bool {
        self.enable_caching
    }

    /// Fraction of allocatable blocks in use.
    pub fn usage(&self) -> f64 {
        let total = self.num_blocks - 1;
        if total == 0 {
            return 0.0;
        }
        1.0 - self.num_free_blocks() as f64 / total as f64
    }

    /// Pop `n` blocks with a reference count of 1, or `None` without side effects
    /// when fewer than `n` are free.
    pub fn get_new_blocks(&mut self, n: usize) -> Option<Vec<usize>> {
        if n > self.free.len {
            return None;
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.free.pop_front(&mut self.blocks)?;
            if let Some(hash) = self.blocks[id].block_hash.take() {
                self.index.remove(&hash, id);
            }
            debug_assert_eq!(self.blocks[id].ref_cnt, 0);
            self.blocks[id].ref_cnt = 1;
            out.push(id);
        }
        Some(out)
    }

    /// Drop one reference of each block. Blocks reaching zero go to the tail of the
    /// free list in the given order, so pass a sequence's blocks in reverse to evict
    /// its tail first.
    pub fn free_blocks(&mut self, ids: &[usize]) {
        for &id in ids {
            debug_assert!(self.blocks[id].ref_cnt > 0, "double free of block {id}");
            self.blocks[id].ref_cnt = self.blocks[id].ref_cnt.saturating_sub(1);
        }
        for &id in ids {
            let block = &self.blocks[id];
            if block.ref_cnt == 0 && !block.is_null && block.next_free == NO_LINK {
                self.free.push_back(&mut self.blocks, id);
            }
        }
    }

    /// Add one reference to each block, reviving cached blocks from the free list.
    pub fn touch(&mut self, ids: &[usize]) {
        for &id in ids {
            if self.blocks[id].ref_cnt == 0 && !self.blocks[id].is_null {
                self.free.remove(&mut self.blocks, id);
            }
            self.blocks[id].ref_cnt += 1;
        }
    }

    /// Register blocks `num_cached..num_full` of a stream under their hashes.
    pub fn cache_full_blocks(
        &mut self,
        block_ids: &[usize],
        block_hashes: &[BlockHash],
        num_cached: usize,
        num_full: usize,
    ) {
        if !self.enable_caching || num_cached >= num_full {
            return;
        }
        assert!(
            block_hashes.len() >= num_full && block_ids.len() >= num_full,
            "{num_full} full blocks but {} hashes and {} ids",
            block_hashes.len(),
            block_ids.len()
        );
        for idx in num_cached..num_full {
            let id = block_ids[idx];
            let block = &mut self.blocks[id];
            if block.is_null || block.block_hash.is_some() {
                continue;
            }
            block.block_hash = Some(block_hashes[idx]);
            self.index.insert(block_hashes[idx], id);
        }
    }

    pub fn get_cached_block(&self, hash: BlockHash) -> Option<usize> {
        self.index.get(&hash)
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn block_ref_cnt(&self, id: usize) -> u32 {
        self.blocks[id].ref_cnt
    }
}
