//! Chained content hashes of full KV cache blocks.
//!
//! Block `i` of a stream is keyed by the hash of block `i - 1` together with its
//! own tokens, so equal keys imply an equal token prefix up to and including the
//! block (modulo `u64` collisions).

use std::hash::{DefaultHasher, Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash(u64);

impl BlockHash {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Parent of the first block of every stream.
const ROOT_SEED: u64 = 0;

pub fn hash_block_tokens(parent_hash: Option<BlockHash>, block_tokens: &[u32]) -> BlockHash {
    let mut hasher = DefaultHasher::new();
    parent_hash.map_or(ROOT_SEED, |p| p.0).hash(&mut hasher);
    block_tokens.hash(&mut hasher);
    BlockHash(hasher.finish())
}

/// Hashes of every full block of `tokens`. A trailing partial block is not hashed.
pub fn hash_full_blocks(tokens: &[u32], block_size: usize) -> Vec<BlockHash> {
    if block_size == 0 {
        return Vec::new();
    }
    let mut parent = None;
    tokens
        .chunks_exact(block_size)
        .map(|chunk| {
            let h = hash_block_tokens(parent, chunk);
            parent = Some(h);
            h
        })
        .collect()
}
