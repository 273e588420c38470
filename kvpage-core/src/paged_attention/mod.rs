mod batch_addr;
mod block_hash;
mod block_pool;
mod block_table;
mod cache_engine;
mod cache_manager;
mod config;
mod stream_resource;

pub use batch_addr::{BatchBlockAddressing, FlatBlockPointers, NULL_BLOCK_ID};
pub use block_hash::{hash_block_tokens, hash_full_blocks, BlockHash};
pub use block_pool::BlockPool;
pub use block_table::{BlockHandles, BlockTable, LayerBlocks};
pub use cache_engine::{slot, KvCacheBuffer, LayerCache};
pub(crate) use cache_engine::INT8_ZERO;
pub use cache_manager::CacheManager;
pub use config::{CacheConfig, KvCacheType};
pub use stream_resource::{
    PromptPrefix, ResourceContext, ResourceState, StreamCacheResource, StreamInfo, SystemPrompt,
};
