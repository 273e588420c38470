#![allow(clippy::too_many_arguments)]

pub mod attention;
mod error;
pub mod paged_attention;
mod utils;

pub use attention::{
    alibi_slopes, make_causal_mask, select_backend, slice_context, slice_generate,
    stable_softmax, use_multi_block_mode, AttentionBackend, AttentionConfig, AttentionExecutor,
    AttentionInputs, AttentionRunConfig, AttentionWeights, BackendAvailability, CacheIndirection,
    RopeConfig, RopeStyle, ScratchArena, DECODE_TIMESTEPS_PER_TILE,
};
pub use error::AttentionError;
pub use paged_attention::{
    BatchBlockAddressing, BlockHandles, BlockPool, BlockTable, CacheConfig, CacheManager,
    FlatBlockPointers, KvCacheBuffer, KvCacheType, PromptPrefix, ResourceContext, ResourceState,
    StreamCacheResource, StreamInfo, SystemPrompt,
};
