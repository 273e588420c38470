mod alibi;
pub(crate) mod arena;
mod backend;
pub(crate) mod backends;
mod config;
mod executor;
pub(crate) mod inputs;
mod mask;
mod rotary;

pub use alibi::alibi_slopes;
pub use arena::{MultiBlockScratch, ScratchArena};
pub use backend::{select_backend, use_multi_block_mode, AttentionBackend};
pub use backends::decode::DECODE_TIMESTEPS_PER_TILE;
pub use backends::explicit::stable_softmax;
pub use config::{
    AttentionConfig, AttentionRunConfig, BackendAvailability, RopeConfig, RopeStyle,
};
pub use executor::AttentionExecutor;
pub use inputs::{
    slice_context, slice_generate, AttentionInputs, AttentionWeights, CacheIndirection,
};
pub use mask::make_causal_mask;
