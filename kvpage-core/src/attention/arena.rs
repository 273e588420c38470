use std::ops::{Deref, DerefMut};

use candle_core::{DType, Device, Result, Shape, Tensor};
use indexmap::IndexMap;
use tracing::debug;

use crate::AttentionError;

/// Host partials of a multi-block decode, one entry per (tile, slot, head).
#[derive(Debug, Default)]
pub struct MultiBlockScratch {
    pub max_seq_len_tile: usize,
    /// `[tile, gen_bs, H, D]`.
    pub partial_out: Vec<f32>,
    /// `[tile, gen_bs, H]`.
    pub partial_sum: Vec<f32>,
    pub partial_max: Vec<f32>,
    /// `[gen_bs, H]`, finished tiles per head.
    pub block_counter: Vec<u32>,
}

impl MultiBlockScratch {
    fn bytes(&self) -> usize {
        (self.partial_out.capacity() + self.partial_sum.capacity() + self.partial_max.capacity())
            * std::mem::size_of::<f32>()
            + self.block_counter.capacity() * std::mem::size_of::<u32>()
    }
}

/// Grow-only scratch storage for one executor, keyed by buffer name.
///
/// Buffers are only reallocated when a step needs more elements than the last
/// allocation held, and are released by [`ScratchArena::free`].
#[derive(Debug)]
pub struct ScratchArena {
    device: Device,
    slots: IndexMap<&'static str, Tensor>,
    softmax_lse: Vec<f32>,
    multi_block: Option<MultiBlockScratch>,
    reallocations: usize,
}

impl ScratchArena {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            slots: IndexMap::new(),
            softmax_lse: Vec::new(),
            multi_block: None,
            reallocations: 0,
        }
    }

    /// A contiguous view of `shape` over the `name` buffer, growing it if needed.
    pub fn re_malloc<S: Into<Shape>>(
        &mut self,
        name: &'static str,
        dtype: DType,
        shape: S,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let n = shape.elem_count();
        let fits = self
            .slots
            .get(name)
            .is_some_and(|t| t.dtype() == dtype && t.elem_count() >= n);
        if !fits {
            debug!(
                target: "kvpage::attention",
                "reallocating scratch `{name}` for {n} {dtype:?} elements"
            );
            self.slots
                .insert(name, Tensor::zeros(n, dtype, &self.device)?);
            self.reallocations += 1;
        }
        self.get_sized(name, shape)
    }

    fn get_sized(&self, name: &'static str, shape: Shape) -> Result<Tensor> {
        let buf = self.get(name)?;
        buf.narrow(0, 0, shape.elem_count())?.reshape(shape)
    }

    /// The whole buffer last allocated under `name`.
    pub fn get(&self, name: &'static str) -> Result<&Tensor> {
        self.slots
            .get(name)
            .ok_or_else(|| AttentionError::MissingBuffer(name).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Host log-sum-exp buffer with at least `n` entries.
    pub fn re_malloc_softmax_lse(&mut self, n: usize) -> &mut [f32] {
        if self.softmax_lse.len() < n {
            debug!(target: "kvpage::attention", "reallocating softmax_lse for {n} entries");
            self.softmax_lse.resize(n, 0.);
            self.reallocations += 1;
        }
        &mut self.softmax_lse[..n]
    }

    pub fn softmax_lse(&self) -> &[f32] {
        &self.softmax_lse
    }

    pub fn re_malloc_multi_block(
        &mut self,
        max_seq_len_tile: usize,
        gen_bs: usize,
        heads: usize,
        head_size: usize,
    ) -> &mut MultiBlockScratch {
        let partials = max_seq_len_tile * gen_bs * heads;
        let scratch = self.multi_block.get_or_insert_with(Default::default);
        if scratch.partial_sum.len() < partials
            || scratch.partial_out.len() < partials * head_size
        {
            debug!(
                target: "kvpage::attention",
                "reallocating multi-block partials for {max_seq_len_tile} tiles x {gen_bs} slots x \
                 {heads} heads"
            );
            scratch.partial_out.resize(partials * head_size, 0.);
            scratch.partial_sum.resize(partials, 0.);
            scratch.partial_max.resize(partials, 0.);
            self.reallocations += 1;
        }
        if scratch.block_counter.len() < gen_bs * heads {
            scratch.block_counter.resize(gen_bs * heads, 0);
        }
        scratch.max_seq_len_tile = max_seq_len_tile;
        scratch
    }

    pub fn multi_block(&self) -> Option<&MultiBlockScratch> {
        self.multi_block.as_ref()
    }

    pub(crate) fn multi_block_mut(&mut self) -> Option<&mut MultiBlockScratch> {
        self.multi_block.as_mut()
    }

    pub fn free(&mut self) {
        if self.slots.is_empty() && self.softmax_lse.is_empty() && self.multi_block.is_none() {
            return;
        }
        debug!(
            target: "kvpage::attention",
            "freeing {} bytes of attention scratch",
            self.allocated_bytes()
        );
        self.slots.clear();
        self.softmax_lse = Vec::new();
        self.multi_block = None;
    }

    pub fn allocated_bytes(&self) -> usize {
        self.slots
            .values()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum::<usize>()
            + self.softmax_lse.capacity() * std::mem::size_of::<f32>()
            + self.multi_block.as_ref().map_or(0, MultiBlockScratch::bytes)
    }

    /// Number of allocations made since construction.
    pub fn reallocation_count(&self) -> usize {
        self.reallocations
    }
}

/// Frees the arena when dropped, if asked to. Used so that
/// `free_buffer_after_forward` also holds when a forward fails.
pub(crate) struct ArenaRelease<'a> {
    arena: &'a mut ScratchArena,
    release: bool,
}

impl<'a> ArenaRelease<'a> {
    pub(crate) fn new(arena: &'a mut ScratchArena, release: bool) -> Self {
        Self { arena, release }
    }
}

impl Deref for ArenaRelease<'_> {
    type Target = ScratchArena;

    fn deref(&self) -> &Self::Target {
        self.arena
    }
}

impl DerefMut for ArenaRelease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.arena
    }
}

impl Drop for ArenaRelease<'_> {
    fn drop(&mut self) {
        if self.release {
            self.arena.free();
        }
    }
}
