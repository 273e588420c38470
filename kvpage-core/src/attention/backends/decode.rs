use rayon::prelude::*;

use super::{KernelParams, KvLayer, KvRow, OnlineSoftmax, UpcastF32};
use crate::{
    attention::{arena::MultiBlockScratch, inputs::CacheIndirection},
    paged_attention::FlatBlockPointers,
    utils::ceil_div,
};

/// Positions each multi-block decode tile covers at least.
pub const DECODE_TIMESTEPS_PER_TILE: usize = 64;

/// Tiles a decode over `kv_len` positions is split into.
pub(crate) fn tile_count(kv_len: usize, max_seq_len_tile: usize) -> usize {
    if kv_len <= DECODE_TIMESTEPS_PER_TILE {
        1
    } else {
        ceil_div(kv_len, DECODE_TIMESTEPS_PER_TILE).min(max_seq_len_tile.max(1))
    }
}

/// Upper bound on tiles per decode for a head size and cache element size.
pub(crate) fn max_seq_len_tile(head_size: usize, elem_size: usize) -> usize {
    let per_thread = crate::utils::pow2_roundup(head_size) * elem_size / 16;
    256 / per_thread.max(1)
}

/// One generate slot.
#[derive(Clone, Debug)]
pub(crate) struct DecodeSlot {
    /// Rows of positions `0..kv_len`, the last being the new token.
    pub rows: Vec<KvRow>,
    pub finished: bool,
}

/// Rows of positions `0..kv_len` of generate slot `b`, reading past positions from
/// the source beam when `indir` is set.
pub(crate) fn slot_rows(
    pointers: &FlatBlockPointers,
    layer: usize,
    b: usize,
    kv_len: usize,
    block_size: usize,
    indir: Option<&CacheIndirection>,
) -> Vec<KvRow> {
    let n = ceil_div(kv_len, block_size);
    let row = |slot: usize, t: usize| -> KvRow {
        let k = pointers.blocks(slot, 0, layer, n);
        let v = pointers.blocks(slot, 1, layer, n);
        let i = t / block_size;
        let off = t % block_size;
        let at = |ids: &[i64]| ids[i] as usize * block_size + off;
        let (k_scale, v_scale) = match (
            pointers.scale_blocks(slot, 0, layer, n),
            pointers.scale_blocks(slot, 1, layer, n),
        ) {
            (Some(ks), Some(vs)) => (at(ks), at(vs)),
            _ => (at(k), at(v)),
        };
        KvRow {
            k: at(k),
            v: at(v),
            k_scale,
            v_scale,
        }
    };
    (0..kv_len)
        .map(|t| match indir {
            Some(ind) if ind.beam_width > 1 && t + 1 < kv_len => row(ind.source_slot(b, t), t),
            _ => row(b, t),
        })
        .collect()
}

fn attend_range<K: UpcastF32>(
    q: &[f32],
    kv: &KvLayer<'_, K>,
    rows: &[KvRow],
    range: std::ops::Range<usize>,
    h: usize,
    params: &KernelParams<'_>,
    acc: &mut [f32],
) -> OnlineSoftmax {
    let kv_h = params.kv_head(h);
    let q_pos = rows.len() - 1;
    let mut state = OnlineSoftmax::new();
    for t in range {
        let row = &rows[t];
        let score = kv.dot_k(row, kv_h, q) * params.scale + params.bias(h, q_pos, t);
        let p = state.push(score, acc);
        kv.add_v(row, kv_h, p, acc);
    }
    state
}

/// Masked multi-head attention of one new token per slot over its cached
/// positions. `q` is `[gen_bs, H, D]`; returns `[gen_bs, H, D]`.
///
/// With `multi_block`, long ranges are split into tiles whose partials are merged
/// in a second pass.
pub(crate) fn masked_decode<K: UpcastF32>(
    q: &[f32],
    kv: &KvLayer<'_, K>,
    slots: &[DecodeSlot],
    params: &KernelParams<'_>,
    multi_block: Option<&mut MultiBlockScratch>,
) -> Vec<f32> {
    let h_num = params.heads;
    let d = params.head_size;
    let mut out = vec![0f32; slots.len() * h_num * d];

    let Some(scratch) = multi_block else {
        out.par_chunks_mut(d).enumerate().for_each(|(idx, o)| {
            let slot = &slots[idx / h_num];
            if slot.finished || slot.rows.is_empty() {
                return;
            }
            let h = idx % h_num;
            let state = attend_range(
                &q[idx * d..(idx + 1) * d],
                kv,
                &slot.rows,
                0..slot.rows.len(),
                h,
                params,
                o,
            );
            if state.sum > 0. {
                let inv = 1. / state.sum;
                o.iter_mut().for_each(|x| *x *= inv);
            }
        });
        return out;
    };

    let max_tile = scratch.max_seq_len_tile;
    let tiles: Vec<usize> = slots
        .iter()
        .map(|s| tile_count(s.rows.len(), max_tile))
        .collect();
    let per_tile = slots.len() * h_num;
    let n = max_tile * per_tile;
    let partial_out = &mut scratch.partial_out[..n * d];
    let partial_sum = &mut scratch.partial_sum[..n];
    let partial_max = &mut scratch.partial_max[..n];

    partial_out
        .par_chunks_mut(d)
        .zip(partial_sum.par_iter_mut().zip(partial_max.par_iter_mut()))
        .enumerate()
        .for_each(|(idx, (po, (ps, pm)))| {
            po.fill(0.);
            *ps = 0.;
            *pm = f32::NEG_INFINITY;
            let tile = idx / per_tile;
            let sh = idx % per_tile;
            let b = sh / h_num;
            let slot = &slots[b];
            if slot.finished || tile >= tiles[b] {
                return;
            }
            let kv_len = slot.rows.len();
            let step = ceil_div(kv_len, tiles[b]);
            let start = tile * step;
            let end = (start + step).min(kv_len);
            if start >= end {
                return;
            }
            let h = sh % h_num;
            let q_row = &q[sh * d..(sh + 1) * d];
            let state = attend_range(q_row, kv, &slot.rows, start..end, h, params, po);
            *ps = state.sum;
            *pm = state.max;
        });

    let block_counter = &mut scratch.block_counter[..per_tile];
    let partial_out = &scratch.partial_out;
    let partial_sum = &scratch.partial_sum;
    let partial_max = &scratch.partial_max;
    out.par_chunks_mut(d)
        .zip(block_counter.par_iter_mut())
        .enumerate()
        .for_each(|(sh, (o, counter))| {
            let b = sh / h_num;
            if slots[b].finished {
                return;
            }
            let live = (0..tiles[b])
                .map(|t| t * per_tile + sh)
                .filter(|&i| partial_sum[i] > 0.);
            let m = live
                .clone()
                .map(|i| partial_max[i])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0f32;
            *counter = 0;
            for i in live {
                let w = (partial_max[i] - m).exp();
                denom += partial_sum[i] * w;
                for (x, p) in o.iter_mut().zip(&partial_out[i * d..(i + 1) * d]) {
                    *x += p * w;
                }
                *counter += 1;
            }
            if denom > 0. {
                let inv = 1. / denom;
                o.iter_mut().for_each(|x| *x *= inv);
            }
        });
    out
}
