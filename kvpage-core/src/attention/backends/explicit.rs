use candle_core::{DType, Result, Tensor, D};
use kvpage_quant::MatMul;

/// Scratch views used by the explicit path, taken from the arena.
pub(crate) struct ExplicitBuffers {
    /// `[ctx_bs, seq_with_prefix, H + 2*Hkv, D]`.
    pub q_buf_2: Tensor,
    /// `[ctx_bs, H, seq, seq_with_prefix]` in `f32`.
    pub qk_buf: Tensor,
    /// `[ctx_bs, seq, H, D]`.
    pub qkv_buf_3: Tensor,
}

/// One context slot: its new queries and its full keys and values, prefix first.
pub(crate) struct ExplicitSeq {
    /// `[len, H, D]`.
    pub q: Tensor,
    /// `[prefix + len, Hkv, D]`.
    pub k: Tensor,
    pub v: Tensor,
}

pub(crate) fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        Ok(xs)
    } else {
        let (b_sz, num_kv_heads, seq_len, head_dim) = xs.dims4()?;
        xs.unsqueeze(2)?
            .expand((b_sz, num_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((b_sz, num_kv_heads * n_rep, seq_len, head_dim))
    }
}

/// Softmax over the last dim with the row max subtracted first.
pub fn stable_softmax(xs: &Tensor) -> Result<Tensor> {
    let max = xs.max_keepdim(D::Minus1)?;
    let e = xs.broadcast_sub(&max)?.exp()?;
    let sum = e.sum_keepdim(D::Minus1)?;
    e.broadcast_div(&sum)
}

/// ALiBi bias `slope[h] * (k_pos - q_pos)` for padded context slots, `[ctx_bs, H, seq, kv]`.
fn alibi_bias(
    slopes: &[f32],
    prefix_lengths: &[usize],
    seq: usize,
    kv: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let bs = prefix_lengths.len();
    let heads = slopes.len();
    let mut bias = Vec::with_capacity(bs * heads * seq * kv);
    for &p in prefix_lengths {
        for &slope in slopes {
            for q in 0..seq {
                let q_pos = (p + q) as f32;
                bias.extend((0..kv).map(|k| slope * (k as f32 - q_pos)));
            }
        }
    }
    Tensor::from_vec(bias, (bs, heads, seq, kv), device)
}

/// Padded QK^T, mask, softmax and PV. Returns `[ctx_tokens, H, D]` in the query dtype.
pub(crate) fn explicit_attention(
    seqs: &[ExplicitSeq],
    mask: &Tensor,
    alibi_slopes: Option<&[f32]>,
    scale: f32,
    bufs: &ExplicitBuffers,
) -> Result<Tensor> {
    let (bs, seq_with_prefix, merged, head_size) = bufs.q_buf_2.dims4()?;
    let (_, heads, max_seq, _) = bufs.qk_buf.dims4()?;
    let heads_kv = (merged - heads) / 2;
    if seqs.len() != bs {
        candle_core::bail!("{} context slots for a buffer of {bs}", seqs.len());
    }
    let mask_dims = mask.dims3()?;
    if mask_dims != (bs, max_seq, seq_with_prefix) {
        candle_core::bail!(
            "attention mask is {mask_dims:?}, expected {:?}",
            (bs, max_seq, seq_with_prefix)
        );
    }
    let dtype = bufs.q_buf_2.dtype();

    // Pack each slot as `[seq_with_prefix, H + 2*Hkv, D]`, zero padded.
    let mut packed = Vec::with_capacity(bs);
    let mut lengths = Vec::with_capacity(bs);
    let mut prefix_lengths = Vec::with_capacity(bs);
    for s in seqs {
        let len = s.q.dim(0)?;
        let kv_len = s.k.dim(0)?;
        lengths.push(len);
        prefix_lengths.push(kv_len - len);
        let q = s.q.pad_with_zeros(0, 0, seq_with_prefix - len)?;
        let k = s.k.pad_with_zeros(0, 0, seq_with_prefix - kv_len)?;
        let v = s.v.pad_with_zeros(0, 0, seq_with_prefix - kv_len)?;
        packed.push(Tensor::cat(&[&q, &k, &v], 1)?.to_dtype(dtype)?);
    }
    bufs.q_buf_2
        .slice_set(&Tensor::stack(&packed, 0)?.contiguous()?, 0, 0)?;

    let q = bufs
        .q_buf_2
        .narrow(1, 0, max_seq)?
        .narrow(2, 0, heads)?
        .transpose(1, 2)?
        .to_dtype(DType::F32)?;
    let k = bufs.q_buf_2.narrow(2, heads, heads_kv)?.transpose(1, 2)?;
    let v = bufs
        .q_buf_2
        .narrow(2, heads + heads_kv, heads_kv)?
        .transpose(1, 2)?;
    let n_rep = heads / heads_kv;
    let k = repeat_kv(k.contiguous()?, n_rep)?.to_dtype(DType::F32)?;
    let v = repeat_kv(v.contiguous()?, n_rep)?.to_dtype(DType::F32)?;

    let qk = MatMul.matmul_affine_mul(&q, &k.t()?, scale as f64)?;
    bufs.qk_buf.slice_set(&qk.contiguous()?, 0, 0)?;

    let mut scores = bufs.qk_buf.broadcast_add(&mask.to_dtype(DType::F32)?.unsqueeze(1)?)?;
    if let Some(slopes) = alibi_slopes {
        let bias = alibi_bias(slopes, &prefix_lengths, max_seq, seq_with_prefix, q.device())?;
        scores = (scores + bias)?;
    }
    let probs = stable_softmax(&scores)?;

    let out = MatMul.matmul(&probs, &v)?.transpose(1, 2)?.to_dtype(dtype)?;
    bufs.qkv_buf_3.slice_set(&out.contiguous()?, 0, 0)?;

    let mut rows = Vec::with_capacity(bs);
    for (b, &len) in lengths.iter().enumerate() {
        if len > 0 {
            rows.push(bufs.qkv_buf_3.get(b)?.narrow(0, 0, len)?);
        }
    }
    if rows.is_empty() {
        return Tensor::zeros((0, heads, head_size), dtype, q.device());
    }
    Tensor::cat(&rows, 0)
}
