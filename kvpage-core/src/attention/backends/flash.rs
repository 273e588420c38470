use candle_core::{DType, Result, Tensor};

/// Varlen flash attention over packed `[tokens, H, D]` queries and `[kv_tokens, Hkv, D]`
/// keys and values. Causal masking is aligned to the end of each key range, so a
/// reused prefix stays visible to every query.
pub(crate) fn flash_attn_varlen(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    q_lens: &[usize],
    kv_lens: &[usize],
    softmax_scale: f32,
    causal: bool,
    alibi_slopes: Option<&Tensor>,
) -> Result<Tensor> {
    let device = q.device();
    let cumulative = |lens: &[usize]| -> Result<Tensor> {
        let mut cu = Vec::with_capacity(lens.len() + 1);
        cu.push(0u32);
        let mut total = 0u32;
        for &l in lens {
            total += l as u32;
            cu.push(total);
        }
        Tensor::from_vec(cu, lens.len() + 1, device)
    };
    let cu_q = cumulative(q_lens)?;
    let cu_k = cumulative(kv_lens)?;
    let max_q = q_lens.iter().copied().max().unwrap_or(0);
    let max_k = kv_lens.iter().copied().max().unwrap_or(0);

    // Flash kernels only take half precision.
    let dtype = q.dtype();
    let fa_dtype = if dtype == DType::F32 { DType::BF16 } else { dtype };
    let (q, k, v) = (
        q.to_dtype(fa_dtype)?,
        k.to_dtype(fa_dtype)?,
        v.to_dtype(fa_dtype)?,
    );
    let out = match alibi_slopes {
        Some(slopes) => candle_flash_attn::flash_attn_varlen_alibi(
            &q,
            &k,
            &v,
            &slopes.to_dtype(DType::F32)?,
            &cu_q,
            &cu_k,
            max_q,
            max_k,
            softmax_scale,
            causal,
        )?,
        None => candle_flash_attn::flash_attn_varlen(
            &q,
            &k,
            &v,
            &cu_q,
            &cu_k,
            max_q,
            max_k,
            softmax_scale,
            causal,
        )?,
    };
    out.to_dtype(dtype)
}
