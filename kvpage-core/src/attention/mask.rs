use candle_core::{Device, Result, Tensor};

/// Additive value for masked positions. Finite so that fully padded rows stay NaN free.
pub(crate) const MASK_VALUE: f32 = -1e30;

/// Causal mask for context slots, `[ctx_bs, max_seq, max_seq + max_prefix]` in `f32`.
///
/// Query `q` of slot `b` may attend key `k` when `q < input_lengths[b]`,
/// `k < prefix + input_lengths[b]` and `k <= prefix + q`. Keys are laid out as the
/// reused prefix followed by the new tokens.
pub fn make_causal_mask(
    prefix_lengths: &[usize],
    input_lengths: &[usize],
    device: &Device,
) -> Result<Tensor> {
    if !prefix_lengths.is_empty() && prefix_lengths.len() != input_lengths.len() {
        candle_core::bail!(
            "{} prefix lengths for {} context slots",
            prefix_lengths.len(),
            input_lengths.len()
        );
    }
    let prefix = |b: usize| prefix_lengths.get(b).copied().unwrap_or(0);
    let bs = input_lengths.len();
    let max_seq = input_lengths.iter().copied().max().unwrap_or(0);
    let max_prefix = (0..bs).map(prefix).max().unwrap_or(0);
    let kv = max_seq + max_prefix;

    let mut mask = vec![MASK_VALUE; bs * max_seq * kv];
    for (b, &len) in input_lengths.iter().enumerate() {
        let p = prefix(b);
        for q in 0..len {
            let row = (b * max_seq + q) * kv;
            mask[row..row + p + q + 1].fill(0.);
        }
    }
    Tensor::from_vec(mask, (bs, max_seq, kv), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_with_prefix() -> Result<()> {
        let m = make_causal_mask(&[2, 0], &[2, 3], &Device::Cpu)?;
        assert_eq!(m.dims(), &[2, 3, 5]);
        let m = m.to_vec3::<f32>()?;
        let open = |row: &Vec<f32>| row.iter().filter(|&&x| x == 0.).count();
        assert_eq!(open(&m[0][0]), 3);
        assert_eq!(open(&m[0][1]), 4);
        // Padding query row.
        assert_eq!(open(&m[0][2]), 0);
        assert_eq!(open(&m[1][2]), 3);
        assert_eq!(m[1][0][1], MASK_VALUE);
        Ok(())
    }

    #[test]
    fn test_prefix_length_mismatch() {
        assert!(make_causal_mask(&[1], &[2, 3], &Device::Cpu).is_err());
    }
}
