use candle_core::{DType, Result, Tensor};

use super::config::{RopeConfig, RopeStyle};

/// Per-token rotary tables for arbitrary absolute positions.
///
/// Tokens of different sequences sit on the same axis, so each row carries its own
/// position. `seq_len` is the longest sequence of the step and drives dynamic NTK
/// base scaling.
fn cos_sin(
    cfg: &RopeConfig,
    rot_dim: usize,
    positions: &[usize],
    seq_len: usize,
    device: &candle_core::Device,
) -> Result<(Tensor, Tensor)> {
    let half = rot_dim / 2;
    let mut base = cfg.base as f64 * cfg.base_scale as f64;
    let mut pos_scale = 1. / cfg.scale as f64;
    if cfg.dynamic_embedding_max_pos > 0 {
        pos_scale = 1.;
        if seq_len > cfg.dynamic_embedding_max_pos && rot_dim > 2 {
            let ratio = cfg.scale as f64 * seq_len as f64 / cfg.dynamic_embedding_max_pos as f64
                - (cfg.scale as f64 - 1.);
            base *= ratio.powf(rot_dim as f64 / (rot_dim as f64 - 2.));
        }
    }
    let inv_freq: Vec<f64> = (0..half)
        .map(|i| 1. / base.powf(2. * i as f64 / rot_dim as f64))
        .collect();
    let mut cos = Vec::with_capacity(positions.len() * half);
    let mut sin = Vec::with_capacity(positions.len() * half);
    for &p in positions {
        let t = p as f64 * pos_scale;
        for f in &inv_freq {
            let (s, c) = (t * f).sin_cos();
            cos.push(c as f32);
            sin.push(s as f32);
        }
    }
    Ok((
        Tensor::from_vec(cos, (positions.len(), half), device)?,
        Tensor::from_vec(sin, (positions.len(), half), device)?,
    ))
}

/// Rotate the leading `rot_dim` dims of `x` (`[tokens, heads, D]`) at `positions`.
pub(crate) fn apply_rotary(
    x: &Tensor,
    cfg: &RopeConfig,
    rot_dim: usize,
    positions: &[usize],
    seq_len: usize,
) -> Result<Tensor> {
    if cfg.style == RopeStyle::None || positions.is_empty() {
        return Ok(x.clone());
    }
    let (tokens, _heads, d) = x.dims3()?;
    if tokens != positions.len() {
        candle_core::bail!("{} positions for {tokens} tokens", positions.len());
    }
    let dtype = x.dtype();
    let (cos, sin) = cos_sin(cfg, rot_dim, positions, seq_len, x.device())?;
    // rope kernels want `[b, h, t, d]`.
    let rot = x
        .narrow(2, 0, rot_dim)?
        .to_dtype(DType::F32)?
        .transpose(0, 1)?
        .unsqueeze(0)?
        .contiguous()?;
    let rot = match cfg.style {
        RopeStyle::Neox => candle_nn::rotary_emb::rope(&rot, &cos, &sin)?,
        RopeStyle::Gptj => candle_nn::rotary_emb::rope_i(&rot, &cos, &sin)?,
        RopeStyle::None => unreachable!(),
    };
    let rot = rot.squeeze(0)?.transpose(0, 1)?.to_dtype(dtype)?;
    if rot_dim == d {
        rot.contiguous()
    } else {
        Tensor::cat(&[&rot, &x.narrow(2, rot_dim, d - rot_dim)?], 2)?.contiguous()
    }
}

/// Scale queries past `logn_seq_len` by `log(pos + 1) / log(logn_seq_len)`.
pub(crate) fn apply_logn(x: &Tensor, cfg: &RopeConfig, positions: &[usize]) -> Result<Tensor> {
    if !cfg.use_logn_attn || cfg.logn_seq_len < 2 {
        return Ok(x.clone());
    }
    let denom = (cfg.logn_seq_len as f64).ln();
    let factors: Vec<f32> = positions
        .iter()
        .map(|&p| {
            if p + 1 > cfg.logn_seq_len {
                ((p as f64 + 1.).ln() / denom) as f32
            } else {
                1.
            }
        })
        .collect();
    let factors = Tensor::from_vec(factors, (positions.len(), 1, 1), x.device())?;
    x.to_dtype(DType::F32)?
        .broadcast_mul(&factors)?
        .to_dtype(x.dtype())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn neox() -> RopeConfig {
        RopeConfig {
            style: RopeStyle::Neox,
            ..Default::default()
        }
    }

    #[test]
    fn test_position_zero_is_identity() -> Result<()> {
        let x = Tensor::arange(0f32, 16., &Device::Cpu)?.reshape((2, 2, 4))?;
        let y = apply_rotary(&x, &neox(), 4, &[0, 0], 1)?;
        assert_eq!(y.to_vec3::<f32>()?, x.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_neox_rotates_halves() -> Result<()> {
        // One head of size 2: a plain 2-D rotation by `pos` radians.
        let x = Tensor::new(&[[[1f32, 0.]]], &Device::Cpu)?;
        let y = apply_rotary(&x, &neox(), 2, &[1], 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((y[0] - 1f32.cos()).abs() < 1e-5);
        assert!((y[1] - 1f32.sin()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_partial_rotary_keeps_tail() -> Result<()> {
        let x = Tensor::ones((3, 2, 8), DType::F32, &Device::Cpu)?;
        let y = apply_rotary(&x, &neox(), 4, &[5, 6, 7], 8)?;
        let tail = y.narrow(2, 4, 4)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(tail.iter().all(|&v| v == 1.));
        Ok(())
    }

    #[test]
    fn test_rotation_preserves_norm() -> Result<()> {
        let x = Tensor::arange(1f32, 9., &Device::Cpu)?.reshape((1, 1, 8))?;
        let cfg = RopeConfig {
            style: RopeStyle::Gptj,
            ..Default::default()
        };
        let y = apply_rotary(&x, &cfg, 8, &[37], 38)?;
        let n = |t: &Tensor| -> Result<f32> { t.sqr()?.sum_all()?.to_scalar::<f32>() };
        assert!((n(&x)? - n(&y)?).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_logn_scaling() -> Result<()> {
        let cfg = RopeConfig {
            use_logn_attn: true,
            logn_seq_len: 4,
            ..Default::default()
        };
        let x = Tensor::ones((2, 1, 1), DType::F32, &Device::Cpu)?;
        let y = apply_logn(&x, &cfg, &[3, 15])?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(y[0], 1.);
        assert!((y[1] - 2.).abs() < 1e-6);
        Ok(())
    }
}
