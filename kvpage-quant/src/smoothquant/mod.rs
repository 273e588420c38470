use candle_core::{DType, Result, Tensor, D};
use candle_nn::Linear;

use crate::{MatMul, QuantMethod, QuantMethodConfig};

const INT8_MAX: f64 = 127.;

/// Per-token symmetric int8 quantization of `x` after dividing by the optional
/// per-channel `smoother`.
///
/// Returns the integer-valued activations (kept in `f32`) and the per-token
/// dynamic scale, shape `(tokens,)`.
pub fn per_token_quantize(x: &Tensor, smoother: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
    let x = x.to_dtype(DType::F32)?;
    let x = match smoother {
        Some(s) => x.broadcast_div(&s.to_dtype(DType::F32)?)?,
        None => x,
    };
    let scale = (x.abs()?.max_keepdim(D::Minus1)? / INT8_MAX)?.clamp(f32::EPSILON, f32::MAX)?;
    let q = x
        .broadcast_div(&scale)?
        .round()?
        .clamp(-INT8_MAX as f32, INT8_MAX as f32)?;
    Ok((q, scale.squeeze(D::Minus1)?))
}

/// W8A8 linear layer with per-channel weight scales and per-token activation scales.
#[derive(Debug)]
pub struct SmoothQuantLinear {
    q_weight: Tensor,
    weight_scale: Tensor,
    bias: Option<Tensor>,
    smoother: Option<Tensor>,
}

impl SmoothQuantLinear {
    /// Quantize a floating point linear layer. The smoother is folded into the
    /// weight columns so that `(x / s) @ (w * s)^T == x @ w^T`.
    pub fn quantize(linear: &Linear, smoother: Option<Tensor>) -> Result<Self> {
        let w = linear.weight().to_dtype(DType::F32)?;
        let w = match &smoother {
            Some(s) => w.broadcast_mul(&s.to_dtype(DType::F32)?)?,
            None => w,
        };
        let weight_scale =
            (w.abs()?.max_keepdim(D::Minus1)? / INT8_MAX)?.clamp(f32::EPSILON, f32::MAX)?;
        let q_weight = w
            .broadcast_div(&weight_scale)?
            .round()?
            .clamp(-INT8_MAX as f32, INT8_MAX as f32)?;
        Self::new(QuantMethodConfig::SmoothQuant {
            q_weight,
            weight_scale: weight_scale.squeeze(D::Minus1)?,
            bias: linear.bias().cloned(),
            smoother,
        })
    }
}

impl QuantMethod for SmoothQuantLinear {
    fn new(method: QuantMethodConfig) -> Result<Self>
    where
        Self: Sized,
    {
        match method {
            QuantMethodConfig::SmoothQuant {
                q_weight,
                weight_scale,
                bias,
                smoother,
            } => {
                let (out_dim, in_dim) = q_weight.dims2()?;
                if weight_scale.dims1()? != out_dim {
                    candle_core::bail!(
                        "weight scale has {} entries, expected {out_dim}",
                        weight_scale.dims1()?
                    );
                }
                if let Some(s) = &smoother {
                    if s.dims1()? != in_dim {
                        candle_core::bail!(
                            "smoother has {} entries, expected {in_dim}",
                            s.dims1()?
                        );
                    }
                }
                Ok(Self {
                    q_weight: q_weight.to_dtype(DType::F32)?,
                    weight_scale: weight_scale.to_dtype(DType::F32)?,
                    bias,
                    smoother,
                })
            }
            QuantMethodConfig::Unquantized(_) => {
                candle_core::bail!("SmoothQuantLinear needs a smooth-quant config")
            }
        }
    }

    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        let (q, scale) = per_token_quantize(a, self.smoother.as_ref())?;
        self.forward_dynamic(&q, &scale)?.to_dtype(a.dtype())
    }

    fn forward_dynamic(&self, a: &Tensor, dynamic_scale: &Tensor) -> Result<Tensor> {
        let acc = MatMul.matmul(&a.to_dtype(DType::F32)?, &self.q_weight.t()?)?;
        let out = acc
            .broadcast_mul(&dynamic_scale.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?)?
            .broadcast_mul(&self.weight_scale)?;
        match &self.bias {
            Some(b) => out.broadcast_add(&b.to_dtype(DType::F32)?),
            None => Ok(out),
        }
    }

    fn smoother(&self) -> Option<&Tensor> {
        self.smoother.as_ref()
    }

    fn out_dim(&self) -> usize {
        self.weight_scale.dim(0).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn test_per_token_quantize_scale() -> Result<()> {
        let x = Tensor::new(&[[1f32, -2., 0.5], [127., 0., -63.5]], &Device::Cpu)?;
        let (q, scale) = per_token_quantize(&x, None)?;
        let scale = scale.to_vec1::<f32>()?;
        assert!((scale[0] - 2. / 127.).abs() < 1e-6);
        assert!((scale[1] - 1.).abs() < 1e-6);

        let q = q.to_vec2::<f32>()?;
        assert_eq!(q[0][1], -127.);
        assert_eq!(q[1], vec![127., 0., -64.]);
        Ok(())
    }

    #[test]
    fn test_matches_float_linear() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::new(
            &[[0.2f32, -0.4, 0.1, 0.8], [0.5, 0.5, -0.25, 0.], [-1., 0.3, 0.6, 0.2]],
            &dev,
        )?;
        let b = Tensor::new(&[0.1f32, 0., -0.2], &dev)?;
        let smoother = Tensor::new(&[1f32, 2., 0.5, 1.], &dev)?;
        let lin = Linear::new(w.clone(), Some(b.clone()));
        let sq = SmoothQuantLinear::quantize(&lin, Some(smoother))?;

        let x = Tensor::new(&[[1f32, 0.5, -2., 0.25], [0.3, -0.7, 0.9, 1.1]], &dev)?;
        let expected = x.matmul(&w.t()?)?.broadcast_add(&b)?.to_vec2::<f32>()?;
        let got = sq.forward(&x)?.to_vec2::<f32>()?;
        for (e, g) in expected.iter().flatten().zip(got.iter().flatten()) {
            assert!((e - g).abs() < 1e-1, "{e} vs {g}");
        }
        Ok(())
    }

    #[test]
    fn test_new_rejects_mismatched_scale() {
        let dev = Device::Cpu;
        let res = SmoothQuantLinear::new(QuantMethodConfig::SmoothQuant {
            q_weight: Tensor::zeros((3, 4), DType::F32, &dev).unwrap(),
            weight_scale: Tensor::ones(2, DType::F32, &dev).unwrap(),
            bias: None,
            smoother: None,
        });
        assert!(res.is_err());
    }
}
