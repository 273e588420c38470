use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module};

use crate::{QuantMethod, QuantMethodConfig};

#[derive(Debug)]
pub struct UnquantLinear(Linear);

impl UnquantLinear {
    pub fn weight(&self) -> &Tensor {
        self.0.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.0.bias()
    }
}

impl QuantMethod for UnquantLinear {
    fn new(method: QuantMethodConfig) -> candle_core::Result<Self>
    where
        Self: Sized,
    {
        match method {
            QuantMethodConfig::Unquantized(l) => Ok(Self(l)),
            QuantMethodConfig::SmoothQuant { .. } => {
                candle_core::bail!("UnquantLinear cannot be built from a smooth-quant config")
            }
        }
    }

    fn forward(&self, a: &Tensor) -> Result<Tensor> {
        let original_dtype = a.dtype();
        let w_dtype = self.0.weight().dtype();
        if original_dtype == w_dtype {
            self.0.forward(a)
        } else {
            self.0.forward(&a.to_dtype(w_dtype)?)?.to_dtype(original_dtype)
        }
    }

    fn out_dim(&self) -> usize {
        self.0.weight().dim(0).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn test_forward_fuses_bias() -> Result<()> {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[1f32, 0.], [0., 2.], [1., 1.]], &dev)?;
        let b = Tensor::new(&[0.5f32, -1., 0.], &dev)?;
        let lin = UnquantLinear::new(QuantMethodConfig::Unquantized(Linear::new(w, Some(b))))?;
        assert_eq!(lin.out_dim(), 3);

        let x = Tensor::new(&[[1f32, 2.], [3., 4.]], &dev)?;
        let y = QuantMethod::forward(&lin, &x)?.to_vec2::<f32>()?;
        assert_eq!(y, vec![vec![1.5, 3., 3.], vec![3.5, 7., 7.]]);
        Ok(())
    }
}
