use std::fmt::Debug;

use candle_core::{Result, Tensor};
use candle_nn::Linear;

pub mod distributed;
mod lora;
mod smoothquant;
mod unquantized;

pub use distributed::{Comm, SumAllReduce};
pub use lora::{apply_lora, LoraAdapter, LoraConfig, LoraWeights};
pub use smoothquant::{per_token_quantize, SmoothQuantLinear};
pub use unquantized::UnquantLinear;

#[derive(Debug, Clone)]
pub enum QuantMethodConfig {
    Unquantized(Linear),
    SmoothQuant {
        /// Integer-valued weight in `[-127, 127]`, shape `(out, in)`.
        q_weight: Tensor,
        /// Per output channel, shape `(out,)`.
        weight_scale: Tensor,
        bias: Option<Tensor>,
        /// Per input channel activation smoother, shape `(in,)`.
        smoother: Option<Tensor>,
    },
}

/// Device/configurable matrix multiplication used by the attention paths.
pub struct MatMul;

impl MatMul {
    /// Compute matrix-matrix product.
    pub fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        a.contiguous()?.matmul(&b.contiguous()?)
    }

    /// Compute matrix-matrix product.
    /// The result will be multiplied by the `scale` parameter in an affine multiplication.
    pub fn matmul_affine_mul(&self, a: &Tensor, b: &Tensor, scale: f64) -> Result<Tensor> {
        self.matmul(a, b)? * scale
    }
}

/// The Gemm capability consumed by the attention executor.
pub trait QuantMethod: Send + Sync + Debug {
    fn new(method: QuantMethodConfig) -> Result<Self>
    where
        Self: Sized;

    /// Compute matmul of `self` and `a` with the bias fused. `self` should contain the weights.
    fn forward(&self, a: &Tensor) -> Result<Tensor>;

    /// Compute matmul of `self` and an already quantized activation `a`, dequantizing
    /// with the per-token `dynamic_scale`.
    fn forward_dynamic(&self, _a: &Tensor, _dynamic_scale: &Tensor) -> Result<Tensor> {
        candle_core::bail!("this layer does not take dynamically scaled activations")
    }

    /// Activation smoother applied before per-token quantization, if any.
    fn smoother(&self) -> Option<&Tensor> {
        None
    }

    /// Number of output features.
    fn out_dim(&self) -> usize;
}
