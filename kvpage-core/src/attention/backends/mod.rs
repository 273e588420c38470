#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{DType, Device, Result, Storage, Tensor, WithDType};
use half::{bf16, f16};

use crate::paged_attention::{LayerCache, INT8_ZERO};

pub(crate) mod decode;
pub(crate) mod explicit;
#[cfg(feature = "flash-attn")]
pub(crate) mod flash;
pub(crate) mod fused;

const DOT_CHUNK: usize = 4;

pub(crate) trait UpcastF32: Copy + Send + Sync {
    fn to_f32(self) -> f32;
}

impl UpcastF32 for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
}

impl UpcastF32 for f16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
}

impl UpcastF32 for bf16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
}

impl UpcastF32 for u8 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

/// Unrolled `sum(a[i] * (b[i] - zero))` in `f32`.
#[inline]
fn vec_dot_f32<T: UpcastF32>(a: &[f32], b: &[T], zero: f32) -> f32 {
    let mut sum = 0f32;
    let chunks = a.len() / DOT_CHUNK;
    for i in 0..chunks {
        let i_chunk = i * DOT_CHUNK;
        sum += a[i_chunk] * (b[i_chunk].to_f32() - zero)
            + a[i_chunk + 1] * (b[i_chunk + 1].to_f32() - zero)
            + a[i_chunk + 2] * (b[i_chunk + 2].to_f32() - zero)
            + a[i_chunk + 3] * (b[i_chunk + 3].to_f32() - zero);
    }
    for i in (chunks * DOT_CHUNK)..a.len() {
        sum += a[i] * (b[i].to_f32() - zero);
    }
    sum
}

/// Run `f` over the contiguous host data of `t`, copying to the CPU first if needed.
pub(crate) fn with_cpu_slice<T: WithDType, R>(
    t: &Tensor,
    f: impl FnOnce(&[T]) -> Result<R>,
) -> Result<R> {
    if !t.device().is_cpu() || !t.is_contiguous() {
        let host = t.to_device(&Device::Cpu)?.contiguous()?;
        return with_cpu_slice(&host, f);
    }
    let (guard, layout) = t.storage_and_layout();
    let data: &[T] = if let Storage::Cpu(cpu) = &*guard {
        cpu.as_slice::<T>()?
    } else {
        return Err(candle_core::Error::Msg("Expected CPU storage".into()));
    };
    let start = layout.start_offset();
    f(&data[start..start + t.elem_count()])
}

fn with_opt_cpu_slice<T: WithDType, R>(
    t: Option<&Tensor>,
    f: impl FnOnce(Option<&[T]>) -> Result<R>,
) -> Result<R> {
    match t {
        Some(t) => with_cpu_slice(t, |s| f(Some(s))),
        None => f(None),
    }
}

/// Host `f32` copy of a tensor.
pub(crate) fn to_host_f32(t: &Tensor) -> Result<Vec<f32>> {
    t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
}

/// Cache rows of one key/value position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct KvRow {
    pub k: usize,
    pub v: usize,
    pub k_scale: usize,
    pub v_scale: usize,
}

impl KvRow {
    pub(crate) fn dense(row: usize) -> Self {
        Self {
            k: row,
            v: row,
            k_scale: row,
            v_scale: row,
        }
    }
}

/// Row-addressed keys and values, `[rows, kv_heads, D]`, with optional int8 scales.
pub(crate) struct KvLayer<'a, K> {
    pub k: &'a [K],
    pub v: &'a [K],
    pub k_scale: Option<&'a [f32]>,
    pub v_scale: Option<&'a [f32]>,
    pub heads_kv: usize,
    pub head_size: usize,
    zero: f32,
}

impl<'a, K: UpcastF32> KvLayer<'a, K> {
    pub(crate) fn dense(k: &'a [K], v: &'a [K], heads_kv: usize, head_size: usize) -> Self {
        Self {
            k,
            v,
            k_scale: None,
            v_scale: None,
            heads_kv,
            head_size,
            zero: 0.,
        }
    }

    #[inline]
    pub(crate) fn dot_k(&self, row: &KvRow, head: usize, q: &[f32]) -> f32 {
        let off = (row.k * self.heads_kv + head) * self.head_size;
        let dot = vec_dot_f32(q, &self.k[off..off + self.head_size], self.zero);
        match self.k_scale {
            Some(s) => dot * s[row.k_scale * self.heads_kv + head],
            None => dot,
        }
    }

    /// `acc += w * v[row, head]`.
    #[inline]
    pub(crate) fn add_v(&self, row: &KvRow, head: usize, w: f32, acc: &mut [f32]) {
        let off = (row.v * self.heads_kv + head) * self.head_size;
        let w = match self.v_scale {
            Some(s) => w * s[row.v_scale * self.heads_kv + head],
            None => w,
        };
        for (a, x) in acc.iter_mut().zip(&self.v[off..off + self.head_size]) {
            *a += w * (x.to_f32() - self.zero);
        }
    }
}

/// Run `f` over a host view of one cache layer with element type `K`.
pub(crate) fn with_kv_layer<K: WithDType + UpcastF32, R>(
    layer: &LayerCache,
    f: impl FnOnce(&KvLayer<'_, K>) -> Result<R>,
) -> Result<R> {
    let (_, heads_kv, head_size) = layer.k.dims3()?;
    let zero = if layer.k_scale.is_some() {
        INT8_ZERO
    } else {
        0.
    };
    with_cpu_slice::<K, R>(&layer.k, |k| {
        with_cpu_slice::<K, R>(&layer.v, |v| {
            with_opt_cpu_slice::<f32, R>(layer.k_scale.as_ref(), |k_scale| {
                with_opt_cpu_slice::<f32, R>(layer.v_scale.as_ref(), |v_scale| {
                    f(&KvLayer {
                        k,
                        v,
                        k_scale,
                        v_scale,
                        heads_kv,
                        head_size,
                        zero,
                    })
                })
            })
        })
    })
}

/// Dispatch `$body` on the element type of a cache layer, binding the host view to `$kv`.
macro_rules! dispatch_kv_layer {
    ($layer:expr, |$kv:ident| $body:expr) => {{
        use $crate::attention::backends::with_kv_layer;
        match $layer.k.dtype() {
            candle_core::DType::F32 => with_kv_layer::<f32, _>($layer, |$kv| $body),
            candle_core::DType::F16 => with_kv_layer::<half::f16, _>($layer, |$kv| $body),
            candle_core::DType::BF16 => with_kv_layer::<half::bf16, _>($layer, |$kv| $body),
            candle_core::DType::U8 => with_kv_layer::<u8, _>($layer, |$kv| $body),
            dtype => Err($crate::AttentionError::UnsupportedDType(dtype).into()),
        }
    }};
}
pub(crate) use dispatch_kv_layer;

/// Running softmax state of one (query, head) pair.
#[derive(Clone, Debug)]
pub(crate) struct OnlineSoftmax {
    pub max: f32,
    pub sum: f32,
}

impl OnlineSoftmax {
    pub(crate) fn new() -> Self {
        Self {
            max: f32::NEG_INFINITY,
            sum: 0.,
        }
    }

    /// Fold in score `s`, rescaling `acc` when the max moves. Returns the weight of `s`.
    #[inline]
    pub(crate) fn push(&mut self, s: f32, acc: &mut [f32]) -> f32 {
        if s > self.max {
            let corr = (self.max - s).exp();
            self.sum *= corr;
            for a in acc.iter_mut() {
                *a *= corr;
            }
            self.max = s;
        }
        let p = (s - self.max).exp();
        self.sum += p;
        p
    }

    pub(crate) fn lse(&self) -> f32 {
        if self.sum > 0. {
            self.max + self.sum.ln()
        } else {
            f32::NEG_INFINITY
        }
    }
}

/// Shared parameters of the host attention kernels.
#[derive(Clone, Debug)]
pub(crate) struct KernelParams<'a> {
    pub heads: usize,
    pub heads_kv: usize,
    pub head_size: usize,
    pub scale: f32,
    pub causal: bool,
    pub alibi: Option<&'a [f32]>,
}

impl KernelParams<'_> {
    /// KV head serving query head `h`.
    #[inline]
    pub(crate) fn kv_head(&self, h: usize) -> usize {
        h / (self.heads / self.heads_kv)
    }

    #[inline]
    pub(crate) fn bias(&self, h: usize, q_pos: usize, k_pos: usize) -> f32 {
        self.alibi
            .map_or(0., |s| s[h] * (k_pos as f32 - q_pos as f32))
    }
}
