use candle_core::{DType, Device, Result, Tensor, D};
use tracing::info;

use super::config::{CacheConfig, KvCacheType};

const INT8_MAX: f64 = 127.;
/// Stored int8 values are offset so that they fit `U8`.
pub(crate) const INT8_ZERO: f32 = 128.;

/// One layer of the paged pool. Rows are token slots, `slot = block * S + offset`.
#[derive(Clone, Debug)]
pub struct LayerCache {
    /// `[block_nums * S, kv_heads, D]`.
    pub k: Tensor,
    pub v: Tensor,
    /// `[block_nums * S, kv_heads]`, int8 mode only.
    pub k_scale: Option<Tensor>,
    pub v_scale: Option<Tensor>,
}

/// Physical K/V storage for every layer, addressed through block tables.
#[derive(Clone, Debug)]
pub struct KvCacheBuffer {
    layers: Vec<LayerCache>,
    config: CacheConfig,
}

/// Cache row of token `pos` for a sequence whose blocks are `blocks`.
pub fn slot(blocks: &[usize], pos: usize, block_size: usize) -> usize {
    blocks[pos / block_size] * block_size + pos % block_size
}

impl KvCacheBuffer {
    pub fn new(config: &CacheConfig, device: &Device) -> Result<Self> {
        let rows = config.block_nums * config.seq_size_per_block;
        let shape = (rows, config.local_head_num_kv, config.size_per_head);
        let int8 = config.kv_cache_type == KvCacheType::Int8;
        let data_dtype = if int8 { DType::U8 } else { config.dtype };

        let mut layers = Vec::with_capacity(config.layer_num);
        for _ in 0..config.layer_num {
            let scale = || -> Result<Option<Tensor>> {
                if int8 {
                    Ok(Some(Tensor::ones(
                        (rows, config.local_head_num_kv),
                        DType::F32,
                        device,
                    )?))
                } else {
                    Ok(None)
                }
            };
            layers.push(LayerCache {
                k: Tensor::zeros(shape, data_dtype, device)?,
                v: Tensor::zeros(shape, data_dtype, device)?,
                k_scale: scale()?,
                v_scale: scale()?,
            });
        }
        info!(
            target: "kvpage::cache",
            "Allocated paged KV cache: {} layers x {} blocks of {} tokens ({:.2} MiB, {:?}).",
            config.layer_num,
            config.block_nums,
            config.seq_size_per_block,
            config.total_bytes() as f64 / (1024. * 1024.),
            config.kv_cache_type,
        );
        Ok(Self {
            layers,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn layer(&self, layer: usize) -> &LayerCache {
        &self.layers[layer]
    }

    pub fn block_size(&self) -> usize {
        self.config.seq_size_per_block
    }

    pub fn is_int8(&self) -> bool {
        self.config.kv_cache_type == KvCacheType::Int8
    }

    /// Write `k`/`v` (`[n, kv_heads, D]`) at positions `start_pos..start_pos + n`.
    pub fn write(
        &self,
        layer: usize,
        blocks: &[usize],
        start_pos: usize,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<()> {
        let n = k.dim(0)?;
        if n == 0 {
            return Ok(());
        }
        let s = self.block_size();
        if (start_pos + n).div_ceil(s) > blocks.len() {
            candle_core::bail!(
                "writing positions {start_pos}..{} needs more than the {} blocks held",
                start_pos + n,
                blocks.len()
            );
        }
        let cache = &self.layers[layer];
        let store = |dst: &Tensor, dst_scale: &Option<Tensor>, src: &Tensor| -> Result<()> {
            let (data, scale) = match dst_scale {
                Some(_) => {
                    let (q, scale) = quantize_int8(src)?;
                    (q, Some(scale))
                }
                None => (src.to_dtype(dst.dtype())?, None),
            };
            // Copy block-contiguous runs.
            let mut i = 0;
            while i < n {
                let pos = start_pos + i;
                let run = (s - pos % s).min(n - i);
                let row = slot(blocks, pos, s);
                dst.slice_set(&data.narrow(0, i, run)?.contiguous()?, 0, row)?;
                if let (Some(dst_scale), Some(scale)) = (dst_scale, &scale) {
                    dst_scale.slice_set(&scale.narrow(0, i, run)?.contiguous()?, 0, row)?;
                }
                i += run;
            }
            Ok(())
        };
        store(&cache.k, &cache.k_scale, k)?;
        store(&cache.v, &cache.v_scale, v)
    }

    /// Read positions `0..len` as `[len, kv_heads, D]` in the activation dtype.
    pub fn gather(&self, layer: usize, blocks: &[usize], len: usize) -> Result<(Tensor, Tensor)> {
        let s = self.block_size();
        let cache = &self.layers[layer];
        let device = cache.k.device();
        let idx: Vec<u32> = (0..len).map(|p| slot(blocks, p, s) as u32).collect();
        let idx = Tensor::from_vec(idx, len, device)?;
        let read = |data: &Tensor, scale: &Option<Tensor>| -> Result<Tensor> {
            let x = data.index_select(&idx, 0)?;
            match scale {
                Some(scale) => dequantize_int8(&x, &scale.index_select(&idx, 0)?)?
                    .to_dtype(self.config.dtype),
                None => Ok(x),
            }
        };
        Ok((read(&cache.k, &cache.k_scale)?, read(&cache.v, &cache.v_scale)?))
    }
}

/// Per (token, head) symmetric quantization of `[n, heads, D]` into offset `U8`
/// values and `[n, heads]` f32 scales.
pub(crate) fn quantize_int8(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let x = x.to_dtype(DType::F32)?;
    let scale = (x.abs()?.max_keepdim(D::Minus1)? / INT8_MAX)?.clamp(f32::EPSILON, f32::MAX)?;
    let q = ((x.broadcast_div(&scale)?.round()? + INT8_ZERO as f64)?.clamp(0f32, 255f32))?
        .to_dtype(DType::U8)?;
    Ok((q, scale.squeeze(D::Minus1)?))
}

pub(crate) fn dequantize_int8(q: &Tensor, scale: &Tensor) -> Result<Tensor> {
    (q.to_dtype(DType::F32)? - INT8_ZERO as f64)?.broadcast_mul(&scale.unsqueeze(D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kv_cache_type: KvCacheType) -> CacheConfig {
        CacheConfig {
            layer_num: 2,
            block_nums: 5,
            local_head_num_kv: 2,
            size_per_head: 4,
            seq_size_per_block: 2,
            dtype: DType::F32,
            kv_cache_type,
            reuse_cache: false,
        }
    }

    #[test]
    fn test_slot() {
        assert_eq!(slot(&[3, 1], 0, 2), 6);
        assert_eq!(slot(&[3, 1], 3, 2), 3);
    }

    #[test]
    fn test_write_then_gather_across_blocks() -> Result<()> {
        let cache = KvCacheBuffer::new(&config(KvCacheType::Auto), &Device::Cpu)?;
        let blocks = [4, 2];
        let k = Tensor::arange(0f32, 24., &Device::Cpu)?.reshape((3, 2, 4))?;
        let v = (k.clone() * -1.)?;
        cache.write(1, &blocks, 0, &k.narrow(0, 0, 1)?, &v.narrow(0, 0, 1)?)?;
        cache.write(1, &blocks, 1, &k.narrow(0, 1, 2)?, &v.narrow(0, 1, 2)?)?;

        let (gk, gv) = cache.gather(1, &blocks, 3)?;
        assert_eq!(gk.to_vec3::<f32>()?, k.to_vec3::<f32>()?);
        assert_eq!(gv.to_vec3::<f32>()?, v.to_vec3::<f32>()?);
        // The other layer is untouched.
        let (ok, _) = cache.gather(0, &blocks, 3)?;
        assert_eq!(ok.sum_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }

    #[test]
    fn test_int8_round_trip_is_close() -> Result<()> {
        let cache = KvCacheBuffer::new(&config(KvCacheType::Int8), &Device::Cpu)?;
        assert_eq!(cache.layer(0).k.dtype(), DType::U8);
        let k = Tensor::new(
            &[[[0.5f32, -1., 0.25, 0.], [3., 2., -3., 1.]]],
            &Device::Cpu,
        )?;
        cache.write(0, &[1], 0, &k, &k)?;
        let (gk, _) = cache.gather(0, &[1], 1)?;
        for (a, b) in k
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .zip(gk.flatten_all()?.to_vec1::<f32>()?)
        {
            assert!((a - b).abs() < 3. / 127., "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn test_write_past_blocks_is_error() -> Result<()> {
        let cache = KvCacheBuffer::new(&config(KvCacheType::Auto), &Device::Cpu)?;
        let k = Tensor::zeros((3, 2, 4), DType::F32, &Device::Cpu)?;
        assert!(cache.write(0, &[1], 0, &k, &k).is_err());
        Ok(())
    }
}
