use std::sync::Arc;

use candle_core::{Result, Tensor};
use kvpage_quant::{LoraWeights, QuantMethod};

use crate::paged_attention::{FlatBlockPointers, KvCacheBuffer};

/// Beam search remap of past positions.
///
/// `indir[(slot * max_seq_len) + t]` is the beam within the slot's group whose
/// cache row holds position `t`.
#[derive(Clone, Debug)]
pub struct CacheIndirection {
    pub beam_width: usize,
    pub max_seq_len: usize,
    pub indir: Vec<u32>,
}

impl CacheIndirection {
    /// Batch slot whose cache holds position `t` for generate slot `b`.
    pub fn source_slot(&self, b: usize, t: usize) -> usize {
        let beam = self.indir[b * self.max_seq_len + t] as usize;
        (b / self.beam_width) * self.beam_width + beam
    }

    /// Checks that every lookup `slot_rows` makes for `sequence_lengths` stays in
    /// bounds.
    fn validate(&self, sequence_lengths: &[usize]) -> Result<()> {
        let gen_bs = sequence_lengths.len();
        if self.beam_width == 0 {
            candle_core::bail!("cache indirection with beam width 0");
        }
        if self.indir.len() != gen_bs * self.max_seq_len {
            candle_core::bail!(
                "cache indirection has {} entries, expected {gen_bs} slots x {}",
                self.indir.len(),
                self.max_seq_len
            );
        }
        if let Some(len) = sequence_lengths.iter().find(|&&l| l > self.max_seq_len) {
            candle_core::bail!(
                "sequence length {len} exceeds cache indirection max_seq_len {}",
                self.max_seq_len
            );
        }
        for (i, &beam) in self.indir.iter().enumerate() {
            let b = i / self.max_seq_len.max(1);
            let source = (b / self.beam_width) * self.beam_width + beam as usize;
            if beam as usize >= self.beam_width || source >= gen_bs {
                candle_core::bail!(
                    "cache indirection of slot {b} points at beam {beam}, outside its group"
                );
            }
        }
        Ok(())
    }
}

/// Per-step inputs of one attention layer. Token-major buffers put generate
/// tokens first, then the tokens of each context slot in order.
#[derive(Clone)]
pub struct AttentionInputs<'a> {
    pub layer_id: usize,
    /// `[h_tokens, hidden]`.
    pub input: Tensor,
    pub generate_batch_size: usize,
    pub context_batch_size: usize,
    /// New tokens per slot, generate slots first.
    pub input_lengths: Vec<usize>,
    /// Cached tokens of each generate slot before this step.
    pub sequence_lengths: Vec<usize>,
    /// Reused cached tokens of each context slot.
    pub prefix_lengths: Vec<usize>,
    pub position_ids: Option<Vec<usize>>,
    pub finished: Option<Vec<bool>>,
    pub cache_indirection: Option<CacheIndirection>,
    /// Additive `[ctx_bs, seq, seq_with_prefix]`.
    pub attention_mask: Option<Tensor>,
    /// `[H]`.
    pub linear_bias_slopes: Option<Tensor>,
    pub block_pointers: Option<FlatBlockPointers>,
    pub kv_cache: Option<&'a KvCacheBuffer>,
    pub lora_ids: Vec<i64>,
    pub lora_input_lengths: Vec<usize>,
    /// Per-token activation scale when the input is already int8.
    pub dynamic_scale: Option<Tensor>,
}

impl<'a> AttentionInputs<'a> {
    pub fn new(layer_id: usize, input: Tensor) -> Self {
        Self {
            layer_id,
            input,
            generate_batch_size: 0,
            context_batch_size: 0,
            input_lengths: Vec::new(),
            sequence_lengths: Vec::new(),
            prefix_lengths: Vec::new(),
            position_ids: None,
            finished: None,
            cache_indirection: None,
            attention_mask: None,
            linear_bias_slopes: None,
            block_pointers: None,
            kv_cache: None,
            lora_ids: Vec::new(),
            lora_input_lengths: Vec::new(),
            dynamic_scale: None,
        }
    }

    pub fn h_token_num(&self) -> usize {
        self.generate_batch_size + self.context_input_lengths().iter().sum::<usize>()
    }

    pub fn context_input_lengths(&self) -> &[usize] {
        &self.input_lengths[self.generate_batch_size.min(self.input_lengths.len())..]
    }

    pub fn prefix_length(&self, ctx_slot: usize) -> usize {
        self.prefix_lengths.get(ctx_slot).copied().unwrap_or(0)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let bs = self.generate_batch_size + self.context_batch_size;
        if self.input_lengths.len() != bs {
            candle_core::bail!(
                "{} input lengths for {} generate and {} context slots",
                self.input_lengths.len(),
                self.generate_batch_size,
                self.context_batch_size
            );
        }
        if let Some(b) = self.input_lengths[..self.generate_batch_size]
            .iter()
            .position(|&l| l != 1)
        {
            candle_core::bail!(
                "generate slot {b} has {} new tokens, expected 1",
                self.input_lengths[b]
            );
        }
        if self.sequence_lengths.len() < self.generate_batch_size {
            candle_core::bail!(
                "{} sequence lengths for {} generate slots",
                self.sequence_lengths.len(),
                self.generate_batch_size
            );
        }
        if !self.prefix_lengths.is_empty() && self.prefix_lengths.len() != self.context_batch_size
        {
            candle_core::bail!(
                "{} prefix lengths for {} context slots",
                self.prefix_lengths.len(),
                self.context_batch_size
            );
        }
        if let Some(finished) = &self.finished {
            if finished.len() != self.generate_batch_size {
                candle_core::bail!(
                    "{} finished flags for {} generate slots",
                    finished.len(),
                    self.generate_batch_size
                );
            }
        }
        if let Some(indir) = &self.cache_indirection {
            indir.validate(&self.sequence_lengths[..self.generate_batch_size])?;
        }
        let rows = self.input.dim(0)?;
        if rows != self.h_token_num() {
            candle_core::bail!(
                "input has {rows} rows but the batch describes {} tokens",
                self.h_token_num()
            );
        }
        if let Some(ids) = &self.position_ids {
            if ids.len() != rows {
                candle_core::bail!("{} position ids for {rows} tokens", ids.len());
            }
        }
        Ok(())
    }
}

/// Rows of the generate slots, one token each.
pub fn slice_generate(buf: &Tensor, generate_batch_size: usize) -> Result<Tensor> {
    buf.narrow(0, 0, generate_batch_size)
}

/// Rows of the context slots, after the generate rows.
pub fn slice_context(buf: &Tensor, generate_batch_size: usize) -> Result<Tensor> {
    let rows = buf.dim(0)?;
    buf.narrow(0, generate_batch_size, rows - generate_batch_size)
}

/// Projection weights of one attention layer.
#[derive(Clone)]
pub struct AttentionWeights {
    /// Fused `[H*D + 2*Hkv*D, hidden]` projection.
    pub qkv: Arc<dyn QuantMethod>,
    pub qkv_lora: Option<LoraWeights>,
    /// `[D]` gammas of the per-head RMS norm.
    pub q_norm: Option<Tensor>,
    pub k_norm: Option<Tensor>,
    /// Gamma and optional beta over `H*D`.
    pub attention_layernorm: Option<(Tensor, Option<Tensor>)>,
    pub dense: Arc<dyn QuantMethod>,
    pub dense_lora: Option<LoraWeights>,
}

impl AttentionWeights {
    pub fn new(qkv: Arc<dyn QuantMethod>, dense: Arc<dyn QuantMethod>) -> Self {
        Self {
            qkv,
            qkv_lora: None,
            q_norm: None,
            k_norm: None,
            attention_layernorm: None,
            dense,
            dense_lora: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn test_slices() -> Result<()> {
        let buf = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((6, 1))?;
        let g = slice_generate(&buf, 2)?;
        let c = slice_context(&buf, 2)?;
        assert_eq!(g.flatten_all()?.to_vec1::<f32>()?, vec![0., 1.]);
        assert_eq!(c.flatten_all()?.to_vec1::<f32>()?, vec![2., 3., 4., 5.]);
        assert_eq!(slice_context(&buf, 0)?.dim(0)?, 6);
        Ok(())
    }

    #[test]
    fn test_validate_counts_tokens() -> Result<()> {
        let mut inputs =
            AttentionInputs::new(0, Tensor::zeros((7, 4), DType::F32, &Device::Cpu)?);
        inputs.generate_batch_size = 2;
        inputs.context_batch_size = 1;
        inputs.input_lengths = vec![1, 1, 5];
        inputs.sequence_lengths = vec![3, 9];
        assert_eq!(inputs.h_token_num(), 7);
        inputs.validate()?;
        inputs.input_lengths = vec![1, 1, 4];
        assert!(inputs.validate().is_err());
        Ok(())
    }

    fn generate_inputs(seq_lens: Vec<usize>) -> Result<AttentionInputs<'static>> {
        let gen_bs = seq_lens.len();
        let mut inputs =
            AttentionInputs::new(0, Tensor::zeros((gen_bs, 4), DType::F32, &Device::Cpu)?);
        inputs.generate_batch_size = gen_bs;
        inputs.input_lengths = vec![1; gen_bs];
        inputs.sequence_lengths = seq_lens;
        Ok(inputs)
    }

    #[test]
    fn test_validate_generate_slots() -> Result<()> {
        let mut inputs = generate_inputs(vec![3, 5])?;
        inputs.validate()?;

        inputs.input_lengths = vec![1, 2];
        let err = inputs.validate().unwrap_err();
        assert!(err.to_string().contains("generate slot 1"), "{err}");
        inputs.input_lengths = vec![1, 1];

        inputs.finished = Some(vec![false]);
        assert!(inputs.validate().is_err());
        inputs.finished = Some(vec![false, true]);
        inputs.validate()?;
        Ok(())
    }

    #[test]
    fn test_validate_cache_indirection() -> Result<()> {
        let mut inputs = generate_inputs(vec![3, 4])?;
        let ok = CacheIndirection {
            beam_width: 2,
            max_seq_len: 4,
            indir: vec![0, 1, 1, 0, 1, 0, 0, 1],
        };
        inputs.cache_indirection = Some(ok.clone());
        inputs.validate()?;

        let mut short = ok.clone();
        short.indir.truncate(6);
        inputs.cache_indirection = Some(short);
        assert!(inputs.validate().is_err());

        let mut beam_out_of_range = ok.clone();
        beam_out_of_range.indir[5] = 2;
        inputs.cache_indirection = Some(beam_out_of_range);
        let err = inputs.validate().unwrap_err();
        assert!(err.to_string().contains("slot 1"), "{err}");

        let mut too_long = ok;
        too_long.max_seq_len = 3;
        too_long.indir.truncate(6);
        inputs.cache_indirection = Some(too_long);
        assert!(inputs.validate().is_err());

        // A partial beam group would read a slot past the batch.
        let mut inputs = generate_inputs(vec![2])?;
        inputs.cache_indirection = Some(CacheIndirection {
            beam_width: 2,
            max_seq_len: 2,
            indir: vec![0, 1],
        });
        assert!(inputs.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_beam_source_slot() {
        let indir = CacheIndirection {
            beam_width: 2,
            max_seq_len: 4,
            indir: vec![0, 0, 1, 0, 0, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0],
        };
        assert_eq!(indir.source_slot(0, 2), 1);
        assert_eq!(indir.source_slot(1, 0), 0);
        assert_eq!(indir.source_slot(2, 0), 3);
        assert_eq!(indir.source_slot(3, 0), 2);
    }
}
