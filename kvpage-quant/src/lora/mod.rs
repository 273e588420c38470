use std::collections::HashSet;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::MatMul;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoraConfig {
    #[serde(rename = "r")]
    pub rank: usize,
    #[serde(rename = "lora_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub target_modules: HashSet<String>,
}

/// One instantiated low-rank update `scale * B @ A`.
#[derive(Clone, Debug)]
pub struct LoraAdapter {
    /// Shape `(rank, in_dim)`.
    pub a: Tensor,
    /// Shape `(out_dim, rank)`.
    pub b: Tensor,
    pub scale: f64,
}

impl LoraAdapter {
    pub fn new(a: Tensor, b: Tensor, cfg: &LoraConfig) -> Result<Self> {
        let (rank_a, _) = a.dims2()?;
        let (_, rank_b) = b.dims2()?;
        if rank_a != cfg.rank || rank_b != cfg.rank {
            candle_core::bail!(
                "LoRA rank mismatch: config r={}, lora_A has {rank_a}, lora_B has {rank_b}",
                cfg.rank
            );
        }
        Ok(Self {
            a,
            b,
            scale: if cfg.rank == 0 {
                1.0
            } else {
                cfg.alpha / cfg.rank as f64
            },
        })
    }

    fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let a = self.a.to_dtype(dtype)?;
        let b = self.b.to_dtype(dtype)?;
        MatMul.matmul(&MatMul.matmul(xs, &a.t()?)?, &b.t()?)? * self.scale
    }
}

/// Adapters of one projection, indexed by LoRA id.
#[derive(Clone, Debug, Default)]
pub struct LoraWeights {
    adapters: Vec<Option<LoraAdapter>>,
}

impl LoraWeights {
    pub fn insert(&mut self, id: usize, adapter: LoraAdapter) {
        if self.adapters.len() <= id {
            self.adapters.resize(id + 1, None);
        }
        self.adapters[id] = Some(adapter);
    }

    pub fn get(&self, id: i64) -> Option<&LoraAdapter> {
        usize::try_from(id)
            .ok()
            .and_then(|id| self.adapters.get(id))
            .and_then(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.iter().all(Option::is_none)
    }
}

/// Add the per-sequence low-rank update to `output`.
///
/// `input` and `output` are token-major, `lora_input_lengths[i]` tokens belong to
/// batch entry `i`, and entry `i` uses adapter `lora_ids[i]`. Negative or unknown
/// ids leave their rows untouched. An empty `lora_ids` skips the update entirely.
pub fn apply_lora(
    input: &Tensor,
    output: &Tensor,
    lora_ids: &[i64],
    lora_input_lengths: &[usize],
    weights: &LoraWeights,
) -> Result<Tensor> {
    if lora_ids.is_empty() || weights.is_empty() {
        return Ok(output.clone());
    }
    if lora_ids.len() != lora_input_lengths.len() {
        candle_core::bail!(
            "{} lora ids but {} lora input lengths",
            lora_ids.len(),
            lora_input_lengths.len()
        );
    }
    let total: usize = lora_input_lengths.iter().sum();
    let (in_rows, _) = input.dims2()?;
    let (out_rows, _) = output.dims2()?;
    if total != in_rows || total != out_rows {
        candle_core::bail!(
            "lora input lengths cover {total} tokens, input has {in_rows}, output has {out_rows}"
        );
    }

    let mut pieces = Vec::with_capacity(lora_ids.len());
    let mut offset = 0;
    for (&id, &len) in lora_ids.iter().zip(lora_input_lengths) {
        if len == 0 {
            continue;
        }
        let out = output.narrow(0, offset, len)?;
        let piece = match weights.get(id) {
            Some(adapter) => {
                let delta = adapter.apply(&input.narrow(0, offset, len)?)?;
                (out + delta.to_dtype(output.dtype())?)?
            }
            None => {
                if id >= 0 {
                    debug!(target: "kvpage::lora", "no adapter loaded for lora id {id}");
                }
                out
            }
        };
        pieces.push(piece);
        offset += len;
    }
    Tensor::cat(&pieces, 0)
}
