use candle_core::Result;
use serde::{Deserialize, Serialize};

use crate::{paged_attention::KvCacheType, AttentionError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeStyle {
    #[default]
    None,
    /// Rotate the two halves of the rotary dims against each other.
    Neox,
    /// Rotate interleaved even/odd pairs.
    Gptj,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RopeConfig {
    pub style: RopeStyle,
    /// Rotary dims per head, 0 means the whole head.
    pub dim: usize,
    pub base: f32,
    /// Linear position interpolation factor, or the NTK factor when
    /// `dynamic_embedding_max_pos` is set.
    pub scale: f32,
    pub dynamic_embedding_max_pos: usize,
    pub base_scale: f32,
    pub use_logn_attn: bool,
    pub logn_seq_len: usize,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            style: RopeStyle::None,
            dim: 0,
            base: 10000.,
            scale: 1.,
            dynamic_embedding_max_pos: 0,
            base_scale: 1.,
            use_logn_attn: false,
            logn_seq_len: 2048,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> f32 {
    1.
}

fn default_tp() -> usize {
    1
}

fn default_eps() -> f64 {
    1e-5
}

fn default_block() -> usize {
    64
}

fn default_max_seq_len() -> usize {
    2048
}

/// Shape and behavior of one attention layer group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub head_num: usize,
    pub head_num_kv: usize,
    pub size_per_head: usize,
    #[serde(default)]
    pub rope: RopeConfig,
    #[serde(default = "default_true")]
    pub is_causal: bool,
    #[serde(default)]
    pub use_alibi: bool,
    #[serde(default = "default_one")]
    pub q_scaling: f32,
    #[serde(default = "default_true")]
    pub use_kvcache: bool,
    #[serde(default)]
    pub kv_cache_type: KvCacheType,
    #[serde(default)]
    pub smooth_quant: bool,
    #[serde(default)]
    pub qk_norm: bool,
    #[serde(default = "default_eps")]
    pub layernorm_eps: f64,
    #[serde(default = "default_tp")]
    pub tp_size: usize,
    #[serde(default = "default_block")]
    pub seq_size_per_block: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

impl AttentionConfig {
    pub fn new(head_num: usize, head_num_kv: usize, size_per_head: usize) -> Self {
        Self {
            head_num,
            head_num_kv,
            size_per_head,
            rope: RopeConfig::default(),
            is_causal: true,
            use_alibi: false,
            q_scaling: 1.,
            use_kvcache: true,
            kv_cache_type: KvCacheType::Auto,
            smooth_quant: false,
            qk_norm: false,
            layernorm_eps: default_eps(),
            tp_size: 1,
            seq_size_per_block: default_block(),
            max_seq_len: default_max_seq_len(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AttentionError::InvalidConfig(msg).into());
        if self.head_num == 0 || self.head_num_kv == 0 || self.size_per_head == 0 {
            return invalid(format!(
                "head_num {}, head_num_kv {} and size_per_head {} must be non-zero",
                self.head_num, self.head_num_kv, self.size_per_head
            ));
        }
        if self.head_num_kv > self.head_num || self.head_num % self.head_num_kv != 0 {
            return invalid(format!(
                "head_num {} is not a multiple of head_num_kv {}",
                self.head_num, self.head_num_kv
            ));
        }
        if self.tp_size == 0 || self.head_num % self.tp_size != 0 {
            return invalid(format!(
                "head_num {} does not split over tp_size {}",
                self.head_num, self.tp_size
            ));
        }
        if self.head_num_kv > 1 && self.head_num_kv % self.tp_size != 0 {
            return invalid(format!(
                "head_num_kv {} does not split over tp_size {}",
                self.head_num_kv, self.tp_size
            ));
        }
        if self.seq_size_per_block == 0 || self.max_seq_len == 0 {
            return invalid("seq_size_per_block and max_seq_len must be non-zero".to_string());
        }
        if self.q_scaling <= 0. {
            return invalid(format!("q_scaling must be positive, got {}", self.q_scaling));
        }
        if self.rope.style != RopeStyle::None {
            let dim = self.rotary_dim();
            if dim % 2 != 0 || dim > self.size_per_head {
                return invalid(format!(
                    "rotary dim {dim} must be even and at most size_per_head {}",
                    self.size_per_head
                ));
            }
        }
        Ok(())
    }

    pub fn local_head_num(&self) -> usize {
        self.head_num / self.tp_size
    }

    /// A single shared KV head is replicated on every rank.
    pub fn local_head_num_kv(&self) -> usize {
        if self.head_num_kv == 1 {
            1
        } else {
            self.head_num_kv / self.tp_size
        }
    }

    /// Width of one token row of the fused QKV projection on this rank.
    pub fn qkv_merged_size(&self) -> usize {
        (self.local_head_num() + 2 * self.local_head_num_kv()) * self.size_per_head
    }

    pub fn softmax_scale(&self) -> f32 {
        1. / ((self.size_per_head as f32).sqrt() * self.q_scaling)
    }

    pub fn rotary_dim(&self) -> usize {
        if self.rope.dim == 0 {
            self.size_per_head
        } else {
            self.rope.dim
        }
    }
}

/// Which fused backends this build can offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendAvailability {
    pub paged_fused: bool,
    pub unpaged_fused: bool,
    pub open_source_fused: bool,
    pub legacy_fused: bool,
}

impl Default for BackendAvailability {
    fn default() -> Self {
        Self {
            paged_fused: true,
            unpaged_fused: true,
            open_source_fused: true,
            legacy_fused: cfg!(feature = "legacy-fmha"),
        }
    }
}

impl BackendAvailability {
    pub fn none() -> Self {
        Self {
            paged_fused: false,
            unpaged_fused: false,
            open_source_fused: false,
            legacy_fused: false,
        }
    }
}

/// Process-wide attention settings, read once at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionRunConfig {
    pub compute_capability: u32,
    pub enable_multi_block_mode: bool,
    pub free_buffer_after_forward: bool,
    pub request_paged_fmha: bool,
    pub availability: BackendAvailability,
}

impl Default for AttentionRunConfig {
    fn default() -> Self {
        Self {
            compute_capability: 80,
            enable_multi_block_mode: true,
            free_buffer_after_forward: false,
            request_paged_fmha: false,
            availability: BackendAvailability::default(),
        }
    }
}

impl AttentionRunConfig {
    /// Defaults, with `ENABLE_MULTI_BLOCK_MODE=OFF` turning multi-block decode off.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if std::env::var("ENABLE_MULTI_BLOCK_MODE").is_ok_and(|v| v == "OFF") {
            cfg.enable_multi_block_mode = false;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_heads() {
        let mut cfg = AttentionConfig::new(32, 8, 128);
        cfg.tp_size = 4;
        cfg.validate().unwrap();
        assert_eq!(cfg.local_head_num(), 8);
        assert_eq!(cfg.local_head_num_kv(), 2);
        assert_eq!(cfg.qkv_merged_size(), (8 + 4) * 128);

        let mut mqa = AttentionConfig::new(32, 1, 64);
        mqa.tp_size = 4;
        mqa.validate().unwrap();
        assert_eq!(mqa.local_head_num_kv(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_heads() {
        assert!(AttentionConfig::new(8, 3, 64).validate().is_err());
        assert!(AttentionConfig::new(4, 8, 64).validate().is_err());
        assert!(AttentionConfig::new(0, 0, 64).validate().is_err());
        let mut cfg = AttentionConfig::new(8, 8, 64);
        cfg.rope.style = RopeStyle::Neox;
        cfg.rope.dim = 65;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_softmax_scale() {
        let mut cfg = AttentionConfig::new(8, 8, 64);
        cfg.q_scaling = 2.;
        assert!((cfg.softmax_scale() - 1. / 16.).abs() < 1e-7);
    }

    #[test]
    fn test_json_defaults() {
        let cfg: AttentionConfig = serde_json::from_str(
            r#"{"head_num": 8, "head_num_kv": 2, "size_per_head": 64,
                "rope": {"style": "neox", "base": 500000.0}}"#,
        )
        .unwrap();
        assert!(cfg.is_causal && cfg.use_kvcache);
        assert_eq!(cfg.rope.style, RopeStyle::Neox);
        assert_eq!(cfg.rope.scale, 1.);
        assert_eq!(cfg.tp_size, 1);

        let run: AttentionRunConfig =
            serde_json::from_str(r#"{"compute_capability": 89}"#).unwrap();
        assert!(run.enable_multi_block_mode);
        assert!(run.availability.paged_fused);
    }
}
