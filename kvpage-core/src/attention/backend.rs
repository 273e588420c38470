use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::{AttentionConfig, AttentionRunConfig};

/// How context attention is computed for a layer group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionBackend {
    /// Fused varlen kernel reading prefix and new K/V through the block table.
    PagedFused,
    /// Fused varlen kernel over packed K/V.
    UnpagedFused,
    /// Fused varlen kernel, flash-attention style.
    OpenSourceFused,
    /// Fused kernel without GQA or ALiBi support.
    LegacyFused,
    /// QK^T, mask, softmax and PV as separate steps.
    Explicit,
}

impl AttentionBackend {
    pub fn use_fmha(&self) -> bool {
        !matches!(self, Self::Explicit)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PagedFused => "paged fused",
            Self::UnpagedFused => "unpaged fused",
            Self::OpenSourceFused => "open-source fused",
            Self::LegacyFused => "legacy fused",
            Self::Explicit => "explicit",
        }
    }
}

impl fmt::Display for AttentionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const FUSED_SM: [u32; 4] = [80, 86, 89, 90];
const FUSED_HEAD_SIZES: [usize; 10] = [32, 40, 64, 80, 96, 104, 128, 160, 192, 256];
const LEGACY_HEAD_SIZES: [usize; 3] = [32, 64, 128];

fn fused_shape_supported(cfg: &AttentionConfig, sm: u32) -> bool {
    FUSED_SM.contains(&sm) && cfg.is_causal && FUSED_HEAD_SIZES.contains(&cfg.size_per_head)
}

/// Pick the context attention backend. The first matching rule wins.
pub fn select_backend(cfg: &AttentionConfig, run_cfg: &AttentionRunConfig) -> AttentionBackend {
    let sm = run_cfg.compute_capability;
    let avail = &run_cfg.availability;
    let d = cfg.size_per_head;

    let backend = if run_cfg.request_paged_fmha
        && avail.paged_fused
        && fused_shape_supported(cfg, sm)
    {
        AttentionBackend::PagedFused
    } else if !run_cfg.request_paged_fmha
        && avail.unpaged_fused
        && fused_shape_supported(cfg, sm)
    {
        AttentionBackend::UnpagedFused
    } else if avail.open_source_fused
        && sm >= 80
        && d % 8 == 0
        && cfg.head_num % cfg.head_num_kv == 0
        && d <= 256
    {
        AttentionBackend::OpenSourceFused
    } else if avail.legacy_fused
        && cfg.head_num == cfg.head_num_kv
        && sm >= 75
        && !cfg.use_alibi
        && LEGACY_HEAD_SIZES.contains(&d)
    {
        AttentionBackend::LegacyFused
    } else {
        AttentionBackend::Explicit
    };
    info!(
        target: "kvpage::attention",
        "Using {backend} context attention (sm {sm}, head size {d}, {} heads / {} kv heads).",
        cfg.head_num,
        cfg.head_num_kv
    );
    backend
}

/// Whether long decodes split their kv range into parallel tiles.
pub fn use_multi_block_mode(run_cfg: &AttentionRunConfig) -> bool {
    let sm = run_cfg.compute_capability;
    if !run_cfg.enable_multi_block_mode {
        warn!(
            target: "kvpage::attention",
            "Multi-block decode is disabled by configuration; long decodes may be slower."
        );
        return false;
    }
    let enabled = sm == 80 || sm >= 89;
    if enabled {
        info!(target: "kvpage::attention", "Multi-block decode enabled (sm {sm}).");
    } else {
        warn!(
            target: "kvpage::attention",
            "Multi-block decode is not supported on sm {sm}."
        );
    }
    enabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::BackendAvailability;

    fn run(sm: u32, paged: bool, avail: BackendAvailability) -> AttentionRunConfig {
        AttentionRunConfig {
            compute_capability: sm,
            request_paged_fmha: paged,
            availability: avail,
            ..Default::default()
        }
    }

    fn all() -> BackendAvailability {
        BackendAvailability {
            paged_fused: true,
            unpaged_fused: true,
            open_source_fused: true,
            legacy_fused: true,
        }
    }

    #[test]
    fn test_paged_then_unpaged() {
        let cfg = AttentionConfig::new(32, 8, 128);
        assert_eq!(
            select_backend(&cfg, &run(80, true, all())),
            AttentionBackend::PagedFused
        );
        assert_eq!(
            select_backend(&cfg, &run(90, false, all())),
            AttentionBackend::UnpagedFused
        );
    }

    #[test]
    fn test_unsupported_sm_falls_through() {
        let cfg = AttentionConfig::new(32, 8, 128);
        // sm 87 is not a fused target but still sm >= 80.
        assert_eq!(
            select_backend(&cfg, &run(87, false, all())),
            AttentionBackend::OpenSourceFused
        );
        let mha = AttentionConfig::new(16, 16, 64);
        assert_eq!(
            select_backend(&mha, &run(75, false, all())),
            AttentionBackend::LegacyFused
        );
        assert_eq!(
            select_backend(&cfg, &run(75, false, all())),
            AttentionBackend::Explicit
        );
    }

    #[test]
    fn test_non_causal_skips_fused() {
        let mut cfg = AttentionConfig::new(32, 8, 128);
        cfg.is_causal = false;
        assert_eq!(
            select_backend(&cfg, &run(80, true, all())),
            AttentionBackend::OpenSourceFused
        );
    }

    #[test]
    fn test_head_size_rules() {
        // 48 is a multiple of 8 but not a fused head size.
        let cfg = AttentionConfig::new(8, 8, 48);
        assert_eq!(
            select_backend(&cfg, &run(80, false, all())),
            AttentionBackend::OpenSourceFused
        );
        let odd = AttentionConfig::new(8, 8, 36);
        assert_eq!(
            select_backend(&odd, &run(80, false, all())),
            AttentionBackend::Explicit
        );
        let mut alibi = AttentionConfig::new(8, 8, 64);
        alibi.use_alibi = true;
        let avail = BackendAvailability {
            legacy_fused: true,
            ..BackendAvailability::none()
        };
        assert_eq!(
            select_backend(&alibi, &run(80, false, avail)),
            AttentionBackend::Explicit
        );
    }

    #[test]
    fn test_use_fmha() {
        assert!(AttentionBackend::PagedFused.use_fmha());
        assert!(AttentionBackend::LegacyFused.use_fmha());
        assert!(!AttentionBackend::Explicit.use_fmha());
    }

    #[test]
    fn test_multi_block_mode() {
        let mut cfg = AttentionRunConfig::default();
        for (sm, expected) in [(80, true), (86, false), (89, true), (90, true), (75, false)] {
            cfg.compute_capability = sm;
            assert_eq!(use_multi_block_mode(&cfg), expected, "sm {sm}");
        }
        cfg.compute_capability = 90;
        cfg.enable_multi_block_mode = false;
        assert!(!use_multi_block_mode(&cfg));
    }
}
