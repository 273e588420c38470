use candle_core::{DType, Device, Result, Tensor};
use kvpage_quant::{apply_lora, per_token_quantize, SumAllReduce};
use tracing::debug;

use super::{
    alibi::alibi_slopes,
    arena::{ArenaRelease, ScratchArena},
    backend::{select_backend, use_multi_block_mode, AttentionBackend},
    backends::{
        decode::{masked_decode, max_seq_len_tile, slot_rows, DecodeSlot},
        dispatch_kv_layer,
        explicit::{explicit_attention, ExplicitBuffers, ExplicitSeq},
        fused::{fused_varlen, FusedOutput, VarlenSeq},
        to_host_f32, KernelParams, KvLayer, KvRow,
    },
    config::{AttentionConfig, AttentionRunConfig, RopeStyle},
    inputs::{slice_context, slice_generate, AttentionInputs, AttentionWeights},
    rotary::{apply_logn, apply_rotary},
};
use crate::{
    paged_attention::{FlatBlockPointers, KvCacheBuffer, NULL_BLOCK_ID},
    utils::ceil_div,
    AttentionError,
};

/// Runs one attention layer group over mixed generate and context batches.
pub struct AttentionExecutor {
    cfg: AttentionConfig,
    run_cfg: AttentionRunConfig,
    device: Device,
    dtype: DType,
    backend: AttentionBackend,
    multi_block_mode: bool,
    all_reduce: Option<SumAllReduce>,
    /// Slopes of this rank's heads when ALiBi is on.
    alibi: Option<Vec<f32>>,
    arena: ScratchArena,
}

/// Borrowed per-call state, so the arena can be borrowed mutably alongside it.
struct Step<'a> {
    cfg: &'a AttentionConfig,
    backend: AttentionBackend,
    multi_block_mode: bool,
    device: &'a Device,
    dtype: DType,
    heads: usize,
    heads_kv: usize,
    head_size: usize,
}

/// Context slot layout of a step.
struct ContextShape {
    lengths: Vec<usize>,
    prefixes: Vec<usize>,
    /// First token row of each context slot within the context slice.
    starts: Vec<usize>,
    tokens: usize,
    max_seq: usize,
    seq_with_prefix: usize,
}

impl ContextShape {
    fn new(inputs: &AttentionInputs<'_>) -> Self {
        let lengths = inputs.context_input_lengths().to_vec();
        let prefixes: Vec<usize> = (0..lengths.len()).map(|c| inputs.prefix_length(c)).collect();
        let mut starts = Vec::with_capacity(lengths.len());
        let mut tokens = 0;
        for &l in &lengths {
            starts.push(tokens);
            tokens += l;
        }
        let max_seq = lengths.iter().copied().max().unwrap_or(0);
        let max_prefix = prefixes.iter().copied().max().unwrap_or(0);
        Self {
            lengths,
            prefixes,
            starts,
            tokens,
            max_seq,
            seq_with_prefix: max_seq + max_prefix,
        }
    }
}

impl AttentionExecutor {
    pub fn new(
        cfg: AttentionConfig,
        run_cfg: AttentionRunConfig,
        device: &Device,
        dtype: DType,
        all_reduce: Option<SumAllReduce>,
    ) -> Result<Self> {
        cfg.validate()?;
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType(dtype).into());
        }
        if cfg.tp_size > 1 {
            match &all_reduce {
                None => return Err(AttentionError::MissingAllReduce(cfg.tp_size).into()),
                Some(ar) if ar.world_size() != cfg.tp_size => {
                    return Err(AttentionError::InvalidConfig(format!(
                        "tp_size is {} but the all-reduce group has {} ranks",
                        cfg.tp_size,
                        ar.world_size()
                    ))
                    .into())
                }
                Some(_) => (),
            }
        }
        let backend = select_backend(&cfg, &run_cfg);
        let host_only = matches!(backend, AttentionBackend::PagedFused)
            || (backend.use_fmha() && !cfg!(feature = "flash-attn"));
        if host_only && !device.is_cpu() {
            return Err(AttentionError::UnsupportedDevice {
                backend: backend.name(),
                device: format!("{device:?}"),
            }
            .into());
        }
        let multi_block_mode = use_multi_block_mode(&run_cfg);
        let alibi = cfg.use_alibi.then(|| {
            let local = cfg.local_head_num();
            let rank = all_reduce.as_ref().map_or(0, SumAllReduce::rank);
            alibi_slopes(cfg.head_num)[rank * local..(rank + 1) * local].to_vec()
        });
        Ok(Self {
            cfg,
            run_cfg,
            device: device.clone(),
            dtype,
            backend,
            multi_block_mode,
            all_reduce,
            alibi,
            arena: ScratchArena::new(device),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.cfg
    }

    pub fn backend(&self) -> AttentionBackend {
        self.backend
    }

    pub fn multi_block_mode(&self) -> bool {
        self.multi_block_mode
    }

    pub fn arena(&self) -> &ScratchArena {
        &self.arena
    }

    /// Per `[ctx_slot, head, token]` log-sum-exp of the last fused context pass.
    pub fn softmax_lse(&self) -> &[f32] {
        self.arena.softmax_lse()
    }

    /// Attention output of every token, `[h_tokens, hidden]`.
    pub fn forward(
        &mut self,
        inputs: &AttentionInputs<'_>,
        weights: &AttentionWeights,
    ) -> Result<Tensor> {
        inputs.validate()?;
        if weights.qkv.out_dim() != self.cfg.qkv_merged_size() {
            return Err(AttentionError::InvalidConfig(format!(
                "qkv projection has {} outputs, expected {}",
                weights.qkv.out_dim(),
                self.cfg.qkv_merged_size()
            ))
            .into());
        }
        if let Some(cache) = inputs.kv_cache {
            let cache_type = cache.config().kv_cache_type;
            if cache_type != self.cfg.kv_cache_type {
                return Err(AttentionError::InvalidConfig(format!(
                    "layer expects a {:?} kv cache but was given {cache_type:?}",
                    self.cfg.kv_cache_type
                ))
                .into());
            }
        }
        let mut arena = ArenaRelease::new(&mut self.arena, self.run_cfg.free_buffer_after_forward);
        let step = Step {
            cfg: &self.cfg,
            backend: self.backend,
            multi_block_mode: self.multi_block_mode,
            device: &self.device,
            dtype: self.dtype,
            heads: self.cfg.local_head_num(),
            heads_kv: self.cfg.local_head_num_kv(),
            head_size: self.cfg.size_per_head,
        };
        let alibi = match &inputs.linear_bias_slopes {
            Some(slopes) => Some(to_host_f32(slopes)?),
            None => self.alibi.clone(),
        };
        let ctx = ContextShape::new(inputs);
        step.allocate(&mut arena, inputs, &ctx)?;
        step.project_qkv(&mut arena, inputs, weights)?;
        if inputs.context_batch_size > 0 {
            step.context_attention(&mut arena, inputs, &ctx, alibi.as_deref())?;
        }
        if inputs.generate_batch_size > 0 {
            step.decode_attention(&mut arena, inputs, alibi.as_deref())?;
        }
        let out = step.output(&mut arena, inputs, weights)?;
        match &self.all_reduce {
            Some(ar) if self.cfg.tp_size > 1 => ar.sum_all_reduce(&out),
            _ => Ok(out),
        }
    }
}

impl Step<'_> {
    fn merged_heads(&self) -> usize {
        self.heads + 2 * self.heads_kv
    }

    fn kernel_params<'s>(&self, alibi: Option<&'s [f32]>) -> KernelParams<'s> {
        KernelParams {
            heads: self.heads,
            heads_kv: self.heads_kv,
            head_size: self.head_size,
            scale: self.cfg.softmax_scale(),
            causal: self.cfg.is_causal,
            alibi,
        }
    }

    fn allocate(
        &self,
        arena: &mut ScratchArena,
        inputs: &AttentionInputs<'_>,
        ctx: &ContextShape,
    ) -> Result<()> {
        let h_tokens = inputs.h_token_num();
        let (h, d) = (self.heads, self.head_size);
        let ctx_bs = inputs.context_batch_size;
        let use_fmha = self.backend.use_fmha();

        arena.re_malloc("qkv_buf", self.dtype, (h_tokens, self.cfg.qkv_merged_size()))?;
        arena.re_malloc("qkv_buf_2", self.dtype, (h_tokens, h * d))?;
        if ctx_bs > 0 {
            if self.cfg.use_kvcache || self.cfg.rope.style != RopeStyle::None || !use_fmha {
                arena.re_malloc(
                    "q_buf_2",
                    self.dtype,
                    (ctx_bs, ctx.seq_with_prefix, self.merged_heads(), d),
                )?;
            }
            if use_fmha {
                arena.re_malloc_softmax_lse(ctx_bs * h * ctx.max_seq);
            } else {
                let qk_shape = (ctx_bs, h, ctx.max_seq, ctx.seq_with_prefix);
                arena.re_malloc("qk_buf", DType::F32, qk_shape)?;
                arena.re_malloc("qkv_buf_3", self.dtype, (ctx_bs, ctx.max_seq, h, d))?;
            }
        }
        if self.cfg.smooth_quant {
            arena.re_malloc("dense_gemm_dynamic_scale", DType::F32, h_tokens)?;
        }
        let gen_bs = inputs.generate_batch_size;
        if self.multi_block_mode && gen_bs > 0 {
            let tiles = max_seq_len_tile(d, self.dtype.size_in_bytes());
            arena.re_malloc_multi_block(tiles, gen_bs, h, d);
        }
        Ok(())
    }

    fn project_qkv(
        &self,
        arena: &mut ScratchArena,
        inputs: &AttentionInputs<'_>,
        weights: &AttentionWeights,
    ) -> Result<()> {
        let h_tokens = inputs.h_token_num();
        let qkv = if self.cfg.smooth_quant {
            let scale = inputs
                .dynamic_scale
                .as_ref()
                .ok_or(AttentionError::MissingInput("dynamic_scale"))?;
            weights.qkv.forward_dynamic(&inputs.input, scale)?
        } else {
            weights.qkv.forward(&inputs.input)?
        };
        let qkv = match &weights.qkv_lora {
            Some(lora) => apply_lora(
                &inputs.input,
                &qkv,
                &inputs.lora_ids,
                &inputs.lora_input_lengths,
                lora,
            )?,
            None => qkv,
        };
        let merged = self.cfg.qkv_merged_size();
        if qkv.dims2()? != (h_tokens, merged) {
            candle_core::bail!(
                "qkv projection produced {:?}, expected ({h_tokens}, {merged})",
                qkv.dims()
            );
        }
        let mut qkv = qkv.to_dtype(self.dtype)?;
        if self.cfg.qk_norm {
            let (h, hkv, d) = (self.heads, self.heads_kv, self.head_size);
            let eps = self.cfg.layernorm_eps as f32;
            let norm = |x: Tensor, gamma: &Option<Tensor>, name: &'static str| -> Result<Tensor> {
                let gamma = gamma.as_ref().ok_or(AttentionError::MissingInput(name))?;
                let heads = x.dim(1)? / d;
                candle_nn::ops::rms_norm(
                    &x.reshape((h_tokens, heads, d))?.contiguous()?,
                    &gamma.to_dtype(self.dtype)?,
                    eps,
                )?
                .reshape((h_tokens, heads * d))
            };
            let q = norm(qkv.narrow(1, 0, h * d)?, &weights.q_norm, "q_norm")?;
            let k = norm(qkv.narrow(1, h * d, hkv * d)?, &weights.k_norm, "k_norm")?;
            let v = qkv.narrow(1, (h + hkv) * d, hkv * d)?;
            qkv = Tensor::cat(&[&q, &k, &v], 1)?;
        }
        arena
            .re_malloc("qkv_buf", self.dtype, (h_tokens, merged))?
            .slice_set(&qkv.contiguous()?, 0, 0)
    }

    /// `(q, k, v)` of `rows` as `[tokens, heads, D]`.
    fn split_qkv(&self, rows: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (h, hkv, d) = (self.heads, self.heads_kv, self.head_size);
        let n = rows.dim(0)?;
        Ok((
            rows.narrow(1, 0, h * d)?.reshape((n, h, d))?,
            rows.narrow(1, h * d, hkv * d)?.reshape((n, hkv, d))?,
            rows.narrow(1, (h + hkv) * d, hkv * d)?.reshape((n, hkv, d))?,
        ))
    }

    fn rotate(
        &self,
        q: &Tensor,
        k: &Tensor,
        positions: &[usize],
        seq_len: usize,
    ) -> Result<(Tensor, Tensor)> {
        let rope = &self.cfg.rope;
        let rot_dim = self.cfg.rotary_dim();
        let q = apply_rotary(q, rope, rot_dim, positions, seq_len)?;
        let k = apply_rotary(k, rope, rot_dim, positions, seq_len)?;
        Ok((apply_logn(&q, rope, positions)?, k))
    }

    fn context_attention(
        &self,
        arena: &mut ScratchArena,
        inputs: &AttentionInputs<'_>,
        ctx: &ContextShape,
        alibi: Option<&[f32]>,
    ) -> Result<()> {
        let gen_bs = inputs.generate_batch_size;
        let layer = inputs.layer_id;
        let qkv_buf = self.qkv_buf(arena, inputs)?;
        let rows = slice_context(&qkv_buf, gen_bs)?;
        let (q, k, v) = self.split_qkv(&rows)?;

        let mut positions = Vec::with_capacity(ctx.tokens);
        for (c, &len) in ctx.lengths.iter().enumerate() {
            match &inputs.position_ids {
                Some(ids) => {
                    let start = gen_bs + ctx.starts[c];
                    positions.extend_from_slice(&ids[start..start + len]);
                }
                None => positions.extend((0..len).map(|i| ctx.prefixes[c] + i)),
            }
        }
        let seq_len = ctx.seq_with_prefix;
        let (q, k) = self.rotate(&q, &k, &positions, seq_len)?;

        let paged = if self.cfg.use_kvcache {
            let (cache, pointers) = kv_inputs(inputs, "context attention with use_kvcache")?;
            let s = cache.block_size();
            for c in 0..ctx.lengths.len() {
                let (p, len) = (ctx.prefixes[c], ctx.lengths[c]);
                if len == 0 {
                    continue;
                }
                let blocks = block_ids(pointers, gen_bs + c, layer, ceil_div(p + len, s))?;
                cache.write(
                    layer,
                    &blocks,
                    p,
                    &k.narrow(0, ctx.starts[c], len)?,
                    &v.narrow(0, ctx.starts[c], len)?,
                )?;
            }
            Some((cache, pointers))
        } else {
            None
        };

        let out = match self.backend {
            AttentionBackend::Explicit => {
                let mask = inputs
                    .attention_mask
                    .as_ref()
                    .ok_or(AttentionError::MissingInput("attention_mask"))?;
                let mut seqs = Vec::with_capacity(ctx.lengths.len());
                for c in 0..ctx.lengths.len() {
                    let (kc, vc) = self.full_kv(paged, inputs, ctx, c, &k, &v)?;
                    seqs.push(ExplicitSeq {
                        q: q.narrow(0, ctx.starts[c], ctx.lengths[c])?,
                        k: kc,
                        v: vc,
                    });
                }
                let bufs = ExplicitBuffers {
                    q_buf_2: arena.re_malloc(
                        "q_buf_2",
                        self.dtype,
                        (
                            ctx.lengths.len(),
                            ctx.seq_with_prefix,
                            self.merged_heads(),
                            self.head_size,
                        ),
                    )?,
                    qk_buf: arena.re_malloc(
                        "qk_buf",
                        DType::F32,
                        (ctx.lengths.len(), self.heads, ctx.max_seq, ctx.seq_with_prefix),
                    )?,
                    qkv_buf_3: arena.re_malloc(
                        "qkv_buf_3",
                        self.dtype,
                        (ctx.lengths.len(), ctx.max_seq, self.heads, self.head_size),
                    )?,
                };
                explicit_attention(&seqs, mask, alibi, self.cfg.softmax_scale(), &bufs)?
            }
            AttentionBackend::PagedFused => {
                let (cache, pointers) =
                    paged.ok_or(AttentionError::NoKvCache("paged fused attention"))?;
                let s = cache.block_size();
                let seqs: Vec<VarlenSeq> = (0..ctx.lengths.len())
                    .map(|c| VarlenSeq {
                        q_start: ctx.starts[c],
                        q_len: ctx.lengths[c],
                        rows: slot_rows(
                            pointers,
                            layer,
                            gen_bs + c,
                            ctx.prefixes[c] + ctx.lengths[c],
                            s,
                            None,
                        ),
                    })
                    .collect();
                let q_host = self.stage_q(arena, ctx, &q, &k, &v)?;
                let params = self.kernel_params(alibi);
                let res = dispatch_kv_layer!(cache.layer(layer), |kv| Ok(fused_varlen(
                    &q_host, kv, &seqs, &params
                )))?;
                self.finish_fused(arena, ctx, res)?
            }
            AttentionBackend::UnpagedFused
            | AttentionBackend::OpenSourceFused
            | AttentionBackend::LegacyFused => {
                if self.backend == AttentionBackend::LegacyFused && self.heads != self.heads_kv {
                    return Err(AttentionError::HeadMismatch {
                        backend: self.backend.name(),
                        head_num: self.cfg.head_num,
                        head_num_kv: self.cfg.head_num_kv,
                    }
                    .into());
                }
                let mut ks = Vec::with_capacity(ctx.lengths.len());
                let mut vs = Vec::with_capacity(ctx.lengths.len());
                let mut seqs = Vec::with_capacity(ctx.lengths.len());
                let mut kv_lens = Vec::with_capacity(ctx.lengths.len());
                let mut kv_start = 0;
                for c in 0..ctx.lengths.len() {
                    let (kc, vc) = self.full_kv(paged, inputs, ctx, c, &k, &v)?;
                    let kv_len = kc.dim(0)?;
                    seqs.push(VarlenSeq {
                        q_start: ctx.starts[c],
                        q_len: ctx.lengths[c],
                        rows: (kv_start..kv_start + kv_len).map(KvRow::dense).collect(),
                    });
                    kv_lens.push(kv_len);
                    kv_start += kv_len;
                    ks.push(kc);
                    vs.push(vc);
                }
                let k_packed = Tensor::cat(&ks, 0)?;
                let v_packed = Tensor::cat(&vs, 0)?;
                #[cfg(feature = "flash-attn")]
                if self.device.is_cuda() {
                    let slopes = alibi
                        .map(|s| Tensor::from_slice(s, s.len(), self.device))
                        .transpose()?;
                    let out = super::backends::flash::flash_attn_varlen(
                        &q,
                        &k_packed,
                        &v_packed,
                        &ctx.lengths,
                        &kv_lens,
                        self.cfg.softmax_scale(),
                        self.cfg.is_causal,
                        slopes.as_ref(),
                    )?;
                    return self.store_context(arena, inputs, &out);
                }
                let q_host = self.stage_q(arena, ctx, &q, &k, &v)?;
                let k_host = to_host_f32(&k_packed)?;
                let v_host = to_host_f32(&v_packed)?;
                let kv = KvLayer::dense(&k_host, &v_host, self.heads_kv, self.head_size);
                debug!(
                    target: "kvpage::attention",
                    "{} over {} packed kv tokens ({:?})",
                    self.backend,
                    kv_lens.iter().sum::<usize>(),
                    kv_lens
                );
                let res = fused_varlen(&q_host, &kv, &seqs, &self.kernel_params(alibi));
                self.finish_fused(arena, ctx, res)?
            }
        };
        self.store_context(arena, inputs, &out)
    }

    /// Keys and values of context slot `c`: the cached prefix followed by the new tokens.
    fn full_kv(
        &self,
        paged: Option<(&KvCacheBuffer, &FlatBlockPointers)>,
        inputs: &AttentionInputs<'_>,
        ctx: &ContextShape,
        c: usize,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (p, start, len) = (ctx.prefixes[c], ctx.starts[c], ctx.lengths[c]);
        let new_k = k.narrow(0, start, len)?;
        let new_v = v.narrow(0, start, len)?;
        if p == 0 {
            return Ok((new_k, new_v));
        }
        let (cache, pointers) = match paged {
            Some(p) => p,
            None => kv_inputs(inputs, "prefix reuse")?,
        };
        let blocks = block_ids(
            pointers,
            inputs.generate_batch_size + c,
            inputs.layer_id,
            ceil_div(p, cache.block_size()),
        )?;
        let (pk, pv) = cache.gather(inputs.layer_id, &blocks, p)?;
        Ok((
            Tensor::cat(&[&pk.to_dtype(self.dtype)?, &new_k], 0)?,
            Tensor::cat(&[&pv.to_dtype(self.dtype)?, &new_v], 0)?,
        ))
    }

    /// Store rotated context rows in `q_buf_2` and return the queries for the host kernels.
    fn stage_q(
        &self,
        arena: &mut ScratchArena,
        ctx: &ContextShape,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<Vec<f32>> {
        if arena.contains("q_buf_2") {
            let rows = ctx.lengths.len() * ctx.seq_with_prefix;
            let shape = (rows, self.merged_heads(), self.head_size);
            let buf = arena.re_malloc("q_buf_2", self.dtype, shape)?;
            buf.slice_set(&Tensor::cat(&[q, k, v], 1)?.contiguous()?, 0, 0)?;
            to_host_f32(&buf.narrow(0, 0, ctx.tokens)?.narrow(1, 0, self.heads)?)
        } else {
            to_host_f32(q)
        }
    }

    /// Scatter log-sum-exp into `[ctx_slot, head, token]` and wrap the output.
    fn finish_fused(
        &self,
        arena: &mut ScratchArena,
        ctx: &ContextShape,
        res: FusedOutput,
    ) -> Result<Tensor> {
        let h = self.heads;
        let lse = arena.re_malloc_softmax_lse(ctx.lengths.len() * h * ctx.max_seq);
        lse.fill(f32::NEG_INFINITY);
        for (c, &len) in ctx.lengths.iter().enumerate() {
            for i in 0..len {
                let token = ctx.starts[c] + i;
                for head in 0..h {
                    lse[(c * h + head) * ctx.max_seq + i] = res.lse[token * h + head];
                }
            }
        }
        Tensor::from_vec(res.out, (ctx.tokens, h, self.head_size), self.device)?
            .to_dtype(self.dtype)
    }

    fn store_context(
        &self,
        arena: &mut ScratchArena,
        inputs: &AttentionInputs<'_>,
        out: &Tensor,
    ) -> Result<()> {
        let rows = out
            .reshape((out.dim(0)?, self.heads * self.head_size))?
            .to_dtype(self.dtype)?
            .contiguous()?;
        self.qkv_buf_2(arena, inputs)?
            .slice_set(&rows, 0, inputs.generate_batch_size)
    }

    /// `[h_tokens, qkv_merged]` projection output.
    fn qkv_buf(&self, arena: &mut ScratchArena, inputs: &AttentionInputs<'_>) -> Result<Tensor> {
        let shape = (inputs.h_token_num(), self.cfg.qkv_merged_size());
        arena.re_malloc("qkv_buf", self.dtype, shape)
    }

    /// `[h_tokens, H*D]` attention output.
    fn qkv_buf_2(&self, arena: &mut ScratchArena, inputs: &AttentionInputs<'_>) -> Result<Tensor> {
        let shape = (inputs.h_token_num(), self.heads * self.head_size);
        arena.re_malloc("qkv_buf_2", self.dtype, shape)
    }

    fn decode_attention(
        &self,
        arena: &mut ScratchArena,
        inputs: &AttentionInputs<'_>,
        alibi: Option<&[f32]>,
    ) -> Result<()> {
        if !self.cfg.use_kvcache {
            return Err(AttentionError::NoKvCache("decode").into());
        }
        let (cache, pointers) = kv_inputs(inputs, "decode")?;
        let gen_bs = inputs.generate_batch_size;
        let layer = inputs.layer_id;
        let s = cache.block_size();
        let qkv_buf = self.qkv_buf(arena, inputs)?;
        let rows = slice_generate(&qkv_buf, gen_bs)?;
        let (q, k, v) = self.split_qkv(&rows)?;

        let seq_lens = &inputs.sequence_lengths[..gen_bs];
        let positions = match &inputs.position_ids {
            Some(ids) => ids[..gen_bs].to_vec(),
            None => seq_lens.to_vec(),
        };
        let max_len = seq_lens.iter().copied().max().unwrap_or(0) + 1;
        let (q, k) = self.rotate(&q, &k, &positions, max_len)?;

        let finished = |b: usize| {
            inputs
                .finished
                .as_ref()
                .and_then(|f| f.get(b).copied())
                .unwrap_or(false)
        };
        let mut slots = Vec::with_capacity(gen_bs);
        for (b, &seq_len) in seq_lens.iter().enumerate() {
            if finished(b) {
                slots.push(DecodeSlot {
                    rows: Vec::new(),
                    finished: true,
                });
                continue;
            }
            let blocks = block_ids(pointers, b, layer, ceil_div(seq_len + 1, s))?;
            cache.write(layer, &blocks, seq_len, &k.narrow(0, b, 1)?, &v.narrow(0, b, 1)?)?;
            slots.push(DecodeSlot {
                rows: slot_rows(
                    pointers,
                    layer,
                    b,
                    seq_len + 1,
                    s,
                    inputs.cache_indirection.as_ref(),
                ),
                finished: false,
            });
        }

        let q_host = to_host_f32(&q)?;
        let params = self.kernel_params(alibi);
        let scratch = if self.multi_block_mode {
            arena.multi_block_mut()
        } else {
            None
        };
        let out = dispatch_kv_layer!(cache.layer(layer), |kv| Ok(masked_decode(
            &q_host, kv, &slots, &params, scratch
        )))?;
        let out = Tensor::from_vec(out, (gen_bs, self.heads * self.head_size), self.device)?
            .to_dtype(self.dtype)?;
        self.qkv_buf_2(arena, inputs)?.slice_set(&out, 0, 0)
    }

    fn output(
        &self,
        arena: &mut ScratchArena,
        inputs: &AttentionInputs<'_>,
        weights: &AttentionWeights,
    ) -> Result<Tensor> {
        let h_tokens = inputs.h_token_num();
        let mut attn = self.qkv_buf_2(arena, inputs)?;
        if let Some((gamma, beta)) = &weights.attention_layernorm {
            let beta = match beta {
                Some(b) => b.to_dtype(self.dtype)?,
                None => gamma.zeros_like()?.to_dtype(self.dtype)?,
            };
            attn = candle_nn::ops::layer_norm(
                &attn.contiguous()?,
                &gamma.to_dtype(self.dtype)?,
                &beta,
                self.cfg.layernorm_eps as f32,
            )?;
        }
        let out = if self.cfg.smooth_quant {
            let (xq, scale) = per_token_quantize(&attn, weights.dense.smoother())?;
            let scale_buf = arena.re_malloc("dense_gemm_dynamic_scale", DType::F32, h_tokens)?;
            scale_buf.slice_set(&scale.contiguous()?, 0, 0)?;
            weights.dense.forward_dynamic(&xq, &scale_buf)?
        } else {
            weights.dense.forward(&attn)?
        };
        match &weights.dense_lora {
            Some(lora) => apply_lora(
                &attn,
                &out,
                &inputs.lora_ids,
                &inputs.lora_input_lengths,
                lora,
            ),
            None => Ok(out),
        }
    }
}

fn kv_inputs<'a>(
    inputs: &'a AttentionInputs<'_>,
    what: &'static str,
) -> Result<(&'a KvCacheBuffer, &'a FlatBlockPointers)> {
    match (inputs.kv_cache, inputs.block_pointers.as_ref()) {
        (Some(cache), Some(pointers)) => Ok((cache, pointers)),
        _ => Err(AttentionError::NoKvCache(what).into()),
    }
}

/// The first `n` key blocks of `slot`. Null padding means the table is too short.
fn block_ids(
    pointers: &FlatBlockPointers,
    slot: usize,
    layer: usize,
    n: usize,
) -> Result<Vec<usize>> {
    let ids = pointers.blocks(slot, 0, layer, n);
    if ids.len() < n || ids.contains(&NULL_BLOCK_ID) {
        candle_core::bail!(
            "batch slot {slot} holds fewer than the {n} blocks needed at layer {layer}"
        );
    }
    Ok(ids.iter().map(|&b| b as usize).collect())
}

#[cfg(test)]
mod tests {
    use kvpage_quant::Comm;

    use super::*;
    use crate::attention::BackendAvailability;

    fn run_cfg(availability: BackendAvailability) -> AttentionRunConfig {
        AttentionRunConfig {
            availability,
            ..Default::default()
        }
    }

    fn build(
        cfg: AttentionConfig,
        availability: BackendAvailability,
        dtype: DType,
        all_reduce: Option<SumAllReduce>,
    ) -> Result<AttentionExecutor> {
        AttentionExecutor::new(cfg, run_cfg(availability), &Device::Cpu, dtype, all_reduce)
    }

    #[test]
    fn test_new_validates() {
        let none = BackendAvailability::none();
        let cfg = AttentionConfig::new(8, 2, 64);
        let err = build(cfg.clone(), none, DType::U8, None).err().unwrap();
        assert!(err.to_string().contains("dtype"), "{err}");

        let mut tp = cfg.clone();
        tp.tp_size = 2;
        let err = build(tp.clone(), none, DType::F32, None).err().unwrap();
        assert!(err.to_string().contains("all-reduce"), "{err}");

        // A group of the wrong size.
        let single = SumAllReduce::new(&Comm::single());
        assert!(build(tp, none, DType::F32, Some(single)).is_err());

        let bad = AttentionConfig::new(8, 3, 64);
        assert!(build(bad, BackendAvailability::default(), DType::F32, None).is_err());
    }

    #[test]
    fn test_backend_is_chosen_once() -> Result<()> {
        let cfg = AttentionConfig::new(8, 2, 64);
        let ex = build(cfg.clone(), BackendAvailability::default(), DType::F32, None)?;
        assert_eq!(ex.backend(), AttentionBackend::UnpagedFused);
        assert!(ex.multi_block_mode());
        let ex = build(cfg, BackendAvailability::none(), DType::BF16, None)?;
        assert_eq!(ex.backend(), AttentionBackend::Explicit);
        Ok(())
    }

    #[test]
    fn test_alibi_slopes_follow_rank() -> Result<()> {
        let mut cfg = AttentionConfig::new(8, 8, 64);
        cfg.use_alibi = true;
        cfg.tp_size = 2;
        let comms = Comm::local_group(2);
        let ex = AttentionExecutor::new(
            cfg,
            AttentionRunConfig::default(),
            &Device::Cpu,
            DType::F32,
            Some(SumAllReduce::new(&comms[1])),
        )?;
        assert_eq!(ex.alibi.as_deref(), Some(&alibi_slopes(8)[4..]));
        Ok(())
    }

    #[test]
    fn test_block_ids_rejects_short_tables() -> Result<()> {
        let mut addr = crate::BatchBlockAddressing::new();
        addr.add_sequence(crate::BlockTable::uniform(1, &[2], false));
        addr.add_sequence(crate::BlockTable::uniform(1, &[3, 4], false));
        let flat = addr.flatten(&Device::Cpu)?;
        assert_eq!(block_ids(&flat, 1, 0, 2)?, vec![3, 4]);
        assert!(block_ids(&flat, 0, 0, 2).is_err());
        assert!(block_ids(&flat, 1, 0, 3).is_err());
        Ok(())
    }
}
