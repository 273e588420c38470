use rayon::prelude::*;

use super::{KernelParams, KvLayer, KvRow, OnlineSoftmax, UpcastF32};

/// One sequence of a varlen batch.
#[derive(Clone, Debug)]
pub(crate) struct VarlenSeq {
    /// First row of this sequence in the packed queries.
    pub q_start: usize,
    pub q_len: usize,
    /// Key/value rows in position order. The last `q_len` are the queries' own tokens.
    pub rows: Vec<KvRow>,
}

/// Output and per-(token, head) log-sum-exp of a fused pass.
pub(crate) struct FusedOutput {
    /// `[q_tokens, H, D]`.
    pub out: Vec<f32>,
    /// `[q_tokens, H]`.
    pub lse: Vec<f32>,
}

/// Single pass online-softmax attention over packed varlen queries.
///
/// `q` is `[q_tokens, H, D]` in `f32`. Query rows not owned by any sequence are
/// left as zeros.
pub(crate) fn fused_varlen<K: UpcastF32>(
    q: &[f32],
    kv: &KvLayer<'_, K>,
    seqs: &[VarlenSeq],
    params: &KernelParams<'_>,
) -> FusedOutput {
    let h_num = params.heads;
    let d = params.head_size;
    let q_tokens = q.len() / (h_num * d);

    let mut owner = vec![(usize::MAX, 0usize); q_tokens];
    for (s, seq) in seqs.iter().enumerate() {
        for i in 0..seq.q_len {
            owner[seq.q_start + i] = (s, i);
        }
    }

    let mut out = vec![0f32; q_tokens * h_num * d];
    let mut lse = vec![f32::NEG_INFINITY; q_tokens * h_num];
    out.par_chunks_mut(d)
        .zip(lse.par_iter_mut())
        .enumerate()
        .for_each(|(idx, (o, l))| {
            let token = idx / h_num;
            let h = idx % h_num;
            let (s, i) = owner[token];
            if s == usize::MAX {
                return;
            }
            let seq = &seqs[s];
            let kv_len = seq.rows.len();
            let q_pos = kv_len - seq.q_len + i;
            let visible = if params.causal { q_pos + 1 } else { kv_len };
            let q_row = &q[idx * d..(idx + 1) * d];
            let kv_h = params.kv_head(h);

            let mut state = OnlineSoftmax::new();
            for (k_pos, row) in seq.rows[..visible].iter().enumerate() {
                let score =
                    kv.dot_k(row, kv_h, q_row) * params.scale + params.bias(h, q_pos, k_pos);
                let p = state.push(score, o);
                kv.add_v(row, kv_h, p, o);
            }
            if state.sum > 0. {
                let inv = 1. / state.sum;
                o.iter_mut().for_each(|x| *x *= inv);
            }
            *l = state.lse();
        });
    FusedOutput { out, lse }
}
