//! Asymmetric two-stream attention.
//!
//! The primary visual stream `x` and the conditioning stream `y` have
//! different widths but share the head layout of the joint attention: both
//! are projected into the `dim_x`-wide head space, concatenated along the
//! token axis, and attended together per packed segment. Only the visual
//! tokens carry grid positions, so the mixed rotary rotation applies to the
//! x-stream queries and keys alone. Per-stream modulation scales gate the
//! pre-projection RMS norm, matching the conditioning pathway of the
//! surrounding diffusion transformer.

use std::sync::OnceLock;

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::{linear, linear_no_bias, rms_norm, Linear, Module, RmsNorm, VarBuilder};
use embedding::positional::apply_mixed_rotation;

use crate::core::{AsymmetricAttentionConfig, AttentionError};
use crate::packing::PackedIndices;
use crate::sdpa::packed_attention;

/// Joint attention layer over the two streams.
///
/// [`forward`](Self::forward) is the reference path;
/// [`forward_sharded`](Self::forward_sharded) computes the same function by
/// fanning head groups out across scoped threads and gathering the results.
pub struct AsymmetricAttention {
    cfg: AsymmetricAttentionConfig,
    qkv_x: Linear,
    qkv_y: Linear,
    q_norm_x: Option<RmsNorm>,
    k_norm_x: Option<RmsNorm>,
    q_norm_y: Option<RmsNorm>,
    k_norm_y: Option<RmsNorm>,
    proj_x: Linear,
    proj_y: Option<Linear>,
    first_call: OnceLock<()>,
}

impl std::fmt::Debug for AsymmetricAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsymmetricAttention")
            .field("dim_x", &self.cfg.dim_x)
            .field("dim_y", &self.cfg.dim_y)
            .field("num_heads", &self.cfg.num_heads)
            .field("update_y", &self.cfg.update_y)
            .finish()
    }
}

fn build_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    vb: VarBuilder,
) -> CandleResult<Linear> {
    if bias {
        linear(in_dim, out_dim, vb)
    } else {
        linear_no_bias(in_dim, out_dim, vb)
    }
}

/// Non-affine RMS norm over the hidden axis, gated by `1 + scale`.
///
/// Statistics run in `f32`; the output mirrors the input dtype. `scale` is
/// one vector per example, broadcast over the sequence axis.
fn modulated_rms_norm(x: &Tensor, scale: &Tensor, eps: f64) -> CandleResult<Tensor> {
    let dtype = x.dtype();
    let x_f32 = x.to_dtype(DType::F32)?;
    let rms = (x_f32.sqr()?.mean_keepdim(D::Minus1)? + eps)?.sqrt()?;
    let normed = x_f32.broadcast_div(&rms)?;
    let gate = (scale.to_dtype(DType::F32)?.unsqueeze(1)? + 1.0)?;
    normed.broadcast_mul(&gate)?.to_dtype(dtype)
}

impl AsymmetricAttention {
    /// Build the layer's parameters under `vb`.
    pub fn new(
        cfg: AsymmetricAttentionConfig,
        vb: VarBuilder,
    ) -> Result<Self, AttentionError> {
        cfg.validate()?;
        let head_dim = cfg.head_dim();

        let qkv_x = build_linear(cfg.dim_x, 3 * cfg.dim_x, cfg.qkv_bias, vb.pp("qkv_x"))?;
        let qkv_y = build_linear(cfg.dim_y, 3 * cfg.dim_x, cfg.qkv_bias, vb.pp("qkv_y"))?;

        let (q_norm_x, k_norm_x, q_norm_y, k_norm_y) = if cfg.qk_norm {
            (
                Some(rms_norm(head_dim, cfg.eps, vb.pp("q_norm_x"))?),
                Some(rms_norm(head_dim, cfg.eps, vb.pp("k_norm_x"))?),
                Some(rms_norm(head_dim, cfg.eps, vb.pp("q_norm_y"))?),
                Some(rms_norm(head_dim, cfg.eps, vb.pp("k_norm_y"))?),
            )
        } else {
            (None, None, None, None)
        };

        let proj_x = build_linear(cfg.dim_x, cfg.dim_x, true, vb.pp("proj_x"))?;
        let proj_y = if cfg.update_y {
            Some(build_linear(cfg.dim_x, cfg.dim_y, true, vb.pp("proj_y"))?)
        } else {
            None
        };

        Ok(Self {
            cfg,
            qkv_x,
            qkv_y,
            q_norm_x,
            k_norm_x,
            q_norm_y,
            k_norm_y,
            proj_x,
            proj_y,
            first_call: OnceLock::new(),
        })
    }

    /// Structural configuration the layer was built with.
    pub fn config(&self) -> &AsymmetricAttentionConfig {
        &self.cfg
    }

    fn log_init(&self) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::asymm init dim_x={} dim_y={} heads={} qkv_bias={} qk_norm={} update_y={} shards={}",
                self.cfg.dim_x,
                self.cfg.dim_y,
                self.cfg.num_heads,
                self.cfg.qkv_bias,
                self.cfg.qk_norm,
                self.cfg.update_y,
                self.cfg.num_shards,
            );
        }
    }

    fn check_inputs(
        &self,
        x: &Tensor,
        y: &Tensor,
        scale_x: &Tensor,
        scale_y: &Tensor,
        packed: &PackedIndices,
    ) -> Result<(usize, usize, usize), AttentionError> {
        let dtype = x.dtype();
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        for (name, tensor) in [("y", y), ("scale_x", scale_x), ("scale_y", scale_y)] {
            if tensor.dtype() != dtype {
                return Err(AttentionError::shape(format!(
                    "{name} dtype {:?} does not match x dtype {dtype:?}",
                    tensor.dtype()
                )));
            }
            if !tensor.device().same_device(x.device()) {
                return Err(AttentionError::shape(format!(
                    "{name} must reside on the same device as x"
                )));
            }
        }

        let (batch, seq_x, dim_x) = x
            .dims3()
            .map_err(|_| AttentionError::shape("x must have shape [batch, seq_x, dim_x]"))?;
        let (by, seq_y, dim_y) = y
            .dims3()
            .map_err(|_| AttentionError::shape("y must have shape [batch, seq_y, dim_y]"))?;
        if dim_x != self.cfg.dim_x || dim_y != self.cfg.dim_y || by != batch {
            return Err(AttentionError::shape(format!(
                "stream shapes [{batch}, {seq_x}, {dim_x}] / [{by}, {seq_y}, {dim_y}] do not match dims ({}, {})",
                self.cfg.dim_x, self.cfg.dim_y
            )));
        }
        for (name, tensor, dim) in [
            ("scale_x", scale_x, self.cfg.dim_x),
            ("scale_y", scale_y, self.cfg.dim_y),
        ] {
            let (sb, sd) = tensor.dims2().map_err(|_| {
                AttentionError::shape(format!("{name} must have shape [batch, dim]"))
            })?;
            if sb != batch || sd != dim {
                return Err(AttentionError::shape(format!(
                    "{name} shape [{sb}, {sd}] does not match [{batch}, {dim}]"
                )));
            }
        }

        packed.validate(batch * (seq_x + seq_y))?;
        Ok((batch, seq_x, seq_y))
    }

    fn split_qkv(
        &self,
        qkv: &Tensor,
        batch: usize,
        seq: usize,
    ) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let dim = self.cfg.dim_x;
        let heads = self.cfg.num_heads;
        let head_dim = self.cfg.head_dim();
        let split = |i: usize| -> CandleResult<Tensor> {
            qkv.narrow(2, i * dim, dim)?
                .contiguous()?
                .reshape((batch, seq, heads, head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        Ok((split(0)?, split(1)?, split(2)?))
    }

    /// Shared prologue: modulate, project, head-split, qk-norm, rotate x,
    /// concatenate the streams along the token axis.
    fn project_streams(
        &self,
        x: &Tensor,
        y: &Tensor,
        scale_x: &Tensor,
        scale_y: &Tensor,
        rope_cos: &Tensor,
        rope_sin: &Tensor,
        batch: usize,
        seq_x: usize,
        seq_y: usize,
    ) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let x_mod = modulated_rms_norm(x, scale_x, self.cfg.eps)?;
        let y_mod = modulated_rms_norm(y, scale_y, self.cfg.eps)?;

        let qkv_x = self.qkv_x.forward(&x_mod)?;
        let qkv_y = self.qkv_y.forward(&y_mod)?;
        let (mut q_x, mut k_x, v_x) = self.split_qkv(&qkv_x, batch, seq_x)?;
        let (mut q_y, mut k_y, v_y) = self.split_qkv(&qkv_y, batch, seq_y)?;

        if let (Some(qn), Some(kn)) = (&self.q_norm_x, &self.k_norm_x) {
            q_x = qn.forward(&q_x)?;
            k_x = kn.forward(&k_x)?;
        }
        if let (Some(qn), Some(kn)) = (&self.q_norm_y, &self.k_norm_y) {
            q_y = qn.forward(&q_y)?;
            k_y = kn.forward(&k_y)?;
        }

        // Conditioning tokens have no grid position.
        q_x = apply_mixed_rotation(&q_x, rope_cos, rope_sin)?;
        k_x = apply_mixed_rotation(&k_x, rope_cos, rope_sin)?;

        let q = Tensor::cat(&[&q_x, &q_y], 2)?.contiguous()?;
        let k = Tensor::cat(&[&k_x, &k_y], 2)?.contiguous()?;
        let v = Tensor::cat(&[&v_x, &v_y], 2)?.contiguous()?;
        Ok((q, k, v))
    }

    /// Shared epilogue: merge heads, split the streams back, out-project.
    fn project_out(
        &self,
        attn: &Tensor,
        y: &Tensor,
        batch: usize,
        seq_x: usize,
        seq_y: usize,
    ) -> CandleResult<(Tensor, Tensor)> {
        let joined = attn
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_x + seq_y, self.cfg.dim_x))?;

        let x_attn = joined.narrow(1, 0, seq_x)?.contiguous()?;
        let x_out = self.proj_x.forward(&x_attn)?;

        let y_out = match &self.proj_y {
            Some(proj_y) => {
                let y_attn = joined.narrow(1, seq_x, seq_y)?.contiguous()?;
                proj_y.forward(&y_attn)?
            }
            None => y.clone(),
        };
        Ok((x_out, y_out))
    }

    /// Reference forward path.
    ///
    /// * `x` is `[batch, seq_x, dim_x]`, `y` is `[batch, seq_y, dim_y]`.
    /// * `scale_x`/`scale_y` are per-example modulation vectors
    ///   `[batch, dim]`.
    /// * `packed` describes the valid-token layout of the flattened
    ///   `batch * (seq_x + seq_y)` joint token dimension.
    /// * `rope_cos`/`rope_sin` are `[seq_x, heads, head_dim / 2]` rotation
    ///   tables for the visual tokens.
    ///
    /// Returns updated `(x, y)` with the input shapes. When `update_y` is
    /// off, `y` passes through unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        x: &Tensor,
        y: &Tensor,
        scale_x: &Tensor,
        scale_y: &Tensor,
        packed: &PackedIndices,
        rope_cos: &Tensor,
        rope_sin: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        self.log_init();
        let (batch, seq_x, seq_y) = self.check_inputs(x, y, scale_x, scale_y, packed)?;
        let (q, k, v) =
            self.project_streams(x, y, scale_x, scale_y, rope_cos, rope_sin, batch, seq_x, seq_y)?;
        let attn = packed_attention(&q, &k, &v, packed)?;
        Ok(self.project_out(&attn, y, batch, seq_x, seq_y)?)
    }

    /// Sharded forward path.
    ///
    /// Functionally identical to [`forward`](Self::forward): the head axis
    /// is split into contiguous groups, each group's packed attention runs
    /// on its own scoped thread, and the shards are gathered by
    /// concatenation before the out-projections. The call blocks until
    /// every shard has completed; the first shard error wins. The shard
    /// count comes from the configuration, overridable via
    /// `ATTN_NUM_SHARDS`, and must not exceed `num_heads`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_sharded(
        &self,
        x: &Tensor,
        y: &Tensor,
        scale_x: &Tensor,
        scale_y: &Tensor,
        packed: &PackedIndices,
        rope_cos: &Tensor,
        rope_sin: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        self.log_init();
        let mut cfg = self.cfg.clone();
        cfg.apply_env_overrides();
        cfg.validate()?;
        let shards = cfg.num_shards;

        let (batch, seq_x, seq_y) = self.check_inputs(x, y, scale_x, scale_y, packed)?;
        let (q, k, v) =
            self.project_streams(x, y, scale_x, scale_y, rope_cos, rope_sin, batch, seq_x, seq_y)?;

        let ranges = shard_ranges(self.cfg.num_heads, shards);
        log::debug!(
            "sharded forward: shards={} head_groups={:?}",
            shards,
            ranges
        );

        let mut shard_inputs = Vec::with_capacity(ranges.len());
        for &(start, len) in &ranges {
            shard_inputs.push((
                q.narrow(1, start, len)?,
                k.narrow(1, start, len)?,
                v.narrow(1, start, len)?,
            ));
        }

        let shard_outputs =
            std::thread::scope(|scope| -> Result<Vec<Tensor>, AttentionError> {
                let handles: Vec<_> = shard_inputs
                    .iter()
                    .map(|(qs, ks, vs)| scope.spawn(move || packed_attention(qs, ks, vs, packed)))
                    .collect();
                let mut outputs = Vec::with_capacity(handles.len());
                for handle in handles {
                    let joined = handle.join().map_err(|_| AttentionError::Sharding {
                        message: "shard worker panicked".into(),
                    })?;
                    outputs.push(joined?);
                }
                Ok(outputs)
            })?;

        let attn = Tensor::cat(&shard_outputs, 1)?;
        Ok(self.project_out(&attn, y, batch, seq_x, seq_y)?)
    }
}

/// Contiguous `(start, len)` head groups; the remainder spreads over the
/// leading groups.
fn shard_ranges(num_heads: usize, shards: usize) -> Vec<(usize, usize)> {
    let base = num_heads / shards;
    let remainder = num_heads % shards;
    let mut ranges = Vec::with_capacity(shards);
    let mut start = 0;
    for i in 0..shards {
        let len = base + usize::from(i < remainder);
        ranges.push((start, len));
        start += len;
    }
    ranges
}
