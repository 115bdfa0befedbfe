//! Configuration for the asymmetric attention module.

use crate::core::AttentionError;

/// Environment variable overriding the shard count of the sharded path.
pub const NUM_SHARDS_ENV: &str = "ATTN_NUM_SHARDS";

/// Structural configuration fixed at module construction.
#[derive(Debug, Clone, PartialEq)]
pub struct AsymmetricAttentionConfig {
    /// Hidden width of the primary (visual) stream.
    pub dim_x: usize,
    /// Hidden width of the conditioning stream.
    pub dim_y: usize,
    /// Number of attention heads; both streams share the head layout.
    pub num_heads: usize,
    /// Whether the fused qkv projections carry bias terms.
    pub qkv_bias: bool,
    /// Whether query/key tensors pass a learned per-head RMS norm.
    pub qk_norm: bool,
    /// Whether the conditioning stream receives an updated representation.
    /// When `false` the `y` input is passed through unchanged.
    pub update_y: bool,
    /// Numeric stabiliser for the RMS computations.
    pub eps: f64,
    /// Head groups the sharded path fans out over. `1` degenerates to the
    /// reference computation.
    pub num_shards: usize,
}

impl AsymmetricAttentionConfig {
    /// Configuration with the defaults of the joint video model: biased qkv
    /// projections, qk norm, updated conditioning stream, single shard.
    pub fn new(dim_x: usize, dim_y: usize, num_heads: usize) -> Self {
        Self {
            dim_x,
            dim_y,
            num_heads,
            qkv_bias: true,
            qk_norm: true,
            update_y: true,
            eps: 1e-6,
            num_shards: 1,
        }
    }

    /// Per-head feature width of the joint attention.
    pub fn head_dim(&self) -> usize {
        self.dim_x / self.num_heads
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.dim_x == 0 || self.dim_y == 0 {
            return Err(AttentionError::Config {
                message: "stream widths must be non-zero".into(),
            });
        }
        if self.num_heads == 0 {
            return Err(AttentionError::Config {
                message: "num_heads must be non-zero".into(),
            });
        }
        if self.dim_x % self.num_heads != 0 {
            return Err(AttentionError::Config {
                message: format!(
                    "dim_x ({}) must be divisible by num_heads ({})",
                    self.dim_x, self.num_heads
                ),
            });
        }
        if self.head_dim() % 2 != 0 {
            return Err(AttentionError::Config {
                message: format!(
                    "head_dim ({}) must be even for rotary feature pairs",
                    self.head_dim()
                ),
            });
        }
        if self.num_shards == 0 || self.num_shards > self.num_heads {
            return Err(AttentionError::Config {
                message: format!(
                    "num_shards ({}) must be in 1..={}",
                    self.num_shards, self.num_heads
                ),
            });
        }
        if !(self.eps > 0.0) {
            return Err(AttentionError::Config {
                message: "eps must be positive".into(),
            });
        }
        Ok(())
    }

    /// Layer `ATTN_NUM_SHARDS` over the configured shard count.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(NUM_SHARDS_ENV) {
            match raw.parse::<usize>() {
                Ok(shards) => {
                    log::debug!("{NUM_SHARDS_ENV} overrides num_shards: {shards}");
                    self.num_shards = shards;
                }
                Err(_) => {
                    log::warn!("{NUM_SHARDS_ENV}={raw} is not a valid shard count, ignoring");
                }
            }
        }
    }
}
