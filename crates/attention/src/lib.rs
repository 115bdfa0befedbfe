//! Asymmetric joint attention over two token streams.
//!
//! The crate implements the attention layer of a video diffusion
//! transformer: a primary visual stream `x` and a conditioning stream `y`
//! of different widths attend jointly over their concatenation. Inputs
//! follow the `[batch, seq, hidden]` convention; packed-sequence
//! descriptors delimit variable-length sub-sequences inside the flattened
//! token dimension, and rotary rotation tables from the `embedding` crate
//! position the visual tokens on their temporal-spatial grid.
//!
//! Two forward entry points are exposed: [`AsymmetricAttention::forward`]
//! computes the reference path, and
//! [`AsymmetricAttention::forward_sharded`] fans the head axis out across
//! scoped worker threads and gathers the shards. Both are observationally
//! equivalent; reductions run in `f32` and outputs mirror the input dtype.

pub mod asymm;
pub mod core;
pub mod packing;
mod sdpa;

pub use crate::asymm::AsymmetricAttention;
pub use crate::core::{AsymmetricAttentionConfig, AttentionError};
pub use crate::packing::PackedIndices;
