//! Error types emitted by the attention module.

use thiserror::Error;

/// Attention-specific error category.
///
/// Shape and packing violations are preconditions of the caller; the module
/// fails fast and does not attempt recovery.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The packed-sequence descriptor is inconsistent with the token layout.
    #[error("invalid packed-sequence descriptor: {context}")]
    InvalidPacking { context: String },
    /// The module does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Construction-time configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    Config { message: String },
    /// A shard worker failed or panicked during the fan-out.
    #[error("sharded execution failed: {message}")]
    Sharding { message: String },
    /// A backend failure propagated from the tensor library.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
