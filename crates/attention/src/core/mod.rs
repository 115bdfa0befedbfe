//! Core configuration and error types shared by the attention paths.

pub mod config;
pub mod errors;

pub use config::AsymmetricAttentionConfig;
pub use errors::AttentionError;
