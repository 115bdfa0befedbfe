//! Embedding crate
//!
//! Positional machinery for video token sequences: temporal-spatial position
//! grids and the 3-axis mixed rotary embedding derived from them.

pub mod positional;

pub use positional::*;
