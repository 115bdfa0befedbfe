//! Position grids and mixed rotary rotation tables.
//!
//! Tokens of a video sequence live on a `T x pH x pW` temporal-spatial grid,
//! flattened in raster order (time-major, then row, then column). [`grid`]
//! builds the per-token coordinate triples; [`mixed`] turns them into
//! per-head cosine/sine rotation tables and applies those tables to
//! query/key tensors.

pub mod grid;
pub mod mixed;

pub use grid::{create_position_matrix, create_position_matrix_scaled};
pub use mixed::{apply_mixed_rotation, compute_mixed_rotation};
