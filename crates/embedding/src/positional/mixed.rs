//! Mixed rotation tables over 3-axis positions.
//!
//! A single rotary scheme jointly encodes the three grid coordinates of a
//! token: each axis owns a per-head row of base frequencies, the token's
//! coordinate on that axis scales the row elementwise, and the three angle
//! contributions are summed per head before taking cosine/sine. Angle math
//! always runs in `f32`; outputs mirror the frequency dtype.

use candle_core::{bail, DType, Result, Tensor};

/// Compute cosine/sine rotation tables from a frequency basis and positions.
///
/// * `freqs` is shaped `[3, heads, half_dim]` and holds the per-axis,
///   per-head base frequencies fixed at model construction.
/// * `pos` is shaped `[n_tokens, 3]`, one coordinate triple per token; a
///   prefix of a full grid is accepted, so callers with a short active
///   sequence pass `pos.narrow(0, 0, n)` without rebuilding the grid.
///
/// Returns `(cos, sin)`, each shaped `[n_tokens, heads, half_dim]`.
pub fn compute_mixed_rotation(freqs: &Tensor, pos: &Tensor) -> Result<(Tensor, Tensor)> {
    let (axes, heads, half_dim) = freqs.dims3()?;
    if axes != 3 {
        bail!("frequency basis must have 3 leading axes, got {axes}");
    }
    let (n_tokens, coords) = pos.dims2()?;
    if coords != 3 {
        bail!("position matrix must have 3 coordinates per token, got {coords}");
    }

    log::trace!("mixed rotation: tokens={n_tokens} heads={heads} half_dim={half_dim}");

    // Summing the per-axis contributions is a contraction over the axis
    // dimension, so the whole table is one matmul in f32.
    let pos_f32 = pos.to_dtype(DType::F32)?.contiguous()?;
    let freqs_f32 = freqs
        .to_dtype(DType::F32)?
        .contiguous()?
        .reshape((3, heads * half_dim))?;
    let angles = pos_f32
        .matmul(&freqs_f32)?
        .reshape((n_tokens, heads, half_dim))?;

    let cos = angles.cos()?.to_dtype(freqs.dtype())?;
    let sin = angles.sin()?.to_dtype(freqs.dtype())?;
    Ok((cos, sin))
}

/// Rotate interleaved feature pairs of `x` by the supplied tables.
///
/// * `x` is shaped `[batch, heads, seq_len, head_dim]` with an even
///   `head_dim`.
/// * `cos` and `sin` are shaped `[seq_len, heads, head_dim / 2]`, as
///   produced by [`compute_mixed_rotation`].
///
/// Each `(even, odd)` feature pair is rotated by its angle:
/// `even' = even * cos - odd * sin`, `odd' = even * sin + odd * cos`.
/// Math runs in `f32`; the output mirrors the dtype of `x`.
pub fn apply_mixed_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = x.dims4()?;
    if head_dim % 2 != 0 {
        bail!("head_dim must be even to rotate feature pairs, got {head_dim}");
    }
    let half_dim = head_dim / 2;

    for (name, table) in [("cos", cos), ("sin", sin)] {
        let (tn, th, tf) = table.dims3()?;
        if tn != seq_len || th != heads || tf != half_dim {
            bail!(
                "{name} table shape mismatch: expected [{seq_len}, {heads}, {half_dim}] got [{tn}, {th}, {tf}]"
            );
        }
    }

    let dtype = x.dtype();
    let table_shape = (batch, heads, seq_len, half_dim);
    let cos_b = cos
        .to_dtype(DType::F32)?
        .transpose(0, 1)?
        .unsqueeze(0)?
        .broadcast_as(table_shape)?;
    let sin_b = sin
        .to_dtype(DType::F32)?
        .transpose(0, 1)?
        .unsqueeze(0)?
        .broadcast_as(table_shape)?;

    let x_f32 = x.to_dtype(DType::F32)?;
    let pairs = x_f32.reshape((batch, heads, seq_len, half_dim, 2))?;
    let chunks = pairs.chunk(2, 4)?;
    let even = chunks[0].squeeze(4)?;
    let odd = chunks[1].squeeze(4)?;

    let rotated_even = even.mul(&cos_b)?.sub(&odd.mul(&sin_b)?)?;
    let rotated_odd = even.mul(&sin_b)?.add(&odd.mul(&cos_b)?)?;

    let rotated = Tensor::cat(&[&rotated_even.unsqueeze(4)?, &rotated_odd.unsqueeze(4)?], 4)?
        .reshape((batch, heads, seq_len, head_dim))?;
    rotated.to_dtype(dtype)
}
