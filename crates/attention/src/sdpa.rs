//! Scaled-dot-product attention over packed segments.
//!
//! Tensors arrive as `[batch, heads, tokens, head_dim]`. The batch is
//! flattened into the token dimension, valid tokens are gathered per the
//! descriptor, each `cu_seqlens` span attends exactly over itself, and the
//! results are scattered back with zeros at padded positions. All
//! reductions run in `f32`; the output mirrors the input dtype.

use candle_core::{DType, Result, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::packing::PackedIndices;

/// Plain attention over `[heads, len, head_dim]` tensors in `f32`.
pub(crate) fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
) -> Result<Tensor> {
    let scores = q.matmul(&k.transpose(1, 2)?)?.affine(scale, 0.0)?;
    let probs = softmax_last_dim(&scores)?;
    probs.matmul(v)
}

/// Joint attention per packed segment.
///
/// The descriptor must already be validated against `batch * tokens`.
pub(crate) fn packed_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    packed: &PackedIndices,
) -> Result<Tensor> {
    let (batch, heads, tokens, head_dim) = q.dims4()?;
    let dtype = q.dtype();
    let device = q.device();
    let flat_len = batch * tokens;
    let scale = 1.0 / (head_dim as f64).sqrt();

    // Heads-first layout so segments narrow along one token axis.
    let flatten = |t: &Tensor| -> Result<Tensor> {
        t.to_dtype(DType::F32)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((heads, flat_len, head_dim))
    };
    let q_flat = flatten(q)?;
    let k_flat = flatten(k)?;
    let v_flat = flatten(v)?;

    let mut scattered = Tensor::zeros((heads, flat_len, head_dim), DType::F32, device)?;
    if packed.n_valid() > 0 {
        let indices = Tensor::from_vec(
            packed.valid_token_indices.clone(),
            (packed.n_valid(),),
            device,
        )?;
        let q_valid = q_flat.index_select(&indices, 1)?;
        let k_valid = k_flat.index_select(&indices, 1)?;
        let v_valid = v_flat.index_select(&indices, 1)?;

        let mut outputs = Vec::new();
        for segment in packed.segments() {
            if segment.is_empty() {
                continue;
            }
            let q_seg = q_valid.narrow(1, segment.start, segment.len())?.contiguous()?;
            let k_seg = k_valid.narrow(1, segment.start, segment.len())?.contiguous()?;
            let v_seg = v_valid.narrow(1, segment.start, segment.len())?.contiguous()?;
            outputs.push(scaled_dot_product_attention(&q_seg, &k_seg, &v_seg, scale)?);
        }
        if !outputs.is_empty() {
            let out_valid = Tensor::cat(&outputs, 1)?;
            scattered = scattered.index_add(&indices, &out_valid, 1)?;
        }
    }

    scattered
        .reshape((heads, batch, tokens, head_dim))?
        .transpose(0, 1)?
        .contiguous()?
        .to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn seeded(shape: (usize, usize, usize, usize), device: &Device, salt: usize) -> Result<Tensor> {
        let (a, b, c, d) = shape;
        let data: Vec<f32> = (0..a * b * c * d)
            .map(|i| (((i * 31 + salt * 7 + 3) % 101) as f32) * 0.02 - 1.0)
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    #[test]
    fn single_sequence_matches_unpacked() -> Result<()> {
        let device = Device::Cpu;
        let (batch, heads, tokens, head_dim) = (1, 2, 6, 4);
        let q = seeded((batch, heads, tokens, head_dim), &device, 0)?;
        let k = seeded((batch, heads, tokens, head_dim), &device, 1)?;
        let v = seeded((batch, heads, tokens, head_dim), &device, 2)?;

        let packed = PackedIndices::single_sequence(batch * tokens);
        let packed_out = packed_attention(&q, &k, &v, &packed)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let unpacked = scaled_dot_product_attention(
            &q.squeeze(0)?.contiguous()?,
            &k.squeeze(0)?.contiguous()?,
            &v.squeeze(0)?.contiguous()?,
            scale,
        )?
        .unsqueeze(0)?;

        let max_diff = packed_out.sub(&unpacked)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max_diff < 1e-6, "packed path diverged: {max_diff}");
        Ok(())
    }

    #[test]
    fn segments_do_not_attend_across_boundaries() -> Result<()> {
        let device = Device::Cpu;
        let (batch, heads, tokens, head_dim) = (1, 1, 6, 4);
        let q = seeded((batch, heads, tokens, head_dim), &device, 3)?;
        let k = seeded((batch, heads, tokens, head_dim), &device, 4)?;
        let v = seeded((batch, heads, tokens, head_dim), &device, 5)?;

        let split = PackedIndices {
            valid_token_indices: (0..tokens as u32).collect(),
            cu_seqlens: vec![0, 4, 6],
            max_seqlen_in_batch: 4,
        };
        let out = packed_attention(&q, &k, &v, &split)?;

        // The first segment's rows must equal attention computed over the
        // first four tokens alone.
        let scale = 1.0 / (head_dim as f64).sqrt();
        let expected = scaled_dot_product_attention(
            &q.squeeze(0)?.narrow(1, 0, 4)?.contiguous()?,
            &k.squeeze(0)?.narrow(1, 0, 4)?.contiguous()?,
            &v.squeeze(0)?.narrow(1, 0, 4)?.contiguous()?,
            scale,
        )?;
        let head = out.squeeze(0)?.narrow(1, 0, 4)?;
        let max_diff = head.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max_diff < 1e-6);
        Ok(())
    }

    #[test]
    fn padded_positions_stay_zero() -> Result<()> {
        let device = Device::Cpu;
        let (batch, heads, tokens, head_dim) = (1, 1, 5, 4);
        let q = seeded((batch, heads, tokens, head_dim), &device, 6)?;
        let k = seeded((batch, heads, tokens, head_dim), &device, 7)?;
        let v = seeded((batch, heads, tokens, head_dim), &device, 8)?;

        // Token 4 is padding.
        let packed = PackedIndices {
            valid_token_indices: vec![0, 1, 2, 3],
            cu_seqlens: vec![0, 4],
            max_seqlen_in_batch: 4,
        };
        let out = packed_attention(&q, &k, &v, &packed)?;
        let pad_row = out
            .squeeze(0)?
            .narrow(1, 4, 1)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert_eq!(pad_row, 0.0);
        Ok(())
    }
}
