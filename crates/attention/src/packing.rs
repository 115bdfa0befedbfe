//! Packed-sequence descriptors for variable-length batches.
//!
//! A batch of variable-length examples is flattened into one contiguous
//! token dimension. The descriptor names which positions hold real tokens,
//! where each example's sub-sequence starts and ends, and the widest
//! sub-sequence, so attention can run exactly per segment without padding.

use std::ops::Range;

use crate::core::AttentionError;

/// Layout of valid tokens inside a flattened, possibly padded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedIndices {
    /// Positions of real (non-padded) tokens within the flattened batch.
    pub valid_token_indices: Vec<u32>,
    /// Cumulative sub-sequence boundaries over the valid tokens.
    /// Non-decreasing, starts at 0, ends at `valid_token_indices.len()`.
    pub cu_seqlens: Vec<u32>,
    /// Length of the widest sub-sequence.
    pub max_seqlen_in_batch: usize,
}

impl PackedIndices {
    /// Descriptor for a single all-valid sequence spanning `total_len`
    /// tokens. Attending under it is equivalent to unpacked full-batch
    /// attention.
    pub fn single_sequence(total_len: usize) -> Self {
        Self {
            valid_token_indices: (0..total_len as u32).collect(),
            cu_seqlens: vec![0, total_len as u32],
            max_seqlen_in_batch: total_len,
        }
    }

    /// Number of valid tokens described.
    pub fn n_valid(&self) -> usize {
        self.valid_token_indices.len()
    }

    /// Per-example sub-sequence spans within the gathered valid tokens.
    pub fn segments(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.cu_seqlens
            .windows(2)
            .map(|w| w[0] as usize..w[1] as usize)
    }

    /// Check the descriptor against the flattened token count it indexes.
    pub fn validate(&self, total_len: usize) -> Result<(), AttentionError> {
        let packing_err = |context: String| AttentionError::InvalidPacking { context };

        match self.cu_seqlens.first().copied() {
            Some(0) => {}
            Some(first) => {
                return Err(packing_err(format!("cu_seqlens must start at 0, got {first}")))
            }
            None => return Err(packing_err("cu_seqlens must not be empty".into())),
        }
        if self.cu_seqlens.windows(2).any(|w| w[1] < w[0]) {
            return Err(packing_err("cu_seqlens must be non-decreasing".into()));
        }
        let last = *self.cu_seqlens.last().unwrap_or(&0) as usize;
        if last != self.n_valid() {
            return Err(packing_err(format!(
                "cu_seqlens must end at the valid token count: {} vs {}",
                last,
                self.n_valid()
            )));
        }
        if let Some(&idx) = self
            .valid_token_indices
            .iter()
            .find(|&&idx| idx as usize >= total_len)
        {
            return Err(packing_err(format!(
                "valid token index {idx} out of range for {total_len} tokens"
            )));
        }
        // The scatter accumulates per index, so repeats would silently sum.
        let mut seen = vec![false; total_len];
        for &idx in &self.valid_token_indices {
            if seen[idx as usize] {
                return Err(packing_err(format!(
                    "valid token index {idx} appears more than once"
                )));
            }
            seen[idx as usize] = true;
        }
        let widest = self
            .cu_seqlens
            .windows(2)
            .map(|w| (w[1] - w[0]) as usize)
            .max()
            .unwrap_or(0);
        if widest != self.max_seqlen_in_batch {
            return Err(packing_err(format!(
                "max_seqlen_in_batch is {} but the widest segment spans {widest}",
                self.max_seqlen_in_batch
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sequence_descriptor() {
        let packed = PackedIndices::single_sequence(5);
        assert_eq!(packed.valid_token_indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(packed.cu_seqlens, vec![0, 5]);
        assert_eq!(packed.max_seqlen_in_batch, 5);
        assert!(packed.validate(5).is_ok());
        assert_eq!(packed.segments().collect::<Vec<_>>(), vec![0..5]);
    }

    #[test]
    fn multi_segment_spans() {
        let packed = PackedIndices {
            valid_token_indices: vec![0, 1, 2, 4, 5],
            cu_seqlens: vec![0, 3, 5],
            max_seqlen_in_batch: 3,
        };
        assert!(packed.validate(6).is_ok());
        assert_eq!(packed.segments().collect::<Vec<_>>(), vec![0..3, 3..5]);
    }

    #[test]
    fn rejects_inconsistent_boundaries() {
        let base = PackedIndices {
            valid_token_indices: vec![0, 1, 2, 3],
            cu_seqlens: vec![0, 2, 4],
            max_seqlen_in_batch: 2,
        };
        assert!(base.validate(4).is_ok());

        let mut bad = base.clone();
        bad.cu_seqlens = vec![1, 2, 4];
        assert!(bad.validate(4).is_err());

        let mut bad = base.clone();
        bad.cu_seqlens = vec![0, 3, 2];
        assert!(bad.validate(4).is_err());

        let mut bad = base.clone();
        bad.cu_seqlens = vec![0, 2, 3];
        assert!(bad.validate(4).is_err());

        let mut bad = base.clone();
        bad.max_seqlen_in_batch = 4;
        assert!(bad.validate(4).is_err());

        let mut bad = base.clone();
        bad.cu_seqlens = Vec::new();
        assert!(bad.validate(4).is_err());

        assert!(base.validate(3).is_err(), "index 3 exceeds 3 tokens");
    }

    #[test]
    fn rejects_duplicate_token_indices() {
        let dup = PackedIndices {
            valid_token_indices: vec![0, 1, 1, 3],
            cu_seqlens: vec![0, 2, 4],
            max_seqlen_in_batch: 2,
        };
        assert!(dup.validate(4).is_err(), "repeated index must not scatter twice");
    }
}
