//! Fixed sinusoidal positional encoding

use crate::error::{Result, TissError};
use crate::tensor::Tensor;

/// Precomputed sinusoidal position table added to token embeddings.
///
/// `PE[pos, 2i] = sin(pos / 10000^(2i/d))`, `PE[pos, 2i+1] = cos(...)`.
/// Not trainable.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    table: Tensor,
    max_len: usize,
    dim: usize,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, dim: usize) -> Self {
        let mut table = Tensor::new(vec![max_len, dim]);
        for pos in 0..max_len {
            for i in 0..dim {
                let exponent = 2.0 * (i / 2) as f32 / dim as f32;
                let angle = pos as f32 / 10000f32.powf(exponent);
                table.data_mut()[pos * dim + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            }
        }
        Self {
            table,
            max_len,
            dim,
        }
    }

    /// Add position rows `start_pos..start_pos + seq_len` to `x` of shape
    /// `[seq_len, dim]`.
    ///
    /// # Errors
    /// Returns `InvalidInput` when the window extends past the table or the
    /// embedding dimension mismatches.
    pub fn forward(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let shape = x.shape();
        if shape.len() != 2 || shape[1] != self.dim {
            return Err(TissError::InvalidInput(format!(
                "positional encoding expects [seq_len, {}], got {:?}",
                self.dim, shape
            )));
        }
        let seq_len = shape[0];
        if start_pos + seq_len > self.max_len {
            return Err(TissError::InvalidInput(format!(
                "positions {}..{} exceed maximum length {}",
                start_pos,
                start_pos + seq_len,
                self.max_len
            )));
        }
        let mut out = x.clone();
        for t in 0..seq_len {
            let pe_row = &self.table.data()[(start_pos + t) * self.dim..(start_pos + t + 1) * self.dim];
            let out_row = &mut out.data_mut()[t * self.dim..(t + 1) * self.dim];
            for j in 0..self.dim {
                out_row[j] += pe_row[j];
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_alternates_zero_one() {
        let pe = PositionalEncoding::new(8, 6);
        let x = Tensor::new(vec![1, 6]);
        let y = pe.forward(&x, 0).unwrap();
        // sin(0) = 0 on even indices, cos(0) = 1 on odd indices
        assert_eq!(y.data(), &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_start_pos_offset_matches_full_table() {
        let pe = PositionalEncoding::new(16, 4);
        let x = Tensor::new(vec![3, 4]);
        let full = pe.forward(&Tensor::new(vec![8, 4]), 0).unwrap();
        let windowed = pe.forward(&x, 5).unwrap();
        for t in 0..3 {
            for j in 0..4 {
                assert_eq!(windowed.data()[t * 4 + j], full.data()[(t + 5) * 4 + j]);
            }
        }
    }

    #[test]
    fn test_rejects_out_of_range_positions() {
        let pe = PositionalEncoding::new(4, 4);
        let x = Tensor::new(vec![3, 4]);
        assert!(pe.forward(&x, 2).is_err());
    }
}
