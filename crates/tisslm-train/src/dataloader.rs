//! Training data: fixed-length next-token windows over a token stream

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Next-token prediction dataset.
///
/// The token stream is cut into non-overlapping windows of `seq_len`;
/// each example pairs a window with the same window shifted one position.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<Vec<usize>>,
    targets: Vec<Vec<usize>>,
}

impl Dataset {
    /// # Errors
    /// Fails when the stream is too short for even one window.
    pub fn new(tokens: &[u32], seq_len: usize) -> Result<Self> {
        if seq_len == 0 {
            bail!("seq_len must be non-zero");
        }
        if tokens.len() < seq_len + 1 {
            bail!(
                "need at least {} tokens for one window of {}, got {}",
                seq_len + 1,
                seq_len,
                tokens.len()
            );
        }
        let mut inputs = Vec::new();
        let mut targets = Vec::new();
        let mut start = 0;
        while start + seq_len + 1 <= tokens.len() {
            inputs.push(tokens[start..start + seq_len].iter().map(|&t| t as usize).collect());
            targets.push(
                tokens[start + 1..start + seq_len + 1]
                    .iter()
                    .map(|&t| t as usize)
                    .collect(),
            );
            start += seq_len;
        }
        Ok(Self { inputs, targets })
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn example(&self, index: usize) -> (&[usize], &[usize]) {
        (&self.inputs[index], &self.targets[index])
    }

    /// Shuffled example indices grouped into batches. The final short batch
    /// is kept.
    pub fn batches(&self, batch_size: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        indices
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_windows_are_shifted_pairs() {
        let tokens: Vec<u32> = (0..9).collect();
        let ds = Dataset::new(&tokens, 4).unwrap();
        assert_eq!(ds.len(), 2);
        let (x, y) = ds.example(0);
        assert_eq!(x, &[0, 1, 2, 3]);
        assert_eq!(y, &[1, 2, 3, 4]);
        let (x, y) = ds.example(1);
        assert_eq!(x, &[4, 5, 6, 7]);
        assert_eq!(y, &[5, 6, 7, 8]);
    }

    #[test]
    fn test_too_short_stream_rejected() {
        assert!(Dataset::new(&[1, 2, 3], 4).is_err());
        assert!(Dataset::new(&[1, 2, 3], 0).is_err());
    }

    #[test]
    fn test_batches_cover_every_example_once() {
        let tokens: Vec<u32> = (0..41).collect();
        let ds = Dataset::new(&tokens, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let batches = ds.batches(3, &mut rng);
        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..ds.len()).collect::<Vec<_>>());
    }
}
