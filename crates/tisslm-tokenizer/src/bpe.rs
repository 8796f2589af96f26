//! Byte-level BPE: training, encoding, decoding, and persistence.
//!
//! The vocabulary maps token ids to byte strings; ids 0..=255 are the raw
//! bytes and every merge mints the next consecutive id. Merge priority is
//! mint order, so encoding always applies the earliest-learned merge first.

use crate::error::{Result, TokenizerError};
use crate::pretoken::pretokenize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;

const BASE_VOCAB: usize = 256;

/// Byte-pair-encoding tokenizer
#[derive(Debug, Clone)]
pub struct Bpe {
    /// id -> byte string
    vocab: HashMap<u32, Vec<u8>>,
    /// (left id, right id) -> merged id
    merges: HashMap<(u32, u32), u32>,
}

impl Default for Bpe {
    fn default() -> Self {
        Self::new()
    }
}

impl Bpe {
    /// A byte-level tokenizer with no learned merges
    pub fn new() -> Self {
        let vocab = (0..BASE_VOCAB as u32).map(|i| (i, vec![i as u8])).collect();
        Self {
            vocab,
            merges: HashMap::new(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Learn merges from `text` until the vocabulary reaches `vocab_size`
    /// or no pair occurs at least twice.
    ///
    /// # Errors
    /// Returns `InvalidVocabSize` when `vocab_size` is below 256.
    pub fn train(&mut self, text: &str, vocab_size: usize) -> Result<()> {
        if vocab_size < BASE_VOCAB {
            return Err(TokenizerError::InvalidVocabSize(vocab_size));
        }
        *self = Self::new();

        let mut chunks: Vec<Vec<u32>> = pretokenize(text)
            .iter()
            .map(|piece| piece.bytes().map(u32::from).collect())
            .collect();

        let num_merges = vocab_size - BASE_VOCAB;
        for i in 0..num_merges {
            // (count, position of first occurrence) per pair
            let mut counts: HashMap<(u32, u32), (usize, usize)> = HashMap::new();
            let mut position = 0usize;
            for chunk in &chunks {
                for pair in chunk.windows(2) {
                    counts.entry((pair[0], pair[1])).or_insert((0, position)).0 += 1;
                    position += 1;
                }
            }
            // Deterministic tie-break: highest count, then first seen.
            let best = counts
                .iter()
                .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.1 .1.cmp(&a.1 .1)))
                .map(|(&pair, &(count, _))| (pair, count));
            let (pair, count) = match best {
                Some(found) => found,
                None => break,
            };
            if count < 2 {
                break;
            }

            let new_id = (BASE_VOCAB + i) as u32;
            let mut bytes = self.vocab[&pair.0].clone();
            bytes.extend_from_slice(&self.vocab[&pair.1]);
            self.vocab.insert(new_id, bytes);
            self.merges.insert(pair, new_id);

            for chunk in &mut chunks {
                *chunk = merge_pair(chunk, pair, new_id);
            }
        }
        Ok(())
    }

    /// Encode `text` into token ids
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut out = Vec::new();
        for piece in pretokenize(text) {
            let mut ids: Vec<u32> = piece.bytes().map(u32::from).collect();
            loop {
                // Apply the present pair with the lowest minted id.
                let next = ids
                    .windows(2)
                    .filter_map(|pair| self.merges.get(&(pair[0], pair[1])).copied())
                    .min();
                match next {
                    Some(new_id) => {
                        let pair = self
                            .merges
                            .iter()
                            .find(|(_, &id)| id == new_id)
                            .map(|(&pair, _)| pair);
                        match pair {
                            Some(pair) => ids = merge_pair(&ids, pair, new_id),
                            None => break,
                        }
                    }
                    None => break,
                }
            }
            out.extend(ids);
        }
        out
    }

    /// Decode token ids back into text; invalid UTF-8 becomes replacement
    /// characters.
    ///
    /// # Errors
    /// Returns `UnknownTokenId` for an id with no vocabulary entry.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            let entry = self
                .vocab
                .get(&id)
                .ok_or(TokenizerError::UnknownTokenId(id))?;
            bytes.extend_from_slice(entry);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `<prefix>_vocab.json` and `<prefix>_merges.txt`
    ///
    /// # Errors
    /// Propagates filesystem and serialization errors.
    pub fn save(&self, prefix: &Path) -> Result<()> {
        let vocab: BTreeMap<u32, Vec<u8>> =
            self.vocab.iter().map(|(&k, v)| (k, v.clone())).collect();
        let vocab_path = sibling(prefix, "_vocab.json");
        fs::write(&vocab_path, serde_json::to_string_pretty(&vocab)?)?;

        // Merges sorted by minted id so priority survives the round trip.
        let mut merges: Vec<(&(u32, u32), &u32)> = self.merges.iter().collect();
        merges.sort_by_key(|(_, &id)| id);
        let mut file = fs::File::create(sibling(prefix, "_merges.txt"))?;
        for ((left, right), id) in merges {
            writeln!(file, "{} {} {}", left, right, id)?;
        }
        Ok(())
    }

    /// Load a tokenizer previously written by [`Bpe::save`]
    ///
    /// # Errors
    /// Propagates filesystem errors and reports malformed merge lines.
    pub fn load(prefix: &Path) -> Result<Self> {
        let vocab_raw = fs::read_to_string(sibling(prefix, "_vocab.json"))?;
        let vocab_map: BTreeMap<u32, Vec<u8>> = serde_json::from_str(&vocab_raw)?;
        let vocab: HashMap<u32, Vec<u8>> = vocab_map.into_iter().collect();

        let merges_raw = fs::read_to_string(sibling(prefix, "_merges.txt"))?;
        let mut merges = HashMap::new();
        for (i, line) in merges_raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(TokenizerError::InvalidMergeRule {
                    line: i + 1,
                    reason: format!("expected 3 fields, got {}", fields.len()),
                });
            }
            let parse = |s: &str| {
                s.parse::<u32>().map_err(|e| TokenizerError::InvalidMergeRule {
                    line: i + 1,
                    reason: e.to_string(),
                })
            };
            merges.insert((parse(fields[0])?, parse(fields[1])?), parse(fields[2])?);
        }
        Ok(Self { vocab, merges })
    }
}

fn merge_pair(ids: &[u32], pair: (u32, u32), new_id: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(ids.len());
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && ids[i] == pair.0 && ids[i + 1] == pair.1 {
            out.push(new_id);
            i += 2;
        } else {
            out.push(ids[i]);
            i += 1;
        }
    }
    out
}

fn sibling(prefix: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    prefix.with_file_name(name)
}
