//! Checkpoint persistence.
//!
//! A checkpoint is a bincode-encoded map from names to shaped f32 arrays:
//! every model parameter under its dotted name, optimizer moments under
//! `optimizer.m.<name>` and `optimizer.v.<name>`, and the scalars
//! `optimizer.t`, `epoch`, and `step`. Files are written to a temporary
//! sibling and renamed so a crash never leaves a truncated checkpoint.
//!
//! An older layout that numbered parameters positionally (`param_0`,
//! `optimizer_m_0`, ...) is still readable; positions follow the model's
//! parameter traversal order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tisslm_model::{Model, Tensor};

use crate::optimizer::AdamW;

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    shape: Vec<usize>,
    data: Vec<f32>,
}

type Archive = BTreeMap<String, Entry>;

fn scalar(value: f32) -> Entry {
    Entry {
        shape: vec![],
        data: vec![value],
    }
}

fn tensor_entry(t: &Tensor) -> Entry {
    Entry {
        shape: t.shape().to_vec(),
        data: t.data().to_vec(),
    }
}

fn entry_tensor(name: &str, entry: &Entry) -> Result<Tensor> {
    Tensor::from_vec(entry.data.clone(), entry.shape.clone())
        .with_context(|| format!("checkpoint entry '{}' is internally inconsistent", name))
}

/// Serialize model and optimizer state to `path` atomically.
///
/// # Errors
/// Fails on filesystem or serialization errors.
pub fn save_checkpoint(
    path: &Path,
    model: &Model,
    optimizer: &AdamW,
    epoch: u64,
    step: u64,
) -> Result<()> {
    let mut archive = Archive::new();
    for param in model.parameters() {
        archive.insert(param.name().to_string(), tensor_entry(&param.value));
    }
    let (m, v) = optimizer.state();
    if !m.is_empty() {
        for ((param, m_t), v_t) in model.parameters().iter().zip(m.iter()).zip(v.iter()) {
            archive.insert(format!("optimizer.m.{}", param.name()), tensor_entry(m_t));
            archive.insert(format!("optimizer.v.{}", param.name()), tensor_entry(v_t));
        }
    }
    archive.insert("optimizer.t".to_string(), scalar(optimizer.timestep() as f32));
    archive.insert("epoch".to_string(), scalar(epoch as f32));
    archive.insert("step".to_string(), scalar(step as f32));

    let encoded = bincode::serialize(&archive).context("encoding checkpoint")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &encoded)
        .with_context(|| format!("writing checkpoint to {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("moving checkpoint into place at {}", path.display()))?;
    Ok(())
}

/// Restore model and optimizer state from `path`, returning `(epoch, step)`.
///
/// A parameter that is missing from the archive, or whose shape disagrees
/// with the model, is skipped with a warning and keeps its initialization.
/// Incomplete or mismatched optimizer moments start fresh.
///
/// # Errors
/// Fails when the file is unreadable or cannot be decoded.
pub fn load_checkpoint(path: &Path, model: &mut Model, optimizer: &mut AdamW) -> Result<(u64, u64)> {
    let raw = fs::read(path).with_context(|| format!("reading checkpoint {}", path.display()))?;
    let archive: Archive = bincode::deserialize(&raw).context("decoding checkpoint")?;

    let legacy = !archive.contains_key("embeddings") && archive.contains_key("param_0");
    let names: Vec<String> = model
        .parameters()
        .iter()
        .enumerate()
        .map(|(i, p)| {
            if legacy {
                format!("param_{}", i)
            } else {
                p.name().to_string()
            }
        })
        .collect();

    for (i, param) in model.parameters_mut().into_iter().enumerate() {
        let entry = match archive.get(&names[i]) {
            Some(entry) => entry,
            None => {
                eprintln!("warning: checkpoint has no entry for '{}', keeping initialization", names[i]);
                continue;
            }
        };
        let tensor = entry_tensor(&names[i], entry)?;
        if tensor.shape() != param.value.shape() {
            eprintln!(
                "warning: skipping '{}': checkpoint shape {:?} vs model {:?}",
                names[i],
                tensor.shape(),
                param.value.shape()
            );
            continue;
        }
        param.value = tensor;
    }

    let moment_key = |kind: &str, i: usize, name: &str| {
        if legacy {
            format!("optimizer_{}_{}", kind, i)
        } else {
            format!("optimizer.{}.{}", kind, name)
        }
    };
    let param_meta: Vec<(String, Vec<usize>)> = model
        .parameters()
        .iter()
        .map(|p| (p.name().to_string(), p.value.shape().to_vec()))
        .collect();
    let has_moments = archive.contains_key(&moment_key("m", 0, &param_meta[0].0));
    if has_moments {
        let mut m = Vec::with_capacity(param_meta.len());
        let mut v = Vec::with_capacity(param_meta.len());
        let mut complete = true;
        'moments: for (i, (name, shape)) in param_meta.iter().enumerate() {
            for (kind, dest) in [("m", &mut m), ("v", &mut v)] {
                let key = moment_key(kind, i, name);
                let entry = match archive.get(&key) {
                    Some(entry) => entry,
                    None => {
                        eprintln!("warning: incomplete optimizer state, starting moments fresh");
                        complete = false;
                        break 'moments;
                    }
                };
                let tensor = entry_tensor(&key, entry)?;
                if tensor.shape() != shape.as_slice() {
                    eprintln!("warning: optimizer state '{}' does not match the model, starting moments fresh", key);
                    complete = false;
                    break 'moments;
                }
                dest.push(tensor);
            }
        }
        if !complete {
            return Ok(read_scalars(&archive));
        }
        let t = archive
            .get("optimizer.t")
            .or_else(|| archive.get("optimizer_t"))
            .map(|e| e.data.first().copied().unwrap_or(0.0) as u64)
            .unwrap_or(0);
        optimizer.restore(m, v, t)?;
    }

    Ok(read_scalars(&archive))
}

fn read_scalars(archive: &Archive) -> (u64, u64) {
    let read = |key: &str| {
        archive
            .get(key)
            .and_then(|e| e.data.first())
            .copied()
            .unwrap_or(0.0) as u64
    };
    (read("epoch"), read("step"))
}

/// Path of the checkpoint written at `step` inside `dir`
pub fn checkpoint_path(dir: &Path, step: u64) -> PathBuf {
    dir.join(format!("checkpoint_{:08}.ckpt", step))
}

/// Latest checkpoint in `dir` by step number, if any.
///
/// # Errors
/// Fails when the directory cannot be read.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_checkpoints(dir)?.into_iter().last())
}

/// Delete all but the `keep_last` newest checkpoints. `keep_last < 0`
/// keeps everything. A file that cannot be removed is reported and left;
/// retention never interrupts training.
///
/// # Errors
/// Fails when the directory cannot be read.
pub fn prune_checkpoints(dir: &Path, keep_last: i64) -> Result<()> {
    if keep_last < 0 {
        return Ok(());
    }
    let checkpoints = list_checkpoints(dir)?;
    let excess = checkpoints.len().saturating_sub(keep_last as usize);
    for stale in &checkpoints[..excess] {
        if let Err(err) = fs::remove_file(stale) {
            eprintln!("warning: could not remove stale checkpoint {}: {}", stale.display(), err);
        }
    }
    Ok(())
}

fn list_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for item in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = item?.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name.starts_with("checkpoint_") && name.ends_with(".ckpt") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}
