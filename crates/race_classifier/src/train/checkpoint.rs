//! Checkpoint Management - Training state persistence
//!
//! A checkpoint is `NNN.ckpt` (safetensors: weights, batch norm statistics,
//! the WS-DAN feature center and optimizer momentum) plus an `NNN.json`
//! sidecar. `NNN` is the epoch training resumes from. A run stopped with
//! Ctrl-C writes `interrupt_NNN.ckpt` instead, leaving the last clean
//! checkpoint of that name untouched.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vision_engine::ModelSpec;

use super::optimizer::{ParamsSgd, SgdMomentum};

pub const FEATURE_CENTER_KEY: &str = "feature_center";
pub const CHECKPOINT_EXT: &str = "ckpt";
const TRAINING_STATE: &str = "training_state.json";
pub const INTERRUPT_PREFIX: &str = "interrupt_";
/// Prefix added by multi-GPU wrappers on exported state dicts
const WRAPPER_PREFIX: &str = "module.";
const FEATURES_PREFIX: &str = "features.";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OptimizerMeta {
    pub kind: String,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl From<ParamsSgd> for OptimizerMeta {
    fn from(p: ParamsSgd) -> Self {
        Self {
            kind: "sgd".to_string(),
            lr: p.lr,
            momentum: p.momentum,
            weight_decay: p.weight_decay,
        }
    }
}

/// Sidecar metadata written next to every checkpoint
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub save_dir: String,
    pub model: ModelSpec,
    pub optimizer: OptimizerMeta,
    pub has_feature_center: bool,
    pub train_loss: f64,
    pub date: String,
    pub checkpoint: String,
    /// Written mid-epoch by the Ctrl-C handler
    #[serde(default)]
    pub interrupted: bool,
}

impl CheckpointMeta {
    pub fn new(
        epoch: usize,
        save_dir: &Path,
        model: ModelSpec,
        optimizer: ParamsSgd,
        has_feature_center: bool,
        train_loss: f64,
    ) -> Self {
        Self {
            epoch,
            save_dir: save_dir.display().to_string(),
            model,
            optimizer: optimizer.into(),
            has_feature_center,
            train_loss,
            date: chrono::Local::now().to_rfc3339(),
            checkpoint: format!("{}.{}", checkpoint_stem(epoch), CHECKPOINT_EXT),
            interrupted: false,
        }
    }

    /// Marks this as a Ctrl-C snapshot, saved as `interrupt_NNN.ckpt`.
    pub fn interrupted(mut self) -> Self {
        self.interrupted = true;
        self.checkpoint = format!("{INTERRUPT_PREFIX}{}", self.checkpoint);
        self
    }
}

pub struct LoadedCheckpoint {
    pub tensors: HashMap<String, Tensor>,
    pub meta: Option<CheckpointMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Every model variable must be present with the right shape
    Strict,
    /// Missing or mis-shaped tensors are skipped
    Lenient,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<String>,
}

pub fn checkpoint_stem(epoch: usize) -> String {
    format!("{:03}", epoch)
}

/// Gathers everything a checkpoint stores, moved to the CPU.
pub fn checkpoint_tensors(
    varmap: &VarMap,
    feature_center: Option<&Tensor>,
    optimizer: &SgdMomentum,
) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("VarMap lock poisoned: {e}"))?;
        for (name, var) in data.iter() {
            tensors.insert(name.clone(), var.as_tensor().to_device(&Device::Cpu)?);
        }
    }
    if let Some(center) = feature_center {
        tensors.insert(
            FEATURE_CENTER_KEY.to_string(),
            center.to_device(&Device::Cpu)?,
        );
    }
    tensors.extend(optimizer.momentum_tensors()?);
    Ok(tensors)
}

fn write_locked(path: &Path, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let lock_path = path.with_extension("lock");
    let lock_file = File::create(&lock_path)
        .with_context(|| format!("Failed to create lock file {:?}", lock_path))?;
    let written = lock_file
        .lock_exclusive()
        .map_err(anyhow::Error::from)
        .and_then(|_| {
            candle_core::safetensors::save(tensors, path)
                .with_context(|| format!("Failed to write checkpoint {:?}", path))
        });
    // Dropping the handle releases the lock; the file goes on success and failure alike.
    drop(lock_file);
    if let Err(e) = std::fs::remove_file(&lock_path) {
        warn!("⚠️ Could not remove lock file {:?}: {}", lock_path, e);
    }
    written
}

fn write_training_state(save_dir: &Path, meta: &CheckpointMeta) -> Result<()> {
    let file = File::create(save_dir.join(TRAINING_STATE))?;
    serde_json::to_writer_pretty(file, meta)?;
    Ok(())
}

/// Writes the checkpoint named in `meta` under an exclusive lock, then the
/// sidecar and `training_state.json`.
pub fn save_checkpoint(
    save_dir: &Path,
    meta: &CheckpointMeta,
    tensors: &HashMap<String, Tensor>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(save_dir)
        .with_context(|| format!("Failed to create save directory {:?}", save_dir))?;
    let path = save_dir.join(&meta.checkpoint);

    write_locked(&path, tensors)?;

    let file = File::create(path.with_extension("json"))?;
    serde_json::to_writer_pretty(file, meta)?;

    // Also save generic training_state.json for easy resume
    if let Err(e) = write_training_state(save_dir, meta) {
        warn!("⚠️ Failed to update {}: {}", TRAINING_STATE, e);
    }

    info!("💾 Saved checkpoint {:?}", path);
    Ok(path)
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint> {
    if !path.exists() {
        anyhow::bail!("Checkpoint not found: {:?}", path);
    }
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
    let sidecar = path.with_extension("json");
    let meta = if sidecar.exists() {
        let file = File::open(&sidecar)?;
        match serde_json::from_reader(std::io::BufReader::new(file)) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("⚠️ Ignoring unreadable sidecar {:?}: {}", sidecar, e);
                None
            }
        }
    } else {
        None
    };
    Ok(LoadedCheckpoint { tensors, meta })
}

fn lookup<'a>(
    tensors: &'a HashMap<String, Tensor>,
    name: &str,
    mode: LoadMode,
) -> Option<&'a Tensor> {
    let direct = tensors
        .get(name)
        .or_else(|| tensors.get(&format!("{WRAPPER_PREFIX}{name}")));
    if direct.is_some() || mode == LoadMode::Strict {
        return direct;
    }
    // Backbone-only weights for the WS-DAN trunk carry no `features.` prefix.
    name.strip_prefix(FEATURES_PREFIX)
        .and_then(|stripped| tensors.get(stripped))
}

/// Copies matching tensors into the model's variables.
pub fn apply_weights(
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    mode: LoadMode,
) -> Result<LoadReport> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("VarMap lock poisoned: {e}"))?;
    let mut report = LoadReport::default();
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let Some(t) = lookup(tensors, name, mode) else {
            if mode == LoadMode::Strict {
                anyhow::bail!("Checkpoint is missing parameter '{}'", name);
            }
            report.skipped.push(name.clone());
            continue;
        };
        if t.dims() != var.dims() {
            if mode == LoadMode::Strict {
                anyhow::bail!(
                    "Shape mismatch for '{}': checkpoint {:?}, model {:?}",
                    name,
                    t.dims(),
                    var.dims()
                );
            }
            warn!(
                "⚠️ Skipping '{}': shape {:?} does not match model {:?}",
                name,
                t.dims(),
                var.dims()
            );
            report.skipped.push(name.clone());
            continue;
        }
        var.set(&t.to_dtype(var.dtype())?.to_device(var.device())?)?;
        report.loaded += 1;
    }
    Ok(report)
}

fn is_interrupt_snapshot(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| name.starts_with(INTERRUPT_PREFIX))
}

/// The resume epoch is the number in the checkpoint's file name.
pub fn epoch_from_path(path: &Path) -> Result<usize> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Checkpoint path has no file name: {:?}", path))?;
    let stem = stem.strip_prefix(INTERRUPT_PREFIX).unwrap_or(stem);
    stem.parse::<usize>().with_context(|| {
        format!(
            "Cannot resume from {:?}: file name must be the epoch number (e.g. 012.ckpt)",
            path
        )
    })
}

/// Newest clean `NNN.ckpt` in `save_dir`, by epoch number. Interrupt
/// snapshots are only resumed through an explicit `--ckpt`.
pub fn find_latest_checkpoint(save_dir: &Path) -> Result<Option<PathBuf>> {
    let pattern = save_dir.join(format!("*.{}", CHECKPOINT_EXT));
    let pattern = pattern
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Non UTF-8 save directory {:?}", save_dir))?;
    let latest = glob::glob(pattern)?
        .filter_map(|entry| entry.ok())
        .filter(|p| !is_interrupt_snapshot(p))
        .filter_map(|p| epoch_from_path(&p).ok().map(|e| (e, p)))
        .max_by_key(|(e, _)| *e)
        .map(|(_, p)| p);
    Ok(latest)
}
