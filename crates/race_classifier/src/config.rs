//! Run Configuration
//!
//! Snapshot of a training run's settings, written as `config.json` into the
//! save directory so a run can be inspected or reproduced later.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use vision_engine::ModelSpec;

use crate::train::scheduler::SchedulerKind;
use crate::train::TrainArgs;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunConfig {
    pub created_at: String,
    // Architecture
    pub model: ModelSpec,
    // Dataset
    pub data_root: PathBuf,
    pub train_csv: PathBuf,
    pub val_csv: PathBuf,
    pub workers: usize,
    // Hyperparameters
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub scheduler: SchedulerKind,
    pub save_freq: usize,
    pub seed: Option<u64>,
    // Run state
    pub start_epoch: usize,
    pub checkpoint: Option<PathBuf>,
    pub pretrained: Option<PathBuf>,
    pub device: String,
}

impl RunConfig {
    pub fn model_spec(args: &TrainArgs) -> ModelSpec {
        ModelSpec::new(args.model, args.num_classes)
            .with_num_attentions(args.num_attentions)
            .with_image_size(args.image_size)
    }

    pub fn from_args(args: &TrainArgs) -> Self {
        let optim = crate::train::optimizer::ParamsSgd {
            lr: args.lr,
            ..Default::default()
        };
        Self {
            created_at: chrono::Local::now().to_rfc3339(),
            model: Self::model_spec(args),
            data_root: args.data_root.clone(),
            train_csv: args.train_csv.clone(),
            val_csv: args.val_csv.clone(),
            workers: args.workers,
            epochs: args.epochs,
            batch_size: args.batch_size,
            lr: optim.lr,
            momentum: optim.momentum,
            weight_decay: optim.weight_decay,
            scheduler: args.scheduler,
            save_freq: args.save_freq,
            seed: args.seed,
            start_epoch: 0,
            checkpoint: args.ckpt.clone(),
            pretrained: args.pretrained.clone(),
            device: args.device.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("Failed to write config {:?}", path))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open config {:?}", path))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}
