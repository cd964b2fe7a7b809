//! Evaluate a checkpoint on the test manifest

use anyhow::Result;
use candle_core::DType;
use candle_nn::{loss, VarBuilder, VarMap};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use vision_engine::device_utils::select_device;
use vision_engine::{accuracy, ModelKind, ModelSpec, Network};

use crate::config::RunConfig;
use crate::data::{read_manifest, ImageLoader, ImageTransform, ManifestColumns};
use crate::train::checkpoint::{apply_weights, load_checkpoint, LoadMode};
use crate::train::metrics::{RunningMetrics, TOPK};
use crate::train::training_loop::predict_logits;

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// Checkpoint to evaluate (NNN.ckpt)
    #[arg(short, long, required = true)]
    pub ckpt: PathBuf,

    #[arg(long, default_value = "/mnt/HDD/RFW/test/data/")]
    pub test_root: PathBuf,

    #[arg(long, default_value = "data/RFW_Test_Images_Metadata.csv")]
    pub test_csv: PathBuf,

    /// Test batch is 4x this, as in validation
    #[arg(short, long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(short = 'j', long, default_value_t = 16)]
    pub workers: usize,

    #[arg(long, default_value = "auto")]
    pub device: String,

    /// Stop after this many images
    #[arg(long)]
    pub limit: Option<usize>,

    /// Used only when the checkpoint has neither a sidecar nor a config.json beside it
    #[arg(long, default_value = "wsdan")]
    pub model: ModelKind,

    #[arg(long, default_value_t = 4)]
    pub num_classes: usize,

    #[arg(long, default_value_t = 8)]
    pub num_attentions: usize,

    #[arg(long, default_value_t = 400)]
    pub image_size: usize,

    #[arg(long)]
    pub path_column: Option<String>,

    #[arg(long)]
    pub label_column: Option<String>,
}

pub struct EvalReport {
    pub samples: usize,
    pub loss: f64,
    pub accuracy: [f64; 3],
}

/// Model settings for a checkpoint without a sidecar: the run's `config.json`
/// when present, else the command line.
fn fallback_spec(args: &EvaluateArgs) -> ModelSpec {
    let config_path = args
        .ckpt
        .parent()
        .map(|dir| dir.join("config.json"))
        .filter(|p| p.exists());
    if let Some(path) = config_path {
        match RunConfig::load(&path) {
            Ok(config) => {
                info!("No sidecar next to {:?}; using {:?}", args.ckpt, path);
                return config.model;
            }
            Err(e) => warn!("⚠️ Ignoring unreadable {:?}: {}", path, e),
        }
    }
    warn!("⚠️ No sidecar next to {:?}; using --model {}", args.ckpt, args.model);
    ModelSpec::new(args.model, args.num_classes)
        .with_num_attentions(args.num_attentions)
        .with_image_size(args.image_size)
}

pub fn run(args: EvaluateArgs) -> Result<()> {
    info!("--- Race Classifier Evaluation ---");
    info!("Checkpoint: {:?}", args.ckpt);
    info!("Data:       {:?}", args.test_csv);
    evaluate(&args).map(|_| ())
}

pub fn evaluate(args: &EvaluateArgs) -> Result<EvalReport> {
    let device = select_device(&args.device)?;
    let ckpt = load_checkpoint(&args.ckpt, &device)?;
    let spec = match &ckpt.meta {
        Some(meta) => meta.model,
        None => fallback_spec(args),
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let net = Network::load(&spec, vb)?;
    apply_weights(&varmap, &ckpt.tensors, LoadMode::Strict)?;
    drop(ckpt);
    info!("Model {} loaded on {:?}", spec.kind, device);

    let columns = ManifestColumns {
        path: args.path_column.clone(),
        label: args.label_column.clone(),
    };
    let mut samples = read_manifest(&args.test_csv, &args.test_root, &columns, spec.num_classes)?;
    if let Some(limit) = args.limit {
        samples.truncate(limit);
    }
    let total = samples.len();

    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers.max(1))
            .build()?,
    );
    let mut loader = ImageLoader::new(
        samples,
        args.batch_size * 4,
        ImageTransform::new(spec.image_size),
        pool,
    );
    if loader.is_empty() {
        anyhow::bail!("❌ Test dataset is empty! Check {:?}", args.test_csv);
    }

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );

    let mut metrics = RunningMetrics::new();
    loader.reset();
    while let Some((images, labels)) = loader.next_batch(&device)? {
        let logits = predict_logits(&net, &images)?.detach();
        let batch_loss = loss::cross_entropy(&logits, &labels)?.to_scalar::<f32>()? as f64;
        metrics.add(batch_loss, &accuracy(&logits, &labels, &TOPK)?);
        pb.inc(labels.dim(0)? as u64);
        pb.set_message(format!("loss {:.4}", metrics.mean_loss()));
    }
    pb.finish_with_message("done");

    let [a1, a2, a3] = metrics.mean_acc();
    info!(
        "Test: {} images, Loss {:.5}, Accuracy: Top-1 {:.2}, Top-2 {:.2}, Top-3 {:.2}",
        total,
        metrics.mean_loss(),
        a1,
        a2,
        a3
    );
    Ok(EvalReport {
        samples: total,
        loss: metrics.mean_loss(),
        accuracy: metrics.mean_acc(),
    })
}
