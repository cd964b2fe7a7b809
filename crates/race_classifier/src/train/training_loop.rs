//! Training Loop - Epoch loop with validation, LR scheduling and checkpoints

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{loss, Optimizer, VarBuilder, VarMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};
use vision_engine::augment::{attention_crop, attention_drop, THETA_C, THETA_D};
use vision_engine::device_utils::{get_vram_info, select_device};
use vision_engine::{accuracy, ModelSpec, Network, NetworkOutput};

use super::args::TrainArgs;
use super::checkpoint::{
    apply_weights, checkpoint_tensors, epoch_from_path, find_latest_checkpoint, load_checkpoint,
    save_checkpoint, CheckpointMeta, LoadMode, FEATURE_CENTER_KEY,
};
use super::metrics::{RunningMetrics, TOPK};
use super::optimizer::{ParamsSgd, SgdMomentum};
use super::scheduler::LrScheduler;
use crate::config::RunConfig;
use crate::data::{read_manifest, ImageLoader, ImageTransform, ManifestColumns};

/// Feature center moving-average rate
const CENTER_BETA: f64 = 1e-4;
/// Weight of the Inception auxiliary classifier loss
const AUX_LOSS_WEIGHT: f64 = 0.4;
/// Size of the attention crops used at validation time
pub const EVAL_CROP_SIZE: (usize, usize) = (256, 256);

pub enum EpochOutcome {
    /// Mean raw training loss
    Completed(f64),
    /// Ctrl-C: an `interrupt_NNN.ckpt` snapshot for this epoch was written
    Interrupted,
}

/// Eval-mode logits. WS-DAN averages the raw prediction with the prediction
/// on the attention crop.
pub fn predict_logits(net: &Network, images: &Tensor) -> Result<Tensor> {
    let out = net.forward_t(images, false)?;
    match out.attention_map {
        Some(map) => {
            let crops = attention_crop(images, &map, THETA_C, EVAL_CROP_SIZE)?;
            let crop_logits = net.predict(&crops)?;
            Ok(((out.logits + crop_logits)? / 2.0)?)
        }
        None => Ok(out.logits),
    }
}

/// Cross entropy, plus the weighted auxiliary loss when the network has one.
fn classification_loss(out: &NetworkOutput, targets: &Tensor) -> Result<Tensor> {
    let main = loss::cross_entropy(&out.logits, targets)?;
    match &out.aux_logits {
        Some(aux) => {
            let aux_loss = loss::cross_entropy(aux, targets)?;
            Ok((main + (aux_loss * AUX_LOSS_WEIGHT)?)?)
        }
        None => Ok(main),
    }
}

/// Squared distance of each sample's attention features to its class center,
/// summed over features and averaged over the batch.
fn center_loss(features: &Tensor, centers: &Tensor) -> Result<Tensor> {
    let batch = features.dim(0)? as f64;
    Ok(((features - centers)?.sqr()?.sum_all()? / batch)?)
}

pub struct Trainer {
    pub net: Network,
    pub varmap: VarMap,
    pub optimizer: SgdMomentum,
    /// WS-DAN only: [num_classes, M * C]
    pub feature_center: Option<Tensor>,
    pub spec: ModelSpec,
    pub device: Device,
    pub save_dir: PathBuf,
    pub save_freq: usize,
    pub verbose: usize,
    pub running: Arc<AtomicBool>,
}

impl Trainer {
    fn save(&self, epoch: usize, train_loss: f64, interrupted: bool) -> Result<PathBuf> {
        let tensors =
            checkpoint_tensors(&self.varmap, self.feature_center.as_ref(), &self.optimizer)?;
        let mut meta = CheckpointMeta::new(
            epoch,
            &self.save_dir,
            self.spec,
            self.optimizer.params(),
            self.feature_center.is_some(),
            train_loss,
        );
        if interrupted {
            meta = meta.interrupted();
        }
        save_checkpoint(&self.save_dir, &meta, &tensors)
    }

    /// One optimizer step on a plain batch; returns (loss, logits).
    fn step_plain(&mut self, images: &Tensor, labels: &Tensor) -> Result<(f64, Tensor)> {
        let out = self.net.forward_t(images, true)?;
        let batch_loss = classification_loss(&out, labels)?;
        self.optimizer.backward_step(&batch_loss)?;
        Ok((batch_loss.to_scalar::<f32>()? as f64, out.logits.detach()))
    }

    /// Raw pass with center loss, then attention crop and drop passes.
    /// Returns (loss, logits) for the raw, crop and drop images.
    fn step_wsdan(&mut self, images: &Tensor, labels: &Tensor) -> Result<[(f64, Tensor); 3]> {
        let (_b, _c, h, w) = images.dims4()?;
        let out = self.net.forward_t(images, true)?;
        let feature_matrix = out
            .feature_matrix
            .ok_or_else(|| anyhow::anyhow!("network produced no feature matrix"))?;
        let attention_map = out
            .attention_map
            .ok_or_else(|| anyhow::anyhow!("network produced no attention map"))?;
        let center = self
            .feature_center
            .clone()
            .ok_or_else(|| anyhow::anyhow!("feature center not initialised"))?;

        // Raw images
        let center_batch = center.index_select(labels, 0)?;
        let ce = loss::cross_entropy(&out.logits, labels)?;
        let raw_loss = (ce + center_loss(&feature_matrix, &center_batch)?)?;
        self.optimizer.backward_step(&raw_loss)?;
        let delta = ((feature_matrix.detach() - &center_batch)? * CENTER_BETA)?;
        self.feature_center = Some(center.index_add(labels, &delta, 0)?);
        let raw = (raw_loss.to_scalar::<f32>()? as f64, out.logits.detach());

        // Attention cropping
        let crop_map = attention_map.narrow(1, 0, 1)?;
        let crops = attention_crop(images, &crop_map, THETA_C, (h, w))?;
        let crop = self.step_plain(&crops, labels)?;

        // Attention dropping
        let drop_map = attention_map.narrow(1, 1, 1)?;
        let dropped = attention_drop(images, &drop_map, THETA_D)?;
        let drop = self.step_plain(&dropped, labels)?;

        Ok([raw, crop, drop])
    }

    pub fn train_epoch(&mut self, epoch: usize, loader: &mut ImageLoader) -> Result<EpochOutcome> {
        let wsdan = self.feature_center.is_some();
        let mut metrics: [RunningMetrics; 3] = Default::default(); // Raw / Crop / Drop
        let start = Instant::now();

        info!(
            "Epoch {:03}, Learning Rate {}",
            epoch + 1,
            self.optimizer.learning_rate()
        );
        loader.reset();
        let mut i = 0;
        while let Some((images, labels)) = loader.next_batch(&self.device)? {
            if wsdan {
                for (m, (l, logits)) in metrics.iter_mut().zip(self.step_wsdan(&images, &labels)?) {
                    m.add(l, &accuracy(&logits, &labels, &TOPK)?);
                }
            } else {
                let (l, logits) = self.step_plain(&images, &labels)?;
                metrics[0].add(l, &accuracy(&logits, &labels, &TOPK)?);
            }
            i += 1;

            if i % self.verbose == 0 {
                if wsdan {
                    info!(
                        "\tBatch {}: (Raw) {}, (Crop) {}, (Drop) {}",
                        i,
                        metrics[0].summary(),
                        metrics[1].summary(),
                        metrics[2].summary()
                    );
                } else {
                    info!("\tBatch {}: (Raw) {}", i, metrics[0].summary());
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                info!("[Shutdown] Saving snapshot for epoch {:03}...", epoch);
                let path = self.save(epoch, metrics[0].mean_loss(), true)?;
                info!("Resume with --ckpt {:?} --init 0", path);
                return Ok(EpochOutcome::Interrupted);
            }
        }

        if epoch % self.save_freq == 0 {
            self.save(epoch + 1, metrics[0].mean_loss(), false)?;
        }

        let elapsed = start.elapsed().as_secs_f64();
        if wsdan {
            info!(
                "Train: (Raw) {}, (Crop) {}, (Drop) {}, Time {:.2}",
                metrics[0].summary(),
                metrics[1].summary(),
                metrics[2].summary(),
                elapsed
            );
        } else {
            info!("Train: (Raw) {}, Time {:.2}", metrics[0].summary(), elapsed);
        }

        if self.device.is_cuda() {
            if let Ok((free, total)) = get_vram_info(0) {
                let used_mb = (total - free) as f64 / 1024.0 / 1024.0;
                info!("       [VRAM] Used: {:.2} MB", used_mb);
            }
        }

        Ok(EpochOutcome::Completed(metrics[0].mean_loss()))
    }

    /// Eval-mode pass over `loader`; returns the mean loss.
    pub fn validate(&self, loader: &mut ImageLoader) -> Result<f64> {
        validate(&self.net, loader, &self.device, self.verbose)
    }
}

pub fn validate(
    net: &Network,
    loader: &mut ImageLoader,
    device: &Device,
    verbose: usize,
) -> Result<f64> {
    let mut metrics = RunningMetrics::new();
    let start = Instant::now();
    loader.reset();
    let mut i = 0;
    while let Some((images, labels)) = loader.next_batch(device)? {
        let batch_start = Instant::now();
        let logits = predict_logits(net, &images)?.detach();
        let batch_loss = loss::cross_entropy(&logits, &labels)?;
        metrics.add(
            batch_loss.to_scalar::<f32>()? as f64,
            &accuracy(&logits, &labels, &TOPK)?,
        );
        i += 1;
        if i % verbose.max(1) == 0 {
            let [a1, a2, a3] = metrics.mean_acc();
            info!(
                "\tBatch {}: Loss {:.5}, Accuracy: Top-1 {:.2}, Top-2 {:.2}, Top-3 {:.2}, Time {:.2}",
                i,
                metrics.mean_loss(),
                a1,
                a2,
                a3,
                batch_start.elapsed().as_secs_f64()
            );
        }
    }
    let [a1, a2, a3] = metrics.mean_acc();
    info!(
        "Valid: Loss {:.5}, Accuracy: Top-1 {:.2}, Top-2 {:.2}, Top-3 {:.2}, Time {:.2}",
        metrics.mean_loss(),
        a1,
        a2,
        a3,
        start.elapsed().as_secs_f64()
    );
    info!("");
    Ok(metrics.mean_loss())
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) {
    let ctrl_c_count = Arc::new(AtomicUsize::new(0));
    let c = ctrl_c_count.clone();
    let result = ctrlc::set_handler(move || {
        let count = c.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            info!("\n\n🛑 Ctrl+C detected! Finishing current batch and saving...");
            info!("   (Press Ctrl+C again to force quit WITHOUT saving)");
            running.store(false, Ordering::SeqCst);
        } else {
            error!("\n⚠️  Force quit! Exiting immediately without saving.");
            std::process::exit(1);
        }
    });
    if let Err(e) = result {
        warn!("⚠️ Could not install Ctrl-C handler: {}", e);
    }
}

/// Main training function
pub fn run(args: TrainArgs) -> Result<()> {
    // ============================================================
    // Section 1: Model
    // ============================================================
    let device = select_device(&args.device)?;
    info!("Device initialized: {:?}", device);

    let spec = RunConfig::model_spec(&args);
    let save_dir = args.save_dir.join(spec.kind.name());
    std::fs::create_dir_all(&save_dir)?;
    info!("📁 Save directory: {:?}", save_dir);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let net = Network::load(&spec, vb)?;
    if let Some(seed) = args.seed {
        net.reseed(seed);
    }
    info!(
        "Model {} initialized. Varmap Key count: {}",
        spec.kind,
        varmap.all_vars().len()
    );

    if let Some(path) = &args.pretrained {
        let tensors = candle_core::safetensors::load(path, &device)?;
        let report = apply_weights(&varmap, &tensors, LoadMode::Lenient)?;
        info!(
            "Pretrained weights from {:?}: {} loaded, {} skipped",
            path,
            report.loaded,
            report.skipped.len()
        );
    }

    // ============================================================
    // Section 2: Checkpoint / resume
    // ============================================================
    let checkpoint_path = match &args.ckpt {
        Some(path) => Some(path.clone()),
        None if args.resume() => {
            let found = find_latest_checkpoint(&save_dir)?;
            if found.is_none() {
                warn!("⚠️ --init 0 but no checkpoint in {:?}. Starting fresh.", save_dir);
            }
            found
        }
        None => None,
    };

    let mut start_epoch = 0;
    let mut resumed_lr = None;
    let mut loaded = None;
    if let Some(path) = &checkpoint_path {
        let ckpt = load_checkpoint(path, &device)?;
        if let Some(meta) = &ckpt.meta {
            if meta.model.kind != spec.kind {
                warn!(
                    "⚠️ Checkpoint was trained as {}, loading into {}",
                    meta.model.kind, spec.kind
                );
            }
            resumed_lr = Some(meta.optimizer.lr);
        }
        apply_weights(&varmap, &ckpt.tensors, LoadMode::Strict)?;
        info!("Network loaded from {:?}", path);
        if args.resume() {
            start_epoch = epoch_from_path(path)?;
            info!("Resuming from Epoch {}", start_epoch);
        }
        loaded = Some(ckpt);
    }

    let mut run_config = RunConfig::from_args(&args);
    run_config.start_epoch = start_epoch;
    run_config.checkpoint = checkpoint_path.clone();
    run_config.save(&save_dir.join("config.json"))?;

    // ============================================================
    // Section 3: Data
    // ============================================================
    let columns = ManifestColumns {
        path: args.path_column.clone(),
        label: args.label_column.clone(),
    };
    let train_samples = read_manifest(&args.train_csv, &args.data_root, &columns, spec.num_classes)?;
    let val_samples = read_manifest(&args.val_csv, &args.data_root, &columns, spec.num_classes)?;

    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers.max(1))
            .build()?,
    );
    let transform = ImageTransform::new(spec.image_size);
    let mut train_loader =
        ImageLoader::new(train_samples, args.batch_size, transform, pool.clone())
            .with_shuffle(args.seed);
    let mut val_loader = ImageLoader::new(val_samples, args.batch_size * 4, transform, pool);
    if train_loader.is_empty() {
        anyhow::bail!("❌ Training dataset is empty! Check {:?}", args.train_csv);
    }
    if val_loader.is_empty() {
        anyhow::bail!("❌ Validation dataset is empty! Check {:?}", args.val_csv);
    }

    // ============================================================
    // Section 4: Optimizer, feature center, schedule
    // ============================================================
    let mut optimizer = SgdMomentum::from_varmap(
        &varmap,
        ParamsSgd {
            lr: args.lr,
            ..Default::default()
        },
    )?;

    let mut feature_center = match spec.feature_dim() {
        Some(dim) if spec.kind.uses_feature_center() => {
            Some(Tensor::zeros((spec.num_classes, dim), DType::F32, &device)?)
        }
        _ => None,
    };

    if let Some(ckpt) = &loaded {
        let restored = optimizer.load_momentum(&ckpt.tensors)?;
        if restored > 0 {
            info!("Restored {} momentum buffers", restored);
        }
        if let (Some(center), Some(saved)) =
            (feature_center.as_mut(), ckpt.tensors.get(FEATURE_CENTER_KEY))
        {
            if saved.dims() == center.dims() {
                *center = saved.to_dtype(DType::F32)?.to_device(&device)?;
                info!("Restored feature center");
            } else {
                warn!(
                    "⚠️ Feature center shape {:?} does not match {:?}. Starting from zeros.",
                    saved.dims(),
                    center.dims()
                );
            }
        }
    }
    drop(loaded);

    let mut scheduler = LrScheduler::new(args.scheduler, args.lr);
    if start_epoch > 0 {
        let lr = scheduler.fast_forward(start_epoch, resumed_lr.unwrap_or(args.lr));
        optimizer.set_learning_rate(lr);
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone());

    let mut trainer = Trainer {
        net,
        varmap,
        optimizer,
        feature_center,
        spec,
        device,
        save_dir,
        save_freq: args.save_freq.max(1),
        verbose: args.verbose.max(1),
        running,
    };

    // ============================================================
    // Section 5: Epoch loop
    // ============================================================
    info!("");
    info!(
        "Start training: Total epochs: {}, Batch size: {}, Training size: {}, Validation size: {}",
        args.epochs,
        args.batch_size,
        train_loader.len(),
        val_loader.len()
    );
    info!(
        "{} batches per epoch, LR schedule {:?}",
        train_loader.num_batches(),
        scheduler.kind()
    );

    for epoch in start_epoch..args.epochs {
        if let EpochOutcome::Interrupted = trainer.train_epoch(epoch, &mut train_loader)? {
            info!("Exiting gracefully.");
            return Ok(());
        }
        let val_loss = trainer.validate(&mut val_loader)?;
        let lr = scheduler.step(trainer.optimizer.learning_rate(), val_loss);
        trainer.optimizer.set_learning_rate(lr);
    }

    info!("Training complete.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Sample;
    use image::{Rgb, RgbImage};
    use vision_engine::ModelKind;

    #[test]
    fn test_center_loss_averages_over_batch() -> Result<()> {
        let features = Tensor::new(&[[1f32, 2., 3.], [0., 0., 4.]], &Device::Cpu)?;
        let centers = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        // (1 + 4 + 9 + 16) / 2
        let l = center_loss(&features, &centers)?.to_scalar::<f32>()?;
        assert!((l - 15.0).abs() < 1e-5);
        Ok(())
    }

    fn tiny_trainer(save_dir: PathBuf, running: bool) -> Result<Trainer> {
        let device = Device::Cpu;
        let spec = ModelSpec::new(ModelKind::Resnet50, 4).with_image_size(32);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = Network::load(&spec, vb)?;
        let optimizer = SgdMomentum::from_varmap(&varmap, ParamsSgd::default())?;
        Ok(Trainer {
            net,
            varmap,
            optimizer,
            feature_center: None,
            spec,
            device,
            save_dir,
            save_freq: 1,
            verbose: 1,
            running: Arc::new(AtomicBool::new(running)),
        })
    }

    #[test]
    fn test_interrupt_keeps_last_clean_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let save_dir = dir.path().join("models");
        let samples = (0..2)
            .map(|i| {
                let path = dir.path().join(format!("{i}.png"));
                RgbImage::from_pixel(8, 8, Rgb([i as u8 * 90, 30, 60])).save(&path)?;
                Ok(Sample { path, label: i })
            })
            .collect::<Result<Vec<_>>>()?;
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build()?);
        let mut loader = ImageLoader::new(samples, 2, ImageTransform::new(32), pool);

        let mut trainer = tiny_trainer(save_dir.clone(), false)?;
        // Checkpoint from the end of epoch 0, the resume point for epoch 1.
        let clean = trainer.save(1, 1.0, false)?;
        let before = std::fs::read(&clean)?;

        let outcome = trainer.train_epoch(1, &mut loader)?;
        assert!(matches!(outcome, EpochOutcome::Interrupted));
        assert_eq!(std::fs::read(&clean)?, before);
        assert!(save_dir.join("interrupt_001.ckpt").exists());
        assert!(!save_dir.join("002.ckpt").exists());
        assert_eq!(find_latest_checkpoint(&save_dir)?, Some(clean));

        let snapshot = load_checkpoint(&save_dir.join("interrupt_001.ckpt"), &Device::Cpu)?;
        let meta = snapshot.meta.expect("sidecar");
        assert!(meta.interrupted);
        assert_eq!(meta.epoch, 1);
        Ok(())
    }
}
