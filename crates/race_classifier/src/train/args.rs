//! Training Arguments - CLI configuration for training

use clap::Args;
use std::path::PathBuf;
use vision_engine::ModelKind;

use super::scheduler::SchedulerKind;

/// Training configuration from command line arguments
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Number of data loading workers
    #[arg(short = 'j', long, default_value_t = 16)]
    pub workers: usize,

    /// Number of epochs
    #[arg(short, long, default_value_t = 80)]
    pub epochs: usize,

    /// Batch size (validation uses 4x)
    #[arg(short, long, default_value_t = 16)]
    pub batch_size: usize,

    /// Checkpoint to load weights from
    #[arg(short, long)]
    pub ckpt: Option<PathBuf>,

    /// Log every N batches
    #[arg(short, long, default_value_t = 100)]
    pub verbose: usize,

    #[arg(long, visible_alias = "learning-rate", default_value_t = 1e-3)]
    pub lr: f64,

    /// Save a checkpoint every N epochs
    #[arg(long, visible_alias = "sf", default_value_t = 1)]
    pub save_freq: usize,

    #[arg(long, visible_alias = "sd", default_value = "./models")]
    pub save_dir: PathBuf,

    /// 1: train from the beginning, 0: resume from the checkpoint's epoch
    #[arg(long, visible_alias = "initial-training", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=1))]
    pub init: u8,

    #[arg(long, visible_alias = "model-training", default_value = "wsdan")]
    pub model: ModelKind,

    /// Backbone weights (safetensors); mismatched tensors are skipped
    #[arg(long)]
    pub pretrained: Option<PathBuf>,

    #[arg(long, default_value = "/mnt/HDD/RFW/train/data/")]
    pub data_root: PathBuf,

    #[arg(long, default_value = "data/RFW_Train40k_Images_Metada.csv")]
    pub train_csv: PathBuf,

    #[arg(long, default_value = "data/RFW_Val4k_Images_Metadata.csv")]
    pub val_csv: PathBuf,

    /// Manifest column holding the image path
    #[arg(long)]
    pub path_column: Option<String>,

    /// Manifest column holding the label
    #[arg(long)]
    pub label_column: Option<String>,

    #[arg(long, default_value_t = 400)]
    pub image_size: usize,

    #[arg(long, default_value_t = 4)]
    pub num_classes: usize,

    /// WS-DAN attention maps
    #[arg(long, default_value_t = 8)]
    pub num_attentions: usize,

    #[arg(long, value_enum, default_value_t = SchedulerKind::Step)]
    pub scheduler: SchedulerKind,

    /// cpu | cuda | cuda:N | auto
    #[arg(long, default_value = "auto")]
    pub device: String,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl TrainArgs {
    pub fn resume(&self) -> bool {
        self.init == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: TrainArgs,
    }

    #[test]
    fn test_defaults() {
        let args = Wrapper::parse_from(["train"]).args;
        assert_eq!(args.workers, 16);
        assert_eq!(args.epochs, 80);
        assert_eq!(args.batch_size, 16);
        assert_eq!(args.verbose, 100);
        assert_eq!(args.save_freq, 1);
        assert_eq!(args.init, 1);
        assert_eq!(args.model, ModelKind::Wsdan);
        assert_eq!(args.scheduler, SchedulerKind::Step);
        assert!((args.lr - 1e-3).abs() < 1e-12);
        assert!(!args.resume());
    }

    #[test]
    fn test_short_flags_and_aliases() {
        let args = Wrapper::parse_from([
            "train", "-j", "2", "-e", "3", "-b", "4", "-c", "models/x/005.ckpt", "--sd", "out",
            "--init", "0", "--model-training", "resnet100", "--learning-rate", "0.01",
        ])
        .args;
        assert_eq!(args.workers, 2);
        assert_eq!(args.epochs, 3);
        assert_eq!(args.batch_size, 4);
        assert_eq!(args.ckpt, Some(PathBuf::from("models/x/005.ckpt")));
        assert_eq!(args.save_dir, PathBuf::from("out"));
        assert_eq!(args.model, ModelKind::Resnet100);
        assert!(args.resume());
        assert!((args.lr - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_init_out_of_range() {
        assert!(Wrapper::try_parse_from(["train", "--init", "2"]).is_err());
    }
}
