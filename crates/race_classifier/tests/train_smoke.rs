use anyhow::Result;
use clap::Parser;
use image::{Rgb, RgbImage};
use race_classifier::cli::{Cli, Commands};
use race_classifier::evaluate::{self, EvaluateArgs};
use race_classifier::train::checkpoint::{load_checkpoint, FEATURE_CENTER_KEY};
use race_classifier::train::{self, TrainArgs};
use std::io::Write;
use std::path::Path;

/// Writes `n` small images plus a manifest with RFW race names.
fn write_dataset(root: &Path, csv_name: &str, n: usize) -> Result<()> {
    let races = ["African", "Asian", "Caucasian", "Indian"];
    let mut csv = std::fs::File::create(root.join(csv_name))?;
    writeln!(csv, "image,race")?;
    for i in 0..n {
        let name = format!("{}_{i}.png", csv_name.trim_end_matches(".csv"));
        let shade = (i * 40 % 255) as u8;
        RgbImage::from_fn(12, 10, |x, y| Rgb([shade, (x * 20) as u8, (y * 20) as u8]))
            .save(root.join(&name))?;
        writeln!(csv, "{},{}", name, races[i % races.len()])?;
    }
    Ok(())
}

fn train_args(root: &Path, model: &str, image_size: usize, extra: &[&str]) -> TrainArgs {
    let root_s = root.to_str().unwrap().to_string();
    let train_csv = root.join("train.csv").to_str().unwrap().to_string();
    let val_csv = root.join("val.csv").to_str().unwrap().to_string();
    let save_dir = root.join("models").to_str().unwrap().to_string();
    let mut argv = vec![
        "race_classifier".to_string(),
        "train".to_string(),
        "--model".to_string(),
        model.to_string(),
        "--image-size".to_string(),
        image_size.to_string(),
        "-b".to_string(),
        "2".to_string(),
        "-j".to_string(),
        "2".to_string(),
        "-v".to_string(),
        "1".to_string(),
        "--device".to_string(),
        "cpu".to_string(),
        "--seed".to_string(),
        "7".to_string(),
        "--data-root".to_string(),
        root_s,
        "--train-csv".to_string(),
        train_csv,
        "--val-csv".to_string(),
        val_csv,
        "--sd".to_string(),
        save_dir,
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    match Cli::parse_from(argv).command {
        Commands::Train(args) => args,
        Commands::Evaluate(_) => unreachable!(),
    }
}

#[test]
fn test_train_two_epochs_then_resume() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_dataset(root, "train.csv", 4)?;
    write_dataset(root, "val.csv", 2)?;

    train::run(train_args(root, "resnet50", 32, &["-e", "2"]))?;

    let model_dir = root.join("models").join("resnet50");
    for name in ["001.ckpt", "001.json", "002.ckpt", "002.json", "config.json", "training_state.json"] {
        assert!(model_dir.join(name).exists(), "missing {name}");
    }
    assert!(!model_dir.join("003.ckpt").exists());

    let state: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(model_dir.join("training_state.json"))?)?;
    assert_eq!(state["epoch"], 2);
    assert_eq!(state["checkpoint"], "002.ckpt");
    assert_eq!(state["model"]["kind"], "resnet50");

    // --init 0 without --ckpt picks up 002.ckpt and runs only the third epoch.
    train::run(train_args(root, "resnet50", 32, &["-e", "3", "--init", "0"]))?;
    assert!(model_dir.join("003.ckpt").exists());
    let config: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(model_dir.join("config.json"))?)?;
    assert_eq!(config["start_epoch"], 2);

    // Without a sidecar the run's config.json decides the architecture, not --model.
    std::fs::remove_file(model_dir.join("003.json"))?;
    let report = evaluate::evaluate(&EvaluateArgs {
        ckpt: model_dir.join("003.ckpt"),
        test_root: root.to_path_buf(),
        test_csv: root.join("val.csv"),
        batch_size: 1,
        workers: 1,
        device: "cpu".to_string(),
        limit: Some(1),
        model: vision_engine::ModelKind::Wsdan,
        num_classes: 4,
        num_attentions: 8,
        image_size: 400,
        path_column: None,
        label_column: None,
    })?;
    assert_eq!(report.samples, 1);
    assert!(report.loss.is_finite());
    assert!(report.accuracy[2] >= report.accuracy[0]);
    Ok(())
}

#[test]
fn test_empty_training_set_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_dataset(root, "train.csv", 0)?;
    write_dataset(root, "val.csv", 1)?;
    let err = train::run(train_args(root, "resnet50", 32, &["-e", "1"])).unwrap_err();
    assert!(err.to_string().contains("empty"));
    Ok(())
}

#[test]
fn test_save_freq_skips_odd_epochs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_dataset(root, "train.csv", 2)?;
    write_dataset(root, "val.csv", 1)?;

    // Epochs 0..3 with --sf 2 save after epochs 0 and 2 only.
    train::run(train_args(root, "resnet50", 32, &["-e", "3", "--sf", "2"]))?;
    let model_dir = root.join("models").join("resnet50");
    assert!(model_dir.join("001.ckpt").exists());
    assert!(!model_dir.join("002.ckpt").exists());
    assert!(!model_dir.join("002.json").exists());
    assert!(model_dir.join("003.ckpt").exists());
    Ok(())
}

#[test]
fn test_wsdan_trains_and_resumes_with_feature_center() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_dataset(root, "train.csv", 2)?;
    write_dataset(root, "val.csv", 1)?;
    train::run(train_args(root, "wsdan", 80, &["--num-attentions", "2", "-e", "1"]))?;
    let model_dir = root.join("models").join("wsdan");
    let ckpt = load_checkpoint(&model_dir.join("001.ckpt"), &candle_core::Device::Cpu)?;
    let meta = ckpt.meta.expect("sidecar");
    assert!(meta.has_feature_center);
    assert_eq!(meta.model.num_attentions, 2);
    let center = ckpt
        .tensors
        .get(FEATURE_CENTER_KEY)
        .expect("feature center saved");
    // [num_classes, M * 768]
    assert_eq!(center.dims(), &[4, 2 * 768]);
    let magnitude = center.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert!(magnitude > 0.0, "feature center was never updated");

    train::run(train_args(
        root,
        "wsdan",
        80,
        &["--num-attentions", "2", "-e", "2", "--init", "0"],
    ))?;
    assert!(model_dir.join("002.ckpt").exists());
    let resumed = load_checkpoint(&model_dir.join("002.ckpt"), &candle_core::Device::Cpu)?;
    assert!(resumed.tensors.contains_key(FEATURE_CENTER_KEY));
    Ok(())
}

#[test]
fn test_inception_trains_with_aux_head_and_resumes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();
    write_dataset(root, "train.csv", 2)?;
    write_dataset(root, "val.csv", 1)?;

    // 299 is the smallest input whose Mixed_6e map still fits the auxiliary head.
    train::run(train_args(root, "inception", 299, &["-e", "1"]))?;
    let model_dir = root.join("models").join("inception");
    let ckpt = load_checkpoint(&model_dir.join("001.ckpt"), &candle_core::Device::Cpu)?;
    assert!(ckpt.tensors.keys().any(|k| k.starts_with("AuxLogits.")));
    assert!(!ckpt.tensors.contains_key(FEATURE_CENTER_KEY));

    train::run(train_args(root, "inception", 299, &["-e", "2", "--init", "0"]))?;
    assert!(model_dir.join("002.ckpt").exists());
    Ok(())
}
