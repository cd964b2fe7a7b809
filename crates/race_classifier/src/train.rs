//! Train Module - Training pipeline for the race classifier
//!
//! This module provides the training infrastructure:
//! - TrainArgs: CLI arguments for training
//! - optimizer: SGD with momentum and weight decay
//! - scheduler: per-epoch learning rate schedules
//! - metrics: running loss / top-k accuracy
//! - checkpoint: state saving/loading utilities
//! - training_loop: epoch loop (train, validate, schedule, save)

pub mod args;
pub mod checkpoint;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod training_loop;

pub use args::TrainArgs;
pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use training_loop::run;
