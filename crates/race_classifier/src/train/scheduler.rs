//! Learning rate schedules, stepped once per epoch after validation

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Multiply by gamma every step_size epochs
    Step,
    /// Multiply by factor when validation loss stops improving
    Plateau,
}

const STEP_SIZE: usize = 2;
const STEP_GAMMA: f64 = 0.9;
const PLATEAU_FACTOR: f64 = 0.5;
const PLATEAU_PATIENCE: usize = 2;
const PLATEAU_THRESHOLD: f64 = 1e-4;
const MIN_LR_DELTA: f64 = 1e-8;

#[derive(Debug, Clone)]
pub enum LrScheduler {
    Step {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
        last_epoch: usize,
    },
    Plateau {
        factor: f64,
        patience: usize,
        best: f64,
        bad_epochs: usize,
    },
}

impl LrScheduler {
    pub fn new(kind: SchedulerKind, base_lr: f64) -> Self {
        match kind {
            SchedulerKind::Step => LrScheduler::Step {
                base_lr,
                step_size: STEP_SIZE,
                gamma: STEP_GAMMA,
                last_epoch: 0,
            },
            SchedulerKind::Plateau => LrScheduler::Plateau {
                factor: PLATEAU_FACTOR,
                patience: PLATEAU_PATIENCE,
                best: f64::INFINITY,
                bad_epochs: 0,
            },
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        match self {
            LrScheduler::Step { .. } => SchedulerKind::Step,
            LrScheduler::Plateau { .. } => SchedulerKind::Plateau,
        }
    }

    /// Advances one epoch and returns the learning rate for the next one.
    pub fn step(&mut self, current_lr: f64, val_loss: f64) -> f64 {
        match self {
            LrScheduler::Step {
                base_lr,
                step_size,
                gamma,
                last_epoch,
            } => {
                *last_epoch += 1;
                *base_lr * gamma.powi((*last_epoch / *step_size) as i32)
            }
            LrScheduler::Plateau {
                factor,
                patience,
                best,
                bad_epochs,
            } => {
                if val_loss < *best * (1.0 - PLATEAU_THRESHOLD) {
                    *best = val_loss;
                    *bad_epochs = 0;
                    return current_lr;
                }
                *bad_epochs += 1;
                if *bad_epochs > *patience {
                    *bad_epochs = 0;
                    let new_lr = current_lr * *factor;
                    if current_lr - new_lr > MIN_LR_DELTA {
                        tracing::info!("Reducing learning rate to {:e}", new_lr);
                        return new_lr;
                    }
                }
                current_lr
            }
        }
    }

    /// Replays the schedule up to `epoch` when resuming. Plateau has no
    /// loss history to replay, so `current_lr` is kept.
    pub fn fast_forward(&mut self, epoch: usize, current_lr: f64) -> f64 {
        match self {
            LrScheduler::Step {
                base_lr,
                step_size,
                gamma,
                last_epoch,
            } => {
                *last_epoch = epoch;
                *base_lr * gamma.powi((epoch / *step_size) as i32)
            }
            LrScheduler::Plateau { .. } => current_lr,
        }
    }
}
