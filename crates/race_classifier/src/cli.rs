use crate::evaluate::EvaluateArgs;
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Race classification trainer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a classifier (resumable)
    Train(TrainArgs),

    /// Evaluate a checkpoint on the test manifest
    Evaluate(EvaluateArgs),
}
