pub mod cli;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod train;
