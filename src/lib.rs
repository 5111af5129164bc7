pub mod analysis;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod frontier;
pub mod optimiser;
pub mod portfolio;
pub mod program;
pub mod reward;
pub mod scenario;
pub mod strategy;
pub mod types;
