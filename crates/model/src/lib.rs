mod base;
pub mod classifier;
pub mod config;
mod network;
mod residual;

pub use classifier::Classifier;
pub use config::{Architecture, ModelConfig};
