//! Small neural networks on handwritten digits: a fully connected
//! classifier, a fully connected GAN and GoogLeNet, trained on a tape-based
//! autodiff over `nalgebra` matrices.

pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod layers;
pub mod models;
pub mod optim;
pub mod params;
pub mod report;
pub mod tensor;
pub mod train;

pub use error::{Error, Result};
