//! Parametric blocks. Each layer keeps only the ids of its parameters; the
//! values live in the owning model's [`ParamStore`](crate::params::ParamStore).

pub mod batch_norm;
pub mod conv;
pub mod dropout;
pub mod linear;
pub mod pool;

pub use batch_norm::BatchNorm2d;
pub use conv::Conv2d;
pub use dropout::Dropout;
pub use linear::Linear;
pub use pool::{AvgPool2d, MaxPool2d};

/// Whether stochastic and statistics-collecting layers behave as in training.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Default init bound: `1 / sqrt(fan_in)`.
pub(crate) fn init_bound(fan_in: usize) -> f32 {
    1.0 / (fan_in as f32).sqrt()
}
