pub mod dataset;
pub mod loader;
pub mod mnist;
pub mod synthetic;
pub mod transform;

pub use dataset::{Dataset, Sample, Split};
pub use loader::{Batch, DataLoader};
pub use mnist::Mnist;
pub use synthetic::synthetic_digits;
pub use transform::Transform;
