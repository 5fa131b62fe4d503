use std::fmt;

use crate::{error::Result, tensor::Shape};

/// Which part of a dataset a collection holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "training"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// One transformed input and, for supervised data, its class.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub input: Vec<f32>,
    pub label: Option<usize>,
}

/// A finite, indexable collection of samples.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn split(&self) -> Split;

    fn sample_shape(&self) -> Shape;

    fn get(&self, idx: usize) -> Result<Sample>;
}
