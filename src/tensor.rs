use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

/// Per-sample dimensions, channel-major. Flat vectors are `(n, 1, 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub const fn flat(len: usize) -> Self {
        Self {
            channels: len,
            height: 1,
            width: 1,
        }
    }

    pub const fn image(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    pub const fn numel(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub const fn plane(&self) -> usize {
        self.height * self.width
    }
}

/// A batch of samples: one row per sample, one column per feature.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: DMatrix<f32>,
    shape: Shape,
}

impl Tensor {
    pub fn new(data: DMatrix<f32>, shape: Shape) -> Result<Self> {
        if data.ncols() != shape.numel() {
            return Err(Error::ShapeMismatch {
                what: "tensor features",
                got: data.ncols(),
                expected: shape.numel(),
            });
        }

        Ok(Self { data, shape })
    }

    pub fn zeros(batch: usize, shape: Shape) -> Self {
        Self {
            data: DMatrix::zeros(batch, shape.numel()),
            shape,
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            data: DMatrix::from_element(1, 1, value),
            shape: Shape::flat(1),
        }
    }

    /// Stacks equally sized samples into one batch.
    pub fn from_samples<S: AsRef<[f32]>>(shape: Shape, samples: &[S]) -> Result<Self> {
        for s in samples {
            if s.as_ref().len() != shape.numel() {
                return Err(Error::ShapeMismatch {
                    what: "sample length",
                    got: s.as_ref().len(),
                    expected: shape.numel(),
                });
            }
        }

        let data = DMatrix::from_fn(samples.len(), shape.numel(), |i, j| samples[i].as_ref()[j]);

        Ok(Self { data, shape })
    }

    /// Standard normal entries, drawn sample by sample.
    pub fn randn(batch: usize, shape: Shape, rng: &mut impl Rng) -> Self {
        let values: Vec<f32> = (0..batch * shape.numel())
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();

        Self {
            data: DMatrix::from_row_slice(batch, shape.numel(), &values),
            shape,
        }
    }

    /// Wraps a raw matrix whose columns are flat features.
    pub fn from_matrix(data: DMatrix<f32>) -> Self {
        let shape = Shape::flat(data.ncols());
        Self { data, shape }
    }

    pub fn batch_size(&self) -> usize {
        self.data.nrows()
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn data(&self) -> &DMatrix<f32> {
        &self.data
    }

    /// The first entry, used for `1x1` losses.
    pub fn item(&self) -> f32 {
        self.data[(0, 0)]
    }

    pub fn sample(&self, idx: usize) -> Vec<f32> {
        self.data.row(idx).iter().copied().collect()
    }

    pub fn reshape(self, shape: Shape) -> Result<Self> {
        Self::new(self.data, shape)
    }

    pub fn flatten(self) -> Self {
        let shape = Shape::flat(self.shape.numel());
        Self {
            data: self.data,
            shape,
        }
    }

    /// Column index of the largest score in every row. Ties go to the first.
    pub fn argmax_rows(&self) -> Vec<usize> {
        self.data
            .row_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                        if v > bv {
                            (i, v)
                        } else {
                            (bi, bv)
                        }
                    })
                    .0
            })
            .collect()
    }

    /// `[batch, c, h, w]`, or `[batch, n]` for flat tensors.
    pub fn dims(&self) -> Vec<usize> {
        if self.shape.height == 1 && self.shape.width == 1 {
            vec![self.batch_size(), self.shape.channels]
        } else {
            vec![
                self.batch_size(),
                self.shape.channels,
                self.shape.height,
                self.shape.width,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn from_samples_keeps_row_order() {
        let t = Tensor::from_samples(Shape::flat(3), &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]])
            .unwrap();

        assert_eq!(t.batch_size(), 2);
        assert_eq!(t.sample(1), vec![4.0, 5.0, 6.0]);
        assert_eq!(t.data()[(0, 2)], 3.0);
    }

    #[test]
    fn rejects_wrong_sample_length() {
        let err = Tensor::from_samples(Shape::flat(3), &[vec![1.0, 2.0]]).unwrap_err();

        assert!(matches!(err, Error::ShapeMismatch { got: 2, expected: 3, .. }));
    }

    #[test]
    fn argmax_prefers_first_of_ties() {
        let t = Tensor::from_samples(
            Shape::flat(3),
            &[vec![0.1, 0.7, 0.2], vec![0.5, 0.5, -1.0], vec![-3.0, -2.0, -1.0]],
        )
        .unwrap();

        assert_eq!(t.argmax_rows(), vec![1, 0, 2]);
    }

    #[test]
    fn randn_is_seeded() {
        let a = Tensor::randn(4, Shape::flat(8), &mut StdRng::seed_from_u64(7));
        let b = Tensor::randn(4, Shape::flat(8), &mut StdRng::seed_from_u64(7));

        assert_eq!(a, b);
    }

    #[test]
    fn dims_follow_shape() {
        let t = Tensor::zeros(3, Shape::image(3, 224, 224));
        assert_eq!(t.dims(), vec![3, 3, 224, 224]);
        assert_eq!(t.flatten().dims(), vec![3, 3 * 224 * 224]);
    }
}
