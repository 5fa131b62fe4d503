use itertools::Itertools;
use log::debug;
use permutation_iterator::Permutor;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    data::Dataset,
    error::{Error, Result},
    tensor::Tensor,
};

/// Stacked samples; `labels` is `None` for unlabeled data.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Option<Vec<usize>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.batch_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits a dataset into mini-batches, once per call to [`DataLoader::iter`].
///
/// With `shuffle` every pass visits the samples in a fresh order drawn from
/// the loader's seeded generator, otherwise in index order. The last batch
/// holds the remainder when the batch size does not divide the length.
pub struct DataLoader<'a, D: Dataset> {
    dataset: &'a D,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl<'a, D: Dataset> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".into()));
        }
        if dataset.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "the {} dataset is empty",
                dataset.split()
            )));
        }

        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn dataset(&self) -> &'a D {
        self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Starts a new pass over the dataset.
    pub fn iter(&mut self) -> Batches<'a, D> {
        let len = self.dataset.len();
        let order: Vec<usize> = if self.shuffle {
            let key = self.rng.gen::<u64>();
            Permutor::new_with_u64_key(len as u64, key)
                .map(|i| i as usize)
                .collect()
        } else {
            (0..len).collect()
        };
        debug!(
            "{} pass: {len} samples in {} batches, shuffle={}",
            self.dataset.split(),
            self.num_batches(),
            self.shuffle
        );

        Batches {
            dataset: self.dataset,
            chunks: order
                .into_iter()
                .chunks(self.batch_size)
                .into_iter()
                .map(|c| c.collect())
                .collect::<Vec<Vec<usize>>>()
                .into_iter(),
        }
    }
}

/// One pass of batches. Each item reads its samples lazily.
pub struct Batches<'a, D: Dataset> {
    dataset: &'a D,
    chunks: std::vec::IntoIter<Vec<usize>>,
}

impl<'a, D: Dataset> Iterator for Batches<'a, D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.chunks.next()?;
        Some(collate(self.dataset, &indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl<'a, D: Dataset> ExactSizeIterator for Batches<'a, D> {}

fn collate<D: Dataset>(dataset: &D, indices: &[usize]) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i))
        .collect::<Result<Vec<_>>>()?;

    let labels = samples.iter().map(|s| s.label).collect::<Option<Vec<_>>>();
    let inputs: Vec<&[f32]> = samples.iter().map(|s| s.input.as_slice()).collect();

    Ok(Batch {
        inputs: Tensor::from_samples(dataset.sample_shape(), &inputs)?,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::data::{synthetic_digits, Split, Transform};

    fn digits(len: usize) -> crate::data::Mnist {
        synthetic_digits(len, Split::Train, 1, Transform::default()).unwrap()
    }

    #[test]
    fn last_batch_holds_the_remainder() {
        let data = digits(100);
        let mut loader = DataLoader::new(&data, 64, true, 3).unwrap();

        let sizes: Vec<usize> = loader.iter().map(|b| b.unwrap().len()).collect();
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(sizes, vec![64, 36]);
    }

    #[test]
    fn shuffled_pass_is_a_partition() {
        let data = digits(50);
        let mut loader = DataLoader::new(&data, 7, true, 11).unwrap();

        let mut seen = HashSet::new();
        let mut total = 0;
        for batch in loader.iter() {
            let batch = batch.unwrap();
            for i in 0..batch.len() {
                seen.insert(
                    batch
                        .inputs
                        .sample(i)
                        .iter()
                        .map(|v| v.to_bits())
                        .collect::<Vec<_>>(),
                );
            }
            total += batch.len();
        }

        assert_eq!(total, 50);
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn unshuffled_keeps_index_order() {
        let data = digits(10);
        let mut loader = DataLoader::new(&data, 4, false, 0).unwrap();

        let labels: Vec<usize> = loader
            .iter()
            .flat_map(|b| b.unwrap().labels.unwrap())
            .collect();
        let expected: Vec<usize> = (0..10).map(|i| data.get(i).unwrap().label.unwrap()).collect();
        assert_eq!(labels, expected);
    }

    #[test]
    fn same_seed_same_order() {
        let data = digits(30);
        let mut a = DataLoader::new(&data, 8, true, 5).unwrap();
        let mut b = DataLoader::new(&data, 8, true, 5).unwrap();

        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.unwrap(), y.unwrap());
        }
    }

    #[test]
    fn rejects_zero_batch_and_empty_data() {
        let data = digits(3);
        assert!(matches!(
            DataLoader::new(&data, 0, false, 0),
            Err(Error::InvalidConfig(_))
        ));

        let empty = digits(0);
        assert!(DataLoader::new(&empty, 4, false, 0).is_err());
    }
}
