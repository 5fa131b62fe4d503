use itertools::izip;
use nalgebra::DMatrix;

use crate::{
    error::Result,
    graph::{Graph, NormStats, Var},
    layers::Mode,
    params::{ParamId, ParamStore},
};

const MOMENTUM: f32 = 0.1;
const EPS: f32 = 1e-5;

/// Per-channel batch normalization with running statistics.
///
/// Training mode normalizes with the batch moments and folds them into the
/// running mean and variance (`momentum = 0.1`, unbiased variance). Eval mode
/// normalizes with the running statistics.
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    gamma: ParamId,
    beta: ParamId,
    running_mean: ParamId,
    running_var: ParamId,
}

impl BatchNorm2d {
    pub fn new(store: &mut ParamStore, name: &str, channels: usize) -> Self {
        Self {
            gamma: store.add(format!("{name}.weight"), DMatrix::from_element(1, channels, 1.0)),
            beta: store.add(format!("{name}.bias"), DMatrix::zeros(1, channels)),
            running_mean: store.add_buffer(
                format!("{name}.running_mean"),
                DMatrix::zeros(1, channels),
            ),
            running_var: store.add_buffer(
                format!("{name}.running_var"),
                DMatrix::from_element(1, channels, 1.0),
            ),
        }
    }

    pub fn running_mean<'s>(&self, store: &'s ParamStore) -> &'s DMatrix<f32> {
        store.value(self.running_mean)
    }

    pub fn running_var<'s>(&self, store: &'s ParamStore) -> &'s DMatrix<f32> {
        store.value(self.running_var)
    }

    pub fn forward<'g>(
        &self,
        g: &'g Graph,
        store: &mut ParamStore,
        x: Var<'g>,
        mode: Mode,
    ) -> Result<Var<'g>> {
        let gamma = g.param(store, self.gamma);
        let beta = g.param(store, self.beta);

        match mode {
            Mode::Train => {
                let (y, moments) = g.batch_norm(x, gamma, beta, NormStats::Batch, EPS)?;
                if let Some(m) = moments {
                    self.update_running(store, &m.mean, &m.var);
                }
                Ok(y)
            }
            Mode::Eval => {
                let stats = NormStats::Running {
                    mean: store.value(self.running_mean),
                    var: store.value(self.running_var),
                };
                let (y, _) = g.batch_norm(x, gamma, beta, stats, EPS)?;
                Ok(y)
            }
        }
    }

    fn update_running(&self, store: &mut ParamStore, mean: &[f32], var: &[f32]) {
        for (r, &m) in izip!(store.value_mut(self.running_mean).iter_mut(), mean) {
            *r = (1.0 - MOMENTUM) * *r + MOMENTUM * m;
        }
        for (r, &v) in izip!(store.value_mut(self.running_var).iter_mut(), var) {
            *r = (1.0 - MOMENTUM) * *r + MOMENTUM * v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Shape, Tensor};

    fn batch() -> Tensor {
        Tensor::from_samples(Shape::image(1, 1, 2), &[vec![1.0, 3.0], vec![5.0, 7.0]]).unwrap()
    }

    #[test]
    fn train_mode_moves_running_stats() {
        let mut store = ParamStore::new();
        let bn = BatchNorm2d::new(&mut store, "bn", 1);
        let g = Graph::new();

        bn.forward(&g, &mut store, g.constant(batch()), Mode::Train).unwrap();

        assert!((bn.running_mean(&store)[(0, 0)] - 0.4).abs() < 1e-6);
        // 0.9 * 1 + 0.1 * (20 / 3)
        assert!((bn.running_var(&store)[(0, 0)] - (0.9 + 2.0 / 3.0)).abs() < 1e-5);
    }

    #[test]
    fn eval_mode_uses_running_stats_and_leaves_them() {
        let mut store = ParamStore::new();
        let bn = BatchNorm2d::new(&mut store, "bn", 1);
        let g = Graph::no_grad();

        let y = bn.forward(&g, &mut store, g.constant(batch()), Mode::Eval).unwrap().value();

        assert_eq!(bn.running_mean(&store)[(0, 0)], 0.0);
        // Fresh stats are mean 0, var 1, so only eps changes the values.
        assert!((y.data()[(1, 1)] - 7.0).abs() < 1e-3);
    }
}
