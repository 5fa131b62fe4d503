use itertools::izip;
use log::trace;
use nalgebra::DMatrix;

use crate::{
    error::{Error, Result},
    params::{GradState, ParamStore},
};

/// Updates the trainable parameters of one store from its accumulated
/// gradients.
pub trait Optimizer {
    fn step(&mut self, store: &mut ParamStore) -> Result<()>;
}

/// Checks that `store` is the one this optimizer serves and that it holds
/// gradients which have not been applied yet.
fn check_ready(bound: usize, store: &ParamStore) -> Result<()> {
    if store.id() != bound {
        return Err(Error::StoreMismatch {
            bound,
            got: store.id(),
        });
    }
    if store.state() != GradState::Accumulated {
        return Err(Error::MissingGradients { store: store.id() });
    }

    Ok(())
}

/// Adam with bias-corrected moment estimates.
#[derive(Debug)]
pub struct Adam {
    store: usize,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: Vec<DMatrix<f32>>,
    v: Vec<DMatrix<f32>>,
}

impl Adam {
    pub const BETA1: f32 = 0.9;
    pub const BETA2: f32 = 0.999;
    pub const EPS: f32 = 1e-8;

    /// Binds a new optimizer to `store`; moments start at zero.
    pub fn new(store: &ParamStore, lr: f32) -> Self {
        let zeros = || {
            store
                .iter()
                .map(|p| DMatrix::zeros(p.value.nrows(), p.value.ncols()))
                .collect::<Vec<_>>()
        };

        Self {
            store: store.id(),
            lr,
            beta1: Self::BETA1,
            beta2: Self::BETA2,
            eps: Self::EPS,
            t: 0,
            m: zeros(),
            v: zeros(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, store: &mut ParamStore) -> Result<()> {
        check_ready(self.store, store)?;

        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        let (b1, b2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);

        for (p, m, v) in izip!(store.iter_mut(), self.m.iter_mut(), self.v.iter_mut()) {
            if !p.trainable {
                continue;
            }

            let moments = izip!(p.value.iter_mut(), p.grad.iter(), m.iter_mut(), v.iter_mut());
            for (w, &g, m, v) in moments {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *w -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }

        trace!("adam step {} on store {}", self.t, store.id());
        store.mark_applied();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::params::Gradients;

    use super::*;

    fn store_with_grad(grad: f32) -> (ParamStore, crate::params::ParamId) {
        let mut store = ParamStore::new();
        let w = store.add("w", DMatrix::from_element(2, 3, 1.0));
        let mut grads = Gradients::default();
        grads.add(store.key(w), DMatrix::from_element(2, 3, grad));
        store.accumulate(&grads).unwrap();
        (store, w)
    }

    #[test]
    fn first_adam_step_moves_by_lr() {
        let (mut store, w) = store_with_grad(0.25);
        let mut adam = Adam::new(&store, 1e-3);

        adam.step(&mut store).unwrap();

        for &x in store.value(w).iter() {
            assert!((x - (1.0 - 1e-3)).abs() < 1e-6, "{x}");
        }
        assert_eq!(store.state(), GradState::Applied);
    }

    #[test]
    fn negative_gradient_moves_up() {
        let (mut store, w) = store_with_grad(-4.0);
        let mut adam = Adam::new(&store, 0.01);

        adam.step(&mut store).unwrap();
        assert!(store.value(w).iter().all(|&x| (x - 1.01).abs() < 1e-5));
    }

    #[test]
    fn step_without_gradients_fails() {
        let (mut store, w) = store_with_grad(1.0);
        let mut adam = Adam::new(&store, 0.01);
        adam.step(&mut store).unwrap();

        let before = store.value(w).clone();
        assert!(matches!(
            adam.step(&mut store),
            Err(Error::MissingGradients { .. })
        ));

        store.zero_grad();
        assert!(adam.step(&mut store).is_err());
        assert_eq!(store.value(w), &before);
    }

    #[test]
    fn optimizer_is_bound_to_its_store() {
        let (mut a, _) = store_with_grad(1.0);
        let (b, _) = store_with_grad(1.0);
        let mut adam = Adam::new(&b, 0.01);

        assert!(matches!(
            adam.step(&mut a),
            Err(Error::StoreMismatch { .. })
        ));
    }

    #[test]
    fn buffers_are_left_alone() {
        let mut store = ParamStore::new();
        let w = store.add("w", DMatrix::from_element(1, 2, 0.0));
        let buf = store.add_buffer("running_mean", DMatrix::from_element(1, 2, 5.0));
        let mut grads = Gradients::default();
        grads.add(store.key(w), DMatrix::from_element(1, 2, 1.0));
        store.accumulate(&grads).unwrap();

        Adam::new(&store, 0.5).step(&mut store).unwrap();

        assert!(store.value(w).iter().all(|&x| (x + 0.5).abs() < 1e-5));
        assert_eq!(store.value(buf), &DMatrix::from_element(1, 2, 5.0));
    }
}
