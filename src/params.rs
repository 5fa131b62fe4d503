use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;
use nalgebra::DMatrix;
use rand::Rng;

use crate::error::{Error, Result};

static NEXT_STORE_ID: AtomicUsize = AtomicUsize::new(0);

/// Index of a parameter inside its store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

/// Process-wide identity of a parameter: its store plus its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParamKey {
    pub store: usize,
    pub param: ParamId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: DMatrix<f32>,
    pub grad: DMatrix<f32>,
    /// Buffers (e.g. running statistics) are never touched by an optimizer.
    pub trainable: bool,
}

/// Where a store is in the clear → accumulate → step cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradState {
    Cleared,
    Accumulated,
    Applied,
}

/// Owns one model's parameters and buffers together with their gradients.
#[derive(Clone, Debug)]
pub struct ParamStore {
    id: usize,
    params: Vec<Parameter>,
    state: GradState,
}

impl PartialEq for ParamStore {
    /// Compares contents only, so a snapshot equals the store it came from.
    fn eq(&self, other: &Self) -> bool {
        self.params == other.params
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamStore {
    pub fn new() -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            params: Vec::new(),
            state: GradState::Cleared,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> GradState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn key(&self, id: ParamId) -> ParamKey {
        ParamKey {
            store: self.id,
            param: id,
        }
    }

    pub fn add(&mut self, name: impl Into<String>, value: DMatrix<f32>) -> ParamId {
        self.push(name.into(), value, true)
    }

    pub fn add_buffer(&mut self, name: impl Into<String>, value: DMatrix<f32>) -> ParamId {
        self.push(name.into(), value, false)
    }

    /// A trainable `rows x cols` parameter drawn from `U(-bound, bound)`.
    pub fn add_uniform(
        &mut self,
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        bound: f32,
        rng: &mut impl Rng,
    ) -> ParamId {
        let value = DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-bound..=bound));
        self.add(name, value)
    }

    fn push(&mut self, name: String, value: DMatrix<f32>, trainable: bool) -> ParamId {
        let (r, c) = value.shape();
        self.params.push(Parameter {
            name,
            value,
            grad: DMatrix::zeros(r, c),
            trainable,
        });

        ParamId(self.params.len() - 1)
    }

    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id.0]
    }

    pub fn value(&self, id: ParamId) -> &DMatrix<f32> {
        &self.params[id.0].value
    }

    pub fn value_mut(&mut self, id: ParamId) -> &mut DMatrix<f32> {
        &mut self.params[id.0].value
    }

    pub fn grad(&self, id: ParamId) -> &DMatrix<f32> {
        &self.params[id.0].grad
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    /// Number of trainable scalars.
    pub fn num_trainable(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.trainable)
            .map(|p| p.value.len())
            .sum()
    }

    pub fn zero_grad(&mut self) {
        for p in self.params.iter_mut() {
            p.grad.fill(0.0);
        }

        self.state = GradState::Cleared;
    }

    /// Adds every gradient in `grads` that belongs to this store.
    ///
    /// Gradients of other stores are ignored, so one backward pass through
    /// two models only ever feeds the store that asks for it.
    pub fn accumulate(&mut self, grads: &Gradients) -> Result<()> {
        if self.state == GradState::Applied {
            return Err(Error::StaleGradients { store: self.id });
        }

        let mut hits = 0;
        for (key, g) in grads.iter() {
            if key.store != self.id {
                continue;
            }

            let p = &mut self.params[key.param.0];
            if p.grad.shape() != g.shape() {
                return Err(Error::ShapeMismatch {
                    what: "gradient",
                    got: g.len(),
                    expected: p.grad.len(),
                });
            }

            p.grad += g;
            hits += 1;
        }

        trace!("store {}: accumulated {hits} gradients", self.id);
        self.state = GradState::Accumulated;
        Ok(())
    }

    /// Called by optimizers once their update is written.
    pub(crate) fn mark_applied(&mut self) {
        self.state = GradState::Applied;
    }
}

/// Parameter gradients produced by one backward pass.
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    grads: HashMap<ParamKey, DMatrix<f32>>,
}

impl Gradients {
    pub(crate) fn add(&mut self, key: ParamKey, grad: DMatrix<f32>) {
        match self.grads.get_mut(&key) {
            Some(g) => *g += grad,
            None => {
                self.grads.insert(key, grad);
            }
        }
    }

    pub fn get(&self, key: ParamKey) -> Option<&DMatrix<f32>> {
        self.grads.get(&key)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &DMatrix<f32>)> {
        self.grads.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grads_for(store: &ParamStore, id: ParamId, value: f32) -> Gradients {
        let mut grads = Gradients::default();
        let (r, c) = store.value(id).shape();
        grads.add(store.key(id), DMatrix::from_element(r, c, value));
        grads
    }

    #[test]
    fn stores_get_distinct_ids() {
        assert_ne!(ParamStore::new().id(), ParamStore::new().id());
    }

    #[test]
    fn accumulate_sums_and_ignores_foreign_keys() {
        let mut a = ParamStore::new();
        let mut b = ParamStore::new();
        let wa = a.add("w", DMatrix::zeros(2, 2));
        let wb = b.add("w", DMatrix::zeros(2, 2));

        let mut grads = grads_for(&a, wa, 1.0);
        grads.add(a.key(wa), DMatrix::from_element(2, 2, 0.5));
        grads.add(b.key(wb), DMatrix::from_element(2, 2, 9.0));

        a.accumulate(&grads).unwrap();

        assert_eq!(a.grad(wa), &DMatrix::from_element(2, 2, 1.5));
        assert_eq!(b.grad(wb), &DMatrix::zeros(2, 2));
        assert_eq!(a.state(), GradState::Accumulated);
    }

    #[test]
    fn applied_gradients_must_be_cleared_first() {
        let mut store = ParamStore::new();
        let w = store.add("w", DMatrix::zeros(1, 3));
        let grads = grads_for(&store, w, 1.0);

        store.accumulate(&grads).unwrap();
        store.mark_applied();

        assert!(matches!(
            store.accumulate(&grads),
            Err(Error::StaleGradients { .. })
        ));

        store.zero_grad();
        store.accumulate(&grads).unwrap();
        assert_eq!(store.grad(w), &DMatrix::from_element(1, 3, 1.0));
    }

    #[test]
    fn buffers_are_not_trainable() {
        let mut store = ParamStore::new();
        store.add("w", DMatrix::zeros(3, 4));
        store.add_buffer("running_mean", DMatrix::zeros(1, 4));

        assert_eq!(store.len(), 2);
        assert_eq!(store.num_trainable(), 12);
    }
}
