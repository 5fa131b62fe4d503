use rand::Rng;

use crate::{
    error::Result,
    graph::{Graph, Var},
    layers::{Linear, Mode},
    models::{InputLayout, Model},
    params::ParamStore,
};

/// Two-layer fully connected digit classifier: `input → hidden → relu →
/// classes`.
pub struct Mlp {
    store: ParamStore,
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub const HIDDEN: usize = 50;

    pub fn new(input_size: usize, num_classes: usize, rng: &mut impl Rng) -> Self {
        Self::with_hidden(input_size, Self::HIDDEN, num_classes, rng)
    }

    pub fn with_hidden(
        input_size: usize,
        hidden: usize,
        num_classes: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let mut store = ParamStore::new();
        let fc1 = Linear::new(&mut store, "fc1", input_size, hidden, rng);
        let fc2 = Linear::new(&mut store, "fc2", hidden, num_classes, rng);

        Self { store, fc1, fc2 }
    }
}

impl Model for Mlp {
    fn name(&self) -> &str {
        "mlp"
    }

    fn params(&self) -> &ParamStore {
        &self.store
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn input_layout(&self) -> InputLayout {
        InputLayout::Flat
    }

    fn forward<'g>(&mut self, g: &'g Graph, x: Var<'g>, _mode: Mode) -> Result<Var<'g>> {
        let h = g.relu(self.fc1.forward(g, &self.store, x)?)?;
        self.fc2.forward(g, &self.store, h)
    }
}
