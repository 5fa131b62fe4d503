use rand::Rng;

use crate::{
    error::Result,
    graph::{Graph, Var},
    layers::init_bound,
    params::{ParamId, ParamStore},
};

/// Fully connected layer, `y = x · wᵀ + b`.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: ParamId,
    bias: ParamId,
    in_features: usize,
}

impl Linear {
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let bound = init_bound(in_features);
        let weight =
            store.add_uniform(format!("{name}.weight"), out_features, in_features, bound, rng);
        let bias = store.add_uniform(format!("{name}.bias"), 1, out_features, bound, rng);

        Self {
            weight,
            bias,
            in_features,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn forward<'g>(&self, g: &'g Graph, store: &ParamStore, x: Var<'g>) -> Result<Var<'g>> {
        g.linear(x, g.param(store, self.weight), g.param(store, self.bias))
    }
}
