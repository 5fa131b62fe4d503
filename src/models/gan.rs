use rand::Rng;

use crate::{
    error::Result,
    graph::{Graph, Var},
    layers::{Linear, Mode},
    models::{InputLayout, Model},
    params::ParamStore,
};

const LEAKY_SLOPE: f32 = 0.1;

/// Maps a noise vector to a flattened image in `[-1, 1]`.
pub struct Generator {
    store: ParamStore,
    fc1: Linear,
    fc2: Linear,
}

impl Generator {
    pub const HIDDEN: usize = 256;

    pub fn new(z_dim: usize, img_dim: usize, rng: &mut impl Rng) -> Self {
        let mut store = ParamStore::new();
        let fc1 = Linear::new(&mut store, "gen.0", z_dim, Self::HIDDEN, rng);
        let fc2 = Linear::new(&mut store, "gen.2", Self::HIDDEN, img_dim, rng);

        Self { store, fc1, fc2 }
    }

    pub fn z_dim(&self) -> usize {
        self.fc1.in_features()
    }
}

impl Model for Generator {
    fn name(&self) -> &str {
        "generator"
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

    fn forward<'g>(&mut self, g: &'g Graph, z: Var<'g>, _mode: Mode) -> Result<Var<'g>> {
        let h = g.leaky_relu(self.fc1.forward(g, &self.store, z)?, LEAKY_SLOPE)?;
        g.tanh(self.fc2.forward(g, &self.store, h)?)
    }
}

/// Maps a flattened image to the probability that it is real.
pub struct Discriminator {
    store: ParamStore,
    fc1: Linear,
    fc2: Linear,
}

impl Discriminator {
    pub const HIDDEN: usize = 128;

    pub fn new(in_features: usize, rng: &mut impl Rng) -> Self {
        let mut store = ParamStore::new();
        let fc1 = Linear::new(&mut store, "disc.0", in_features, Self::HIDDEN, rng);
        let fc2 = Linear::new(&mut store, "disc.2", Self::HIDDEN, 1, rng);

        Self { store, fc1, fc2 }
    }
}

impl Model for Discriminator {
    fn name(&self) -> &str {
        "discriminator"
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
        let h = g.leaky_relu(self.fc1.forward(g, &self.store, x)?, LEAKY_SLOPE)?;
        g.sigmoid(self.fc2.forward(g, &self.store, h)?)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::tensor::{Shape, Tensor};

    #[test]
    fn generator_output_is_bounded_image() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut generator = Generator::new(64, 784, &mut rng);
        let g = Graph::no_grad();
        let z = g.constant(Tensor::randn(4, Shape::flat(64), &mut rng));

        let fake = generator.forward(&g, z, Mode::Train).unwrap().value();

        assert_eq!(fake.dims(), vec![4, 784]);
        assert!(fake.data().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn discriminator_outputs_probabilities() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut disc = Discriminator::new(784, &mut rng);
        let g = Graph::no_grad();
        let x = g.constant(Tensor::randn(3, Shape::flat(784), &mut rng));

        let p = disc.forward(&g, x, Mode::Train).unwrap().value();

        assert_eq!(p.dims(), vec![3, 1]);
        assert!(p.data().iter().all(|v| *v > 0.0 && *v < 1.0));
    }
}
