use rand::Rng;

use crate::{
    error::Result,
    graph::{Graph, Var, Window},
    layers::init_bound,
    params::{ParamId, ParamStore},
};

/// Square-kernel 2d convolution with a bias per output channel.
#[derive(Clone, Debug)]
pub struct Conv2d {
    weight: ParamId,
    bias: ParamId,
    out_channels: usize,
    window: Window,
}

impl Conv2d {
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        window: Window,
        rng: &mut impl Rng,
    ) -> Self {
        let fan_in = in_channels * window.kernel * window.kernel;
        let bound = init_bound(fan_in);
        let weight = store.add_uniform(format!("{name}.weight"), out_channels, fan_in, bound, rng);
        let bias = store.add_uniform(format!("{name}.bias"), 1, out_channels, bound, rng);

        Self {
            weight,
            bias,
            out_channels,
            window,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward<'g>(&self, g: &'g Graph, store: &ParamStore, x: Var<'g>) -> Result<Var<'g>> {
        g.conv2d(
            x,
            g.param(store, self.weight),
            g.param(store, self.bias),
            self.window,
        )
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::tensor::{Shape, Tensor};

    #[test]
    fn identity_kernel_copies_input() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2d::new(&mut store, "conv", 1, 1, Window::new(3, 1, 1), &mut rng);
        let mut kernel = DMatrix::zeros(1, 9);
        kernel[(0, 4)] = 1.0;
        *store.value_mut(conv.weight) = kernel;
        *store.value_mut(conv.bias) = DMatrix::zeros(1, 1);

        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let g = Graph::new();
        let x = g.constant(Tensor::from_samples(Shape::image(1, 4, 4), &[values.clone()]).unwrap());
        let y = conv.forward(&g, &store, x).unwrap().value();

        assert_eq!(y.shape(), Shape::image(1, 4, 4));
        assert_eq!(y.sample(0), values);
    }

    #[test]
    fn sums_over_channels_and_window() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2d::new(&mut store, "conv", 2, 1, Window::new(2, 2, 0), &mut rng);
        *store.value_mut(conv.weight) = DMatrix::from_element(1, 8, 1.0);
        *store.value_mut(conv.bias) = DMatrix::from_element(1, 1, 0.5);

        let g = Graph::new();
        let x = g.constant(Tensor::from_samples(Shape::image(2, 2, 2), &[vec![1.0; 8]]).unwrap());
        let y = conv.forward(&g, &store, x).unwrap().value();

        assert_eq!(y.shape(), Shape::image(1, 1, 1));
        assert_eq!(y.item(), 8.5);
    }
}
