use crate::{
    error::Result,
    graph::{Graph, Var, Window},
};

#[derive(Clone, Copy, Debug)]
pub struct MaxPool2d(pub Window);

impl MaxPool2d {
    pub const fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self(Window::new(kernel, stride, padding))
    }

    pub fn forward<'g>(&self, g: &'g Graph, x: Var<'g>) -> Result<Var<'g>> {
        g.max_pool2d(x, self.0)
    }
}

/// Average pooling over the whole feature map, whatever its size.
#[derive(Clone, Copy, Debug, Default)]
pub struct AvgPool2d;

impl AvgPool2d {
    pub const fn global() -> Self {
        Self
    }

    pub fn forward<'g>(&self, g: &'g Graph, x: Var<'g>) -> Result<Var<'g>> {
        g.global_avg_pool2d(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Shape, Tensor};

    #[test]
    fn global_average_collapses_plane() {
        let g = Graph::new();
        let values: Vec<f32> = (0..18).map(|v| v as f32).collect();
        let x = g.constant(Tensor::from_samples(Shape::image(2, 3, 3), &[values]).unwrap());
        let y = AvgPool2d::global().forward(&g, x).unwrap().value();

        assert_eq!(y.shape(), Shape::image(2, 1, 1));
        assert_eq!(y.sample(0), vec![4.0, 13.0]);
    }

    #[test]
    fn global_average_handles_wide_maps() {
        let g = Graph::new();
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let x = g.constant(Tensor::from_samples(Shape::image(2, 2, 4), &[values]).unwrap());
        let y = AvgPool2d::global().forward(&g, x).unwrap().value();

        assert_eq!(y.shape(), Shape::image(2, 1, 1));
        assert_eq!(y.sample(0), vec![3.5, 11.5]);
    }

    #[test]
    fn max_pool_halves_with_padding() {
        let g = Graph::new();
        let x = g.constant(Tensor::zeros(1, Shape::image(3, 7, 7)));
        let y = MaxPool2d::new(3, 2, 1).forward(&g, x).unwrap();

        assert_eq!(y.shape(), Shape::image(3, 4, 4));
    }
}
