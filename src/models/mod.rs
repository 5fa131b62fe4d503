pub mod gan;
pub mod inception;
pub mod mlp;

pub use gan::{Discriminator, Generator};
pub use inception::{ConvBlock, GoogLeNet, InceptionBlock, InceptionWidths, GOOGLENET_BLOCKS};
pub use mlp::Mlp;

use crate::{
    error::Result,
    graph::{Graph, Var},
    layers::Mode,
    params::ParamStore,
};

/// How a model wants its input batch laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputLayout {
    /// One flat vector per sample.
    Flat,
    /// `(channels, height, width)` per sample.
    Spatial,
}

/// A network that owns its parameters.
pub trait Model {
    fn name(&self) -> &str;

    fn params(&self) -> &ParamStore;

    fn params_mut(&mut self) -> &mut ParamStore;

    fn input_layout(&self) -> InputLayout {
        InputLayout::Spatial
    }

    fn forward<'g>(&mut self, g: &'g Graph, x: Var<'g>, mode: Mode) -> Result<Var<'g>>;
}
