//! GoogLeNet and its building blocks (Szegedy et al., "Going deeper with
//! convolutions").

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    error::{Error, Result},
    graph::{Graph, Var, Window},
    layers::{AvgPool2d, BatchNorm2d, Conv2d, Dropout, Linear, MaxPool2d, Mode},
    models::Model,
    params::ParamStore,
};

/// Convolution → batch norm → relu.
#[derive(Clone, Debug)]
pub struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl ConvBlock {
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        window: Window,
        rng: &mut impl Rng,
    ) -> Self {
        let conv_name = format!("{name}.conv");
        Self {
            conv: Conv2d::new(store, &conv_name, in_channels, out_channels, window, rng),
            bn: BatchNorm2d::new(store, &format!("{name}.batchnorm"), out_channels),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    pub fn forward<'g>(
        &self,
        g: &'g Graph,
        store: &mut ParamStore,
        x: Var<'g>,
        mode: Mode,
    ) -> Result<Var<'g>> {
        let y = self.conv.forward(g, store, x)?;
        let y = self.bn.forward(g, store, y, mode)?;
        g.relu(y)
    }
}

/// Channel widths of one inception block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InceptionWidths {
    pub in_channels: usize,
    pub out_1x1: usize,
    pub red_3x3: usize,
    pub out_3x3: usize,
    pub red_5x5: usize,
    pub out_5x5: usize,
    pub out_pool: usize,
}

impl InceptionWidths {
    pub const fn new(
        in_channels: usize,
        out_1x1: usize,
        red_3x3: usize,
        out_3x3: usize,
        red_5x5: usize,
        out_5x5: usize,
        out_pool: usize,
    ) -> Self {
        Self {
            in_channels,
            out_1x1,
            red_3x3,
            out_3x3,
            red_5x5,
            out_5x5,
            out_pool,
        }
    }

    pub const fn out_channels(&self) -> usize {
        self.out_1x1 + self.out_3x3 + self.out_5x5 + self.out_pool
    }
}

/// Four parallel branches whose outputs are stacked along channels.
#[derive(Clone, Debug)]
pub struct InceptionBlock {
    branch1: ConvBlock,
    branch2: [ConvBlock; 2],
    branch3: [ConvBlock; 2],
    branch4_pool: MaxPool2d,
    branch4: ConvBlock,
}

impl InceptionBlock {
    pub fn new(store: &mut ParamStore, name: &str, w: InceptionWidths, rng: &mut impl Rng) -> Self {
        let one = Window::new(1, 1, 0);
        let mut block = |branch: &str, from, to, window| {
            ConvBlock::new(store, &format!("{name}.{branch}"), from, to, window, rng)
        };

        Self {
            branch1: block("branch1", w.in_channels, w.out_1x1, one),
            branch2: [
                block("branch2.0", w.in_channels, w.red_3x3, one),
                block("branch2.1", w.red_3x3, w.out_3x3, Window::new(3, 1, 1)),
            ],
            branch3: [
                block("branch3.0", w.in_channels, w.red_5x5, one),
                block("branch3.1", w.red_5x5, w.out_5x5, Window::new(5, 1, 2)),
            ],
            branch4_pool: MaxPool2d::new(3, 1, 1),
            branch4: block("branch4.1", w.in_channels, w.out_pool, one),
        }
    }

    pub fn forward<'g>(
        &self,
        g: &'g Graph,
        store: &mut ParamStore,
        x: Var<'g>,
        mode: Mode,
    ) -> Result<Var<'g>> {
        let b1 = self.branch1.forward(g, store, x, mode)?;

        let b2 = self.branch2[0].forward(g, store, x, mode)?;
        let b2 = self.branch2[1].forward(g, store, b2, mode)?;

        let b3 = self.branch3[0].forward(g, store, x, mode)?;
        let b3 = self.branch3[1].forward(g, store, b3, mode)?;

        let b4 = self.branch4_pool.forward(g, x)?;
        let b4 = self.branch4.forward(g, store, b4, mode)?;

        g.concat_channels(&[b1, b2, b3, b4])
    }
}

/// Published block widths, in network order.
pub const GOOGLENET_BLOCKS: [(&str, InceptionWidths); 9] = [
    ("inception3a", InceptionWidths::new(192, 64, 96, 128, 16, 32, 32)),
    ("inception3b", InceptionWidths::new(256, 128, 128, 192, 32, 96, 64)),
    ("inception4a", InceptionWidths::new(480, 192, 96, 208, 16, 48, 64)),
    ("inception4b", InceptionWidths::new(512, 160, 112, 224, 24, 64, 64)),
    ("inception4c", InceptionWidths::new(512, 128, 128, 256, 24, 64, 64)),
    ("inception4d", InceptionWidths::new(512, 112, 144, 288, 32, 64, 64)),
    ("inception4e", InceptionWidths::new(528, 256, 160, 320, 32, 128, 128)),
    ("inception5a", InceptionWidths::new(832, 256, 160, 320, 32, 128, 128)),
    ("inception5b", InceptionWidths::new(832, 384, 192, 384, 48, 128, 128)),
];

/// Blocks after which the stage max-pool runs.
const POOL_AFTER: [&str; 2] = ["inception3b", "inception4e"];

const DROPOUT: f32 = 0.4;

pub struct GoogLeNet {
    store: ParamStore,
    rng: StdRng,
    conv1: ConvBlock,
    maxpool1: MaxPool2d,
    conv2: ConvBlock,
    maxpool2: MaxPool2d,
    blocks: Vec<(String, InceptionBlock)>,
    stage_pool: MaxPool2d,
    avgpool: AvgPool2d,
    dropout: Dropout,
    fc1: Linear,
}

impl GoogLeNet {
    pub fn new(in_channels: usize, num_classes: usize, rng: &mut impl Rng) -> Result<Self> {
        if in_channels == 0 || num_classes == 0 {
            return Err(Error::InvalidConfig(format!(
                "googlenet needs input channels and classes, got {in_channels} and {num_classes}"
            )));
        }

        let mut store = ParamStore::new();
        let conv1 = ConvBlock::new(&mut store, "conv1", in_channels, 64, Window::new(7, 2, 3), rng);
        let conv2 = ConvBlock::new(&mut store, "conv2", 64, 192, Window::new(3, 1, 1), rng);
        let blocks = GOOGLENET_BLOCKS
            .iter()
            .map(|&(name, w)| (name.to_string(), InceptionBlock::new(&mut store, name, w, rng)))
            .collect();
        let fc1 = Linear::new(&mut store, "fc1", 1024, num_classes, rng);

        Ok(Self {
            store,
            rng: StdRng::seed_from_u64(rng.gen()),
            conv1,
            maxpool1: MaxPool2d::new(3, 2, 1),
            conv2,
            maxpool2: MaxPool2d::new(3, 2, 1),
            blocks,
            stage_pool: MaxPool2d::new(3, 2, 1),
            avgpool: AvgPool2d::global(),
            dropout: Dropout::new(DROPOUT)?,
            fc1,
        })
    }
}

impl Model for GoogLeNet {
    fn name(&self) -> &str {
        "googlenet"
    }

    fn params(&self) -> &ParamStore {
        &self.store
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn forward<'g>(&mut self, g: &'g Graph, x: Var<'g>, mode: Mode) -> Result<Var<'g>> {
        let mut x = self.conv1.forward(g, &mut self.store, x, mode)?;
        x = self.maxpool1.forward(g, x)?;
        x = self.conv2.forward(g, &mut self.store, x, mode)?;
        x = self.maxpool2.forward(g, x)?;

        for (name, block) in &self.blocks {
            x = block.forward(g, &mut self.store, x, mode)?;
            if POOL_AFTER.contains(&name.as_str()) {
                x = self.stage_pool.forward(g, x)?;
            }
        }

        x = self.avgpool.forward(g, x)?;
        x = g.flatten(x)?;
        x = self.dropout.forward(g, x, mode, &mut self.rng)?;
        self.fc1.forward(g, &self.store, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Shape, Tensor};

    #[test]
    fn block_widths_chain() {
        for pair in GOOGLENET_BLOCKS.windows(2) {
            let (prev, next) = (pair[0].1, pair[1].1);
            assert_eq!(prev.out_channels(), next.in_channels, "{} -> {}", pair[0].0, pair[1].0);
        }
        assert_eq!(GOOGLENET_BLOCKS[8].1.out_channels(), 1024);
    }

    #[test]
    fn inception_3a_outputs_256_channels_at_any_size() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = ParamStore::new();
        let block = InceptionBlock::new(&mut store, "inception3a", GOOGLENET_BLOCKS[0].1, &mut rng);

        for side in [1, 3, 5] {
            let g = Graph::no_grad();
            let x = g.constant(Tensor::randn(2, Shape::image(192, side, side), &mut rng));
            let y = block.forward(&g, &mut store, x, Mode::Train).unwrap();

            assert_eq!(y.shape(), Shape::image(256, side, side));
        }
    }

    #[test]
    fn small_digits_reach_class_scores() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut net = GoogLeNet::new(1, 10, &mut rng).unwrap();
        let g = Graph::no_grad();
        let x = g.constant(Tensor::randn(2, Shape::image(1, 28, 28), &mut rng));

        let y = net.forward(&g, x, Mode::Eval).unwrap();

        assert_eq!(y.value().dims(), vec![2, 10]);
    }

    #[test]
    fn wide_inputs_reach_class_scores() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut net = GoogLeNet::new(1, 10, &mut rng).unwrap();
        let g = Graph::no_grad();
        let x = g.constant(Tensor::randn(1, Shape::image(1, 28, 40), &mut rng));

        let y = net.forward(&g, x, Mode::Eval).unwrap();

        assert_eq!(y.value().dims(), vec![1, 10]);
    }
}
