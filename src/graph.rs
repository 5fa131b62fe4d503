//! A tape of tensor operations with reverse-mode differentiation.
//!
//! Every operation appends a node holding its output value plus whatever it
//! needs to push gradients back to its inputs. [`Graph::backward`] walks the
//! tape in reverse and never mutates it, so one forward result can be
//! backpropagated from more than once: the GAN step relies on this when the
//! generator's output feeds both the discriminator and the generator update.

use std::{cell::RefCell, ptr};

use nalgebra::DMatrix;
use rand::Rng;
use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    params::{Gradients, ParamId, ParamKey, ParamStore},
    tensor::{Shape, Tensor},
};

/// `log(p)` never goes below this, matching the usual BCE implementation.
const LOG_FLOOR: f32 = -100.0;
const BCE_EPS: f32 = 1e-12;

/// Kernel size, stride and zero padding of a square sliding window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Window {
    pub const fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel,
            stride,
            padding,
        }
    }

    fn output_len(&self, len: usize) -> Result<usize> {
        if self.stride == 0 || self.kernel == 0 {
            return Err(Error::InvalidConfig(format!(
                "window needs a positive kernel and stride, got {self:?}"
            )));
        }

        let padded = len + 2 * self.padding;
        if padded < self.kernel {
            return Err(Error::ShapeMismatch {
                what: "window input",
                got: padded,
                expected: self.kernel,
            });
        }

        Ok((padded - self.kernel) / self.stride + 1)
    }

    pub fn output_shape(&self, input: Shape, channels: usize) -> Result<Shape> {
        Ok(Shape::image(
            channels,
            self.output_len(input.height)?,
            self.output_len(input.width)?,
        ))
    }

    /// Input coordinate under kernel offset `k` of output position `o`.
    fn source(&self, o: usize, k: usize, len: usize) -> Option<usize> {
        let pos = (o * self.stride + k) as isize - self.padding as isize;
        (pos >= 0 && (pos as usize) < len).then_some(pos as usize)
    }
}

/// Which statistics a normalization node uses.
pub enum NormStats<'a> {
    /// Statistics of the current batch (training).
    Batch,
    /// Stored running statistics, each `1 x channels` (evaluation).
    Running {
        mean: &'a DMatrix<f32>,
        var: &'a DMatrix<f32>,
    },
}

/// Per-channel mean and unbiased variance of one batch.
#[derive(Clone, Debug)]
pub struct Moments {
    pub mean: Vec<f32>,
    pub var: Vec<f32>,
}

type NodeId = usize;

enum Op {
    Constant,
    Param(ParamKey),
    Linear {
        x: NodeId,
        w: NodeId,
        b: NodeId,
    },
    Conv2d {
        x: NodeId,
        w: NodeId,
        b: NodeId,
        window: Window,
    },
    BatchNorm {
        x: NodeId,
        gamma: NodeId,
        beta: NodeId,
        normalized: DMatrix<f32>,
        inv_std: Vec<f32>,
        batch_stats: bool,
    },
    Relu(NodeId),
    LeakyRelu {
        x: NodeId,
        slope: f32,
    },
    Sigmoid(NodeId),
    Tanh(NodeId),
    MaxPool {
        x: NodeId,
        argmax: Vec<usize>,
    },
    AvgPool {
        x: NodeId,
        window: Window,
    },
    GlobalAvgPool(NodeId),
    Dropout {
        x: NodeId,
        mask: DMatrix<f32>,
    },
    Concat(Vec<NodeId>),
    Reshape(NodeId),
    Add(NodeId, NodeId),
    Scale {
        x: NodeId,
        factor: f32,
    },
    BinaryCrossEntropy {
        pred: NodeId,
        target: DMatrix<f32>,
    },
    CrossEntropy {
        logits: NodeId,
        probs: DMatrix<f32>,
        labels: Vec<usize>,
    },
}

struct Node {
    value: Tensor,
    op: Op,
}

/// The operation tape. Create one per training step.
pub struct Graph {
    nodes: RefCell<Vec<Node>>,
    tracking: bool,
}

/// A handle to one node of a [`Graph`].
#[derive(Clone, Copy)]
pub struct Var<'g> {
    graph: &'g Graph,
    id: NodeId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: RefCell::new(Vec::new()),
            tracking: true,
        }
    }

    /// A tape that only records values. Backward on it yields no gradients.
    pub fn no_grad() -> Self {
        Self {
            nodes: RefCell::new(Vec::new()),
            tracking: false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    fn push(&self, value: Tensor, op: Op) -> Var<'_> {
        let op = if self.tracking { op } else { Op::Constant };
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(Node { value, op });

        Var {
            graph: self,
            id: nodes.len() - 1,
        }
    }

    fn own(&self, v: Var<'_>) -> Result<NodeId> {
        if ptr::eq(self, v.graph) {
            Ok(v.id)
        } else {
            Err(Error::ForeignVariable)
        }
    }

    pub fn constant(&self, value: Tensor) -> Var<'_> {
        self.push(value, Op::Constant)
    }

    /// A leaf holding the current value of a stored parameter.
    pub fn param(&self, store: &ParamStore, id: ParamId) -> Var<'_> {
        let value = Tensor::from_matrix(store.value(id).clone());
        self.push(value, Op::Param(store.key(id)))
    }

    /// Same value as `x`, but gradients stop here.
    pub fn detach(&self, x: Var<'_>) -> Result<Var<'_>> {
        let x = self.own(x)?;
        let value = self.nodes.borrow()[x].value.clone();
        Ok(self.push(value, Op::Constant))
    }

    /// `x · wᵀ + b` with `w: out x in` and `b: 1 x out`.
    pub fn linear(&self, x: Var<'_>, w: Var<'_>, b: Var<'_>) -> Result<Var<'_>> {
        let (x, w, b) = (self.own(x)?, self.own(w)?, self.own(b)?);
        let value = {
            let nodes = self.nodes.borrow();
            let xv = nodes[x].value.data();
            let wv = nodes[w].value.data();
            let bv = nodes[b].value.data();

            if xv.ncols() != wv.ncols() {
                return Err(Error::ShapeMismatch {
                    what: "linear input",
                    got: xv.ncols(),
                    expected: wv.ncols(),
                });
            }
            if bv.ncols() != wv.nrows() {
                return Err(Error::ShapeMismatch {
                    what: "linear bias",
                    got: bv.ncols(),
                    expected: wv.nrows(),
                });
            }

            let mut y = xv * wv.transpose();
            add_row_bias(&mut y, bv);
            Tensor::from_matrix(y)
        };

        Ok(self.push(value, Op::Linear { x, w, b }))
    }

    /// 2d convolution. `w` is `out x (in · k · k)`, `b` is `1 x out`.
    pub fn conv2d(&self, x: Var<'_>, w: Var<'_>, b: Var<'_>, window: Window) -> Result<Var<'_>> {
        let (x, w, b) = (self.own(x)?, self.own(w)?, self.own(b)?);
        let value = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            let wv = nodes[w].value.data();
            let bv = nodes[b].value.data();

            let input = xv.shape();
            let patch = input.channels * window.kernel * window.kernel;
            if wv.ncols() != patch {
                return Err(Error::ShapeMismatch {
                    what: "conv2d weight",
                    got: wv.ncols(),
                    expected: patch,
                });
            }
            if bv.ncols() != wv.nrows() {
                return Err(Error::ShapeMismatch {
                    what: "conv2d bias",
                    got: bv.ncols(),
                    expected: wv.nrows(),
                });
            }

            let output = window.output_shape(input, wv.nrows())?;
            let plane = output.plane();
            let rows: Vec<Vec<f32>> = (0..xv.batch_size())
                .into_par_iter()
                .map(|i| {
                    let cols = im2col(&xv.sample(i), input, window, output);
                    let y = wv * cols;
                    let mut out = vec![0.0; output.numel()];
                    for o in 0..output.channels {
                        for p in 0..plane {
                            out[o * plane + p] = y[(o, p)] + bv[(0, o)];
                        }
                    }
                    out
                })
                .collect();

            Tensor::from_samples(output, &rows)?
        };

        Ok(self.push(value, Op::Conv2d { x, w, b, window }))
    }

    /// Per-channel normalization followed by `gamma · x̂ + beta`.
    ///
    /// With [`NormStats::Batch`] the batch moments are also returned so the
    /// caller can fold them into its running statistics.
    pub fn batch_norm<'g>(
        &'g self,
        x: Var<'g>,
        gamma: Var<'g>,
        beta: Var<'g>,
        stats: NormStats<'_>,
        eps: f32,
    ) -> Result<(Var<'g>, Option<Moments>)> {
        let (x, gamma, beta) = (self.own(x)?, self.own(gamma)?, self.own(beta)?);
        let (value, normalized, inv_std, moments) = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            let g = nodes[gamma].value.data();
            let bt = nodes[beta].value.data();
            let shape = xv.shape();
            let (n, plane, channels) = (xv.batch_size(), shape.plane(), shape.channels);

            if g.ncols() != channels || bt.ncols() != channels {
                return Err(Error::ShapeMismatch {
                    what: "batch norm affine",
                    got: g.ncols(),
                    expected: channels,
                });
            }

            let data = xv.data();
            let count = n * plane;
            let (mean, var, moments) = match stats {
                NormStats::Batch => {
                    if count < 2 {
                        return Err(Error::ShapeMismatch {
                            what: "batch norm values per channel",
                            got: count,
                            expected: 2,
                        });
                    }

                    let mut mean = vec![0.0; channels];
                    let mut var = vec![0.0; channels];
                    for c in 0..channels {
                        let cols = c * plane..(c + 1) * plane;
                        let sum: f32 = cols.clone().map(|j| data.column(j).sum()).sum();
                        let m = sum / count as f32;
                        let sq: f32 = cols
                            .map(|j| data.column(j).iter().map(|v| (v - m) * (v - m)).sum::<f32>())
                            .sum();
                        mean[c] = m;
                        var[c] = sq / count as f32;
                    }

                    let unbiased = var
                        .iter()
                        .map(|v| v * count as f32 / (count - 1) as f32)
                        .collect();
                    let moments = Moments {
                        mean: mean.clone(),
                        var: unbiased,
                    };
                    (mean, var, Some(moments))
                }
                NormStats::Running { mean, var } => {
                    if mean.ncols() != channels || var.ncols() != channels {
                        return Err(Error::ShapeMismatch {
                            what: "batch norm running stats",
                            got: mean.ncols(),
                            expected: channels,
                        });
                    }
                    (
                        mean.iter().copied().collect(),
                        var.iter().copied().collect(),
                        None,
                    )
                }
            };

            let inv_std: Vec<f32> = var.iter().map(|v| 1.0 / (v + eps).sqrt()).collect();
            let normalized = DMatrix::from_fn(n, shape.numel(), |i, j| {
                let c = j / plane;
                (data[(i, j)] - mean[c]) * inv_std[c]
            });
            let y = DMatrix::from_fn(n, shape.numel(), |i, j| {
                let c = j / plane;
                g[(0, c)] * normalized[(i, j)] + bt[(0, c)]
            });

            (Tensor::new(y, shape)?, normalized, inv_std, moments)
        };

        let batch_stats = moments.is_some();
        let out = self.push(
            value,
            Op::BatchNorm {
                x,
                gamma,
                beta,
                normalized,
                inv_std,
                batch_stats,
            },
        );

        Ok((out, moments))
    }

    pub fn relu<'g>(&'g self, x: Var<'g>) -> Result<Var<'g>> {
        self.unary(x, |v| v.max(0.0), Op::Relu)
    }

    pub fn leaky_relu<'g>(&'g self, x: Var<'g>, slope: f32) -> Result<Var<'g>> {
        self.unary(
            x,
            |v| if v > 0.0 { v } else { v * slope },
            |x| Op::LeakyRelu { x, slope },
        )
    }

    pub fn sigmoid<'g>(&'g self, x: Var<'g>) -> Result<Var<'g>> {
        self.unary(x, sigmoid, Op::Sigmoid)
    }

    pub fn tanh<'g>(&'g self, x: Var<'g>) -> Result<Var<'g>> {
        self.unary(x, f32::tanh, Op::Tanh)
    }

    fn unary<'g>(
        &'g self,
        x: Var<'g>,
        f: impl Fn(f32) -> f32,
        op: impl FnOnce(NodeId) -> Op,
    ) -> Result<Var<'g>> {
        let x = self.own(x)?;
        let value = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            Tensor::new(xv.data().map(f), xv.shape())?
        };

        Ok(self.push(value, op(x)))
    }

    /// Max pooling. Padded positions never win.
    pub fn max_pool2d<'g>(&'g self, x: Var<'g>, window: Window) -> Result<Var<'g>> {
        let x = self.own(x)?;
        if 2 * window.padding > window.kernel {
            return Err(Error::InvalidConfig(format!(
                "pool padding {} exceeds half the kernel {}",
                window.padding, window.kernel
            )));
        }

        let (value, argmax) = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            let input = xv.shape();
            let output = window.output_shape(input, input.channels)?;
            let data = xv.data();
            let n = xv.batch_size();

            let mut y = DMatrix::zeros(n, output.numel());
            let mut argmax = vec![0; n * output.numel()];
            for i in 0..n {
                for c in 0..input.channels {
                    for oy in 0..output.height {
                        for ox in 0..output.width {
                            let mut best = (usize::MAX, f32::NEG_INFINITY);
                            for ky in 0..window.kernel {
                                let Some(iy) = window.source(oy, ky, input.height) else {
                                    continue;
                                };
                                for kx in 0..window.kernel {
                                    let Some(ix) = window.source(ox, kx, input.width) else {
                                        continue;
                                    };
                                    let idx = c * input.plane() + iy * input.width + ix;
                                    if best.0 == usize::MAX || data[(i, idx)] > best.1 {
                                        best = (idx, data[(i, idx)]);
                                    }
                                }
                            }
                            let o = c * output.plane() + oy * output.width + ox;
                            y[(i, o)] = best.1;
                            argmax[i * output.numel() + o] = best.0;
                        }
                    }
                }
            }

            (Tensor::new(y, output)?, argmax)
        };

        Ok(self.push(value, Op::MaxPool { x, argmax }))
    }

    /// Average pooling; padded zeros count towards the divisor.
    pub fn avg_pool2d<'g>(&'g self, x: Var<'g>, window: Window) -> Result<Var<'g>> {
        let x = self.own(x)?;
        let value = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            let input = xv.shape();
            let output = window.output_shape(input, input.channels)?;
            let data = xv.data();
            let area = (window.kernel * window.kernel) as f32;

            let mut y = DMatrix::zeros(xv.batch_size(), output.numel());
            for i in 0..xv.batch_size() {
                for_each_window(input, output, window, |o, idx| y[(i, o)] += data[(i, idx)] / area);
            }

            Tensor::new(y, output)?
        };

        Ok(self.push(value, Op::AvgPool { x, window }))
    }

    /// Mean of every channel plane, giving a `(c, 1, 1)` output for any
    /// height and width.
    pub fn global_avg_pool2d<'g>(&'g self, x: Var<'g>) -> Result<Var<'g>> {
        let x = self.own(x)?;
        let value = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            let input = xv.shape();
            let plane = input.plane();
            let data = xv.data();

            let y = DMatrix::from_fn(xv.batch_size(), input.channels, |i, c| {
                (c * plane..(c + 1) * plane).map(|j| data[(i, j)]).sum::<f32>() / plane as f32
            });
            Tensor::new(y, Shape::image(input.channels, 1, 1))?
        };

        Ok(self.push(value, Op::GlobalAvgPool(x)))
    }

    /// Inverted dropout: zeroes each entry with probability `p` and scales
    /// survivors by `1 / (1 - p)`.
    pub fn dropout<'g>(&'g self, x: Var<'g>, p: f32, rng: &mut impl Rng) -> Result<Var<'g>> {
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::InvalidConfig(format!(
                "dropout probability {p} outside [0, 1]"
            )));
        }

        let x = self.own(x)?;
        let (value, mask) = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            let scale = if p < 1.0 { 1.0 / (1.0 - p) } else { 0.0 };
            let (r, c) = xv.data().shape();
            let mask = DMatrix::from_fn(r, c, |_, _| {
                if rng.gen::<f32>() < p {
                    0.0
                } else {
                    scale
                }
            });

            (Tensor::new(xv.data().component_mul(&mask), xv.shape())?, mask)
        };

        Ok(self.push(value, Op::Dropout { x, mask }))
    }

    /// Stacks inputs along the channel axis.
    pub fn concat_channels<'g>(&'g self, xs: &[Var<'g>]) -> Result<Var<'g>> {
        let ids = xs.iter().map(|&v| self.own(v)).collect::<Result<Vec<_>>>()?;
        let Some(&first) = ids.first() else {
            return Err(Error::InvalidConfig("nothing to concatenate".into()));
        };

        let value = {
            let nodes = self.nodes.borrow();
            let head = &nodes[first].value;
            let (n, plane) = (head.batch_size(), head.shape());
            let mut channels = 0;
            for &id in &ids {
                let v = &nodes[id].value;
                if v.batch_size() != n {
                    return Err(Error::ShapeMismatch {
                        what: "concat batch",
                        got: v.batch_size(),
                        expected: n,
                    });
                }
                if (v.shape().height, v.shape().width) != (plane.height, plane.width) {
                    return Err(Error::ShapeMismatch {
                        what: "concat spatial size",
                        got: v.shape().plane(),
                        expected: plane.plane(),
                    });
                }
                channels += v.shape().channels;
            }

            let shape = Shape::image(channels, plane.height, plane.width);
            let mut y = DMatrix::zeros(n, shape.numel());
            let mut offset = 0;
            for &id in &ids {
                let part = nodes[id].value.data();
                y.columns_mut(offset, part.ncols()).copy_from(part);
                offset += part.ncols();
            }

            Tensor::new(y, shape)?
        };

        Ok(self.push(value, Op::Concat(ids)))
    }

    pub fn reshape<'g>(&'g self, x: Var<'g>, shape: Shape) -> Result<Var<'g>> {
        let x = self.own(x)?;
        let value = self.nodes.borrow()[x].value.clone().reshape(shape)?;
        Ok(self.push(value, Op::Reshape(x)))
    }

    pub fn flatten<'g>(&'g self, x: Var<'g>) -> Result<Var<'g>> {
        let numel = x.shape().numel();
        self.reshape(x, Shape::flat(numel))
    }

    pub fn add<'g>(&'g self, a: Var<'g>, b: Var<'g>) -> Result<Var<'g>> {
        let (a, b) = (self.own(a)?, self.own(b)?);
        let value = {
            let nodes = self.nodes.borrow();
            let (av, bv) = (&nodes[a].value, &nodes[b].value);
            if av.data().shape() != bv.data().shape() {
                return Err(Error::ShapeMismatch {
                    what: "add",
                    got: bv.data().len(),
                    expected: av.data().len(),
                });
            }
            Tensor::new(av.data() + bv.data(), av.shape())?
        };

        Ok(self.push(value, Op::Add(a, b)))
    }

    pub fn scale<'g>(&'g self, x: Var<'g>, factor: f32) -> Result<Var<'g>> {
        let x = self.own(x)?;
        let value = {
            let nodes = self.nodes.borrow();
            let xv = &nodes[x].value;
            Tensor::new(xv.data() * factor, xv.shape())?
        };

        Ok(self.push(value, Op::Scale { x, factor }))
    }

    /// Mean binary cross-entropy between probabilities and targets.
    pub fn binary_cross_entropy<'g>(&'g self, pred: Var<'g>, target: &Tensor) -> Result<Var<'g>> {
        let pred = self.own(pred)?;
        let value = {
            let nodes = self.nodes.borrow();
            let p = nodes[pred].value.data();
            let t = target.data();
            if p.shape() != t.shape() {
                return Err(Error::ShapeMismatch {
                    what: "bce target",
                    got: t.len(),
                    expected: p.len(),
                });
            }

            let total: f32 = p
                .iter()
                .zip(t.iter())
                .map(|(&p, &t)| {
                    t * p.ln().max(LOG_FLOOR) + (1.0 - t) * (1.0 - p).ln().max(LOG_FLOOR)
                })
                .sum();
            Tensor::scalar(-total / p.len() as f32)
        };

        Ok(self.push(
            value,
            Op::BinaryCrossEntropy {
                pred,
                target: target.data().clone(),
            },
        ))
    }

    /// Mean softmax cross-entropy between raw scores and class indices.
    pub fn cross_entropy<'g>(&'g self, logits: Var<'g>, labels: &[usize]) -> Result<Var<'g>> {
        let logits = self.own(logits)?;
        let (value, probs) = {
            let nodes = self.nodes.borrow();
            let z = nodes[logits].value.data();
            let (n, classes) = z.shape();
            if labels.len() != n {
                return Err(Error::ShapeMismatch {
                    what: "labels",
                    got: labels.len(),
                    expected: n,
                });
            }
            if let Some(&label) = labels.iter().find(|&&l| l >= classes) {
                return Err(Error::LabelOutOfRange { label, classes });
            }

            let mut probs = DMatrix::zeros(n, classes);
            let mut total = 0.0;
            for (i, &label) in labels.iter().enumerate() {
                let row = z.row(i);
                let max = row.max();
                let sum: f32 = row.iter().map(|v| (v - max).exp()).sum();
                let log_sum = sum.ln() + max;
                for j in 0..classes {
                    probs[(i, j)] = (z[(i, j)] - log_sum).exp();
                }
                total += log_sum - z[(i, label)];
            }

            (Tensor::scalar(total / n as f32), probs)
        };

        Ok(self.push(
            value,
            Op::CrossEntropy {
                logits,
                probs,
                labels: labels.to_vec(),
            },
        ))
    }

    /// Gradients of the scalar `loss` with respect to every parameter leaf
    /// that reaches it. The tape is left untouched.
    pub fn backward(&self, loss: Var<'_>) -> Result<Gradients> {
        let loss = self.own(loss)?;
        let nodes = self.nodes.borrow();
        let (rows, cols) = nodes[loss].value.data().shape();
        if (rows, cols) != (1, 1) {
            return Err(Error::NotScalar { rows, cols });
        }

        let mut grads: Vec<Option<DMatrix<f32>>> = vec![None; loss + 1];
        grads[loss] = Some(DMatrix::from_element(1, 1, 1.0));
        let mut out = Gradients::default();

        for id in (0..=loss).rev() {
            let Some(dy) = grads[id].take() else {
                continue;
            };
            let node = &nodes[id];

            match &node.op {
                Op::Constant => {}
                Op::Param(key) => out.add(*key, dy),
                Op::Linear { x, w, b } => {
                    let (xv, wv) = (nodes[*x].value.data(), nodes[*w].value.data());
                    send(&mut grads, *x, &dy * wv);
                    send(&mut grads, *w, dy.tr_mul(xv));
                    send(&mut grads, *b, column_sums(&dy));
                }
                Op::Conv2d { x, w, b, window } => {
                    let (dx, dw, db) = conv2d_backward(
                        &nodes[*x].value,
                        nodes[*w].value.data(),
                        &dy,
                        *window,
                        node.value.shape(),
                    );
                    send(&mut grads, *x, dx);
                    send(&mut grads, *w, dw);
                    send(&mut grads, *b, db);
                }
                Op::BatchNorm {
                    x,
                    gamma,
                    beta,
                    normalized,
                    inv_std,
                    batch_stats,
                } => {
                    let g = nodes[*gamma].value.data();
                    let plane = node.value.shape().plane();
                    let channels = node.value.shape().channels;
                    let n = dy.nrows();
                    let count = (n * plane) as f32;

                    let mut dgamma = DMatrix::zeros(1, channels);
                    let mut dbeta = DMatrix::zeros(1, channels);
                    let mut dx = DMatrix::zeros(n, dy.ncols());
                    for c in 0..channels {
                        let cols = c * plane..(c + 1) * plane;
                        let (mut sum_dy, mut sum_dy_xhat) = (0.0, 0.0);
                        for j in cols.clone() {
                            for (d, xh) in dy.column(j).iter().zip(normalized.column(j).iter()) {
                                sum_dy += d;
                                sum_dy_xhat += d * xh;
                            }
                        }
                        dgamma[(0, c)] = sum_dy_xhat;
                        dbeta[(0, c)] = sum_dy;

                        let scale = g[(0, c)] * inv_std[c];
                        for j in cols {
                            for i in 0..n {
                                dx[(i, j)] = if *batch_stats {
                                    scale / count
                                        * (count * dy[(i, j)]
                                            - sum_dy
                                            - normalized[(i, j)] * sum_dy_xhat)
                                } else {
                                    scale * dy[(i, j)]
                                };
                            }
                        }
                    }

                    send(&mut grads, *x, dx);
                    send(&mut grads, *gamma, dgamma);
                    send(&mut grads, *beta, dbeta);
                }
                Op::Relu(x) => {
                    let dx = dy.zip_map(node.value.data(), |d, y| if y > 0.0 { d } else { 0.0 });
                    send(&mut grads, *x, dx);
                }
                Op::LeakyRelu { x, slope } => {
                    let dx = dy.zip_map(nodes[*x].value.data(), |d, v| {
                        if v > 0.0 {
                            d
                        } else {
                            d * slope
                        }
                    });
                    send(&mut grads, *x, dx);
                }
                Op::Sigmoid(x) => {
                    let dx = dy.zip_map(node.value.data(), |d, y| d * y * (1.0 - y));
                    send(&mut grads, *x, dx);
                }
                Op::Tanh(x) => {
                    let dx = dy.zip_map(node.value.data(), |d, y| d * (1.0 - y * y));
                    send(&mut grads, *x, dx);
                }
                Op::MaxPool { x, argmax } => {
                    let input = nodes[*x].value.data();
                    let per_sample = dy.ncols();
                    let mut dx = DMatrix::zeros(input.nrows(), input.ncols());
                    for i in 0..dy.nrows() {
                        for o in 0..per_sample {
                            dx[(i, argmax[i * per_sample + o])] += dy[(i, o)];
                        }
                    }
                    send(&mut grads, *x, dx);
                }
                Op::AvgPool { x, window } => {
                    let input = nodes[*x].value.shape();
                    let area = (window.kernel * window.kernel) as f32;
                    let mut dx = DMatrix::zeros(dy.nrows(), input.numel());
                    for i in 0..dy.nrows() {
                        for_each_window(input, node.value.shape(), *window, |o, idx| {
                            dx[(i, idx)] += dy[(i, o)] / area
                        });
                    }
                    send(&mut grads, *x, dx);
                }
                Op::GlobalAvgPool(x) => {
                    let plane = nodes[*x].value.shape().plane();
                    let dx = DMatrix::from_fn(dy.nrows(), dy.ncols() * plane, |i, j| {
                        dy[(i, j / plane)] / plane as f32
                    });
                    send(&mut grads, *x, dx);
                }
                Op::Dropout { x, mask } => send(&mut grads, *x, dy.component_mul(mask)),
                Op::Concat(ids) => {
                    let mut offset = 0;
                    for &id in ids {
                        let width = nodes[id].value.data().ncols();
                        send(&mut grads, id, dy.columns(offset, width).into_owned());
                        offset += width;
                    }
                }
                Op::Reshape(x) => send(&mut grads, *x, dy),
                Op::Add(a, b) => {
                    send(&mut grads, *a, dy.clone());
                    send(&mut grads, *b, dy);
                }
                Op::Scale { x, factor } => send(&mut grads, *x, dy * *factor),
                Op::BinaryCrossEntropy { pred, target } => {
                    let p = nodes[*pred].value.data();
                    let upstream = dy[(0, 0)] / p.len() as f32;
                    let dx = p.zip_map(target, |p, t| {
                        upstream * (p - t) / (p * (1.0 - p)).max(BCE_EPS)
                    });
                    send(&mut grads, *pred, dx);
                }
                Op::CrossEntropy {
                    logits,
                    probs,
                    labels,
                } => {
                    let upstream = dy[(0, 0)] / labels.len() as f32;
                    let mut dx = probs.clone();
                    for (i, &label) in labels.iter().enumerate() {
                        dx[(i, label)] -= 1.0;
                    }
                    send(&mut grads, *logits, dx * upstream);
                }
            }
        }

        Ok(out)
    }
}

impl<'g> Var<'g> {
    pub fn value(&self) -> Tensor {
        self.graph.nodes.borrow()[self.id].value.clone()
    }

    pub fn shape(&self) -> Shape {
        self.graph.nodes.borrow()[self.id].value.shape()
    }

    pub fn batch_size(&self) -> usize {
        self.graph.nodes.borrow()[self.id].value.batch_size()
    }

    pub fn item(&self) -> f32 {
        self.graph.nodes.borrow()[self.id].value.item()
    }

    pub fn backward(&self) -> Result<Gradients> {
        self.graph.backward(*self)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn send(grads: &mut [Option<DMatrix<f32>>], id: NodeId, g: DMatrix<f32>) {
    if let Some(acc) = grads[id].as_mut() {
        *acc += g;
    } else {
        grads[id] = Some(g);
    }
}

fn add_row_bias(y: &mut DMatrix<f32>, bias: &DMatrix<f32>) {
    for j in 0..y.ncols() {
        let b = bias[(0, j)];
        y.column_mut(j).add_scalar_mut(b);
    }
}

fn column_sums(m: &DMatrix<f32>) -> DMatrix<f32> {
    DMatrix::from_fn(1, m.ncols(), |_, j| m.column(j).sum())
}

/// Calls `f(output_index, input_index)` for every in-bounds tap of every
/// window of one sample.
fn for_each_window(input: Shape, output: Shape, window: Window, mut f: impl FnMut(usize, usize)) {
    for c in 0..output.channels {
        for oy in 0..output.height {
            for ox in 0..output.width {
                let o = c * output.plane() + oy * output.width + ox;
                for ky in 0..window.kernel {
                    let Some(iy) = window.source(oy, ky, input.height) else {
                        continue;
                    };
                    for kx in 0..window.kernel {
                        if let Some(ix) = window.source(ox, kx, input.width) {
                            f(o, c * input.plane() + iy * input.width + ix);
                        }
                    }
                }
            }
        }
    }
}

/// Unfolds one sample into a `(c · k · k) x (out_h · out_w)` patch matrix.
fn im2col(x: &[f32], input: Shape, window: Window, output: Shape) -> DMatrix<f32> {
    let k = window.kernel;
    DMatrix::from_fn(input.channels * k * k, output.plane(), |r, p| {
        let (c, ky, kx) = (r / (k * k), (r / k) % k, r % k);
        let (oy, ox) = (p / output.width, p % output.width);
        match (
            window.source(oy, ky, input.height),
            window.source(ox, kx, input.width),
        ) {
            (Some(iy), Some(ix)) => x[c * input.plane() + iy * input.width + ix],
            _ => 0.0,
        }
    })
}

/// Inverse of [`im2col`]: overlapping taps are summed.
fn col2im(cols: &DMatrix<f32>, input: Shape, window: Window, output: Shape) -> Vec<f32> {
    let k = window.kernel;
    let mut x = vec![0.0; input.numel()];
    for r in 0..cols.nrows() {
        let (c, ky, kx) = (r / (k * k), (r / k) % k, r % k);
        for p in 0..cols.ncols() {
            let (oy, ox) = (p / output.width, p % output.width);
            if let (Some(iy), Some(ix)) = (
                window.source(oy, ky, input.height),
                window.source(ox, kx, input.width),
            ) {
                x[c * input.plane() + iy * input.width + ix] += cols[(r, p)];
            }
        }
    }
    x
}

fn conv2d_backward(
    x: &Tensor,
    w: &DMatrix<f32>,
    dy: &DMatrix<f32>,
    window: Window,
    output: Shape,
) -> (DMatrix<f32>, DMatrix<f32>, DMatrix<f32>) {
    let input = x.shape();
    let plane = output.plane();
    let parts: Vec<(Vec<f32>, DMatrix<f32>, Vec<f32>)> = (0..x.batch_size())
        .into_par_iter()
        .map(|i| {
            let cols = im2col(&x.sample(i), input, window, output);
            let dyi = DMatrix::from_fn(output.channels, plane, |o, p| dy[(i, o * plane + p)]);
            let dw = &dyi * cols.transpose();
            let db = (0..output.channels).map(|o| dyi.row(o).sum()).collect();
            let dx = col2im(&w.tr_mul(&dyi), input, window, output);
            (dx, dw, db)
        })
        .collect();

    // Summed in sample order so results do not depend on thread scheduling.
    let mut dw = DMatrix::zeros(w.nrows(), w.ncols());
    let mut db = DMatrix::zeros(1, output.channels);
    let mut dx = DMatrix::zeros(x.batch_size(), input.numel());
    for (i, (dxi, dwi, dbi)) in parts.into_iter().enumerate() {
        dw += dwi;
        for (o, v) in dbi.into_iter().enumerate() {
            db[(0, o)] += v;
        }
        for (j, v) in dxi.into_iter().enumerate() {
            dx[(i, j)] = v;
        }
    }

    (dx, dw, db)
}
