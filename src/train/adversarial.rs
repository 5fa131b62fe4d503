use std::io::Write;

use log::{debug, info};
use nalgebra::DMatrix;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::GanConfig,
    data::{DataLoader, Dataset},
    error::Result,
    graph::{Graph, Var},
    layers::Mode,
    models::{Discriminator, Generator, Model},
    optim::Adam,
    report::{make_grid, ImageSink},
    tensor::{Shape, Tensor},
    train::{optimize, TrainingSession},
};

const DIGIT: Shape = Shape::image(1, 28, 28);
const GRID_ROW: usize = 8;
const GRID_PADDING: usize = 2;

/// Losses of one adversarial step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepLosses {
    pub real: f32,
    pub fake: f32,
    pub discriminator: f32,
    pub generator: f32,
}

fn targets(batch: usize, value: f32) -> Tensor {
    Tensor::from_matrix(DMatrix::from_element(batch, 1, value))
}

/// Alternating discriminator/generator updates over mini-batches of real
/// digits, with periodic snapshots to an image sink.
pub struct GanTrainer<S: ImageSink> {
    generator: Generator,
    discriminator: Discriminator,
    opt_gen: Adam,
    opt_disc: Adam,
    fixed_noise: Tensor,
    rng: StdRng,
    sink: S,
}

impl<S: ImageSink> GanTrainer<S> {
    pub fn new(config: &GanConfig, sink: S) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let discriminator = Discriminator::new(config.img_dim, &mut rng);
        let generator = Generator::new(config.z_dim, config.img_dim, &mut rng);
        let fixed_noise = Tensor::randn(config.batch_size, Shape::flat(config.z_dim), &mut rng);
        let opt_disc = Adam::new(discriminator.params(), config.lr);
        let opt_gen = Adam::new(generator.params(), config.lr);

        Ok(Self {
            generator,
            discriminator,
            opt_gen,
            opt_disc,
            fixed_noise,
            rng,
            sink,
        })
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Fresh noise through the generator.
    pub fn generate<'g>(&mut self, g: &'g Graph, batch: usize) -> Result<Var<'g>> {
        let noise = Tensor::randn(batch, Shape::flat(self.generator.z_dim()), &mut self.rng);
        let z = g.constant(noise);
        self.generator.forward(g, z, Mode::Train)
    }

    /// Scores `real` as 1 and a detached copy of `fake` as 0, then steps
    /// the discriminator on the mean of both losses.
    ///
    /// `fake` itself stays attached for [`GanTrainer::update_generator`].
    pub fn update_discriminator<'g>(
        &mut self,
        g: &'g Graph,
        real: Var<'g>,
        fake: Var<'g>,
    ) -> Result<(f32, f32, f32)> {
        let n = real.batch_size();

        let disc_real = self.discriminator.forward(g, real, Mode::Train)?;
        let loss_real = g.binary_cross_entropy(disc_real, &targets(n, 1.0))?;

        let disc_fake = self.discriminator.forward(g, g.detach(fake)?, Mode::Train)?;
        let loss_fake = g.binary_cross_entropy(disc_fake, &targets(n, 0.0))?;

        let loss_d = g.scale(g.add(loss_real, loss_fake)?, 0.5)?;
        optimize(loss_d, self.discriminator.params_mut(), &mut self.opt_disc)?;

        Ok((loss_real.item(), loss_fake.item(), loss_d.item()))
    }

    /// Pushes the updated discriminator's verdict on `fake` towards 1 and
    /// steps the generator only.
    pub fn update_generator<'g>(&mut self, g: &'g Graph, fake: Var<'g>) -> Result<f32> {
        let output = self.discriminator.forward(g, fake, Mode::Train)?;
        let loss_g = g.binary_cross_entropy(output, &targets(fake.batch_size(), 1.0))?;
        optimize(loss_g, self.generator.params_mut(), &mut self.opt_gen)?;

        Ok(loss_g.item())
    }

    /// One full step on a batch of real digits scaled to `[-1, 1]`.
    pub fn train_step(&mut self, real: &Tensor) -> Result<StepLosses> {
        let g = Graph::new();
        let real = g.constant(real.clone().flatten());
        let fake = self.generate(&g, real.batch_size())?;

        let (loss_real, loss_fake, loss_d) = self.update_discriminator(&g, real, fake)?;
        let loss_g = self.update_generator(&g, fake)?;

        Ok(StepLosses {
            real: loss_real,
            fake: loss_fake,
            discriminator: loss_d,
            generator: loss_g,
        })
    }

    /// Renders the fixed noise and the given real batch to the sink.
    pub fn snapshot(&mut self, real: &Tensor, step: usize) -> Result<()> {
        let g = Graph::no_grad();
        let z = g.constant(self.fixed_noise.clone());
        let fake = self.generator.forward(&g, z, Mode::Eval)?.value().reshape(DIGIT)?;
        let real = real.clone().reshape(DIGIT)?;

        let fake_grid = make_grid(&fake, GRID_ROW, GRID_PADDING, true)?;
        let real_grid = make_grid(&real, GRID_ROW, GRID_PADDING, true)?;
        self.sink.add_image("MNIST Fake Images", &fake_grid, step)?;
        self.sink.add_image("MNIST Real Images", &real_grid, step)?;

        Ok(())
    }

    /// Trains for every epoch of `session`. Progress lines go to `out`.
    pub fn run<D: Dataset>(
        &mut self,
        loader: &mut DataLoader<'_, D>,
        session: &mut TrainingSession,
        out: &mut impl Write,
    ) -> Result<Vec<StepLosses>> {
        let mut last = Vec::with_capacity(session.epochs());

        for epoch in 0..session.epochs() {
            session.start_epoch(epoch);
            let mut latest = None;

            for batch in loader.iter() {
                let batch = batch?;
                let losses = self.train_step(&batch.inputs)?;
                debug!(
                    "epoch {epoch} batch {}: D {:.4} (real {:.4}, fake {:.4}), G {:.4}",
                    session.batch(),
                    losses.discriminator,
                    losses.real,
                    losses.fake,
                    losses.generator
                );

                if session.batch() == 0 {
                    writeln!(
                        out,
                        "Epoch [{epoch}/{}] Loss D: {}, Loss G: {:.4}",
                        session.epochs(),
                        space_signed(losses.discriminator),
                        losses.generator
                    )?;
                    self.snapshot(&batch.inputs, session.global_step())?;
                    session.advance_global_step();
                }

                session.finish_batch();
                latest = Some(losses);
            }

            if let Some(losses) = latest {
                info!(
                    "epoch {}/{} done: D {:.4}, G {:.4}",
                    epoch + 1,
                    session.epochs(),
                    losses.discriminator,
                    losses.generator
                );
                last.push(losses);
            }
        }

        Ok(last)
    }
}

/// Four decimals with a blank where a non-negative value's sign would be.
fn space_signed(v: f32) -> String {
    if v.is_sign_negative() {
        format!("{v:.4}")
    } else {
        format!(" {v:.4}")
    }
}
