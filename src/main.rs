use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use digitnets::{
    config::{ClassifierConfig, Device, GanConfig, InceptionConfig},
    data::{synthetic_digits, DataLoader, Mnist, Split, Transform},
    graph::Graph,
    layers::Mode,
    models::{GoogLeNet, Mlp, Model},
    optim::Adam,
    report::PngSink,
    tensor::{Shape, Tensor},
    train::{check_accuracy, fit, GanTrainer, TrainingSession},
};
use log::info;
use rand::{rngs::StdRng, SeedableRng};

/// Digit classifiers and a GAN on MNIST, trained on the CPU.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train the fully connected classifier and report accuracy
    Mlp(RunArgs),
    /// Train the GAN and write image grids
    Gan {
        #[command(flatten)]
        run: RunArgs,
        /// Where `<tag>/step_<n>.png` snapshots go
        #[arg(long, default_value = "runs/gan")]
        snapshot_dir: PathBuf,
    },
    /// Print GoogLeNet's output shape, optionally train it on digits
    Inception {
        #[command(flatten)]
        run: RunArgs,
        /// Batch size of the shape check
        #[arg(long, default_value_t = 3)]
        shape_batch: usize,
        /// Image side of the shape check
        #[arg(long, default_value_t = 224)]
        image_size: usize,
        /// Also train a one-channel, ten-class GoogLeNet on digits
        #[arg(long)]
        train: bool,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f32>,
    /// Folder holding the uncompressed MNIST idx files
    #[arg(long, default_value = "dataset")]
    data_dir: PathBuf,
    /// Use N generated digits per split instead of reading MNIST
    #[arg(long, value_name = "N")]
    synthetic: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = Device::Auto)]
    device: Device,
}

impl RunArgs {
    fn load(&self, split: Split, transform: Transform, seed: u64) -> anyhow::Result<Mnist> {
        let data = match self.synthetic {
            Some(n) => synthetic_digits(n, split, seed.wrapping_add(split as u64), transform)?,
            None => {
                info!("Loading MNIST {split} data from {}", self.data_dir.display());
                Mnist::load(&self.data_dir, split, transform)
                    .with_context(|| format!("could not load MNIST {split} data"))?
            }
        };

        Ok(data)
    }
}

fn run_mlp(args: RunArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let defaults = ClassifierConfig::default();
    let cfg = ClassifierConfig {
        lr: args.lr.unwrap_or(defaults.lr),
        batch_size: args.batch_size.unwrap_or(defaults.batch_size),
        epochs: args.epochs.unwrap_or(defaults.epochs),
        seed: args.seed.unwrap_or(defaults.seed),
        device: args.device,
        ..defaults
    };
    cfg.validate()?;
    let mut session = TrainingSession::new(cfg.device, cfg.epochs)?;

    let train = args.load(Split::Train, Transform::to_tensor(), cfg.seed)?;
    let test = args.load(Split::Test, Transform::to_tensor(), cfg.seed)?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut model = Mlp::with_hidden(cfg.input_size, cfg.hidden, cfg.num_classes, &mut rng);
    let mut opt = Adam::new(model.params(), cfg.lr);
    info!(
        "{} with {} trainable parameters",
        model.name(),
        model.params().num_trainable()
    );

    let mut loader = DataLoader::new(&train, cfg.batch_size, true, cfg.seed)?;
    fit(&mut model, &mut loader, &mut opt, &mut session, cfg.log_every)?;

    for data in [&train, &test] {
        let mut eval = DataLoader::new(data, cfg.batch_size, false, cfg.seed)?;
        check_accuracy(&mut model, &mut eval, out)?;
    }

    Ok(())
}

fn run_gan(args: RunArgs, snapshot_dir: PathBuf, out: &mut impl Write) -> anyhow::Result<()> {
    let defaults = GanConfig::default();
    let cfg = GanConfig {
        lr: args.lr.unwrap_or(defaults.lr),
        batch_size: args.batch_size.unwrap_or(defaults.batch_size),
        epochs: args.epochs.unwrap_or(defaults.epochs),
        seed: args.seed.unwrap_or(defaults.seed),
        device: args.device,
        ..defaults
    };
    let mut session = TrainingSession::new(cfg.device, cfg.epochs)?;

    let transform = Transform::to_tensor().normalize(&[0.5], &[0.5])?;
    let train = args.load(Split::Train, transform, cfg.seed)?;
    let mut loader = DataLoader::new(&train, cfg.batch_size, true, cfg.seed)?;

    info!("writing snapshots under {}", snapshot_dir.display());
    let mut trainer = GanTrainer::new(&cfg, PngSink::new(snapshot_dir))?;
    trainer.run(&mut loader, &mut session, out)?;

    Ok(())
}

fn run_inception(
    args: RunArgs,
    shape_batch: usize,
    image_size: usize,
    train: bool,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let defaults = InceptionConfig::default();
    let cfg = InceptionConfig {
        shape_batch,
        image_size,
        lr: args.lr.unwrap_or(defaults.lr),
        batch_size: args.batch_size.unwrap_or(defaults.batch_size),
        epochs: args.epochs.unwrap_or(defaults.epochs),
        seed: args.seed.unwrap_or(defaults.seed),
        device: args.device,
        ..defaults
    };
    cfg.validate()?;
    let mut session = TrainingSession::new(cfg.device, cfg.epochs)?;
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    let mut model = GoogLeNet::new(cfg.in_channels, cfg.num_classes, &mut rng)?;
    let shape = Shape::image(cfg.in_channels, cfg.image_size, cfg.image_size);
    let g = Graph::no_grad();
    let x = g.constant(Tensor::randn(cfg.shape_batch, shape, &mut rng));
    let scores = model.forward(&g, x, Mode::Eval)?;
    writeln!(out, "{:?}", scores.value().dims())?;

    if !train {
        return Ok(());
    }

    let train_data = args.load(Split::Train, Transform::to_tensor(), cfg.seed)?;
    let test_data = args.load(Split::Test, Transform::to_tensor(), cfg.seed)?;
    let mut model = GoogLeNet::new(1, Mnist::CLASSES, &mut rng)?;
    let mut opt = Adam::new(model.params(), cfg.lr);

    let mut loader = DataLoader::new(&train_data, cfg.batch_size, true, cfg.seed)?;
    fit(&mut model, &mut loader, &mut opt, &mut session, 10)?;

    for data in [&train_data, &test_data] {
        let mut eval = DataLoader::new(data, cfg.batch_size, false, cfg.seed)?;
        check_accuracy(&mut model, &mut eval, out)?;
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut out = io::stdout().lock();

    match cli.command {
        Command::Mlp(run) => run_mlp(run, &mut out),
        Command::Gan { run, snapshot_dir } => run_gan(run, snapshot_dir, &mut out),
        Command::Inception {
            run,
            shape_batch,
            image_size,
            train,
        } => run_inception(run, shape_batch, image_size, train, &mut out),
    }
}
