use digitnets::{
    config::{Device, GanConfig},
    data::{synthetic_digits, DataLoader, Dataset, Split, Transform},
    graph::Graph,
    layers::Mode,
    models::{InceptionBlock, Mlp, Model, GOOGLENET_BLOCKS},
    optim::Adam,
    params::ParamStore,
    report::MemorySink,
    tensor::{Shape, Tensor},
    train::{check_accuracy, fit, GanTrainer, TrainingSession},
};
use rand::{rngs::StdRng, SeedableRng};

#[test]
fn classifier_end_to_end() {
    let train = synthetic_digits(100, Split::Train, 0, Transform::to_tensor()).unwrap();
    let test = synthetic_digits(50, Split::Test, 1, Transform::to_tensor()).unwrap();
    let mut loader = DataLoader::new(&train, 64, true, 0).unwrap();
    assert_eq!(loader.num_batches(), 2);

    let mut model = Mlp::new(784, 10, &mut StdRng::seed_from_u64(0));
    let mut opt = Adam::new(model.params(), 1e-3);
    let mut session = TrainingSession::new(Device::Auto, 1).unwrap();

    let summaries = fit(&mut model, &mut loader, &mut opt, &mut session, 1).unwrap();
    assert_eq!(summaries[0].batches, 2);

    let mut out = Vec::new();
    for data in [&train, &test] {
        let mut eval = DataLoader::new(data, 64, false, 0).unwrap();
        let acc = check_accuracy(&mut model, &mut eval, &mut out).unwrap();
        assert!((0.0..=100.0).contains(&acc.percent()));
        assert_eq!(acc.total, data.len());
    }

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "Checking accuracy on training data");
    assert!(lines[1].starts_with("Got ") && lines[1].contains(" / 100 with accuracy "));
    assert_eq!(lines[2], "Checking accuracy on test data");
    assert!(lines[3].contains(" / 50 with accuracy "));
}

#[test]
fn gan_step_is_reproducible() {
    let transform = Transform::to_tensor().normalize(&[0.5], &[0.5]).unwrap();
    let data = synthetic_digits(32, Split::Train, 5, transform).unwrap();
    let real = DataLoader::new(&data, 32, false, 0)
        .unwrap()
        .iter()
        .next()
        .unwrap()
        .unwrap()
        .inputs;

    let cfg = GanConfig {
        seed: 17,
        ..GanConfig::default()
    };
    let run = || {
        let mut trainer = GanTrainer::new(&cfg, MemorySink::default()).unwrap();
        trainer.train_step(&real).unwrap()
    };

    let (a, b) = (run(), run());
    assert_eq!(a.discriminator.to_bits(), b.discriminator.to_bits());
    assert_eq!(a.generator.to_bits(), b.generator.to_bits());
    assert_eq!(a.real.to_bits(), b.real.to_bits());
}

#[test]
fn inception_block_width_ignores_spatial_size() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut store = ParamStore::new();
    let widths = GOOGLENET_BLOCKS[0].1;
    let block = InceptionBlock::new(&mut store, "inception3a", widths, &mut rng);

    for side in [1, 4, 7] {
        let g = Graph::new();
        let x = g.constant(Tensor::randn(2, Shape::image(192, side, side), &mut rng));
        let y = block.forward(&g, &mut store, x, Mode::Train).unwrap();
        assert_eq!(y.shape(), Shape::image(256, side, side));
    }
}
