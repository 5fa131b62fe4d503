use std::io::Write;

use log::{debug, info};

use crate::{
    data::{DataLoader, Dataset},
    error::{Error, Result},
    graph::Graph,
    layers::Mode,
    models::Model,
    optim::Optimizer,
    train::{input, optimize, TrainingSession},
};

/// Mean loss over one pass of the training loader.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub mean_loss: f32,
}

/// Correct predictions out of the samples seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    pub fn percent(&self) -> f64 {
        self.correct as f64 / self.total as f64 * 100.0
    }
}

/// One pass over `loader`: forward, cross-entropy, clear, backward, step.
pub fn train_epoch<M, D, O>(
    model: &mut M,
    loader: &mut DataLoader<'_, D>,
    opt: &mut O,
    session: &mut TrainingSession,
    log_every: usize,
) -> Result<EpochSummary>
where
    M: Model,
    D: Dataset,
    O: Optimizer,
{
    let layout = model.input_layout();
    let mut total_loss = 0.0;
    let mut batches = 0;

    for batch in loader.iter() {
        let batch = batch?;
        let labels = batch.labels.as_deref().ok_or(Error::MissingLabels)?;

        let g = Graph::new();
        let x = input(&g, &batch.inputs, layout);
        let scores = model.forward(&g, x, Mode::Train)?;
        let loss = g.cross_entropy(scores, labels)?;
        optimize(loss, model.params_mut(), opt)?;

        total_loss += loss.item();
        batches += 1;
        session.finish_batch();
        if log_every > 0 && batches % log_every == 0 {
            debug!(
                "{} epoch {} batch {batches}/{}: mean loss {:.4}",
                model.name(),
                session.epoch(),
                loader.num_batches(),
                total_loss / batches as f32
            );
        }
    }

    let summary = EpochSummary {
        epoch: session.epoch(),
        batches,
        mean_loss: total_loss / batches.max(1) as f32,
    };
    info!(
        "{} epoch {}/{}: mean loss {:.4} over {} batches",
        model.name(),
        summary.epoch + 1,
        session.epochs(),
        summary.mean_loss,
        summary.batches
    );

    Ok(summary)
}

/// Runs every epoch of `session`, each with a fresh shuffled order.
pub fn fit<M, D, O>(
    model: &mut M,
    loader: &mut DataLoader<'_, D>,
    opt: &mut O,
    session: &mut TrainingSession,
    log_every: usize,
) -> Result<Vec<EpochSummary>>
where
    M: Model,
    D: Dataset,
    O: Optimizer,
{
    (0..session.epochs())
        .map(|epoch| {
            session.start_epoch(epoch);
            train_epoch(model, loader, opt, session, log_every)
        })
        .collect()
}

/// Counts arg-max hits over `loader` in evaluation mode and prints the
/// result to `out`.
pub fn check_accuracy<M, D>(
    model: &mut M,
    loader: &mut DataLoader<'_, D>,
    out: &mut impl Write,
) -> Result<Accuracy>
where
    M: Model,
    D: Dataset,
{
    writeln!(out, "Checking accuracy on {} data", loader.dataset().split())?;

    let layout = model.input_layout();
    let mut acc = Accuracy {
        correct: 0,
        total: 0,
    };

    for batch in loader.iter() {
        let batch = batch?;
        let labels = batch.labels.as_deref().ok_or(Error::MissingLabels)?;

        let g = Graph::no_grad();
        let x = input(&g, &batch.inputs, layout);
        let predictions = model.forward(&g, x, Mode::Eval)?.value().argmax_rows();

        acc.correct += predictions
            .iter()
            .zip(labels)
            .filter(|(p, l)| p == l)
            .count();
        acc.total += labels.len();
    }

    if acc.total == 0 {
        return Err(Error::InvalidConfig(
            "accuracy needs at least one sample".into(),
        ));
    }

    writeln!(
        out,
        "Got {} / {} with accuracy {:.2}",
        acc.correct,
        acc.total,
        acc.percent()
    )?;

    Ok(acc)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        config::Device,
        data::{synthetic_digits, Split, Transform},
        models::Mlp,
        optim::Adam,
        tensor::Tensor,
    };

    #[test]
    fn loss_falls_on_synthetic_digits() {
        let data = synthetic_digits(256, Split::Train, 4, Transform::default()).unwrap();
        let mut loader = DataLoader::new(&data, 32, true, 4).unwrap();
        let mut model = Mlp::new(784, 10, &mut StdRng::seed_from_u64(4));
        let mut opt = Adam::new(model.params(), 1e-3);
        let mut session = TrainingSession::new(Device::Cpu, 5).unwrap();

        let summaries = fit(&mut model, &mut loader, &mut opt, &mut session, 0).unwrap();

        assert_eq!(summaries.len(), 5);
        assert!(summaries.iter().all(|s| s.batches == 8));
        assert!(summaries[4].mean_loss < summaries[0].mean_loss, "{summaries:?}");
    }

    #[test]
    fn accuracy_report_format() {
        let data = synthetic_digits(10, Split::Test, 1, Transform::default()).unwrap();
        let mut loader = DataLoader::new(&data, 4, false, 0).unwrap();
        let mut model = Mlp::new(784, 10, &mut StdRng::seed_from_u64(1));
        let mut out = Vec::new();

        let acc = check_accuracy(&mut model, &mut loader, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(acc.total, 10);
        assert!(text.starts_with("Checking accuracy on test data\n"), "{text}");
        assert!(text.contains(&format!(
            "Got {} / 10 with accuracy {:.2}",
            acc.correct,
            acc.percent()
        )));
    }

    #[test]
    fn accuracy_matches_per_sample_argmax() {
        let train = synthetic_digits(128, Split::Train, 9, Transform::default()).unwrap();
        let test = synthetic_digits(37, Split::Test, 9, Transform::default()).unwrap();
        let mut model = Mlp::new(784, 10, &mut StdRng::seed_from_u64(9));
        let mut opt = Adam::new(model.params(), 1e-3);
        let mut session = TrainingSession::new(Device::Cpu, 2).unwrap();
        let mut train_loader = DataLoader::new(&train, 16, true, 9).unwrap();
        fit(&mut model, &mut train_loader, &mut opt, &mut session, 0).unwrap();

        let mut loader = DataLoader::new(&test, 8, false, 0).unwrap();
        let acc = check_accuracy(&mut model, &mut loader, &mut std::io::sink()).unwrap();

        let mut hits = 0;
        for idx in 0..test.len() {
            let sample = test.get(idx).unwrap();
            let x = Tensor::from_samples(test.sample_shape(), &[&sample.input])
                .unwrap()
                .flatten();
            let g = Graph::no_grad();
            let scores = model.forward(&g, g.constant(x), Mode::Eval).unwrap();
            let row = scores.value().sample(0);
            let best = (0..row.len())
                .max_by(|&a, &b| row[a].total_cmp(&row[b]))
                .unwrap();
            if Some(best) == sample.label {
                hits += 1;
            }
        }

        assert_eq!(acc.total, 37);
        assert_eq!(acc.correct, hits);
        assert!((acc.percent() - hits as f64 / 37.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn percent_is_ratio_times_hundred() {
        let acc = Accuracy {
            correct: 36,
            total: 64,
        };
        assert!((acc.percent() - 56.25).abs() < 1e-12);
    }
}
