//! Training and evaluation loops.

use crate::autograd::{no_grad, Var};
use crate::config::TrainConfig;
use crate::data_loader::DataLoader;
use crate::dataset::{Dataset, DatasetKind, Split};
use crate::helpers::confusion_matrix;
use crate::layer::Module;
use crate::loss_functions::LossFunction;
use crate::optim::Optimizer;
use crate::tensor::Tensor;
use crate::Result;

/// Running totals over the batches of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct EpochStats {
    /// Sum of per-sample losses.
    pub loss_sum: f64,
    pub correct: usize,
    pub seen: usize,
}

impl EpochStats {
    pub fn mean_loss(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.loss_sum / self.seen as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.correct as f64 / self.seen as f64
        }
    }

    pub fn merge(&mut self, other: &EpochStats) {
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.seen += other.seen;
    }

    /// Stats of one batch with mean loss `loss`.
    fn of_batch(loss: f32, predictions: &[usize], labels: &[usize]) -> EpochStats {
        EpochStats {
            loss_sum: loss as f64 * labels.len() as f64,
            correct: predictions.iter().zip(labels).filter(|(p, l)| p == l).count(),
            seen: labels.len(),
        }
    }
}

/// One pass over `loader`: forward, loss, zero_grad, backward and an
/// optimizer step per batch.
pub fn train_epoch(
    model: &dyn Module,
    loader: &mut DataLoader<'_>,
    loss_fn: &dyn LossFunction,
    optimizer: &mut dyn Optimizer,
) -> Result<EpochStats> {
    let params = model.parameters();
    let mut stats = EpochStats::default();
    for (i, batch) in loader.iter().enumerate() {
        let output = model.forward(&Var::new(batch.images))?;
        let loss = loss_fn.loss(&output, &batch.labels)?;
        optimizer.zero_grad(&params);
        loss.backward()?;
        optimizer.step(&params);

        let loss_value = loss.value().item()?;
        if !loss_value.is_finite() {
            tracing::warn!(batch = i, "non-finite training loss {loss_value}");
        }
        let predictions = output.value().argmax_dim(1)?;
        let batch_stats = EpochStats::of_batch(loss_value, &predictions, &batch.labels);
        tracing::debug!(batch = i, loss = loss_value, correct = batch_stats.correct, "train batch");
        stats.merge(&batch_stats);
    }
    Ok(stats)
}

/// Loss and accuracy over `loader` without recording gradients.
pub fn evaluate(model: &dyn Module, loader: &mut DataLoader<'_>, loss_fn: &dyn LossFunction) -> Result<EpochStats> {
    evaluate_with_predictions(model, loader, loss_fn).map(|(stats, _)| stats)
}

/// [`evaluate`] that also returns the predicted class of every sample, in
/// the order the loader yields them.
pub fn evaluate_with_predictions(
    model: &dyn Module,
    loader: &mut DataLoader<'_>,
    loss_fn: &dyn LossFunction,
) -> Result<(EpochStats, Vec<usize>)> {
    no_grad(|| -> Result<(EpochStats, Vec<usize>)> {
        let mut stats = EpochStats::default();
        let mut all = Vec::with_capacity(loader.num_samples());
        for batch in loader.iter() {
            let output = model.forward(&Var::new(batch.images))?;
            let loss = loss_fn.loss(&output, &batch.labels)?.value().item()?;
            let predictions = output.value().argmax_dim(1)?;
            stats.merge(&EpochStats::of_batch(loss, &predictions, &batch.labels));
            all.extend(predictions);
        }
        Ok((stats, all))
    })
}

/// Most likely class of each image in a `[N, C, H, W]` batch.
pub fn predict(model: &dyn Module, images: &Tensor) -> Result<Vec<usize>> {
    no_grad(|| -> Result<Vec<usize>> {
        let output = model.forward(&Var::new(images.clone()))?;
        let classes = output.value().argmax_dim(1)?;
        Ok(classes)
    })
}

/// Predictions for every sample of `dataset`, in order.
pub fn predict_dataset(model: &dyn Module, dataset: &Dataset, batch_size: usize) -> Result<Vec<usize>> {
    let mut loader = DataLoader::new(dataset, batch_size)?;
    let mut predictions = Vec::with_capacity(dataset.len());
    for batch in loader.iter() {
        predictions.extend(predict(model, &batch.images)?);
    }
    Ok(predictions)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochStats,
    pub dev: Option<EpochStats>,
}

/// Per-epoch statistics of a [`Trainer::fit`] call.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
}

impl History {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    pub fn train_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|r| r.train.mean_loss()).collect()
    }

    pub fn best_dev_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .filter_map(|r| r.dev.map(|d| d.accuracy()))
            .reduce(f64::max)
    }
}

/// Drives a model through several epochs of mini-batch training.
pub struct Trainer<'m> {
    model: &'m dyn Module,
    loss_fn: Box<dyn LossFunction>,
    optimizer: Box<dyn Optimizer>,
    batch_size: usize,
    seed: u64,
}

impl<'m> Trainer<'m> {
    pub fn new(
        model: &'m dyn Module,
        loss_fn: Box<dyn LossFunction>,
        optimizer: Box<dyn Optimizer>,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        Trainer {
            model,
            loss_fn,
            optimizer,
            batch_size,
            seed,
        }
    }

    pub fn loss_fn(&self) -> &dyn LossFunction {
        self.loss_fn.as_ref()
    }

    /// Trains for `epochs` passes over `train`, reshuffling every epoch,
    /// and evaluates on `dev` after each one.
    pub fn fit(&mut self, train: &Dataset, dev: Option<&Dataset>, epochs: usize) -> Result<History> {
        let mut train_loader = DataLoader::new(train, self.batch_size)?.with_shuffle(self.seed);
        let mut dev_loader = dev
            .filter(|d| !d.is_empty())
            .map(|d| DataLoader::new(d, self.batch_size))
            .transpose()?;
        let mut history = History::default();

        for epoch in 1..=epochs {
            let train_stats = train_epoch(
                self.model,
                &mut train_loader,
                self.loss_fn.as_ref(),
                self.optimizer.as_mut(),
            )?;
            let dev_stats = dev_loader
                .as_mut()
                .map(|loader| evaluate(self.model, loader, self.loss_fn.as_ref()))
                .transpose()?;

            tracing::info!(
                epoch,
                train_loss = train_stats.mean_loss(),
                train_acc = train_stats.accuracy(),
                dev_loss = dev_stats.map(|d| d.mean_loss()),
                dev_acc = dev_stats.map(|d| d.accuracy()),
                "epoch finished"
            );
            println!("{}", epoch_line(epoch, &train_stats, dev_stats.as_ref()));

            history.epochs.push(EpochRecord {
                epoch,
                train: train_stats,
                dev: dev_stats,
            });
        }
        Ok(history)
    }
}

fn epoch_line(epoch: usize, train: &EpochStats, dev: Option<&EpochStats>) -> String {
    let mut line = format!(
        "epoch {epoch}: train loss {:.4}, acc {:.2}%",
        train.mean_loss(),
        100.0 * train.accuracy()
    );
    if let Some(dev) = dev {
        line.push_str(&format!(
            "; dev loss {:.4}, acc {:.2}%",
            dev.mean_loss(),
            100.0 * dev.accuracy()
        ));
    }
    line
}

/// Outcome of [`run`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub config: TrainConfig,
    pub model: String,
    pub num_parameters: usize,
    pub train_size: usize,
    pub dev_size: usize,
    pub test_size: usize,
    pub history: History,
    pub test: EpochStats,
    /// `confusion[true][predicted]` on the test split.
    pub confusion: Vec<Vec<usize>>,
}

/// Loads the configured dataset and runs [`run_with_data`] on it.
pub fn run(config: &TrainConfig) -> Result<RunReport> {
    config.validate()?;
    let train = config
        .dataset
        .load(&config.data_dir, Split::Train, config.train_limit)?;
    let test = config
        .dataset
        .load(&config.data_dir, Split::Test, config.test_limit)?;
    run_with_data(config, train, test)
}

/// Per-channel mean and std for `train`: the configured dataset's
/// constants when the channel count fits, else the standard constants for
/// that many channels, else the statistics of `train` itself.
fn normalization_for(config: &TrainConfig, train: &Dataset) -> (Vec<f32>, Vec<f32>) {
    let channels = train.image_shape()[0];
    let kind = Some(config.dataset)
        .filter(|kind| kind.image_shape()[0] == channels)
        .or_else(|| DatasetKind::for_channels(channels));
    match kind {
        Some(kind) => {
            let (mean, std) = kind.normalization();
            (mean.to_vec(), std.to_vec())
        }
        None => {
            tracing::warn!(channels, "no standard normalization for this channel count, using the data's own");
            train.channel_stats()
        }
    }
}

/// The whole pipeline on already loaded data: normalize, hold out a dev
/// split, build the model, fit, test and optionally save a checkpoint.
pub fn run_with_data(config: &TrainConfig, mut train: Dataset, mut test: Dataset) -> Result<RunReport> {
    config.validate()?;
    if config.normalize {
        let (mean, std) = normalization_for(config, &train);
        train.normalize(&mean, &std)?;
        test.normalize(&mean, &std)?;
    }
    let (train, dev) = if config.dev_fraction > 0.0 {
        let (train, dev) = train.train_dev_split(config.dev_fraction, config.seed)?;
        (train, Some(dev))
    } else {
        (train, None)
    };
    tracing::info!(
        train = train.len(),
        dev = dev.as_ref().map_or(0, Dataset::len),
        test = test.len(),
        "dataset ready"
    );

    let mut spec = config.model_spec(train.num_classes());
    spec.image_shape = train.image_shape();
    let model = spec.build()?;
    tracing::info!(model = %config.model, parameters = model.num_parameters(), "model built");

    let mut trainer = Trainer::new(
        &model,
        config.loss.build(),
        config.build_optimizer(),
        config.batch_size,
        config.seed,
    );
    let history = trainer.fit(&train, dev.as_ref(), config.epochs)?;

    let (test_stats, predictions) = evaluate_with_predictions(
        &model,
        &mut DataLoader::new(&test, config.batch_size)?,
        trainer.loss_fn(),
    )?;
    let confusion = confusion_matrix(&predictions, test.labels(), test.num_classes());
    println!(
        "test: loss {:.4}, acc {:.2}%",
        test_stats.mean_loss(),
        100.0 * test_stats.accuracy()
    );

    if let Some(path) = &config.checkpoint {
        crate::checkpoint::save_parameters(&model, path)?;
    }

    Ok(RunReport {
        config: config.clone(),
        model: model.summary(),
        num_parameters: model.num_parameters(),
        train_size: train.len(),
        dev_size: dev.as_ref().map_or(0, Dataset::len),
        test_size: test.len(),
        history,
        test: test_stats,
        confusion,
    })
}
