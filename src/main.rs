//! # image-classifiers
//!
//! ## Usage
//! ```bash
//! # Walk through tensors and autograd
//! image-classifiers tour
//!
//! # Train a CNN on MNIST for two epochs
//! image-classifiers train --dataset mnist --data-dir ./data/mnist --model cnn --epochs 2
//!
//! # Same, starting from a TOML file
//! image-classifiers -c run.toml train --epochs 5
//!
//! # Summarise a dataset
//! image-classifiers inspect --dataset cifar10 --data-dir ./data/cifar-10
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use image_classifiers::activation_functions::ActivationType;
use image_classifiers::loss_functions::LossKind;
use image_classifiers::optim::OptimizerKind;
use image_classifiers::{DatasetKind, ExecutionMode, ModelKind, Split, TrainConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "image-classifiers",
    about = "Tensors, autograd and small image classifiers trained on MNIST and CIFAR-10",
    version
)]
struct Cli {
    /// TOML training configuration; flags given on the command line win.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct TrainArgs {
    #[arg(long)]
    dataset: Option<DatasetKind>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// linear, mlp or cnn.
    #[arg(short, long)]
    model: Option<ModelKind>,
    /// Comma-separated hidden layer widths.
    #[arg(long, value_delimiter = ',')]
    hidden: Option<Vec<usize>>,
    /// Comma-separated conv block channels.
    #[arg(long, value_delimiter = ',')]
    conv_channels: Option<Vec<usize>>,
    #[arg(long)]
    activation: Option<ActivationType>,
    #[arg(long)]
    loss: Option<LossKind>,
    #[arg(long)]
    optimizer: Option<OptimizerKind>,
    #[arg(long)]
    lr: Option<f32>,
    #[arg(long)]
    momentum: Option<f32>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(short, long)]
    batch_size: Option<usize>,
    #[arg(long)]
    dev_fraction: Option<f64>,
    /// Only read this many training images.
    #[arg(long)]
    train_limit: Option<usize>,
    #[arg(long)]
    test_limit: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// sequential or parallel kernels.
    #[arg(long)]
    execution: Option<ExecutionMode>,
    /// Save the trained parameters to this JSON file.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Write the run report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
}

impl TrainArgs {
    fn apply(&self, config: &mut TrainConfig) {
        macro_rules! set {
            ($($field:ident => $target:ident),* $(,)?) => {
                $(if let Some(v) = self.$field.clone() {
                    config.$target = v;
                })*
            };
        }
        set!(
            dataset => dataset,
            data_dir => data_dir,
            model => model,
            hidden => hidden,
            conv_channels => conv_channels,
            activation => activation,
            loss => loss,
            optimizer => optimizer,
            lr => learning_rate,
            momentum => momentum,
            epochs => epochs,
            batch_size => batch_size,
            dev_fraction => dev_fraction,
            seed => seed,
            execution => execution,
        );
        if self.train_limit.is_some() {
            config.train_limit = self.train_limit;
        }
        if self.test_limit.is_some() {
            config.test_limit = self.test_limit;
        }
        if self.checkpoint.is_some() {
            config.checkpoint = self.checkpoint.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train and test a classifier.
    Train(TrainArgs),

    /// Print the tensor and autograd walkthrough.
    Tour,

    /// Print size, class balance and pixel statistics of a dataset.
    Inspect {
        #[arg(long)]
        dataset: Option<DatasetKind>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the effective configuration as TOML.
    PrintConfig(TrainArgs),
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>, args: &TrainArgs) -> anyhow::Result<TrainConfig> {
    let mut config = match path {
        Some(path) => TrainConfig::from_file(path)?,
        None => TrainConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn inspect(kind: DatasetKind, dir: &std::path::Path, limit: Option<usize>) -> anyhow::Result<()> {
    for split in [Split::Train, Split::Test] {
        let ds = kind.load(dir, split, limit)?;
        let (mean, std) = ds.channel_stats();
        println!("{kind} {split:?}: {} images of shape {:?}", ds.len(), ds.image_shape());
        println!("  channel mean {mean:.4?}, std {std:.4?}");
        for (name, count) in ds.classes().iter().zip(ds.class_counts()) {
            println!("  {name:>12}: {count}");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Train(args) => {
            let config = load_config(cli.config.as_ref(), &args)?;
            let report = image_classifiers::train::run(&config)?;
            println!("{}", report.model);
            if let Some(path) = &args.report {
                std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
            }
            Ok(())
        }
        Commands::Tour => Ok(image_classifiers::tour::run()?),
        Commands::Inspect {
            dataset,
            data_dir,
            limit,
        } => {
            let base = match &cli.config {
                Some(path) => TrainConfig::from_file(path)?,
                None => TrainConfig::default(),
            };
            let kind = dataset.unwrap_or(base.dataset);
            let dir = data_dir.unwrap_or(base.data_dir);
            inspect(kind, &dir, limit)
        }
        Commands::PrintConfig(args) => {
            let config = load_config(cli.config.as_ref(), &args)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
