//! CLI for training a weight-quantized classifier on IDX-format image data.

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;

use bitdense_common::{save_filter_grid, AugmentOptions, Dataset, NetworkConfig, WeightPolicy};
use bitdense_train::{Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "bitdense-train", about = "Train a classifier with binary or ternary weights")]
struct Args {
    /// Directory holding the four IDX files (train/t10k images and labels).
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Examples kept for training; the rest of the training file becomes the
    /// validation split.
    #[arg(long, default_value = "50000")]
    train_size: usize,
    #[arg(long, default_value = "1234")]
    seed: u64,
    #[arg(long, default_value = "200")]
    batch_size: usize,
    #[arg(long, default_value = "1000")]
    n_epochs: usize,
    #[arg(long, default_value = "2")]
    monitor_step: usize,
    #[arg(long, default_value = "0.3")]
    lr: f64,
    #[arg(long, default_value = "0.01")]
    lr_fin: f64,
    #[arg(long, default_value = "0.0")]
    momentum: f64,
    #[arg(long, default_value = "1024")]
    n_units: usize,
    #[arg(long, default_value = "3")]
    n_hidden_layers: usize,
    #[arg(long, default_value = "binary", value_parser = ["none", "binary", "ternary"])]
    policy: String,
    /// Round weights deterministically instead of stochastically.
    #[arg(long)]
    deterministic: bool,
    #[arg(long)]
    no_batch_norm: bool,
    #[arg(long, default_value = "1e-4")]
    bn_epsilon: f64,
    /// Keep probability for input units (1.0 disables dropout).
    #[arg(long, default_value = "1.0")]
    dropout_input: f64,
    /// Keep probability for hidden units.
    #[arg(long, default_value = "1.0")]
    dropout_hidden: f64,
    /// Evaluate through running statistics instead of fused scale/shift.
    #[arg(long)]
    no_fast_eval: bool,
    #[arg(long)]
    no_shuffle_examples: bool,
    #[arg(long)]
    shuffle_batches: bool,
    /// Zero-pad each image by this margin, then crop back at a random offset.
    #[arg(long, default_value = "0")]
    zero_pad: usize,
    /// Magnitude of the random perturbation on the warp's diagonal.
    #[arg(long, default_value = "0.0")]
    affine_a: f64,
    /// Magnitude of the random perturbation off the warp's diagonal.
    #[arg(long, default_value = "0.0")]
    affine_b: f64,
    /// Mirror each image left-right with probability one half.
    #[arg(long)]
    horizontal_flip: bool,
    /// Scale pixels into [-1, 1] instead of [0, 1].
    #[arg(long)]
    center_inputs: bool,
    /// Save the best model (weights + config JSON) into this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Load initial parameters from a safetensors file.
    #[arg(long)]
    load: Option<PathBuf>,
    /// After training, render first-layer weights as a PNG filter grid.
    #[arg(long)]
    filters: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let full = Dataset::from_idx_files(
        &args.data_dir.join("train-images-idx3-ubyte"),
        &args.data_dir.join("train-labels-idx1-ubyte"),
        args.center_inputs,
    )?;
    let test_set = Dataset::from_idx_files(
        &args.data_dir.join("t10k-images-idx3-ubyte"),
        &args.data_dir.join("t10k-labels-idx1-ubyte"),
        args.center_inputs,
    )?;
    if args.train_size == 0 || args.train_size >= full.n {
        anyhow::bail!(
            "train_size must lie in 1..{} to leave a validation split, got {}",
            full.n,
            args.train_size
        );
    }
    let train_set = full.slice(0, args.train_size)?;
    let valid_set = full.slice(args.train_size, full.n)?;
    eprintln!(
        "Loaded {} train / {} valid / {} test examples ({}x{})",
        train_set.n, valid_set.n, test_set.n, train_set.rows, train_set.cols
    );
    let (rows, cols) = (train_set.rows, train_set.cols);

    let policy = WeightPolicy::from_name(&args.policy)
        .ok_or_else(|| anyhow::anyhow!("unknown weight policy {:?}", args.policy))?;
    let net_config = NetworkConfig {
        n_inputs: train_set.n_features(),
        n_units: args.n_units,
        n_classes: 10,
        n_hidden_layers: args.n_hidden_layers,
        batch_norm: !args.no_batch_norm,
        bn_epsilon: args.bn_epsilon,
        dropout_input: args.dropout_input,
        dropout_hidden: args.dropout_hidden,
        policy,
        stochastic: !args.deterministic,
    };
    let trainer_config = TrainerConfig {
        seed: args.seed,
        batch_size: args.batch_size,
        n_epochs: args.n_epochs,
        monitor_step: args.monitor_step,
        lr: args.lr,
        lr_fin: args.lr_fin,
        momentum: args.momentum,
        bn_fast_eval: !args.no_fast_eval,
        shuffle_examples: !args.no_shuffle_examples,
        shuffle_batches: args.shuffle_batches,
        augment: AugmentOptions {
            zero_pad: args.zero_pad,
            affine_a: args.affine_a,
            affine_b: args.affine_b,
            horizontal_flip: args.horizontal_flip,
        },
        output_dir: args.output_dir,
        load_path: args.load,
    };

    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(
        &net_config,
        trainer_config,
        train_set,
        valid_set,
        test_set,
        device,
    )?;
    trainer.build()?;
    let report = trainer.train()?;
    eprintln!(
        "Best epoch {}: valid_err {:.4} test_err {:.4}",
        report.best_epoch, report.best_valid_err, report.best_test_err
    );

    if let Some(path) = &args.filters {
        save_filter_grid(trainer.model().first_layer_weight(), rows, cols, path)?;
        eprintln!("Saved filter grid to {}", path.display());
    }
    Ok(())
}
