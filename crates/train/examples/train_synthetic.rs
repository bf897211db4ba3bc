//! Example: train a tiny quantized network on synthetic Gaussian-ish blobs.
//!
//! Needs no data files. Run:
//!   cargo run -p bitdense-train --example train_synthetic -- --policy ternary

use candle_core::Device;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bitdense_common::{Dataset, NetworkConfig, WeightPolicy};
use bitdense_train::{Trainer, TrainerConfig};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "ternary", value_parser = ["none", "binary", "ternary"])]
    policy: String,
    #[arg(long, default_value = "60")]
    n_epochs: usize,
    #[arg(long, default_value = "1")]
    seed: u64,
}

/// Three well-separated 2-d clusters, one per class.
fn blobs(n_per_class: usize, spread: f32, rng: &mut StdRng) -> Dataset {
    let centers = [(-2.0f32, -2.0), (2.0, 2.0), (-2.0, 2.0)];
    let mut images = Vec::with_capacity(n_per_class * centers.len() * 2);
    let mut labels = Vec::with_capacity(n_per_class * centers.len());
    for (c, &(cx, cy)) in centers.iter().enumerate() {
        for _ in 0..n_per_class {
            images.push(cx + rng.gen_range(-spread..spread));
            images.push(cy + rng.gen_range(-spread..spread));
            labels.push(c as u8);
        }
    }
    Dataset {
        images,
        labels,
        n: n_per_class * centers.len(),
        rows: 1,
        cols: 2,
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let train = blobs(100, 0.6, &mut rng);
    let valid = blobs(30, 0.6, &mut rng);
    let test = blobs(30, 0.6, &mut rng);

    let policy = WeightPolicy::from_name(&args.policy)
        .ok_or_else(|| anyhow::anyhow!("unknown weight policy {:?}", args.policy))?;
    let net_config = NetworkConfig {
        n_inputs: 2,
        n_units: 16,
        n_classes: 3,
        n_hidden_layers: 1,
        policy,
        ..Default::default()
    };
    let trainer_config = TrainerConfig {
        seed: args.seed,
        batch_size: 10,
        n_epochs: args.n_epochs,
        monitor_step: 5,
        lr: 0.1,
        lr_fin: 0.02,
        momentum: 0.5,
        ..Default::default()
    };

    let mut trainer = Trainer::new(
        &net_config,
        trainer_config,
        train,
        valid,
        test,
        Device::Cpu,
    )?;
    trainer.build()?;
    let report = trainer.train()?;
    println!(
        "best epoch {}: valid_err {:.3} test_err {:.3}",
        report.best_epoch, report.best_valid_err, report.best_test_err
    );
    Ok(())
}
