//! The epoch-driven training loop.
//!
//! One `Trainer` owns the model, the three dataset splits, the learning-rate
//! schedule and the run's generator. Each epoch optionally regenerates an
//! augmented copy of the training images, shuffles example and/or batch
//! order, then runs minibatch SGD with momentum; every `monitor_step` epochs
//! the three splits are evaluated in inference mode and the best epoch by
//! validation error is tracked (and checkpointed when configured).

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor, D};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use bitdense_common::{
    augment_images, batch_to_tensors, hinge_encode, AugmentOptions, Dataset, NetworkConfig,
};
use bitdense_core::Network;

use crate::scheduler::LrSchedule;

// ── Config ──────────────────────────────────────────────────────────────────

/// Training-run hyper-parameters. The architecture lives in
/// [`NetworkConfig`].
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Seed for the run's single generator: init, dropout, stochastic
    /// rounding, shuffles and augmentation all draw from it.
    pub seed: u64,
    pub batch_size: usize,
    pub n_epochs: usize,
    /// Evaluate the three splits every this many epochs (the final epoch is
    /// always evaluated).
    pub monitor_step: usize,
    pub lr: f64,
    pub lr_fin: f64,
    pub momentum: f64,
    /// Fold batch-norm running statistics into per-layer scale/shift pairs
    /// before each evaluation.
    pub bn_fast_eval: bool,
    pub shuffle_examples: bool,
    pub shuffle_batches: bool,
    pub augment: AugmentOptions,
    /// Save the best model (weights + config JSON) into this directory.
    pub output_dir: Option<PathBuf>,
    /// Load initial parameters from this safetensors file.
    pub load_path: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            seed: 1234,
            batch_size: 200,
            n_epochs: 1000,
            monitor_step: 2,
            lr: 0.3,
            lr_fin: 0.01,
            momentum: 0.0,
            bn_fast_eval: true,
            shuffle_examples: true,
            shuffle_batches: false,
            augment: AugmentOptions::default(),
            output_dir: None,
            load_path: None,
        }
    }
}

impl TrainerConfig {
    /// Reject impossible run settings before any work happens.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.n_epochs == 0 {
            anyhow::bail!("n_epochs must be positive");
        }
        if self.monitor_step == 0 {
            anyhow::bail!("monitor_step must be positive");
        }
        if self.lr <= 0.0 || self.lr_fin <= 0.0 {
            anyhow::bail!(
                "learning rates must be positive (lr={}, lr_fin={})",
                self.lr,
                self.lr_fin
            );
        }
        if !(0.0..1.0).contains(&self.momentum) {
            anyhow::bail!("momentum must lie in [0, 1), got {}", self.momentum);
        }
        if self.augment.affine_a < 0.0 || self.augment.affine_b < 0.0 {
            anyhow::bail!("augmentation magnitudes must be non-negative");
        }
        Ok(())
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Error rates measured at one monitoring point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorPoint {
    pub epoch: usize,
    pub train_err: f64,
    pub valid_err: f64,
    pub test_err: f64,
}

/// The best epoch seen so far, by validation error.
#[derive(Debug, Clone, Copy)]
pub struct TrainReport {
    pub best_epoch: usize,
    pub best_valid_err: f64,
    /// Test error measured at the best epoch, not the final one.
    pub best_test_err: f64,
}

#[derive(Clone, Copy)]
enum EvalSet {
    Train,
    Valid,
    Test,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, the splits, and all run state.
pub struct Trainer {
    model: Network,
    config: TrainerConfig,
    device: Device,
    rng: StdRng,

    train_set: Dataset,
    valid_set: Dataset,
    test_set: Dataset,

    // Derived by `build()`.
    n_batches: usize,
    train_targets: Vec<f32>,
    /// This epoch's augmented training images; `None` means the pristine
    /// copy is in use.
    epoch_images: Option<Vec<f32>>,

    schedule: LrSchedule,
    best: Option<TrainReport>,
    history: Vec<MonitorPoint>,
    built: bool,
}

impl Trainer {
    /// Construct a trainer over pre-split datasets. The model is built here
    /// (fail-fast config validation included); call [`build`](Self::build)
    /// before [`train`](Self::train).
    pub fn new(
        net_config: &NetworkConfig,
        config: TrainerConfig,
        train_set: Dataset,
        valid_set: Dataset,
        test_set: Dataset,
        device: Device,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let model = Network::new(net_config, &device, &mut rng)?;
        let schedule = LrSchedule::geometric(config.lr, config.lr_fin, config.n_epochs);
        Ok(Self {
            model,
            config,
            device,
            rng,
            train_set,
            valid_set,
            test_set,
            n_batches: 0,
            train_targets: Vec::new(),
            epoch_images: None,
            schedule,
            best: None,
            history: Vec::new(),
            built: false,
        })
    }

    /// Derive batching state: whole-batch count, hinge targets, dataset /
    /// architecture cross-checks, optional checkpoint load.
    pub fn build(&mut self) -> anyhow::Result<()> {
        let n_inputs = self.model.config().n_inputs;
        let n_classes = self.model.config().n_classes;
        let n = self.train_set.n;
        if self.config.batch_size > n {
            anyhow::bail!(
                "batch_size {} exceeds training-set size {}",
                self.config.batch_size,
                n
            );
        }
        // Only whole batches train; a ragged tail is dropped.
        self.n_batches = n / self.config.batch_size;
        self.train_targets = hinge_encode(&self.train_set.labels, n_classes)?;

        for (name, set) in [
            ("train", &self.train_set),
            ("valid", &self.valid_set),
            ("test", &self.test_set),
        ] {
            if set.n == 0 {
                anyhow::bail!("{name} split is empty");
            }
            if set.n_features() != n_inputs {
                anyhow::bail!(
                    "{name} split has {} features per example, model expects {}",
                    set.n_features(),
                    n_inputs
                );
            }
            if let Some(&label) = set.labels.iter().max() {
                if (label as usize) >= n_classes {
                    anyhow::bail!("{name} label {label} out of range for {n_classes} classes");
                }
            }
        }

        if let Some(path) = self.config.load_path.clone() {
            self.model.load(&path)?;
            tracing::info!(path = %path.display(), "Loaded initial parameters");
        }
        self.built = true;
        Ok(())
    }

    /// Run the full epoch schedule and return the best-epoch report.
    ///
    /// A non-finite minibatch loss aborts the run; a failed evaluation only
    /// skips that monitoring point.
    pub fn train(&mut self) -> anyhow::Result<TrainReport> {
        if !self.built {
            anyhow::bail!("Trainer::build must run before train");
        }
        let n_epochs = self.config.n_epochs;
        for epoch in 1..=n_epochs {
            let lr = self.schedule.current_lr();
            let loss = self.train_epoch(epoch)?;
            tracing::info!(epoch, lr, loss, "Epoch complete");
            if epoch % self.config.monitor_step == 0 || epoch == n_epochs {
                self.monitor(epoch);
            }
            self.schedule.advance();
        }
        self.best
            .ok_or_else(|| anyhow::anyhow!("no monitoring point was ever recorded"))
    }

    /// One pass over the training set in `n_batches` whole minibatches.
    /// Returns the mean minibatch loss.
    fn train_epoch(&mut self, epoch: usize) -> anyhow::Result<f64> {
        let n = self.train_set.n;
        let rows = self.train_set.rows;
        let cols = self.train_set.cols;
        if self.config.augment.is_active() {
            self.epoch_images = Some(augment_images(
                &self.train_set.images,
                n,
                rows,
                cols,
                &self.config.augment,
                &mut self.rng,
            ));
        }

        // Example order and batch order shuffle independently.
        let mut example_order: Vec<usize> = (0..n).collect();
        if self.config.shuffle_examples {
            example_order.shuffle(&mut self.rng);
        }
        let mut batch_order: Vec<usize> = (0..self.n_batches).collect();
        if self.config.shuffle_batches {
            batch_order.shuffle(&mut self.rng);
        }

        let n_inputs = self.model.config().n_inputs;
        let n_classes = self.model.config().n_classes;
        let bs = self.config.batch_size;
        let lr = self.schedule.current_lr();
        let momentum = self.config.momentum;
        let images: &[f32] = self.epoch_images.as_deref().unwrap_or(&self.train_set.images);

        let mut loss_sum = 0.0f64;
        for &b in &batch_order {
            // Gather the batch in shuffled example order.
            let mut xb = Vec::with_capacity(bs * n_inputs);
            let mut tb = Vec::with_capacity(bs * n_classes);
            for &ex in &example_order[b * bs..(b + 1) * bs] {
                xb.extend_from_slice(&images[ex * n_inputs..(ex + 1) * n_inputs]);
                tb.extend_from_slice(&self.train_targets[ex * n_classes..(ex + 1) * n_classes]);
            }
            let (x, targets) = batch_to_tensors(&xb, &tb, bs, n_inputs, n_classes, &self.device)?;

            let logits = self.model.forward_t(&x, true, &mut self.rng)?;
            let loss = squared_hinge(&logits, &targets)?;
            let loss_val = loss.to_scalar::<f32>()? as f64;
            if !loss_val.is_finite() {
                anyhow::bail!("loss diverged to {loss_val} at epoch {epoch}, batch {b}");
            }
            let grads = loss.backward()?;
            self.model.update(&grads, lr, momentum)?;
            loss_sum += loss_val;
        }
        Ok(loss_sum / self.n_batches as f64)
    }

    /// One inference-mode evaluation over the three splits:
    /// `(train_err, valid_err, test_err)`.
    pub fn evaluate(&mut self) -> anyhow::Result<(f64, f64, f64)> {
        if !self.built {
            anyhow::bail!("Trainer::build must run before evaluate");
        }
        if self.config.bn_fast_eval {
            self.model.prepare_fast_eval()?;
        }
        Ok((
            self.eval_error(EvalSet::Train)?,
            self.eval_error(EvalSet::Valid)?,
            self.eval_error(EvalSet::Test)?,
        ))
    }

    /// Monitoring history, one point per successfully evaluated epoch.
    pub fn history(&self) -> &[MonitorPoint] {
        &self.history
    }

    pub fn best(&self) -> Option<TrainReport> {
        self.best
    }

    pub fn model(&self) -> &Network {
        &self.model
    }

    fn monitor(&mut self, epoch: usize) {
        match self.try_monitor(epoch) {
            Ok(point) => self.record(point),
            Err(e) => {
                tracing::warn!(epoch, error = %e, "Evaluation failed; training continues");
            }
        }
    }

    fn try_monitor(&mut self, epoch: usize) -> anyhow::Result<MonitorPoint> {
        let (train_err, valid_err, test_err) = self.evaluate()?;
        Ok(MonitorPoint { epoch, train_err, valid_err, test_err })
    }

    fn record(&mut self, point: MonitorPoint) {
        let best = match self.best {
            // strict improvement replaces; ties keep the earlier epoch
            Some(b) if b.best_valid_err <= point.valid_err => b,
            _ => {
                let report = TrainReport {
                    best_epoch: point.epoch,
                    best_valid_err: point.valid_err,
                    best_test_err: point.test_err,
                };
                if let Some(dir) = &self.config.output_dir {
                    match save_model(&self.model, dir) {
                        Ok(()) => tracing::info!(dir = %dir.display(), "Saved best model"),
                        Err(e) => tracing::warn!(error = %e, "Checkpoint save failed"),
                    }
                }
                report
            }
        };
        self.best = Some(best);
        tracing::info!(
            epoch = point.epoch,
            train_err = point.train_err,
            valid_err = point.valid_err,
            test_err = point.test_err,
            best_epoch = best.best_epoch,
            best_valid_err = best.best_valid_err,
            "Monitor"
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(dist) = self.model.weight_distributions() {
                for (layer, (neg, zero, pos)) in dist {
                    tracing::debug!(%layer, neg, zero, pos, "Quantized weight distribution");
                }
            }
        }
        self.history.push(point);
    }

    /// Classification error rate over one split, evaluated in
    /// `batch_size`-sized chunks (the tail chunk may be smaller).
    fn eval_error(&mut self, set: EvalSet) -> anyhow::Result<f64> {
        let ds = match set {
            EvalSet::Train => &self.train_set,
            EvalSet::Valid => &self.valid_set,
            EvalSet::Test => &self.test_set,
        };
        let n_inputs = self.model.config().n_inputs;
        let bs = self.config.batch_size;
        let mut wrong = 0usize;
        let mut start = 0usize;
        while start < ds.n {
            let len = bs.min(ds.n - start);
            let x = Tensor::from_slice(
                &ds.images[start * n_inputs..(start + len) * n_inputs],
                (len, n_inputs),
                &self.device,
            )?;
            let logits = self.model.forward_t(&x, false, &mut self.rng)?;
            let preds = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
            for (pred, &label) in preds.iter().zip(&ds.labels[start..start + len]) {
                if *pred as usize != label as usize {
                    wrong += 1;
                }
            }
            start += len;
        }
        Ok(wrong as f64 / ds.n as f64)
    }
}

/// Write the model weights and its config into `dir`.
fn save_model(model: &Network, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    model.save(&dir.join("model.safetensors"))?;
    model.config().save(&dir.join("config.json"))?;
    Ok(())
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Mean squared hinge loss against ±1 targets: `mean(max(0, 1 − t·y)²)`.
pub fn squared_hinge(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let margin = (targets * logits)?.affine(-1.0, 1.0)?;
    margin.relu()?.sqr()?.mean_all()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bitdense_common::WeightPolicy;
    use rand::Rng;

    #[test]
    fn squared_hinge_hand_computed() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, -1.0]], &dev).unwrap();
        let targets = Tensor::new(&[[1.0f32, -1.0]], &dev).unwrap();
        let loss = squared_hinge(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(loss, 0.0);

        let logits = Tensor::new(&[[0.5f32, 0.5]], &dev).unwrap();
        let loss = squared_hinge(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        // margins: 1 - 0.5 = 0.5 and 1 + 0.5 = 1.5 → (0.25 + 2.25) / 2
        assert!((loss - 1.25).abs() < 1e-6, "{loss}");
    }

    #[test]
    fn config_validation_rejects_bad_runs() {
        let mut config = TrainerConfig::default();
        assert!(config.validate().is_ok());
        config.batch_size = 0;
        assert!(config.validate().is_err());
        config.batch_size = 200;
        config.monitor_step = 0;
        assert!(config.validate().is_err());
        config.monitor_step = 2;
        config.momentum = 1.0;
        assert!(config.validate().is_err());
        config.momentum = 0.9;
        config.lr_fin = 0.0;
        assert!(config.validate().is_err());
    }

    fn blobs(n_per_class: usize, centers: &[(f32, f32)], spread: f32, rng: &mut StdRng) -> Dataset {
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

    fn blob_splits(seed: u64) -> (Dataset, Dataset, Dataset) {
        let mut rng = StdRng::seed_from_u64(seed);
        let centers = [(-2.0f32, -2.0), (2.0, 2.0)];
        (
            blobs(30, &centers, 0.5, &mut rng),
            blobs(10, &centers, 0.5, &mut rng),
            blobs(10, &centers, 0.5, &mut rng),
        )
    }

    fn blob_net(policy: WeightPolicy, batch_norm: bool) -> NetworkConfig {
        NetworkConfig {
            n_inputs: 2,
            n_units: 16,
            n_classes: 2,
            n_hidden_layers: 1,
            batch_norm,
            policy,
            stochastic: false,
            ..Default::default()
        }
    }

    #[test]
    fn unquantized_net_learns_separable_blobs() {
        let (train, valid, test) = blob_splits(100);
        let config = TrainerConfig {
            seed: 7,
            batch_size: 10,
            n_epochs: 40,
            monitor_step: 5,
            lr: 0.1,
            lr_fin: 0.05,
            momentum: 0.5,
            ..Default::default()
        };
        let net = blob_net(WeightPolicy::None, true);
        let mut trainer =
            Trainer::new(&net, config, train, valid, test, Device::Cpu).unwrap();
        trainer.build().unwrap();
        let report = trainer.train().unwrap();
        assert!(report.best_valid_err <= 0.1, "valid err {}", report.best_valid_err);
        let last = trainer.history().last().copied().unwrap();
        assert!(last.train_err <= 0.1, "train err {}", last.train_err);
    }

    #[test]
    fn binary_deterministic_training_reduces_error() {
        let (train, valid, test) = blob_splits(200);
        let config = TrainerConfig {
            seed: 11,
            batch_size: 10,
            n_epochs: 25,
            monitor_step: 1,
            lr: 0.05,
            lr_fin: 0.01,
            momentum: 0.0,
            ..Default::default()
        };
        let net = blob_net(WeightPolicy::Binary, true);
        let mut trainer =
            Trainer::new(&net, config, train, valid, test, Device::Cpu).unwrap();
        trainer.build().unwrap();
        let report = trainer.train().unwrap();
        let history = trainer.history();
        let first = history.first().copied().unwrap();
        let best_train = history.iter().map(|p| p.train_err).fold(f64::INFINITY, f64::min);
        assert!(best_train <= first.train_err);
        assert!(report.best_valid_err < 0.4, "valid err {}", report.best_valid_err);
    }

    #[test]
    fn identical_seeds_replay_identical_runs() {
        let config = TrainerConfig {
            seed: 21,
            batch_size: 10,
            n_epochs: 8,
            monitor_step: 2,
            lr: 0.1,
            lr_fin: 0.05,
            momentum: 0.5,
            shuffle_batches: true,
            ..Default::default()
        };
        // stochastic rounding included: every draw must replay
        let net = NetworkConfig {
            stochastic: true,
            ..blob_net(WeightPolicy::Ternary, true)
        };
        let mut runs = Vec::new();
        for _ in 0..2 {
            let (train, valid, test) = blob_splits(300);
            let mut trainer =
                Trainer::new(&net, config.clone(), train, valid, test, Device::Cpu).unwrap();
            trainer.build().unwrap();
            trainer.train().unwrap();
            runs.push(trainer.history().to_vec());
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn diverging_loss_aborts_with_location() {
        let (train, valid, test) = blob_splits(400);
        let config = TrainerConfig {
            seed: 5,
            batch_size: 10,
            n_epochs: 5,
            monitor_step: 1,
            lr: 1e12,
            lr_fin: 1e12,
            momentum: 0.0,
            ..Default::default()
        };
        // no batch norm: nothing rescales the exploding pre-activations
        let net = blob_net(WeightPolicy::None, false);
        let mut trainer =
            Trainer::new(&net, config, train, valid, test, Device::Cpu).unwrap();
        trainer.build().unwrap();
        let err = trainer.train().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("diverged"), "{msg}");
        assert!(msg.contains("epoch"), "{msg}");
    }

    #[test]
    fn build_cross_checks_dataset_against_architecture() {
        let (train, valid, test) = blob_splits(500);
        let config = TrainerConfig {
            batch_size: 1000,
            ..TrainerConfig::default()
        };
        let net = blob_net(WeightPolicy::None, false);
        let mut trainer =
            Trainer::new(&net, config, train, valid, test, Device::Cpu).unwrap();
        let err = trainer.build().unwrap_err();
        assert!(err.to_string().contains("batch_size"), "{err}");

        // feature width mismatch
        let (train, valid, test) = blob_splits(500);
        let net = NetworkConfig { n_inputs: 3, ..blob_net(WeightPolicy::None, false) };
        let mut trainer = Trainer::new(
            &net,
            TrainerConfig { batch_size: 10, ..TrainerConfig::default() },
            train,
            valid,
            test,
            Device::Cpu,
        )
        .unwrap();
        let err = trainer.build().unwrap_err();
        assert!(err.to_string().contains("features"), "{err}");
    }

    #[test]
    fn checkpoint_restores_the_evaluated_model() {
        let dir = std::env::temp_dir().join(format!("bitdense-ckpt-{}", std::process::id()));
        let (train, valid, test) = blob_splits(600);
        let config = TrainerConfig {
            seed: 31,
            batch_size: 10,
            n_epochs: 10,
            monitor_step: 2,
            lr: 0.1,
            lr_fin: 0.05,
            momentum: 0.5,
            output_dir: Some(dir.clone()),
            ..Default::default()
        };
        let net = blob_net(WeightPolicy::Binary, true);
        let mut trainer =
            Trainer::new(&net, config, train, valid, test, Device::Cpu).unwrap();
        trainer.build().unwrap();
        trainer.train().unwrap();
        assert!(dir.join("model.safetensors").exists());
        assert!(dir.join("config.json").exists());

        // Two fresh trainers loading the same checkpoint evaluate identically.
        let mut evals = Vec::new();
        for seed in [41, 42] {
            let (train, valid, test) = blob_splits(600);
            let config = TrainerConfig {
                seed,
                batch_size: 10,
                load_path: Some(dir.join("model.safetensors")),
                ..TrainerConfig::default()
            };
            let mut t = Trainer::new(&net, config, train, valid, test, Device::Cpu).unwrap();
            t.build().unwrap();
            evals.push(t.evaluate().unwrap());
        }
        assert_eq!(evals[0], evals[1]);
        assert!(evals[0].1 < 0.5, "restored valid err {}", evals[0].1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
