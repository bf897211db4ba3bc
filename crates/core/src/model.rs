//! The stacked classifier: ordered dense layers plus persistence.
//!
//! `n_hidden_layers` ReLU layers feed one linear output layer; every layer
//! shares the network-wide quantization policy and batch-norm setting.
//! Parameters are registered in a `VarMap` under `layer{i}.{name}` so
//! checkpoints are plain safetensors files.

use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{Device, Result, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;

use bitdense_common::NetworkConfig;

use crate::layer::{Activation, DenseLayer};

/// A feed-forward classifier over flat feature vectors.
pub struct Network {
    layers: Vec<DenseLayer>,
    varmap: VarMap,
    config: NetworkConfig,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("n_layers", &self.layers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Network {
    /// Build the stack described by `config`, drawing every initial weight
    /// from `rng`. Fails fast on an invalid config, before any tensor is
    /// allocated.
    pub fn new(config: &NetworkConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        if let Err(e) = config.validate() {
            candle_core::bail!("invalid network config: {e}");
        }
        let dims = config.layer_dims();
        let last = dims.len() - 1;
        let mut layers = Vec::with_capacity(dims.len());
        for (i, (n_in, n_out)) in dims.into_iter().enumerate() {
            let dropout_keep = if i == 0 { config.dropout_input } else { config.dropout_hidden };
            let activation = if i == last { Activation::Identity } else { Activation::ReLU };
            layers.push(DenseLayer::new(
                n_in,
                n_out,
                dropout_keep,
                activation,
                config,
                device,
                rng,
            )?);
        }

        let varmap = VarMap::new();
        {
            let mut data = varmap.data().lock().unwrap();
            for (i, layer) in layers.iter().enumerate() {
                for (suffix, var) in layer.vars() {
                    data.insert(format!("layer{i}.{suffix}"), var.clone());
                }
            }
        }

        Ok(Self { layers, varmap, config: config.clone() })
    }

    /// Forward a `(batch, n_inputs)` block through the whole stack.
    ///
    /// `training` selects dropout, batch statistics and stochastic rounding;
    /// evaluation passes draw nothing from `rng`.
    pub fn forward_t(&self, x: &Tensor, training: bool, rng: &mut StdRng) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x, training, rng)?;
        }
        Ok(x)
    }

    /// One optimizer step over every layer from a gradient store.
    pub fn update(&mut self, grads: &GradStore, lr: f64, momentum: f64) -> Result<()> {
        for layer in &mut self.layers {
            layer.update(grads, lr, momentum)?;
        }
        Ok(())
    }

    /// Every gradient-trained continuous parameter, in layer order.
    pub fn parameters(&self) -> Vec<&Var> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    /// Fold batch-norm running statistics into per-layer scale/shift pairs
    /// for inference.
    pub fn prepare_fast_eval(&self) -> Result<()> {
        for layer in &self.layers {
            layer.prepare_fast_eval()?;
        }
        Ok(())
    }

    /// Persist every continuous parameter, batch-norm state included, as a
    /// safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)
    }

    /// Restore parameters written by [`save`](Self::save). Shapes must match
    /// the config this network was built with.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)
    }

    /// Continuous weight of the first layer, one column per hidden unit.
    pub fn first_layer_weight(&self) -> &Tensor {
        self.layers[0].weight()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Per-layer {-1, 0, +1} counts of the deterministically quantized
    /// weights (debug logging).
    pub fn weight_distributions(&self) -> Result<Vec<(String, (u64, u64, u64))>> {
        self.layers
            .iter()
            .enumerate()
            .map(|(i, layer)| Ok((format!("layer{i}"), layer.quantized_counts()?)))
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bitdense_common::WeightPolicy;
    use candle_core::DType;
    use rand::SeedableRng;

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            n_inputs: 4,
            n_units: 6,
            n_classes: 3,
            n_hidden_layers: 2,
            policy: WeightPolicy::Binary,
            stochastic: false,
            ..Default::default()
        }
    }

    #[test]
    fn builds_the_expected_stack() {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let net = Network::new(&small_config(), &dev, &mut rng).unwrap();
        assert_eq!(net.n_layers(), 3);
        let x = Tensor::zeros((5, 4), DType::F32, &dev).unwrap();
        let y = net.forward_t(&x, false, &mut rng).unwrap();
        assert_eq!(y.dims(), &[5, 3]);
        // weight + bias + gamma + beta per layer
        assert_eq!(net.parameters().len(), 12);
    }

    #[test]
    fn rejects_invalid_configs() {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(2);
        let config = NetworkConfig { n_hidden_layers: 0, ..small_config() };
        let err = Network::new(&config, &dev, &mut rng).unwrap_err();
        assert!(err.to_string().contains("invalid network config"), "{err}");
    }

    #[test]
    fn init_is_reproducible_from_the_seed() {
        let dev = Device::Cpu;
        let mut rng_a = StdRng::seed_from_u64(3);
        let mut rng_b = StdRng::seed_from_u64(3);
        let mut rng_c = StdRng::seed_from_u64(4);
        let a = Network::new(&small_config(), &dev, &mut rng_a).unwrap();
        let b = Network::new(&small_config(), &dev, &mut rng_b).unwrap();
        let c = Network::new(&small_config(), &dev, &mut rng_c).unwrap();
        let wa: Vec<f32> = a.first_layer_weight().flatten_all().unwrap().to_vec1().unwrap();
        let wb: Vec<f32> = b.first_layer_weight().flatten_all().unwrap().to_vec1().unwrap();
        let wc: Vec<f32> = c.first_layer_weight().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(wa, wb);
        assert_ne!(wa, wc);
    }

    #[test]
    fn save_load_round_trips_through_safetensors() {
        let dev = Device::Cpu;
        let mut rng_a = StdRng::seed_from_u64(5);
        let mut rng_b = StdRng::seed_from_u64(6);
        let config = small_config();
        let net_a = Network::new(&config, &dev, &mut rng_a).unwrap();
        let mut net_b = Network::new(&config, &dev, &mut rng_b).unwrap();

        let x = Tensor::ones((2, 4), DType::F32, &dev).unwrap();
        let ya: Vec<f32> =
            net_a.forward_t(&x, false, &mut rng_a).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let yb_before: Vec<f32> =
            net_b.forward_t(&x, false, &mut rng_b).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(ya, yb_before);

        let path = std::env::temp_dir()
            .join(format!("bitdense-model-{}.safetensors", std::process::id()));
        net_a.save(&path).unwrap();
        net_b.load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let yb_after: Vec<f32> =
            net_b.forward_t(&x, false, &mut rng_b).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(ya, yb_after);
    }

    #[test]
    fn binary_distribution_covers_all_weights() {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(7);
        let net = Network::new(&small_config(), &dev, &mut rng).unwrap();
        let dist = net.weight_distributions().unwrap();
        assert_eq!(dist.len(), 3);
        let (name, (neg, zero, pos)) = &dist[0];
        assert_eq!(name, "layer0");
        assert_eq!(*zero, 0); // binary rounding has no zero bucket
        assert_eq!(neg + pos, 24);
    }
}
