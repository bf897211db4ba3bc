//! Network configuration.
//!
//! Serialized as JSON next to saved weights so a checkpoint is
//! self-describing. Every tuning field carries a `#[serde(default)]` so
//! configs written by older builds keep loading.

use serde::{Deserialize, Serialize};

// ── Weight policy ───────────────────────────────────────────────────────────

/// Quantization policy applied to every layer's effective weights.
///
/// `None` leaves the continuous weights untouched and is the baseline used
/// to validate the training loop independently of quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPolicy {
    None,
    /// Effective weights in {-1, +1}.
    Binary,
    /// Effective weights in {-1, 0, +1}.
    Ternary,
}

impl WeightPolicy {
    /// Parse a policy name as written in configs and on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "binary" => Some(Self::Binary),
            "ternary" => Some(Self::Ternary),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Binary => "binary",
            Self::Ternary => "ternary",
        }
    }
}

// ── Network config ──────────────────────────────────────────────────────────

/// Architecture and per-layer hyper-parameters of the dense classifier.
///
/// Training-run knobs (epochs, learning rate, shuffling) live in the
/// trainer's own config; this struct describes only what is needed to
/// rebuild the network for inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    // Core dimensions
    /// Flattened feature count of one example (28 x 28 = 784 for MNIST).
    pub n_inputs: usize,
    /// Width of every hidden layer.
    pub n_units: usize,
    /// Class count, also the width of the output layer.
    pub n_classes: usize,
    /// ReLU hidden layers in front of the linear output layer.
    pub n_hidden_layers: usize,

    // Batch normalization
    #[serde(default = "default_true")]
    pub batch_norm: bool,
    #[serde(default = "default_bn_epsilon")]
    pub bn_epsilon: f64,

    // Dropout, expressed as keep-probabilities; 1.0 disables.
    #[serde(default = "default_keep")]
    pub dropout_input: f64,
    #[serde(default = "default_keep")]
    pub dropout_hidden: f64,

    // Quantization
    #[serde(default = "default_policy")]
    pub policy: WeightPolicy,
    /// Stochastic rounding during training passes. Inference always rounds
    /// deterministically regardless of this flag.
    #[serde(default = "default_true")]
    pub stochastic: bool,
}

fn default_true() -> bool {
    true
}

fn default_bn_epsilon() -> f64 {
    1e-4
}

fn default_keep() -> f64 {
    1.0
}

fn default_policy() -> WeightPolicy {
    WeightPolicy::Binary
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            n_inputs: 784,
            n_units: 1024,
            n_classes: 10,
            n_hidden_layers: 3,
            batch_norm: true,
            bn_epsilon: default_bn_epsilon(),
            dropout_input: default_keep(),
            dropout_hidden: default_keep(),
            policy: default_policy(),
            stochastic: true,
        }
    }
}

impl NetworkConfig {
    /// Reject impossible configurations before any tensor is allocated.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_inputs == 0 || self.n_units == 0 {
            anyhow::bail!(
                "layer widths must be positive (n_inputs={}, n_units={})",
                self.n_inputs,
                self.n_units
            );
        }
        if self.n_classes < 2 {
            anyhow::bail!("n_classes must be at least 2, got {}", self.n_classes);
        }
        if self.n_hidden_layers == 0 {
            anyhow::bail!("n_hidden_layers must be at least 1");
        }
        if self.bn_epsilon <= 0.0 {
            anyhow::bail!("bn_epsilon must be positive, got {}", self.bn_epsilon);
        }
        for (name, p) in [
            ("dropout_input", self.dropout_input),
            ("dropout_hidden", self.dropout_hidden),
        ] {
            if !(p > 0.0 && p <= 1.0) {
                anyhow::bail!("{name} is a keep-probability and must lie in (0, 1], got {p}");
            }
        }
        Ok(())
    }

    /// `(fan_in, fan_out)` of every layer in forward order: the hidden
    /// stack followed by the output layer.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut dims = Vec::with_capacity(self.n_hidden_layers + 1);
        dims.push((self.n_inputs, self.n_units));
        for _ in 1..self.n_hidden_layers {
            dims.push((self.n_units, self.n_units));
        }
        dims.push((self.n_units, self.n_classes));
        dims
    }

    /// Save as pretty-printed JSON.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file, filling missing fields with defaults.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        Ok(config)
    }
}
