//! A dense layer with quantized effective weights.
//!
//! The layer owns its continuous parameters (weight, bias, optional
//! batch-norm unit) plus their momentum buffers. A forward pass derives the
//! effective weight under the configured policy and routes gradients back to
//! the continuous copy through the straight-through estimator; an update
//! steps the continuous copy and clips the weight back into [-1, 1].

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Result, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;

use bitdense_common::{NetworkConfig, WeightPolicy};

use crate::norm::BatchNorm;
use crate::quantize::{self, Rounding};

/// Clip bound for the continuous weights. Stochastic rounding maps
/// [-1, 1] onto probabilities, so weights may never leave this box.
const WEIGHT_CLIP: f64 = 1.0;

/// Activation applied after the (optional) batch-norm unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    ReLU,
    Identity,
}

/// One fully-connected layer: dropout on the input, quantized matmul, bias,
/// optional batch norm, activation.
pub struct DenseLayer {
    weight: Var,
    bias: Var,
    v_weight: Tensor,
    v_bias: Tensor,
    bn: Option<BatchNorm>,
    policy: WeightPolicy,
    stochastic: bool,
    /// Keep-probability for this layer's input; 1.0 disables dropout.
    dropout_keep: f64,
    activation: Activation,
}

impl DenseLayer {
    /// Build a `(n_in, n_units)` layer. The weight is Glorot-uniform drawn
    /// from `rng`, the bias starts at zero.
    pub fn new(
        n_in: usize,
        n_units: usize,
        dropout_keep: f64,
        activation: Activation,
        config: &NetworkConfig,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let weight = Var::from_tensor(&glorot_uniform(n_in, n_units, device, rng)?)?;
        let bias = Var::from_tensor(&Tensor::zeros((n_units,), DType::F32, device)?)?;
        let bn = if config.batch_norm {
            Some(BatchNorm::new(n_units, config.bn_epsilon, device)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            v_weight: Tensor::zeros((n_in, n_units), DType::F32, device)?,
            v_bias: Tensor::zeros((n_units,), DType::F32, device)?,
            bn,
            policy: config.policy,
            stochastic: config.stochastic,
            dropout_keep,
            activation,
        })
    }

    /// Forward one `(batch, n_in)` activation block.
    ///
    /// `training` selects dropout, batch statistics and (when configured)
    /// stochastic rounding; inference passes draw nothing from `rng`.
    pub fn forward(&self, x: &Tensor, training: bool, rng: &mut StdRng) -> Result<Tensor> {
        let x = self.apply_dropout(x, training, rng)?;
        let w_eff = self.effective_weight(training, rng)?;
        let z = x.matmul(&w_eff)?.broadcast_add(self.bias.as_tensor())?;
        let z = match &self.bn {
            Some(bn) => bn.forward(&z, training)?,
            None => z,
        };
        match self.activation {
            Activation::ReLU => z.relu(),
            Activation::Identity => Ok(z),
        }
    }

    /// Quantize the continuous weight and attach the straight-through
    /// residual. Policy `None` uses the weight as-is.
    fn effective_weight(&self, training: bool, rng: &mut StdRng) -> Result<Tensor> {
        let w = self.weight.as_tensor();
        if self.policy == WeightPolicy::None {
            return Ok(w.clone());
        }
        let rounding = if training && self.stochastic {
            Rounding::Stochastic
        } else {
            Rounding::Deterministic
        };
        let q = quantize::quantize(w, self.policy, rounding, rng)?;
        quantize::straight_through(w, &q)
    }

    /// Inverted dropout: surviving inputs are rescaled by `1 / keep` so the
    /// expected activation is unchanged and inference needs no rescale.
    fn apply_dropout(&self, x: &Tensor, training: bool, rng: &mut StdRng) -> Result<Tensor> {
        if !training || self.dropout_keep >= 1.0 {
            return Ok(x.clone());
        }
        let keep = self.dropout_keep;
        let scale = (1.0 / keep) as f32;
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if rng.gen::<f64>() < keep { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, x.dims().to_vec(), x.device())?;
        x * &mask
    }

    /// One momentum-SGD step on every parameter of this layer, then clip
    /// the continuous weight back into the box. The clip runs every step,
    /// not only when the weight moved.
    pub fn update(&mut self, grads: &GradStore, lr: f64, momentum: f64) -> Result<()> {
        sgd_momentum_step(&self.weight, &mut self.v_weight, grads, lr, momentum)?;
        let clipped = self.weight.as_tensor().clamp(-WEIGHT_CLIP, WEIGHT_CLIP)?;
        self.weight.set(&clipped)?;
        sgd_momentum_step(&self.bias, &mut self.v_bias, grads, lr, momentum)?;
        if let Some(bn) = &mut self.bn {
            bn.apply_update(grads, lr, momentum)?;
        }
        Ok(())
    }

    /// `(suffix, var)` pairs for checkpoint registration.
    pub fn vars(&self) -> Vec<(String, &Var)> {
        let mut out = vec![
            ("weight".to_string(), &self.weight),
            ("bias".to_string(), &self.bias),
        ];
        if let Some(bn) = &self.bn {
            for (name, var) in bn.vars() {
                out.push((format!("bn.{name}"), var));
            }
        }
        out
    }

    /// Gradient-trained parameters, in update order.
    pub fn parameters(&self) -> Vec<&Var> {
        let mut out = vec![&self.weight, &self.bias];
        if let Some(bn) = &self.bn {
            out.extend(bn.trainable());
        }
        out
    }

    /// The continuous (unquantized) weight.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn prepare_fast_eval(&self) -> Result<()> {
        if let Some(bn) = &self.bn {
            bn.prepare_fast_eval()?;
        }
        Ok(())
    }

    /// {-1, 0, +1} counts of the deterministic quantization of the current
    /// weight; policy `None` counts raw signs.
    pub fn quantized_counts(&self) -> Result<(u64, u64, u64)> {
        let w = self.weight.as_tensor();
        let q = match self.policy {
            WeightPolicy::None => w.clone(),
            WeightPolicy::Binary => quantize::binarize_deterministic(w)?,
            WeightPolicy::Ternary => quantize::ternarize_deterministic(w)?,
        };
        quantize::value_counts(&q)
    }
}

/// One momentum-SGD step on a parameter: `v ← M·v − lr·g`, `p ← p + v`.
///
/// Parameters without a gradient in the store are left untouched.
pub(crate) fn sgd_momentum_step(
    param: &Var,
    velocity: &mut Tensor,
    grads: &GradStore,
    lr: f64,
    momentum: f64,
) -> Result<()> {
    let Some(grad) = grads.get(param.as_tensor()) else {
        return Ok(());
    };
    let v = (velocity.affine(momentum, 0.0)? - grad.affine(lr, 0.0)?)?;
    param.set(&(param.as_tensor() + &v)?)?;
    *velocity = v;
    Ok(())
}

/// Glorot-uniform init with limit `sqrt(6 / (fan_in + fan_out))`, drawn
/// from the run's generator rather than the device RNG so construction is
/// reproducible from the seed alone.
fn glorot_uniform(n_in: usize, n_out: usize, device: &Device, rng: &mut StdRng) -> Result<Tensor> {
    let limit = (6.0 / (n_in + n_out) as f64).sqrt() as f32;
    let data: Vec<f32> = (0..n_in * n_out).map(|_| rng.gen_range(-limit..limit)).collect();
    Tensor::from_vec(data, (n_in, n_out), device)
}

// ── Tests ───────────────────────────────────────────────────────────────────
