//! Batch normalization with separate training and inference paths.
//!
//! Training normalizes with the current minibatch's biased statistics and
//! keeps exponential running estimates for inference. Inference uses the
//! running estimates, or a precomputed fused scale/shift pair ("fast eval")
//! that folds γ, β, mean and variance into a single affine transform.
//!
//! The fused pair is cached behind a `parking_lot::Mutex` so preparing it
//! takes `&self`; any parameter update invalidates it.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Result, Tensor, Var};
use parking_lot::Mutex;

use crate::layer::sgd_momentum_step;

/// Fraction of the previous running estimate kept per training batch.
const RUNNING_RETENTION: f64 = 0.9;

/// One feature-wise batch-norm unit over `(batch, features)` activations.
pub struct BatchNorm {
    gamma: Var,
    beta: Var,
    running_mean: Var,
    running_var: Var,
    v_gamma: Tensor,
    v_beta: Tensor,
    epsilon: f64,
    /// `(scale, shift)` once [`prepare_fast_eval`](Self::prepare_fast_eval)
    /// has run; dropped on every update.
    fused: Mutex<Option<(Tensor, Tensor)>>,
}

impl BatchNorm {
    pub fn new(n_features: usize, epsilon: f64, device: &Device) -> Result<Self> {
        let ones = Tensor::ones((n_features,), DType::F32, device)?;
        let zeros = Tensor::zeros((n_features,), DType::F32, device)?;
        Ok(Self {
            gamma: Var::from_tensor(&ones)?,
            beta: Var::from_tensor(&zeros)?,
            running_mean: Var::from_tensor(&zeros)?,
            running_var: Var::from_tensor(&ones)?,
            v_gamma: zeros.clone(),
            v_beta: zeros,
            epsilon,
            fused: Mutex::new(None),
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        if training {
            self.forward_train(x)
        } else {
            self.forward_eval(x)
        }
    }

    /// Normalize by the minibatch's own (biased) moments and advance the
    /// running estimates on detached copies.
    fn forward_train(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean(0)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean(0)?;
        let denom = var.affine(1.0, self.epsilon)?.sqrt()?;
        let normed = centered.broadcast_div(&denom)?;
        let out = normed
            .broadcast_mul(self.gamma.as_tensor())?
            .broadcast_add(self.beta.as_tensor())?;

        // The running estimates live outside the autodiff graph.
        let new_mean = (self.running_mean.as_tensor().affine(RUNNING_RETENTION, 0.0)?
            + mean.detach().affine(1.0 - RUNNING_RETENTION, 0.0)?)?;
        self.running_mean.set(&new_mean)?;
        let new_var = (self.running_var.as_tensor().affine(RUNNING_RETENTION, 0.0)?
            + var.detach().affine(1.0 - RUNNING_RETENTION, 0.0)?)?;
        self.running_var.set(&new_var)?;
        // the advanced estimates make any fused pair stale
        self.invalidate_fast_eval();

        Ok(out)
    }

    fn forward_eval(&self, x: &Tensor) -> Result<Tensor> {
        {
            let guard = self.fused.lock();
            if let Some((ref scale, ref shift)) = *guard {
                return x.broadcast_mul(scale)?.broadcast_add(shift);
            }
        }
        let denom = self.running_var.as_tensor().affine(1.0, self.epsilon)?.sqrt()?;
        x.broadcast_sub(self.running_mean.as_tensor())?
            .broadcast_div(&denom)?
            .broadcast_mul(self.gamma.as_tensor())?
            .broadcast_add(self.beta.as_tensor())
    }

    /// Precompute the fused inference transform:
    /// `scale = γ / sqrt(σ² + ε)`, `shift = β − μ · scale`.
    pub fn prepare_fast_eval(&self) -> Result<()> {
        let denom = self.running_var.as_tensor().affine(1.0, self.epsilon)?.sqrt()?;
        let scale = (self.gamma.as_tensor() / &denom)?;
        let shift = (self.beta.as_tensor() - (self.running_mean.as_tensor() * &scale)?)?;
        self.fused.lock().replace((scale, shift));
        Ok(())
    }

    /// Drop the fused transform; the next eval recomputes from the live
    /// parameters.
    pub fn invalidate_fast_eval(&self) {
        self.fused.lock().take();
    }

    /// One momentum-SGD step on γ and β. Running estimates are not
    /// gradient-trained.
    pub fn apply_update(&mut self, grads: &GradStore, lr: f64, momentum: f64) -> Result<()> {
        sgd_momentum_step(&self.gamma, &mut self.v_gamma, grads, lr, momentum)?;
        sgd_momentum_step(&self.beta, &mut self.v_beta, grads, lr, momentum)?;
        self.invalidate_fast_eval();
        Ok(())
    }

    /// `(suffix, var)` pairs for checkpoint registration, running estimates
    /// included.
    pub fn vars(&self) -> [(&'static str, &Var); 4] {
        [
            ("gamma", &self.gamma),
            ("beta", &self.beta),
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ]
    }

    /// The gradient-trained parameters.
    pub fn trainable(&self) -> [&Var; 2] {
        [&self.gamma, &self.beta]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
