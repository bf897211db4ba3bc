//! Quantization primitives: rounding rules and the straight-through estimator.
//!
//! Everything else in the crate builds on these functions: every
//! [`DenseLayer`](crate::layer::DenseLayer) calls them to derive its
//! effective weight from the continuous one and to route the backward pass
//! around the non-differentiable rounding step.
//!
//! Deterministic rules are pure functions of the weight. Stochastic rules
//! draw one uniform per element from the caller's generator, in row-major
//! order, so a fixed seed and call order replays a run exactly.

use candle_core::{DType, Result, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use bitdense_common::WeightPolicy;

/// Zero-band width factor for ternary rounding: δ = 0.7 × mean(|W|).
const TERNARY_DELTA_FACTOR: f64 = 0.7;

/// Rounding discipline for one quantized forward pass.
///
/// Evaluation always uses `Deterministic`, even for networks configured
/// stochastic, so monitored error rates are reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Deterministic,
    Stochastic,
}

// ── Straight-through estimator ──────────────────────────────────────────────

/// Value of `quantized`, gradient of `latent`.
///
/// The trick: `quantized.detach() + (latent - latent.detach())`.
/// The residual is identically zero in the forward pass, but
/// `∂(residual)/∂latent = 1`, so the loss gradient taken at the quantized
/// weight lands on the continuous one unmodified.
pub fn straight_through(latent: &Tensor, quantized: &Tensor) -> Result<Tensor> {
    let residual = (latent - latent.detach())?;
    quantized.detach() + residual
}

// ── Binary rounding ─────────────────────────────────────────────────────────

/// Deterministic sign rule: +1 where `w >= 0`, -1 elsewhere.
///
/// Ties at exactly 0 resolve to +1; the same convention applies in training
/// and evaluation.
pub fn binarize_deterministic(w: &Tensor) -> Result<Tensor> {
    w.ge(0f64)?.to_dtype(DType::F32)?.affine(2.0, -1.0)
}

/// Stochastic sign rule: `P(+1) = clamp((w + 1) / 2, 0, 1)`.
///
/// A weight at +1 always rounds to +1, a weight at -1 always to -1, and a
/// weight at 0 is a fair coin.
pub fn binarize_stochastic(w: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let p = w.affine(0.5, 0.5)?.clamp(0f64, 1f64)?;
    let u = uniform_like(w, rng)?;
    p.gt(&u)?.to_dtype(DType::F32)?.affine(2.0, -1.0)
}

// ── Ternary rounding ────────────────────────────────────────────────────────

/// Dynamic zero-band half-width, floored away from zero so the stochastic
/// rule never divides by it. The floor is irrelevant deterministically: an
/// all-zero weight lands in the band either way.
fn ternary_delta(w: &Tensor) -> Result<f64> {
    let mean_abs = w.abs()?.mean_all()?.to_scalar::<f32>()? as f64;
    Ok((TERNARY_DELTA_FACTOR * mean_abs).max(1e-8))
}

/// Deterministic ternary rule: 0 inside the band `|w| <= δ`, else `sign(w)`.
///
/// ```text
/// W_q[i] = sign(W[i])  if |W[i]| > δ,  δ = 0.7 × mean(|W|)
///          0           otherwise
/// ```
pub fn ternarize_deterministic(w: &Tensor) -> Result<Tensor> {
    let delta = ternary_delta(w)?;
    let mask = w.abs()?.gt(delta)?.to_dtype(DType::F32)?;
    w.sign()? * mask
}

/// Stochastic ternary rule: non-zero with probability
/// `clamp(|w| / 2δ, 0, 1)`; surviving elements take `sign(w)`.
///
/// An element at exactly 0 has zero survival probability, so the sign never
/// sees a tie.
pub fn ternarize_stochastic(w: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let delta = ternary_delta(w)?;
    let p = w.abs()?.affine(1.0 / (2.0 * delta), 0.0)?.clamp(0f64, 1f64)?;
    let u = uniform_like(w, rng)?;
    let keep = p.gt(&u)?.to_dtype(DType::F32)?;
    w.sign()? * keep
}

// ── Dispatch ────────────────────────────────────────────────────────────────

/// Quantize `w` under `policy` with the given rounding discipline.
///
/// Always returns a fresh tensor and never mutates the input.
/// [`WeightPolicy::None`] hands back a clone so callers can treat every
/// policy uniformly.
pub fn quantize(
    w: &Tensor,
    policy: WeightPolicy,
    rounding: Rounding,
    rng: &mut StdRng,
) -> Result<Tensor> {
    match (policy, rounding) {
        (WeightPolicy::None, _) => Ok(w.clone()),
        (WeightPolicy::Binary, Rounding::Deterministic) => binarize_deterministic(w),
        (WeightPolicy::Binary, Rounding::Stochastic) => binarize_stochastic(w, rng),
        (WeightPolicy::Ternary, Rounding::Deterministic) => ternarize_deterministic(w),
        (WeightPolicy::Ternary, Rounding::Stochastic) => ternarize_stochastic(w, rng),
    }
}

// ── Debug helpers ───────────────────────────────────────────────────────────

/// Count negative / zero / positive entries of a quantized weight.
pub fn value_counts(q: &Tensor) -> Result<(u64, u64, u64)> {
    let flat = q.flatten_all()?.to_vec1::<f32>()?;
    let (mut n_neg, mut n_zero, mut n_pos) = (0u64, 0u64, 0u64);
    for &v in &flat {
        if v < -0.5 {
            n_neg += 1;
        } else if v > 0.5 {
            n_pos += 1;
        } else {
            n_zero += 1;
        }
    }
    Ok((n_neg, n_zero, n_pos))
}

/// Per-element U\[0,1) draws with the same shape as `t`, row-major.
fn uniform_like(t: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let n = t.elem_count();
    let u: Vec<f32> = (0..n).map(|_| rng.gen::<f32>()).collect();
    Tensor::from_vec(u, t.dims().to_vec(), t.device())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use rand::SeedableRng;

    #[test]
    fn binary_deterministic_breaks_ties_positive() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[-1.0f32, -0.2, 0.0, 0.2, 1.0], &dev).unwrap();
        let before: Vec<f32> = w.to_vec1().unwrap();
        let q = binarize_deterministic(&w).unwrap();
        assert_eq!(q.to_vec1::<f32>().unwrap(), vec![-1.0, -1.0, 1.0, 1.0, 1.0]);
        // input untouched, and re-quantizing the output is a fixed point
        assert_eq!(w.to_vec1::<f32>().unwrap(), before);
        let qq = binarize_deterministic(&q).unwrap();
        assert_eq!(qq.to_vec1::<f32>().unwrap(), q.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn binary_stochastic_replays_and_respects_extremes() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[-1.0f32, 1.0, 0.4, -0.4, 0.0], &dev).unwrap();
        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        let qa: Vec<f32> = binarize_stochastic(&w, &mut rng_a).unwrap().to_vec1().unwrap();
        let qb: Vec<f32> = binarize_stochastic(&w, &mut rng_b).unwrap().to_vec1().unwrap();
        assert_eq!(qa, qb);
        for &v in &qa {
            assert!(v == 1.0 || v == -1.0);
        }
        // saturated weights always round to their own sign
        assert_eq!(qa[0], -1.0);
        assert_eq!(qa[1], 1.0);
    }

    #[test]
    fn binary_stochastic_matches_probability_in_the_mean() {
        let dev = Device::Cpu;
        // w = 0.5 ⇒ P(+1) = 0.75 ⇒ E[q] = 0.5
        let w = Tensor::full(0.5f32, 10_000, &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let q = binarize_stochastic(&w, &mut rng).unwrap();
        let mean = q.mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((mean - 0.5).abs() < 0.05, "empirical mean {mean}");
    }

    #[test]
    fn ternary_deterministic_zeroes_the_band() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[-0.9f32, -0.3, 0.05, 0.4, 0.85], &dev).unwrap();
        // mean(|W|) = 2.5 / 5 = 0.5 → δ = 0.35
        // -0.9 → -1, -0.3 → 0, 0.05 → 0, 0.4 → +1, 0.85 → +1
        let q = ternarize_deterministic(&w).unwrap();
        assert_eq!(q.to_vec1::<f32>().unwrap(), vec![-1.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn ternary_stochastic_keeps_signs_and_replays() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[-0.8f32, -0.2, 0.0, 0.3, 0.9], &dev).unwrap();
        let signs: Vec<f32> = w.sign().unwrap().to_vec1().unwrap();
        let mut rng_a = StdRng::seed_from_u64(3);
        let mut rng_b = StdRng::seed_from_u64(3);
        let qa: Vec<f32> = ternarize_stochastic(&w, &mut rng_a).unwrap().to_vec1().unwrap();
        let qb: Vec<f32> = ternarize_stochastic(&w, &mut rng_b).unwrap().to_vec1().unwrap();
        assert_eq!(qa, qb);
        for (q, s) in qa.iter().zip(&signs) {
            assert!(*q == 0.0 || *q == *s, "element {q} vs sign {s}");
        }
    }

    #[test]
    fn none_policy_passes_weights_through() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[-0.5f32, 0.0, 0.5], &dev).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let q = quantize(&w, WeightPolicy::None, Rounding::Stochastic, &mut rng).unwrap();
        assert_eq!(q.to_vec1::<f32>().unwrap(), vec![-0.5, 0.0, 0.5]);
    }

    #[test]
    fn straight_through_gradient_is_identity() {
        let dev = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[0.5f32, -0.25, 0.75], &dev).unwrap()).unwrap();
        let q = binarize_deterministic(w.as_tensor()).unwrap();
        let st = straight_through(w.as_tensor(), &q).unwrap();
        assert_eq!(st.to_vec1::<f32>().unwrap(), vec![1.0, -1.0, 1.0]);

        let loss = st.sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(w.as_tensor()).unwrap();
        assert_eq!(g.to_vec1::<f32>().unwrap(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn value_counts_sorts_into_buckets() {
        let dev = Device::Cpu;
        let q = Tensor::new(&[-1.0f32, 0.0, 1.0, 1.0, 0.0], &dev).unwrap();
        assert_eq!(value_counts(&q).unwrap(), (1, 2, 2));
    }
}
