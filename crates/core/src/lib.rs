//! # bitdense-core — The Quantized-Training Engine
//!
//! Every compute primitive needed to build and train a dense classifier
//! whose effective weights live in {-1, +1} or {-1, 0, +1} lives here:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | binary/ternary rounding rules, straight-through estimator |
//! | [`norm`] | `BatchNorm` with running estimates and a fused fast-eval path |
//! | [`layer`] | `DenseLayer`: shadow weights, dropout, momentum updates |
//! | [`model`] | `Network`: the ordered stack plus safetensors persistence |
//!
//! ## Design principles
//!
//! 1. **Shadow weights.** The continuous parameters are `candle` `Var`s;
//!    effective weights are derived tensors rebuilt on every forward pass.
//! 2. **One generator.** Every random draw (init, dropout masks, stochastic
//!    rounding) comes from the caller's `StdRng`; evaluation draws nothing,
//!    so a fixed seed replays a run exactly.
//! 3. **`Send + Sync`-safe.** Inference caches use `parking_lot::Mutex`, not
//!    `RefCell`.

pub mod layer;
pub mod model;
pub mod norm;
pub mod quantize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use layer::{Activation, DenseLayer};
pub use model::Network;
pub use norm::BatchNorm;
pub use quantize::{
    binarize_deterministic, binarize_stochastic, quantize, straight_through,
    ternarize_deterministic, ternarize_stochastic, Rounding,
};
