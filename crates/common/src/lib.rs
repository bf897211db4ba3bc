//! # bitdense-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`NetworkConfig`]** / **[`WeightPolicy`]** — model hyper-parameters (serialised as JSON).
//! * **[`Dataset`]** — IDX loading, splits, hinge-encoded targets.
//! * **[`AugmentOptions`]** / **[`augment_images`]** — per-epoch training-set augmentation.
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.
//! * **[`save_filter_grid`]** — first-layer filter sheet (PNG).

pub mod augment;
pub mod config;
pub mod data;
pub mod viz;

pub use augment::{augment_images, AugmentOptions};
pub use config::{NetworkConfig, WeightPolicy};
pub use data::{batch_to_tensors, hinge_encode, Dataset};
pub use viz::save_filter_grid;
