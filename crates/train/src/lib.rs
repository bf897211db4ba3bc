//! # bitdense-train — The Epoch Engine
//!
//! Training loop and scheduling for quantized classifiers:
//!
//! * **[`Trainer`]** — owns model + datasets + generator. One call to
//!   [`Trainer::train`] runs the full epoch schedule: per-epoch
//!   augmentation, shuffling, minibatch SGD with momentum, periodic
//!   monitoring of all three splits, and best-model checkpointing.
//! * **[`LrSchedule`]** — geometric decay from `lr` to `lr_fin`, advanced
//!   once per epoch.
//! * **[`squared_hinge`]** — mean squared hinge loss against ±1 targets.

pub mod scheduler;
pub mod trainer;

pub use scheduler::LrSchedule;
pub use trainer::{squared_hinge, MonitorPoint, TrainReport, Trainer, TrainerConfig};
