//! Learning-rate schedule.

// ── LR Schedule ─────────────────────────────────────────────────────────────

/// Geometric per-epoch decay from `lr` to `lr_fin`.
///
/// The multiplicative factor is `(lr_fin / lr)^(1 / n_epochs)`, so after
/// `n_epochs` calls to [`advance`](Self::advance) the rate lands on
/// `lr_fin` exactly (up to float rounding). `lr == lr_fin` keeps the rate
/// constant.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    lr: f64,
    decay: f64,
}

impl LrSchedule {
    /// `n_epochs` must be positive; the trainer validates this before
    /// constructing the schedule.
    pub fn geometric(lr: f64, lr_fin: f64, n_epochs: usize) -> Self {
        let decay = (lr_fin / lr).powf(1.0 / n_epochs as f64);
        Self { lr, decay }
    }

    /// Learning rate for the current epoch.
    pub fn current_lr(&self) -> f64 {
        self.lr
    }

    /// Advance one epoch. Runs once per epoch, whatever the validation
    /// outcome was.
    pub fn advance(&mut self) {
        self.lr *= self.decay;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
