//! Data pipeline: IDX loading, splits, hinge targets, batching.
//!
//! Reads an uncompressed MNIST-style IDX pair (big-endian magic + dims
//! header, `u8` payload), scales pixels into [0,1] (or [-1,1] when
//! recentring is requested) and keeps everything host-side as flat `f32`
//! rows. Tensors are only materialized per batch.
//!
//! * **[`Dataset`]** — one labelled image set; [`Dataset::slice`] carves splits.
//! * **[`hinge_encode`]** — ±1 one-hot targets for the squared hinge loss.
//! * **[`batch_to_tensors`]** — one gathered batch to Candle tensors.

use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};

// ── IDX binary format ───────────────────────────────────────────────────────

/// Magic for an IDX file of unsigned-byte images (3 dims).
const IMAGES_MAGIC: u32 = 2051;
/// Magic for an IDX file of unsigned-byte labels (1 dim).
const LABELS_MAGIC: u32 = 2049;

// ── Dataset ─────────────────────────────────────────────────────────────────

/// An in-memory labelled image set.
///
/// `images` holds `n` examples of `rows * cols` pixels each, row-major.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Vec<f32>,
    pub labels: Vec<u8>,
    pub n: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Dataset {
    /// Load an images/labels IDX pair from disk.
    ///
    /// Pixels come out in [0,1], or [-1,1] when `center` is set.
    pub fn from_idx_files(images: &Path, labels: &Path, center: bool) -> AnyhowResult<Self> {
        let image_bytes =
            std::fs::read(images).with_context(|| format!("reading {}", images.display()))?;
        let label_bytes =
            std::fs::read(labels).with_context(|| format!("reading {}", labels.display()))?;
        Self::from_idx_bytes(&image_bytes, &label_bytes, center)
    }

    /// Parse an images/labels IDX pair from raw bytes.
    pub fn from_idx_bytes(
        image_bytes: &[u8],
        label_bytes: &[u8],
        center: bool,
    ) -> AnyhowResult<Self> {
        let (pixels, n, rows, cols) = parse_idx_images(image_bytes)?;
        let labels = parse_idx_labels(label_bytes)?;
        if labels.len() != n {
            anyhow::bail!(
                "image/label count mismatch: {} images, {} labels",
                n,
                labels.len()
            );
        }
        let images = if center {
            pixels.iter().map(|&p| p as f32 / 127.5 - 1.0).collect()
        } else {
            pixels.iter().map(|&p| p as f32 / 255.0).collect()
        };
        Ok(Self { images, labels, n, rows, cols })
    }

    /// Pixels per example.
    pub fn n_features(&self) -> usize {
        self.rows * self.cols
    }

    /// Copy the examples in `[start, stop)` into a new set. Used to carve
    /// the train/validation split out of one IDX file.
    pub fn slice(&self, start: usize, stop: usize) -> AnyhowResult<Dataset> {
        if start >= stop || stop > self.n {
            anyhow::bail!("invalid slice [{start}, {stop}) of {} examples", self.n);
        }
        let px = self.n_features();
        Ok(Dataset {
            images: self.images[start * px..stop * px].to_vec(),
            labels: self.labels[start..stop].to_vec(),
            n: stop - start,
            rows: self.rows,
            cols: self.cols,
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Hinge-style label encoding: class `c` becomes an `n_classes`-long ±1
/// vector with +1 at position `c`, matching the squared hinge loss.
pub fn hinge_encode(labels: &[u8], n_classes: usize) -> AnyhowResult<Vec<f32>> {
    let mut out = vec![-1.0f32; labels.len() * n_classes];
    for (i, &label) in labels.iter().enumerate() {
        let c = label as usize;
        if c >= n_classes {
            anyhow::bail!("label {label} out of range for {n_classes} classes");
        }
        out[i * n_classes + c] = 1.0;
    }
    Ok(out)
}

/// Convert one gathered batch to `(features, targets)` Candle tensors.
pub fn batch_to_tensors(
    features: &[f32],
    targets: &[f32],
    batch_size: usize,
    n_inputs: usize,
    n_classes: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let x = Tensor::from_slice(features, (batch_size, n_inputs), device)?;
    let t = Tensor::from_slice(targets, (batch_size, n_classes), device)?;
    Ok((x, t))
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    // callers bounds-check before reading
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn parse_idx_images(bytes: &[u8]) -> AnyhowResult<(Vec<u8>, usize, usize, usize)> {
    if bytes.len() < 16 {
        anyhow::bail!("IDX image header truncated: {} bytes", bytes.len());
    }
    let magic = be_u32(bytes, 0);
    if magic != IMAGES_MAGIC {
        anyhow::bail!("bad IDX image magic: expected {IMAGES_MAGIC}, got {magic}");
    }
    let n = be_u32(bytes, 4) as usize;
    let rows = be_u32(bytes, 8) as usize;
    let cols = be_u32(bytes, 12) as usize;
    let expected = 16 + n * rows * cols;
    if bytes.len() != expected {
        anyhow::bail!(
            "IDX image payload: expected {expected} bytes, got {}",
            bytes.len()
        );
    }
    Ok((bytes[16..].to_vec(), n, rows, cols))
}

fn parse_idx_labels(bytes: &[u8]) -> AnyhowResult<Vec<u8>> {
    if bytes.len() < 8 {
        anyhow::bail!("IDX label header truncated: {} bytes", bytes.len());
    }
    let magic = be_u32(bytes, 0);
    if magic != LABELS_MAGIC {
        anyhow::bail!("bad IDX label magic: expected {LABELS_MAGIC}, got {magic}");
    }
    let n = be_u32(bytes, 4) as usize;
    let expected = 8 + n;
    if bytes.len() != expected {
        anyhow::bail!(
            "IDX label payload: expected {expected} bytes, got {}",
            bytes.len()
        );
    }
    Ok(bytes[8..].to_vec())
}
