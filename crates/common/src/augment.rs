//! Per-epoch training-set augmentation.
//!
//! Each epoch regenerates its training images from the pristine copy:
//! optional horizontal flip, random affine warp, zero-pad plus random crop.
//! Every draw comes from the caller's generator, in a fixed per-image
//! order (flip coin, warp parameters, crop offsets), so a seeded run
//! replays exactly.

use rand::rngs::StdRng;
use rand::Rng;

/// Augmentation knobs. The default (all zero / false) is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct AugmentOptions {
    /// Pixels of zero padding before a random crop back to the original size.
    pub zero_pad: usize,
    /// Magnitude of the random affine perturbation `A = I + U(-a, a)` per entry.
    pub affine_a: f64,
    /// Magnitude of the random translation `t` with entries in `U(-b, b)`.
    pub affine_b: f64,
    /// Flip each image left-right with probability 1/2.
    pub horizontal_flip: bool,
}

impl AugmentOptions {
    /// True when any transform is enabled; inactive options skip the copy
    /// entirely.
    pub fn is_active(&self) -> bool {
        self.zero_pad > 0 || self.affine_a > 0.0 || self.affine_b > 0.0 || self.horizontal_flip
    }
}

/// Regenerate `n` images of `rows * cols` pixels under `opts`.
///
/// The input stays untouched; pixels sampled from outside the source image
/// are zero.
pub fn augment_images(
    images: &[f32],
    n: usize,
    rows: usize,
    cols: usize,
    opts: &AugmentOptions,
    rng: &mut StdRng,
) -> Vec<f32> {
    if !opts.is_active() {
        return images.to_vec();
    }
    let px = rows * cols;
    let mut out = Vec::with_capacity(images.len());
    for i in 0..n {
        let mut img = images[i * px..(i + 1) * px].to_vec();
        if opts.horizontal_flip && rng.gen_bool(0.5) {
            flip_horizontal(&mut img, rows, cols);
        }
        if opts.affine_a > 0.0 || opts.affine_b > 0.0 {
            img = affine_warp(&img, rows, cols, opts.affine_a, opts.affine_b, rng);
        }
        if opts.zero_pad > 0 {
            img = shift_crop(&img, rows, cols, opts.zero_pad, rng);
        }
        out.extend_from_slice(&img);
    }
    out
}

fn flip_horizontal(img: &mut [f32], rows: usize, cols: usize) {
    for r in 0..rows {
        img[r * cols..(r + 1) * cols].reverse();
    }
}

fn draw(magnitude: f64, rng: &mut StdRng) -> f64 {
    if magnitude > 0.0 {
        rng.gen_range(-magnitude..magnitude)
    } else {
        0.0
    }
}

/// Resample through a random affine map about the image centre.
fn affine_warp(
    src: &[f32],
    rows: usize,
    cols: usize,
    a: f64,
    b: f64,
    rng: &mut StdRng,
) -> Vec<f32> {
    let a11 = 1.0 + draw(a, rng);
    let a12 = draw(a, rng);
    let a21 = draw(a, rng);
    let a22 = 1.0 + draw(a, rng);
    let tr = draw(b, rng);
    let tc = draw(b, rng);
    let cr = (rows as f64 - 1.0) / 2.0;
    let cc = (cols as f64 - 1.0) / 2.0;
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let dr = r as f64 - cr;
            let dc = c as f64 - cc;
            let sr = a11 * dr + a12 * dc + cr + tr;
            let sc = a21 * dr + a22 * dc + cc + tc;
            out[r * cols + c] = bilinear(src, rows, cols, sr, sc);
        }
    }
    out
}

fn bilinear(src: &[f32], rows: usize, cols: usize, r: f64, c: f64) -> f32 {
    let r0 = r.floor();
    let c0 = c.floor();
    let fr = (r - r0) as f32;
    let fc = (c - c0) as f32;
    let at = |ri: f64, ci: f64| -> f32 {
        if ri < 0.0 || ci < 0.0 || ri >= rows as f64 || ci >= cols as f64 {
            0.0
        } else {
            src[ri as usize * cols + ci as usize]
        }
    };
    let v00 = at(r0, c0);
    let v01 = at(r0, c0 + 1.0);
    let v10 = at(r0 + 1.0, c0);
    let v11 = at(r0 + 1.0, c0 + 1.0);
    v00 * (1.0 - fr) * (1.0 - fc)
        + v01 * (1.0 - fr) * fc
        + v10 * fr * (1.0 - fc)
        + v11 * fr * fc
}

/// Zero-pad by `pad` pixels and crop back at a random offset. Implemented
/// as a shift with zero fill, which is the same picture without the
/// intermediate buffer.
fn shift_crop(src: &[f32], rows: usize, cols: usize, pad: usize, rng: &mut StdRng) -> Vec<f32> {
    let p = pad as isize;
    let dr = rng.gen_range(0..=2 * pad) as isize - p;
    let dc = rng.gen_range(0..=2 * pad) as isize - p;
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows as isize {
        for c in 0..cols as isize {
            let sr = r + dr;
            let sc = c + dc;
            if sr >= 0 && sc >= 0 && (sr as usize) < rows && (sc as usize) < cols {
                out[r as usize * cols + c as usize] = src[sr as usize * cols + sc as usize];
            }
        }
    }
    out
}
