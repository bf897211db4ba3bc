//! First-layer filter sheets.
//!
//! Renders each hidden unit's incoming weight vector as a grey tile in a
//! near-square grid (one-pixel gutters, per-tile min/max normalization) and
//! writes the sheet as a PNG. Handy for eyeballing whether quantized
//! training still learns stroke detectors.

use candle_core::Tensor;
use image::{GrayImage, Luma};

/// Render the columns of `weight` (shape `(rows * cols, n_units)`) as a
/// tiled PNG at `path`.
pub fn save_filter_grid(
    weight: &Tensor,
    rows: usize,
    cols: usize,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let (n_in, n_units) = weight.dims2()?;
    if n_in != rows * cols {
        anyhow::bail!("weight has {n_in} rows, expected {rows}x{cols} = {}", rows * cols);
    }
    let w = weight.to_vec2::<f32>()?;

    let grid_cols = (n_units as f64).sqrt().ceil() as usize;
    let grid_rows = n_units.div_ceil(grid_cols);
    let sheet_w = (grid_cols * (cols + 1) + 1) as u32;
    let sheet_h = (grid_rows * (rows + 1) + 1) as u32;
    let mut sheet = GrayImage::new(sheet_w, sheet_h);

    for unit in 0..n_units {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for row in &w {
            lo = lo.min(row[unit]);
            hi = hi.max(row[unit]);
        }
        let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };
        let gr = unit / grid_cols;
        let gc = unit % grid_cols;
        for r in 0..rows {
            for c in 0..cols {
                let v = w[r * cols + c][unit];
                let px = ((v - lo) * scale).round().clamp(0.0, 255.0) as u8;
                sheet.put_pixel(
                    (gc * (cols + 1) + 1 + c) as u32,
                    (gr * (rows + 1) + 1 + r) as u32,
                    Luma([px]),
                );
            }
        }
    }
    sheet.save(path)?;
    Ok(())
}
