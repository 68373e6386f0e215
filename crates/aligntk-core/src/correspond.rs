//! Component C: the patch correspondence engine (§4.C).
//!
//! Operates level-by-level from the coarsest pyramid level down to a
//! target level. At each level, every grid cell extracts a patch from
//! the moving image and a larger search window from the reference,
//! pre-whitens both, computes a normalized cross-correlation surface via
//! FFT, restricts it to the configured search radius and a
//! mask-autocorrelation-derived validity threshold, picks the
//! sub-pixel-refined peak, and accepts or rejects it against `minCorr`,
//! `minRatio`, and a distance-transform floor. Rejected cells inherit
//! their neighbors' displacement via a one-step Laplacian fill before
//! the pyramid descends to the next (finer) level.

use ndarray::Array2;
use num_complex::Complex;
use rayon::prelude::*;

use crate::consts::{EPSILON, PARALLEL_CELL_THRESHOLD};
use crate::compute::Fft;
use crate::error::{AlignError, Result};
use crate::pyramid::PyramidLevel;
use crate::subpixel::refine_peak_paraboloid;

/// Tunable thresholds for one pair's correspondence run.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CorrelationConfig {
    /// Patch side `p`, in pixels, extracted from the moving image.
    pub patch_size: usize,
    /// Grid stride at the coarsest level the engine starts from.
    pub grid_stride: usize,
    /// Minimum accepted peak correlation.
    pub min_corr: f64,
    /// Minimum peak-to-second-peak ratio.
    pub min_ratio: f64,
    /// Minimum reference DT, as a multiple of the level's pixel pitch,
    /// required at the chosen offset.
    pub dt_min: f64,
    /// Minimum fraction of `p*p` valid overlapping pixels an offset must
    /// have to be considered at all.
    pub valid_fraction: f64,
    /// Minimum fraction of cells that must be accepted at any level, or
    /// the whole pair is reported FAILED (`AlignError::Degenerate`).
    pub min_accept: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            patch_size: 64,
            grid_stride: 64,
            min_corr: 0.5,
            min_ratio: 1.2,
            dt_min: 2.0,
            valid_fraction: 0.5,
            min_accept: 0.5,
        }
    }
}

/// One grid cell's state as it is carried between pyramid levels.
#[derive(Clone, Copy, Debug)]
pub struct CellDisplacement {
    pub gx: usize,
    pub gy: usize,
    /// Nominal (un-displaced) grid position at the current level.
    pub pos_x: f64,
    pub pos_y: f64,
    /// Accumulated displacement (moving -> reference) at the current level.
    pub dx: f64,
    pub dy: f64,
    /// Accepted correlation peak, or 0.0 if this cell is currently rejected.
    pub confidence: f64,
}

/// The sparse per-cell displacement field produced by the correspondence
/// engine at one level.
#[derive(Clone, Debug)]
pub struct DisplacementField {
    pub level: usize,
    pub grid_w: usize,
    pub grid_h: usize,
    pub cells: Vec<CellDisplacement>,
}

impl DisplacementField {
    pub fn cell(&self, gx: usize, gy: usize) -> &CellDisplacement {
        &self.cells[gy * self.grid_w + gx]
    }

    pub fn fraction_accepted(&self) -> f64 {
        if self.cells.is_empty() {
            return 0.0;
        }
        self.cells.iter().filter(|c| c.confidence > 0.0).count() as f64 / self.cells.len() as f64
    }
}

/// Seed a grid over a `width x height` level at the given `stride`,
/// centered cells, all displacements zero and unaccepted.
fn seed_grid(level: usize, width: usize, height: usize, stride: usize) -> DisplacementField {
    let half = stride / 2;
    let grid_w = if width > half { (width - half) / stride + 1 } else { 1 };
    let grid_h = if height > half { (height - half) / stride + 1 } else { 1 };
    let mut cells = Vec::with_capacity(grid_w * grid_h);
    for gy in 0..grid_h {
        for gx in 0..grid_w {
            cells.push(CellDisplacement {
                gx,
                gy,
                pos_x: (half + gx * stride) as f64,
                pos_y: (half + gy * stride) as f64,
                dx: 0.0,
                dy: 0.0,
                confidence: 0.0,
            });
        }
    }
    DisplacementField { level, grid_w, grid_h, cells }
}

/// Double cell positions and displacements when descending to the next
/// (finer) pyramid level (§4.C: "the level transitions from k to k-1 by
/// doubling the prior cell positions").
fn double_for_finer_level(field: &DisplacementField) -> DisplacementField {
    DisplacementField {
        level: field.level - 1,
        grid_w: field.grid_w,
        grid_h: field.grid_h,
        cells: field
            .cells
            .iter()
            .map(|c| CellDisplacement {
                gx: c.gx,
                gy: c.gy,
                pos_x: c.pos_x * 2.0,
                pos_y: c.pos_y * 2.0,
                dx: c.dx * 2.0,
                dy: c.dy * 2.0,
                confidence: c.confidence,
            })
            .collect(),
    }
}

/// One-step Laplacian fill: rejected cells (`confidence == 0`) adopt the
/// mean displacement of their accepted 4-neighbors. Cells with no
/// accepted neighbor keep their prior displacement unchanged.
fn laplacian_fill(field: &mut DisplacementField) {
    let (gw, gh) = (field.grid_w, field.grid_h);
    let snapshot = field.cells.clone();
    let at = |gx: i64, gy: i64| -> Option<&CellDisplacement> {
        if gx < 0 || gy < 0 || gx as usize >= gw || gy as usize >= gh {
            None
        } else {
            Some(&snapshot[gy as usize * gw + gx as usize])
        }
    };

    for cell in field.cells.iter_mut() {
        if cell.confidence > 0.0 {
            continue;
        }
        let (gx, gy) = (cell.gx as i64, cell.gy as i64);
        let neighbors = [at(gx - 1, gy), at(gx + 1, gy), at(gx, gy - 1), at(gx, gy + 1)];
        let accepted: Vec<&CellDisplacement> =
            neighbors.into_iter().flatten().filter(|n| n.confidence > 0.0).collect();
        if !accepted.is_empty() {
            let n = accepted.len() as f64;
            cell.dx = accepted.iter().map(|c| c.dx).sum::<f64>() / n;
            cell.dy = accepted.iter().map(|c| c.dy).sum::<f64>() / n;
        }
    }
}

fn bilinear_sample(image: &crate::raster::GrayImage, mask: &crate::raster::Bitmap, x: f64, y: f64) -> Option<f64> {
    if x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let (w, h) = (image.width as i64, image.height as i64);
    if x0 < 0 || y0 < 0 || x0 + 1 >= w || y0 + 1 >= h {
        return None;
    }
    let (x0u, y0u) = (x0 as usize, y0 as usize);
    if !mask.get(x0u, y0u) || !mask.get(x0u + 1, y0u) || !mask.get(x0u, y0u + 1) || !mask.get(x0u + 1, y0u + 1) {
        return None;
    }
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let v00 = image.get(x0u, y0u) as f64;
    let v10 = image.get(x0u + 1, y0u) as f64;
    let v01 = image.get(x0u, y0u + 1) as f64;
    let v11 = image.get(x0u + 1, y0u + 1) as f64;
    Some(
        v00 * (1.0 - fx) * (1.0 - fy)
            + v10 * fx * (1.0 - fy)
            + v01 * (1.0 - fx) * fy
            + v11 * fx * fy,
    )
}

fn bilinear_sample_dt(dt: &Array2<f64>, x: f64, y: f64) -> f64 {
    let (h, w) = dt.dim();
    let xc = x.clamp(0.0, (w - 1) as f64);
    let yc = y.clamp(0.0, (h - 1) as f64);
    let x0 = xc.floor() as usize;
    let y0 = yc.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = xc - x0 as f64;
    let fy = yc - y0 as f64;
    dt[[y0, x0]] * (1.0 - fx) * (1.0 - fy)
        + dt[[y0, x1]] * fx * (1.0 - fy)
        + dt[[y1, x0]] * (1.0 - fx) * fy
        + dt[[y1, x1]] * fx * fy
}

/// Extract an integer-centered `size x size` window from a level,
/// returning `(values, valid)`; out-of-bounds samples are invalid.
fn extract_window(
    image: &crate::raster::GrayImage,
    mask: &crate::raster::Bitmap,
    cx: i64,
    cy: i64,
    size: usize,
) -> (Array2<f64>, Array2<bool>) {
    let half = (size / 2) as i64;
    let mut values = Array2::<f64>::zeros((size, size));
    let mut valid = Array2::<bool>::from_elem((size, size), false);
    for dy in 0..size {
        let y = cy - half + dy as i64;
        if y < 0 || y as usize >= image.height {
            continue;
        }
        for dx in 0..size {
            let x = cx - half + dx as i64;
            if x < 0 || x as usize >= image.width {
                continue;
            }
            let (xu, yu) = (x as usize, y as usize);
            if mask.get(xu, yu) {
                values[[dy, dx]] = image.get(xu, yu) as f64;
                valid[[dy, dx]] = true;
            }
        }
    }
    (values, valid)
}

/// Extract a bilinearly-sampled `size x size` window centered at a
/// possibly-fractional position.
fn extract_window_bilinear(
    image: &crate::raster::GrayImage,
    mask: &crate::raster::Bitmap,
    cx: f64,
    cy: f64,
    size: usize,
) -> (Array2<f64>, Array2<bool>) {
    let half = (size / 2) as f64;
    let mut values = Array2::<f64>::zeros((size, size));
    let mut valid = Array2::<bool>::from_elem((size, size), false);
    for dy in 0..size {
        let y = cy - half + dy as f64;
        for dx in 0..size {
            let x = cx - half + dx as f64;
            if let Some(v) = bilinear_sample(image, mask, x, y) {
                values[[dy, dx]] = v;
                valid[[dy, dx]] = true;
            }
        }
    }
    (values, valid)
}

/// Pre-whiten a window over its own valid-mask pixels: subtract the mean,
/// divide by the standard deviation. Returns `None` (degenerate) if the
/// standard deviation is below [`EPSILON`] or there are no valid pixels.
fn whiten(values: &Array2<f64>, valid: &Array2<bool>) -> Option<Array2<f64>> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (v, &ok) in values.iter().zip(valid.iter()) {
        if ok {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    let mean = sum / count as f64;
    let mut var = 0.0;
    for (v, &ok) in values.iter().zip(valid.iter()) {
        if ok {
            var += (v - mean) * (v - mean);
        }
    }
    let stdev = (var / count as f64).sqrt();
    if stdev < EPSILON as f64 {
        return None;
    }
    let mut out = Array2::<f64>::zeros(values.raw_dim());
    for ((v, &ok), o) in values.iter().zip(valid.iter()).zip(out.iter_mut()) {
        *o = if ok { (v - mean) / stdev } else { 0.0 };
    }
    Some(out)
}

fn embed_topleft(small: &Array2<f64>, big_size: usize) -> Array2<f64> {
    let (sh, sw) = small.dim();
    let mut out = Array2::<f64>::zeros((big_size, big_size));
    for r in 0..sh {
        for c in 0..sw {
            out[[r, c]] = small[[r, c]];
        }
    }
    out
}

fn bool_to_f64(valid: &Array2<bool>) -> Array2<f64> {
    valid.mapv(|b| if b { 1.0 } else { 0.0 })
}

/// The outcome of correlating a single cell.
struct CellOutcome {
    dx: f64,
    dy: f64,
    confidence: f64,
}

/// Correlate one cell: §4.C steps 1-7.
#[allow(clippy::too_many_arguments)]
fn correlate_cell(
    moving: &PyramidLevel,
    reference: &PyramidLevel,
    cell: &CellDisplacement,
    radius: usize,
    config: &CorrelationConfig,
    fft: &dyn Fft,
) -> CellOutcome {
    let p = config.patch_size;
    let search_size = p + 2 * radius;

    // Step 1: patch from the moving image, shifted by the accumulated
    // displacement so far (mirrors the coarse-to-fine residual pattern:
    // shift the moving content by the running estimate, then correlate
    // only the remaining residual within `radius`).
    let (patch_vals, patch_valid) =
        extract_window_bilinear(&moving.image, &moving.mask, cell.pos_x + cell.dx, cell.pos_y + cell.dy, p);

    // Step 2: search window from the reference, centered on the
    // un-shifted nominal grid position.
    let (search_vals, search_valid) = extract_window(
        &reference.image,
        &reference.mask,
        cell.pos_x.round() as i64,
        cell.pos_y.round() as i64,
        search_size,
    );

    // Step 3: pre-whiten both.
    let Some(patch_w) = whiten(&patch_vals, &patch_valid) else {
        return CellOutcome { dx: cell.dx, dy: cell.dy, confidence: 0.0 };
    };
    let Some(search_w) = whiten(&search_vals, &search_valid) else {
        return CellOutcome { dx: cell.dx, dy: cell.dy, confidence: 0.0 };
    };

    // Step 4: FFT-based cross-correlation, normalized by per-offset
    // valid-pixel counts derived from mask autocorrelation.
    let patch_padded = embed_topleft(&patch_w, search_size);
    let patch_mask_padded = embed_topleft(&bool_to_f64(&patch_valid), search_size);

    let fa = fft.forward2d(&patch_padded);
    let fb = fft.forward2d(&search_w);
    // Conjugate the patch side so the correlation is `sum_n patch[n] *
    // search[n + m]`: the patch sits at the top-left of the padded window
    // and the peak for an in-range displacement then falls at offset
    // index `m = radius`, inside the `[0, 2*radius]` window read below.
    let cross: Array2<Complex<f64>> = Array2::from_shape_fn(fa.raw_dim(), |idx| fa[idx].conj() * fb[idx]);
    let raw_corr = fft.inverse2d(&cross);

    let fma = fft.forward2d(&patch_mask_padded);
    let fmb = fft.forward2d(&bool_to_f64(&search_valid));
    let cross_mask: Array2<Complex<f64>> =
        Array2::from_shape_fn(fma.raw_dim(), |idx| fma[idx].conj() * fmb[idx]);
    let counts = fft.inverse2d(&cross_mask);

    // Step 5: restrict to offsets within `radius` of the seed and with
    // sufficient valid-pixel support. Offset index `o` (0..=2r) maps to
    // signed shift `o - radius`; this range is exactly the non-wrapped
    // span of the correlation (search_size - p == 2*radius).
    let min_count = config.valid_fraction * (p * p) as f64;
    let span = 2 * radius + 1;
    let mut surface = Array2::<f64>::from_elem((span, span), f64::NEG_INFINITY);
    for oy in 0..span {
        for ox in 0..span {
            let count = counts[[oy, ox]].max(0.0);
            if count >= min_count {
                surface[[oy, ox]] = raw_corr[[oy, ox]] / count;
            }
        }
    }

    // Step 6: pick the maximum, then refine to sub-pixel via a separable
    // quadratic fit to the 3x3 neighborhood.
    let mut peak_val = f64::NEG_INFINITY;
    let mut peak_oy = 0usize;
    let mut peak_ox = 0usize;
    for oy in 0..span {
        for ox in 0..span {
            if surface[[oy, ox]] > peak_val {
                peak_val = surface[[oy, ox]];
                peak_oy = oy;
                peak_ox = ox;
            }
        }
    }
    if !peak_val.is_finite() {
        return CellOutcome { dx: cell.dx, dy: cell.dy, confidence: 0.0 };
    }

    let mut second_val = f64::NEG_INFINITY;
    for oy in 0..span {
        for ox in 0..span {
            if oy.abs_diff(peak_oy) <= 1 && ox.abs_diff(peak_ox) <= 1 {
                continue;
            }
            if surface[[oy, ox]].is_finite() && surface[[oy, ox]] > second_val {
                second_val = surface[[oy, ox]];
            }
        }
    }

    let (sub_dy, sub_dx) = refine_peak_paraboloid(&surface, peak_oy, peak_ox);
    let dx = (peak_ox as f64 - radius as f64) + sub_dx;
    let dy = (peak_oy as f64 - radius as f64) + sub_dy;

    // Step 7: accept/reject gates.
    let ratio_ok = if second_val.is_finite() && second_val > 0.0 {
        peak_val / second_val > config.min_ratio
    } else {
        true
    };

    // The DT floor depends on the level's pixel pitch, which the caller
    // (`run_level`) applies once it knows the level; here we only gate on
    // correlation strength and peak sharpness.
    if peak_val > config.min_corr && ratio_ok {
        CellOutcome {
            dx: cell.dx + dx,
            dy: cell.dy + dy,
            confidence: peak_val.clamp(0.0, 1.0),
        }
    } else {
        CellOutcome { dx: cell.dx, dy: cell.dy, confidence: 0.0 }
    }
}

/// Run one pyramid level's worth of correlation over every cell,
/// parallelizing over cells with Rayon above [`PARALLEL_CELL_THRESHOLD`],
/// then apply the final DT gate (needs the level's pixel pitch) and the
/// one-step Laplacian fill for rejected cells.
fn run_level(
    moving: &PyramidLevel,
    reference: &PyramidLevel,
    reference_dt: &Array2<f64>,
    field: &DisplacementField,
    radius: usize,
    config: &CorrelationConfig,
    fft: &dyn Fft,
) -> DisplacementField {
    let pitch = (1u64 << field.level) as f64;
    let run_one = |cell: &CellDisplacement| -> CellDisplacement {
        let outcome = correlate_cell(moving, reference, cell, radius, config, fft);
        let mut confidence = outcome.confidence;
        if confidence > 0.0 {
            let chosen_x = cell.pos_x + outcome.dx;
            let chosen_y = cell.pos_y + outcome.dy;
            let dt_here = bilinear_sample_dt(reference_dt, chosen_x, chosen_y);
            if dt_here < config.dt_min * pitch {
                confidence = 0.0;
            }
        }
        CellDisplacement {
            gx: cell.gx,
            gy: cell.gy,
            pos_x: cell.pos_x,
            pos_y: cell.pos_y,
            dx: if confidence > 0.0 { outcome.dx } else { cell.dx },
            dy: if confidence > 0.0 { outcome.dy } else { cell.dy },
            confidence,
        }
    };

    let cells: Vec<CellDisplacement> = if field.cells.len() >= PARALLEL_CELL_THRESHOLD {
        field.cells.par_iter().map(run_one).collect()
    } else {
        field.cells.iter().map(run_one).collect()
    };

    let mut out = DisplacementField { level: field.level, grid_w: field.grid_w, grid_h: field.grid_h, cells };
    laplacian_fill(&mut out);
    out
}

/// Run the full coarse-to-fine correspondence pipeline (§4.C) from the
/// coarsest available level of `moving_pyramid`/`reference_pyramid` down
/// to `target_level`, returning the sparse displacement field at
/// `target_level`.
///
/// `reference_dts[k]` must be the distance transform of
/// `reference_pyramid[k].mask` (component B's output). Fails the whole
/// pair with [`AlignError::Degenerate`] if the accepted fraction drops
/// below `config.min_accept` at any level.
pub fn run_correspondence(
    moving_pyramid: &[PyramidLevel],
    reference_pyramid: &[PyramidLevel],
    reference_dts: &[Array2<f64>],
    target_level: usize,
    radius_schedule: &[usize],
    config: &CorrelationConfig,
    fft: &dyn Fft,
) -> Result<DisplacementField> {
    let coarsest = moving_pyramid.len().min(reference_pyramid.len()).saturating_sub(1);
    if coarsest < target_level {
        return Err(AlignError::Degenerate(
            "target level coarser than available pyramid levels".into(),
        ));
    }

    let coarsest_level = &reference_pyramid[coarsest];
    let mut field = seed_grid(coarsest, coarsest_level.image.width, coarsest_level.image.height, config.grid_stride);

    let radius_at = |level: usize| -> usize {
        radius_schedule.get(level).copied().unwrap_or_else(|| radius_schedule.last().copied().unwrap_or(4))
    };

    let mut level = coarsest;
    loop {
        let radius = radius_at(level);
        field = run_level(
            &moving_pyramid[level],
            &reference_pyramid[level],
            &reference_dts[level],
            &field,
            radius,
            config,
            fft,
        );

        let accepted = field.fraction_accepted();
        if accepted < config.min_accept {
            return Err(AlignError::Degenerate(format!(
                "level {level}: only {:.1}% of cells accepted (< {:.1}% required)",
                accepted * 100.0,
                config.min_accept * 100.0
            )));
        }

        if level == target_level {
            break;
        }
        field = double_for_finer_level(&field);
        level -= 1;
    }

    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::CpuFft;
    use crate::raster::{Bitmap, GrayImage};

    fn noise_image(w: usize, h: usize, seed: u64) -> GrayImage {
        let mut img = GrayImage::new(w, h);
        let mut state = seed.wrapping_mul(2862933555777941757).wrapping_add(1);
        for y in 0..h {
            for x in 0..w {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                img.set(x, y, ((state >> 56) & 0xFF) as u8);
            }
        }
        img
    }

    #[test]
    fn identical_images_recover_zero_displacement() {
        let img = noise_image(256, 256, 42);
        let mask = Bitmap::all_valid(256, 256);
        let moving = vec![PyramidLevel { image: img.clone(), mask: mask.clone() }];
        let reference = vec![PyramidLevel { image: img, mask: mask.clone() }];
        let dt = crate::dt::distance_transform(&mask);

        let config = CorrelationConfig {
            patch_size: 32,
            grid_stride: 64,
            ..CorrelationConfig::default()
        };
        let fft = CpuFft;
        let field =
            run_correspondence(&moving, &reference, &[dt], 0, &[8], &config, &fft).unwrap();

        for cell in &field.cells {
            assert!(cell.confidence > 0.0, "cell ({},{}) rejected", cell.gx, cell.gy);
            assert!(cell.dx.abs() < 0.5, "dx {} too large", cell.dx);
            assert!(cell.dy.abs() < 0.5, "dy {} too large", cell.dy);
        }
    }

    #[test]
    fn fully_masked_reference_is_degenerate() {
        let img = noise_image(128, 128, 7);
        let valid_mask = Bitmap::all_valid(128, 128);
        let empty_mask = Bitmap::all_invalid(128, 128);
        let moving = vec![PyramidLevel { image: img.clone(), mask: valid_mask.clone() }];
        let reference = vec![PyramidLevel { image: img, mask: empty_mask.clone() }];
        let dt = crate::dt::distance_transform(&empty_mask);

        let config = CorrelationConfig::default();
        let fft = CpuFft;
        let result = run_correspondence(&moving, &reference, &[dt], 0, &[4], &config, &fft);
        assert!(result.is_err());
    }
}
