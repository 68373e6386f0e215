//! Component D: fitting a dense per-image [`Map`] from a sparse
//! [`DisplacementField`] (§4.D).
//!
//! Two stages: an IRLS Huber-weighted rigid or affine fit absorbs the bulk
//! translation/rotation/scale, then the residuals at accepted cells are
//! spread over the full grid with a biharmonic interpolant (iterative
//! relaxation on the 13-point discrete biharmonic stencil) instead of a
//! plain bilinear lookup, so the fill stays smoothness-regularized even
//! across sparse or clustered rejections.

use ndarray::Array2;

use crate::consts::{DEFAULT_HUBER_DELTA, DEFAULT_MAX_ITERATIONS, DEFAULT_SMOOTHNESS_LAMBDA, EPSILON};
use crate::correspond::{CellDisplacement, DisplacementField};
use crate::error::{AlignError, Result};
use crate::map::{Map, MapVertex};

/// Which parametric family absorbs the bulk motion before residual
/// interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransformKind {
    /// Rotation + translation only (uniform scale pinned to 1).
    Rigid,
    /// Full 6-parameter affine.
    Affine,
}

/// Tunables for the local-map solve.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LocalMapConfig {
    pub transform_kind: TransformKind,
    pub huber_delta: f64,
    pub irls_iterations: usize,
    pub smoothness_lambda: f64,
    pub biharmonic_iterations: usize,
    pub biharmonic_tolerance: f64,
}

impl Default for LocalMapConfig {
    fn default() -> Self {
        Self {
            transform_kind: TransformKind::Rigid,
            huber_delta: DEFAULT_HUBER_DELTA,
            irls_iterations: 8,
            smoothness_lambda: DEFAULT_SMOOTHNESS_LAMBDA,
            biharmonic_iterations: DEFAULT_MAX_ITERATIONS,
            biharmonic_tolerance: 1e-4,
        }
    }
}

/// A fitted 2-D similarity/affine transform, `x' = a*x + b*y + tx`,
/// `y' = c*x + d*y + ty`.
#[derive(Clone, Copy, Debug)]
pub struct FittedTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl FittedTransform {
    pub fn identity() -> Self {
        Self { a: 1.0, b: 0.0, c: 0.0, d: 1.0, tx: 0.0, ty: 0.0 }
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.a * x + self.b * y + self.tx, self.c * x + self.d * y + self.ty)
    }
}

/// IRLS Huber-weighted fit of `transform_kind` against the accepted cells
/// in `field`, mapping each cell's nominal grid position to its
/// reference-frame position (`pos + displacement`).
pub fn fit_transform(field: &DisplacementField, config: &LocalMapConfig) -> Result<FittedTransform> {
    let accepted: Vec<&CellDisplacement> = field.cells.iter().filter(|c| c.confidence > 0.0).collect();
    if accepted.len() < 3 {
        return Err(AlignError::Degenerate(format!(
            "only {} accepted cells, need at least 3 to fit a transform",
            accepted.len()
        )));
    }

    let mut weights = vec![1.0; accepted.len()];
    let mut transform = FittedTransform::identity();

    for _ in 0..config.irls_iterations {
        transform = match config.transform_kind {
            TransformKind::Affine => weighted_least_squares_affine(&accepted, &weights)?,
            TransformKind::Rigid => weighted_least_squares_rigid(&accepted, &weights)?,
        };

        for (cell, w) in accepted.iter().zip(weights.iter_mut()) {
            let (px, py) = transform.apply(cell.pos_x, cell.pos_y);
            let (tx, ty) = (cell.pos_x + cell.dx, cell.pos_y + cell.dy);
            let residual = ((tx - px).powi(2) + (ty - py).powi(2)).sqrt();
            *w = if residual <= config.huber_delta {
                1.0
            } else {
                config.huber_delta / residual.max(EPSILON as f64)
            };
        }
    }

    Ok(transform)
}

/// Weighted least squares for the full 6-parameter affine model. Builds
/// the two independent 3x3 normal-equation systems (one per output
/// coordinate) and solves each via Gaussian elimination.
fn weighted_least_squares_affine(cells: &[&CellDisplacement], weights: &[f64]) -> Result<FittedTransform> {
    // Design row [x, y, 1] for both x' and y', solved independently.
    let mut ata = [[0.0f64; 3]; 3];
    let mut atb_x = [0.0f64; 3];
    let mut atb_y = [0.0f64; 3];

    for (cell, &w) in cells.iter().zip(weights.iter()) {
        let row = [cell.pos_x, cell.pos_y, 1.0];
        let target_x = cell.pos_x + cell.dx;
        let target_y = cell.pos_y + cell.dy;
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += w * row[i] * row[j];
            }
            atb_x[i] += w * row[i] * target_x;
            atb_y[i] += w * row[i] * target_y;
        }
    }

    let mat: Vec<Vec<f64>> = ata.iter().map(|r| r.to_vec()).collect();
    let x = solve_linear_system(mat.clone(), atb_x.to_vec())?;
    let y = solve_linear_system(mat, atb_y.to_vec())?;

    Ok(FittedTransform { a: x[0], b: x[1], tx: x[2], c: y[0], d: y[1], ty: y[2] })
}

/// Weighted least squares for a rigid (rotation + translation, scale
/// pinned to 1) model. Fits an unconstrained similarity transform
/// `(a, b, tx, ty)` with `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`,
/// then projects `(a, b)` back onto the unit circle to remove scale.
fn weighted_least_squares_rigid(cells: &[&CellDisplacement], weights: &[f64]) -> Result<FittedTransform> {
    // Linear in (a, b, tx, ty): for each cell, two rows share the same
    // (a, b, tx, ty) unknowns:
    //   x' = a*x - b*y + tx
    //   y' = b*x + a*y + ty
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for (cell, &w) in cells.iter().zip(weights.iter()) {
        let (x, y) = (cell.pos_x, cell.pos_y);
        let target_x = x + cell.dx;
        let target_y = y + cell.dy;

        let row_x = [x, -y, 1.0, 0.0];
        let row_y = [y, x, 0.0, 1.0];

        for i in 0..4 {
            for j in 0..4 {
                ata[i][j] += w * (row_x[i] * row_x[j] + row_y[i] * row_y[j]);
            }
            atb[i] += w * (row_x[i] * target_x + row_y[i] * target_y);
        }
    }

    let mat: Vec<Vec<f64>> = ata.iter().map(|r| r.to_vec()).collect();
    let sol = solve_linear_system(mat, atb.to_vec())?;
    let (a_raw, b_raw, tx, ty) = (sol[0], sol[1], sol[2], sol[3]);
    let scale = (a_raw * a_raw + b_raw * b_raw).sqrt().max(EPSILON as f64);
    let (a, b) = (a_raw / scale, b_raw / scale);

    Ok(FittedTransform { a, b: -b, c: b, d: a, tx, ty })
}

/// Gaussian elimination with partial pivoting for a small dense `n x n`
/// system. `n` is at most 4 here (affine/rigid normal equations), so no
/// external linear-algebra crate is warranted.
fn solve_linear_system(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().partial_cmp(&a[j][col].abs()).unwrap())
            .unwrap();
        if a[pivot][col].abs() < EPSILON as f64 {
            return Err(AlignError::Degenerate(
                "singular normal-equation matrix in transform fit".into(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        let diag = a[col][col];
        for row in (col + 1)..n {
            let factor = a[row][col] / diag;
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

/// Spread per-cell transform residuals (actual minus fitted-transform
/// displacement, at accepted cells only) over the full `grid_w x grid_h`
/// grid by relaxing the discrete biharmonic equation (`laplacian^2 = 0`)
/// with the accepted residuals pinned as Dirichlet data. Distance-2
/// samples that fall past the border clamp to the edge.
fn interpolate_residuals(
    grid_w: usize,
    grid_h: usize,
    pinned: &[(usize, usize, f64, f64)], // (gx, gy, res_x, res_y)
    config: &LocalMapConfig,
) -> (Array2<f64>, Array2<f64>) {
    let mut rx = Array2::<f64>::zeros((grid_h, grid_w));
    let mut ry = Array2::<f64>::zeros((grid_h, grid_w));
    let mut is_pinned = Array2::<bool>::from_elem((grid_h, grid_w), false);
    for &(gx, gy, vx, vy) in pinned {
        rx[[gy, gx]] = vx;
        ry[[gy, gx]] = vy;
        is_pinned[[gy, gx]] = true;
    }

    let clamp = |v: i64, max: usize| -> usize { v.clamp(0, max as i64 - 1) as usize };
    let at = |field: &Array2<f64>, gx: i64, gy: i64| -> f64 {
        field[[clamp(gy, grid_h), clamp(gx, grid_w)]]
    };

    for _ in 0..config.biharmonic_iterations {
        let mut max_delta = 0.0f64;
        for field in [&mut rx, &mut ry] {
            let snapshot = field.clone();
            for gy in 0..grid_h {
                for gx in 0..grid_w {
                    if is_pinned[[gy, gx]] {
                        continue;
                    }
                    let (x, y) = (gx as i64, gy as i64);
                    let dist1 = at(&snapshot, x - 1, y)
                        + at(&snapshot, x + 1, y)
                        + at(&snapshot, x, y - 1)
                        + at(&snapshot, x, y + 1);
                    let diag = at(&snapshot, x - 1, y - 1)
                        + at(&snapshot, x + 1, y - 1)
                        + at(&snapshot, x - 1, y + 1)
                        + at(&snapshot, x + 1, y + 1);
                    let dist2 = at(&snapshot, x - 2, y)
                        + at(&snapshot, x + 2, y)
                        + at(&snapshot, x, y - 2)
                        + at(&snapshot, x, y + 2);
                    let updated = (8.0 * dist1 - 2.0 * diag - dist2) / 20.0;
                    let damped = snapshot[[gy, gx]]
                        + config.smoothness_lambda.clamp(0.0, 1.0) * (updated - snapshot[[gy, gx]]);
                    max_delta = max_delta.max((damped - snapshot[[gy, gx]]).abs());
                    field[[gy, gx]] = damped;
                }
            }
        }
        if max_delta < config.biharmonic_tolerance {
            break;
        }
    }

    (rx, ry)
}

/// Fit a dense [`Map`] at `field.level` from a sparse [`DisplacementField`]:
/// absorb the bulk motion with [`fit_transform`], then fill the residual
/// at every grid vertex with [`interpolate_residuals`].
pub fn solve_local_map(
    field: &DisplacementField,
    image_name: impl Into<String>,
    reference_name: impl Into<String>,
    config: &LocalMapConfig,
) -> Result<Map> {
    let transform = fit_transform(field, config)?;

    let pinned: Vec<(usize, usize, f64, f64)> = field
        .cells
        .iter()
        .filter(|c| c.confidence > 0.0)
        .map(|c| {
            let (px, py) = transform.apply(c.pos_x, c.pos_y);
            let (tx, ty) = (c.pos_x + c.dx, c.pos_y + c.dy);
            (c.gx, c.gy, tx - px, ty - py)
        })
        .collect();

    let (res_x, res_y) = interpolate_residuals(field.grid_w, field.grid_h, &pinned, config);

    let mut map = Map::new(field.level, field.grid_w, field.grid_h, 0.0, 0.0, image_name, reference_name);
    for gy in 0..field.grid_h {
        for gx in 0..field.grid_w {
            let cell = field.cell(gx, gy);
            let (px, py) = transform.apply(cell.pos_x, cell.pos_y);
            let x = px + res_x[[gy, gx]];
            let y = py + res_y[[gy, gx]];
            map.set_vertex(gx, gy, MapVertex { x: x as f32, y: y as f32, c: cell.confidence as f32 });
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_with(cells: Vec<CellDisplacement>, grid_w: usize, grid_h: usize) -> DisplacementField {
        DisplacementField { level: 0, grid_w, grid_h, cells }
    }

    #[test]
    fn rigid_fit_recovers_pure_translation() {
        let mut cells = Vec::new();
        for gy in 0..3 {
            for gx in 0..3 {
                cells.push(CellDisplacement {
                    gx,
                    gy,
                    pos_x: (gx * 10) as f64,
                    pos_y: (gy * 10) as f64,
                    dx: 5.0,
                    dy: -3.0,
                    confidence: 1.0,
                });
            }
        }
        let field = field_with(cells, 3, 3);
        let config = LocalMapConfig { transform_kind: TransformKind::Rigid, ..LocalMapConfig::default() };
        let transform = fit_transform(&field, &config).unwrap();
        assert!((transform.tx - 5.0).abs() < 1e-6);
        assert!((transform.ty - (-3.0)).abs() < 1e-6);
        assert!((transform.a - 1.0).abs() < 1e-6);
        assert!(transform.b.abs() < 1e-6);
    }

    #[test]
    fn affine_fit_recovers_scale() {
        let mut cells = Vec::new();
        for gy in 0..3 {
            for gx in 0..3 {
                let (x, y) = ((gx * 10) as f64, (gy * 10) as f64);
                cells.push(CellDisplacement {
                    gx,
                    gy,
                    pos_x: x,
                    pos_y: y,
                    dx: 0.5 * x, // scale of 1.5 in x
                    dy: 0.0,
                    confidence: 1.0,
                });
            }
        }
        let field = field_with(cells, 3, 3);
        let config = LocalMapConfig { transform_kind: TransformKind::Affine, ..LocalMapConfig::default() };
        let transform = fit_transform(&field, &config).unwrap();
        assert!((transform.a - 1.5).abs() < 1e-6);
        assert!((transform.d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn too_few_accepted_cells_is_degenerate() {
        let cells = vec![CellDisplacement {
            gx: 0,
            gy: 0,
            pos_x: 0.0,
            pos_y: 0.0,
            dx: 0.0,
            dy: 0.0,
            confidence: 1.0,
        }];
        let field = field_with(cells, 1, 1);
        let result = fit_transform(&field, &LocalMapConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn residual_interpolation_matches_pinned_values() {
        let pinned = vec![(0, 0, 2.0, -1.0), (3, 3, 4.0, 1.0)];
        let config = LocalMapConfig { biharmonic_iterations: 200, ..LocalMapConfig::default() };
        let (rx, ry) = interpolate_residuals(4, 4, &pinned, &config);
        assert!((rx[[0, 0]] - 2.0).abs() < 1e-9);
        assert!((ry[[0, 0]] - (-1.0)).abs() < 1e-9);
        assert!((rx[[3, 3]] - 4.0).abs() < 1e-9);
    }
}
