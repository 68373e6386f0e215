//! Sub-pixel peak refinement shared by the correspondence engine (§4.C).

use ndarray::Array2;

/// Refine a peak location using separable parabola fits on the 3x3
/// neighborhood. Returns `(delta_row, delta_col)` as fractional offsets
/// from the integer peak, each clamped to `[-0.5, 0.5]`.
pub fn refine_peak_paraboloid(
    surface: &Array2<f64>,
    peak_row: usize,
    peak_col: usize,
) -> (f64, f64) {
    let (h, w) = surface.dim();

    if peak_row == 0 || peak_row >= h - 1 || peak_col == 0 || peak_col >= w - 1 {
        return (0.0, 0.0);
    }

    let y_prev = surface[[peak_row - 1, peak_col]];
    let y_curr = surface[[peak_row, peak_col]];
    let y_next = surface[[peak_row + 1, peak_col]];
    let x_prev = surface[[peak_row, peak_col - 1]];
    let x_curr = surface[[peak_row, peak_col]];
    let x_next = surface[[peak_row, peak_col + 1]];

    if ![y_prev, y_curr, y_next, x_prev, x_curr, x_next]
        .iter()
        .all(|v| v.is_finite())
    {
        return (0.0, 0.0);
    }

    let delta_row = if (y_prev - 2.0 * y_curr + y_next).abs() > 1e-12 {
        (y_prev - y_next) / (2.0 * (y_prev - 2.0 * y_curr + y_next))
    } else {
        0.0
    };

    let delta_col = if (x_prev - 2.0 * x_curr + x_next).abs() > 1e-12 {
        (x_prev - x_next) / (2.0 * (x_prev - 2.0 * x_curr + x_next))
    } else {
        0.0
    };

    (delta_row.clamp(-0.5, 0.5), delta_col.clamp(-0.5, 0.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_peak_refines_to_zero() {
        let surface = Array2::from_shape_vec((3, 3), vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]).unwrap();
        let (dr, dc) = refine_peak_paraboloid(&surface, 1, 1);
        assert!(dr.abs() < 1e-9);
        assert!(dc.abs() < 1e-9);
    }

    #[test]
    fn edge_peak_returns_zero() {
        let surface = Array2::from_shape_vec((3, 3), vec![1.0; 9]).unwrap();
        let (dr, dc) = refine_peak_paraboloid(&surface, 0, 1);
        assert_eq!((dr, dc), (0.0, 0.0));
    }

    #[test]
    fn neighbor_masked_to_neg_infinity_returns_zero_instead_of_nan() {
        let surface =
            Array2::from_shape_vec((3, 3), vec![1.0, 2.0, 1.0, f64::NEG_INFINITY, 4.0, 2.0, 1.0, 2.0, 1.0]).unwrap();
        let (dr, dc) = refine_peak_paraboloid(&surface, 1, 1);
        assert_eq!((dr, dc), (0.0, 0.0));
    }
}
