//! A pure fallback FFT implementation with no external FFT dependency,
//! satisfying Design Note 9 ("any implementation satisfying \[the
//! `Fft` trait\], including a pure-target-language radix-2 fallback for
//! tests, must suffice"). Requires power-of-two dimensions; callers
//! outside tests should prefer [`super::CpuFft`], which has no such
//! restriction.

use ndarray::Array2;
use num_complex::Complex;

use super::Fft;

#[derive(Default)]
pub struct Radix2Fft;

impl Fft for Radix2Fft {
    fn forward2d(&self, data: &Array2<f64>) -> Array2<Complex<f64>> {
        let mut buf = data.mapv(|v| Complex::new(v, 0.0));
        transform_rows_cols(&mut buf, false);
        buf
    }

    fn inverse2d(&self, data: &Array2<Complex<f64>>) -> Array2<f64> {
        let (h, w) = data.dim();
        let mut buf = data.clone();
        transform_rows_cols(&mut buf, true);
        let scale = 1.0 / (h * w) as f64;
        buf.mapv(|v| v.re * scale)
    }
}

fn transform_rows_cols(buf: &mut Array2<Complex<f64>>, inverse: bool) {
    let (h, w) = buf.dim();
    assert!(w.is_power_of_two(), "Radix2Fft requires power-of-two width, got {w}");
    assert!(h.is_power_of_two(), "Radix2Fft requires power-of-two height, got {h}");

    for r in 0..h {
        let mut row: Vec<Complex<f64>> = (0..w).map(|c| buf[[r, c]]).collect();
        radix2_1d(&mut row, inverse);
        for (c, v) in row.into_iter().enumerate() {
            buf[[r, c]] = v;
        }
    }
    for c in 0..w {
        let mut col: Vec<Complex<f64>> = (0..h).map(|r| buf[[r, c]]).collect();
        radix2_1d(&mut col, inverse);
        for (r, v) in col.into_iter().enumerate() {
            buf[[r, c]] = v;
        }
    }
}

/// In-place iterative Cooley-Tukey radix-2 DIT FFT.
fn radix2_1d(data: &mut [Complex<f64>], inverse: bool) {
    let n = data.len();
    if n <= 1 {
        return;
    }

    // Bit-reversal permutation.
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = reverse_bits(i as u32, bits) as usize;
        if j > i {
            data.swap(i, j);
        }
    }

    let sign = if inverse { 1.0 } else { -1.0 };
    let mut size = 2usize;
    while size <= n {
        let half = size / 2;
        let angle_step = sign * std::f64::consts::TAU / size as f64;
        let w_step = Complex::new(angle_step.cos(), angle_step.sin());
        let mut start = 0;
        while start < n {
            let mut w = Complex::new(1.0, 0.0);
            for k in 0..half {
                let even = data[start + k];
                let odd = data[start + k + half] * w;
                data[start + k] = even + odd;
                data[start + k + half] = even - odd;
                w *= w_step;
            }
            start += size;
        }
        size *= 2;
    }
}

fn reverse_bits(mut x: u32, bits: u32) -> u32 {
    let mut out = 0u32;
    for _ in 0..bits {
        out = (out << 1) | (x & 1);
        x >>= 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_power_of_two() {
        let data = Array2::from_shape_fn((8, 8), |(r, c)| ((r * 3 + c) % 7) as f64);
        let fft = Radix2Fft;
        let freq = fft.forward2d(&data);
        let back = fft.inverse2d(&freq);
        for r in 0..8 {
            for c in 0..8 {
                assert!((back[[r, c]] - data[[r, c]]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn agrees_with_cpu_fft() {
        use super::super::CpuFft;
        let data = Array2::from_shape_fn((16, 8), |(r, c)| ((r + 2 * c) % 11) as f64);
        let a = Radix2Fft.forward2d(&data);
        let b = CpuFft.forward2d(&data);
        for r in 0..16 {
            for c in 0..8 {
                assert!((a[[r, c]] - b[[r, c]]).norm() < 1e-6);
            }
        }
    }
}
