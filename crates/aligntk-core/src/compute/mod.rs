//! The FFT dependency injected into the correspondence engine (4.C step
//! 4, Design Note 9). Kept behind a small trait so any implementation —
//! the `rustfft`-backed default, or a pure fallback for tests — can
//! stand in.

pub mod cpu;
pub mod radix2;

use ndarray::Array2;
use num_complex::Complex;

/// A 2-D real-to-complex / complex-to-real FFT backend.
///
/// Named after the `planR2C`/`planC2R`/`execute` native-FFT seam this
/// replaces: `forward2d` plans-and-executes a real-to-complex transform,
/// `inverse2d` plans-and-executes the matching complex-to-real inverse
/// (real part only, normalized by `1/(h*w)`).
pub trait Fft: Send + Sync {
    fn forward2d(&self, data: &Array2<f64>) -> Array2<Complex<f64>>;
    fn inverse2d(&self, data: &Array2<Complex<f64>>) -> Array2<f64>;
}

pub use cpu::CpuFft;
