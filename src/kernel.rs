//! Transform and vector-math services used by the framer. The state machine only talks to the
//! `NumericKernel` trait, so a different FFT or SIMD backend can be dropped in.

use num::{Complex, Zero};
use rustfft::{FFTplanner, FFT};
use std::sync::Arc;

pub trait NumericKernel {
    /// Transform length
    fn len(&self) -> usize;

    /// Unnormalized forward DFT, X[k] = sum_n x[n] e^{-j 2 pi k n / M}. `input` may be used as
    /// scratch.
    fn forward(&self, input: &mut [Complex<f32>], output: &mut [Complex<f32>]);

    /// Unnormalized inverse DFT, x[n] = sum_k X[k] e^{+j 2 pi k n / M}
    fn inverse(&self, input: &mut [Complex<f32>], output: &mut [Complex<f32>]);

    /// sum_k conj(a[k]) b[k]
    fn dot_conj(&self, a: &[Complex<f32>], b: &[Complex<f32>]) -> Complex<f32> {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.conj() * y)
            .fold(Complex::<f32>::zero(), |acc, v| acc + v)
    }

    /// sum_k |a[k]|^2
    fn energy(&self, a: &[Complex<f32>]) -> f32 {
        a.iter().map(|x| x.norm_sqr()).sum()
    }
}

/// `NumericKernel` on top of rustfft. The plans are created once and owned by the instance.
pub struct RustFftKernel {
    fft: Arc<dyn FFT<f32>>,
    ifft: Arc<dyn FFT<f32>>,
    len: usize,
}

impl RustFftKernel {
    pub fn new(len: usize) -> Self {
        let fft = FFTplanner::<f32>::new(false).plan_fft(len);
        let ifft = FFTplanner::<f32>::new(true).plan_fft(len);
        Self { fft, ifft, len }
    }
}

impl NumericKernel for RustFftKernel {
    fn len(&self) -> usize {
        self.len
    }

    fn forward(&self, input: &mut [Complex<f32>], output: &mut [Complex<f32>]) {
        self.fft.process(input, output);
    }

    fn inverse(&self, input: &mut [Complex<f32>], output: &mut [Complex<f32>]) {
        self.ifft.process(input, output);
    }
}
