//! Transmit side. A frame on every transmit stream looks like
//!
//! `[CP S0] [CP S1_0] ... [CP S1_{A-1}] [gap] [CP X_0] ... [CP X_{K-1}]`
//!
//! S0 goes out on every stream. Long symbol `a` is sent by stream `a % num_streams` alone while
//! the others stay silent, so the receiver can measure each transmit antenna separately.

use crate::config::FramingConfig;
use crate::error::FramingError;
use crate::kernel::{NumericKernel, RustFftKernel};
use crate::matrix;
use crate::msequence::SequenceSource;
use crate::subcarrier::{SubcarrierMap, SubcarrierType};
use crate::training::Preamble;
use ndarray::Array3;
use num::{Complex, Zero};
use std::fmt;

/// Value carried by every pilot subcarrier
pub const PILOT: Complex<f32> = Complex { re: 1., im: 0. };

pub struct FrameGen<K = RustFftKernel> {
    config: FramingConfig,
    map: SubcarrierMap,
    preamble: Preamble,
    /// Precoder, shape (tx, stream, data subcarrier)
    w: Array3<Complex<f32>>,
    kernel: K,
    /// Frequency-domain scratch
    freq: Vec<Complex<f32>>,
    /// Time-domain scratch
    time: Vec<Complex<f32>>,
}

impl FrameGen<RustFftKernel> {
    pub fn new<S: SequenceSource>(
        config: &FramingConfig,
        ms_s0: S,
        ms_s1: Vec<S>,
    ) -> Result<Self, FramingError> {
        Self::with_kernel(config, ms_s0, ms_s1, RustFftKernel::new(config.subcarriers))
    }
}

impl<K: NumericKernel> FrameGen<K> {
    pub fn with_kernel<S: SequenceSource>(
        config: &FramingConfig,
        ms_s0: S,
        ms_s1: Vec<S>,
        kernel: K,
    ) -> Result<Self, FramingError> {
        config.validate()?;
        let map = config.subcarrier_map()?;
        let preamble = Preamble::generate(&map, config.num_access_codes, ms_s0, ms_s1, &kernel)?;
        let m = config.subcarriers;
        Ok(Self {
            w: matrix::identity_stack(config.num_streams, map.num_data()),
            config: config.clone(),
            map,
            preamble,
            kernel,
            freq: vec![Complex::zero(); m],
            time: vec![Complex::zero(); m],
        })
    }

    pub fn num_streams(&self) -> usize {
        self.config.num_streams
    }

    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    pub fn subcarrier_map(&self) -> &SubcarrierMap {
        &self.map
    }

    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    fn check_buffers(&self, tx: &[Vec<Complex<f32>>]) -> Result<(), FramingError> {
        if tx.len() != self.config.num_streams {
            return Err(FramingError::BufferCount {
                expected: self.config.num_streams,
                got: tx.len(),
            });
        }
        Ok(())
    }

    /// Append `symbol` with its cyclic prefix
    fn push_symbol(&self, symbol: &[Complex<f32>], out: &mut Vec<Complex<f32>>) {
        let m = symbol.len();
        out.extend(&symbol[m - self.config.cp_len..]);
        out.extend(symbol);
    }

    /// Append the preamble (S0 and every long symbol, each cyclic-prefixed) to every stream.
    /// Returns the number of samples written per stream.
    pub fn write_sync_words(&mut self, tx: &mut [Vec<Complex<f32>>]) -> Result<usize, FramingError> {
        self.check_buffers(tx)?;
        let silence = vec![Complex::zero(); self.config.subcarriers];
        for (stream, out) in tx.iter_mut().enumerate() {
            self.push_symbol(&self.preamble.s0.time, out);
            for (a, s1) in self.preamble.s1.iter().enumerate() {
                if a % self.config.num_streams == stream {
                    self.push_symbol(&s1.time, out);
                } else {
                    self.push_symbol(&silence, out);
                }
            }
        }
        Ok(self.config.preamble_len())
    }

    /// Append the silence between preamble and payload
    pub fn write_gap(&mut self, tx: &mut [Vec<Complex<f32>>]) -> Result<usize, FramingError> {
        self.check_buffers(tx)?;
        for out in tx.iter_mut() {
            out.extend(std::iter::repeat(Complex::zero()).take(self.config.gap_len));
        }
        Ok(self.config.gap_len)
    }

    /// Replace the precoder. Shape must be (streams, streams, data subcarriers)
    pub fn set_w(&mut self, w: Array3<Complex<f32>>) -> Result<(), FramingError> {
        let expected = self.w.dim();
        if w.dim() != expected {
            return Err(FramingError::MatrixShape {
                expected,
                got: w.dim(),
            });
        }
        self.w = w;
        Ok(())
    }

    pub fn w(&self) -> &Array3<Complex<f32>> {
        &self.w
    }

    /// Zero-forcing precoder from a channel estimate `g` of shape (tx, rx, active subcarrier), as
    /// produced by `FrameSync::channel_estimate`. Each subcarrier's precoder is scaled to
    /// Frobenius norm sqrt(streams) so precoding does not change the transmit power. Where the
    /// channel can't be inverted the matched precoder A^H is used instead.
    pub fn compute_w(&mut self, g: &Array3<Complex<f32>>) -> Result<(), FramingError> {
        let n = self.config.num_streams;
        let expected = (n, n, self.map.num_active());
        if g.dim() != expected {
            return Err(FramingError::MatrixShape {
                expected,
                got: g.dim(),
            });
        }
        for (q, j) in self.map.data_in_active().iter().enumerate() {
            let a = matrix::channel_at(g, *j);
            let mut w = match matrix::inverse(&a) {
                Some(inv) => inv,
                None => {
                    tracing::debug!(subcarrier = q, "channel not invertible, using matched precoder");
                    matrix::hermitian(&a)
                }
            };
            let norm = matrix::frobenius_sqr(&w).sqrt();
            if norm > 0. {
                let scale = (n as f32).sqrt() / norm;
                w.mapv_inplace(|x| x * scale);
            }
            matrix::set_at(&mut self.w, q, &w);
        }
        Ok(())
    }

    /// Append one payload OFDM symbol to every stream. `data[s]` holds one value per data
    /// subcarrier for stream s. Returns the number of samples written per stream.
    pub fn write_mimo_packet(
        &mut self,
        data: &[Vec<Complex<f32>>],
        tx: &mut [Vec<Complex<f32>>],
    ) -> Result<usize, FramingError> {
        self.check_buffers(tx)?;
        let n = self.config.num_streams;
        if data.len() != n {
            return Err(FramingError::BufferCount {
                expected: n,
                got: data.len(),
            });
        }
        for d in data {
            if d.len() != self.map.num_data() {
                return Err(FramingError::DataLength {
                    expected: self.map.num_data(),
                    got: d.len(),
                });
            }
        }

        let gain = self.map.active_gain();
        let (map, w) = (&self.map, &self.w);
        for (stream, out) in tx.iter_mut().enumerate() {
            let mut q = 0;
            for (k, t) in map.types().iter().enumerate() {
                self.freq[k] = match t {
                    SubcarrierType::Null => Complex::zero(),
                    SubcarrierType::Pilot => PILOT,
                    SubcarrierType::Data => {
                        let v = if n > 1 {
                            (0..n)
                                .map(|s| w[[stream, s, q]] * data[s][q])
                                .fold(Complex::<f32>::zero(), |acc, v| acc + v)
                        } else {
                            data[0][q]
                        };
                        q += 1;
                        v
                    }
                };
            }
            self.kernel.inverse(&mut self.freq, &mut self.time);
            for x in self.time.iter_mut() {
                *x = *x * gain;
            }
            let m = self.time.len();
            out.extend(&self.time[m - self.config.cp_len..]);
            out.extend(&self.time);
        }
        Ok(self.config.symbol_len())
    }

    /// Preamble, gap and one payload symbol per entry of `symbols`
    pub fn write_frame(
        &mut self,
        symbols: &[Vec<Vec<Complex<f32>>>],
        tx: &mut [Vec<Complex<f32>>],
    ) -> Result<usize, FramingError> {
        let mut written = self.write_sync_words(tx)?;
        written += self.write_gap(tx)?;
        for data in symbols {
            written += self.write_mimo_packet(data, tx)?;
        }
        Ok(written)
    }
}

impl<K> fmt::Display for FrameGen<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (null, pilot, data) = self.map.counts();
        writeln!(f, "framegen:")?;
        writeln!(f, "{}", self.config)?;
        writeln!(f, "    allocation          : {}", self.map)?;
        writeln!(f, "      - null            : {}", null)?;
        writeln!(f, "      - pilot           : {}", pilot)?;
        write!(f, "      - data            : {}", data)?;
        let is_identity = (0..self.w.dim().2)
            .all(|k| matrix::precoder_at(&self.w, k) == matrix::identity(self.config.num_streams));
        if !is_identity {
            write!(f, "\n    precoding           : active")?;
        }
        Ok(())
    }
}
