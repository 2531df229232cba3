//! Coarse timing. The short training symbol repeats every `lag` samples, so while it is on the
//! air the normalized delay-and-correlate metric sits near one for a stretch of samples (the
//! plateau) instead of producing a single peak. `DelayCorrelator` computes the metric one sample
//! at a time over all antennas, `PlateauTracker` turns it into plateau bounds.

use num::{Complex, Zero};
use std::collections::VecDeque;

/// Below this energy in either window the metric is reported as zero
const ENERGY_FLOOR: f64 = 1e-10;

fn widen(x: Complex<f32>) -> Complex<f64> {
    Complex::new(x.re as f64, x.im as f64)
}

/// Sliding delay-and-correlate over `lag` samples, summed over antennas:
///
/// P(n) = sum_k conj(r[n - 2 lag + 1 + k]) r[n - lag + 1 + k]
///
/// normalized by the energy of both windows, sqrt(R_old(n) R_new(n)), so the metric never exceeds
/// one (Cauchy-Schwarz) even when a strong frame is followed by weak noise.
///
/// The last `capacity` samples of every stream are kept so later stages can look back.
pub struct DelayCorrelator {
    lag: usize,
    capacity: usize,
    hist: Vec<VecDeque<Complex<f32>>>,
    corr: Complex<f64>,
    /// Energy of the newest `lag` samples
    energy: f64,
    /// Energy of the `lag` samples before those
    energy_old: f64,
    /// Total number of samples pushed per stream
    pushed: u64,
}

impl DelayCorrelator {
    pub fn new(num_streams: usize, lag: usize, capacity: usize) -> Self {
        let capacity = capacity.max(2 * lag + 1);
        Self {
            lag,
            capacity,
            hist: (0..num_streams)
                .map(|_| VecDeque::with_capacity(capacity + 1))
                .collect(),
            corr: Complex::zero(),
            energy: 0.,
            energy_old: 0.,
            pushed: 0,
        }
    }

    /// Push one sample per stream
    pub fn push(&mut self, samps: &[Complex<f32>]) {
        debug_assert_eq!(samps.len(), self.hist.len());
        let lag = self.lag;
        for (hist, x) in self.hist.iter_mut().zip(samps) {
            hist.push_back(*x);
            let newest = hist.len() - 1;
            self.energy += x.norm_sqr() as f64;
            if newest >= lag {
                let mid = hist[newest - lag];
                self.energy -= mid.norm_sqr() as f64;
                self.energy_old += mid.norm_sqr() as f64;
                self.corr += widen(mid.conj() * x);
                if newest >= 2 * lag {
                    let old = hist[newest - 2 * lag];
                    self.energy_old -= old.norm_sqr() as f64;
                    self.corr -= widen(old.conj() * mid);
                }
            }
            if hist.len() > self.capacity {
                hist.pop_front();
            }
        }
        self.pushed += 1;

        // The running sums drift; rebuild them exactly every couple of windows
        if self.pushed % (2 * lag as u64) == 0 {
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        let lag = self.lag;
        let mut corr = Complex::zero();
        let (mut energy, mut energy_old) = (0., 0.);
        for hist in &self.hist {
            let len = hist.len();
            for i in len.saturating_sub(lag)..len {
                energy += hist[i].norm_sqr() as f64;
                if i >= lag {
                    energy_old += hist[i - lag].norm_sqr() as f64;
                    corr += widen(hist[i - lag].conj() * hist[i]);
                }
            }
        }
        self.corr = corr;
        self.energy = energy;
        self.energy_old = energy_old;
    }

    /// Normalized metric |P| / sqrt(R_old R_new) in [0, 1]. Zero until two full windows have been
    /// seen, or while either window is silent.
    pub fn metric(&self) -> f32 {
        if self.pushed < 2 * self.lag as u64
            || self.energy < ENERGY_FLOOR
            || self.energy_old < ENERGY_FLOOR
        {
            0.
        } else {
            (self.corr.norm() / (self.energy * self.energy_old).sqrt()) as f32
        }
    }

    pub fn correlation(&self) -> Complex<f64> {
        self.corr
    }

    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn num_pushed(&self) -> u64 {
        self.pushed
    }

    /// Absolute index of the oldest sample still held in history
    pub fn oldest(&self) -> u64 {
        let held = self.hist.first().map(|h| h.len()).unwrap_or(0) as u64;
        self.pushed - held
    }

    /// Samples of `stream` with absolute index >= `from`, oldest first
    pub fn history_from(&self, stream: usize, from: u64) -> impl Iterator<Item = &Complex<f32>> {
        let skip = from.saturating_sub(self.oldest()) as usize;
        self.hist[stream].iter().skip(skip)
    }

    pub fn reset(&mut self) {
        for h in self.hist.iter_mut() {
            h.clear();
        }
        self.corr = Complex::zero();
        self.energy = 0.;
        self.energy_old = 0.;
        self.pushed = 0;
    }
}

/// An accepted plateau. Bounds are absolute sample indices of the newest sample in the
/// correlator window at the first and last point above threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plateau {
    pub start: u64,
    pub end: u64,
    /// Highest metric seen on the plateau
    pub peak: f32,
    /// Correlator output at the peak
    pub peak_corr: Complex<f64>,
}

impl Plateau {
    pub fn width(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlateauEvent {
    Accepted(Plateau),
    /// The metric fell back below threshold but the plateau was too narrow
    TooNarrow { start: u64, end: u64 },
    /// The metric stayed above threshold for longer than the short symbol can explain
    TooWide { start: u64 },
}

#[derive(Clone, Copy, Debug)]
enum TrackerState {
    Idle,
    /// Above threshold since `start`
    Rising {
        start: u64,
        peak: f32,
        peak_corr: Complex<f64>,
    },
    /// Rejected for being too wide; wait for the metric to drop before re-arming
    Saturated,
}

#[derive(Clone, Debug)]
pub struct PlateauTracker {
    threshold: f32,
    min_width: u64,
    max_width: u64,
    state: TrackerState,
}

impl PlateauTracker {
    pub fn new(threshold: f32, min_width: u64, max_width: u64) -> Self {
        Self {
            threshold,
            min_width: min_width.max(1),
            max_width,
            state: TrackerState::Idle,
        }
    }

    /// Feed the metric for sample `n`
    pub fn update(&mut self, n: u64, metric: f32, corr: Complex<f64>) -> Option<PlateauEvent> {
        let above = metric >= self.threshold;
        match self.state {
            TrackerState::Idle => {
                if above {
                    self.state = TrackerState::Rising {
                        start: n,
                        peak: metric,
                        peak_corr: corr,
                    };
                }
                None
            }
            TrackerState::Rising {
                start,
                peak,
                peak_corr,
            } => {
                if above {
                    if n - start + 1 > self.max_width {
                        self.state = TrackerState::Saturated;
                        return Some(PlateauEvent::TooWide { start });
                    }
                    if metric > peak {
                        self.state = TrackerState::Rising {
                            start,
                            peak: metric,
                            peak_corr: corr,
                        };
                    }
                    None
                } else {
                    self.state = TrackerState::Idle;
                    let end = n - 1;
                    if end + 1 - start < self.min_width {
                        Some(PlateauEvent::TooNarrow { start, end })
                    } else {
                        Some(PlateauEvent::Accepted(Plateau {
                            start,
                            end,
                            peak,
                            peak_corr,
                        }))
                    }
                }
            }
            TrackerState::Saturated => {
                if !above {
                    self.state = TrackerState::Idle;
                }
                None
            }
        }
    }

    /// Start of the plateau currently being tracked, if any
    pub fn candidate_start(&self) -> Option<u64> {
        match self.state {
            TrackerState::Rising { start, .. } => Some(start),
            _ => None,
        }
    }
}
