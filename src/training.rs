//! Preamble training symbols.
//!
//! The short symbol S0 only occupies even subcarriers, so in the time domain it repeats every
//! M/2 samples. That repetition is what the receiver's delay correlator locks on to. The long
//! symbols S1 (one per access code) occupy every active subcarrier and are used for fine timing
//! and channel estimation.

use crate::error::FramingError;
use crate::kernel::NumericKernel;
use crate::msequence::SequenceSource;
use crate::subcarrier::SubcarrierMap;
use num::{Complex, Zero};

/// A training symbol in both domains. `time` is the inverse transform of `freq` scaled by
/// `gain`, so a receiver must divide its forward transform by `M * gain` to get `freq` back.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSequence {
    pub freq: Vec<Complex<f32>>,
    pub time: Vec<Complex<f32>>,
    pub gain: f32,
    /// Number of occupied subcarriers
    pub occupied: usize,
}

impl TrainingSequence {
    fn from_freq<K: NumericKernel>(freq: Vec<Complex<f32>>, kernel: &K) -> Self {
        let occupied = freq.iter().filter(|x| !x.is_zero()).count();
        let gain = 1. / (occupied as f32).sqrt();
        let mut tmp = freq.clone();
        let mut time = vec![Complex::zero(); freq.len()];
        kernel.inverse(&mut tmp, &mut time);
        for t in time.iter_mut() {
            *t = *t * gain;
        }
        Self {
            freq,
            time,
            gain,
            occupied,
        }
    }

    /// Length in samples (also the number of subcarriers)
    pub fn len(&self) -> usize {
        self.time.len()
    }
}

fn bpsk(bit: bool) -> Complex<f32> {
    if bit {
        Complex::new(1., 0.)
    } else {
        Complex::new(-1., 0.)
    }
}

/// Short symbol. One bit is drawn for every subcarrier so the sequence does not depend on which
/// subcarriers are occupied.
pub fn make_s0<S: SequenceSource, K: NumericKernel>(
    map: &SubcarrierMap,
    ms: &mut S,
    kernel: &K,
) -> Result<TrainingSequence, FramingError> {
    let freq: Vec<_> = (0..map.len())
        .map(|i| {
            let bit = ms.next_bit();
            if map.get(i).is_active() && i % 2 == 0 {
                bpsk(bit)
            } else {
                Complex::zero()
            }
        })
        .collect();
    if freq.iter().all(|x| x.is_zero()) {
        return Err(FramingError::EmptyShortSequence);
    }
    Ok(TrainingSequence::from_freq(freq, kernel))
}

/// Long symbol for one access code
pub fn make_s1<S: SequenceSource, K: NumericKernel>(
    map: &SubcarrierMap,
    ms: &mut S,
    kernel: &K,
) -> TrainingSequence {
    let freq = (0..map.len())
        .map(|i| {
            let bit = ms.next_bit();
            if map.get(i).is_active() {
                bpsk(bit)
            } else {
                Complex::zero()
            }
        })
        .collect();
    TrainingSequence::from_freq(freq, kernel)
}

/// The full set of training symbols shared by a generator and a synchronizer
#[derive(Clone, Debug, PartialEq)]
pub struct Preamble {
    pub s0: TrainingSequence,
    pub s1: Vec<TrainingSequence>,
}

impl Preamble {
    /// Consumes the generators. Fails if the number of long-sequence generators differs from
    /// `num_access_codes`.
    pub fn generate<S: SequenceSource, K: NumericKernel>(
        map: &SubcarrierMap,
        num_access_codes: usize,
        mut ms_s0: S,
        ms_s1: Vec<S>,
        kernel: &K,
    ) -> Result<Self, FramingError> {
        if ms_s1.len() != num_access_codes {
            return Err(FramingError::AccessCodeMismatch {
                expected: num_access_codes,
                got: ms_s1.len(),
            });
        }
        let s0 = make_s0(map, &mut ms_s0, kernel)?;
        let s1 = ms_s1
            .into_iter()
            .map(|mut ms| make_s1(map, &mut ms, kernel))
            .collect();
        Ok(Self { s0, s1 })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::RustFftKernel;
    use crate::msequence::MSequence;

    fn preamble(m: usize, codes: usize) -> Preamble {
        let map = SubcarrierMap::default_for(m).unwrap();
        let kernel = RustFftKernel::new(m);
        Preamble::generate(
            &map,
            codes,
            MSequence::maximal(MSequence::degree_for(m)),
            MSequence::access_codes(MSequence::degree_for(m), codes),
            &kernel,
        )
        .unwrap()
    }

    #[test]
    fn deterministic() {
        assert_eq!(preamble(64, 3), preamble(64, 3));
    }

    #[test]
    fn short_symbol_repeats_every_half_symbol() {
        let p = preamble(64, 1);
        let s0 = &p.s0.time;
        for n in 0..32 {
            assert!((s0[n] - s0[n + 32]).norm() < 1e-5);
        }
    }

    #[test]
    fn unit_average_power() {
        let p = preamble(128, 2);
        for seq in std::iter::once(&p.s0).chain(&p.s1) {
            let power = seq.time.iter().map(|x| x.norm_sqr()).sum::<f32>() / seq.len() as f32;
            assert!((power - 1.).abs() < 1e-3);
        }
    }

    #[test]
    fn null_subcarriers_stay_empty() {
        let map = SubcarrierMap::default_for(64).unwrap();
        let p = preamble(64, 1);
        for i in 0..64 {
            if !map.get(i).is_active() {
                assert!(p.s0.freq[i].is_zero());
                assert!(p.s1[0].freq[i].is_zero());
            } else {
                assert_eq!(p.s1[0].freq[i].norm(), 1.);
            }
        }
        assert_eq!(p.s1[0].occupied, map.num_active());
    }

    #[test]
    fn access_codes_are_distinguishable() {
        let p = preamble(64, 4);
        let kernel = RustFftKernel::new(64);
        for i in 0..4 {
            let auto = kernel.dot_conj(&p.s1[i].time, &p.s1[i].time).norm();
            for j in 0..4 {
                if i != j {
                    let cross = kernel.dot_conj(&p.s1[i].time, &p.s1[j].time).norm();
                    assert!(cross < 0.5 * auto, "{} {} {} {}", i, j, cross, auto);
                }
            }
        }
    }

    #[test]
    fn generator_count_must_match() {
        let map = SubcarrierMap::default_for(64).unwrap();
        let kernel = RustFftKernel::new(64);
        let res = Preamble::generate(
            &map,
            2,
            MSequence::maximal(7),
            MSequence::access_codes(7, 3),
            &kernel,
        );
        assert!(matches!(
            res,
            Err(FramingError::AccessCodeMismatch {
                expected: 2,
                got: 3
            })
        ));
    }
}
