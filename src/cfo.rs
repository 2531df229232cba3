use num::Complex;

/// Coarse CFO from the delay correlator output at the plateau peak. `corr` is
/// sum conj(r[n]) r[n + lag] over a window of the repeating short symbol, so its phase is the
/// rotation accumulated over `lag` samples. Returns the per-sample phase shift due to CFO (hence
/// correction should be in the opposite direction). Only offsets below pi / lag radians per
/// sample are unambiguous.
pub fn estimate_cfo(corr: Complex<f64>, lag: usize) -> f32 {
    (corr.arg() / lag as f64) as f32
}

/// Take a buffer and CFO estimate (in radians per sample) and correct the samples for the CFO.
/// `offset` is the index of `samps[0]` relative to the phase origin, so that pieces of one
/// stream corrected separately stay phase-continuous.
pub fn correct_cfo(samps: &[Complex<f32>], cfo: f32, offset: u64) -> Vec<Complex<f32>> {
    if cfo == 0. {
        return samps.to_vec();
    }
    // Wrap the starting phase in f64 so long offsets keep their precision
    let start = (-(cfo as f64) * offset as f64) % (2. * std::f64::consts::PI);
    let step = Complex::new(0., -cfo).exp();
    let mut corr = Complex::new(0., start as f32).exp();
    let mut res = Vec::with_capacity(samps.len());
    for s in samps {
        res.push(s * corr);
        corr = corr * step;
    }
    res
}

#[cfg(test)]
mod test {
    use super::*;

    /// Rotate a repeating sequence by a known CFO and check both estimation and correction
    #[test]
    fn test_cfo_estimation_and_correction() {
        let cfo = 0.02;
        let lag = 16;
        let base: Vec<Complex<f32>> = (0..lag)
            .map(|i| Complex::new((i as f32 * 0.7).cos(), (i as f32 * 1.3).sin()))
            .collect();
        let rx: Vec<_> = base
            .iter()
            .cycle()
            .take(4 * lag)
            .enumerate()
            .map(|(i, s)| s * Complex::new(0., cfo * i as f32).exp())
            .collect();

        let corr = (0..2 * lag)
            .map(|i| {
                let c = rx[i].conj() * rx[i + lag];
                Complex::new(c.re as f64, c.im as f64)
            })
            .sum::<Complex<f64>>();
        let cfo_est = estimate_cfo(corr, lag);
        assert!((cfo_est - cfo).abs() < 1e-5);

        let fixed = correct_cfo(&rx, cfo_est, 0);
        assert_eq!(fixed.len(), rx.len());
        for (i, x) in fixed.iter().enumerate() {
            // Norms shouldn't change
            assert!((x.norm() - rx[i].norm()).abs() < 1e-5);
            assert!((x - base[i % lag]).norm() < 1e-3);
        }

        // Correcting the second half on its own lines up with correcting everything at once
        let tail = correct_cfo(&rx[2 * lag..], cfo_est, 2 * lag as u64);
        for (a, b) in tail.iter().zip(&fixed[2 * lag..]) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn zero_cfo_is_a_copy() {
        let samps = vec![Complex::new(1., 2.), Complex::new(-3., 0.5)];
        assert_eq!(correct_cfo(&samps, 0., 12345), samps);
    }
}
