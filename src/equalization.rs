//! Channel estimation from the long training symbols, and the per-subcarrier MIMO decode that
//! undoes the estimated channel (and the transmitter's precoder, if it used one).

use crate::kernel::NumericKernel;
use crate::matrix;
use crate::subcarrier::SubcarrierMap;
use crate::training::TrainingSequence;
use ndarray::Array3;
use num::{Complex, Zero};

/// Forward transform one received symbol body (cyclic prefix already removed) and undo the
/// `M * gain` scaling of the transmitter's inverse transform
pub fn symbol_to_freq<K: NumericKernel>(
    body: &[Complex<f32>],
    gain: f32,
    kernel: &K,
    out: &mut [Complex<f32>],
) {
    let mut tmp = body.to_vec();
    kernel.forward(&mut tmp, out);
    let scale = 1. / (body.len() as f32 * gain);
    for x in out.iter_mut() {
        *x = *x * scale;
    }
}

/// Least-squares channel estimate. `slots[a][r]` is the body of long symbol `a` as seen by
/// receive stream `r`. Slot `a` is transmitted by stream `a % num_streams` alone, so each slot
/// yields one column of the channel; slots training the same stream are averaged.
///
/// Returns G with shape (tx, rx, active subcarrier).
pub fn estimate_channel<K: NumericKernel>(
    slots: &[Vec<&[Complex<f32>]>],
    s1: &[TrainingSequence],
    map: &SubcarrierMap,
    num_streams: usize,
    kernel: &K,
) -> Array3<Complex<f32>> {
    let active = map.active_indices();
    let mut g = Array3::from_elem((num_streams, num_streams, active.len()), Complex::zero());
    let mut counts = vec![0usize; num_streams];
    let mut freq = vec![Complex::zero(); map.len()];

    for (a, (slot, lts)) in slots.iter().zip(s1).enumerate() {
        let tx = a % num_streams;
        counts[tx] += 1;
        for (rx, body) in slot.iter().enumerate() {
            symbol_to_freq(body, lts.gain, kernel, &mut freq);
            for (j, k) in active.iter().enumerate() {
                g[[tx, rx, j]] = g[[tx, rx, j]] + freq[*k] / lts.freq[*k];
            }
        }
    }
    for (tx, count) in counts.iter().enumerate() {
        if *count > 1 {
            let scale = 1. / *count as f32;
            g.slice_mut(ndarray::s![tx, .., ..])
                .mapv_inplace(|x| x * scale);
        }
    }
    g
}

/// Recover the transmitted data symbols of one OFDM symbol. `freq[r]` is the normalized
/// frequency-domain symbol at receive stream `r`, `g` the channel estimate and `w` the precoder
/// the transmitter applied (ignored for a single stream). Writes `out[s][q]` for stream `s` and
/// data subcarrier `q`.
pub fn decode_symbol(
    freq: &[Vec<Complex<f32>>],
    g: &Array3<Complex<f32>>,
    w: &Array3<Complex<f32>>,
    map: &SubcarrierMap,
    out: &mut [Vec<Complex<f32>>],
) {
    let num_streams = freq.len();
    for (q, (k, j)) in map
        .data_indices()
        .iter()
        .zip(map.data_in_active())
        .enumerate()
    {
        if num_streams == 1 {
            let h = g[[0, 0, *j]];
            out[0][q] = if h.norm_sqr() > 0. {
                freq[0][*k] / h
            } else {
                Complex::zero()
            };
            continue;
        }

        let y: Vec<_> = freq.iter().map(|f| f[*k]).collect();
        let b = matrix::mul(&matrix::channel_at(g, *j), &matrix::precoder_at(w, q));
        let d = match matrix::inverse(&b) {
            Some(inv) => matrix::mul_vec(&inv, &y),
            // Matched combining when the effective channel can't be inverted
            None => {
                let power = matrix::frobenius_sqr(&b);
                let bh = matrix::hermitian(&b);
                matrix::mul_vec(&bh, &y)
                    .into_iter()
                    .map(|x| if power > 0. { x / power } else { Complex::zero() })
                    .collect()
            }
        };
        for (s, v) in d.into_iter().enumerate() {
            out[s][q] = v;
        }
    }
}
