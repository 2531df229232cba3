use crate::kernel::NumericKernel;
use num::Complex;

/// Use a long training sequence (LTS) to align the start of the packet. `window[s]` holds the
/// received samples of stream s. Returns the offset in `0..=search` at which the known `lts`
/// lines up best, i.e. maximises sum_s |<lts, window[s][offset..]>|^2. Each window must hold at
/// least `search + lts.len()` samples.
pub fn lts_align<K: NumericKernel>(
    window: &[&[Complex<f32>]],
    lts: &[Complex<f32>],
    search: usize,
    kernel: &K,
) -> usize {
    let (mut max, mut max_idx) = (-1., 0);
    for i in 0..=search {
        let val: f32 = window
            .iter()
            .map(|w| kernel.dot_conj(lts, &w[i..i + lts.len()]).norm_sqr())
            .sum();
        if val > max {
            max = val;
            max_idx = i;
        }
    }
    max_idx
}
