//! Small dense complex matrices, one per subcarrier. Channel estimates and precoders are stored
//! as contiguous `Array3`s indexed by (stream, stream, subcarrier); these helpers pull one
//! subcarrier out as an `Array2`, do the algebra, and write it back.

use ndarray::{Array2, Array3};
use num::{Complex, One, Zero};

/// Pivots smaller than this are treated as singular
const SINGULAR_EPS: f32 = 1e-9;

pub fn identity(n: usize) -> Array2<Complex<f32>> {
    let mut m = Array2::from_elem((n, n), Complex::zero());
    for i in 0..n {
        m[[i, i]] = Complex::one();
    }
    m
}

/// `n x n x subcarriers` array holding the identity on every subcarrier
pub fn identity_stack(n: usize, subcarriers: usize) -> Array3<Complex<f32>> {
    let mut m = Array3::from_elem((n, n, subcarriers), Complex::zero());
    for k in 0..subcarriers {
        for i in 0..n {
            m[[i, i, k]] = Complex::one();
        }
    }
    m
}

/// Channel matrix A for one subcarrier of an estimate `g[tx, rx, k]`, arranged so that
/// `y = A x` (rows are receive streams, columns transmit streams)
pub fn channel_at(g: &Array3<Complex<f32>>, k: usize) -> Array2<Complex<f32>> {
    let (tx, rx, _) = g.dim();
    let mut a = Array2::from_elem((rx, tx), Complex::zero());
    for r in 0..rx {
        for t in 0..tx {
            a[[r, t]] = g[[t, r, k]];
        }
    }
    a
}

/// Precoder for one subcarrier of `w[tx, stream, k]`, so that `x = W d`
pub fn precoder_at(w: &Array3<Complex<f32>>, k: usize) -> Array2<Complex<f32>> {
    let (n, s, _) = w.dim();
    let mut p = Array2::from_elem((n, s), Complex::zero());
    for i in 0..n {
        for j in 0..s {
            p[[i, j]] = w[[i, j, k]];
        }
    }
    p
}

pub fn set_at(dst: &mut Array3<Complex<f32>>, k: usize, src: &Array2<Complex<f32>>) {
    let (n, s) = src.dim();
    for i in 0..n {
        for j in 0..s {
            dst[[i, j, k]] = src[[i, j]];
        }
    }
}

pub fn mul(a: &Array2<Complex<f32>>, b: &Array2<Complex<f32>>) -> Array2<Complex<f32>> {
    let (n, inner) = a.dim();
    let (inner_b, m) = b.dim();
    assert_eq!(inner, inner_b);
    let mut c = Array2::from_elem((n, m), Complex::zero());
    for i in 0..n {
        for j in 0..m {
            let mut acc = Complex::zero();
            for k in 0..inner {
                acc = acc + a[[i, k]] * b[[k, j]];
            }
            c[[i, j]] = acc;
        }
    }
    c
}

pub fn mul_vec(a: &Array2<Complex<f32>>, x: &[Complex<f32>]) -> Vec<Complex<f32>> {
    let (n, m) = a.dim();
    assert_eq!(m, x.len());
    (0..n)
        .map(|i| {
            (0..m)
                .map(|j| a[[i, j]] * x[j])
                .fold(Complex::<f32>::zero(), |acc, v| acc + v)
        })
        .collect()
}

pub fn hermitian(a: &Array2<Complex<f32>>) -> Array2<Complex<f32>> {
    let (n, m) = a.dim();
    let mut h = Array2::from_elem((m, n), Complex::zero());
    for i in 0..n {
        for j in 0..m {
            h[[j, i]] = a[[i, j]].conj();
        }
    }
    h
}

pub fn frobenius_sqr(a: &Array2<Complex<f32>>) -> f32 {
    a.iter().map(|x| x.norm_sqr()).sum()
}

/// Gauss-Jordan inverse with partial pivoting. Returns `None` if the matrix is (numerically)
/// singular.
pub fn inverse(a: &Array2<Complex<f32>>) -> Option<Array2<Complex<f32>>> {
    let (n, m) = a.dim();
    assert_eq!(n, m);
    let mut work = a.clone();
    let mut inv = identity(n);

    for col in 0..n {
        let pivot = (col..n).max_by(|x, y| {
            work[[*x, col]]
                .norm()
                .partial_cmp(&work[[*y, col]].norm())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if work[[pivot, col]].norm() < SINGULAR_EPS {
            return None;
        }
        if pivot != col {
            for j in 0..n {
                work.swap([pivot, j], [col, j]);
                inv.swap([pivot, j], [col, j]);
            }
        }

        let scale = Complex::<f32>::one() / work[[col, col]];
        for j in 0..n {
            work[[col, j]] = work[[col, j]] * scale;
            inv[[col, j]] = inv[[col, j]] * scale;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor.is_zero() {
                continue;
            }
            for j in 0..n {
                work[[row, j]] = work[[row, j]] - factor * work[[col, j]];
                inv[[row, j]] = inv[[row, j]] - factor * inv[[col, j]];
            }
        }
    }
    Some(inv)
}
