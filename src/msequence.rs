//! Pseudo-random bit sources for the training sequences. The framer only needs a deterministic
//! stream of bits; `MSequence` is a maximal-length Galois LFSR that provides one.

/// Deterministic source of bits. Two sources built the same way must yield the same bits.
pub trait SequenceSource {
    fn next_bit(&mut self) -> bool;
}

/// Maximal-length sequence generated by a Galois linear feedback shift register
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MSequence {
    /// Register length in bits
    m: u32,
    /// Feedback taps
    poly: u64,
    state: u64,
    mask: u64,
}

impl MSequence {
    /// `m` is clamped to 2..=20. A zero seed is replaced by 1 since the all-zero state is a fixed
    /// point of the register.
    pub fn new(m: u32, poly: u64, seed: u64) -> Self {
        let m = m.max(2).min(20);
        let mask = (1u64 << m) - 1;
        let state = match seed & mask {
            0 => 1,
            s => s,
        };
        Self {
            m,
            poly: poly & mask,
            state,
            mask,
        }
    }

    /// Generator with a known maximal-length polynomial for register length `m`
    pub fn maximal(m: u32) -> Self {
        Self::with_seed(m, 1)
    }

    pub fn with_seed(m: u32, seed: u64) -> Self {
        let m = m.max(2).min(20);
        let poly = match m {
            2 => 0x3,
            3 => 0x6,
            4 => 0xC,
            5 => 0x14,
            6 => 0x30,
            7 => 0x60,
            8 => 0xB8,
            9 => 0x110,
            10 => 0x240,
            11 => 0x500,
            12 => 0xE08,
            13 => 0x1C80,
            14 => 0x3802,
            15 => 0x6000,
            16 => 0xD008,
            17 => 0x12000,
            18 => 0x20400,
            19 => 0x72000,
            _ => 0x90000,
        };
        Self::new(m, poly, seed)
    }

    /// One generator per access code. They share a polynomial but start at different points of
    /// the sequence, so the long training symbols built from them are weakly correlated.
    pub fn access_codes(m: u32, n: usize) -> Vec<Self> {
        let period = (1u64 << m.max(2).min(20)) - 1;
        (0..n as u64)
            .map(|i| Self::with_seed(m, 1 + (i * 0x9E37) % period))
            .collect()
    }

    /// Register length large enough that one period covers `n` draws
    pub fn degree_for(n: usize) -> u32 {
        let mut m = 2;
        while ((1usize << m) - 1) < n && m < 20 {
            m += 1;
        }
        m
    }

    pub fn period(&self) -> u64 {
        (1u64 << self.m) - 1
    }

    pub fn state(&self) -> u64 {
        self.state
    }
}

impl SequenceSource for MSequence {
    fn next_bit(&mut self) -> bool {
        let out = self.state & 1 == 1;
        self.state >>= 1;
        if out {
            self.state ^= self.poly;
        }
        self.state &= self.mask;
        out
    }
}
