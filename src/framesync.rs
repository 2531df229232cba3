//! Receive side. Samples from every antenna are pushed through one state machine:
//!
//! 1. `SeekPlateau`: the delay correlator runs over the short symbol S0 and a plateau of the
//!    right width gives a coarse frame start and the carrier frequency offset.
//! 2. `SaveAccessCodes`: the long symbols are captured with some margin either side, aligned
//!    exactly against S1_0 and turned into a channel estimate.
//! 3. `Wait`: the gap between preamble and payload is skipped.
//! 4. `Mimo`: every payload symbol is decoded and handed to the callback.
//!
//! The correlator keeps running in every state, so its history is always current when the next
//! frame arrives.

use crate::cfo::{correct_cfo, estimate_cfo};
use crate::config::FramingConfig;
use crate::equalization::{decode_symbol, estimate_channel, symbol_to_freq};
use crate::error::FramingError;
use crate::kernel::{NumericKernel, RustFftKernel};
use crate::lts_align::lts_align;
use crate::matrix;
use crate::msequence::SequenceSource;
use crate::plateau::{DelayCorrelator, Plateau, PlateauEvent, PlateauTracker};
use crate::subcarrier::SubcarrierMap;
use crate::training::Preamble;
use ndarray::Array3;
use num::{Complex, Zero};
use std::fmt;
use tracing::{debug, info, trace};

/// Externally visible synchronizer state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    SeekPlateau,
    SaveAccessCodes,
    Wait,
    Mimo,
}

/// One decoded payload symbol, as handed to the callback
#[derive(Debug)]
pub struct DecodedSymbol<'a> {
    /// Absolute sample index of the start of the frame's S0 cyclic prefix
    pub sync_index: u64,
    /// Position of this symbol within the payload
    pub symbol_index: usize,
    /// `streams[s][q]` is the value of data subcarrier q on stream s
    pub streams: &'a [Vec<Complex<f32>>],
    /// Channel estimate used for the decode, shape (tx, rx, active subcarrier)
    pub channel: &'a Array3<Complex<f32>>,
}

/// Everything known about a frame once the long symbols have been aligned
#[derive(Clone, Copy, Debug)]
struct Lock {
    plateau_start: u64,
    plateau_end: u64,
    sync_index: u64,
    cfo: f32,
    /// Absolute index at which CFO correction has zero phase
    phase_origin: u64,
}

struct Capture {
    plateau: Plateau,
    coarse_start: i64,
    cfo: f32,
    /// Absolute index of `bufs[_][0]`
    start: u64,
    needed: usize,
    bufs: Vec<Vec<Complex<f32>>>,
}

struct Payload {
    lock: Lock,
    symbol_index: usize,
    /// Absolute index of `bufs[_][0]`
    symbol_start: u64,
    bufs: Vec<Vec<Complex<f32>>>,
}

enum State {
    SeekPlateau(PlateauTracker),
    SaveAccessCodes(Capture),
    Wait { lock: Lock, remaining: usize },
    Mimo(Payload),
}

pub struct FrameSync<F, K = RustFftKernel> {
    config: FramingConfig,
    map: SubcarrierMap,
    preamble: Preamble,
    kernel: K,
    correlator: DelayCorrelator,
    state: State,
    /// Samples either side of the expected long symbols that are captured for fine alignment
    margin: usize,
    /// Channel estimate, shape (tx, rx, active subcarrier)
    g: Array3<Complex<f32>>,
    /// Transmitter's precoder, shape (tx, stream, data subcarrier)
    w: Array3<Complex<f32>>,
    handler: F,
    num_samples: u64,
    freq: Vec<Vec<Complex<f32>>>,
    decoded: Vec<Vec<Complex<f32>>>,
}

impl<F: FnMut(&DecodedSymbol)> FrameSync<F, RustFftKernel> {
    pub fn new<S: SequenceSource>(
        config: &FramingConfig,
        ms_s0: S,
        ms_s1: Vec<S>,
        handler: F,
    ) -> Result<Self, FramingError> {
        Self::with_kernel(
            config,
            ms_s0,
            ms_s1,
            handler,
            RustFftKernel::new(config.subcarriers),
        )
    }
}

impl<F: FnMut(&DecodedSymbol), K: NumericKernel> FrameSync<F, K> {
    pub fn with_kernel<S: SequenceSource>(
        config: &FramingConfig,
        ms_s0: S,
        ms_s1: Vec<S>,
        handler: F,
        kernel: K,
    ) -> Result<Self, FramingError> {
        config.validate()?;
        let map = config.subcarrier_map()?;
        let preamble = Preamble::generate(&map, config.num_access_codes, ms_s0, ms_s1, &kernel)?;
        let (m, n) = (config.subcarriers, config.num_streams);
        let margin = config.cp_len.max(m / 4);
        let capacity = 4 * config.symbol_len() + 2 * margin;

        let mut sync = Self {
            config: config.clone(),
            g: Array3::from_elem((n, n, map.num_active()), Complex::zero()),
            w: matrix::identity_stack(n, map.num_data()),
            freq: vec![vec![Complex::zero(); m]; n],
            decoded: vec![vec![Complex::zero(); map.num_data()]; n],
            map,
            preamble,
            kernel,
            correlator: DelayCorrelator::new(n, m / 2, capacity),
            state: State::SeekPlateau(PlateauTracker::new(0., 1, 1)),
            margin,
            handler,
            num_samples: 0,
        };
        sync.state = State::SeekPlateau(sync.new_tracker());
        Ok(sync)
    }

    fn new_tracker(&self) -> PlateauTracker {
        let (cp, lag) = (self.config.cp_len as u64, self.correlator.lag() as u64);
        PlateauTracker::new(
            self.config.plateau_threshold,
            cp / 2 + lag / 4,
            cp + 2 * lag,
        )
    }

    /// Consume `num_samples` samples from each antenna's buffer, running as many state
    /// transitions as they allow. The handler is called for every payload symbol decoded on the
    /// way.
    pub fn execute(
        &mut self,
        buffers: &[&[Complex<f32>]],
        num_samples: usize,
    ) -> Result<SyncState, FramingError> {
        if buffers.len() != self.config.num_streams {
            return Err(FramingError::BufferCount {
                expected: self.config.num_streams,
                got: buffers.len(),
            });
        }
        for b in buffers {
            if b.len() < num_samples {
                return Err(FramingError::BufferTooShort {
                    needed: num_samples,
                    got: b.len(),
                });
            }
        }

        let mut samps = vec![Complex::zero(); buffers.len()];
        for i in 0..num_samples {
            for (s, b) in samps.iter_mut().zip(buffers) {
                *s = b[i];
            }
            self.push(&samps);
        }
        Ok(self.state())
    }

    fn push(&mut self, samps: &[Complex<f32>]) {
        let n = self.num_samples;
        self.correlator.push(samps);
        self.num_samples += 1;

        let placeholder = State::SeekPlateau(self.new_tracker());
        let state = std::mem::replace(&mut self.state, placeholder);
        self.state = match state {
            State::SeekPlateau(tracker) => self.seek_plateau(tracker, n),
            State::SaveAccessCodes(capture) => self.save_access_codes(capture, samps, n),
            other => self.advance(other, samps, n),
        };
    }

    fn seek_plateau(&mut self, mut tracker: PlateauTracker, n: u64) -> State {
        let metric = self.correlator.metric();
        match tracker.update(n, metric, self.correlator.correlation()) {
            Some(PlateauEvent::Accepted(plateau)) => match self.begin_capture(plateau) {
                Some(state) => state,
                None => State::SeekPlateau(tracker),
            },
            Some(PlateauEvent::TooNarrow { start, end }) => {
                debug!(start, end, "plateau too narrow");
                State::SeekPlateau(tracker)
            }
            Some(PlateauEvent::TooWide { start }) => {
                debug!(start, "plateau too wide");
                State::SeekPlateau(tracker)
            }
            None => State::SeekPlateau(tracker),
        }
    }

    fn begin_capture(&mut self, plateau: Plateau) -> Option<State> {
        let (cp, sym, lag) = (
            self.config.cp_len as i64,
            self.config.symbol_len() as i64,
            self.correlator.lag() as i64,
        );
        // The metric ramps up as S0 fills the window and down as S1 enters it, so the middle
        // of the plateau is where the window sits on the S0 body
        let mid = ((plateau.start + plateau.end) / 2) as i64;
        let coarse_start = mid - (2 * lag - 1) - cp / 2;
        let start = coarse_start + sym - self.margin as i64;
        if start < self.correlator.oldest() as i64 {
            debug!(
                start,
                oldest = self.correlator.oldest(),
                "long symbols no longer in history"
            );
            return None;
        }
        let start = start as u64;
        let needed = self.config.num_access_codes * self.config.symbol_len() + 2 * self.margin;
        let bufs = (0..self.config.num_streams)
            .map(|s| {
                let mut buf = Vec::with_capacity(needed);
                buf.extend(self.correlator.history_from(s, start).take(needed));
                buf
            })
            .collect();
        let cfo = estimate_cfo(plateau.peak_corr, lag as usize);
        debug!(
            plateau_start = plateau.start,
            plateau_end = plateau.end,
            peak = plateau.peak,
            coarse_start,
            cfo,
            "plateau accepted"
        );

        let capture = Capture {
            plateau,
            coarse_start,
            cfo,
            start,
            needed,
            bufs,
        };
        if capture.bufs[0].len() >= needed {
            Some(self.finish_capture(capture))
        } else {
            Some(State::SaveAccessCodes(capture))
        }
    }

    fn save_access_codes(&mut self, mut capture: Capture, samps: &[Complex<f32>], n: u64) -> State {
        if n >= capture.start {
            for (buf, x) in capture.bufs.iter_mut().zip(samps) {
                buf.push(*x);
            }
        }
        if capture.bufs[0].len() >= capture.needed {
            self.finish_capture(capture)
        } else {
            State::SaveAccessCodes(capture)
        }
    }

    fn finish_capture(&mut self, capture: Capture) -> State {
        let (m, cp, sym) = (
            self.config.subcarriers,
            self.config.cp_len,
            self.config.symbol_len(),
        );
        let search = 2 * self.margin;
        let corrected: Vec<_> = capture
            .bufs
            .iter()
            .map(|b| correct_cfo(b, capture.cfo, 0))
            .collect();

        let window: Vec<&[Complex<f32>]> = corrected
            .iter()
            .map(|b| &b[cp..cp + search + m])
            .collect();
        let offset = lts_align(&window, &self.preamble.s1[0].time, search, &self.kernel);
        let sync_index = capture.coarse_start - self.margin as i64 + offset as i64;
        if sync_index < 0 {
            debug!(sync_index, "frame would start before the first sample");
            return State::SeekPlateau(self.new_tracker());
        }

        // Body of long symbol a sits at buffer index offset + a (M + cp) + cp
        let slots: Vec<Vec<&[Complex<f32>]>> = (0..self.config.num_access_codes)
            .map(|a| {
                let at = offset + a * sym + cp;
                corrected.iter().map(|b| &b[at..at + m]).collect()
            })
            .collect();
        self.g = estimate_channel(
            &slots,
            &self.preamble.s1,
            &self.map,
            self.config.num_streams,
            &self.kernel,
        );

        let lock = Lock {
            plateau_start: capture.plateau.start,
            plateau_end: capture.plateau.end,
            sync_index: sync_index as u64,
            cfo: capture.cfo,
            phase_origin: capture.start,
        };
        info!(sync_index = lock.sync_index, cfo = lock.cfo, "frame lock");

        // The capture ran past the end of the preamble; those samples belong to the gap or the
        // payload
        let mut state = self.settle(State::Wait {
            lock,
            remaining: self.config.gap_len,
        });
        let mut samps = vec![Complex::zero(); capture.bufs.len()];
        for i in offset + self.config.num_access_codes * sym..capture.needed {
            for (s, b) in samps.iter_mut().zip(&capture.bufs) {
                *s = b[i];
            }
            state = self.advance(state, &samps, capture.start + i as u64);
        }
        state
    }

    /// Leave `Wait` as soon as the gap is used up
    fn settle(&self, state: State) -> State {
        match state {
            State::Wait { lock, remaining: 0 } => State::Mimo(Payload {
                lock,
                symbol_index: 0,
                symbol_start: 0,
                bufs: vec![Vec::with_capacity(self.config.symbol_len()); self.config.num_streams],
            }),
            other => other,
        }
    }

    /// Step the post-lock states by one sample
    fn advance(&mut self, state: State, samps: &[Complex<f32>], n: u64) -> State {
        match state {
            State::Wait { lock, remaining } => self.settle(State::Wait {
                lock,
                remaining: remaining - 1,
            }),
            State::Mimo(payload) => self.receive_payload(payload, samps, n),
            other => other,
        }
    }

    fn receive_payload(&mut self, mut payload: Payload, samps: &[Complex<f32>], n: u64) -> State {
        if payload.bufs[0].is_empty() {
            payload.symbol_start = n;
        }
        for (buf, x) in payload.bufs.iter_mut().zip(samps) {
            buf.push(*x);
        }
        if payload.bufs[0].len() < self.config.symbol_len() {
            return State::Mimo(payload);
        }

        self.decode_payload_symbol(&payload);
        payload.symbol_index += 1;
        for buf in payload.bufs.iter_mut() {
            buf.clear();
        }
        if payload.symbol_index >= self.config.num_payload_symbols {
            info!(
                sync_index = payload.lock.sync_index,
                symbols = payload.symbol_index,
                "frame complete"
            );
            return State::SeekPlateau(self.new_tracker());
        }
        State::Mimo(payload)
    }

    fn decode_payload_symbol(&mut self, payload: &Payload) {
        let cp = self.config.cp_len;
        let gain = self.map.active_gain();
        let offset = payload.symbol_start - payload.lock.phase_origin;
        for (buf, freq) in payload.bufs.iter().zip(self.freq.iter_mut()) {
            let fixed = correct_cfo(buf, payload.lock.cfo, offset);
            symbol_to_freq(&fixed[cp..], gain, &self.kernel, freq);
        }
        decode_symbol(&self.freq, &self.g, &self.w, &self.map, &mut self.decoded);
        trace!(
            sync_index = payload.lock.sync_index,
            symbol = payload.symbol_index,
            "payload symbol decoded"
        );

        let symbol = DecodedSymbol {
            sync_index: payload.lock.sync_index,
            symbol_index: payload.symbol_index,
            streams: &self.decoded,
            channel: &self.g,
        };
        (self.handler)(&symbol);
    }

    /// Back to `SeekPlateau` with an empty history. Configuration and precoder are kept
    pub fn reset(&mut self) {
        self.correlator.reset();
        self.num_samples = 0;
        self.g.fill(Complex::zero());
        self.state = State::SeekPlateau(self.new_tracker());
    }

    /// Tell the receiver which precoder the transmitter applies, shape
    /// (streams, streams, data subcarriers)
    pub fn set_precoder(&mut self, w: Array3<Complex<f32>>) -> Result<(), FramingError> {
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
}

impl<F, K> FrameSync<F, K> {
    pub fn state(&self) -> SyncState {
        match self.state {
            State::SeekPlateau(_) => SyncState::SeekPlateau,
            State::SaveAccessCodes(_) => SyncState::SaveAccessCodes,
            State::Wait { .. } => SyncState::Wait,
            State::Mimo(_) => SyncState::Mimo,
        }
    }

    fn lock(&self) -> Option<&Lock> {
        match &self.state {
            State::Wait { lock, .. } => Some(lock),
            State::Mimo(payload) => Some(&payload.lock),
            _ => None,
        }
    }

    /// Start of the current frame. While the long symbols are still being captured this is the
    /// coarse estimate; zero when no frame has been found
    pub fn sync_index(&self) -> u64 {
        match &self.state {
            State::SaveAccessCodes(c) => c.coarse_start.max(0) as u64,
            _ => self.lock().map(|l| l.sync_index).unwrap_or(0),
        }
    }

    pub fn plateau_start(&self) -> u64 {
        match &self.state {
            State::SeekPlateau(tracker) => tracker.candidate_start().unwrap_or(0),
            State::SaveAccessCodes(c) => c.plateau.start,
            _ => self.lock().map(|l| l.plateau_start).unwrap_or(0),
        }
    }

    pub fn plateau_end(&self) -> u64 {
        match &self.state {
            State::SaveAccessCodes(c) => c.plateau.end,
            _ => self.lock().map(|l| l.plateau_end).unwrap_or(0),
        }
    }

    /// Carrier frequency offset of the current frame in radians per sample
    pub fn cfo(&self) -> f32 {
        match &self.state {
            State::SaveAccessCodes(c) => c.cfo,
            _ => self.lock().map(|l| l.cfo).unwrap_or(0.),
        }
    }

    /// Channel estimate from the last set of long symbols, shape (tx, rx, active subcarrier)
    pub fn channel_estimate(&self) -> &Array3<Complex<f32>> {
        &self.g
    }

    pub fn num_samples_processed(&self) -> u64 {
        self.num_samples
    }

    pub fn subcarrier_map(&self) -> &SubcarrierMap {
        &self.map
    }

    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    pub fn config(&self) -> &FramingConfig {
        &self.config
    }
}

impl<F, K> fmt::Display for FrameSync<F, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "framesync:")?;
        writeln!(f, "{}", self.config)?;
        writeln!(f, "    allocation          : {}", self.map)?;
        writeln!(f, "    alignment margin    : {}", self.margin)?;
        write!(f, "    state               : {:?}", self.state())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framegen::FrameGen;
    use crate::msequence::MSequence;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Received = Rc<RefCell<Vec<(u64, usize, Vec<Vec<Complex<f32>>>)>>>;

    fn config(num_streams: usize) -> FramingConfig {
        let mut config = FramingConfig::default();
        config.num_streams = num_streams;
        config.num_access_codes = num_streams;
        config
    }

    fn sequences(config: &FramingConfig) -> (MSequence, Vec<MSequence>) {
        let m = MSequence::degree_for(config.subcarriers);
        (
            MSequence::maximal(m),
            MSequence::access_codes(m, config.num_access_codes),
        )
    }

    fn framegen(config: &FramingConfig) -> FrameGen {
        let (s0, s1) = sequences(config);
        FrameGen::new(config, s0, s1).unwrap()
    }

    fn framesync(config: &FramingConfig) -> (FrameSync<impl FnMut(&DecodedSymbol)>, Received) {
        let received: Received = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        let (s0, s1) = sequences(config);
        let sync = FrameSync::new(config, s0, s1, move |sym: &DecodedSymbol| {
            sink.borrow_mut()
                .push((sym.sync_index, sym.symbol_index, sym.streams.to_vec()));
        })
        .unwrap();
        (sync, received)
    }

    /// QPSK data for every stream of every payload symbol
    fn random_payload(
        config: &FramingConfig,
        num_data: usize,
        rng: &mut StdRng,
    ) -> Vec<Vec<Vec<Complex<f32>>>> {
        let mut point = || {
            let re = if rng.gen::<bool>() { 1. } else { -1. };
            let im = if rng.gen::<bool>() { 1. } else { -1. };
            Complex::new(re, im)
        };
        (0..config.num_payload_symbols)
            .map(|_| {
                (0..config.num_streams)
                    .map(|_| (0..num_data).map(|_| point()).collect())
                    .collect()
            })
            .collect()
    }

    /// `lead` samples of silence, the frame through the flat channel `h[rx][tx]` with a CFO,
    /// then `tail` samples of silence
    fn transmit(
        tx: &[Vec<Complex<f32>>],
        h: &[Vec<Complex<f32>>],
        cfo: f32,
        lead: usize,
        tail: usize,
    ) -> Vec<Vec<Complex<f32>>> {
        let len = tx[0].len();
        h.iter()
            .map(|row| {
                let mut rx = vec![Complex::zero(); lead];
                for i in 0..len {
                    let x = row
                        .iter()
                        .zip(tx)
                        .fold(Complex::<f32>::zero(), |acc, (hh, t)| acc + hh * t[i]);
                    let rot = Complex::new(0., cfo * (lead + i) as f32).exp();
                    rx.push(x * rot);
                }
                rx.extend(vec![Complex::zero(); tail]);
                rx
            })
            .collect()
    }

    /// White Gaussian noise `snr_db` below unit power on every sample, silences included
    fn add_noise(
        rx: &[Vec<Complex<f32>>],
        snr_db: f32,
        rng: &mut StdRng,
    ) -> Vec<Vec<Complex<f32>>> {
        let sigma = (10f32.powf(-snr_db / 10.) / 2.).sqrt();
        let normal = Normal::new(0., sigma).unwrap();
        rx.iter()
            .map(|stream| {
                stream
                    .iter()
                    .map(|x| x + Complex::new(normal.sample(&mut *rng), normal.sample(&mut *rng)))
                    .collect()
            })
            .collect()
    }

    /// Frames starting at each of `starts` on every stream, silence in between and 400 samples
    /// after the last one. Returns the samples and the payload of each frame.
    fn frames_at(
        fg: &mut FrameGen,
        starts: &[usize],
        rng: &mut StdRng,
    ) -> (Vec<Vec<Complex<f32>>>, Vec<Vec<Vec<Vec<Complex<f32>>>>>) {
        let config = fg.config().clone();
        let num_data = fg.subcarrier_map().num_data();
        let mut tx = vec![Vec::new(); config.num_streams];
        let mut sent = Vec::new();
        for start in starts {
            for stream in tx.iter_mut() {
                stream.resize(*start, Complex::zero());
            }
            let payload = random_payload(&config, num_data, rng);
            fg.write_frame(&payload, &mut tx).unwrap();
            sent.push(payload);
        }
        let end = tx[0].len() + 400;
        for stream in tx.iter_mut() {
            stream.resize(end, Complex::zero());
        }
        (tx, sent)
    }

    /// Every decoded QPSK point lands in the right quadrant
    fn assert_hard_decisions(received: &Received, sent: &[Vec<Vec<Vec<Complex<f32>>>>]) {
        let received = received.borrow();
        let sent: Vec<_> = sent.iter().flatten().collect();
        assert_eq!(received.len(), sent.len());
        for ((_, _, streams), want) in received.iter().zip(sent) {
            for (got, want) in streams.iter().zip(want) {
                for (g, w) in got.iter().zip(want) {
                    assert!(
                        g.re.signum() == w.re.signum() && g.im.signum() == w.im.signum(),
                        "got {} want {}",
                        g,
                        w
                    );
                }
            }
        }
    }

    fn identity(n: usize) -> Vec<Vec<Complex<f32>>> {
        (0..n)
            .map(|r| {
                (0..n)
                    .map(|t| if r == t { Complex::new(1., 0.) } else { Complex::zero() })
                    .collect()
            })
            .collect()
    }

    fn run(sync: &mut FrameSync<impl FnMut(&DecodedSymbol)>, rx: &[Vec<Complex<f32>>]) {
        let bufs: Vec<&[Complex<f32>]> = rx.iter().map(|v| &v[..]).collect();
        sync.execute(&bufs, rx[0].len()).unwrap();
    }

    fn assert_decoded(
        received: &Received,
        sent: &[Vec<Vec<Complex<f32>>>],
        sync_index: u64,
        tol: f32,
    ) {
        let received = received.borrow();
        assert_eq!(received.len(), sent.len());
        for (i, (idx, symbol_index, streams)) in received.iter().enumerate() {
            assert_eq!(*idx, sync_index);
            assert_eq!(*symbol_index, i);
            for (got, want) in streams.iter().zip(&sent[i]) {
                for (g, w) in got.iter().zip(want) {
                    assert!((g - w).norm() < tol, "got {} want {}", g, w);
                }
            }
        }
    }

    #[test]
    fn locks_on_injected_frame() {
        let config = config(1);
        let mut fg = framegen(&config);
        let (mut sync, _) = framesync(&config);
        let mut tx = vec![Vec::new()];
        fg.write_sync_words(&mut tx).unwrap();
        let rx = transmit(&tx, &identity(1), 0., 200, 200);

        let mut seen = Vec::new();
        for (n, x) in rx[0].iter().enumerate() {
            let one = [*x];
            let state = sync.execute(&[&one[..]], 1).unwrap();
            if seen.last() != Some(&state) {
                seen.push(state);
                if state == SyncState::Mimo {
                    assert_eq!(sync.sync_index(), 200);
                    assert!(sync.plateau_start() < sync.plateau_end());
                    assert!(sync.cfo().abs() < 1e-3);
                    assert!(n as u64 >= 200 + config.preamble_len() as u64);
                }
            }
        }
        // Zero gap, so WAIT is never observed between calls
        assert_eq!(
            &seen[..3],
            &[
                SyncState::SeekPlateau,
                SyncState::SaveAccessCodes,
                SyncState::Mimo
            ]
        );
        assert_eq!(sync.num_samples_processed(), rx[0].len() as u64);
    }

    #[test]
    fn noise_does_not_trigger() {
        let config = config(1);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(7);
        let noise: Vec<_> = (0..20000)
            .map(|_| Complex::new(rng.gen_range(-1f32, 1.), rng.gen_range(-1f32, 1.)))
            .collect();
        assert_eq!(
            sync.execute(&[&noise[..]], noise.len()).unwrap(),
            SyncState::SeekPlateau
        );
        assert!(received.borrow().is_empty());
        assert_eq!(sync.sync_index(), 0);
    }

    #[test]
    fn one_lock_per_frame_in_noise() {
        let mut config = config(1);
        config.num_payload_symbols = 2;
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(11);
        let (tx, sent) = frames_at(&mut fg, &[200, 920, 1640], &mut rng);
        let rx = add_noise(&tx, 20., &mut rng);
        run(&mut sync, &rx);

        // The falling edge of each frame into the noise floor must not look like a new frame
        let indices: Vec<_> = received.borrow().iter().map(|r| r.0).collect();
        assert_eq!(indices, vec![200, 200, 920, 920, 1640, 1640]);
        assert_hard_decisions(&received, &sent);
        assert_eq!(sync.state(), SyncState::SeekPlateau);
    }

    #[test]
    fn mixing_channel_in_noise() {
        let mut config = config(2);
        config.num_payload_symbols = 2;
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(12);
        let (tx, sent) = frames_at(&mut fg, &[150, 900], &mut rng);
        let h = vec![
            vec![Complex::new(1., 0.), Complex::new(0.5, 0.)],
            vec![Complex::new(0., 0.2), Complex::new(1., 0.)],
        ];
        let rx = add_noise(&transmit(&tx, &h, 0., 0, 0), 20., &mut rng);
        run(&mut sync, &rx);

        let indices: Vec<_> = received.borrow().iter().map(|r| r.0).collect();
        assert_eq!(indices, vec![150, 150, 900, 900]);
        assert_hard_decisions(&received, &sent);
    }

    #[test]
    fn single_stream_loopback() {
        let mut config = config(1);
        config.num_payload_symbols = 3;
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(1);
        let payload = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new()];
        fg.write_frame(&payload, &mut tx).unwrap();
        let rx = transmit(&tx, &identity(1), 0., 137, 300);
        run(&mut sync, &rx);
        assert_decoded(&received, &payload, 137, 1e-2);
        assert_eq!(sync.state(), SyncState::SeekPlateau);
    }

    #[test]
    fn two_stream_identity_channel() {
        let mut config = config(2);
        config.num_payload_symbols = 2;
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(2);
        let payload = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new(), Vec::new()];
        fg.write_frame(&payload, &mut tx).unwrap();
        let rx = transmit(&tx, &identity(2), 0., 200, 300);
        run(&mut sync, &rx);
        assert_decoded(&received, &payload, 200, 1e-2);

        let g = sync.channel_estimate();
        for j in 0..sync.subcarrier_map().num_active() {
            assert!((g[[0, 0, j]] - g[[1, 1, j]]).norm() < 1e-3);
            assert!(g[[0, 1, j]].norm() < 1e-3 && g[[1, 0, j]].norm() < 1e-3);
        }
    }

    #[test]
    fn two_stream_mixing_channel() {
        let config = config(2);
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(3);
        let payload = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new(), Vec::new()];
        fg.write_frame(&payload, &mut tx).unwrap();
        let h = vec![
            vec![Complex::new(1., 0.), Complex::new(0.5, 0.)],
            vec![Complex::new(0., 0.2), Complex::new(1., 0.)],
        ];
        let rx = transmit(&tx, &h, 0., 200, 300);
        run(&mut sync, &rx);
        assert_decoded(&received, &payload, 200, 1e-2);
    }

    #[test]
    fn carrier_offset_is_estimated_and_removed() {
        let config = config(1);
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(4);
        let payload = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new()];
        fg.write_frame(&payload, &mut tx).unwrap();
        let rx = transmit(&tx, &identity(1), 0.01, 200, 300);

        // Stop once the frame is locked but before its payload symbol is complete
        let lock_by = 200 + config.preamble_len() + 40;
        let bufs = [&rx[0][..lock_by]];
        assert_eq!(sync.execute(&bufs, lock_by).unwrap(), SyncState::Mimo);
        assert!((sync.cfo() - 0.01).abs() < 1e-4);
        assert_eq!(sync.sync_index(), 200);

        let rest = [&rx[0][lock_by..]];
        sync.execute(&rest, rx[0].len() - lock_by).unwrap();
        assert_decoded(&received, &payload, 200, 0.1);
    }

    #[test]
    fn gap_is_skipped() {
        let mut config = config(1);
        config.gap_len = 50;
        config.num_payload_symbols = 2;
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(5);
        let payload = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new()];
        fg.write_frame(&payload, &mut tx).unwrap();
        assert_eq!(tx[0].len(), config.frame_len());
        let rx = transmit(&tx, &identity(1), 0., 200, 300);
        run(&mut sync, &rx);
        assert_decoded(&received, &payload, 200, 1e-2);
    }

    #[test]
    fn chunked_execute_matches_one_shot() {
        let mut config = config(2);
        config.num_payload_symbols = 2;
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(6);
        let payload = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new(), Vec::new()];
        fg.write_frame(&payload, &mut tx).unwrap();
        let rx = transmit(&tx, &identity(2), 0., 90, 300);

        for start in (0..rx[0].len()).step_by(37) {
            let end = (start + 37).min(rx[0].len());
            let bufs = [&rx[0][start..end], &rx[1][start..end]];
            sync.execute(&bufs, end - start).unwrap();
        }
        assert_decoded(&received, &payload, 90, 1e-2);
    }

    #[test]
    fn back_to_back_frames() {
        let config = config(1);
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(8);
        let first = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let second = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![vec![Complex::zero(); 100]];
        fg.write_frame(&first, &mut tx).unwrap();
        tx[0].extend(vec![Complex::zero(); 150]);
        fg.write_frame(&second, &mut tx).unwrap();
        tx[0].extend(vec![Complex::zero(); 300]);
        run(&mut sync, &tx);

        let received = received.borrow();
        let starts: Vec<_> = received.iter().map(|r| r.0).collect();
        let second_start = (100 + config.frame_len() + 150) as u64;
        assert_eq!(starts, vec![100, second_start]);
    }

    #[test]
    fn precoded_frame_is_decoded() {
        let config = config(2);
        let mut fg = framegen(&config);
        let (mut sync, received) = framesync(&config);
        let mut rng = StdRng::seed_from_u64(9);
        let h = vec![
            vec![Complex::new(0.9, 0.1), Complex::new(0.3, -0.4)],
            vec![Complex::new(-0.2, 0.5), Complex::new(0.7, 0.)],
        ];

        // A first frame to learn the channel
        let probe = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new(), Vec::new()];
        fg.write_frame(&probe, &mut tx).unwrap();
        run(&mut sync, &transmit(&tx, &h, 0., 100, 300));
        assert_eq!(received.borrow().len(), 1);

        fg.compute_w(sync.channel_estimate()).unwrap();
        sync.set_precoder(fg.w().clone()).unwrap();
        received.borrow_mut().clear();

        let payload = random_payload(&config, fg.subcarrier_map().num_data(), &mut rng);
        let mut tx = vec![Vec::new(), Vec::new()];
        fg.write_frame(&payload, &mut tx).unwrap();
        run(&mut sync, &transmit(&tx, &h, 0., 100, 300));

        // The sample counter keeps running across calls
        let second_start = (100 + config.frame_len() + 300 + 100) as u64;
        assert_decoded(&received, &payload, second_start, 1e-2);
    }

    #[test]
    fn reset_clears_lock() {
        let config = config(1);
        let mut fg = framegen(&config);
        let (mut sync, _) = framesync(&config);
        let mut tx = vec![Vec::new()];
        fg.write_sync_words(&mut tx).unwrap();
        // Short enough a tail that no payload symbol completes
        let rx = transmit(&tx, &identity(1), 0., 64, 40);
        run(&mut sync, &rx);
        assert_eq!(sync.state(), SyncState::Mimo);
        assert_eq!(sync.sync_index(), 64);

        sync.reset();
        assert_eq!(sync.state(), SyncState::SeekPlateau);
        assert_eq!(sync.sync_index(), 0);
        assert_eq!(sync.plateau_start(), 0);
        assert_eq!(sync.plateau_end(), 0);
        assert_eq!(sync.cfo(), 0.);
        assert_eq!(sync.num_samples_processed(), 0);
        assert!(sync.channel_estimate().iter().all(|x| x.is_zero()));

        // And it still locks afterwards
        run(&mut sync, &rx);
        assert_eq!(sync.sync_index(), 64);
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = config(2);
        config.num_access_codes = 1;
        let (s0, s1) = sequences(&config);
        assert!(matches!(
            FrameSync::new(&config, s0, s1, |_: &DecodedSymbol| {}),
            Err(FramingError::TooFewAccessCodes { streams: 2, codes: 1 })
        ));
    }

    #[test]
    fn buffer_mismatch_is_refused() {
        let config = config(2);
        let (mut sync, _) = framesync(&config);
        let a = vec![Complex::zero(); 10];
        assert!(matches!(
            sync.execute(&[&a[..]], 10),
            Err(FramingError::BufferCount {
                expected: 2,
                got: 1
            })
        ));
        assert!(matches!(
            sync.execute(&[&a[..], &a[..5]], 10),
            Err(FramingError::BufferTooShort { needed: 10, got: 5 })
        ));
        assert_eq!(sync.num_samples_processed(), 0);

        assert!(matches!(
            sync.set_precoder(matrix::identity_stack(1, 3)),
            Err(FramingError::MatrixShape { .. })
        ));
        assert!(sync.to_string().contains("framesync"));
    }
}
