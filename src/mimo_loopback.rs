//! Sends frames from a transmitter thread through a simulated flat MIMO channel (mixing matrix,
//! carrier frequency offset and white noise) to a receiver thread, and reports how many frames
//! were found and how many payload symbols were decoded wrongly.
//!
//! Usage: mimo_loopback [framing.json] [num_frames]
//!
//! Set `RUST_LOG=mimo_framing=debug` to watch the synchronizer.

use failure::Error;
use mimo_framing::{DecodedSymbol, FrameGen, FrameSync, FramingConfig, MSequence};
use num::{Complex, Zero};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Symbol = Vec<Vec<Complex<f32>>>;

#[derive(Clone, Debug)]
pub struct LoopbackConfig {
    framing: FramingConfig,
    /// Silence before every frame
    frame_spacing: usize,
    /// Carrier frequency offset in radians per sample
    cfo: f32,
    /// Noise standard deviation per real dimension
    noise: f32,
    /// Stop after this many frames. 0 runs until Ctrl-C
    num_frames: u64,
}

/// Samples as seen by the receive antennas, along with the payload that went into them
struct Burst {
    samples: Vec<Vec<Complex<f32>>>,
    payload: Vec<Symbol>,
}

#[derive(Debug, Default)]
struct Stats {
    frames: u64,
    missed: u64,
    symbols: u64,
    symbol_errors: u64,
}

/// Flat channel `h[rx][tx]` followed by a frequency offset and AWGN
struct SimChannel {
    h: Vec<Vec<Complex<f32>>>,
    cfo: f32,
    noise: Normal<f32>,
    /// Samples passed so far, so the frequency offset stays phase-continuous
    elapsed: u64,
    rng: StdRng,
}

impl SimChannel {
    fn new(num_streams: usize, cfo: f32, noise: Normal<f32>, mut rng: StdRng) -> Self {
        // Strong direct paths with some leakage between antennas
        let h = (0..num_streams)
            .map(|r| {
                (0..num_streams)
                    .map(|t| {
                        let leak =
                            Complex::new(rng.gen_range(-0.3f32, 0.3), rng.gen_range(-0.3f32, 0.3));
                        if r == t {
                            Complex::new(1., 0.) + leak
                        } else {
                            leak
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            h,
            cfo,
            noise,
            elapsed: 0,
            rng,
        }
    }

    fn apply(&mut self, tx: &[Vec<Complex<f32>>]) -> Vec<Vec<Complex<f32>>> {
        let len = tx[0].len();
        let mut rx = vec![Vec::with_capacity(len); self.h.len()];
        for i in 0..len {
            let phase = (self.cfo as f64 * (self.elapsed + i as u64) as f64)
                % (2. * std::f64::consts::PI);
            let rot = Complex::new(0., phase as f32).exp();
            for r in 0..self.h.len() {
                let x = self.h[r]
                    .iter()
                    .zip(tx)
                    .fold(Complex::<f32>::zero(), |acc, (h, t)| acc + h * t[i]);
                let n = Complex::new(
                    self.noise.sample(&mut self.rng),
                    self.noise.sample(&mut self.rng),
                );
                rx[r].push(x * rot + n);
            }
        }
        self.elapsed += len as u64;
        rx
    }
}

fn sequences(config: &FramingConfig) -> (MSequence, Vec<MSequence>) {
    let m = MSequence::degree_for(config.subcarriers);
    (
        MSequence::maximal(m),
        MSequence::access_codes(m, config.num_access_codes),
    )
}

fn qpsk<R: Rng>(rng: &mut R) -> Complex<f32> {
    let re = if rng.gen::<bool>() { 1. } else { -1. };
    let im = if rng.gen::<bool>() { 1. } else { -1. };
    Complex::new(re, im)
}

/// Loops as a transmitter until signalled to close by `close` or `num_frames` have been sent
fn run_tx(
    config: &LoopbackConfig,
    mut channel: SimChannel,
    out: mpsc::SyncSender<Burst>,
    close: Arc<AtomicBool>,
) -> Result<(), Error> {
    let (s0, s1) = sequences(&config.framing);
    let mut framegen = FrameGen::new(&config.framing, s0, s1)?;
    info!("{}", framegen);
    let num_data = framegen.subcarrier_map().num_data();
    let num_streams = config.framing.num_streams;
    let mut rng = StdRng::seed_from_u64(1);

    let mut sent = 0;
    while !close.load(Ordering::Relaxed) && (config.num_frames == 0 || sent < config.num_frames)
    {
        let payload: Vec<Symbol> = (0..config.framing.num_payload_symbols)
            .map(|_| {
                (0..num_streams)
                    .map(|_| (0..num_data).map(|_| qpsk(&mut rng)).collect())
                    .collect()
            })
            .collect();
        let mut tx = vec![vec![Complex::zero(); config.frame_spacing]; num_streams];
        framegen.write_frame(&payload, &mut tx)?;

        let burst = Burst {
            samples: channel.apply(&tx),
            payload,
        };
        if out.send(burst).is_err() {
            break;
        }
        sent += 1;
    }

    info!(frames = sent, "Tx closed");
    Ok(())
}

/// Loops as a receiver until the transmitter hangs up or `close` is signalled
fn run_rx(
    config: &LoopbackConfig,
    bursts: mpsc::Receiver<Burst>,
    close: Arc<AtomicBool>,
) -> Result<Stats, Error> {
    let decoded: Rc<RefCell<Vec<Symbol>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = decoded.clone();
    let (s0, s1) = sequences(&config.framing);
    let mut sync = FrameSync::new(&config.framing, s0, s1, move |sym: &DecodedSymbol| {
        sink.borrow_mut().push(sym.streams.to_vec());
    })?;
    info!("{}", sync);

    let mut stats = Stats::default();
    while !close.load(Ordering::Relaxed) {
        let burst = match bursts.recv() {
            Ok(burst) => burst,
            Err(_) => break,
        };
        let bufs: Vec<&[Complex<f32>]> = burst.samples.iter().map(|v| &v[..]).collect();
        sync.execute(&bufs, burst.samples[0].len())?;

        stats.frames += 1;
        let got: Vec<Symbol> = decoded.borrow_mut().drain(..).collect();
        if got.len() < burst.payload.len() {
            warn!(frame = stats.frames, "frame missed");
            stats.missed += 1;
            continue;
        }
        for (rx_sym, tx_sym) in got.iter().zip(&burst.payload) {
            for (rx_stream, tx_stream) in rx_sym.iter().zip(tx_sym) {
                for (r, t) in rx_stream.iter().zip(tx_stream) {
                    stats.symbols += 1;
                    if r.re.signum() != t.re.signum() || r.im.signum() != t.im.signum() {
                        stats.symbol_errors += 1;
                    }
                }
            }
        }
    }

    info!(
        frames = stats.frames,
        missed = stats.missed,
        symbols = stats.symbols,
        symbol_errors = stats.symbol_errors,
        "Rx closed"
    );
    Ok(stats)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Register signal handler to stop both threads on Ctrl-C
    let close = Arc::new(AtomicBool::new(false));
    let close_handler = close.clone();
    ctrlc::set_handler(move || {
        close_handler.store(true, Ordering::Relaxed);
    })
    .expect("Error setting Ctrl-C handler");

    let mut args = std::env::args().skip(1);
    let framing = match args.next() {
        Some(fname) => FramingConfig::from_file(&fname).expect("Could not read framing config"),
        None => FramingConfig {
            num_streams: 2,
            num_access_codes: 2,
            num_payload_symbols: 4,
            gap_len: 16,
            ..FramingConfig::default()
        },
    };
    let num_frames = args
        .next()
        .map(|n| n.parse().expect("num_frames must be an integer"))
        .unwrap_or(100);
    let config = LoopbackConfig {
        framing,
        frame_spacing: 500,
        cfo: 0.005,
        noise: 0.01,
        num_frames,
    };

    let channel = SimChannel::new(
        config.framing.num_streams,
        config.cfo,
        Normal::new(0., config.noise).expect("Noise level must be finite and non-negative"),
        StdRng::seed_from_u64(0),
    );
    let (burst_tx, burst_rx) = mpsc::sync_channel(4);

    let close_rx = close.clone();
    let config_rx = config.clone();
    let rx_handle = std::thread::spawn(move || run_rx(&config_rx, burst_rx, close_rx));
    let tx_handle = std::thread::spawn(move || run_tx(&config, channel, burst_tx, close));

    tx_handle.join().unwrap().unwrap();
    let stats = rx_handle.join().unwrap().unwrap();
    println!("{:?}", stats);
}
