//! Framing and synchronization for a MIMO OFDM link. Every frame has the following structure on
//! each of the N transmit streams:
//!
//! <S0> <S1_0> ... <S1_{A-1}> <gap> <X_0> ... <X_{K-1}>
//!
//! S0:
//!  - Short training symbol. Only even subcarriers are loaded so it repeats every M/2 samples.
//!    Sent on every stream. Used for detection, coarse timing and carrier frequency offset
//!
//! S1 (access codes):
//!  - Long training symbols, each from its own m-sequence. Symbol `a` is sent by stream
//!    `a % N` alone, so each gives one column of the channel matrix
//!
//! X (payload):
//!  - Data subcarriers carry (optionally precoded) stream data, pilots carry 1
//!
//! Every symbol is preceded by a cyclic prefix. `FrameGen` writes frames, `FrameSync` finds them
//! in a sample stream and decodes the payload.

pub mod cfo;
pub mod config;
pub mod equalization;
pub mod error;
pub mod framegen;
pub mod framesync;
pub mod kernel;
pub mod lts_align;
pub mod matrix;
pub mod msequence;
pub mod plateau;
pub mod subcarrier;
pub mod training;

pub use config::FramingConfig;
pub use error::FramingError;
pub use framegen::FrameGen;
pub use framesync::{DecodedSymbol, FrameSync, SyncState};
pub use kernel::{NumericKernel, RustFftKernel};
pub use msequence::{MSequence, SequenceSource};
pub use subcarrier::{SubcarrierMap, SubcarrierType};
pub use training::{Preamble, TrainingSequence};
