use failure::Fail;

/// Everything that can go wrong while building or driving a framer. Signal quality problems
/// (no detection, bad plateaus, poor channel estimates) are not errors and never show up here.
#[derive(Debug, Fail)]
pub enum FramingError {
    #[fail(display = "number of subcarriers must be non-zero")]
    ZeroSubcarriers,
    #[fail(display = "number of subcarriers must be even, got {}", _0)]
    OddSubcarriers(usize),
    #[fail(display = "need at least {} subcarriers for the default allocation, got {}", min, got)]
    TooFewSubcarriers { min: usize, got: usize },
    #[fail(display = "cyclic prefix length {} exceeds symbol length {}", cp_len, subcarriers)]
    CyclicPrefixTooLong { cp_len: usize, subcarriers: usize },
    #[fail(display = "allocation has {} entries, expected {}", got, expected)]
    AllocationLength { expected: usize, got: usize },
    #[fail(
        display = "allocation counts do not add up: {} null + {} pilot + {} data != {}",
        null, pilot, data, total
    )]
    AllocationCounts {
        null: usize,
        pilot: usize,
        data: usize,
        total: usize,
    },
    #[fail(display = "unknown subcarrier type {:?}", _0)]
    UnknownSubcarrierType(char),
    #[fail(display = "allocation has no data subcarriers")]
    NoDataSubcarriers,
    #[fail(display = "allocation leaves no even active subcarrier for the short sequence")]
    EmptyShortSequence,
    #[fail(display = "number of streams must be non-zero")]
    ZeroStreams,
    #[fail(display = "expected {} long-sequence generators, got {}", expected, got)]
    AccessCodeMismatch { expected: usize, got: usize },
    #[fail(display = "{} streams need at least as many access codes, got {}", streams, codes)]
    TooFewAccessCodes { streams: usize, codes: usize },
    #[fail(display = "frames must carry at least one payload symbol")]
    ZeroPayloadSymbols,
    #[fail(display = "plateau threshold must lie in (0, 1], got {}", _0)]
    InvalidThreshold(f32),
    #[fail(display = "expected {} stream buffers, got {}", expected, got)]
    BufferCount { expected: usize, got: usize },
    #[fail(display = "stream buffer holds {} samples, {} requested", got, needed)]
    BufferTooShort { needed: usize, got: usize },
    #[fail(display = "expected {} data symbols per stream, got {}", expected, got)]
    DataLength { expected: usize, got: usize },
    #[fail(display = "matrix has shape {:?}, expected {:?}", got, expected)]
    MatrixShape {
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },
    #[fail(display = "could not read config: {}", _0)]
    Io(#[fail(cause)] std::io::Error),
    #[fail(display = "could not parse config: {}", _0)]
    Json(#[fail(cause)] serde_json::Error),
}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        FramingError::Io(e)
    }
}

impl From<serde_json::Error> for FramingError {
    fn from(e: serde_json::Error) -> Self {
        FramingError::Json(e)
    }
}
