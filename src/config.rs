use crate::error::FramingError;
use crate::subcarrier::SubcarrierMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Static configuration shared by a frame generator and the synchronizer listening to it. Cannot
/// be changed once a framer is built.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Number of subcarriers M (also the transform length)
    pub subcarriers: usize,
    /// Cyclic prefix length in samples
    pub cp_len: usize,
    /// Number of spatial streams. The same number of transmit and receive antennas is assumed
    pub num_streams: usize,
    /// Number of long training symbols (access codes) in the preamble
    pub num_access_codes: usize,
    /// OFDM symbols of payload following the preamble
    pub num_payload_symbols: usize,
    /// Silent samples between the preamble and the first payload symbol
    pub gap_len: usize,
    /// Delay-correlator metric at which a plateau starts, in (0, 1]
    pub plateau_threshold: f32,
    /// Subcarrier allocation in text form (see `SubcarrierMap`). The default allocation is used
    /// when absent
    pub allocation: Option<String>,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            subcarriers: 64,
            cp_len: 16,
            num_streams: 1,
            num_access_codes: 1,
            num_payload_symbols: 1,
            gap_len: 0,
            plateau_threshold: 0.7,
            allocation: None,
        }
    }
}

impl FramingConfig {
    /// Read a JSON config. Missing fields take their default values
    pub fn from_file(fname: &str) -> Result<Self, FramingError> {
        let data = std::fs::read_to_string(fname)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, FramingError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that does not depend on the sequence generators
    pub fn validate(&self) -> Result<(), FramingError> {
        if self.subcarriers == 0 {
            return Err(FramingError::ZeroSubcarriers);
        }
        // The short symbol repeats every M/2 samples, which needs M even
        if self.subcarriers % 2 != 0 {
            return Err(FramingError::OddSubcarriers(self.subcarriers));
        }
        if self.cp_len > self.subcarriers {
            return Err(FramingError::CyclicPrefixTooLong {
                cp_len: self.cp_len,
                subcarriers: self.subcarriers,
            });
        }
        if self.num_streams == 0 {
            return Err(FramingError::ZeroStreams);
        }
        if self.num_access_codes < self.num_streams {
            return Err(FramingError::TooFewAccessCodes {
                streams: self.num_streams,
                codes: self.num_access_codes,
            });
        }
        if self.num_payload_symbols == 0 {
            return Err(FramingError::ZeroPayloadSymbols);
        }
        if !(self.plateau_threshold > 0. && self.plateau_threshold <= 1.) {
            return Err(FramingError::InvalidThreshold(self.plateau_threshold));
        }
        Ok(())
    }

    /// Allocation from the config, or the default one for this many subcarriers
    pub fn subcarrier_map(&self) -> Result<SubcarrierMap, FramingError> {
        match &self.allocation {
            Some(text) => {
                let map: SubcarrierMap = text.parse()?;
                if map.len() != self.subcarriers {
                    return Err(FramingError::AllocationLength {
                        expected: self.subcarriers,
                        got: map.len(),
                    });
                }
                Ok(map)
            }
            None => SubcarrierMap::default_for(self.subcarriers),
        }
    }

    /// Samples per OFDM symbol including the cyclic prefix
    pub fn symbol_len(&self) -> usize {
        self.subcarriers + self.cp_len
    }

    /// Samples in the preamble (S0 and every S1, each with its cyclic prefix)
    pub fn preamble_len(&self) -> usize {
        (1 + self.num_access_codes) * self.symbol_len()
    }

    /// Samples in a complete frame
    pub fn frame_len(&self) -> usize {
        self.preamble_len() + self.gap_len + self.num_payload_symbols * self.symbol_len()
    }
}

impl fmt::Display for FramingConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "    subcarriers         : {}", self.subcarriers)?;
        writeln!(f, "    cyclic prefix       : {}", self.cp_len)?;
        writeln!(f, "    streams             : {}", self.num_streams)?;
        writeln!(f, "    access codes        : {}", self.num_access_codes)?;
        writeln!(f, "    payload symbols     : {}", self.num_payload_symbols)?;
        writeln!(f, "    gap                 : {}", self.gap_len)?;
        write!(f, "    plateau threshold   : {}", self.plateau_threshold)
    }
}
