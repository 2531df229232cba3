//! Subcarrier allocation. Every one of the M subcarriers is either unused (null), carries a known
//! pilot, or carries data. The text form uses the key
//!
//! `.` null, `P` pilot, `+` data, e.g. `.+++P+++++++P.........P+++++++P+++`
//!
//! Index 0 is the DC subcarrier, indices above M/2 are the negative frequencies.

use crate::error::FramingError;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubcarrierType {
    Null,
    Pilot,
    Data,
}

impl SubcarrierType {
    /// Byte code used by raw allocations: 0 null, 1 pilot, 2 data
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SubcarrierType::Null),
            1 => Some(SubcarrierType::Pilot),
            2 => Some(SubcarrierType::Data),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != SubcarrierType::Null
    }

    fn key(self) -> char {
        match self {
            SubcarrierType::Null => '.',
            SubcarrierType::Pilot => 'P',
            SubcarrierType::Data => '+',
        }
    }
}

/// Validated, immutable subcarrier allocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubcarrierMap {
    types: Vec<SubcarrierType>,
    num_null: usize,
    num_pilot: usize,
    num_data: usize,
    /// Indices of pilot and data subcarriers, ascending
    active: Vec<usize>,
    /// Indices of data subcarriers, ascending
    data: Vec<usize>,
    /// Position of each data subcarrier within `active`
    data_in_active: Vec<usize>,
}

impl SubcarrierMap {
    /// Default allocation: DC and a guard band around the band edge are null, pilots are spread
    /// periodically among the data subcarriers
    pub fn default_for(m: usize) -> Result<Self, FramingError> {
        if m == 0 {
            return Err(FramingError::ZeroSubcarriers);
        }
        if m < 6 {
            return Err(FramingError::TooFewSubcarriers { min: 6, got: m });
        }
        let half = m / 2;
        let guard = (m / 10).max(1);
        let spacing = if m > 34 { 8 } else { 4 };

        let mut types = vec![SubcarrierType::Null; m];
        for i in 1..half.saturating_sub(guard) {
            let t = if (i + spacing / 2) % spacing == 0 {
                SubcarrierType::Pilot
            } else {
                SubcarrierType::Data
            };
            types[i] = t;
            types[m - i] = t;
        }
        Self::from_types(types, m)
    }

    /// Validate a raw allocation given as byte codes (see `SubcarrierType::from_code`)
    pub fn from_codes(codes: &[u8], m: usize) -> Result<Self, FramingError> {
        if codes.len() != m {
            return Err(FramingError::AllocationLength {
                expected: m,
                got: codes.len(),
            });
        }
        let types: Vec<_> = codes
            .iter()
            .filter_map(|c| SubcarrierType::from_code(*c))
            .collect();
        Self::from_types(types, m)
    }

    /// Tally the tags and check that they reconcile to `m`
    pub fn from_types(types: Vec<SubcarrierType>, m: usize) -> Result<Self, FramingError> {
        if m == 0 {
            return Err(FramingError::ZeroSubcarriers);
        }
        let count = |t| types.iter().filter(|x| **x == t).count();
        let (num_null, num_pilot, num_data) = (
            count(SubcarrierType::Null),
            count(SubcarrierType::Pilot),
            count(SubcarrierType::Data),
        );
        if num_null + num_pilot + num_data != m || types.len() != m {
            return Err(FramingError::AllocationCounts {
                null: num_null,
                pilot: num_pilot,
                data: num_data,
                total: m,
            });
        }
        if num_data == 0 {
            return Err(FramingError::NoDataSubcarriers);
        }

        let active: Vec<usize> = (0..m).filter(|i| types[*i].is_active()).collect();
        let data: Vec<usize> = (0..m)
            .filter(|i| types[*i] == SubcarrierType::Data)
            .collect();
        let data_in_active = active
            .iter()
            .enumerate()
            .filter(|(_, k)| types[**k] == SubcarrierType::Data)
            .map(|(j, _)| j)
            .collect();

        Ok(Self {
            types,
            num_null,
            num_pilot,
            num_data,
            active,
            data,
            data_in_active,
        })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn get(&self, i: usize) -> SubcarrierType {
        self.types[i]
    }

    pub fn types(&self) -> &[SubcarrierType] {
        &self.types
    }

    /// (null, pilot, data)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.num_null, self.num_pilot, self.num_data)
    }

    pub fn num_active(&self) -> usize {
        self.num_pilot + self.num_data
    }

    pub fn num_data(&self) -> usize {
        self.num_data
    }

    pub fn active_indices(&self) -> &[usize] {
        &self.active
    }

    pub fn data_indices(&self) -> &[usize] {
        &self.data
    }

    /// For the q-th data subcarrier, its position among the active subcarriers. Channel
    /// estimates are indexed by active position, precoders by data position.
    pub fn data_in_active(&self) -> &[usize] {
        &self.data_in_active
    }

    /// Time-domain scaling that gives unit average power when every active subcarrier carries a
    /// unit-magnitude value
    pub fn active_gain(&self) -> f32 {
        1. / (self.num_active() as f32).sqrt()
    }
}

impl fmt::Display for SubcarrierMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for t in &self.types {
            write!(f, "{}", t.key())?;
        }
        Ok(())
    }
}

impl FromStr for SubcarrierMap {
    type Err = FramingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let types = s
            .trim()
            .chars()
            .map(|c| match c {
                '.' => Ok(SubcarrierType::Null),
                'P' => Ok(SubcarrierType::Pilot),
                '+' => Ok(SubcarrierType::Data),
                c => Err(FramingError::UnknownSubcarrierType(c)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let m = types.len();
        Self::from_types(types, m)
    }
}
