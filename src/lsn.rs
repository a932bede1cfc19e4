use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid LSN: {0}")]
pub struct ParseLsnError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timeline id: {0}")]
pub struct ParseTimelineError(pub String);

/// Byte position in the write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    /// Parse the `X/X` form used by the server (`16/B374D848`).
    pub fn parse(s: &str) -> Result<Lsn, ParseLsnError> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ParseLsnError(s.into()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.into()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.into()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }

    #[inline]
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn low(self) -> u32 {
        self.0 as u32
    }

    pub fn to_pg_string(self) -> String {
        format!("{:X}/{:X}", self.high(), self.low())
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

/// Identifier of a branch of WAL history. A new timeline starts at every promotion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimelineId(pub u32);

impl TimelineId {
    pub fn parse(s: &str) -> Result<TimelineId, ParseTimelineError> {
        s.trim()
            .parse::<u32>()
            .map(TimelineId)
            .map_err(|_| ParseTimelineError(s.into()))
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TimelineId {
    type Err = ParseTimelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimelineId::parse(s)
    }
}
