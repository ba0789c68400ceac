//! Link property types.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Link duplex mode of a member port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Duplex {
    /// Half duplex.
    Half,
    /// Full duplex.
    Full,
    /// Not reported (link down or virtual device).
    #[default]
    Unknown,
}

impl Duplex {
    /// Returns the duplex as the lowercase string used in state dumps.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Duplex::Half => "half",
            Duplex::Full => "full",
            Duplex::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Duplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Duplex {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "half" => Ok(Duplex::Half),
            "full" => Ok(Duplex::Full),
            "unknown" | "" => Ok(Duplex::Unknown),
            _ => Err(ParseError::InvalidDuplex(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplex_parse() {
        assert_eq!("full".parse::<Duplex>().unwrap(), Duplex::Full);
        assert_eq!("Half\n".parse::<Duplex>().unwrap(), Duplex::Half);
        assert_eq!("unknown".parse::<Duplex>().unwrap(), Duplex::Unknown);
        assert!("quarter".parse::<Duplex>().is_err());
    }

    #[test]
    fn test_duplex_display() {
        assert_eq!(Duplex::Full.to_string(), "full");
        assert_eq!(Duplex::default(), Duplex::Unknown);
    }
}
