//! Hardware address type with safe parsing and formatting.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A link-layer hardware address of any length.
///
/// Team devices are not restricted to Ethernet, so the length is whatever
/// the kernel reports for the device (6 for Ethernet, 20 for InfiniBand).
///
/// # Examples
///
/// ```
/// use teamd_types::HwAddr;
///
/// let addr: HwAddr = "00:11:22:33:44:55".parse().unwrap();
/// assert_eq!(addr.len(), 6);
/// assert_eq!(addr.to_string(), "00:11:22:33:44:55");
///
/// // Whitespace around separators is tolerated
/// let spaced: HwAddr = "00 : 11:22:33:44:55".parse().unwrap();
/// assert_eq!(addr, spaced);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HwAddr(Vec<u8>);

impl HwAddr {
    /// Creates a hardware address from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        HwAddr(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the address length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a zero-length address.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for HwAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidHwAddr(s.to_string());

        let mut bytes = Vec::new();
        for part in s.split(':') {
            let part = part.trim();
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            bytes.push(u8::from_str_radix(part, 16).map_err(|_| invalid())?);
        }

        Ok(HwAddr(bytes))
    }
}

impl TryFrom<String> for HwAddr {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<HwAddr> for String {
    fn from(addr: HwAddr) -> String {
        addr.to_string()
    }
}

impl From<&[u8]> for HwAddr {
    fn from(bytes: &[u8]) -> Self {
        HwAddr(bytes.to_vec())
    }
}

impl AsRef<[u8]> for HwAddr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
