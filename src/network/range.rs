//! Subnet range parsing
//!
//! Accepts either a plain CIDR (`10.0.0.1/24`) or an explicit range with a
//! trailing prefix (`10.0.0.100-10.0.0.200/24`).

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Last octet used as the end of a CIDR-only range
const CIDR_END_OCTET: u8 = 254;

/// Concrete bounds of an allocation range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetRange {
    /// First candidate address (inclusive)
    start: Ipv4Addr,
    /// Scan stops before this address
    end: Ipv4Addr,
    /// Network the allocated addresses belong to
    subnet: Ipv4Net,
}

impl SubnetRange {
    /// Parse a range string
    ///
    /// For the CIDR form the end is the given address with its last octet set
    /// to 254, regardless of the prefix length. For the range form the start
    /// is not checked against the subnet.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidRange {
            input: spec.to_string(),
            reason,
        };

        let parts: Vec<&str> = spec.split('-').collect();
        match parts.as_slice() {
            [cidr] => {
                let net = parse_cidr(cidr).map_err(invalid)?;
                let start = net.addr();
                let mut end = start.octets();
                end[3] = CIDR_END_OCTET;
                Ok(Self {
                    start,
                    end: Ipv4Addr::from(end),
                    subnet: net.trunc(),
                })
            }
            [first, second] if spec.contains('/') => {
                let start = first
                    .parse::<Ipv4Addr>()
                    .map_err(|e| invalid(format!("bad start address '{}': {}", first, e)))?;
                let net = parse_cidr(second).map_err(invalid)?;
                Ok(Self {
                    start,
                    end: net.addr(),
                    subnet: net.trunc(),
                })
            }
            _ => Err(invalid(
                "expected format 10.0.0.100-10.0.0.200/24".to_string(),
            )),
        }
    }

    // Test-only accessors for verifying parsed bounds
    #[cfg(test)]
    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    #[cfg(test)]
    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Addresses from start up to (not including) end, in ascending order
    ///
    /// Empty when start is not below end.
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (u32::from(self.start)..u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl FromStr for SubnetRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SubnetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}/{}",
            self.start,
            self.end,
            self.subnet.prefix_len()
        )
    }
}

fn parse_cidr(text: &str) -> std::result::Result<Ipv4Net, String> {
    text.parse::<Ipv4Net>()
        .map_err(|e| format!("bad CIDR '{}': {}", text, e))
}
