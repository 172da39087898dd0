//! CNI plugin protocol
//!
//! Decodes the network configuration passed on stdin and builds the JSON
//! documents written to stdout.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Spec versions this plugin can answer for
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Version reported when the configuration does not name one
pub const DEFAULT_VERSION: &str = "0.4.0";

/// Operation requested through `CNI_COMMAND`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Add,
    Del,
    Check,
    Get,
    Version,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Add => "ADD",
            Verb::Del => "DEL",
            Verb::Check => "CHECK",
            Verb::Get => "GET",
            Verb::Version => "VERSION",
        };
        f.write_str(name)
    }
}

impl FromStr for Verb {
    type Err = Error;

    /// Match a `CNI_COMMAND` value, ignoring case
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ADD" => Ok(Verb::Add),
            "DEL" => Ok(Verb::Del),
            "CHECK" => Ok(Verb::Check),
            "GET" => Ok(Verb::Get),
            "VERSION" => Ok(Verb::Version),
            _ => Err(Error::UnknownCommand(s.to_string())),
        }
    }
}

/// Network configuration as received on stdin
#[derive(Debug, Deserialize)]
pub struct NetConf {
    #[serde(default)]
    pub name: String,

    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,

    pub ipam: Option<IpamSection>,
}

/// The `ipam` block of the network configuration
#[derive(Debug, Deserialize)]
pub struct IpamSection {
    #[serde(default, alias = "subnetRange")]
    pub subnet_range: String,

    #[serde(default)]
    pub gateway: String,
}

/// Validated IPAM configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamConfig {
    pub network: String,
    pub cni_version: String,
    pub subnet_range: String,
    pub gateway: Ipv4Addr,
}

impl IpamConfig {
    /// Decode and validate a network configuration
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)?;

        let ipam = conf
            .ipam
            .ok_or_else(|| Error::ConfigValidation("config missing 'ipam' key".into()))?;

        if ipam.subnet_range.is_empty() {
            return Err(Error::ConfigValidation(
                "IPAM config missing 'subnet_range' key".into(),
            ));
        }

        if ipam.gateway.is_empty() {
            return Err(Error::ConfigValidation(
                "IPAM config missing 'gateway' key".into(),
            ));
        }

        let gateway = ipam.gateway.parse::<Ipv4Addr>().map_err(|e| {
            Error::ConfigValidation(format!("IPAM gateway '{}': {}", ipam.gateway, e))
        })?;

        let cni_version = if conf.cni_version.is_empty() {
            DEFAULT_VERSION.to_string()
        } else {
            conf.cni_version
        };

        Ok(Self {
            network: conf.name,
            cni_version,
            subnet_range: ipam.subnet_range,
            gateway,
        })
    }

    /// Read the configuration from a stream (normally stdin)
    pub fn read_from(mut reader: impl Read) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_slice(&bytes)
    }
}

/// One assigned address
#[derive(Debug, Serialize)]
pub struct IpConfig {
    /// Only present in pre-1.0 results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'static str>,
    pub address: String,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Serialize)]
pub struct Route {
    pub dst: String,
    pub gw: Ipv4Addr,
}

#[derive(Debug, Default, Serialize)]
pub struct Dns {}

/// Successful ADD result
#[derive(Debug, Serialize)]
pub struct AddResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub ips: Vec<IpConfig>,
    pub routes: Vec<Route>,
    pub dns: Dns,
}

impl AddResult {
    /// Result for an allocated address with a default route via the gateway
    pub fn new(config: &IpamConfig, addr: Ipv4Addr, subnet: Ipv4Net) -> Self {
        let version = config.cni_version.starts_with("0.").then_some("4");
        Self {
            cni_version: config.cni_version.clone(),
            ips: vec![IpConfig {
                version,
                address: format!("{}/{}", addr, subnet.prefix_len()),
                gateway: config.gateway,
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".into(),
                gw: config.gateway,
            }],
            dns: Dns::default(),
        }
    }
}

/// Reply to VERSION
#[derive(Debug, Serialize)]
pub struct VersionReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: &'static str,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: &'static [&'static str],
}

impl Default for VersionReply {
    fn default() -> Self {
        Self {
            cni_version: SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1],
            supported_versions: SUPPORTED_VERSIONS,
        }
    }
}

/// Error document written to stdout on failure
#[derive(Debug, Serialize)]
pub struct ErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
}

impl ErrorReply {
    pub fn new(error: &Error, cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: error.cni_code(),
            msg: error.to_string(),
        }
    }
}
