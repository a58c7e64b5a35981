//! Allow-rule data structures and iptables argument generation
//!
//! This module defines the rules hostprep enforces and the seam through which
//! they reach the kernel.
//!
//! # Rule Structure
//!
//! An [`AllowRule`] is an immutable ACCEPT predicate on the `INPUT` chain:
//! - a proxy rule matches one source CIDR, TCP, and one destination port
//! - the loopback rule matches everything arriving on `lo`
//!
//! Rules are independent of each other, so the order in which they are
//! inserted does not change the resulting policy.
//!
//! # Example
//!
//! ```
//! use hostprep::core::firewall::AllowList;
//!
//! let list = AllowList::cloudflare(8080).unwrap();
//! assert_eq!(list.len(), 16);
//! assert!(list.rules()[0].is_loopback());
//! ```

use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

/// Chain all allow-rules live in
pub const INPUT_CHAIN: &str = "INPUT";

/// Loopback interface name
pub const LOOPBACK_INTERFACE: &str = "lo";

/// Cloudflare's published IPv4 ranges (<https://www.cloudflare.com/ips-v4>)
pub const CLOUDFLARE_IPV4_RANGES: [&str; 15] = [
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
];

/// Parses [`CLOUDFLARE_IPV4_RANGES`].
pub fn cloudflare_ranges() -> Result<Vec<IpNetwork>> {
    CLOUDFLARE_IPV4_RANGES
        .iter()
        .map(|s| {
            crate::validators::validate_cidr(s)
                .map_err(|message| Error::validation("proxy_ranges", message))
        })
        .collect()
}

/// Network protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Protocol {
    /// Match all protocols
    #[strum(serialize = "all")]
    Any,
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
}

/// A single ACCEPT rule on the `INPUT` chain.
///
/// Two rules are equivalent when all match fields are equal; that is also the
/// notion of equivalence `iptables -C` uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowRule {
    source: Option<IpNetwork>,
    interface: Option<String>,
    protocol: Protocol,
    port: Option<u16>,
}

impl AllowRule {
    /// Allows TCP traffic from `source` to `port`.
    pub fn proxy(source: IpNetwork, port: u16) -> Self {
        Self {
            source: Some(source),
            interface: None,
            protocol: Protocol::Tcp,
            port: Some(port),
        }
    }

    /// Allows all traffic arriving on the loopback interface.
    pub fn loopback() -> Self {
        Self {
            source: None,
            interface: Some(LOOPBACK_INTERFACE.to_string()),
            protocol: Protocol::Any,
            port: None,
        }
    }

    pub fn source(&self) -> Option<IpNetwork> {
        self.source
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_loopback(&self) -> bool {
        self.interface.as_deref() == Some(LOOPBACK_INTERFACE)
    }

    /// Rule specification as passed to `iptables -C/-A/-I <chain> ...`.
    ///
    /// Arguments are returned as a vector and never joined into a shell string.
    pub fn to_iptables_spec(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(10);

        if let Some(iface) = &self.interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }
        if let Some(source) = self.source {
            args.push("-s".to_string());
            args.push(source.to_string());
        }
        if self.protocol != Protocol::Any {
            args.push("-p".to_string());
            args.push(self.protocol.to_string());
        }
        if let Some(port) = self.port {
            args.push("--dport".to_string());
            args.push(port.to_string());
        }
        args.push("-j".to_string());
        args.push("ACCEPT".to_string());
        args
    }
}

impl fmt::Display for AllowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_loopback() {
            return write!(f, "accept all on {LOOPBACK_INTERFACE}");
        }
        let source = self
            .source
            .map_or_else(|| "any".to_string(), |s| s.to_string());
        match self.port {
            Some(port) => write!(f, "accept {} from {source} to port {port}", self.protocol),
            None => write!(f, "accept {} from {source}", self.protocol),
        }
    }
}

/// The full set of rules enforced for one service port.
///
/// Always starts with the loopback rule, followed by one proxy rule per range
/// in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    port: u16,
    rules: Vec<AllowRule>,
}

impl AllowList {
    /// Builds the allow-list for `port` from explicit proxy ranges.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the port is 0, a range is IPv6 or has host bits set,
    /// or a range appears twice.
    pub fn new(ranges: &[IpNetwork], port: u16) -> Result<Self> {
        crate::validators::validate_port(port)
            .map_err(|message| Error::validation("port", message))?;

        let mut seen = HashSet::with_capacity(ranges.len());
        let mut rules = Vec::with_capacity(ranges.len() + 1);
        rules.push(AllowRule::loopback());

        for range in ranges {
            if !range.is_ipv4() {
                return Err(Error::validation(
                    "proxy_ranges",
                    format!("{range} is not an IPv4 range; only iptables (IPv4) is managed"),
                ));
            }
            let range = crate::validators::check_network_address(*range)
                .map_err(|message| Error::validation("proxy_ranges", message))?;
            if !seen.insert(range) {
                return Err(Error::validation(
                    "proxy_ranges",
                    format!("{range} is listed more than once"),
                ));
            }
            rules.push(AllowRule::proxy(range, port));
        }

        Ok(Self { port, rules })
    }

    /// Builds the allow-list for `port` from the Cloudflare IPv4 ranges.
    pub fn cloudflare(port: u16) -> Result<Self> {
        Self::new(&cloudflare_ranges()?, port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn rules(&self) -> &[AllowRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Access to the host's active firewall rule set.
///
/// The iptables implementation lives in [`crate::core::iptables`]; tests use
/// an in-memory fake.
#[allow(async_fn_in_trait)]
pub trait Firewall {
    /// Returns whether an equivalent rule is already active.
    async fn rule_exists(&self, rule: &AllowRule) -> Result<bool>;

    /// Adds `rule` to the active rule set.
    async fn insert_rule(&self, rule: &AllowRule) -> Result<()>;

    /// Writes the active rule set to durable storage and returns where.
    async fn persist(&self) -> Result<PathBuf>;
}
