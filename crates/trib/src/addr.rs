//! Node addresses.

use std::fmt;
use std::str::FromStr;

use crate::error::AdminError;

/// A `host:port` pair as used to reach a node's client port.
///
/// IPv6 hosts are stored without brackets and rendered with them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddr {
    type Err = AdminError;

    /// Accepts `host:port`, `[v6]:port` and the gossip form
    /// `host:port@cport[,hostname]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AdminError::InvalidAddress {
            addr: s.to_string(),
            reason: reason.to_string(),
        };

        let client = s.split_once('@').map_or(s, |(client, _)| client);

        let (host, port) = if let Some(rest) = client.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| invalid("expected [host]:port"))?;
            (host, port)
        } else {
            client
                .rsplit_once(':')
                .ok_or_else(|| invalid("expected host:port"))?
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid(&format!("invalid port '{port}'")))?;

        Ok(NodeAddr::new(host, port))
    }
}
