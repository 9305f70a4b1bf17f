use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SpindleError;

/// (host, port) identifying a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndPoint {
    host: String,
    port: u16,
}

impl EndPoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndPoint {
    type Err = SpindleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SpindleError::argument(format!("end point without port: {s}")))?;
        if host.is_empty() {
            return Err(SpindleError::argument(format!("end point without host: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| SpindleError::argument(format!("bad port in {s}: {e}")))?;
        Ok(Self::new(host, port))
    }
}
