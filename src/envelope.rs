use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::TunnelError, remote::Remote};

// Subprotocol string for the outer WebSocket handshake. The server matches
// it exactly; a mismatch means an incompatible peer.
pub const PROTOCOL_VERSION: &str = "chisel-v3";

// Version string reported by `/version` and carried in the config envelope.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

// Configuration envelope exchanged once per session, immediately after the
// SSH handshake. Remotes travel in their shorthand encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Envelope {
    pub(crate) version: String,
    pub(crate) remotes: Vec<String>,
}

impl Envelope {
    pub(crate) fn new(remotes: &[Remote]) -> Self {
        Envelope {
            version: BUILD_VERSION.to_string(),
            remotes: remotes.iter().map(Remote::encode).collect(),
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self, TunnelError> {
        serde_json::from_slice(data).map_err(|_| TunnelError::InvalidConfig)
    }

    pub(crate) fn decode_remotes(&self) -> Result<Vec<Remote>, TunnelError> {
        self.remotes.iter().map(|spec| Remote::decode(spec)).collect()
    }
}

// Environment override with the `CHISEL_` prefix, e.g. `CHISEL_SSH_WAIT=50s`.
pub(crate) fn env_duration(name: &str, default: Duration) -> Duration {
    std::env::var(format!("CHISEL_{name}"))
        .ok()
        .and_then(|value| humantime::parse_duration(&value).ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(format!("CHISEL_{name}"))
        .ok()
        .and_then(|value| value.parse().ok())
}
