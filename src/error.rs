//! Error types for the relaybox DNS proxy.

use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// Main error type for relaybox operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    #[error("upstream exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("listener error: {0}")]
    Listen(#[from] ListenError),

    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] Box<toml::de::Error>),

    #[error("invalid listen address: {0}")]
    InvalidListenAddr(#[source] AddrParseError),

    #[error("invalid upstream spec {spec:?}: {reason}")]
    InvalidUpstream { spec: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Errors produced while exchanging a query with an upstream server.
///
/// The variants mirror the failure taxonomy used by upstream selection:
/// only [`ExchangeError::Timeout`] and [`ExchangeError::Connection`] are
/// retried against fallback upstreams, everything else surfaces to the
/// caller unchanged.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("upstream {address} timed out")]
    Timeout { address: String },

    #[error("connecting to upstream {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("malformed response from upstream {address}: {reason}")]
    Protocol { address: String, reason: String },

    #[error("upstream {address} answered with rcode {rcode}")]
    ServerRcode { address: String, rcode: u16 },

    #[error("no upstreams available for the query")]
    NoUpstreams,
}

impl ExchangeError {
    /// Whether fallback upstreams should be consulted after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { .. } | Self::NoUpstreams
        )
    }

    pub(crate) fn connection(address: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Connection {
            address: address.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn protocol(address: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Protocol {
            address: address.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn timeout(address: impl Into<String>) -> Self {
        Self::Timeout {
            address: address.into(),
        }
    }
}

/// Errors raised while binding or driving listeners.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS material: {0}")]
    TlsSetup(String),

    #[error("QUIC endpoint error: {0}")]
    Quic(String),

    #[error("server has already been started")]
    AlreadyStarted,
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_retryable_exchange_errors() {
        assert!(ExchangeError::timeout("udp://1.1.1.1:53").is_retryable());
        assert!(ExchangeError::connection("tcp://1.1.1.1:53", "refused").is_retryable());
        assert!(ExchangeError::NoUpstreams.is_retryable());

        assert!(!ExchangeError::protocol("udp://1.1.1.1:53", "bad header").is_retryable());
        assert!(!ExchangeError::ServerRcode {
            address: "udp://1.1.1.1:53".into(),
            rcode: 2,
        }
        .is_retryable());
    }
}
