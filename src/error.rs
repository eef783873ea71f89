//! Error taxonomy for the acquisition core.
//!
//! Only [`DaqError::TransportTimeout`] and [`DaqError::MalformedBlock`] are
//! transient: the capture loop clears the instrument queue and re-triggers.
//! Every other kind aborts the session after teardown.

use std::io;
use thiserror::Error;

pub type Result<T, E = DaqError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("failed to connect to {addr}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out during {operation}")]
    TransportTimeout { operation: &'static str },

    #[error("socket error")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("malformed data block: expected {expected} bytes, got {actual}")]
    MalformedBlock { expected: usize, actual: usize },

    #[error("instrument error {code}: {message}")]
    Instrument { code: i64, message: String },

    #[error("unsupported {field} value '{value}'")]
    UnsupportedFormat { field: String, value: String },

    #[error("descriptor field {field}: {reason}")]
    Descriptor { field: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unexpected reply to '{query}': '{reply}'")]
    Reply { query: String, reply: String },

    #[error("giving up after {attempts} consecutive failed cycles")]
    RetryLimit {
        attempts: usize,
        #[source]
        last: Box<DaqError>,
    },

    #[error("dataset store error")]
    Store(#[from] hdf5::Error),
}

impl DaqError {
    /// Failures the capture loop retries at cycle granularity.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaqError::TransportTimeout { .. } | DaqError::MalformedBlock { .. }
        )
    }

    /// Classify a socket error raised while performing `operation`.
    pub fn from_io(operation: &'static str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                DaqError::TransportTimeout { operation }
            }
            _ => DaqError::Io(err),
        }
    }

    pub(crate) fn descriptor(field: &str, reason: impl Into<String>) -> Self {
        DaqError::Descriptor {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(field: &str, value: impl Into<String>) -> Self {
        DaqError::UnsupportedFormat {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub(crate) fn reply(query: &str, reply: &str) -> Self {
        DaqError::Reply {
            query: query.to_string(),
            reply: reply.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_short_blocks_are_transient() {
        assert!(DaqError::TransportTimeout { operation: "receive" }.is_transient());
        assert!(DaqError::MalformedBlock {
            expected: 10,
            actual: 4
        }
        .is_transient());
        assert!(!DaqError::Framing("bad header".into()).is_transient());
        assert!(!DaqError::Instrument {
            code: 5,
            message: "unrecognized keyword".into()
        }
        .is_transient());
        assert!(!DaqError::Configuration("sequence".into()).is_transient());
    }

    #[test]
    fn io_timeouts_map_to_transport_timeout() {
        let err = DaqError::from_io("receive", io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(
            err,
            DaqError::TransportTimeout {
                operation: "receive"
            }
        ));
        let err = DaqError::from_io("receive", io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, DaqError::Io(_)));
    }
}
