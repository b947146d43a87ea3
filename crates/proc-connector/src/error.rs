use std::io;

use thiserror::Error;

/// Failures of the netlink channel itself.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("process events connector unavailable")]
    Unavailable {
        #[source]
        source: io::Error,
    },
    #[error("subscribing to process events failed: {reason}")]
    SubscribeFailed {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("receiving from process events connector failed")]
    Receive(#[source] io::Error),
    #[error("process events connector already closed")]
    Closed,
}

/// Errors found while interpreting raw bytes as kernel records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("{record} truncated: {needed} bytes needed, {available} available")]
    Truncated {
        record: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{record} declares invalid length {declared}")]
    BadLength {
        record: &'static str,
        declared: usize,
    },
}
