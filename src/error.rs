//! Crate-wide error type.  All failures in the protocol stack are fatal: the
//! core never retries, the caller decides whether to reset and reopen the
//! session.

use crate::jtag::TapState;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The underlying USB transport reported a failure, or a finalizing
    /// execute left unread bytes in the device's receive buffer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device returned something other than what the protocol requires,
    /// e.g. a wrong startup sanity-check readback or a byte-count mismatch.
    #[error("protocol desynchronization: {0}")]
    ProtocolDesync(String),

    /// A TAP operation was requested from a state it is not legal in.
    #[error("{op} not permitted in TAP state {from:?}")]
    StateTransition { from: TapState, op: &'static str },

    /// An invalid configuration value (word count, USER register selector).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The API was used outside its contract, e.g. decoding a handle that
    /// the last execute did not finalize.
    #[error("usage error: {0}")]
    Usage(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "d2xx")]
    #[error("FTDI device error")]
    Ftdi(#[from] libftd2xx::FtStatus),
}

pub type Result<T> = std::result::Result<T, Error>;
