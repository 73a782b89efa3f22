//! Error taxonomy for the wire codec.
//!
//! Every way a peer can violate the GOSOC framing rules maps to a distinct
//! variant so that log lines and tests can name the exact failure. Protocol
//! violations are common under hostile or confused peers, so callers log
//! them at debug level and terminate the session rather than treating them
//! as server faults.

use std::io;

use thiserror::Error;

/// A violation of the GOSOC wire protocol detected while encoding or
/// decoding a packet.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The four-bit packet type is outside `1..=7`.
    #[error("message type is invalid: {value}")]
    BadMessageType {
        /// Raw type nibble from the fixed header.
        value: u8,
    },

    /// A var-int length field carried a continuation bit in its fourth byte.
    #[error("remaining length field exceeded maximum of 4 bytes")]
    BadLengthEncoding,

    /// A ConnAck carried a return code outside the defined range.
    #[error("return code is invalid: {value}")]
    BadReturnCode {
        /// Raw return-code byte.
        value: u8,
    },

    /// A body field claimed more bytes than the remaining length allows.
    #[error("data exceeds packet length")]
    DataExceedsPacket,

    /// A packet body would exceed the 2^28−1 cap, or decode left residue.
    #[error("message is too long: {len}")]
    MessageTooLong {
        /// Offending length in bytes.
        len: u64,
    },

    /// Header or body flags used a reserved bit or an undefined value.
    #[error("flag is invalid: {flags}")]
    InvalidFlag {
        /// Raw flag bits.
        flags: u8,
    },

    /// The Connect packet named a protocol other than "GOSOC".
    #[error("protocol name is invalid: {name}")]
    InvalidProtocolName {
        /// Name the peer sent.
        name: String,
    },

    /// The Connect packet asked for a protocol version newer than ours.
    #[error("protocol version is invalid: {version}")]
    InvalidProtocolVersion {
        /// Version the peer sent.
        version: u8,
    },

    /// A string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// A gzip-framed field did not contain a valid gzip stream.
    #[error("gzip stream is corrupt: {0}")]
    Gzip(String),
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self { io::Error::new(io::ErrorKind::InvalidData, err) }
}

impl ProtocolError {
    /// Recover a `ProtocolError` from an `io::Error` produced by the codec.
    ///
    /// Transport failures return `None`; only errors that originated as
    /// protocol violations round-trip.
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<&ProtocolError> {
        err.get_ref().and_then(|e| e.downcast_ref::<ProtocolError>())
    }
}
