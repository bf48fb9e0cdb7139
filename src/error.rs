//! All possible non-I/O protocol errors.
use std::io;

use thiserror::Error;

/// Enumeration of all possible non-I/O protocol errors.
///
/// Most decode-path failures are absorbed inside the obfuscator itself: it
/// transitions to raw passthrough and, where the wire format calls for it,
/// emits a fixed-size camouflage buffer so an active prober cannot tell a
/// rejection apart from garbled traffic. Only conditions the relay loop must
/// act on are surfaced through this type.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The data was corrupted during reading from the underlying transport.
    ///
    /// This could be due to the peer using an incorrect key,
    /// random errors in network, or active probing attacks.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is fatal to structured parsing: the obfuscator has already
    /// entered raw passthrough and will never resume frame decoding on this
    /// connection. The implementer should introduce a random delay before
    /// closing the connection, and keep draining the transport during that
    /// delay, in order to avoid revealing obfuscator behavior patterns.
    #[error("bad data received: {0}")]
    BadDataReceived(#[from] BadDataReceived),

    /// The handshake carried a user id that is absent from the user table.
    ///
    /// Unlike [`Error::BadDataReceived`] this is surfaced directly: without a
    /// resolved per-user key there is nothing to camouflage a response with.
    #[error("user {user_id} not found in user table")]
    UnknownUser {
        /// The unresolved user id carried by the handshake.
        user_id: u32,
    },

    /// The requested cipher name is not present in the registry.
    #[error("unsupported cipher: {name:?}")]
    UnsupportedCipher {
        /// The cipher name that failed lookup.
        name: String,
    },

    /// The requested obfuscation method name is not present in the registry.
    #[error("unsupported obfuscation method: {name:?}")]
    UnsupportedMethod {
        /// The method name that failed lookup.
        name: String,
    },

    /// The protocol parameter could not be parsed as `"userId:secret"`.
    #[error("invalid protocol parameter: {param:?}")]
    InvalidProtocolParam {
        /// The offending parameter string.
        param: String,
    },

    /// A key or IV passed to a cipher constructor had the wrong length.
    #[error("invalid {what} length for cipher {name}: expected {expected}, got {got}")]
    InvalidKeyMaterial {
        /// The cipher whose constructor rejected the material.
        name: &'static str,
        /// Which input was wrong (`"key"` or `"iv"`).
        what: &'static str,
        /// Required length in bytes.
        expected: usize,
        /// Provided length in bytes.
        got: usize,
    },
}

/// All decode failures that require disguise measures.
///
/// Every variant here corresponds to a state where the obfuscator has torn
/// down frame parsing and (on the server side of a handshake) has handed the
/// caller a camouflage buffer to send back.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum BadDataReceived {
    /// A frame length field fell outside the protocol's legal range.
    #[error("frame length {len} out of bounds")]
    MalformedFrame {
        /// The decoded length field.
        len: usize,
    },

    /// A truncated HMAC tag did not match the received bytes.
    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    /// The handshake timestamp fell outside the freshness window,
    /// indicating clock skew or a recorded handshake played back later.
    #[error("handshake timestamp outside freshness window ({time_dif}s)")]
    AuthExpired {
        /// Signed difference between the received timestamp and local time.
        time_dif: i64,
    },

    /// The anti-replay tracker rejected the handshake's connection id,
    /// either as a duplicate or outside the sliding window.
    #[error("connection id rejected by anti-replay tracker")]
    ReplayDetected,

    /// The user id is at its concurrent client limit and no inactive
    /// session could be evicted.
    #[error("user at concurrent session limit")]
    SessionLimit,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

impl From<BadDataReceived> for io::Error {
    fn from(e: BadDataReceived) -> Self {
        io::Error::new(io::ErrorKind::Other, Error::BadDataReceived(e))
    }
}
