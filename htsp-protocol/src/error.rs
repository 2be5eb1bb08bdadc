//! Error types for the HTSP protocol.

use thiserror::Error;

/// Protocol-level errors raised while encoding, decoding or reading messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame or field is shorter than its declared length.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Frame body is too large.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    /// Field type tag is not one of MAP/S64/STR/BIN/LIST.
    #[error("Unknown field type: 0x{0:02X}")]
    UnknownFieldType(u8),

    /// Maps and lists nested deeper than the decoder accepts.
    #[error("Nesting too deep: more than {0} levels")]
    NestingTooDeep(usize),

    /// Field name or string value is not valid UTF-8.
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(String),

    /// S64 field wider than 8 bytes.
    #[error("Invalid s64 field '{field}': {len} bytes")]
    InvalidS64 { field: String, len: usize },

    /// Failed to encode a message.
    #[error("Failed to encode message: {0}")]
    EncodeError(String),

    /// A required field is absent from a decoded message.
    #[error("Field missing: {0}")]
    FieldMissing(String),

    /// A field is present but has the wrong type or is out of range.
    #[error("Type mismatch for field '{field}': expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },
}

impl ProtocolError {
    /// Returns true if the error means the frame itself is corrupt, as opposed
    /// to a well-formed frame that lacks an expected field.
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            ProtocolError::FieldMissing(_) | ProtocolError::TypeMismatch { .. }
        )
    }
}

/// Client-side errors surfaced by sessions and queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server speaks a protocol version older than the supported minimum.
    #[error("Incompatible protocol version {server} (minimum: {minimum})")]
    IncompatibleVersion { server: u32, minimum: u32 },

    /// Server denied access for the configured credentials.
    #[error("Authentication failed for user '{0}'")]
    AuthenticationFailed(String),

    /// No live session and reconnect did not succeed.
    #[error("Not connected")]
    NotConnected,

    /// Connection was closed while the request was outstanding.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Request timed out.
    #[error("Request timed out")]
    Timeout,

    /// Reply could not be decoded or lacked a field.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server reported an error string.
    #[error("Server error: {0}")]
    Application(String),

    /// Server answered with a zero success counter.
    #[error("Request '{method}' was not applied by the server")]
    NotApplied { method: String },
}

impl ClientError {
    /// Returns true if the error is a transport-level failure rather than a
    /// server answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionFailed(_)
                | ClientError::NotConnected
                | ClientError::ConnectionClosed
                | ClientError::Timeout
        )
    }
}
