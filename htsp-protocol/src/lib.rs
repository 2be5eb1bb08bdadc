//! HTSP protocol definitions for the Tvheadend data client.
//!
//! This crate defines the self-describing binary message format spoken by
//! HTSP servers, the push-notification vocabulary and the error taxonomy
//! shared by the client crates.
//!
//! # Frame Format
//!
//! ```text
//! +-------------+---------------------+
//! | Length      | Body (field*)       |
//! | u32 BE      | Length bytes        |
//! +-------------+---------------------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use htsp_protocol::{decode_length, decode_message, encode_message, Message, LENGTH_PREFIX_SIZE};
//!
//! let msg = Message::method("getEvent").with_u32("eventId", 1234);
//! let encoded = encode_message(&msg).unwrap();
//!
//! let body_len = decode_length(&encoded).unwrap().unwrap();
//! let body = encoded.slice(LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + body_len);
//! let decoded = decode_message(body).unwrap();
//! assert_eq!(decoded.u32("eventId").unwrap(), 1234);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode_inbound, decode_length, decode_message, encode_body, encode_message,
    LENGTH_PREFIX_SIZE, MAX_NESTING,
};
pub use error::{ClientError, ProtocolError};
pub use types::{
    EntityKind, FieldType, Inbound, Message, Mutation, PushMethod, Value, HTSP_PROTO_VERSION,
    MAX_FRAME_SIZE, MIN_PROTOCOL_VERSION,
};
