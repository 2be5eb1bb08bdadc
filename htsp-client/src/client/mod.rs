//! Client module for the HTSP data client.

pub mod connection;
pub mod correlator;
pub mod dispatch;

pub use connection::{Connection, ConnectionConfig, ConnectionState, FrameHandler, ServerInfo};
pub use correlator::{Correlator, Transport, DEFAULT_RESPONSE_TIMEOUT};
pub use dispatch::{Dispatcher, SyncLatch};
