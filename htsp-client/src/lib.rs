//! HTSP data client for Tvheadend-style backends.
//!
//! One TCP session carries both synchronous requests and unsolicited push
//! notifications. A single reader task demultiplexes inbound frames: replies
//! wake the caller waiting on the matching `seq`, pushes are merged into a
//! local mirror of channels, tags and DVR entries.
//!
//! ```no_run
//! use std::time::Duration;
//! use htsp_client::HtspData;
//!
//! let data = HtspData::new();
//! if data.open("127.0.0.1", 9982, "", "", Duration::from_secs(10)) {
//!     for channel in data.channels(None).unwrap() {
//!         println!("{:>4} {}", channel.number, channel.name);
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod data;
pub mod model;
pub mod store;

#[cfg(test)]
mod testing;

pub use client::{Connection, ConnectionConfig, ConnectionState, ServerInfo};
pub use data::{HtspData, MAX_EPG_WALK};
pub use htsp_protocol::{ClientError, ProtocolError};
pub use model::{
    Channel, DriveSpace, Event, Recording, RecordingState, ServerTime, Tag, TimerRequest,
};
pub use store::StateStore;
