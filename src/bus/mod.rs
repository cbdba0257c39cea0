//! Component bus: bound, bidirectional message channels between stage
//! drivers and services.
//!
//! Two endpoints sharing a logical id form one channel. Each side owns a
//! fixed-size message ring for what it sends, optionally an extra-buffer
//! pool for payloads that do not fit a ring slot, and a small table of wait
//! slots for synchronous posts.
//!
//! # Example
//!
//! ```rust
//! use campipe::bus::{BusRegistry, Command, Direction, Message, ReplyWriter};
//! use campipe::config::{BindRecord, BusConfig};
//!
//! let registry = BusRegistry::new(BusConfig::default()).unwrap();
//! let (up, _) = registry
//!     .register(BindRecord::new(0x10, Direction::UpToDown), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
//!     .unwrap();
//! let (down, _) = registry
//!     .register(BindRecord::new(0x10, Direction::DownToUp), |_: &Message<'_>, _: &mut ReplyWriter<'_>| 0)
//!     .unwrap();
//!
//! assert!(up.is_bound());
//!
//! up.post(Command::ResetControl).unwrap();
//! assert_eq!(down.deliver().unwrap(), 1);
//! // `down` announced itself when it registered.
//! assert_eq!(up.deliver().unwrap(), 1);
//! ```

mod channel;
mod endpoint;
mod extra;
mod message;
mod registry;
mod ring;
mod wait;

pub use channel::LinkState;
pub use endpoint::{BindInfo, Dispatcher, Endpoint, EndpointStats};
pub use extra::ExtraBuf;
pub use message::{
    Body, BusHandler, Command, ExtraRef, HEADER_LEN, Header, Message, MsgFlags, NO_WAIT_SLOT,
    Payload, ReplyWriter, StageState,
};
pub use registry::BusRegistry;
pub use wait::SyncReply;

use std::fmt;

/// Which side of a channel an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Upstream side, sending towards downstream.
    UpToDown,
    /// Downstream side, sending towards upstream.
    DownToUp,
}

impl Direction {
    /// The opposite side.
    pub fn peer(self) -> Self {
        match self {
            Direction::UpToDown => Direction::DownToUp,
            Direction::DownToUp => Direction::UpToDown,
        }
    }

    /// Short lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::UpToDown => "up-to-down",
            Direction::DownToUp => "down-to-up",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::UpToDown => 0,
            Direction::DownToUp => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
