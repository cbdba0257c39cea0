//! Default sizes, limits and timeouts.
//!
//! Ring and pool sizes are fixed when an endpoint or stage is created; nothing
//! here grows at runtime.

use std::time::Duration;

// =============================================================================
// Component bus
// =============================================================================

/// How long a synchronous post waits for its reply.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(5000);

/// Number of synchronous wait slots per endpoint.
///
/// Bounds how many synchronous posts may be in flight on one endpoint.
pub const MAX_WAIT_SLOTS: usize = 4;

/// Smallest accepted inline payload size.
///
/// Large enough for every internal command, including a three-buffer
/// schedule notification.
pub const MIN_SLOT_SIZE: u16 = 64;

/// Default inline payload size per ring slot.
pub const DEFAULT_SLOT_SIZE: u16 = 256;

/// Default number of ring slots per direction.
pub const DEFAULT_SLOT_COUNT: u16 = 32;

/// Upper bound on extra-buffer pool slots.
///
/// The pool is scanned linearly on allocation.
pub const MAX_EXTRA_SLOTS: u16 = 64;

// =============================================================================
// Stages
// =============================================================================

/// Default job queue depth per stage.
pub const DEFAULT_JOB_CAPACITY: usize = 16;

/// Schedule nodes per logical stream (pipelining depth).
pub const DEFAULT_PIPELINE_DEPTH: usize = 2;

/// Maximum hardware passes for one tiled schedule node.
pub const MAX_TILES: u8 = 8;

/// Input fan-in of the stitching scaler.
pub const SCALER_FAN_IN: usize = 6;

/// Capacity of each stage's event broadcast channel.
pub const EVENT_CAPACITY: usize = 64;
