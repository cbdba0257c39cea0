//! Fixed-capacity queues.
//!
//! - [`IndexList`]: the idle/active index-list primitive
//! - [`JobQueue`]: interrupt-to-worker job hand-off built on it
//!
//! The admission scheduler reuses [`IndexList`] for its schedule nodes.

mod job;
mod list;

pub use job::JobQueue;
pub use list::IndexList;
