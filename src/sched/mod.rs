//! Admission scheduling for shared hardware units.
//!
//! - [`AdmissionScheduler`]: FIFO of busy schedule nodes over a fixed pool
//! - [`SharedUnit`]: adds "which pass owns the hardware right now"

mod admission;
mod unit;

pub use admission::{AdmissionQueue, AdmissionScheduler, Pass};
pub use unit::{Admission, SharedUnit};
