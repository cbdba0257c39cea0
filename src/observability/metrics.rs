//! Metrics collection using metrics-rs.
//!
//! Label strings are built once when a handle set is created (worker
//! context); recording through a handle is a plain counter increment and is
//! safe from interrupt context.

use metrics::{Counter, Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const BUS_POSTS: &str = "campipe_bus_posts";
const BUS_RETRY_LATER: &str = "campipe_bus_retry_later";
const BUS_SYNC_TIMEOUTS: &str = "campipe_bus_sync_timeouts";
const JOBS_REJECTED: &str = "campipe_jobs_rejected";
const FRAMES_PRODUCED: &str = "campipe_frames_produced";
const FRAMES_DROPPED: &str = "campipe_frames_dropped";
const ACQUIRE_STARVED: &str = "campipe_acquire_starved";
const ADMISSION_DEPTH: &str = "campipe_admission_depth";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(BUS_POSTS, Unit::Count, "Messages posted to a bus ring");
    metrics::describe_counter!(
        BUS_RETRY_LATER,
        Unit::Count,
        "Posts rejected because the ring had no free slot"
    );
    metrics::describe_counter!(
        BUS_SYNC_TIMEOUTS,
        Unit::Count,
        "Synchronous posts that got no reply in time"
    );
    metrics::describe_counter!(
        JOBS_REJECTED,
        Unit::Count,
        "Jobs refused by a full stage job queue"
    );
    metrics::describe_counter!(
        FRAMES_PRODUCED,
        Unit::Count,
        "Frames released to the output owner as produced"
    );
    metrics::describe_counter!(
        FRAMES_DROPPED,
        Unit::Count,
        "Frames released as dropped (defective or abandoned)"
    );
    metrics::describe_counter!(
        ACQUIRE_STARVED,
        Unit::Count,
        "Frame acquisitions that found a port without buffers"
    );
    metrics::describe_gauge!(
        ADMISSION_DEPTH,
        Unit::Count,
        "Busy schedule nodes waiting for a shared hardware unit"
    );
}

/// Handles for one bus endpoint.
#[derive(Clone)]
pub struct BusMetrics {
    posts: Counter,
    retry_later: Counter,
    sync_timeouts: Counter,
}

impl BusMetrics {
    /// Register handles labelled with the endpoint id and direction.
    pub fn new(logical_id: u32, direction: &str) -> Self {
        let id = format!("{logical_id:#x}");
        Self {
            posts: counter!(BUS_POSTS, "endpoint" => id.clone(), "direction" => direction.to_string()),
            retry_later: counter!(BUS_RETRY_LATER, "endpoint" => id.clone(), "direction" => direction.to_string()),
            sync_timeouts: counter!(BUS_SYNC_TIMEOUTS, "endpoint" => id, "direction" => direction.to_string()),
        }
    }

    /// Record a message accepted by the ring.
    #[inline]
    pub fn record_post(&self) {
        self.posts.increment(1);
    }

    /// Record a post refused with back-pressure.
    #[inline]
    pub fn record_retry_later(&self) {
        self.retry_later.increment(1);
    }

    /// Record a synchronous post that timed out.
    #[inline]
    pub fn record_sync_timeout(&self) {
        self.sync_timeouts.increment(1);
    }
}

/// Handles for one stage driver.
#[derive(Clone)]
pub struct StageMetrics {
    stage: String,
    produced: Counter,
    dropped: Counter,
    starved: Counter,
    jobs_rejected: Counter,
}

impl StageMetrics {
    /// Register handles labelled with the stage name.
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            produced: counter!(FRAMES_PRODUCED, "stage" => stage.to_string()),
            dropped: counter!(FRAMES_DROPPED, "stage" => stage.to_string()),
            starved: counter!(ACQUIRE_STARVED, "stage" => stage.to_string()),
            jobs_rejected: counter!(JOBS_REJECTED, "stage" => stage.to_string()),
        }
    }

    /// Record a released frame.
    #[inline]
    pub fn record_frame(&self, dropped: bool) {
        if dropped {
            self.dropped.increment(1);
        } else {
            self.produced.increment(1);
        }
    }

    /// Record an acquisition that found no buffer.
    #[inline]
    pub fn record_starved(&self) {
        self.starved.increment(1);
    }

    /// Record a job refused by a full queue.
    #[inline]
    pub fn record_job_rejected(&self) {
        self.jobs_rejected.increment(1);
    }

    /// Stage label.
    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// Queue-depth gauge for one shared hardware unit.
#[derive(Clone)]
pub struct AdmissionMetrics {
    depth: Gauge,
}

impl AdmissionMetrics {
    /// Register the gauge labelled with the unit name.
    pub fn new(unit: &str) -> Self {
        Self {
            depth: gauge!(ADMISSION_DEPTH, "unit" => unit.to_string()),
        }
    }

    /// Publish the number of busy nodes.
    #[inline]
    pub fn set_depth(&self, depth: usize) {
        self.depth.set(depth as f64);
    }
}
