//! Observability: metrics and tracing.
//!
//! ## Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `campipe_bus_posts` | Counter | endpoint, direction | Messages accepted by a ring |
//! | `campipe_bus_retry_later` | Counter | endpoint, direction | Posts refused by a full ring |
//! | `campipe_bus_sync_timeouts` | Counter | endpoint, direction | Synchronous posts without reply |
//! | `campipe_jobs_rejected` | Counter | stage | Jobs refused by a full job queue |
//! | `campipe_frames_produced` | Counter | stage | Frames released as produced |
//! | `campipe_frames_dropped` | Counter | stage | Frames released as dropped |
//! | `campipe_acquire_starved` | Counter | stage | Acquisitions that found no buffer |
//! | `campipe_admission_depth` | Gauge | unit | Busy nodes waiting on a shared unit |
//!
//! Nothing is exported by this crate; install a `metrics` recorder in the
//! embedding application. Without one, recording is a no-op.
//!
//! ## Tracing
//!
//! Stages and bus endpoints carry their own spans. Back-pressure (full
//! queues, starved ports, full rings) is logged at `trace`/`debug` only.

mod metrics;
mod tracing_support;

pub use self::metrics::{AdmissionMetrics, BusMetrics, StageMetrics, init_metrics};
pub use tracing_support::{
    TracingConfig, span_bus, span_stage, trace_frame_done, trace_state_change,
};
