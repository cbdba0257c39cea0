//! Configuration for bus endpoints and stage drivers.
//!
//! Configuration is per call: a [`BindRecord`] when an endpoint registers,
//! a [`BusConfig`] for the registry and a [`StageConfig`] when a stage driver
//! is created. All three validate eagerly and reject malformed values with
//! [`Error::InvalidArgument`].

pub mod defaults;

use crate::bus::Direction;
use crate::error::{Error, Result};
use crate::observability::TracingConfig;
use std::time::Duration;

/// Parameters establishing one bus endpoint.
///
/// The ring configured here carries messages *from* the registering side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRecord {
    /// Logical endpoint identifier shared by both peers.
    pub logical_id: u32,
    /// Which side of the channel this record describes.
    pub direction: Direction,
    /// Inline payload bytes per ring slot.
    pub slot_size: u16,
    /// Number of ring slots (maximum outstanding messages).
    pub slot_count: u16,
    /// Bytes per extra-buffer slot (0 disables the pool).
    pub extra_slot_size: u16,
    /// Number of extra-buffer slots (0 disables the pool).
    pub extra_slot_count: u16,
}

impl BindRecord {
    /// Record with default ring sizes and no extra pool.
    pub fn new(logical_id: u32, direction: Direction) -> Self {
        Self {
            logical_id,
            direction,
            slot_size: defaults::DEFAULT_SLOT_SIZE,
            slot_count: defaults::DEFAULT_SLOT_COUNT,
            extra_slot_size: 0,
            extra_slot_count: 0,
        }
    }

    /// Set the ring geometry.
    pub fn with_ring(mut self, slot_size: u16, slot_count: u16) -> Self {
        self.slot_size = slot_size;
        self.slot_count = slot_count;
        self
    }

    /// Enable an extra-buffer pool.
    pub fn with_extra(mut self, slot_size: u16, slot_count: u16) -> Self {
        self.extra_slot_size = slot_size;
        self.extra_slot_count = slot_count;
        self
    }

    /// Whether this record asks for an extra-buffer pool.
    pub fn has_extra(&self) -> bool {
        self.extra_slot_count > 0
    }

    /// Check the record for malformed values.
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(Error::InvalidArgument("slot_count must be > 0".into()));
        }
        if self.slot_size < defaults::MIN_SLOT_SIZE {
            return Err(Error::InvalidArgument(format!(
                "slot_size {} below minimum {}",
                self.slot_size,
                defaults::MIN_SLOT_SIZE
            )));
        }
        if (self.extra_slot_size == 0) != (self.extra_slot_count == 0) {
            return Err(Error::InvalidArgument(
                "extra pool needs both slot size and slot count".into(),
            ));
        }
        if self.extra_slot_count > defaults::MAX_EXTRA_SLOTS {
            return Err(Error::InvalidArgument(format!(
                "extra_slot_count {} exceeds {}",
                self.extra_slot_count,
                defaults::MAX_EXTRA_SLOTS
            )));
        }
        Ok(())
    }
}

/// Settings shared by every endpoint of one bus registry.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Reply timeout for synchronous posts.
    pub sync_timeout: Duration,
    /// Synchronous wait slots per endpoint.
    pub wait_slots: usize,
    /// Span settings for endpoints.
    pub tracing: TracingConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            sync_timeout: defaults::SYNC_TIMEOUT,
            wait_slots: defaults::MAX_WAIT_SLOTS,
            tracing: TracingConfig::default(),
        }
    }
}

impl BusConfig {
    /// Override the synchronous reply timeout.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Override the number of wait slots.
    pub fn with_wait_slots(mut self, slots: usize) -> Self {
        self.wait_slots = slots;
        self
    }

    /// Override span settings.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Check the config for malformed values.
    pub fn validate(&self) -> Result<()> {
        if self.wait_slots == 0 || self.wait_slots > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "wait_slots {} out of range",
                self.wait_slots
            )));
        }
        if self.sync_timeout.is_zero() {
            return Err(Error::InvalidArgument("sync_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Settings for one stage driver.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Number of logical streams (frame contexts) served by the stage.
    pub instances: u32,
    /// Job queue depth between the interrupt path and frame advance.
    pub job_capacity: usize,
    /// Schedule nodes per stream when the hardware unit is shared.
    pub pipeline_depth: usize,
    /// Hardware passes per frame (tiled processing); 1 means untiled.
    pub tiles: u8,
    /// Input ports per frame context.
    pub sources: usize,
    /// Whether the stage writes into an output pool.
    pub has_sink: bool,
    /// Span and per-frame log settings.
    pub tracing: TracingConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            job_capacity: defaults::DEFAULT_JOB_CAPACITY,
            pipeline_depth: defaults::DEFAULT_PIPELINE_DEPTH,
            tiles: 1,
            sources: 1,
            has_sink: true,
            tracing: TracingConfig::default(),
        }
    }
}

impl StageConfig {
    /// Set the number of logical streams.
    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    /// Set the job queue depth.
    pub fn with_job_capacity(mut self, capacity: usize) -> Self {
        self.job_capacity = capacity;
        self
    }

    /// Set the pipelining depth multiplier.
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Set hardware passes per frame.
    pub fn with_tiles(mut self, tiles: u8) -> Self {
        self.tiles = tiles;
        self
    }

    /// Set input ports per frame context.
    pub fn with_sources(mut self, sources: usize) -> Self {
        self.sources = sources;
        self
    }

    /// Enable or disable the output pool.
    pub fn with_sink(mut self, has_sink: bool) -> Self {
        self.has_sink = has_sink;
        self
    }

    /// Override span and per-frame log settings.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Schedule node pool size for a shared hardware unit.
    pub fn schedule_nodes(&self) -> usize {
        self.instances as usize * self.pipeline_depth
    }

    /// Check the config for malformed values.
    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(Error::InvalidArgument("instances must be > 0".into()));
        }
        if self.job_capacity == 0 {
            return Err(Error::InvalidArgument("job_capacity must be > 0".into()));
        }
        if self.pipeline_depth == 0 {
            return Err(Error::InvalidArgument("pipeline_depth must be > 0".into()));
        }
        if self.tiles == 0 || self.tiles > defaults::MAX_TILES {
            return Err(Error::InvalidArgument(format!(
                "tiles {} out of range 1..={}",
                self.tiles,
                defaults::MAX_TILES
            )));
        }
        if self.sources > defaults::SCALER_FAN_IN {
            return Err(Error::InvalidArgument(format!(
                "{} sources exceeds fan-in {}",
                self.sources,
                defaults::SCALER_FAN_IN
            )));
        }
        if self.sources == 0 && !self.has_sink {
            return Err(Error::InvalidArgument(
                "stage needs a sink or at least one source".into(),
            ));
        }
        Ok(())
    }
}
