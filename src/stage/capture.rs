//! Sensor-interface capture stage.

use super::{Capability, Hardware, StageDriver, StageKind};
use crate::config::StageConfig;
use crate::error::Result;
use crate::frame::SinkPort;
use std::sync::Arc;

/// Writes sensor frames into an output pool. No inputs, no shared unit;
/// the active sensor input is chosen with `ChangeInput`.
#[derive(Debug, Clone)]
pub struct Capture {
    driver: Arc<StageDriver>,
}

impl Capture {
    /// Create a capture stage.
    pub fn new(
        name: impl Into<String>,
        config: StageConfig,
        hardware: impl Hardware + 'static,
    ) -> Result<Self> {
        Ok(Self {
            driver: StageDriver::new(name, StageKind::Capture, config, hardware)?,
        })
    }

    /// Capture `instance` into `output`.
    pub fn attach_output(&self, instance: u32, output: Arc<dyn SinkPort>) -> Result<()> {
        self.driver.attach_sink(instance, output)
    }

    /// Sensor input currently selected.
    pub fn input(&self) -> u32 {
        self.driver.input()
    }
}

impl Capability for Capture {
    fn driver(&self) -> &Arc<StageDriver> {
        &self.driver
    }
}
