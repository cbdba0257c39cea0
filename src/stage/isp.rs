//! Image signal processor stage.

use super::{Capability, Hardware, StageDriver, StageKind};
use crate::config::StageConfig;
use crate::error::Result;
use crate::frame::{SinkPort, SourcePort};
use std::sync::Arc;

/// One input, one output, one processing unit shared by every instance.
#[derive(Debug, Clone)]
pub struct Isp {
    driver: Arc<StageDriver>,
}

impl Isp {
    /// Create an ISP stage.
    pub fn new(
        name: impl Into<String>,
        config: StageConfig,
        hardware: impl Hardware + 'static,
    ) -> Result<Self> {
        Ok(Self {
            driver: StageDriver::new(name, StageKind::Isp, config, hardware)?,
        })
    }

    /// Wire `instance` between `input` and `output`.
    pub fn connect(
        &self,
        instance: u32,
        input: Arc<dyn SourcePort>,
        output: Arc<dyn SinkPort>,
    ) -> Result<()> {
        self.driver.attach_source(instance, input)?;
        self.driver.attach_sink(instance, output)
    }

    /// Instances waiting for the processing unit.
    pub fn queued(&self) -> usize {
        self.driver.unit().map_or(0, |u| u.queued())
    }
}

impl Capability for Isp {
    fn driver(&self) -> &Arc<StageDriver> {
        &self.driver
    }
}
