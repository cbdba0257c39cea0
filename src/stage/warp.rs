//! Geometric warp stage.

use super::{Capability, Hardware, StageDriver, StageKind};
use crate::config::StageConfig;
use crate::error::Result;
use crate::frame::{SinkPort, SourcePort};
use std::sync::Arc;

/// Remaps one input, possibly in several tile passes, on a unit shared by
/// every instance. The output is optional: without one the warp only reads
/// (e.g. for statistics).
#[derive(Debug, Clone)]
pub struct Warp {
    driver: Arc<StageDriver>,
}

impl Warp {
    /// Create a warp stage.
    pub fn new(
        name: impl Into<String>,
        config: StageConfig,
        hardware: impl Hardware + 'static,
    ) -> Result<Self> {
        Ok(Self {
            driver: StageDriver::new(name, StageKind::Warp, config, hardware)?,
        })
    }

    /// Hardware passes per frame.
    pub fn tiles(&self) -> u8 {
        self.driver.config().tiles
    }

    /// Wire `instance` to `input` and, if given, `output`.
    pub fn connect(
        &self,
        instance: u32,
        input: Arc<dyn SourcePort>,
        output: Option<Arc<dyn SinkPort>>,
    ) -> Result<()> {
        self.driver.attach_source(instance, input)?;
        match output {
            Some(output) => self.driver.attach_sink(instance, output),
            None => Ok(()),
        }
    }
}

impl Capability for Warp {
    fn driver(&self) -> &Arc<StageDriver> {
        &self.driver
    }
}
