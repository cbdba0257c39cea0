//! Scaling and stitching stage.

use super::{Capability, Hardware, StageDriver, StageKind};
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::frame::{SinkPort, SourcePort};
use std::sync::Arc;

/// Combines up to six inputs into one output per frame. A frame starts only
/// when every input has a buffer.
#[derive(Debug, Clone)]
pub struct Scaler {
    driver: Arc<StageDriver>,
}

impl Scaler {
    /// Create a scaler stage.
    pub fn new(
        name: impl Into<String>,
        config: StageConfig,
        hardware: impl Hardware + 'static,
    ) -> Result<Self> {
        Ok(Self {
            driver: StageDriver::new(name, StageKind::Scaler, config, hardware)?,
        })
    }

    /// Number of inputs per frame.
    pub fn fan_in(&self) -> usize {
        self.driver.config().sources
    }

    /// Wire every input of `instance` plus its output.
    pub fn connect(
        &self,
        instance: u32,
        inputs: &[Arc<dyn SourcePort>],
        output: Arc<dyn SinkPort>,
    ) -> Result<()> {
        if inputs.len() != self.fan_in() {
            return Err(Error::InvalidArgument(format!(
                "scaler takes {} inputs, got {}",
                self.fan_in(),
                inputs.len()
            )));
        }
        for input in inputs {
            self.driver.attach_source(instance, Arc::clone(input))?;
        }
        self.driver.attach_sink(instance, output)
    }
}

impl Capability for Scaler {
    fn driver(&self) -> &Arc<StageDriver> {
        &self.driver
    }
}
