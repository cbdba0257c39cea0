//! Hardware stage drivers.
//!
//! Every stage runs the same core, [`StageDriver`]: jobs from interrupts and
//! port hooks, per-instance [`FrameContext`](crate::frame::FrameContext)s,
//! and a [`SharedUnit`](crate::sched::SharedUnit) when the hardware is
//! time-multiplexed. What differs per stage is captured by [`StageKind`]:
//!
//! | Kind | Inputs | Shared unit | Tiles | Input select |
//! |------|--------|-------------|-------|--------------|
//! | [`Capture`] | 0 | no | 1 | yes |
//! | [`Isp`] | 1 | yes | 1 | no |
//! | [`Scaler`] | 1..=6 | no | 1 | no |
//! | [`Warp`] | 1 | yes | 1..=8 | no |
//!
//! [`Stage`] is the closed set of stage variants behind one
//! [`Capability`] interface.

mod capture;
mod driver;
mod events;
mod hardware;
mod isp;
mod scaler;
mod warp;

pub use capture::Capture;
pub use driver::{PadFormat, StageDriver};
pub use events::StageEvent;
pub use hardware::{Hardware, IrqStatus};
pub use isp::Isp;
pub use scaler::Scaler;
pub use warp::Warp;

use crate::bus::{BindInfo, BusRegistry, Command, Message, ReplyWriter};
use crate::config::defaults::SCALER_FAN_IN;
use crate::config::{BindRecord, StageConfig};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// The fixed set of stage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Sensor-interface capture.
    Capture,
    /// Image signal processor.
    Isp,
    /// Scaling and stitching.
    Scaler,
    /// Geometric warp.
    Warp,
}

impl StageKind {
    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Capture => "capture",
            StageKind::Isp => "isp",
            StageKind::Scaler => "scaler",
            StageKind::Warp => "warp",
        }
    }

    /// Whether one hardware unit serves every instance in turn.
    pub fn is_shared(self) -> bool {
        matches!(self, StageKind::Isp | StageKind::Warp)
    }

    /// Whether frames may be split into several hardware passes.
    pub fn supports_tiles(self) -> bool {
        self == StageKind::Warp
    }

    /// Whether `ChangeInput` is meaningful.
    pub fn selects_input(self) -> bool {
        self == StageKind::Capture
    }

    /// A configuration this kind accepts, with one instance.
    pub fn default_config(self) -> StageConfig {
        let config = StageConfig::default();
        match self {
            StageKind::Capture => config.with_sources(0),
            StageKind::Isp | StageKind::Warp => config.with_sources(1),
            StageKind::Scaler => config.with_sources(2),
        }
    }

    /// Reject configurations this kind cannot run.
    pub(crate) fn check(self, config: &StageConfig) -> Result<()> {
        let sources_ok = match self {
            StageKind::Capture => config.sources == 0,
            StageKind::Isp | StageKind::Warp => config.sources == 1,
            StageKind::Scaler => (1..=SCALER_FAN_IN).contains(&config.sources),
        };
        if !sources_ok {
            return Err(Error::InvalidArgument(format!(
                "{self} stage cannot take {} input ports",
                config.sources
            )));
        }
        if !config.has_sink && self != StageKind::Warp {
            return Err(Error::InvalidArgument(format!(
                "{self} stage needs an output port"
            )));
        }
        if config.tiles > 1 && !self.supports_tiles() {
            return Err(Error::InvalidArgument(format!(
                "{self} stage does not tile"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What every stage offers the rest of the pipeline.
///
/// Implementors only supply [`driver`](Self::driver); bus binding, posting
/// and command handling go through the shared core.
pub trait Capability {
    /// The driver core.
    fn driver(&self) -> &Arc<StageDriver>;

    /// Register on the bus under `record`.
    fn bind(&self, registry: &BusRegistry, record: BindRecord) -> Result<BindInfo> {
        self.driver().bind(registry, record)
    }

    /// Post a command to the bound peer.
    fn post(&self, cmd: Command) -> Result<u16> {
        self.driver().post(cmd)
    }

    /// Handle one bus message.
    fn notify(&self, msg: &Message<'_>, reply: &mut ReplyWriter<'_>) -> i32 {
        self.driver().handle_message(msg, reply)
    }
}

/// Any stage.
#[derive(Debug, Clone)]
pub enum Stage {
    /// Capture stage.
    Capture(Capture),
    /// Image signal processor.
    Isp(Isp),
    /// Scaler.
    Scaler(Scaler),
    /// Warp engine.
    Warp(Warp),
}

impl Stage {
    /// Kind of the wrapped stage.
    pub fn kind(&self) -> StageKind {
        self.driver().kind()
    }
}

impl Capability for Stage {
    fn driver(&self) -> &Arc<StageDriver> {
        match self {
            Stage::Capture(s) => s.driver(),
            Stage::Isp(s) => s.driver(),
            Stage::Scaler(s) => s.driver(),
            Stage::Warp(s) => s.driver(),
        }
    }
}

impl From<Capture> for Stage {
    fn from(stage: Capture) -> Self {
        Stage::Capture(stage)
    }
}

impl From<Isp> for Stage {
    fn from(stage: Isp) -> Self {
        Stage::Isp(stage)
    }
}

impl From<Scaler> for Stage {
    fn from(stage: Scaler) -> Self {
        Stage::Scaler(stage)
    }
}

impl From<Warp> for Stage {
    fn from(stage: Warp) -> Self {
        Stage::Warp(stage)
    }
}
