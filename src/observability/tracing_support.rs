//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create spans around stage frame advance.
    pub stage_spans: bool,
    /// Whether to create spans around bus delivery.
    pub bus_spans: bool,
    /// Whether to log every frame completion.
    pub frame_events: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            stage_spans: true,
            bus_spans: true,
            frame_events: false,
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Everything on, at debug level.
    pub fn all() -> Self {
        Self {
            stage_spans: true,
            bus_spans: true,
            frame_events: true,
            level: Level::DEBUG,
        }
    }

    /// Disable all spans and per-frame events.
    pub fn none() -> Self {
        Self {
            stage_spans: false,
            bus_spans: false,
            frame_events: false,
            level: Level::INFO,
        }
    }

    /// Span for a stage, or a disabled span if stage spans are off.
    pub fn stage_span(&self, stage: &str, kind: &str) -> Span {
        if self.stage_spans {
            span_stage(stage, kind)
        } else {
            Span::none()
        }
    }

    /// Span for a bus endpoint, or a disabled span if bus spans are off.
    pub fn bus_span(&self, logical_id: u32, direction: &str) -> Span {
        if self.bus_spans {
            span_bus(logical_id, direction)
        } else {
            Span::none()
        }
    }
}

/// Create a span for one stage driver.
///
/// # Example
///
/// ```rust
/// use campipe::observability::span_stage;
///
/// let span = span_stage("isp0", "isp");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_stage(stage: &str, kind: &str) -> Span {
    span!(Level::DEBUG, "stage", stage = %stage, kind = %kind)
}

/// Create a span for one bus endpoint.
#[inline]
pub fn span_bus(logical_id: u32, direction: &str) -> Span {
    span!(
        Level::DEBUG,
        "bus",
        endpoint = format_args!("{:#x}", logical_id),
        direction = %direction
    )
}

/// Log a frame handed back to its owner.
#[inline]
pub fn trace_frame_done(stage: &str, instance: u32, sequence: u64, dropped: bool) {
    tracing::trace!(
        stage = %stage,
        instance,
        sequence,
        dropped,
        "frame released"
    );
}

/// Log a lifecycle change of a stage instance.
#[inline]
pub fn trace_state_change(stage: &str, instance: u32, from: &str, to: &str) {
    tracing::debug!(
        stage = %stage,
        instance,
        from = %from,
        to = %to,
        "instance state changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.stage_spans);
        assert!(config.bus_spans);
        assert!(!config.frame_events);
    }

    #[test]
    fn test_tracing_config_none_gives_disabled_spans() {
        let config = TracingConfig::none();
        assert!(config.stage_span("s", "isp").is_none());
        assert!(config.bus_span(1, "up-to-down").is_none());
        assert!(TracingConfig::all().frame_events);
    }

    #[test]
    fn test_trace_functions() {
        let _guard = span_stage("capture0", "capture").entered();
        let _bus = span_bus(0x10, "down-to-up").entered();
        trace_frame_done("capture0", 0, 1, false);
        trace_state_change("capture0", 0, "stopped", "starting");
    }
}
