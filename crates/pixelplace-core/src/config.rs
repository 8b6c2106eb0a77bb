//! Engine configuration.

use crate::color::ColorValue;
use crate::error::{CanvasError, CanvasResult};
use serde::{Deserialize, Serialize};

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(target_arch = "wasm32")]
use web_time::Duration;

/// Default grid edge length in cells.
pub const DEFAULT_GRID_SIZE: u32 = 1000;

/// Largest grid the engine will allocate, in cells.
pub const MAX_CELLS: u64 = 1 << 26;

/// Tunables for a [`CanvasEngine`](crate::engine::CanvasEngine).
///
/// Every field has a default, so a JSON config only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Grid width in cells
    pub width: u32,
    /// Grid height in cells
    pub height: u32,
    /// Color of cells nobody has written
    pub default_color: ColorValue,
    /// Fill for screen area outside the grid
    pub background_color: ColorValue,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub initial_zoom: f64,
    /// First reconnect delay; doubles per failed attempt
    pub reconnect_base_ms: u64,
    /// Upper bound on the reconnect delay
    pub reconnect_max_ms: u64,
    /// How long a transmitted write may wait for acknowledgment
    pub ack_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_GRID_SIZE,
            height: DEFAULT_GRID_SIZE,
            default_color: ColorValue::WHITE,
            background_color: ColorValue::new(204, 204, 204),
            min_zoom: 0.5,
            max_zoom: 50.0,
            initial_zoom: 1.0,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            ack_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> CanvasResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CanvasError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the engine cannot run with.
    pub fn validate(&self) -> CanvasResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CanvasError::Config(format!(
                "grid must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        let cells = u64::from(self.width) * u64::from(self.height);
        if cells > MAX_CELLS {
            return Err(CanvasError::Config(format!(
                "grid of {}x{} exceeds {} cells",
                self.width, self.height, MAX_CELLS
            )));
        }
        if !(self.min_zoom > 0.0 && self.min_zoom.is_finite() && self.max_zoom.is_finite()) {
            return Err(CanvasError::Config("zoom limits must be positive and finite".to_string()));
        }
        if self.min_zoom > self.max_zoom {
            return Err(CanvasError::Config(format!(
                "min_zoom {} exceeds max_zoom {}",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(CanvasError::Config(
                "reconnect_base_ms must be non-zero and at most reconnect_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}
