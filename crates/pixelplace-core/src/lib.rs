//! PixelPlace Core Library
//!
//! Client-side engine for a shared pixel canvas: a local mirror of the grid,
//! pan/zoom hit-testing, and optimistic synchronization with a remote authority.

pub mod color;
pub mod config;
pub mod engine;
pub mod error;
pub mod grid;
pub mod protocol;
pub mod surface;
pub mod sync;
pub mod transport;
pub mod viewport;

pub use color::ColorValue;
pub use config::{EngineConfig, MAX_CELLS};
pub use engine::CanvasEngine;
pub use error::{CanvasError, CanvasResult, ProtocolError, TransportError};
pub use grid::{DirtyCells, GridCoordinate, GridStore};
pub use protocol::{ClientMessage, ServerMessage, SnapshotEntry};
pub use surface::RenderSurface;
pub use sync::{ConnectionState, PendingWrite, SyncChannel, SyncEvent};
pub use transport::{PlatformTransport, Transport, TransportEvent};
pub use viewport::{Viewport, KEY_ZOOM_STEP, PINCH_SENSITIVITY, WHEEL_ZOOM_STEP};
