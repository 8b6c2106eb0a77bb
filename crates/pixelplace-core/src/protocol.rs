//! Wire messages exchanged with the authority.
//!
//! Messages are JSON objects tagged by `type`:
//! ```json
//! { "type": "hello", "client_id": "5c1f..." }
//! { "type": "write", "x": 3, "y": 7, "color": [255, 0, 0], "seq": 12 }
//! { "type": "snapshot", "width": 10, "height": 10,
//!   "entries": [{ "x": 2, "y": 2, "color": [0, 255, 0] }] }
//! { "type": "delta", "x": 3, "y": 7, "color": [255, 0, 0],
//!   "origin": "5c1f...", "origin_seq": 12 }
//! ```

use crate::color::ColorValue;
use crate::grid::GridCoordinate;
use serde::{Deserialize, Serialize};

/// Messages sent to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake; the authority answers with a snapshot
    Hello { client_id: String },
    /// Request to paint a cell
    Write {
        x: u32,
        y: u32,
        color: ColorValue,
        seq: u64,
    },
}

impl ClientMessage {
    pub fn write(coord: GridCoordinate, color: ColorValue, seq: u64) -> Self {
        ClientMessage::Write {
            x: coord.x,
            y: coord.y,
            color,
            seq,
        }
    }
}

/// One painted cell inside a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub x: u32,
    pub y: u32,
    pub color: ColorValue,
}

impl SnapshotEntry {
    pub fn coord(&self) -> GridCoordinate {
        GridCoordinate::new(self.x, self.y)
    }
}

/// Messages received from the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full grid state; unlisted cells hold the default color
    Snapshot {
        width: u32,
        height: u32,
        entries: Vec<SnapshotEntry>,
    },
    /// A single accepted write
    Delta {
        x: u32,
        y: u32,
        color: ColorValue,
        /// Client that issued the write, if known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
        /// Sequence number the origin attached to the write
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin_seq: Option<u64>,
    },
    /// Error message
    Error { message: String },
}
