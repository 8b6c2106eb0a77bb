//! Drawing surface abstraction.
//!
//! The engine never talks to a GPU or DOM canvas directly. Whatever hosts it
//! (a WebGL context, a wgpu swapchain, an offscreen buffer) implements
//! [`RenderSurface`] and the viewport issues fills against it.

use kurbo::{Rect, Size};
use peniko::Color;

/// Trait for drawing backends.
pub trait RenderSurface {
    /// Whether the backend initialized successfully.
    fn is_ready(&self) -> bool {
        true
    }

    /// Current size in screen pixels.
    fn size(&self) -> Size;

    /// Fill the whole surface.
    fn clear(&mut self, color: Color);

    /// Fill an axis-aligned rectangle given in screen pixels.
    fn fill_rect(&mut self, rect: Rect, color: Color);

    /// Flush queued draw calls, if the backend batches them.
    fn present(&mut self) {}
}
