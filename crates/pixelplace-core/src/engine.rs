//! The engine façade used by input glue.
//!
//! [`CanvasEngine`] owns the grid, the viewport and the sync channel. Nothing
//! outside the engine can mutate them except through the methods here, and all
//! methods run to completion on the caller's thread. Network progress happens
//! in [`CanvasEngine::poll`], which the host calls once per frame.

use kurbo::Point;

use crate::color::ColorValue;
use crate::config::EngineConfig;
use crate::error::CanvasResult;
use crate::grid::{GridCoordinate, GridStore};
use crate::surface::RenderSurface;
use crate::sync::{ConnectionState, PendingWrite, SyncChannel, SyncEvent};
use crate::transport::{PlatformTransport, Transport};
use crate::viewport::Viewport;

/// Shared pixel canvas: local grid mirror, view transform and authority link.
pub struct CanvasEngine<S: RenderSurface, T: Transport = PlatformTransport> {
    store: GridStore,
    viewport: Viewport,
    sync: SyncChannel<T>,
    surface: S,
}

impl<S: RenderSurface, T: Transport + Default> CanvasEngine<S, T> {
    /// Create an engine with the platform's default transport.
    pub fn new(config: EngineConfig, surface: S) -> CanvasResult<Self> {
        Self::with_transport(config, surface, T::default())
    }
}

impl<S: RenderSurface, T: Transport> CanvasEngine<S, T> {
    /// Create an engine over an explicit transport.
    pub fn with_transport(config: EngineConfig, surface: S, transport: T) -> CanvasResult<Self> {
        config.validate()?;
        let store = GridStore::new(config.width, config.height, config.default_color);
        let viewport = Viewport::new(&config, surface.size());
        let sync = SyncChannel::new(transport, &config);
        log::info!(
            "Canvas engine ready: {}x{} grid, surface {}x{}",
            config.width,
            config.height,
            surface.size().width,
            surface.size().height
        );
        Ok(Self {
            store,
            viewport,
            sync,
            surface,
        })
    }

    /// Whether the drawing surface initialized successfully.
    pub fn ok(&self) -> bool {
        self.surface.is_ready()
    }

    // --- Connection ---

    /// Start connecting to the authority. Returns immediately.
    pub fn init_connection(&mut self, endpoint: &str) {
        self.sync.connect(endpoint);
    }

    /// Process network traffic and reconnect timers.
    pub fn poll(&mut self) -> Vec<SyncEvent> {
        self.sync.poll(&mut self.store)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sync.state()
    }

    /// Unacknowledged local writes, oldest first.
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.sync.pending_writes()
    }

    /// Close the connection and stop reconnecting.
    pub fn shutdown(&mut self) {
        self.sync.disconnect();
    }

    // --- Pixels ---

    /// Paint a cell. Shows up locally at once; the authority is told when connected.
    pub fn set_pixel(&mut self, x: i64, y: i64, color: ColorValue) -> CanvasResult<()> {
        let coord = self.store.checked(x, y)?;
        self.sync.submit_write(&mut self.store, coord, color)?;
        Ok(())
    }

    /// Current color of a cell.
    pub fn get_color(&self, coord: GridCoordinate) -> CanvasResult<ColorValue> {
        self.store.get(coord)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.store.dimensions()
    }

    // --- View ---

    /// Cell under a screen point, or `None` if the point misses the grid.
    pub fn click(&self, screen_point: Point) -> Option<GridCoordinate> {
        self.viewport.screen_to_grid(screen_point)
    }

    /// Paint the cell under a screen point.
    ///
    /// Returns `Ok(true)` if a write was made. Points off the grid and cells
    /// that already hold `color` are left alone.
    pub fn paint_at(&mut self, screen_point: Point, color: ColorValue) -> CanvasResult<bool> {
        let Some(coord) = self.click(screen_point) else {
            return Ok(false);
        };
        if self.store.get(coord)? == color {
            return Ok(false);
        }
        self.sync.submit_write(&mut self.store, coord, color)?;
        Ok(true)
    }

    /// Color of the cell under a screen point.
    pub fn pick_color(&self, screen_point: Point) -> Option<ColorValue> {
        let coord = self.click(screen_point)?;
        self.store.get(coord).ok()
    }

    /// Pan the view by a screen-space delta.
    pub fn move_view(&mut self, dx: f64, dy: f64) {
        self.viewport.pan(dx, dy);
    }

    pub fn zoom(&self) -> f64 {
        self.viewport.zoom()
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.viewport.set_zoom(zoom);
    }

    pub fn zoom_in(&mut self, factor: f64) {
        self.viewport.zoom_by(factor, None);
    }

    pub fn zoom_out(&mut self, factor: f64) {
        self.viewport.zoom_by(1.0 / factor, None);
    }

    /// Zoom by `factor` keeping the content under `anchor` in place.
    pub fn zoom_by(&mut self, factor: f64, anchor: Option<Point>) {
        self.viewport.zoom_by(factor, anchor);
    }

    pub fn pinch(&mut self, previous_distance: f64, distance: f64, midpoint: Point) {
        self.viewport.pinch(previous_distance, distance, midpoint);
    }

    /// Pick up a new surface size.
    pub fn update_view_scale(&mut self) {
        self.viewport.resize(self.surface.size());
    }

    /// Draw whatever changed since the last call. Returns the number of cells drawn.
    pub fn draw(&mut self) -> usize {
        self.viewport.render(&mut self.store, &mut self.surface)
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}
