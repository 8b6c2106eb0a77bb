//! Viewport module for pan/zoom transforms and hit-testing.

use crate::color::ColorValue;
use crate::config::EngineConfig;
use crate::grid::{DirtyCells, GridCoordinate, GridStore};
use crate::surface::RenderSurface;
use kurbo::{Affine, Point, Rect, Size, Vec2};
use std::ops::Range;

/// Zoom factor applied per key press or zoom button click.
pub const KEY_ZOOM_STEP: f64 = 1.2;

/// Zoom factor applied per wheel notch.
pub const WHEEL_ZOOM_STEP: f64 = 1.05;

/// Extra zoom per screen pixel of change in pinch distance.
pub const PINCH_SENSITIVITY: f64 = 0.003;

// Absorbs float error when a point sits exactly on a cell's top-left corner.
const CELL_EPSILON: f64 = 1e-9;

/// Viewport manages the screen <-> grid transform.
///
/// A cell `(x, y)` is drawn as a `zoom`-sized square whose top-left corner is
/// at `offset + (x, y) * zoom` in screen pixels.
#[derive(Debug, Clone)]
pub struct Viewport {
    /// Screen-space translation of the grid origin (pan)
    offset: Vec2,
    /// Screen pixels per grid cell
    zoom: f64,
    min_zoom: f64,
    max_zoom: f64,
    initial_zoom: f64,
    /// Size of the drawing surface in screen pixels
    screen_size: Size,
    grid_width: u32,
    grid_height: u32,
    background: ColorValue,
    needs_full_redraw: bool,
}

impl Viewport {
    /// Create a viewport for a grid described by `config`.
    pub fn new(config: &EngineConfig, screen_size: Size) -> Self {
        Self {
            offset: Vec2::ZERO,
            zoom: config.initial_zoom.clamp(config.min_zoom, config.max_zoom),
            min_zoom: config.min_zoom,
            max_zoom: config.max_zoom,
            initial_zoom: config.initial_zoom,
            screen_size,
            grid_width: config.width,
            grid_height: config.height,
            background: config.background_color,
            needs_full_redraw: true,
        }
    }

    /// Get the affine transform for rendering (grid -> screen).
    pub fn transform(&self) -> Affine {
        Affine::translate(self.offset) * Affine::scale(self.zoom)
    }

    /// Get the inverse transform for input handling (screen -> grid).
    pub fn inverse_transform(&self) -> Affine {
        Affine::scale(1.0 / self.zoom) * Affine::translate(-self.offset)
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn offset(&self) -> Vec2 {
        self.offset
    }

    pub fn zoom_range(&self) -> (f64, f64) {
        (self.min_zoom, self.max_zoom)
    }

    pub fn screen_size(&self) -> Size {
        self.screen_size
    }

    /// Center of the surface in screen pixels.
    pub fn screen_center(&self) -> Point {
        Point::new(self.screen_size.width / 2.0, self.screen_size.height / 2.0)
    }

    /// Hit-test a screen point against the grid.
    ///
    /// Returns `None` when the point lands outside the grid.
    pub fn screen_to_grid(&self, screen_point: Point) -> Option<GridCoordinate> {
        let world = self.inverse_transform() * screen_point;
        let x = (world.x + CELL_EPSILON).floor();
        let y = (world.y + CELL_EPSILON).floor();
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        if x < 0.0
            || y < 0.0
            || x >= f64::from(self.grid_width)
            || y >= f64::from(self.grid_height)
        {
            return None;
        }
        Some(GridCoordinate::new(x as u32, y as u32))
    }

    /// Screen position of a cell's top-left corner.
    pub fn grid_to_screen(&self, coord: GridCoordinate) -> Point {
        self.transform() * Point::new(f64::from(coord.x), f64::from(coord.y))
    }

    /// Screen rectangle covered by a cell.
    pub fn cell_rect(&self, coord: GridCoordinate) -> Rect {
        Rect::from_origin_size(self.grid_to_screen(coord), Size::new(self.zoom, self.zoom))
    }

    /// Pan by a delta in screen pixels. The grid may leave the screen entirely.
    pub fn pan(&mut self, dx: f64, dy: f64) {
        self.offset += Vec2::new(dx, dy);
        self.needs_full_redraw = true;
    }

    /// Set the zoom level, keeping the grid point under the screen center fixed.
    pub fn set_zoom(&mut self, zoom: f64) {
        self.set_zoom_at(zoom, self.screen_center());
    }

    /// Set the zoom level, keeping the grid point under `anchor` fixed.
    pub fn set_zoom_at(&mut self, zoom: f64, anchor: Point) {
        if !zoom.is_finite() {
            return;
        }
        let new_zoom = zoom.clamp(self.min_zoom, self.max_zoom);
        if (new_zoom - self.zoom).abs() < f64::EPSILON {
            return;
        }

        let world_point = self.inverse_transform() * anchor;
        self.zoom = new_zoom;

        // Shift so world_point lands back under the anchor
        let new_screen = self.transform() * world_point;
        self.offset += anchor - new_screen;
        self.needs_full_redraw = true;
    }

    /// Multiply the zoom level, anchored at `anchor` or the screen center.
    pub fn zoom_by(&mut self, factor: f64, anchor: Option<Point>) {
        let anchor = anchor.unwrap_or_else(|| self.screen_center());
        self.set_zoom_at(self.zoom * factor, anchor);
    }

    /// Apply one step of a two-finger pinch.
    ///
    /// Spreading the fingers zooms in, pinching them together zooms out; the
    /// content under `midpoint` stays put.
    pub fn pinch(&mut self, previous_distance: f64, distance: f64, midpoint: Point) {
        let delta = distance - previous_distance;
        let factor = 1.0 + delta.abs() * PINCH_SENSITIVITY;
        if delta > 0.0 {
            self.zoom_by(factor, Some(midpoint));
        } else if delta < 0.0 {
            self.zoom_by(1.0 / factor, Some(midpoint));
        }
    }

    /// Recompute the view after the surface was resized.
    ///
    /// The grid point that was at the old screen center moves to the new one.
    pub fn resize(&mut self, screen_size: Size) {
        let old_center = self.screen_center();
        self.screen_size = screen_size;
        self.offset += self.screen_center() - old_center;
        self.needs_full_redraw = true;
    }

    /// Reset pan and zoom.
    pub fn reset(&mut self) {
        self.offset = Vec2::ZERO;
        self.zoom = self.initial_zoom.clamp(self.min_zoom, self.max_zoom);
        self.needs_full_redraw = true;
    }

    /// Request a full redraw on the next render.
    pub fn invalidate(&mut self) {
        self.needs_full_redraw = true;
    }

    /// Range of cells at least partially on screen, or `None` if the grid is
    /// entirely off-screen.
    pub fn visible_cells(&self) -> Option<(Range<u32>, Range<u32>)> {
        let inverse = self.inverse_transform();
        let top_left = inverse * Point::ZERO;
        let bottom_right = inverse * Point::new(self.screen_size.width, self.screen_size.height);

        let clamp_range = |lo: f64, hi: f64, max: u32| -> Option<Range<u32>> {
            let start = lo.floor().max(0.0);
            let end = hi.ceil().min(f64::from(max));
            (start < end).then(|| start as u32..end as u32)
        };

        let xs = clamp_range(top_left.x, bottom_right.x, self.grid_width)?;
        let ys = clamp_range(top_left.y, bottom_right.y, self.grid_height)?;
        Some((xs, ys))
    }

    /// Draw pending changes to the surface.
    ///
    /// Pans, zooms, resizes and snapshots repaint the visible window; otherwise
    /// only cells written since the last render are drawn. Returns the number
    /// of cells drawn.
    pub fn render<S: RenderSurface + ?Sized>(
        &mut self,
        store: &mut GridStore,
        surface: &mut S,
    ) -> usize {
        let dirty = store.take_dirty();
        let full = std::mem::take(&mut self.needs_full_redraw) || dirty == DirtyCells::All;

        let mut drawn = 0;
        if full {
            surface.clear(self.background.to_peniko());
            if let Some((xs, ys)) = self.visible_cells() {
                for y in ys {
                    for x in xs.clone() {
                        drawn += self.draw_cell(store, surface, GridCoordinate::new(x, y));
                    }
                }
            }
        } else if let DirtyCells::Cells(cells) = dirty {
            let screen = Rect::from_origin_size(Point::ZERO, self.screen_size);
            for coord in cells {
                if self.cell_rect(coord).intersect(screen).area() > 0.0 {
                    drawn += self.draw_cell(store, surface, coord);
                }
            }
        } else {
            return 0;
        }

        surface.present();
        drawn
    }

    fn draw_cell<S: RenderSurface + ?Sized>(
        &self,
        store: &GridStore,
        surface: &mut S,
        coord: GridCoordinate,
    ) -> usize {
        match store.get(coord) {
            Ok(color) => {
                surface.fill_rect(self.cell_rect(coord), color.to_peniko());
                1
            }
            Err(_) => 0,
        }
    }
}
