//! Pixel grid storage.
//!
//! The grid mirrors the authority's canvas. Every in-range cell always has a
//! color (the default until written); cells are overwritten, never removed.

use crate::color::ColorValue;
use crate::error::{CanvasError, CanvasResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A cell position on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCoordinate {
    pub x: u32,
    pub y: u32,
}

impl GridCoordinate {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Cells that need drawing since the last render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyCells {
    /// Nothing changed.
    Clean,
    /// Only these cells changed.
    Cells(Vec<GridCoordinate>),
    /// Everything must be redrawn (e.g. after a snapshot).
    All,
}

/// Fixed-size store of cell colors.
#[derive(Debug, Clone)]
pub struct GridStore {
    width: u32,
    height: u32,
    default_color: ColorValue,
    cells: Vec<ColorValue>,
    dirty: HashSet<GridCoordinate>,
    all_dirty: bool,
}

impl GridStore {
    /// Create a grid where every cell holds `default_color`.
    pub fn new(width: u32, height: u32, default_color: ColorValue) -> Self {
        Self {
            width,
            height,
            default_color,
            cells: vec![default_color; width as usize * height as usize],
            dirty: HashSet::new(),
            all_dirty: true,
        }
    }

    /// Grid size as `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn default_color(&self) -> ColorValue {
        self.default_color
    }

    pub fn contains(&self, coord: GridCoordinate) -> bool {
        coord.x < self.width && coord.y < self.height
    }

    /// Validate a signed position and turn it into a coordinate.
    pub fn checked(&self, x: i64, y: i64) -> CanvasResult<GridCoordinate> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return Err(self.out_of_bounds(x, y));
        }
        // Both fit in u32 after the range check.
        Ok(GridCoordinate::new(x as u32, y as u32))
    }

    /// Current color of a cell.
    pub fn get(&self, coord: GridCoordinate) -> CanvasResult<ColorValue> {
        let index = self.index(coord)?;
        Ok(self.cells[index])
    }

    /// Overwrite a cell and mark it for the next render pass.
    pub fn set(&mut self, coord: GridCoordinate, color: ColorValue) -> CanvasResult<()> {
        let index = self.index(coord)?;
        self.cells[index] = color;
        if !self.all_dirty {
            self.dirty.insert(coord);
        }
        Ok(())
    }

    /// Replace the whole grid in one batch.
    ///
    /// Cells not listed in `entries` revert to the default color, except cells
    /// for which `preserve` returns true; those keep their current value. The
    /// grid is left untouched if any entry is out of range.
    pub fn replace_all<I, F>(&mut self, entries: I, preserve: F) -> CanvasResult<()>
    where
        I: IntoIterator<Item = (GridCoordinate, ColorValue)>,
        F: Fn(GridCoordinate) -> bool,
    {
        let mut next = vec![self.default_color; self.cells.len()];
        for (coord, color) in entries {
            let index = self.index(coord)?;
            next[index] = color;
        }
        for y in 0..self.height {
            for x in 0..self.width {
                let coord = GridCoordinate::new(x, y);
                if preserve(coord) {
                    let index = self.flat_index(coord);
                    next[index] = self.cells[index];
                }
            }
        }
        self.cells = next;
        self.mark_all_dirty();
        Ok(())
    }

    /// Force a full redraw on the next render pass.
    pub fn mark_all_dirty(&mut self) {
        self.all_dirty = true;
        self.dirty.clear();
    }

    /// Drain the dirty set.
    pub fn take_dirty(&mut self) -> DirtyCells {
        if std::mem::take(&mut self.all_dirty) {
            self.dirty.clear();
            return DirtyCells::All;
        }
        if self.dirty.is_empty() {
            return DirtyCells::Clean;
        }
        DirtyCells::Cells(self.dirty.drain().collect())
    }

    fn index(&self, coord: GridCoordinate) -> CanvasResult<usize> {
        if !self.contains(coord) {
            return Err(self.out_of_bounds(i64::from(coord.x), i64::from(coord.y)));
        }
        Ok(self.flat_index(coord))
    }

    fn flat_index(&self, coord: GridCoordinate) -> usize {
        coord.y as usize * self.width as usize + coord.x as usize
    }

    fn out_of_bounds(&self, x: i64, y: i64) -> CanvasError {
        CanvasError::OutOfBounds {
            x,
            y,
            width: self.width,
            height: self.height,
        }
    }
}
