//! Calibrated thermal grid

use crate::protocol::{GRID_CELLS, GRID_COLS, GRID_ROWS};
use serde::{Deserialize, Serialize};

/// Where a grid's scale/offset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Derived from the frame's own embedded calibration block
    Embedded,
    /// Derived from a fetched EEPROM response
    Fetched,
    /// Static default applied while no valid calibration is held
    StaleFallback,
}

/// 24x32 matrix of Celsius values, row-major, immutable after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalGrid {
    pub frame_id: u32,
    pub provenance: Provenance,
    celsius: Vec<f64>,
}

impl ThermalGrid {
    /// Convert raw signed cells with `celsius = raw * scale + offset`
    pub fn from_raw(
        frame_id: u32,
        cells: &[i16],
        scale: f64,
        offset: f64,
        provenance: Provenance,
    ) -> Self {
        debug_assert_eq!(cells.len(), GRID_CELLS);
        Self {
            frame_id,
            provenance,
            celsius: cells.iter().map(|&c| c as f64 * scale + offset).collect(),
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.celsius[row * GRID_COLS + col]
    }

    /// Row-major cell iterator with coordinates
    pub fn iter_cells(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.celsius
            .iter()
            .enumerate()
            .map(|(i, &c)| (i / GRID_COLS, i % GRID_COLS, c))
    }

    pub fn rows(&self) -> usize {
        GRID_ROWS
    }

    pub fn cols(&self) -> usize {
        GRID_COLS
    }
}
