/*
Copyright 2025 Jakub Lewandowski

This file is part of GEFS Ensemble Initial Conditions (GEFS-ICS).

GEFS Ensemble Initial Conditions (GEFS-ICS) is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

GEFS Ensemble Initial Conditions (GEFS-ICS) is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with GEFS Ensemble Initial Conditions (GEFS-ICS). If not, see https://www.gnu.org/licenses/.
*/

//! Regular global latitude-longitude grid on which
//! GEFS fields are provided.
//!
//! GRIB messages store values row-by-row, from north to south,
//! with longitudes increasing eastward from the Greenwich meridian.
//! Cells are numbered in the same order so flattened GRIB values
//! and the coordinates stored in containers always line up.

use crate::Float;
use ndarray::Array1;

/// Per-cell coordinates of the grid, flattened row-major.
#[derive(Clone, PartialEq, Debug)]
pub struct LatLonGrid {
    pub lats: Array1<Float>,
    pub lons: Array1<Float>,
}

impl LatLonGrid {
    /// Builds the global grid with given spacing (in degrees)
    /// spanning latitudes `90..=-90` and longitudes `0..360`.
    pub fn regular(spacing: Float) -> Self {
        let lat_count = (180.0 / spacing).round() as usize + 1;
        let lon_count = (360.0 / spacing).round() as usize;

        let distinct_lats = Array1::linspace(90.0, -90.0, lat_count);
        let distinct_lons = Array1::from_shape_fn(lon_count, |i| i as Float * spacing);

        LatLonGrid::from_distinct(&distinct_lats, &distinct_lons)
    }

    /// Casts distinct latitudes and longitudes into
    /// coordinates of every cell.
    pub fn from_distinct(distinct_lats: &Array1<Float>, distinct_lons: &Array1<Float>) -> Self {
        let lats = distinct_lats
            .iter()
            .flat_map(|&lat| std::iter::repeat(lat).take(distinct_lons.len()))
            .collect::<Array1<Float>>();

        let lons = distinct_lats
            .iter()
            .flat_map(|_| distinct_lons.iter().copied())
            .collect::<Array1<Float>>();

        LatLonGrid { lats, lons }
    }

    pub fn cell_count(&self) -> usize {
        self.lats.len()
    }
}

#[cfg(test)]
mod tests {
    use super::LatLonGrid;
    use float_cmp::approx_eq;

    #[test]
    fn quarter_degree_grid() {
        let grid = LatLonGrid::regular(0.25);

        assert_eq!(grid.cell_count(), 721 * 1440);
        assert_eq!(grid.lons.len(), grid.cell_count());

        assert!(approx_eq!(f64, grid.lats[0], 90.0));
        assert!(approx_eq!(f64, grid.lons[0], 0.0));
        assert!(approx_eq!(f64, grid.lons[1439], 359.75));
        assert!(approx_eq!(f64, grid.lats[1440], 89.75));
        assert!(approx_eq!(f64, grid.lons[1440], 0.0));
        assert!(approx_eq!(f64, grid.lats[grid.cell_count() - 1], -90.0));
        assert!(approx_eq!(f64, grid.lons[grid.cell_count() - 1], 359.75));
    }

    #[test]
    fn coarse_grid_ordering() {
        let grid = LatLonGrid::regular(90.0);

        assert_eq!(grid.cell_count(), 12);
        assert_eq!(
            grid.lats.to_vec(),
            vec![90.0, 90.0, 90.0, 90.0, 0.0, 0.0, 0.0, 0.0, -90.0, -90.0, -90.0, -90.0]
        );
        assert_eq!(
            grid.lons.to_vec(),
            vec![0.0, 90.0, 180.0, 270.0, 0.0, 90.0, 180.0, 270.0, 0.0, 90.0, 180.0, 270.0]
        );
    }
}
