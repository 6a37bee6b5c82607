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

//! Module responsible for assembling normalized fields of one
//! member into a four-dimensional array and writing it,
//! together with statistics and coordinates, into a Zarr store.
//!
//! The data array has dimensions `(time, variable, ensemble, cell)`
//! and is chunked by single time steps. All arrays and the root
//! group attributes are written in one pass into a staging directory
//! next to the destination, which is renamed to the destination only
//! after every array is stored. A destination path therefore always
//! holds a complete store.

use crate::{
    errors::ContainerError,
    pipeline::{extractor::FieldMapping, grid::LatLonGrid},
    Float,
};
use chrono::{NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use ndarray::{stack, Array1, Array4, ArrayView3, Axis};
use serde_json::{json, Map, Value};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use zarrs::{
    array::{codec::GzipCodec, data_type, Array, ArrayBuilder},
    filesystem::FilesystemStore,
    group::GroupBuilder,
    storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits},
};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const COMPRESSION_LEVEL: u32 = 5;

/// Per-variable statistics over time, ensemble and cells.
#[derive(Clone, PartialEq, Debug)]
pub struct Statistics {
    pub mean: Array1<Float>,
    pub minimum: Array1<Float>,
    pub squares: Array1<Float>,
    pub stdev: Array1<Float>,
}

impl Statistics {
    fn compute(data: &Array4<Float>) -> Self {
        let variables = data.len_of(Axis(1));

        let mut mean = Array1::zeros(variables);
        let mut minimum = Array1::zeros(variables);
        let mut squares = Array1::zeros(variables);
        let mut stdev = Array1::zeros(variables);

        for (i, values) in data.axis_iter(Axis(1)).enumerate() {
            mean[i] = values.mean().unwrap_or(Float::NAN);
            minimum[i] = nan_min(values);
            squares[i] = values.mapv(|v| v * v).mean().unwrap_or(Float::NAN);
            stdev[i] = values.std(0.0);
        }

        Statistics {
            mean,
            minimum,
            squares,
            stdev,
        }
    }
}

/// Minimum which, unlike `f64::min`, propagates NaNs.
fn nan_min(values: ArrayView3<Float>) -> Float {
    values.fold(Float::INFINITY, |acc, &v| {
        if acc.is_nan() || v.is_nan() {
            Float::NAN
        } else {
            acc.min(v)
        }
    })
}

/// Fully assembled store contents of one member.
#[derive(Clone, PartialEq, Debug)]
pub struct Container {
    pub data: Array4<Float>,
    pub variables: Vec<String>,
    pub name_to_index: BTreeMap<String, usize>,
    pub statistics: Statistics,
    pub dates: [NaiveDateTime; 2],
    pub lats: Array1<Float>,
    pub lons: Array1<Float>,
}

impl Container {
    /// Stacks fields in their mapping order and computes statistics.
    ///
    /// Every requested field must be present and have exactly
    /// one row per date and one column per grid cell.
    pub fn assemble(
        fields: &FieldMapping,
        dates: [NaiveDateTime; 2],
        grid: &LatLonGrid,
    ) -> Result<Self, ContainerError> {
        if !fields.missing().is_empty() {
            return Err(ContainerError::MissingFields(
                fields.missing().iter().map(|m| m.to_string()).collect(),
            ));
        }

        if fields.is_empty() {
            return Err(ContainerError::EmptyMapping);
        }

        let cell_count = grid.cell_count();

        if grid.lons.len() != cell_count {
            return Err(ContainerError::CoordinateMismatch("longitudes"));
        }

        let expected = (dates.len(), cell_count);

        for (name, values) in fields.iter() {
            if values.dim() != expected {
                return Err(ContainerError::InvalidShape {
                    variable: name.to_string(),
                    expected,
                    found: values.dim(),
                });
            }
        }

        let variables: Vec<String> = fields.names().map(|n| n.to_string()).collect();
        let name_to_index = variables
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let views: Vec<_> = fields.iter().map(|(_, values)| values.view()).collect();
        let data = stack(Axis(1), views.as_slice())?.insert_axis(Axis(2));

        debug!("Assembled data array of shape {:?}", data.shape());

        let statistics = Statistics::compute(&data);

        Ok(Container {
            data,
            variables,
            name_to_index,
            statistics,
            dates,
            lats: grid.lats.clone(),
            lons: grid.lons.clone(),
        })
    }

    /// Writes the container into a new Zarr store at `path`,
    /// replacing anything that is already there.
    ///
    /// On error nothing is left at `path` nor in the staging directory.
    pub fn save(&self, path: &Path, resolution: &str) -> Result<(), ContainerError> {
        let staging = staging_path(path);

        if staging.exists() {
            debug!("Removing stale staging store {}", staging.display());
            fs::remove_dir_all(&staging)?;
        }

        if let Err(err) = self.write_store(&staging, resolution) {
            if staging.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!("Cannot remove {}: {}", staging.display(), cleanup);
                }
            }

            return Err(err);
        }

        if path.exists() {
            fs::remove_dir_all(path)?;
        }

        fs::rename(&staging, path)?;

        debug!("Saved container to {}", path.display());

        Ok(())
    }

    fn write_store(&self, path: &Path, resolution: &str) -> Result<(), ContainerError> {
        let store: ReadableWritableListableStorage = Arc::new(FilesystemStore::new(path)?);

        let (times, variables, members, cells) = self.data.dim();
        let (times, variables, members, cells) =
            (times as u64, variables as u64, members as u64, cells as u64);

        let mut attributes = Map::new();
        attributes.insert(
            "name_to_index".to_string(),
            serde_json::to_value(&self.name_to_index)?,
        );
        attributes.insert("resolution".to_string(), json!(resolution));
        attributes.insert(
            "start_date".to_string(),
            json!(self.dates[0].format(TIME_FORMAT).to_string()),
        );
        attributes.insert(
            "end_date".to_string(),
            json!(self.dates[1].format(TIME_FORMAT).to_string()),
        );

        GroupBuilder::new()
            .attributes(attributes)
            .build(store.clone(), "/")?
            .store_metadata()?;

        let mut data = ArrayBuilder::new(
            vec![times, variables, members, cells],
            vec![1, variables, members, cells],
            data_type::float64(),
            Float::NAN,
        );
        data.bytes_to_bytes_codecs(vec![Arc::new(
            GzipCodec::new(COMPRESSION_LEVEL)
                .map_err(|err| ContainerError::Compression(err.to_string()))?,
        )]);
        let data = create_array(
            &store,
            "/data",
            data,
            &["time", "variable", "ensemble", "cell"],
            None,
        )?;
        let values: Vec<Float> = self.data.iter().copied().collect();
        data.store_array_subset(&data.subset_all(), &values)?;

        let statistics = [
            ("/mean", &self.statistics.mean),
            ("/minimum", &self.statistics.minimum),
            ("/squares", &self.statistics.squares),
            ("/stdev", &self.statistics.stdev),
        ];

        for (array_path, values) in statistics {
            write_floats(&store, array_path, values, "variable")?;
        }

        write_floats(&store, "/latitudes", &self.lats, "cell")?;
        write_floats(&store, "/longitudes", &self.lons, "cell")?;

        write_index(&store, "/time", times, "time")?;
        write_index(&store, "/ensemble", members, "ensemble")?;
        write_index(&store, "/cell", cells, "cell")?;

        let names = ArrayBuilder::new(vec![variables], vec![variables], data_type::string(), "");
        let names = create_array(&store, "/variable", names, &["variable"], None)?;
        names.store_array_subset(&names.subset_all(), &self.variables)?;

        let mut date_attributes = Map::new();
        date_attributes.insert("units".to_string(), json!("seconds since 1970-01-01"));
        date_attributes.insert("calendar".to_string(), json!("proleptic_gregorian"));

        let dates: Vec<i64> = self
            .dates
            .iter()
            .map(|d| Utc.from_utc_datetime(d).timestamp())
            .collect();
        let dates_builder = ArrayBuilder::new(vec![times], vec![times], data_type::int64(), 0i64);
        let dates_array = create_array(
            &store,
            "/dates",
            dates_builder,
            &["time"],
            Some(date_attributes),
        )?;
        dates_array.store_array_subset(&dates_array.subset_all(), &dates)?;

        Ok(())
    }
}

/// Sibling directory in which the store is written, `<path>.tmp`.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");

    PathBuf::from(staging)
}

type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

/// Sets common metadata on the array and writes it to the store.
fn create_array(
    store: &ReadableWritableListableStorage,
    array_path: &str,
    mut builder: ArrayBuilder,
    dimensions: &[&str],
    attributes: Option<Map<String, Value>>,
) -> Result<StoreArray, ContainerError> {
    builder.dimension_names(Some(dimensions.to_vec()));

    if let Some(attributes) = attributes {
        builder.attributes(attributes);
    }

    let array = builder.build(store.clone(), array_path)?;
    array.store_metadata()?;

    Ok(array)
}

fn write_floats(
    store: &ReadableWritableListableStorage,
    array_path: &str,
    values: &Array1<Float>,
    dimension: &str,
) -> Result<(), ContainerError> {
    let len = values.len() as u64;
    let builder = ArrayBuilder::new(vec![len], vec![len], data_type::float64(), Float::NAN);
    let array = create_array(store, array_path, builder, &[dimension], None)?;
    array.store_array_subset(&array.subset_all(), &values.to_vec())?;

    Ok(())
}

/// Writes `0..len` integer coordinate.
fn write_index(
    store: &ReadableWritableListableStorage,
    array_path: &str,
    len: u64,
    dimension: &str,
) -> Result<(), ContainerError> {
    let builder = ArrayBuilder::new(vec![len], vec![len], data_type::int64(), 0i64);
    let array = create_array(store, array_path, builder, &[dimension], None)?;
    let index: Vec<i64> = (0..len as i64).collect();
    array.store_array_subset(&array.subset_all(), &index)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{staging_path, Container};
    use crate::{
        errors::ContainerError,
        pipeline::{
            configuration::tests::test_cycle,
            extractor::{forecast_times, FieldMapping},
            grid::LatLonGrid,
        },
        Float,
    };
    use float_cmp::approx_eq;
    use ndarray::{array, Array2};
    use std::{fs, path::Path, sync::Arc};
    use zarrs::{array::Array, filesystem::FilesystemStore, group::Group};

    fn grid() -> LatLonGrid {
        LatLonGrid::regular(90.0)
    }

    fn mapping() -> FieldMapping {
        let first = Array2::from_shape_fn((2, 12), |(t, c)| (t * 12 + c) as Float);
        let second = Array2::from_elem((2, 12), -3.0);
        let third = Array2::from_shape_fn((2, 12), |(t, _)| if t == 0 { 1.0 } else { 3.0 });

        FieldMapping::from_entries(vec![
            ("2t".to_string(), first),
            ("skt".to_string(), second),
            ("z_500".to_string(), third),
        ])
    }

    #[test]
    fn variable_axis_matches_index() {
        let container =
            Container::assemble(&mapping(), forecast_times(test_cycle()), &grid()).unwrap();

        assert_eq!(container.data.shape(), &[2, 3, 1, 12]);
        assert_eq!(container.variables, vec!["2t", "skt", "z_500"]);
        assert_eq!(container.name_to_index.len(), container.variables.len());

        let fields = mapping();

        for (name, index) in &container.name_to_index {
            assert_eq!(container.variables[*index], *name);

            let expected = fields.get(name).unwrap();
            for t in 0..2 {
                for c in 0..12 {
                    assert!(approx_eq!(
                        Float,
                        container.data[[t, *index, 0, c]],
                        expected[[t, c]]
                    ));
                }
            }
        }
    }

    #[test]
    fn statistics_per_variable() {
        let container =
            Container::assemble(&mapping(), forecast_times(test_cycle()), &grid()).unwrap();
        let stats = &container.statistics;

        // 0..24
        assert!(approx_eq!(Float, stats.mean[0], 11.5));
        assert!(approx_eq!(Float, stats.minimum[0], 0.0));
        assert!(approx_eq!(Float, stats.squares[0], 4324.0 / 24.0, epsilon = 1e-9));
        assert!(approx_eq!(Float, stats.stdev[0], (575.0 as Float / 12.0).sqrt(), epsilon = 1e-9));

        assert!(approx_eq!(Float, stats.mean[1], -3.0));
        assert!(approx_eq!(Float, stats.minimum[1], -3.0));
        assert!(approx_eq!(Float, stats.squares[1], 9.0));
        assert!(approx_eq!(Float, stats.stdev[1], 0.0));

        assert!(approx_eq!(Float, stats.mean[2], 2.0));
        assert!(approx_eq!(Float, stats.squares[2], 5.0));
        assert!(approx_eq!(Float, stats.stdev[2], 1.0));
    }

    #[test]
    fn short_variable_is_rejected() {
        let fields = FieldMapping::from_entries(vec![
            ("2t".to_string(), Array2::zeros((2, 12))),
            ("t_850".to_string(), Array2::zeros((1, 12))),
        ]);

        let result = Container::assemble(&fields, forecast_times(test_cycle()), &grid());

        assert!(matches!(
            result,
            Err(ContainerError::InvalidShape { ref variable, expected: (2, 12), found: (1, 12) })
                if variable == "t_850"
        ));
    }

    #[test]
    fn empty_mapping_is_rejected() {
        let result = Container::assemble(
            &FieldMapping::default(),
            forecast_times(test_cycle()),
            &grid(),
        );

        assert!(matches!(result, Err(ContainerError::EmptyMapping)));
    }

    #[test]
    fn nan_propagates_to_minimum() {
        let fields = FieldMapping::from_entries(vec![(
            "sp".to_string(),
            array![
                [1.0, 2.0, 3.0, Float::NAN, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
                [1.0; 12]
            ],
        )]);

        let container =
            Container::assemble(&fields, forecast_times(test_cycle()), &grid()).unwrap();

        assert!(container.statistics.minimum[0].is_nan());
        assert!(container.statistics.mean[0].is_nan());
    }

    #[test]
    fn failed_write_leaves_no_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gefs_en_data_0p25_2025-08-01T00_M3.zarr");

        let mut container =
            Container::assemble(&mapping(), forecast_times(test_cycle()), &grid()).unwrap();
        // data and statistics are written before the variable names fail to fit
        container.variables.push("q_500".to_string());

        assert!(container.save(&path, "0p25").is_err());
        assert!(!path.exists());
        assert!(!staging_path(&path).exists());

        container.variables.pop();
        container.save(&path, "0p25").unwrap();

        assert!(path.join("dates").is_dir());
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn stale_staging_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gefs_en_data_0p25_2025-08-01T00_M4.zarr");
        let staging = staging_path(&path);

        fs::create_dir_all(staging.join("data")).unwrap();
        fs::write(staging.join("zarr.json"), b"{}").unwrap();

        let container =
            Container::assemble(&mapping(), forecast_times(test_cycle()), &grid()).unwrap();
        container.save(&path, "0p25").unwrap();

        assert!(!staging.exists());

        let store = Arc::new(FilesystemStore::new(&path).unwrap());
        let group = Group::open(store, "/").unwrap();
        assert_eq!(group.attributes()["resolution"], "0p25");
    }

    #[test]
    fn staging_is_a_sibling() {
        assert_eq!(
            staging_path(Path::new("/ics/0p25/2025-08-01T00/gefs_en_data_0p25_2025-08-01T00_M0.zarr")),
            Path::new("/ics/0p25/2025-08-01T00/gefs_en_data_0p25_2025-08-01T00_M0.zarr.tmp")
        );
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gefs_en_data_0p25_2025-08-01T00_M0.zarr");
        let grid = grid();

        let container =
            Container::assemble(&mapping(), forecast_times(test_cycle()), &grid).unwrap();
        container.save(&path, "0p25").unwrap();
        // second save replaces the store
        container.save(&path, "0p25").unwrap();

        let store = Arc::new(FilesystemStore::new(&path).unwrap());

        let lats = Array::open(store.clone(), "/latitudes").unwrap();
        let lats = lats.retrieve_array_subset::<Vec<f64>>(&lats.subset_all()).unwrap();
        assert_eq!(lats, grid.lats.to_vec());

        let lons = Array::open(store.clone(), "/longitudes").unwrap();
        let lons = lons.retrieve_array_subset::<Vec<f64>>(&lons.subset_all()).unwrap();
        assert_eq!(lons, grid.lons.to_vec());

        let data = Array::open(store.clone(), "/data").unwrap();
        assert_eq!(data.shape(), &[2, 3, 1, 12]);
        let values = data.retrieve_array_subset::<Vec<f64>>(&data.subset_all()).unwrap();
        assert_eq!(values, container.data.iter().copied().collect::<Vec<f64>>());

        let dates = Array::open(store.clone(), "/dates").unwrap();
        let dates = dates.retrieve_array_subset::<Vec<i64>>(&dates.subset_all()).unwrap();
        assert_eq!(dates, vec![1_753_984_800, 1_754_006_400]);

        let group = Group::open(store, "/").unwrap();
        let attributes = group.attributes();
        assert_eq!(attributes["name_to_index"]["z_500"], 2);
        assert_eq!(attributes["resolution"], "0p25");
        assert_eq!(attributes["start_date"], "2025-07-31T18:00:00");
        assert_eq!(attributes["end_date"], "2025-08-01T00:00:00");
    }
}
