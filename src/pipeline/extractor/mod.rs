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

//! Module responsible for extracting the fields of one
//! ensemble member from staged GEFS forecast files.
//!
//! For each member two forecast times are read: the previous
//! cycle (six hours before) and the current cycle. Every time
//! is provided in two files (primary `pgrb2` and secondary
//! `pgrb2s`), and a requested field is taken from the first
//! file that contains it. A field missing in both files is not
//! an error at this stage, it is recorded in the diagnostics
//! which are checked before the container is built.

mod normalize;
pub mod source;

pub use self::normalize::FieldMapping;

use self::source::{FieldSelector, FieldSource, SourceProvider};
use crate::{
    constants::{FILE_SUFFIXES, PRIOR_CYCLE_HOURS},
    errors::InputError,
    pipeline::{configuration::Fields, orchestrator::MemberJob},
    Float,
};
use chrono::{Duration, NaiveDateTime};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Field that was requested but not found for one of the forecast times.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MissingField {
    pub variable: String,
    pub time: NaiveDateTime,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.variable, self.time.format("%Y-%m-%dT%H"))
    }
}

/// Fields as read from GRIB files, before unit and name conversion.
///
/// Each entry has one row per forecast time in which
/// the field was found.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct RawFields {
    entries: Vec<(String, Array2<Float>)>,
    missing: Vec<MissingField>,
}

impl RawFields {
    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&Array2<Float>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    #[cfg(test)]
    pub fn missing(&self) -> &[MissingField] {
        &self.missing
    }

    fn push(&mut self, name: String, values: Array2<Float>) {
        self.entries.push((name, values));
    }
}

/// Returns the two forecast times consumed for a cycle,
/// the previous cycle first.
pub fn forecast_times(cycle: NaiveDateTime) -> [NaiveDateTime; 2] {
    [cycle - Duration::hours(PRIOR_CYCLE_HOURS), cycle]
}

/// Paths of primary and secondary GEFS files of a member at given time.
///
/// File names follow the NOMADS convention, e.g. `gec00.t00z.pgrb2.0p25.f000`
/// for the control member and `gep05.t06z.pgrb2s.0p25.f000` for perturbed ones.
pub fn member_file_paths(
    member_cache: &Path,
    member: usize,
    time: NaiveDateTime,
    resolution: &str,
) -> Vec<PathBuf> {
    let kind = if member == 0 { 'c' } else { 'p' };
    let directory = member_cache.join(time.format("%Y%m%dT%H").to_string());
    let hour = time.format("%H");

    FILE_SUFFIXES
        .iter()
        .map(|suffix| {
            directory.join(format!(
                "ge{}{:02}.t{}z.pgrb2{}.{}.f000",
                kind, member, hour, suffix, resolution
            ))
        })
        .collect()
}

/// Extractor of requested fields, configured once
/// and used for any number of members.
pub struct FieldExtractor<'a, P: SourceProvider + ?Sized> {
    fields: &'a Fields,
    resolution: &'a str,
    provider: &'a P,
    cell_count: usize,
}

impl<'a, P: SourceProvider + ?Sized> FieldExtractor<'a, P> {
    pub fn new(fields: &'a Fields, resolution: &'a str, provider: &'a P, cell_count: usize) -> Self {
        FieldExtractor {
            fields,
            resolution,
            provider,
            cell_count,
        }
    }

    /// Reads, stacks and normalizes all requested fields of the member.
    ///
    /// Returns an error without reading anything when any of
    /// expected forecast files does not exist.
    pub fn extract(&self, job: &MemberJob) -> Result<FieldMapping, InputError> {
        let raw_fields = self.extract_raw(job)?;
        let fields = raw_fields.normalize(&self.fields.pressure.levels);

        if !job.keep_cache {
            remove_cached_files(&job.member_cache);
        }

        Ok(fields)
    }

    /// Reads requested fields from both forecast times
    /// and stacks them along the time axis.
    pub fn extract_raw(&self, job: &MemberJob) -> Result<RawFields, InputError> {
        let files = self.locate_files(job)?;
        let requests = self.requests();
        let wanted: Vec<FieldSelector> = requests.iter().map(|(_, s)| s.clone()).collect();

        let mut sources = Vec::with_capacity(files.len());

        for (time, paths) in files {
            let mut time_sources = Vec::with_capacity(paths.len());

            for path in &paths {
                debug!("Reading member {} fields from {}", job.member, path.display());
                time_sources.push(self.provider.open(path, &wanted)?);
            }

            sources.push((time, time_sources));
        }

        let mut raw_fields = RawFields::default();

        for (name, selector) in requests {
            let mut rows = vec![];

            for (time, time_sources) in &sources {
                match select_first(time_sources, &selector)? {
                    Some(values) => {
                        if values.len() != self.cell_count {
                            return Err(InputError::GridMismatch {
                                name,
                                expected: self.cell_count,
                                found: values.len(),
                            });
                        }
                        rows.push(values);
                    }
                    None => {
                        debug!("Field {} not found for member {} at {}", selector, job.member, time);
                        raw_fields.missing.push(MissingField {
                            variable: name.clone(),
                            time: *time,
                        });
                    }
                }
            }

            if !rows.is_empty() {
                raw_fields.push(name, stack_rows(&rows)?);
            }
        }

        Ok(raw_fields)
    }

    /// Lists requested variables with their raw names,
    /// surface fields first, then pressure fields by variable and level.
    fn requests(&self) -> Vec<(String, FieldSelector)> {
        let surface = self.fields.surface.iter().map(|request| {
            (
                request.short_name.clone(),
                FieldSelector::surface(&request.short_name, &request.level_type),
            )
        });

        let pressure = &self.fields.pressure;
        let pressure = pressure.short_names.iter().flat_map(|short_name| {
            pressure.levels.iter().map(move |level| {
                (
                    format!("{}_{}", short_name, level),
                    FieldSelector::pressure(short_name, &pressure.level_type, *level),
                )
            })
        });

        surface.chain(pressure).collect()
    }

    /// Checks that every expected forecast file of the member is in the cache.
    fn locate_files(
        &self,
        job: &MemberJob,
    ) -> Result<Vec<(NaiveDateTime, Vec<PathBuf>)>, InputError> {
        let mut files = vec![];

        for time in forecast_times(job.cycle) {
            let paths = member_file_paths(&job.member_cache, job.member, time, self.resolution);

            for path in &paths {
                if let Some(directory) = path.parent() {
                    fs::create_dir_all(directory)?;
                }

                if !path.exists() {
                    return Err(InputError::MissingForecastFile(path.clone()));
                }
            }

            files.push((time, paths));
        }

        Ok(files)
    }
}

/// Takes the field from the first source that provides it.
fn select_first(
    sources: &[Box<dyn FieldSource>],
    selector: &FieldSelector,
) -> Result<Option<Array1<Float>>, InputError> {
    for source in sources {
        if let Some(values) = source.select(selector)? {
            return Ok(Some(values));
        }
    }

    Ok(None)
}

/// Stacks flattened fields along a new leading (time) axis.
fn stack_rows(rows: &[Array1<Float>]) -> Result<Array2<Float>, InputError> {
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    let stacked = ndarray::stack(Axis(0), views.as_slice())?;

    Ok(stacked)
}

/// Removes everything staged in the member cache directory.
///
/// Failures are only logged as the fields are already in memory.
fn remove_cached_files(member_cache: &Path) {
    info!("Removing staged GRIB data from {}", member_cache.display());

    let entries = match fs::read_dir(member_cache) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("Cannot list {}: {}", member_cache.display(), err);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();

        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };

        if let Err(err) = removed {
            warn!("Cannot remove {}: {}", path.display(), err);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        forecast_times, member_file_paths,
        source::{FieldSelector, FieldSource, SourceProvider},
        FieldExtractor,
    };
    use crate::{
        errors::InputError,
        pipeline::{
            configuration::tests::{test_config, test_cycle},
            orchestrator::MemberJob,
        },
        Float,
    };
    use chrono::NaiveDateTime;
    use float_cmp::approx_eq;
    use floccus::constants::G;
    use ndarray::Array1;
    use rustc_hash::FxHashMap;
    use std::{fs, path::Path, sync::Arc};

    pub(crate) const CELLS: usize = 12;

    /// In-memory provider with the same fields in every file,
    /// except selectors dropped for files whose path contains a marker.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryProvider {
        pub fields: Arc<FxHashMap<FieldSelector, Array1<Float>>>,
        pub dropped: Vec<(String, FieldSelector)>,
    }

    struct MemorySource {
        fields: FxHashMap<FieldSelector, Array1<Float>>,
    }

    impl FieldSource for MemorySource {
        fn select(&self, selector: &FieldSelector) -> Result<Option<Array1<Float>>, InputError> {
            Ok(self.fields.get(selector).cloned())
        }
    }

    impl SourceProvider for MemoryProvider {
        fn open(
            &self,
            path: &Path,
            _wanted: &[FieldSelector],
        ) -> Result<Box<dyn FieldSource>, InputError> {
            let path = path.to_string_lossy();
            let mut fields = (*self.fields).clone();

            for (marker, selector) in &self.dropped {
                if path.contains(marker.as_str()) {
                    fields.remove(selector);
                }
            }

            Ok(Box::new(MemorySource { fields }))
        }
    }

    /// Distinct values for each field so that they can be told apart:
    /// `seed + cell / 100`.
    pub(crate) fn field_values(seed: Float) -> Array1<Float> {
        Array1::from_shape_fn(CELLS, |i| seed + i as Float / 100.0)
    }

    /// Provider with all fields of the test configuration.
    pub(crate) fn full_provider() -> MemoryProvider {
        let mut fields = FxHashMap::default();

        fields.insert(FieldSelector::surface("orog", "surface"), field_values(100.0));
        fields.insert(FieldSelector::surface("t", "surface"), field_values(280.0));
        fields.insert(FieldSelector::surface("2sh", "heightAboveGround"), field_values(0.01));
        fields.insert(FieldSelector::pressure("gh", "isobaricInhPa", 850), field_values(1500.0));
        fields.insert(FieldSelector::pressure("gh", "isobaricInhPa", 500), field_values(5500.0));
        fields.insert(FieldSelector::pressure("t", "isobaricInhPa", 850), field_values(270.0));
        fields.insert(FieldSelector::pressure("t", "isobaricInhPa", 500), field_values(250.0));

        MemoryProvider {
            fields: Arc::new(fields),
            dropped: vec![],
        }
    }

    /// Creates empty files where the extractor expects staged GEFS files.
    pub(crate) fn stage_files(member_cache: &Path, member: usize, cycle: NaiveDateTime) {
        for time in forecast_times(cycle) {
            for path in member_file_paths(member_cache, member, time, "0p25") {
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, b"GRIB").unwrap();
            }
        }
    }

    fn test_job(root: &Path, member: usize, keep_cache: bool) -> MemberJob {
        let config = test_config(root);
        MemberJob::new(&config, test_cycle(), member, keep_cache)
    }

    #[test]
    fn file_naming() {
        let time = test_cycle();
        let paths = member_file_paths(Path::new("/cache/mem_0"), 0, time, "0p25");

        assert_eq!(
            paths[0],
            Path::new("/cache/mem_0/20250801T00/gec00.t00z.pgrb2.0p25.f000")
        );
        assert_eq!(
            paths[1],
            Path::new("/cache/mem_0/20250801T00/gec00.t00z.pgrb2s.0p25.f000")
        );

        let prior = forecast_times(time)[0];
        let paths = member_file_paths(Path::new("/cache/mem_7"), 7, prior, "0p25");

        assert_eq!(
            paths[0],
            Path::new("/cache/mem_7/20250731T18/gep07.t18z.pgrb2.0p25.f000")
        );
    }

    #[test]
    fn missing_file_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let provider = full_provider();
        let job = test_job(root.path(), 1, true);

        let extractor = FieldExtractor::new(&config.fields, &config.resolution, &provider, CELLS);
        let result = extractor.extract(&job);

        assert!(matches!(result, Err(InputError::MissingForecastFile(_))));
    }

    #[test]
    fn raw_fields_are_stacked_per_time() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let provider = full_provider();
        let job = test_job(root.path(), 0, true);
        stage_files(&job.member_cache, 0, job.cycle);

        let extractor = FieldExtractor::new(&config.fields, &config.resolution, &provider, CELLS);
        let raw = extractor.extract_raw(&job).unwrap();

        assert!(raw.missing().is_empty());

        let gh = raw.get("gh_500").unwrap();
        assert_eq!(gh.dim(), (2, CELLS));
        assert!(approx_eq!(Float, gh[[0, 3]], 5500.03));
        assert!(approx_eq!(Float, gh[[1, 3]], 5500.03));
        assert!(raw.get("t").is_some());
    }

    #[test]
    fn geopotential_height_is_converted_once() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let provider = full_provider();
        let job = test_job(root.path(), 2, true);
        stage_files(&job.member_cache, 2, job.cycle);

        let extractor = FieldExtractor::new(&config.fields, &config.resolution, &provider, CELLS);
        let fields = extractor.extract(&job).unwrap();

        let z = fields.get("z_500").unwrap();
        assert_eq!(z.dim(), (2, CELLS));

        for (t, row) in z.outer_iter().enumerate() {
            for (cell, value) in row.iter().enumerate() {
                let expected = (5500.0 + cell as Float / 100.0) * 9.80665;
                assert!(
                    approx_eq!(Float, *value, expected, epsilon = 1e-9),
                    "z_500[{}, {}] = {}, expected {}",
                    t,
                    cell,
                    value,
                    expected
                );
            }
        }

        assert!(approx_eq!(Float, G, 9.80665));
        assert!(fields.get("gh_500").is_none());
        assert!(fields.get("gh_850").is_none());
    }

    #[test]
    fn absent_field_is_recorded_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let mut provider = full_provider();
        provider.dropped.push((
            "20250731T18".to_string(),
            FieldSelector::pressure("t", "isobaricInhPa", 850),
        ));
        let job = test_job(root.path(), 3, true);
        stage_files(&job.member_cache, 3, job.cycle);

        let extractor = FieldExtractor::new(&config.fields, &config.resolution, &provider, CELLS);
        let fields = extractor.extract(&job).unwrap();

        assert_eq!(fields.get("t_850").unwrap().dim(), (1, CELLS));
        assert_eq!(fields.missing().len(), 1);
        assert_eq!(fields.missing()[0].variable, "t_850");
        assert_eq!(fields.missing()[0].time, forecast_times(job.cycle)[0]);
    }

    #[test]
    fn grid_mismatch_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let provider = full_provider();
        let job = test_job(root.path(), 0, true);
        stage_files(&job.member_cache, 0, job.cycle);

        let extractor = FieldExtractor::new(&config.fields, &config.resolution, &provider, 5);

        assert!(matches!(
            extractor.extract_raw(&job),
            Err(InputError::GridMismatch { expected: 5, found: CELLS, .. })
        ));
    }

    #[test]
    fn cache_is_removed_unless_kept() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let provider = full_provider();

        let kept = test_job(root.path(), 4, true);
        stage_files(&kept.member_cache, 4, kept.cycle);
        let removed = test_job(root.path(), 5, false);
        stage_files(&removed.member_cache, 5, removed.cycle);

        let extractor = FieldExtractor::new(&config.fields, &config.resolution, &provider, CELLS);
        extractor.extract(&kept).unwrap();
        extractor.extract(&removed).unwrap();

        assert_eq!(fs::read_dir(&kept.member_cache).unwrap().count(), 2);
        assert_eq!(fs::read_dir(&removed.member_cache).unwrap().count(), 0);
    }
}
