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

//! Module responsible for parsing and checking the configuration file.
//!
//! The configuration file uses [YAML](https://en.wikipedia.org/wiki/YAML)
//! and `serde` to enforce strong typing and automatic type checking.
//!
//! The structures and their fields in this module directly correspond to
//! the fields inside `config.yaml` so you can check this documentation
//! for more details how to set the config file.

use crate::constants::{CPU_BUDGET_VAR, DEFAULT_WORKERS};
use crate::errors::ConfigError;
use crate::Float;
use chrono::NaiveDateTime;
use float_cmp::approx_eq;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Directories read and written by the preprocessor.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Paths {
    /// Root directory for initial condition stores.
    /// Stores are written into `<data_path>/<resolution>/<cycle>/`.
    pub data_path: PathBuf,

    /// Root directory with GEFS files staged for each member
    /// in `<cache_dir>/mem_<member>/`.
    pub cache_dir: PathBuf,

    /// Root directory of inference predictions.
    pub pred_path: PathBuf,

    /// Directory where job cards and inference configs are written.
    pub job_path: PathBuf,
}

/// _(Optional)_ Regular latitude-longitude grid of the input files.
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug, Deserialize)]
pub struct Grid {
    /// Grid spacing in degrees, the same along both axes.
    ///
    /// Must divide 180 evenly. Defaults to `0.25`.
    #[serde(default = "Grid::default_spacing")]
    pub spacing: Float,
}

impl Grid {
    fn default_spacing() -> Float {
        0.25
    }

    /// Checks if the spacing produces a closed global grid.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if !self.spacing.is_finite() || self.spacing <= 0.0 || self.spacing > 90.0 {
            return Err(ConfigError::OutOfBounds(
                "Grid spacing must be in range (0, 90] degrees",
            ));
        }

        let lat_steps = 180.0 / self.spacing;

        if !approx_eq!(Float, lat_steps, lat_steps.round(), epsilon = 1e-9) {
            return Err(ConfigError::OutOfBounds(
                "Grid spacing must divide 180 degrees evenly",
            ));
        }

        Ok(())
    }
}

impl Default for Grid {
    fn default() -> Self {
        Grid {
            spacing: Grid::default_spacing(),
        }
    }
}

/// Request for a single field on a surface-type level.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct SurfaceRequest {
    /// GRIB `shortName` of the variable.
    pub short_name: String,

    /// GRIB `typeOfLevel` of the variable.
    pub level_type: String,
}

/// Request for a set of variables on pressure levels.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct PressureRequest {
    /// GRIB `shortName`s of requested variables.
    pub short_names: Vec<String>,

    /// GRIB `typeOfLevel` shared by all variables.
    pub level_type: String,

    /// Pressure levels (in hPa) read for each variable.
    ///
    /// Levels must be unique and positive.
    pub levels: Vec<i64>,
}

/// _(Optional)_ Fields extracted for every member.
///
/// Defaults to the set of variables expected by the
/// ensemble inference model.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Fields {
    #[serde(default = "Fields::default_surface")]
    pub surface: Vec<SurfaceRequest>,

    #[serde(default = "Fields::default_pressure")]
    pub pressure: PressureRequest,
}

impl Fields {
    fn default_surface() -> Vec<SurfaceRequest> {
        [
            ("10u", "heightAboveGround"),
            ("10v", "heightAboveGround"),
            ("2d", "heightAboveGround"),
            ("2t", "heightAboveGround"),
            ("sp", "surface"),
            ("orog", "surface"),
            ("msl", "meanSea"),
            ("lsm", "surface"),
            ("t", "surface"),
            ("2sh", "heightAboveGround"),
        ]
        .iter()
        .map(|(short_name, level_type)| SurfaceRequest {
            short_name: (*short_name).to_string(),
            level_type: (*level_type).to_string(),
        })
        .collect()
    }

    fn default_pressure() -> PressureRequest {
        PressureRequest {
            short_names: ["gh", "t", "u", "v", "w", "q"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            level_type: "isobaricInhPa".to_string(),
            levels: vec![1000, 925, 850, 700, 600, 500, 400, 300, 250, 200, 150, 100, 50],
        }
    }

    /// Checks if requests are not empty and levels are valid.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.surface.is_empty() && self.pressure.short_names.is_empty() {
            return Err(ConfigError::OutOfBounds(
                "At least one field must be requested",
            ));
        }

        if !self.pressure.short_names.is_empty() && self.pressure.levels.is_empty() {
            return Err(ConfigError::OutOfBounds(
                "Pressure variables are requested without pressure levels",
            ));
        }

        if self.pressure.levels.iter().any(|l| *l <= 0) {
            return Err(ConfigError::OutOfBounds(
                "Pressure levels must be positive",
            ));
        }

        let unique_levels: FxHashSet<i64> = self.pressure.levels.iter().copied().collect();

        if unique_levels.len() != self.pressure.levels.len() {
            return Err(ConfigError::OutOfBounds("Pressure levels must be unique"));
        }

        Ok(())
    }
}

impl Default for Fields {
    fn default() -> Self {
        Fields {
            surface: Fields::default_surface(),
            pressure: Fields::default_pressure(),
        }
    }
}

/// _(Optional)_ Fields with information about
/// resources available for the preprocessor.
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize)]
pub struct Resources {
    /// _(Optional)_ Number of members processed concurrently.
    ///
    /// Cannot be less than `1`. Defaults to the value of
    /// `SLURM_CPUS_PER_TASK` or `4` when it is not set.
    #[serde(default = "Resources::default_threads")]
    pub threads: u16,

    /// _(Optional)_ Heap memory limit in MB.
    ///
    /// A full 0.25 degree member holds close to a gigabyte of
    /// fields in memory, so the limit should be set with the
    /// thread count in mind. With capped memory the allocator
    /// aborts with an OOM message instead of the process being
    /// silently killed by the system.
    ///
    /// Cannot be less than `128`. Defaults to whole addressable-space.
    #[serde(default = "Resources::default_memory")]
    pub memory: usize,
}

impl Resources {
    fn default_threads() -> u16 {
        env::var(CPU_BUDGET_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_WORKERS)
    }

    fn default_memory() -> usize {
        usize::MAX / (1024 * 1024)
    }

    /// Checks if thread count and memory limit are
    /// above limits.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.threads < 1 {
            return Err(ConfigError::OutOfBounds(
                "Available threads cannot be less than 1",
            ));
        }

        if self.memory < 128 {
            return Err(ConfigError::OutOfBounds(
                "Available memory cannot be less than 128 MB",
            ));
        }

        Ok(())
    }
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            threads: Resources::default_threads(),
            memory: Resources::default_memory(),
        }
    }
}

/// Settings of the inference run that consumes the stores.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Inference {
    /// Forecast length in hours.
    pub lead_time: u32,

    /// Path to the model checkpoint.
    pub checkpoint: PathBuf,

    /// _(Optional)_ Variables written to the NetCDF output.
    /// All variables are written when not set.
    #[serde(default)]
    pub output_variables: Option<Vec<String>>,
}

/// _(Optional)_ Batch scheduler settings used in job cards.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
#[serde(default)]
pub struct Jobs {
    pub account: String,
    pub partition: String,
    pub qos: String,
    pub walltime: String,
    pub memory: String,
    pub gpus_per_node: u16,
    pub log_dir: PathBuf,

    /// Shell lines preparing the inference environment.
    pub environment: Vec<String>,

    /// Command launching the inference with the config path appended.
    pub launcher: String,
}

impl Default for Jobs {
    fn default() -> Self {
        Jobs {
            account: "enter_your_account".to_string(),
            partition: "u1-h100".to_string(),
            qos: "gpu".to_string(),
            walltime: "00:05:00".to_string(),
            memory: "256G".to_string(),
            gpus_per_node: 1,
            log_dir: PathBuf::from("logs"),
            environment: vec![
                "source /pathtoconda/miniconda/etc/profile.d/conda.sh".to_string(),
                "conda activate anemoi".to_string(),
            ],
            launcher: "srun anemoi-inference run".to_string(),
        }
    }
}

/// Main config structure representing the fields in
/// configuration file.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Config {
    pub paths: Paths,

    /// _(Optional)_ Resolution tag used in file names. Defaults to `0p25`.
    #[serde(default = "Config::default_resolution")]
    pub resolution: String,

    #[serde(default)]
    pub grid: Grid,

    #[serde(default)]
    pub fields: Fields,

    #[serde(default)]
    pub resources: Resources,

    pub inference: Inference,

    #[serde(default)]
    pub jobs: Jobs,
}

impl Config {
    /// Config structure constructor, responsible for
    /// deserializing configuration and checking it.
    pub fn new_from_file(file_path: &Path) -> Result<Config, ConfigError> {
        let data = fs::read(file_path)?;
        Config::new_from_slice(data.as_slice())
    }

    fn new_from_slice(data: &[u8]) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_slice(data)?;

        if config.resolution.is_empty() {
            return Err(ConfigError::OutOfBounds("Resolution tag cannot be empty"));
        }

        config.grid.check_bounds()?;
        config.fields.check_bounds()?;
        config.resources.check_bounds()?;

        Ok(config)
    }

    fn default_resolution() -> String {
        "0p25".to_string()
    }
}

/// Parses the forecast cycle given as `YYYYMMDD_HH`.
pub fn parse_cycle(cycle: &str) -> Result<NaiveDateTime, ConfigError> {
    let cycle = NaiveDateTime::parse_from_str(&format!("{}00", cycle.trim()), "%Y%m%d_%H%M")?;
    Ok(cycle)
}
