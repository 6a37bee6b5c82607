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

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Error while reading config.yaml: {0}")]
    Config(#[from] ConfigError),

    #[error("Error while creating ThreadPool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Error while extracting fields: {0}")]
    Input(#[from] InputError),

    #[error("Error while building container: {0}")]
    Container(#[from] ContainerError),

    #[error("Error while generating inference jobs: {0}")]
    Jobs(#[from] JobError),

    #[error("Error while handling output directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot set memory limit to {0} MB")]
    MemoryLimit(usize),

    #[error("Member worker stopped before reporting its result: {0}")]
    WorkerLost(#[from] std::sync::mpsc::RecvError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot open config.yaml: {0}")]
    CantOpenFile(#[from] std::io::Error),

    #[error("Cannot deserialize config.yaml: {0}")]
    CantDeserialize(#[from] serde_yaml::Error),

    #[error("Configuration component is out of bounds {0}")]
    OutOfBounds(&'static str),

    #[error("Cannot parse forecast cycle, expected YYYYMMDD_HH: {0}")]
    InvalidCycle(#[from] chrono::ParseError),
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Forecast file not found: {}", .0.display())]
    MissingForecastFile(PathBuf),

    #[error("Cannot prepare cache directory: {0}")]
    CacheDir(#[from] std::io::Error),

    #[error("Error while handling GRIB file: {0}")]
    GribHandling(#[from] eccodes::errors::CodesError),

    #[error("GRIB key {0} has incorrect type")]
    IncorrectKeyType(&'static str),

    #[error("Field {name} has {found} values but the grid has {expected} cells")]
    GridMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Cannot stack field values: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Required fields are missing: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("There are no fields to store")]
    EmptyMapping,

    #[error("Variable {variable} has shape {found:?}, expected {expected:?}")]
    InvalidShape {
        variable: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Coordinate {0} does not match the cell count")]
    CoordinateMismatch(&'static str),

    #[error("Cannot stack variables: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Cannot prepare store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot create store: {0}")]
    StoreCreate(#[from] zarrs::filesystem::FilesystemStoreCreateError),

    #[error("Cannot create group: {0}")]
    GroupCreate(#[from] zarrs::group::GroupCreateError),

    #[error("Cannot create array: {0}")]
    ArrayCreate(#[from] zarrs::array::ArrayCreateError),

    #[error("Cannot write array: {0}")]
    Array(#[from] zarrs::array::ArrayError),

    #[error("Cannot write metadata: {0}")]
    Storage(#[from] zarrs::storage::StorageError),

    #[error("Cannot configure compression: {0}")]
    Compression(String),

    #[error("Cannot serialize attributes: {0}")]
    Attributes(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Cannot write job file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot serialize inference config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
