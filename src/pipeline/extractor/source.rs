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

//! Sub-module responsible for reading
//! requested messages from GRIB files.

use crate::{errors::InputError, Float};
use eccodes::{
    codes_handle::{
        CodesHandle,
        KeyType::{FloatArray, Int, Str},
        KeyedMessage,
        ProductKind::GRIB,
    },
    FallibleIterator,
};
use log::debug;
use ndarray::Array1;
use rustc_hash::FxHashSet;
use std::{fmt, path::Path};

/// Keys identifying a single GRIB message.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FieldSelector {
    pub short_name: String,
    pub level_type: String,

    /// Level value, only checked for pressure level fields.
    pub level: Option<i64>,
}

impl FieldSelector {
    pub fn surface(short_name: &str, level_type: &str) -> Self {
        FieldSelector {
            short_name: short_name.to_string(),
            level_type: level_type.to_string(),
            level: None,
        }
    }

    pub fn pressure(short_name: &str, level_type: &str, level: i64) -> Self {
        FieldSelector {
            short_name: short_name.to_string(),
            level_type: level_type.to_string(),
            level: Some(level),
        }
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Some(level) => write!(f, "{}@{}={}", self.short_name, self.level_type, level),
            None => write!(f, "{}@{}", self.short_name, self.level_type),
        }
    }
}

/// Source of fields from a single forecast file.
pub trait FieldSource {
    /// Returns values of the first field matching the selector,
    /// flattened in grid order, or `None` when the file does not
    /// contain such field.
    fn select(&self, selector: &FieldSelector) -> Result<Option<Array1<Float>>, InputError>;
}

/// Opens forecast files as [`FieldSource`]s.
///
/// `wanted` lists every selector that will be requested
/// from the file so providers can skip unrelated data.
pub trait SourceProvider: Send + Sync {
    fn open(
        &self,
        path: &Path,
        wanted: &[FieldSelector],
    ) -> Result<Box<dyn FieldSource>, InputError>;
}

/// Provider reading GRIB files with ecCodes.
#[derive(Copy, Clone, Debug, Default)]
pub struct GribProvider;

impl SourceProvider for GribProvider {
    fn open(
        &self,
        path: &Path,
        wanted: &[FieldSelector],
    ) -> Result<Box<dyn FieldSource>, InputError> {
        let short_names: FxHashSet<&str> = wanted.iter().map(|s| s.short_name.as_str()).collect();
        let level_types: FxHashSet<&str> = wanted.iter().map(|s| s.level_type.as_str()).collect();

        let handle = CodesHandle::new_from_file(path, GRIB)?;

        let messages: Vec<KeyedMessage> = handle
            .filter(|msg| {
                let short_name = msg.read_key("shortName")?.value;
                let level_type = msg.read_key("typeOfLevel")?.value;

                Ok(match (short_name, level_type) {
                    (Str(short_name), Str(level_type)) => {
                        short_names.contains(short_name.as_str())
                            && level_types.contains(level_type.as_str())
                    }
                    _ => false,
                })
            })
            .collect()?;

        debug!(
            "Collected {} candidate messages from {}",
            messages.len(),
            path.display()
        );

        Ok(Box::new(GribSource { messages }))
    }
}

/// Messages collected from one GRIB file.
struct GribSource {
    messages: Vec<KeyedMessage>,
}

impl FieldSource for GribSource {
    fn select(&self, selector: &FieldSelector) -> Result<Option<Array1<Float>>, InputError> {
        for msg in &self.messages {
            if !matches_selector(msg, selector)? {
                continue;
            }

            let values = if let FloatArray(v) = msg.read_key("values")?.value {
                v
            } else {
                return Err(InputError::IncorrectKeyType("values"));
            };

            // values are already stored row-by-row (north to south, west to east)
            // which is exactly the cell order of the grid
            let values = Array1::from_vec(values).mapv(|v| v as Float);

            return Ok(Some(values));
        }

        Ok(None)
    }
}

fn matches_selector(msg: &KeyedMessage, selector: &FieldSelector) -> Result<bool, InputError> {
    if msg.read_key("shortName")?.value != Str(selector.short_name.clone())
        || msg.read_key("typeOfLevel")?.value != Str(selector.level_type.clone())
    {
        return Ok(false);
    }

    if let Some(level) = selector.level {
        let msg_level = if let Int(id) = msg.read_key("level")?.value {
            id
        } else {
            return Err(InputError::IncorrectKeyType("level"));
        };

        return Ok(msg_level == level);
    }

    Ok(true)
}
