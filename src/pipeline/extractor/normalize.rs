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

//! Sub-module converting raw GRIB fields into
//! names and units expected by the inference model.

use super::{MissingField, RawFields};
use crate::Float;
use floccus::constants::G;
use ndarray::Array2;

/// Renames of surface fields (GRIB name, model name).
const RENAMES: [(&str, &str); 2] = [("t", "skt"), ("2sh", "sh2")];

/// Fields in model names and units, in the order
/// they will be stacked in the container.
///
/// Can only be obtained from [`RawFields::normalize`].
#[derive(Clone, PartialEq, Debug, Default)]
pub struct FieldMapping {
    entries: Vec<(String, Array2<Float>)>,
    missing: Vec<MissingField>,
}

impl FieldMapping {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&Array2<Float>> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array2<Float>)> {
        self.entries.iter().map(|(name, values)| (name.as_str(), values))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Requested fields that were not found, in model names.
    pub fn missing(&self) -> &[MissingField] {
        &self.missing
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<(String, Array2<Float>)>) -> Self {
        FieldMapping {
            entries,
            missing: vec![],
        }
    }
}

impl RawFields {
    /// Converts geopotential height on pressure `levels` and orography
    /// into geopotential and applies the surface renames.
    ///
    /// Geopotential fields `z_<level>` are moved to the end, in the order of `levels`.
    pub fn normalize(self, levels: &[i64]) -> FieldMapping {
        let mut entries = Vec::with_capacity(self.entries.len());
        let mut heights = vec![];

        for (name, values) in self.entries {
            if levels.iter().any(|l| name == height_name(*l)) {
                heights.push((name, values));
                continue;
            }

            if name == "orog" {
                entries.push((name, values * G));
                continue;
            }

            entries.push((rename(&name), values));
        }

        for level in levels {
            if let Some(position) = heights.iter().position(|(n, _)| *n == height_name(*level)) {
                let (_, values) = heights.swap_remove(position);
                entries.push((format!("z_{}", level), values * G));
            }
        }

        let missing = self
            .missing
            .into_iter()
            .map(|field| MissingField {
                variable: normalized_name(&field.variable, levels),
                time: field.time,
            })
            .collect();

        FieldMapping { entries, missing }
    }
}

fn height_name(level: i64) -> String {
    format!("gh_{}", level)
}

fn rename(name: &str) -> String {
    RENAMES
        .iter()
        .find(|(from, _)| *from == name)
        .map_or_else(|| name.to_string(), |(_, to)| (*to).to_string())
}

fn normalized_name(name: &str, levels: &[i64]) -> String {
    match levels.iter().find(|l| name == height_name(**l)) {
        Some(level) => format!("z_{}", level),
        None => rename(name),
    }
}
