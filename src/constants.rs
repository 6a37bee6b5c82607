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

//! Module containing constants used by the preprocessor.

/// Hours between the two forecast times consumed
/// for each initial condition (previous cycle and current cycle).
pub const PRIOR_CYCLE_HOURS: i64 = 6;

/// Filename suffixes distinguishing primary (`pgrb2`)
/// and secondary (`pgrb2s`) GEFS files.
pub const FILE_SUFFIXES: [&str; 2] = ["", "s"];

/// Environment variable with the CPU budget given by the batch scheduler.
pub const CPU_BUDGET_VAR: &str = "SLURM_CPUS_PER_TASK";

/// Worker count used when the CPU budget is not provided.
pub const DEFAULT_WORKERS: u16 = 4;

/// Fields that the inference model treats as time-invariant.
pub const CONSTANT_FIELDS: [&str; 2] = ["lsm", "orog"];
