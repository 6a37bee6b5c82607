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

//! GEFS Ensemble Initial Conditions (GEFS-ICS) prepares initial
//! conditions for machine-learning ensemble forecasts from
//! the NOAA Global Ensemble Forecast System.
//!
//! For every ensemble member, fields from two consecutive GEFS cycles
//! are extracted from staged GRIB files, converted to the variables
//! expected by the inference model and written as a Zarr store.
//! Inference job cards for the prepared members can then be generated
//! with the `jobs` subcommand.

mod constants;
mod errors;
mod jobs;
mod pipeline;

use cap::Cap;
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info};
use std::{alloc, path::PathBuf, process};

type Float = f64;

/// Global allocator used by the preprocessor.
///
/// Use of static global allocator allows for capping the memory to the limit set by user
/// in configuration file and in effect provide better [OOM error](https://en.wikipedia.org/wiki/Out_of_memory) handling.
#[global_allocator]
static ALLOCATOR: Cap<alloc::System> = Cap::new(alloc::System, usize::MAX);

#[derive(Parser)]
#[command(name = "gefs-ics")]
#[command(about = "Prepare GEFS ensemble initial conditions for ML inference", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract fields of ensemble members and write Zarr stores
    Prepare {
        /// Forecast cycle as YYYYMMDD_HH
        #[arg(short, long)]
        pdate: String,

        /// Number of ensemble members to process
        #[arg(short, long)]
        nmember: usize,

        /// Keep staged GRIB files after extraction
        #[arg(short, long, value_enum, default_value_t = Keep::No)]
        keep: Keep,
    },

    /// Write inference job cards for members without predictions
    Jobs {
        /// Forecast cycle as YYYYMMDD_HH
        #[arg(short, long)]
        pdate: String,

        /// Number of ensemble members
        #[arg(short, long, default_value_t = 31)]
        nmember: usize,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum Keep {
    Yes,
    No,
}

/// The main program function.
/// Prepares the runtime environment and calls the requested subcommand.
///
/// To provide meaningful and high-quality error messages the `env_logger`
/// needs to be initiated before any log messages are possible to occur.
/// A run failure (eg. a missing forecast file) exits with status 1, failures
/// of single members are only reported in their outcome lines.
fn main() {
    #[cfg(not(feature = "debug"))]
    let logger_env = Env::new().filter_or("GEFS_ICS_LOG_LEVEL", "info");

    #[cfg(feature = "debug")]
    let logger_env = Env::new().filter_or("GEFS_ICS_LOG_LEVEL", "debug");

    env_logger::Builder::from_env(logger_env)
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Prepare {
            pdate,
            nmember,
            keep,
        } => pipeline::main(&cli.config, &pdate, nmember, keep == Keep::Yes),
        Commands::Jobs { pdate, nmember } => jobs::main(&cli.config, &pdate, nmember),
    };

    match result {
        Ok(_) => info!("Execution finished. Check the output directory and log."),
        Err(err) => {
            error!("Execution failed with error: {}", err);
            process::exit(1);
        }
    }
}
