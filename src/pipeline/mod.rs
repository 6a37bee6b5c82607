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

//! Module containing the initial conditions preprocessor.
//!
//! For a given forecast cycle every ensemble member goes through
//! the same steps, executed on the threadpool:
//!
//! 1. GEFS fields staged in the member cache are read for the
//!    previous and current cycle ([`extractor`]),
//! 2. geopotential height and orography are converted to geopotential
//!    and surface fields are renamed to the names used by the model,
//! 3. fields are stacked into a `(time, variable, ensemble, cell)` array
//!    with per-variable statistics and written as a Zarr store ([`container`]).
//!
//! Members whose store already exists are skipped, so the preprocessor
//! can be safely rerun after a partial failure.

pub mod configuration;
mod container;
mod extractor;
mod grid;
pub mod orchestrator;

use crate::{errors::ModelError, ALLOCATOR};
use configuration::{parse_cycle, Config};
use extractor::source::GribProvider;
use grid::LatLonGrid;
use log::{debug, info};
use orchestrator::{output_dir, run_members, MemberContext, MemberJob, MemberOutcome};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{fs, path::Path, sync::Arc};

/// Main preprocessor function, prepares stores for members
/// `0..nmember` of the cycle given as `YYYYMMDD_HH`.
pub fn main(
    config_path: &Path,
    pdate: &str,
    nmember: usize,
    keep_cache: bool,
) -> Result<(), ModelError> {
    info!("Preparing the preprocessor core");

    let cycle = parse_cycle(pdate)?;
    let Core { config, threadpool } = Core::new(config_path)?;

    let out_dir = output_dir(&config, cycle);
    debug!("Creating output directory {}", out_dir.display());
    fs::create_dir_all(&out_dir)?;

    let jobs: Vec<MemberJob> = (0..nmember)
        .map(|member| MemberJob::new(&config, cycle, member, keep_cache))
        .collect();

    let context = Arc::new(MemberContext {
        grid: LatLonGrid::regular(config.grid.spacing),
        config,
        provider: GribProvider,
    });

    info!("Deploying {} members of cycle {}", nmember, cycle);

    let outcomes = run_members(&threadpool, jobs, context)?;

    let failed: Vec<usize> = outcomes
        .iter()
        .filter(|o| matches!(o, MemberOutcome::Failed { .. }))
        .map(|o| o.member())
        .collect();

    debug!("Members reported as failed: {:?}", failed);

    info!("Stores written to {}", out_dir.display());

    Ok(())
}

/// Structure containing the configuration and the threadpool
/// on which members are processed.
#[derive(Debug)]
pub struct Core {
    pub config: Config,
    pub threadpool: ThreadPool,
}

impl Core {
    /// Reads and checks the configuration, then applies
    /// the resource limits from it.
    pub fn new(config_path: &Path) -> Result<Self, ModelError> {
        debug!("Reading configuration from {}", config_path.display());
        let config = Config::new_from_file(config_path)?;

        debug!("Setting memory limit");
        ALLOCATOR
            .set_limit(config.resources.memory.saturating_mul(1024 * 1024))
            .map_err(|_| ModelError::MemoryLimit(config.resources.memory))?;

        debug!("Setting up ThreadPool");
        let threadpool = ThreadPoolBuilder::new()
            .num_threads(config.resources.threads as usize)
            .build()?;

        Ok(Core { config, threadpool })
    }
}
