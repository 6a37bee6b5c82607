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

//! Module responsible for running extraction and container
//! building for every requested member on the threadpool.
//!
//! Each member is an independent unit of work with its own
//! cache directory and output store. Errors and panics of one
//! member are reported as its outcome and never stop other members.
//! The only exception is a missing forecast file, which is reported
//! as a failure of the whole run once all dispatched members finish.

use super::{
    configuration::Config,
    container::Container,
    extractor::{forecast_times, source::SourceProvider, FieldExtractor},
    grid::LatLonGrid,
};
use crate::errors::{InputError, ModelError};
use chrono::NaiveDateTime;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use rayon::ThreadPool;
use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{mpsc, Arc},
};

/// Everything needed to process a single member.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MemberJob {
    pub member: usize,
    pub cycle: NaiveDateTime,
    pub output_path: PathBuf,
    pub member_cache: PathBuf,
    pub keep_cache: bool,
}

impl MemberJob {
    pub fn new(config: &Config, cycle: NaiveDateTime, member: usize, keep_cache: bool) -> Self {
        MemberJob {
            member,
            cycle,
            output_path: output_path(config, cycle, member),
            member_cache: config.paths.cache_dir.join(format!("mem_{}", member)),
            keep_cache,
        }
    }
}

/// Result of processing one member.
#[derive(Debug)]
pub enum MemberOutcome {
    /// Output store already existed, nothing was done.
    Skipped { member: usize, path: PathBuf },
    Succeeded { member: usize },
    Failed { member: usize, message: String },

    /// Expected forecast file was missing, which stops the whole run.
    Halted { member: usize, error: InputError },
}

impl MemberOutcome {
    pub fn member(&self) -> usize {
        match self {
            MemberOutcome::Skipped { member, .. }
            | MemberOutcome::Succeeded { member }
            | MemberOutcome::Failed { member, .. }
            | MemberOutcome::Halted { member, .. } => *member,
        }
    }
}

impl fmt::Display for MemberOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberOutcome::Skipped { path, .. } => write!(f, "Skipped: {} (exists)", path.display()),
            MemberOutcome::Succeeded { member } => {
                write!(f, "Successfully processed member {}", member)
            }
            MemberOutcome::Failed { member, message } => {
                write!(f, "Error processing member {}: {}", member, message)
            }
            MemberOutcome::Halted { member, error } => {
                write!(f, "Error processing member {}: {}", member, error)
            }
        }
    }
}

/// Data shared (read-only) by all member workers.
pub struct MemberContext<P: SourceProvider> {
    pub config: Config,
    pub grid: LatLonGrid,
    pub provider: P,
}

/// Directory with stores of all members for given cycle.
pub fn output_dir(config: &Config, cycle: NaiveDateTime) -> PathBuf {
    config
        .paths
        .data_path
        .join(&config.resolution)
        .join(cycle_stamp(cycle))
}

pub fn output_path(config: &Config, cycle: NaiveDateTime, member: usize) -> PathBuf {
    output_dir(config, cycle).join(format!(
        "gefs_en_data_{}_{}_M{}.zarr",
        config.resolution,
        cycle_stamp(cycle),
        member
    ))
}

/// Cycle formatted as used in output names, e.g. `2025-08-01T00`.
pub fn cycle_stamp(cycle: NaiveDateTime) -> String {
    cycle.format("%Y-%m-%dT%H").to_string()
}

/// Deploys all jobs on the threadpool and collects their outcomes
/// in the order of completion.
///
/// Returns an error only when a forecast file was missing for
/// any member or when a worker disappeared without reporting.
pub fn run_members<P: SourceProvider + 'static>(
    threadpool: &ThreadPool,
    jobs: Vec<MemberJob>,
    context: Arc<MemberContext<P>>,
) -> Result<Vec<MemberOutcome>, ModelError> {
    let jobs_count = jobs.len();

    let bar = members_bar(jobs_count as u64);

    let (tx, rx) = mpsc::channel();

    for job in jobs {
        let tx = tx.clone();
        let context = Arc::clone(&context);

        threadpool.spawn(move || {
            // receiver lives until all results are collected
            let _ = tx.send(process_member(&job, &context));
        });
    }

    let mut outcomes = Vec::with_capacity(jobs_count);

    for _ in 0..jobs_count {
        let outcome = rx.recv()?;

        bar.println(outcome.to_string());
        bar.inc(1);

        outcomes.push(outcome);
    }

    bar.finish_with_message("All members finished");

    if let Some(position) = outcomes
        .iter()
        .position(|o| matches!(o, MemberOutcome::Halted { .. }))
    {
        if let MemberOutcome::Halted { error, .. } = outcomes.swap_remove(position) {
            return Err(ModelError::Input(error));
        }
    }

    Ok(outcomes)
}

/// Progress bar of processed members.
///
/// Drawn to stdout, so outcome lines printed through it
/// land in the same stream as the rest of the run output.
fn members_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(len, ProgressDrawTarget::stdout());
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
            .progress_chars("#>-"),
    );
    bar.set_prefix("Processed members");

    bar
}

/// Processes one member unless its output already exists.
pub fn process_member<P: SourceProvider>(
    job: &MemberJob,
    context: &MemberContext<P>,
) -> MemberOutcome {
    let member = job.member;

    if job.output_path.exists() {
        return MemberOutcome::Skipped {
            member,
            path: job.output_path.clone(),
        };
    }

    debug!("Processing member {}", member);

    match catch_unwind(AssertUnwindSafe(|| build_member(job, context))) {
        Ok(Ok(())) => MemberOutcome::Succeeded { member },
        Ok(Err(ModelError::Input(error @ InputError::MissingForecastFile(_)))) => {
            MemberOutcome::Halted { member, error }
        }
        Ok(Err(err)) => MemberOutcome::Failed {
            member,
            message: err.to_string(),
        },
        Err(payload) => MemberOutcome::Failed {
            member,
            message: panic_message(payload.as_ref()),
        },
    }
}

fn build_member<P: SourceProvider>(
    job: &MemberJob,
    context: &MemberContext<P>,
) -> Result<(), ModelError> {
    let config = &context.config;

    let extractor = FieldExtractor::new(
        &config.fields,
        &config.resolution,
        &context.provider,
        context.grid.cell_count(),
    );

    let fields = extractor.extract(job)?;
    let container = Container::assemble(&fields, forecast_times(job.cycle), &context.grid)?;

    debug!("Writing member {} store to {}", job.member, job.output_path.display());
    container.save(&job.output_path, &config.resolution)?;

    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("worker panicked: {}", message);
    }

    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("worker panicked: {}", message);
    }

    "worker panicked".to_string()
}
