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

//! Module generating inference job cards and configs
//! for members prepared by the preprocessor.
//!
//! For each member without a prediction file a batch job card
//! and an inference YAML config are written into the jobs directory.
//! Jobs are not submitted, the printed job card paths can be passed
//! directly to the scheduler.

use crate::{
    constants::CONSTANT_FIELDS,
    errors::{JobError, ModelError},
    pipeline::{
        configuration::{parse_cycle, Config},
        orchestrator::{cycle_stamp, output_path},
    },
};
use chrono::NaiveDateTime;
use log::{debug, info};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Inference config in the layout read by `anemoi-inference`.
#[derive(Clone, PartialEq, Debug, Serialize)]
struct InferenceConfig {
    checkpoint: PathBuf,
    lead_time: u32,
    date: String,
    input: InputSection,
    output: OutputSection,
    write_initial_state: bool,
    patch_metadata: PatchMetadata,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
struct InputSection {
    dataset: PathBuf,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
struct OutputSection {
    netcdf: NetcdfOutput,
}

/// NetCDF output given as a bare path, or as a path with
/// the list of written variables.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(untagged)]
enum NetcdfOutput {
    Path(PathBuf),
    Variables { path: PathBuf, variables: Vec<String> },
}

#[derive(Clone, PartialEq, Debug, Serialize)]
struct PatchMetadata {
    dataset: DatasetPatch,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
struct DatasetPatch {
    constant_fields: Vec<String>,
}

/// Writes job files for members `0..nmember` of the cycle given as `YYYYMMDD_HH`.
pub fn main(config_path: &Path, pdate: &str, nmember: usize) -> Result<(), ModelError> {
    debug!("Reading configuration from {}", config_path.display());
    let config = Config::new_from_file(config_path)?;
    let cycle = parse_cycle(pdate)?;

    info!("Generating inference jobs for {} members", nmember);

    let written = write_jobs(&config, cycle, nmember)?;

    for job_card in &written {
        println!("{}", job_card.display());
    }

    info!(
        "Written {} job cards to {}",
        written.len(),
        config.paths.job_path.display()
    );

    Ok(())
}

/// Writes job files of all members without predictions
/// and returns paths of written job cards.
fn write_jobs(config: &Config, cycle: NaiveDateTime, nmember: usize) -> Result<Vec<PathBuf>, JobError> {
    fs::create_dir_all(&config.paths.job_path)?;
    fs::create_dir_all(config.paths.pred_path.join(cycle_stamp(cycle)))?;

    let mut written = vec![];

    for member in 0..nmember {
        let prediction = prediction_path(config, cycle, member);

        if prediction.exists() {
            debug!("Prediction {} exists, skipping member {}", prediction.display(), member);
            continue;
        }

        written.push(write_member_job(config, cycle, member, prediction)?);
    }

    Ok(written)
}

/// Path of the NetCDF file produced by inference of the member.
fn prediction_path(config: &Config, cycle: NaiveDateTime, member: usize) -> PathBuf {
    let stamp = cycle_stamp(cycle);

    config.paths.pred_path.join(&stamp).join(format!(
        "ai_gefs_en_{}_{}h_M{}.nc",
        stamp, config.inference.lead_time, member
    ))
}

fn write_member_job(
    config: &Config,
    cycle: NaiveDateTime,
    member: usize,
    prediction: PathBuf,
) -> Result<PathBuf, JobError> {
    let stamp = cycle_stamp(cycle);
    let job_path = &config.paths.job_path;

    let config_path = job_path.join(format!("inference_config_{}_M{}.yaml", stamp, member));
    let card_path = job_path.join(format!("submit_inference_{}_M{}.sh", stamp, member));

    let netcdf = match &config.inference.output_variables {
        Some(variables) => NetcdfOutput::Variables {
            path: prediction,
            variables: variables.clone(),
        },
        None => NetcdfOutput::Path(prediction),
    };

    let inference_config = InferenceConfig {
        checkpoint: config.inference.checkpoint.clone(),
        lead_time: config.inference.lead_time,
        date: stamp.clone(),
        input: InputSection {
            dataset: output_path(config, cycle, member),
        },
        output: OutputSection { netcdf },
        write_initial_state: true,
        patch_metadata: PatchMetadata {
            dataset: DatasetPatch {
                constant_fields: CONSTANT_FIELDS.iter().map(|f| (*f).to_string()).collect(),
            },
        },
    };

    fs::write(&config_path, serde_yaml::to_string(&inference_config)?)?;
    fs::write(&card_path, job_card(config, &stamp, member, &config_path))?;

    Ok(card_path)
}

fn job_card(config: &Config, stamp: &str, member: usize, inference_config: &Path) -> String {
    let jobs = &config.jobs;
    let log_dir = jobs.log_dir.display();

    let mut card = format!(
        "#!/bin/bash
#SBATCH -A {account}
#SBATCH -J inf_gefs_{stamp}_M{member}
#SBATCH -o {log_dir}/inf_gefs_{stamp}_M{member}.out
#SBATCH -e {log_dir}/inf_gefs_{stamp}_M{member}.err
#SBATCH --nodes=1
#SBATCH -t {walltime}
#SBATCH --partition={partition}
#SBATCH --qos={qos}
#SBATCH --gpus-per-node={gpus}
#SBATCH --mem={memory}
#SBATCH --ntasks-per-node=1

",
        account = jobs.account,
        walltime = jobs.walltime,
        partition = jobs.partition,
        qos = jobs.qos,
        gpus = jobs.gpus_per_node,
        memory = jobs.memory,
    );

    for line in &jobs.environment {
        card.push_str(line);
        card.push('\n');
    }

    card.push_str(&format!("\n{} {}\n", jobs.launcher, inference_config.display()));

    card
}
