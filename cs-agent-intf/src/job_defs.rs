// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use cs_util::*;

pub const THREADS_PLACEHOLDER: &str = "__THREADS__";

const JOB_DEFS_DOC: &str = "\
//
// cs-agent batch job definitions
//
// Jobs are queued per tier and the queues are served in ascending tier
// order. Within a tier, jobs run one at a time in the listed order.
//
//  jobs[].name: Unique job name, also the container name [a-zA-Z0-9_.-]
//  jobs[].image: Container image
//  jobs[].args[]: Command arguments, __THREADS__ is replaced with threads
//  jobs[].threads: Number of threads the job is started with [1..]
//  jobs[].tier: Priority tier, 0 is the highest
//
";

lazy_static! {
    static ref JOB_NAME_RE: Regex = Regex::new("^[a-zA-Z0-9_.-]+$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub threads: usize,
    pub tier: u32,
}

impl JobSpec {
    fn parsec(name: &str, threads: usize, tier: u32) -> Self {
        let (suite, image) = match name {
            "radix" => ("splash2x", format!("anakli/cca:splash2x_{}", name)),
            _ => ("parsec", format!("anakli/cca:parsec_{}", name)),
        };
        Self {
            name: name.into(),
            image,
            args: vec![
                "./run".into(),
                "-a".into(),
                "run".into(),
                "-S".into(),
                suite.into(),
                "-p".into(),
                name.into(),
                "-i".into(),
                "native".into(),
                "-n".into(),
                THREADS_PLACEHOLDER.into(),
            ],
            threads,
            tier,
        }
    }

    /// Command arguments with the thread placeholder filled in.
    pub fn command(&self, threads: usize) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(THREADS_PLACEHOLDER, &format!("{}", threads)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !JOB_NAME_RE.is_match(&self.name) {
            bail!("job name {:?} contains invalid characters", &self.name);
        }
        if self.image.trim().is_empty() {
            bail!("job {:?} has no image", &self.name);
        }
        if self.threads == 0 {
            bail!("job {:?} has zero threads", &self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefs {
    pub jobs: Vec<JobSpec>,
}

impl Default for JobDefs {
    fn default() -> Self {
        Self {
            jobs: vec![
                JobSpec::parsec("freqmine", 2, 0),
                JobSpec::parsec("blackscholes", 2, 0),
                JobSpec::parsec("ferret", 1, 1),
                JobSpec::parsec("canneal", 1, 1),
                JobSpec::parsec("dedup", 1, 2),
                JobSpec::parsec("radix", 1, 2),
                JobSpec::parsec("vips", 1, 2),
            ],
        }
    }
}

impl JobDefs {
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            bail!("no batch job defined");
        }
        let mut names = HashSet::new();
        for job in self.jobs.iter() {
            job.validate()?;
            if !names.insert(job.name.as_str()) {
                bail!("job name {:?} is used more than once", &job.name);
            }
        }
        Ok(())
    }

    /// Jobs grouped by tier in ascending tier order, keeping the listed
    /// order within each tier.
    pub fn tiers(&self) -> BTreeMap<u32, Vec<JobSpec>> {
        let mut tiers = BTreeMap::<u32, Vec<JobSpec>>::new();
        for job in self.jobs.iter() {
            tiers.entry(job.tier).or_default().push(job.clone());
        }
        tiers
    }
}

impl JsonLoad for JobDefs {
    fn loaded(&mut self) -> Result<()> {
        self.validate()
    }
}

impl JsonSave for JobDefs {
    fn preamble() -> Option<String> {
        Some(JOB_DEFS_DOC.to_string())
    }
}
