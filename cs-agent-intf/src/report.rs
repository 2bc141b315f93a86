// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::UNIX_EPOCH;

use super::{CoreSet, Mode};
use cs_util::*;

const REPORT_DOC: &str = "\
//
// cs-agent summary report, rewritten on every tick
//
//  timestamp: When this report was generated
//  seq: Tick sequence number
//  mode: Service mode, Narrow or Wide
//  pending_mode: Mode whose service resize failed and is being retried
//  reserved: Cores reserved for the service
//  available: Cores available to batch jobs
//  util: Windowed average utilization of the reserved cores in percent
//  jobs{}.tier: Priority tier
//  jobs{}.state: Pending, Created, Running, Paused or Completed
//  jobs{}.cores: Cores the job was last given
//  jobs{}.threads: Thread hint
//  jobs{}.started_at: When the job started
//  jobs{}.ended_at: When the job completed
//  jobs{}.duration: Run duration in seconds, up to now if still running
//  jobs{}.last_err: The last adapter error
//
";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStateReport {
    Pending,
    Created,
    Running,
    Paused,
    Completed,
}

impl Default for JobStateReport {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobReport {
    pub tier: u32,
    pub state: JobStateReport,
    pub cores: CoreSet,
    pub threads: usize,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub duration: f64,
    pub last_err: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: DateTime<Local>,
    pub seq: u64,
    pub mode: Mode,
    pub pending_mode: Option<Mode>,
    pub reserved: CoreSet,
    pub available: CoreSet,
    pub util: f64,
    pub jobs: BTreeMap<String, JobReport>,
}

impl Default for Report {
    fn default() -> Self {
        Self {
            timestamp: DateTime::from(UNIX_EPOCH),
            seq: 0,
            mode: Default::default(),
            pending_mode: None,
            reserved: Default::default(),
            available: Default::default(),
            util: 0.0,
            jobs: Default::default(),
        }
    }
}

impl JsonLoad for Report {}

impl JsonSave for Report {
    fn preamble() -> Option<String> {
        Some(REPORT_DOC.to_string())
    }
}
