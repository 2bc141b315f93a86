// Copyright (c) Facebook, Inc. and its affiliates.
pub mod args;
pub mod cores;
pub mod event;
pub mod job_defs;
pub mod knobs;
pub mod report;

pub use args::Args;
pub use cores::CoreSet;
pub use event::{Event, EventKind};
pub use job_defs::{JobDefs, JobSpec};
pub use knobs::{CoreKnobs, Mode};
pub use report::{JobReport, JobStateReport, Report};

pub const DFL_SERVICE_NAME: &str = "memcached";

pub const KNOBS_FILE: &str = "knobs.json";
pub const JOB_DEFS_FILE: &str = "job-defs.json";
pub const REPORT_FILE: &str = "report.json";
pub const EVENT_LOG_FILE: &str = "events.log";
