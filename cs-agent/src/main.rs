// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use enum_iterator::IntoEnumIterator;
use log::{error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cs_agent_intf::{
    Args, CoreKnobs, JobDefs, Mode, EVENT_LOG_FILE, JOB_DEFS_FILE, KNOBS_FILE, REPORT_FILE,
};
use cs_util::*;

mod arbiter;
mod controller;
mod docker;
mod event_log;
mod monitor;
mod runtime;
mod scheduler;
mod service;

use controller::Controller;
use docker::DockerRuntime;
use event_log::FileEventLog;
use monitor::{LoadMonitor, MonitorParams, ProcStatSource};
use runtime::{DryRunRuntime, JobRuntime};
use scheduler::Scheduler;
use service::{DryRunService, LcService, TasksetService};

// Simulated job length in --dry-run, in ticks.
const DRY_RUN_JOB_TICKS: f64 = 10.0;

#[derive(Debug)]
pub struct Config {
    pub top_path: PathBuf,
    pub knobs_path: PathBuf,
    pub job_defs_path: PathBuf,
    pub report_path: PathBuf,
    pub event_log_path: PathBuf,
    pub runtime_bin: Option<String>,
    pub args: Args,
}

impl Config {
    fn new(args: &Args) -> Result<Self> {
        fs::create_dir_all(&args.dir)?;
        let top_path = fs::canonicalize(&args.dir)?;

        let runtime_bin = if args.dry_run {
            None
        } else {
            match find_bin(&args.runtime_bin, Option::<&str>::None) {
                Some(v) => Some(v.to_string_lossy().to_string()),
                None => bail!("failed to find container runtime {:?}", &args.runtime_bin),
            }
        };

        Ok(Self {
            knobs_path: top_path.join(KNOBS_FILE),
            job_defs_path: top_path.join(JOB_DEFS_FILE),
            report_path: top_path.join(REPORT_FILE),
            event_log_path: top_path.join(EVENT_LOG_FILE),
            top_path,
            runtime_bin,
            args: args.clone(),
        })
    }

    fn monitor_params(&self) -> MonitorParams {
        MonitorParams {
            high: self.args.high,
            low: self.args.low,
            dwell: Duration::from_secs_f64(self.args.dwell),
            window: self.args.window,
        }
    }
}

fn main() {
    let args_file = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("cfg: Failed to process args file ({:?})", &e);
        panic!();
    });

    if let Err(e) = setup_prog_state() {
        error!("cfg: Failed to set up signal handling ({:?})", &e);
        panic!();
    }

    let cfg = Config::new(&args_file.data).unwrap_or_else(|e| {
        error!("cfg: {:?}", &e);
        panic!();
    });

    let knobs_file = JsonConfigFile::<CoreKnobs>::load_or_create(Some(&cfg.knobs_path))
        .unwrap_or_else(|e| {
            error!("cfg: Failed to load {:?} ({:?})", &cfg.knobs_path, &e);
            panic!();
        });
    let knobs = knobs_file.data;
    if let Some(msg) = knobs.warn_nr_system_cpus() {
        warn!("cfg: {}", &msg);
    }

    let defs_file = JsonConfigFile::<JobDefs>::load_or_create(Some(&cfg.job_defs_path))
        .unwrap_or_else(|e| {
            error!("cfg: Failed to load {:?} ({:?})", &cfg.job_defs_path, &e);
            panic!();
        });

    let tick = Duration::from_secs_f64(cfg.args.tick);
    let runtime: Arc<dyn JobRuntime>;
    let service: Box<dyn LcService>;
    match cfg.runtime_bin.as_ref() {
        Some(bin) => {
            runtime = Arc::new(DockerRuntime::new(bin));
            service = Box::new(TasksetService::new(&cfg.args.service));
        }
        None => {
            info!("cfg: Dry run, the service and containers won't be touched");
            runtime = Arc::new(DryRunRuntime::new(tick.mul_f64(DRY_RUN_JOB_TICKS)));
            service = Box::new(DryRunService::new(&cfg.args.service));
        }
    }

    let sink = FileEventLog::new(cfg.event_log_path.clone()).unwrap_or_else(|e| {
        warn!(
            "cfg: Failed to open {:?}, events will only be logged ({:?})",
            &cfg.event_log_path, &e
        );
        FileEventLog::disabled()
    });

    info!(
        "cfg: {} cores, {} jobs, batch capacity {}, top {:?}",
        knobs.nr_cores,
        defs_file.data.jobs.len(),
        knobs.batch_capacity(),
        &cfg.top_path
    );
    for mode in Mode::into_enum_iter() {
        info!(
            "cfg: {} mode reserves [{}] for {:?}, batch jobs get [{}]",
            mode,
            knobs.reserved(mode),
            &cfg.args.service,
            knobs.available(mode)
        );
    }

    let monitor = LoadMonitor::new(
        knobs.clone(),
        cfg.monitor_params(),
        Box::new(ProcStatSource::new()),
        service,
    );
    let sched = Scheduler::new(&defs_file.data, knobs.batch_capacity(), runtime);

    Controller::new(
        monitor,
        sched,
        Box::new(sink),
        Some(cfg.report_path.clone()),
        tick,
        cfg.args.remove,
    )
    .run();
}
