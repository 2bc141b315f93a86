// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, info, warn};
use std::process::Command;
use sysinfo::{ProcessExt, System, SystemExt};

use cs_agent_intf::CoreSet;
use cs_util::*;

/// The latency-critical service whose core affinity the agent controls.
pub trait LcService: Send {
    fn name(&self) -> &str;
    fn set_cores(&mut self, cores: &CoreSet) -> Result<()>;
}

/// Pins every thread of the first process whose name contains `name` with
/// `taskset -acp`. The process is looked up on each call so that restarts
/// are followed.
pub struct TasksetService {
    name: String,
    taskset_bin: String,
}

impl TasksetService {
    pub fn new(name: &str) -> Self {
        let taskset_bin = match find_bin("taskset", Option::<&str>::None) {
            Some(path) => path.to_string_lossy().to_string(),
            None => {
                warn!("service: taskset not found in PATH");
                "taskset".into()
            }
        };
        Self {
            name: name.into(),
            taskset_bin,
        }
    }

    fn find_pid(&self) -> Option<String> {
        let mut sys = System::new();
        sys.refresh_processes();
        for (pid, proc) in sys.get_processes() {
            if proc.name().contains(&self.name) {
                return Some(format!("{}", pid));
            }
        }
        None
    }
}

impl LcService for TasksetService {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_cores(&mut self, cores: &CoreSet) -> Result<()> {
        let pid = match self.find_pid() {
            Some(v) => v,
            None => {
                warn!(
                    "service: {:?} is not running, skipping affinity update",
                    &self.name
                );
                return Ok(());
            }
        };

        let cpuset = cores.to_string();
        debug!("service: taskset -acp {} {}", &cpuset, &pid);
        run_command(
            Command::new(&self.taskset_bin).args(&["-acp", cpuset.as_str(), pid.as_str()]),
            "failed to set service cpu affinity",
        )?;
        info!("service: Pinned {:?} (pid {}) to [{}]", &self.name, &pid, cores);
        Ok(())
    }
}

pub struct DryRunService {
    name: String,
}

impl DryRunService {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }
}

impl LcService for DryRunService {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_cores(&mut self, cores: &CoreSet) -> Result<()> {
        info!("dry-run: pin {:?} to [{}]", &self.name, cores);
        Ok(())
    }
}
