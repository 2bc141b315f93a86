// Copyright (c) Facebook, Inc. and its affiliates.
use log::info;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};
use thiserror::Error;

use cs_agent_intf::{CoreSet, JobSpec};
use cs_util::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Created,
    Running,
    Paused,
    Exited,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("instance {0:?} not found")]
    NotFound(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Handle to a created instance. The name is the job name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    pub name: String,
}

impl InstanceRef {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }
}

/// Lifecycle operations on batch job instances. Every call must be a no-op
/// when the instance is already in the requested state, e.g. `create()` of
/// an existing instance returns it and `pause()` of a paused one succeeds.
pub trait JobRuntime: Send + Sync {
    fn create(&self, spec: &JobSpec, cores: &CoreSet, threads: usize)
        -> RuntimeResult<InstanceRef>;
    fn start(&self, inst: &InstanceRef) -> RuntimeResult<()>;
    fn pause(&self, inst: &InstanceRef) -> RuntimeResult<()>;
    fn unpause(&self, inst: &InstanceRef) -> RuntimeResult<()>;
    fn resize(&self, inst: &InstanceRef, cores: &CoreSet) -> RuntimeResult<()>;
    fn status(&self, inst: &InstanceRef) -> RuntimeResult<InstanceStatus>;

    /// Block until the instance exits.
    fn wait_for_exit(&self, inst: &InstanceRef) -> RuntimeResult<()>;

    fn remove(&self, _inst: &InstanceRef) -> RuntimeResult<()> {
        Ok(())
    }
}

struct DryRunInstance {
    status: InstanceStatus,
    run_at: Option<Instant>,
    ran_for: Duration,
}

impl DryRunInstance {
    fn refresh(&mut self, run_for: Duration) {
        if let Some(at) = self.run_at {
            if self.ran_for + at.elapsed() >= run_for {
                self.status = InstanceStatus::Exited;
                self.run_at = None;
            }
        }
    }
}

/// Logs the calls it receives and pretends that each job exits after
/// running for `run_for`. Paused time doesn't count.
pub struct DryRunRuntime {
    run_for: Duration,
    insts: Mutex<HashMap<String, DryRunInstance>>,
}

impl DryRunRuntime {
    pub fn new(run_for: Duration) -> Self {
        Self {
            run_for,
            insts: Mutex::new(HashMap::new()),
        }
    }

    fn with_inst<T, F>(&self, inst: &InstanceRef, f: F) -> RuntimeResult<T>
    where
        F: FnOnce(&mut DryRunInstance) -> T,
    {
        let mut insts = self.insts.lock().unwrap_or_else(|e| e.into_inner());
        match insts.get_mut(&inst.name) {
            Some(di) => {
                di.refresh(self.run_for);
                Ok(f(di))
            }
            None => Err(RuntimeError::NotFound(inst.name.clone())),
        }
    }
}

impl JobRuntime for DryRunRuntime {
    fn create(
        &self,
        spec: &JobSpec,
        cores: &CoreSet,
        threads: usize,
    ) -> RuntimeResult<InstanceRef> {
        let mut insts = self.insts.lock().unwrap_or_else(|e| e.into_inner());
        if !insts.contains_key(&spec.name) {
            info!(
                "dry-run: create {:?} image={:?} cores=[{}] cmd={:?}",
                &spec.name,
                &spec.image,
                cores,
                spec.command(threads).join(" ")
            );
            insts.insert(
                spec.name.clone(),
                DryRunInstance {
                    status: InstanceStatus::Created,
                    run_at: None,
                    ran_for: Duration::from_secs(0),
                },
            );
        }
        Ok(InstanceRef::new(&spec.name))
    }

    fn start(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        self.with_inst(inst, |di| {
            if di.status == InstanceStatus::Created {
                info!("dry-run: start {:?}", &inst.name);
                di.status = InstanceStatus::Running;
                di.run_at = Some(Instant::now());
            }
        })
    }

    fn pause(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        self.with_inst(inst, |di| {
            if di.status == InstanceStatus::Running {
                info!("dry-run: pause {:?}", &inst.name);
                di.status = InstanceStatus::Paused;
                if let Some(at) = di.run_at.take() {
                    di.ran_for += at.elapsed();
                }
            }
        })
    }

    fn unpause(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        self.with_inst(inst, |di| {
            if di.status == InstanceStatus::Paused {
                info!("dry-run: unpause {:?}", &inst.name);
                di.status = InstanceStatus::Running;
                di.run_at = Some(Instant::now());
            }
        })
    }

    fn resize(&self, inst: &InstanceRef, cores: &CoreSet) -> RuntimeResult<()> {
        self.with_inst(inst, |_| {
            info!("dry-run: resize {:?} to [{}]", &inst.name, cores);
        })
    }

    fn status(&self, inst: &InstanceRef) -> RuntimeResult<InstanceStatus> {
        self.with_inst(inst, |di| di.status)
    }

    fn wait_for_exit(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        loop {
            if self.status(inst)? == InstanceStatus::Exited || prog_exiting() {
                return Ok(());
            }
            sleep(Duration::from_millis(100));
        }
    }

    fn remove(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        let mut insts = self.insts.lock().unwrap_or_else(|e| e.into_inner());
        if insts.remove(&inst.name).is_some() {
            info!("dry-run: remove {:?}", &inst.name);
        }
        Ok(())
    }
}
