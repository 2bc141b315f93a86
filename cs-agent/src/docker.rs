// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::anyhow;
use log::{debug, info};
use std::process::Command;

use super::runtime::{InstanceRef, InstanceStatus, JobRuntime, RuntimeError, RuntimeResult};
use cs_agent_intf::{CoreSet, JobSpec};
use cs_util::*;

fn parse_status(state: &str) -> Option<InstanceStatus> {
    match state.trim() {
        "created" => Some(InstanceStatus::Created),
        "running" | "restarting" => Some(InstanceStatus::Running),
        "paused" => Some(InstanceStatus::Paused),
        "exited" | "dead" | "removing" => Some(InstanceStatus::Exited),
        _ => None,
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("No such object") || stderr.contains("No such container")
}

/// Drives containers through the docker command line. Containers are named
/// after their jobs.
pub struct DockerRuntime {
    bin: String,
}

impl DockerRuntime {
    pub fn new(bin: &str) -> Self {
        Self { bin: bin.into() }
    }

    fn run(&self, name: &str, args: &[&str]) -> RuntimeResult<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        debug!("docker: Running {:?}", &cmd);

        let out = command_output(&mut cmd)?;
        if out.success {
            Ok(out.stdout)
        } else if is_not_found(&out.stderr) {
            Err(RuntimeError::NotFound(name.into()))
        } else {
            Err(RuntimeError::Failed(anyhow!(
                "{} {} failed ({})",
                &self.bin,
                args.join(" "),
                &out.stderr
            )))
        }
    }
}

impl JobRuntime for DockerRuntime {
    fn create(
        &self,
        spec: &JobSpec,
        cores: &CoreSet,
        threads: usize,
    ) -> RuntimeResult<InstanceRef> {
        let inst = InstanceRef::new(&spec.name);
        match self.status(&inst) {
            Ok(_) => return Ok(inst),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let cpuset = cores.to_string();
        let command = spec.command(threads);
        let mut args = vec![
            "create",
            "--name",
            spec.name.as_str(),
            "--cpuset-cpus",
            cpuset.as_str(),
            spec.image.as_str(),
        ];
        args.extend(command.iter().map(|x| x.as_str()));

        info!(
            "docker: Creating {:?} on [{}] from {:?}",
            &spec.name, cores, &spec.image
        );
        self.run(&spec.name, &args)?;
        Ok(inst)
    }

    fn start(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        match self.status(inst)? {
            InstanceStatus::Created => {
                self.run(&inst.name, &["start", inst.name.as_str()])?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn pause(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        match self.status(inst)? {
            InstanceStatus::Running => {
                self.run(&inst.name, &["pause", inst.name.as_str()])?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn unpause(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        match self.status(inst)? {
            InstanceStatus::Paused => {
                self.run(&inst.name, &["unpause", inst.name.as_str()])?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn resize(&self, inst: &InstanceRef, cores: &CoreSet) -> RuntimeResult<()> {
        let cpuset = cores.to_string();
        self.run(&inst.name, &["update", "--cpuset-cpus", cpuset.as_str(), inst.name.as_str()])
            .map(|_| ())
    }

    fn status(&self, inst: &InstanceRef) -> RuntimeResult<InstanceStatus> {
        let state = self.run(
            &inst.name,
            &["inspect", "--type", "container", "-f", "{{.State.Status}}", inst.name.as_str()],
        )?;
        parse_status(&state).ok_or_else(|| {
            RuntimeError::Failed(anyhow!(
                "unknown container state {:?} for {:?}",
                &state,
                &inst.name
            ))
        })
    }

    fn wait_for_exit(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        self.run(&inst.name, &["wait", inst.name.as_str()]).map(|_| ())
    }

    fn remove(&self, inst: &InstanceRef) -> RuntimeResult<()> {
        match self.run(&inst.name, &["rm", "-f", inst.name.as_str()]) {
            Ok(_) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{is_not_found, parse_status};
    use crate::runtime::InstanceStatus;

    #[test]
    fn test_parse_status() {
        for (state, status) in &[
            ("created", InstanceStatus::Created),
            ("running\n", InstanceStatus::Running),
            ("restarting", InstanceStatus::Running),
            ("paused", InstanceStatus::Paused),
            ("exited", InstanceStatus::Exited),
            ("dead", InstanceStatus::Exited),
            ("removing", InstanceStatus::Exited),
        ] {
            assert_eq!(parse_status(state), Some(*status), "{:?}", state);
        }
        assert_eq!(parse_status("bogus"), None);

        assert!(is_not_found("Error: No such object: vips"));
        assert!(is_not_found("Error response from daemon: No such container: vips"));
        assert!(!is_not_found("permission denied"));
    }
}
