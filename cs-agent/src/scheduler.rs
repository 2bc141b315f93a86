// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::spawn;

use super::arbiter::{self, Claim, Grant};
use super::event_log::EventSink;
use super::runtime::{InstanceRef, InstanceStatus, JobRuntime, RuntimeError, RuntimeResult};
use cs_agent_intf::{CoreSet, Event, EventKind, JobDefs, JobReport, JobSpec, JobStateReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Created,
    Running,
    Paused,
    Completed,
}

impl JobState {
    fn report(&self) -> JobStateReport {
        match self {
            JobState::Pending => JobStateReport::Pending,
            JobState::Created => JobStateReport::Created,
            JobState::Running => JobStateReport::Running,
            JobState::Paused => JobStateReport::Paused,
            JobState::Completed => JobStateReport::Completed,
        }
    }
}

#[derive(Debug)]
pub struct JobInstance {
    pub spec: JobSpec,
    pub state: JobState,
    pub inst: Option<InstanceRef>,
    pub cores: CoreSet,
    pub created_at: Option<DateTime<Local>>,
    pub started_at: Option<DateTime<Local>>,
    pub paused_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub start_emitted: bool,
    pub last_err: Option<String>,

    // Bumped on each create so that a stale waiter can be told apart.
    gen: u64,
    waiter_gen: Option<u64>,
}

impl JobInstance {
    fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            state: JobState::Pending,
            inst: None,
            cores: CoreSet::new(),
            created_at: None,
            started_at: None,
            paused_at: None,
            ended_at: None,
            start_emitted: false,
            last_err: None,
            gen: 0,
            waiter_gen: None,
        }
    }

    fn duration(&self) -> f64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            (Some(start), None) => (Local::now() - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    fn failed(&mut self, what: &str, e: &RuntimeError) {
        warn!(
            "sched: Failed to {} {:?} in {:?} state ({})",
            what, &self.spec.name, self.state, e
        );
        self.last_err = Some(format!("{}: {}", what, e));
    }
}

#[derive(Debug)]
pub struct Tier {
    pub nr: u32,
    pub queue: VecDeque<usize>,
    pub last_cores: CoreSet,
}

struct WaitResult {
    idx: usize,
    gen: u64,
    result: RuntimeResult<()>,
}

/// Owns the tier queues and the job instances. Each tick reads job statuses,
/// plans core assignments for the queue heads and issues the lifecycle calls
/// to get there.
pub struct Scheduler {
    runtime: Arc<dyn JobRuntime>,
    capacity: usize,
    pub jobs: Vec<JobInstance>,
    pub tiers: Vec<Tier>,
    exit_tx: Sender<WaitResult>,
    exit_rx: Receiver<WaitResult>,
}

impl Scheduler {
    pub fn new(defs: &JobDefs, capacity: usize, runtime: Arc<dyn JobRuntime>) -> Self {
        let mut jobs = vec![];
        let mut tiers = vec![];
        for (nr, specs) in defs.tiers().into_iter() {
            let mut queue = VecDeque::new();
            for spec in specs.into_iter() {
                queue.push_back(jobs.len());
                jobs.push(JobInstance::new(spec));
            }
            tiers.push(Tier {
                nr,
                queue,
                last_cores: CoreSet::new(),
            });
        }
        let (exit_tx, exit_rx) = channel::unbounded();

        Self {
            runtime,
            capacity,
            jobs,
            tiers,
            exit_tx,
            exit_rx,
        }
    }

    pub fn is_done(&self) -> bool {
        self.tiers.iter().all(|tier| tier.queue.is_empty())
    }

    fn heads(&self) -> Vec<(usize, usize)> {
        self.tiers
            .iter()
            .enumerate()
            .filter_map(|(ti, tier)| tier.queue.front().map(|&idx| (ti, idx)))
            .collect()
    }

    fn complete(&mut self, idx: usize, sink: &mut dyn EventSink) {
        let job = &mut self.jobs[idx];
        if job.state == JobState::Completed {
            return;
        }
        job.state = JobState::Completed;
        job.ended_at = Some(Local::now());
        if job.started_at.is_none() {
            job.started_at = job.created_at.or(job.ended_at);
        }
        let dur = job.duration();
        info!("sched: {:?} completed after {:.1}s", &job.spec.name, dur);
        sink.emit(Event::new(EventKind::End, &job.spec.name).duration(dur));

        for tier in self.tiers.iter_mut() {
            if tier.queue.front() == Some(&idx) {
                tier.queue.pop_front();
                match tier.queue.front() {
                    Some(&next) => debug!(
                        "sched: Tier {} advances to {:?}",
                        tier.nr, &self.jobs[next].spec.name
                    ),
                    None => info!("sched: Tier {} is done", tier.nr),
                }
            }
        }
    }

    fn note_started(&mut self, idx: usize, sink: &mut dyn EventSink) {
        let job = &mut self.jobs[idx];
        job.state = JobState::Running;
        if job.started_at.is_none() {
            job.started_at = Some(Local::now());
        }
        if !job.start_emitted {
            job.start_emitted = true;
            sink.emit(
                Event::new(EventKind::Start, &job.spec.name)
                    .cores(job.cores)
                    .threads(job.spec.threads),
            );
        }
        self.spawn_waiter(idx);
    }

    fn spawn_waiter(&mut self, idx: usize) {
        let job = &mut self.jobs[idx];
        let inst = match job.inst.as_ref() {
            Some(v) => v.clone(),
            None => return,
        };
        if job.waiter_gen == Some(job.gen) {
            return;
        }
        job.waiter_gen = Some(job.gen);

        let gen = job.gen;
        let runtime = self.runtime.clone();
        let tx = self.exit_tx.clone();
        spawn(move || {
            let result = runtime.wait_for_exit(&inst);
            let _ = tx.send(WaitResult { idx, gen, result });
        });
    }

    /// Reconcile with the runtime. Returns the jobs whose status couldn't
    /// be read.
    fn observe(&mut self, sink: &mut dyn EventSink) -> HashSet<usize> {
        while let Ok(wr) = self.exit_rx.try_recv() {
            if wr.gen != self.jobs[wr.idx].gen {
                continue;
            }
            match wr.result {
                Ok(()) => self.complete(wr.idx, sink),
                Err(e) => {
                    debug!(
                        "sched: Waiting for {:?} failed ({})",
                        &self.jobs[wr.idx].spec.name, &e
                    );
                    self.jobs[wr.idx].waiter_gen = None;
                }
            }
        }

        let mut frozen = HashSet::new();
        for ti in 0..self.tiers.len() {
            while let Some(&idx) = self.tiers[ti].queue.front() {
                let inst = match (self.jobs[idx].state, self.jobs[idx].inst.as_ref()) {
                    (JobState::Pending, _) | (_, None) => break,
                    (_, Some(inst)) => inst.clone(),
                };

                let status = self.runtime.status(&inst);
                let job = &mut self.jobs[idx];
                match status {
                    Ok(InstanceStatus::Exited) => {
                        self.complete(idx, sink);
                        continue;
                    }
                    Ok(InstanceStatus::Running) => {
                        if job.state != JobState::Running {
                            info!(
                                "sched: {:?} is running while {:?}, adopting",
                                &job.spec.name, job.state
                            );
                            self.note_started(idx, sink);
                        } else {
                            self.spawn_waiter(idx);
                        }
                    }
                    Ok(InstanceStatus::Paused) => {
                        if job.state != JobState::Paused {
                            info!(
                                "sched: {:?} is paused while {:?}, adopting",
                                &job.spec.name, job.state
                            );
                            job.state = JobState::Paused;
                            job.paused_at = Some(Local::now());
                        }
                    }
                    Ok(InstanceStatus::Created) => {
                        if job.state != JobState::Created {
                            info!(
                                "sched: {:?} is created while {:?}, adopting",
                                &job.spec.name, job.state
                            );
                            job.state = JobState::Created;
                        }
                    }
                    Err(RuntimeError::NotFound(_)) => {
                        warn!(
                            "sched: {:?} disappeared while {:?}, recreating",
                            &job.spec.name, job.state
                        );
                        job.last_err = Some("instance not found".into());
                        job.state = JobState::Pending;
                        job.inst = None;
                    }
                    Err(e) => {
                        job.failed("read status of", &e);
                        frozen.insert(idx);
                    }
                }
                break;
            }
        }
        frozen
    }

    fn grant_pending(&mut self, ti: usize, idx: usize, set: CoreSet, sink: &mut dyn EventSink) {
        let job = &mut self.jobs[idx];
        let inst = match self
            .runtime
            .create(&job.spec, &set, job.spec.threads)
        {
            Ok(v) => v,
            Err(e) => {
                job.failed("create", &e);
                return;
            }
        };
        debug!("sched: Created {:?} on [{}]", &job.spec.name, set);
        job.inst = Some(inst);
        job.gen += 1;
        job.state = JobState::Created;
        job.cores = set;
        job.created_at = Some(Local::now());
        self.tiers[ti].last_cores = set;
        self.grant_created(ti, idx, set, sink);
    }

    fn grant_created(&mut self, ti: usize, idx: usize, set: CoreSet, sink: &mut dyn EventSink) {
        if !self.resize(idx, set, false, sink) {
            return;
        }
        self.tiers[ti].last_cores = set;

        let job = &mut self.jobs[idx];
        let inst = match job.inst.clone() {
            Some(v) => v,
            None => return,
        };
        match self.runtime.start(&inst) {
            Ok(()) => {
                info!(
                    "sched: Started {:?} on [{}] with {} threads",
                    &job.spec.name, set, job.spec.threads
                );
                job.last_err = None;
                self.note_started(idx, sink);
            }
            Err(e) => job.failed("start", &e),
        }
    }

    fn grant_paused(&mut self, ti: usize, idx: usize, set: CoreSet, sink: &mut dyn EventSink) {
        if !self.resize(idx, set, true, sink) {
            return;
        }
        self.tiers[ti].last_cores = set;

        let job = &mut self.jobs[idx];
        let inst = match job.inst.clone() {
            Some(v) => v,
            None => return,
        };
        match self.runtime.unpause(&inst) {
            Ok(()) => {
                info!("sched: Resumed {:?} on [{}]", &job.spec.name, set);
                job.state = JobState::Running;
                job.paused_at = None;
                job.last_err = None;
                sink.emit(Event::new(EventKind::Unpause, &job.spec.name));
                self.spawn_waiter(idx);
            }
            Err(e) => job.failed("unpause", &e),
        }
    }

    fn hold(&mut self, idx: usize, sink: &mut dyn EventSink) -> bool {
        let job = &mut self.jobs[idx];
        let inst = match (job.state, job.inst.clone()) {
            (JobState::Running, Some(inst)) => inst,
            _ => return true,
        };
        match self.runtime.pause(&inst) {
            Ok(()) => {
                info!("sched: Paused {:?}, no cores for it", &job.spec.name);
                job.state = JobState::Paused;
                job.paused_at = Some(Local::now());
                sink.emit(Event::new(EventKind::Pause, &job.spec.name));
                true
            }
            Err(e) => {
                job.failed("pause", &e);
                false
            }
        }
    }

    /// Move the job to `set` if it isn't there already. Returns whether
    /// the job is on `set`.
    fn resize(&mut self, idx: usize, set: CoreSet, announce: bool, sink: &mut dyn EventSink) -> bool {
        let job = &mut self.jobs[idx];
        if job.cores == set {
            return true;
        }
        let inst = match job.inst.clone() {
            Some(v) => v,
            None => return false,
        };
        match self.runtime.resize(&inst, &set) {
            Ok(()) => {
                debug!(
                    "sched: Resized {:?} from [{}] to [{}]",
                    &job.spec.name, job.cores, set
                );
                job.cores = set;
                if announce {
                    sink.emit(Event::new(EventKind::UpdateCores, &job.spec.name).cores(set));
                }
                true
            }
            Err(e) => {
                job.failed("resize", &e);
                false
            }
        }
    }

    fn running_elsewhere(&self, idx: usize) -> CoreSet {
        let mut used = CoreSet::new();
        for (i, job) in self.jobs.iter().enumerate() {
            if i != idx && job.state == JobState::Running {
                used |= job.cores;
            }
        }
        used
    }

    /// One scheduling pass over the cores in `avail`. Returns whether all
    /// running jobs are confined to `avail` afterwards.
    pub fn tick(&mut self, avail: CoreSet, sink: &mut dyn EventSink) -> bool {
        let frozen = self.observe(sink);

        let heads = self.heads();
        let claims: Vec<Claim> = heads
            .iter()
            .map(|&(ti, idx)| {
                let job = &self.jobs[idx];
                let is_frozen = frozen.contains(&idx);
                let cores = match job.state {
                    JobState::Pending => self.tiers[ti].last_cores,
                    JobState::Running => job.cores,
                    _ if is_frozen => CoreSet::new(),
                    _ => job.cores,
                };
                Claim {
                    threads: job.spec.threads,
                    cores,
                    paused: job.state == JobState::Paused,
                    frozen: is_frozen,
                }
            })
            .collect();
        let grants = arbiter::plan(avail, self.capacity, &claims);

        // Release cores before handing them out.
        let mut released = true;
        for (&(_, idx), grant) in heads.iter().zip(grants.iter()) {
            let (state, cores) = (self.jobs[idx].state, self.jobs[idx].cores);
            match *grant {
                Grant::Hold => released &= self.hold(idx, sink),
                Grant::Run(set)
                    if state == JobState::Running && set != cores && set.is_subset(&cores) =>
                {
                    released &= self.resize(idx, set, true, sink)
                }
                _ => {}
            }
        }
        if !released {
            warn!("sched: Failed to release cores, not handing out more this tick");
            return false;
        }

        // A failed move leaves a job on its old cores. Those stay off-limits
        // until it actually lets go of them.
        for &order in &[JobState::Running, JobState::Paused, JobState::Created, JobState::Pending] {
            for (&(ti, idx), grant) in heads.iter().zip(grants.iter()) {
                let set = match *grant {
                    Grant::Run(set) if self.jobs[idx].state == order => set,
                    _ => continue,
                };
                let busy = self.running_elsewhere(idx) & set;
                if !busy.is_empty() {
                    warn!(
                        "sched: [{}] is still held by other jobs, not moving {:?} to [{}]",
                        busy, &self.jobs[idx].spec.name, set
                    );
                    continue;
                }
                match order {
                    JobState::Running => {
                        self.resize(idx, set, true, sink);
                        self.tiers[ti].last_cores = self.jobs[idx].cores;
                    }
                    JobState::Paused => self.grant_paused(ti, idx, set, sink),
                    JobState::Created => self.grant_created(ti, idx, set, sink),
                    JobState::Pending => self.grant_pending(ti, idx, set, sink),
                    JobState::Completed => {}
                }
            }
        }

        self.jobs
            .iter()
            .filter(|job| job.state == JobState::Running)
            .all(|job| job.cores.is_subset(&avail))
    }

    /// Remove all instances which have been created.
    pub fn remove_all(&mut self) {
        for job in self.jobs.iter() {
            if let Some(inst) = job.inst.as_ref() {
                match self.runtime.remove(inst) {
                    Ok(()) => debug!("sched: Removed {:?}", &job.spec.name),
                    Err(e) => warn!("sched: Failed to remove {:?} ({})", &job.spec.name, &e),
                }
            }
        }
    }

    pub fn report(&self) -> BTreeMap<String, JobReport> {
        self.jobs
            .iter()
            .map(|job| {
                (
                    job.spec.name.clone(),
                    JobReport {
                        tier: job.spec.tier,
                        state: job.state.report(),
                        cores: job.cores,
                        threads: job.spec.threads,
                        started_at: job.started_at,
                        ended_at: job.ended_at,
                        duration: job.duration(),
                        last_err: job.last_err.clone(),
                    },
                )
            })
            .collect()
    }

    /// Cores held by running jobs. Panics if two running jobs share a core.
    #[cfg(test)]
    pub fn running_cores(&self) -> CoreSet {
        let mut used = CoreSet::new();
        for job in self.jobs.iter().filter(|j| j.state == JobState::Running) {
            assert!(
                used.is_disjoint(&job.cores),
                "{:?} overlaps on [{}]",
                &job.spec.name,
                used & job.cores
            );
            used |= job.cores;
        }
        used
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{JobState, Scheduler};
    use crate::runtime::{InstanceRef, InstanceStatus, JobRuntime, RuntimeError, RuntimeResult};
    use anyhow::anyhow;
    use cs_agent_intf::{CoreSet, Event, JobDefs, JobSpec};
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Condvar, Mutex};

    #[derive(Default)]
    struct FakeState {
        insts: HashMap<String, (InstanceStatus, CoreSet)>,
        calls: Vec<String>,
        fail: HashSet<String>,
    }

    #[derive(Default)]
    pub(crate) struct FakeRuntime {
        state: Mutex<FakeState>,
        waitq: Condvar,
    }

    impl FakeRuntime {
        fn op<T, F>(&self, op: &str, name: &str, f: F) -> RuntimeResult<T>
        where
            F: FnOnce(&mut HashMap<String, (InstanceStatus, CoreSet)>) -> RuntimeResult<T>,
        {
            let mut state = self.state.lock().unwrap();
            let call = format!("{} {}", op, name);
            if state.fail.contains(&call) {
                return Err(RuntimeError::Failed(anyhow!("injected {:?} failure", &call)));
            }
            let res = f(&mut state.insts);
            if op != "status" {
                state.calls.push(call);
            }
            self.waitq.notify_all();
            res
        }

        fn set(&self, op: &str, name: &str, from: InstanceStatus, to: InstanceStatus) -> RuntimeResult<()> {
            self.op(op, name, |insts| match insts.get_mut(name) {
                Some((st, _)) => {
                    if *st == from {
                        *st = to;
                    }
                    Ok(())
                }
                None => Err(RuntimeError::NotFound(name.into())),
            })
        }

        pub fn exit(&self, name: &str) {
            let mut state = self.state.lock().unwrap();
            state.insts.get_mut(name).unwrap().0 = InstanceStatus::Exited;
            self.waitq.notify_all();
        }

        fn vanish(&self, name: &str) {
            self.state.lock().unwrap().insts.remove(name);
            self.waitq.notify_all();
        }

        pub fn fail(&self, call: &str, on: bool) {
            let mut state = self.state.lock().unwrap();
            if on {
                state.fail.insert(call.into());
            } else {
                state.fail.remove(call);
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn cores(&self, name: &str) -> String {
            self.state.lock().unwrap().insts[name].1.to_string()
        }
    }

    impl JobRuntime for FakeRuntime {
        fn create(
            &self,
            spec: &JobSpec,
            cores: &CoreSet,
            _threads: usize,
        ) -> RuntimeResult<InstanceRef> {
            self.op("create", &spec.name, |insts| {
                insts
                    .entry(spec.name.clone())
                    .or_insert((InstanceStatus::Created, *cores));
                Ok(InstanceRef::new(&spec.name))
            })
        }

        fn start(&self, inst: &InstanceRef) -> RuntimeResult<()> {
            self.set("start", &inst.name, InstanceStatus::Created, InstanceStatus::Running)
        }

        fn pause(&self, inst: &InstanceRef) -> RuntimeResult<()> {
            self.set("pause", &inst.name, InstanceStatus::Running, InstanceStatus::Paused)
        }

        fn unpause(&self, inst: &InstanceRef) -> RuntimeResult<()> {
            self.set("unpause", &inst.name, InstanceStatus::Paused, InstanceStatus::Running)
        }

        fn resize(&self, inst: &InstanceRef, cores: &CoreSet) -> RuntimeResult<()> {
            self.op("resize", &inst.name, |insts| match insts.get_mut(&inst.name) {
                Some(v) => {
                    v.1 = *cores;
                    Ok(())
                }
                None => Err(RuntimeError::NotFound(inst.name.clone())),
            })
        }

        fn status(&self, inst: &InstanceRef) -> RuntimeResult<InstanceStatus> {
            self.op("status", &inst.name, |insts| match insts.get(&inst.name) {
                Some(v) => Ok(v.0),
                None => Err(RuntimeError::NotFound(inst.name.clone())),
            })
        }

        fn wait_for_exit(&self, inst: &InstanceRef) -> RuntimeResult<()> {
            let mut state = self.state.lock().unwrap();
            loop {
                match state.insts.get(&inst.name) {
                    Some((InstanceStatus::Exited, _)) => return Ok(()),
                    Some(_) => state = self.waitq.wait(state).unwrap(),
                    None => return Err(RuntimeError::NotFound(inst.name.clone())),
                }
            }
        }

        fn remove(&self, inst: &InstanceRef) -> RuntimeResult<()> {
            self.op("remove", &inst.name, |insts| {
                insts.remove(&inst.name);
                Ok(())
            })
        }
    }

    pub(crate) fn job(name: &str, threads: usize, tier: u32) -> JobSpec {
        JobSpec {
            name: name.into(),
            image: format!("test/{}", name),
            args: vec![],
            threads,
            tier,
        }
    }

    fn setup(jobs: Vec<JobSpec>, capacity: usize) -> (Scheduler, Arc<FakeRuntime>) {
        let rt = Arc::new(FakeRuntime::default());
        let sched = Scheduler::new(&JobDefs { jobs }, capacity, rt.clone());
        (sched, rt)
    }

    fn tick(sched: &mut Scheduler, avail: &str, events: &mut Vec<Event>) {
        sched.tick(avail.parse().unwrap(), events);
        sched.running_cores();
    }

    pub(crate) fn lines(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|ev| {
                let line = ev.to_string();
                let mut fields: Vec<&str> = line.split_whitespace().skip(1).collect();
                if let Some(last) = fields.last() {
                    if last.starts_with("duration=") {
                        fields.pop();
                    }
                }
                fields.join(" ")
            })
            .collect()
    }

    fn state(sched: &Scheduler, name: &str) -> JobState {
        sched.jobs.iter().find(|j| j.spec.name == name).unwrap().state
    }

    #[test]
    fn test_two_tiers_run_and_advance() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j1", 1, 0), job("j2", 1, 1)], 2);
        let mut events = vec![];

        tick(&mut sched, "1-2", &mut events);
        assert_eq!(state(&sched, "j1"), JobState::Running);
        assert_eq!(state(&sched, "j2"), JobState::Running);
        assert_eq!(sched.running_cores().to_string(), "1-2");
        assert_eq!(rt.cores("j1"), "1");
        assert_eq!(rt.cores("j2"), "2");

        for _ in 2..5 {
            tick(&mut sched, "1-2", &mut events);
        }
        rt.exit("j1");
        tick(&mut sched, "1-2", &mut events);

        assert_eq!(state(&sched, "j1"), JobState::Completed);
        assert_eq!(state(&sched, "j2"), JobState::Running);
        assert_eq!(rt.cores("j2"), "2");
        assert!(sched.tiers[0].queue.is_empty());
        assert!(!sched.is_done());
        assert_eq!(
            lines(&events),
            vec!["start j1 [1] 1", "start j2 [2] 1", "end j1"]
        );
        assert_eq!(rt.calls().iter().filter(|c| c.ends_with(" j2")).count(), 2);

        rt.exit("j2");
        tick(&mut sched, "1-2", &mut events);
        assert!(sched.is_done());
        assert_eq!(sched.report()["j2"].state, cs_agent_intf::JobStateReport::Completed);
    }

    #[test]
    fn test_pause_without_partial_grant() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j3", 2, 0)], 2);
        let mut events = vec![];

        tick(&mut sched, "1-2", &mut events);
        assert_eq!(rt.cores("j3"), "1-2");

        tick(&mut sched, "2", &mut events);
        assert_eq!(state(&sched, "j3"), JobState::Paused);
        tick(&mut sched, "2", &mut events);
        assert_eq!(state(&sched, "j3"), JobState::Paused);

        tick(&mut sched, "1-2", &mut events);
        assert_eq!(state(&sched, "j3"), JobState::Running);
        assert_eq!(rt.cores("j3"), "1-2");
        assert_eq!(
            lines(&events),
            vec!["start j3 [1-2] 2", "pause j3", "unpause j3"]
        );
    }

    #[test]
    fn test_resume_on_new_cores() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j3", 2, 0)], 3);
        let mut events = vec![];

        tick(&mut sched, "1-3", &mut events);
        tick(&mut sched, "3", &mut events);
        tick(&mut sched, "2-3", &mut events);
        assert_eq!(rt.cores("j3"), "2-3");
        assert_eq!(
            lines(&events),
            vec!["start j3 [1-2] 2", "pause j3", "update-cores j3 [2-3]", "unpause j3"]
        );
        let calls = rt.calls();
        let resize = calls.iter().position(|c| c == "resize j3").unwrap();
        let unpause = calls.iter().position(|c| c == "unpause j3").unwrap();
        assert!(resize < unpause);
    }

    #[test]
    fn test_exit_while_paused() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j3", 2, 0), job("j4", 1, 0)], 2);
        let mut events = vec![];

        tick(&mut sched, "1-2", &mut events);
        tick(&mut sched, "2", &mut events);
        assert_eq!(state(&sched, "j3"), JobState::Paused);

        rt.exit("j3");
        tick(&mut sched, "2", &mut events);
        assert_eq!(state(&sched, "j3"), JobState::Completed);
        assert_eq!(state(&sched, "j4"), JobState::Running);
        assert_eq!(
            lines(&events),
            vec!["start j3 [1-2] 2", "pause j3", "end j3", "start j4 [2] 1"]
        );
    }

    #[test]
    fn test_idempotent_start() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j1", 1, 0)], 2);
        let mut events = vec![];

        // A single tick with enough cores is enough to get running.
        tick(&mut sched, "1-2", &mut events);
        assert_eq!(state(&sched, "j1"), JobState::Running);

        let inst = InstanceRef::new("j1");
        rt.start(&inst).unwrap();
        tick(&mut sched, "1-2", &mut events);
        tick(&mut sched, "1-2", &mut events);
        assert_eq!(lines(&events), vec!["start j1 [1] 1"]);
        assert_eq!(rt.calls(), vec!["create j1", "start j1", "start j1"]);
    }

    #[test]
    fn test_recreate_missing_instance() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j1", 1, 0)], 2);
        let mut events = vec![];

        tick(&mut sched, "1-2", &mut events);
        rt.vanish("j1");
        tick(&mut sched, "1-2", &mut events);

        assert_eq!(state(&sched, "j1"), JobState::Running);
        assert_eq!(rt.cores("j1"), "1");
        assert_eq!(
            rt.calls(),
            vec!["create j1", "start j1", "create j1", "start j1"]
        );
        assert_eq!(lines(&events), vec!["start j1 [1] 1"]);

        rt.exit("j1");
        tick(&mut sched, "1-2", &mut events);
        assert_eq!(lines(&events), vec!["start j1 [1] 1", "end j1"]);
    }

    #[test]
    fn test_transient_failure() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j1", 1, 0)], 2);
        let mut events = vec![];

        rt.fail("start j1", true);
        tick(&mut sched, "1-2", &mut events);
        assert_eq!(state(&sched, "j1"), JobState::Created);
        assert!(sched.jobs[0].last_err.is_some());
        assert!(events.is_empty());

        rt.fail("start j1", false);
        tick(&mut sched, "1-2", &mut events);
        assert_eq!(state(&sched, "j1"), JobState::Running);
        assert!(sched.jobs[0].last_err.is_none());
        assert_eq!(lines(&events), vec!["start j1 [1] 1"]);
        assert_eq!(rt.calls(), vec!["create j1", "start j1"]);
    }

    #[test]
    fn test_failed_pause_blocks_grants() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j1", 1, 0), job("j2", 2, 1), job("j3", 1, 2)], 3);
        let mut events = vec![];

        tick(&mut sched, "1-3", &mut events);
        assert_eq!(rt.cores("j1"), "1");
        assert_eq!(rt.cores("j2"), "2-3");

        // j2 must give up its cores but can't.
        rt.fail("pause j2", true);
        tick(&mut sched, "2-3", &mut events);
        assert_eq!(state(&sched, "j2"), JobState::Running);
        assert_eq!(state(&sched, "j1"), JobState::Running);
        assert_eq!(rt.cores("j1"), "1");

        rt.fail("pause j2", false);
        tick(&mut sched, "2-3", &mut events);
        assert_eq!(state(&sched, "j2"), JobState::Paused);
        assert_eq!(state(&sched, "j3"), JobState::Running);
        let mut used = CoreSet::new();
        for name in &["j1", "j3"] {
            let cores: CoreSet = rt.cores(name).parse().unwrap();
            assert!(used.is_disjoint(&cores));
            used |= cores;
        }
        assert_eq!(used.to_string(), "2-3");
    }

    #[test]
    fn test_failed_move_keeps_cores() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("x", 3, 0), job("y", 1, 1)], 4);
        let mut events = vec![];

        tick(&mut sched, "1-4", &mut events);
        assert_eq!(rt.cores("x"), "1-3");
        assert_eq!(rt.cores("y"), "4");

        tick(&mut sched, "2-3", &mut events);
        assert_eq!(state(&sched, "x"), JobState::Paused);
        assert_eq!(rt.cores("y"), "2");

        // y can't move back to 4 and still sits on a core x wants.
        rt.fail("resize y", true);
        tick(&mut sched, "1-4", &mut events);
        assert_eq!(state(&sched, "x"), JobState::Paused);
        assert_eq!(state(&sched, "y"), JobState::Running);
        assert_eq!(rt.cores("y"), "2");
        assert!(sched.jobs[1].last_err.is_some());

        rt.fail("resize y", false);
        tick(&mut sched, "1-4", &mut events);
        assert_eq!(state(&sched, "x"), JobState::Running);
        assert_eq!(rt.cores("x"), "1-3");
        assert_eq!(rt.cores("y"), "4");
        assert_eq!(sched.running_cores().to_string(), "1-4");
        assert_eq!(
            lines(&events),
            vec![
                "start x [1-3] 3",
                "start y [4] 1",
                "pause x",
                "update-cores y [2]",
                "update-cores y [4]",
                "unpause x",
            ]
        );
    }

    #[test]
    fn test_status_failure_freezes() {
        let _ = ::env_logger::try_init();
        let (mut sched, rt) = setup(vec![job("j1", 1, 0), job("j2", 1, 1)], 2);
        let mut events = vec![];

        tick(&mut sched, "1-2", &mut events);
        rt.fail("status j1", true);
        let before = rt.calls().len();
        tick(&mut sched, "2", &mut events);

        // j1 keeps core 1 untouched, j2 has nowhere to go.
        assert_eq!(state(&sched, "j1"), JobState::Running);
        assert_eq!(rt.cores("j1"), "1");
        assert_eq!(state(&sched, "j2"), JobState::Running);
        assert_eq!(rt.cores("j2"), "2");
        assert_eq!(rt.calls().len(), before);
        assert!(sched.jobs[0].last_err.is_some());
    }
}
