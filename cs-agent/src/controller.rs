// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::event_log::EventSink;
use super::monitor::LoadMonitor;
use super::scheduler::Scheduler;
use cs_agent_intf::Report;
use cs_util::*;

pub struct Controller {
    monitor: LoadMonitor,
    sched: Scheduler,
    sink: Box<dyn EventSink>,
    report_file: JsonReportFile<Report>,
    tick: Duration,
    remove: bool,
    seq: u64,
}

impl Controller {
    pub fn new(
        monitor: LoadMonitor,
        sched: Scheduler,
        sink: Box<dyn EventSink>,
        report_path: Option<PathBuf>,
        tick: Duration,
        remove: bool,
    ) -> Self {
        Self {
            monitor,
            sched,
            sink,
            report_file: JsonReportFile::new(report_path),
            tick,
            remove,
            seq: 0,
        }
    }

    /// One control period. When the service is about to take more cores,
    /// batch jobs are moved off them first. Otherwise the service shrinks
    /// first and batch jobs expand into the freed cores.
    pub fn step(&mut self, now: Instant) {
        let sink = self.sink.as_mut();
        let cur = self.monitor.mode();
        let target = self.monitor.sample(now);
        let knobs = self.monitor.knobs();

        if knobs.reserved(target).len() > knobs.reserved(cur).len() {
            let avail = knobs.available(target);
            if self.sched.tick(avail, sink) {
                self.monitor.commit(target, sink);
            } else {
                warn!(
                    "ctl: Batch jobs are still outside [{}], deferring {} -> {}",
                    avail, cur, target
                );
            }
        } else {
            self.monitor.commit(target, sink);
            self.sched.tick(self.monitor.available(), sink);
        }
        self.seq += 1;
    }

    fn commit_report(&mut self) {
        let rep = &mut self.report_file.data;
        rep.timestamp = Local::now();
        rep.seq = self.seq;
        rep.mode = self.monitor.mode();
        rep.pending_mode = self.monitor.pending();
        rep.reserved = self.monitor.reserved();
        rep.available = self.monitor.available();
        rep.util = self.monitor.util();
        rep.jobs = self.sched.report();

        if let Err(e) = self.report_file.commit() {
            warn!("ctl: Failed to commit report ({:?})", &e);
        }
    }

    fn shutdown(&mut self) {
        info!("ctl: Restoring the service to its default cores");
        self.monitor.restore_default(self.sink.as_mut());
        if self.remove {
            info!("ctl: Removing batch job instances");
            self.sched.remove_all();
        }
        self.commit_report();
    }

    pub fn run(&mut self) {
        self.monitor.start(self.sink.as_mut());

        loop {
            let started_at = Instant::now();
            self.step(started_at);
            self.commit_report();

            if self.sched.is_done() {
                info!("ctl: All batch jobs are complete");
                break;
            }

            let elapsed = started_at.elapsed();
            debug!(
                "ctl: Tick {} took {}",
                self.seq,
                format_duration(elapsed.as_secs_f64())
            );
            if wait_prog_state(self.tick.checked_sub(elapsed).unwrap_or_default())
                == ProgState::Exiting
            {
                break;
            }
        }

        self.shutdown();
    }
}
