// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::event_log::EventSink;
use super::service::LcService;
use cs_agent_intf::{CoreKnobs, CoreSet, Event, EventKind, Mode};
use cs_util::*;

/// Source of per-core utilization percentages.
pub trait UtilSource: Send {
    /// Busy percentage of each cpu since the previous call, indexed by cpu.
    fn sample(&mut self) -> Result<Vec<f64>>;
}

/// Reads per-cpu times from /proc/stat.
pub struct ProcStatSource {
    last: Option<Vec<(f64, f64)>>,
}

impl ProcStatSource {
    pub fn new() -> Self {
        let mut src = Self { last: None };
        if let Err(e) = src.sample() {
            warn!("monitor: Failed to prime /proc/stat sampling ({:?})", &e);
        }
        src
    }

    fn read_cpu_times() -> Result<Vec<(f64, f64)>> {
        let kstat = procfs::KernelStats::new()?;
        Ok(kstat
            .cpu_time
            .iter()
            .map(|cpu| {
                let iowait = cpu.iowait.map(|v| v as f64).unwrap_or(0.0);
                let total = cpu.user as f64
                    + cpu.nice as f64
                    + cpu.system as f64
                    + cpu.idle as f64
                    + iowait
                    + cpu.irq.map(|v| v as f64).unwrap_or(0.0)
                    + cpu.softirq.map(|v| v as f64).unwrap_or(0.0)
                    + cpu.steal.map(|v| v as f64).unwrap_or(0.0);
                let busy = total - cpu.idle as f64 - iowait;
                (busy, total)
            })
            .collect())
    }
}

impl UtilSource for ProcStatSource {
    fn sample(&mut self) -> Result<Vec<f64>> {
        let cur = Self::read_cpu_times()?;
        let last = match self.last.replace(cur.clone()) {
            Some(v) => v,
            None => bail!("no previous /proc/stat sample"),
        };

        Ok(cur
            .iter()
            .zip(last.iter())
            .map(|((busy, total), (last_busy, last_total))| {
                let dtotal = total - last_total;
                if dtotal > 0.0 {
                    ((busy - last_busy) / dtotal * TO_PCT).max(0.0).min(TO_PCT)
                } else {
                    0.0
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct MonitorParams {
    pub high: f64,
    pub low: f64,
    pub dwell: Duration,
    pub window: usize,
}

/// Decides the service mode from the utilization of its reserved cores.
///
/// Narrow switches to Wide as soon as the windowed utilization exceeds
/// `high`. Wide switches back to Narrow only after utilization has stayed
/// below `low` for `dwell`, counted from no earlier than entering Wide.
pub struct LoadMonitor {
    knobs: CoreKnobs,
    params: MonitorParams,
    source: Box<dyn UtilSource>,
    service: Box<dyn LcService>,

    mode: Mode,
    pending: Option<Mode>,
    low_since: Option<Instant>,
    samples: VecDeque<Vec<f64>>,
    util: f64,
}

impl LoadMonitor {
    pub fn new(
        knobs: CoreKnobs,
        params: MonitorParams,
        source: Box<dyn UtilSource>,
        service: Box<dyn LcService>,
    ) -> Self {
        Self {
            knobs,
            params,
            source,
            service,
            mode: Mode::Wide,
            pending: None,
            low_since: None,
            samples: VecDeque::new(),
            util: 0.0,
        }
    }

    pub fn knobs(&self) -> &CoreKnobs {
        &self.knobs
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pending(&self) -> Option<Mode> {
        self.pending
    }

    pub fn util(&self) -> f64 {
        self.util
    }

    pub fn reserved(&self) -> CoreSet {
        self.knobs.reserved(self.mode)
    }

    pub fn available(&self) -> CoreSet {
        self.knobs.available(self.mode)
    }

    fn aggregate(&self) -> f64 {
        let rsvd = self.reserved();
        if self.samples.is_empty() || rsvd.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|pcts| {
                rsvd.iter()
                    .map(|cpu| pcts.get(cpu).cloned().unwrap_or(0.0))
                    .sum::<f64>()
                    / rsvd.len() as f64
            })
            .sum();
        sum / self.samples.len() as f64
    }

    fn pin(&mut self, mode: Mode) -> Result<CoreSet> {
        let cores = self.knobs.reserved(mode);
        self.service.set_cores(&cores)?;
        Ok(cores)
    }

    /// Pin the service to the Wide reservation and announce it.
    pub fn start(&mut self, sink: &mut dyn EventSink) {
        if let Err(e) = self.pin(Mode::Wide) {
            warn!(
                "monitor: Failed to pin {:?} to {} mode ({:?})",
                self.service.name(),
                Mode::Wide,
                &e
            );
        }
        self.mode = Mode::Wide;
        self.low_since = None;
        let cores = self.reserved();
        info!(
            "monitor: {:?} starts in {} mode on [{}]",
            self.service.name(),
            self.mode,
            cores
        );
        sink.emit(
            Event::new(EventKind::Start, self.service.name())
                .cores(cores)
                .threads(cores.len()),
        );
    }

    /// Take a utilization sample and return the mode the service should be
    /// in. The transition isn't applied until `commit()`.
    pub fn sample(&mut self, now: Instant) -> Mode {
        match self.source.sample() {
            Ok(pcts) => {
                self.samples.push_back(pcts);
                while self.samples.len() > self.params.window {
                    self.samples.pop_front();
                }
            }
            Err(e) => {
                warn!("monitor: degraded sample, holding {} ({:?})", self.mode, &e);
                return self.mode;
            }
        }

        self.util = self.aggregate();
        debug!(
            "monitor: mode={} util={:.1}% low_since={:?}",
            self.mode, self.util, &self.low_since
        );

        match self.mode {
            Mode::Narrow => {
                self.low_since = None;
                if self.util > self.params.high {
                    Mode::Wide
                } else {
                    Mode::Narrow
                }
            }
            Mode::Wide => {
                if self.util < self.params.low {
                    let since = *self.low_since.get_or_insert(now);
                    if now.duration_since(since) >= self.params.dwell {
                        Mode::Narrow
                    } else {
                        Mode::Wide
                    }
                } else {
                    self.low_since = None;
                    Mode::Wide
                }
            }
        }
    }

    /// Apply `target`. Returns whether the service is now in `target`. On
    /// failure, the current mode is kept and the transition is left pending.
    pub fn commit(&mut self, target: Mode, sink: &mut dyn EventSink) -> bool {
        if target == self.mode {
            self.pending = None;
            return true;
        }

        match self.pin(target) {
            Ok(cores) => {
                info!(
                    "monitor: {} -> {} at {:.1}%, {:?} on [{}]",
                    self.mode,
                    target,
                    self.util,
                    self.service.name(),
                    cores
                );
                self.mode = target;
                self.pending = None;
                self.low_since = None;
                sink.emit(Event::new(EventKind::UpdateCores, self.service.name()).cores(cores));
                true
            }
            Err(e) => {
                warn!(
                    "monitor: Failed to switch {:?} to {} mode, will retry ({:?})",
                    self.service.name(),
                    target,
                    &e
                );
                self.pending = Some(target);
                false
            }
        }
    }

    /// Pin the service back to the Wide reservation.
    pub fn restore_default(&mut self, sink: &mut dyn EventSink) {
        match self.pin(Mode::Wide) {
            Ok(cores) => {
                self.mode = Mode::Wide;
                self.pending = None;
                sink.emit(Event::new(EventKind::UpdateCores, self.service.name()).cores(cores));
            }
            Err(e) => warn!(
                "monitor: Failed to restore {:?} to {} mode ({:?})",
                self.service.name(),
                Mode::Wide,
                &e
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{LcService, LoadMonitor, MonitorParams, UtilSource};
    use anyhow::{bail, Result};
    use cs_agent_intf::{CoreKnobs, CoreSet, Event, EventKind, Mode};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    // None entries fail the sample.
    pub(crate) struct TraceSource {
        pub trace: VecDeque<Option<Vec<f64>>>,
    }

    impl UtilSource for TraceSource {
        fn sample(&mut self) -> Result<Vec<f64>> {
            match self.trace.pop_front() {
                Some(Some(v)) => Ok(v),
                _ => bail!("trace exhausted"),
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct ServiceState {
        pub fail: bool,
        pub pins: Vec<CoreSet>,
    }

    pub(crate) struct FakeService {
        pub state: Arc<Mutex<ServiceState>>,
    }

    impl LcService for FakeService {
        fn name(&self) -> &str {
            "memcached"
        }

        fn set_cores(&mut self, cores: &CoreSet) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail {
                bail!("taskset failed");
            }
            state.pins.push(*cores);
            Ok(())
        }
    }

    fn setup(
        dwell: Duration,
        window: usize,
        trace: Vec<Option<Vec<f64>>>,
    ) -> (LoadMonitor, Arc<Mutex<ServiceState>>) {
        let state = Arc::new(Mutex::new(ServiceState::default()));
        let mon = LoadMonitor::new(
            CoreKnobs::default(),
            MonitorParams {
                high: 80.0,
                low: 75.0,
                dwell,
                window,
            },
            Box::new(TraceSource {
                trace: trace.into_iter().collect(),
            }),
            Box::new(FakeService {
                state: state.clone(),
            }),
        );
        (mon, state)
    }

    fn cpus(c0: f64, c1: f64) -> Option<Vec<f64>> {
        Some(vec![c0, c1, 100.0, 100.0])
    }

    #[test]
    fn test_mode_transitions() {
        let _ = ::env_logger::try_init();
        let dwell = Duration::from_secs(5);
        let (mut mon, state) = setup(
            dwell,
            1,
            vec![
                cpus(30.0, 30.0),
                cpus(30.0, 30.0),
                cpus(30.0, 30.0),
                cpus(90.0, 0.0),
            ],
        );
        let mut events: Vec<Event> = vec![];
        let t0 = Instant::now();

        mon.start(&mut events);
        assert_eq!(mon.mode(), Mode::Wide);
        assert_eq!(events[0].kind, EventKind::Start);
        assert_eq!(events[0].threads, Some(2));
        assert_eq!(events[0].cores.unwrap().to_string(), "0-1");

        // Low utilization must persist for the dwell period.
        assert_eq!(mon.sample(t0), Mode::Wide);
        assert_eq!(mon.sample(t0 + Duration::from_secs(3)), Mode::Wide);
        let target = mon.sample(t0 + dwell);
        assert_eq!(target, Mode::Narrow);
        assert!(mon.commit(target, &mut events));
        assert_eq!(mon.mode(), Mode::Narrow);
        assert_eq!(mon.available().to_string(), "1-3");
        assert_eq!(events[1].kind, EventKind::UpdateCores);
        assert_eq!(events[1].cores.unwrap().to_string(), "0");

        // Only cpu 0 counts in Narrow, and going up is immediate.
        assert_eq!(mon.sample(t0 + dwell), Mode::Wide);
        assert!((mon.util() - 90.0).abs() < 1e-9);

        let pins: Vec<String> = state.lock().unwrap().pins.iter().map(|c| c.to_string()).collect();
        assert_eq!(pins, vec!["0-1", "0"]);
    }

    #[test]
    fn test_hysteresis() {
        let _ = ::env_logger::try_init();
        let dwell = Duration::from_secs(10);
        let trace: Vec<Option<Vec<f64>>> = (0..40)
            .map(|i| {
                let pct = if i % 2 == 0 { 78.0 } else { 84.0 };
                cpus(pct, pct)
            })
            .collect();
        let (mut mon, _state) = setup(dwell, 1, trace);
        let mut events: Vec<Event> = vec![];
        mon.start(&mut events);
        assert!(mon.commit(Mode::Narrow, &mut events));

        let t0 = Instant::now();
        let mut flips = 0;
        for i in 0..40 {
            let now = t0 + Duration::from_millis(500 * i);
            let before = mon.mode();
            let target = mon.sample(now);
            mon.commit(target, &mut events);
            if mon.mode() != before {
                flips += 1;
            }
        }
        // 40 samples span two dwell windows, the only flip is to Wide.
        assert_eq!(flips, 1);
        assert_eq!(mon.mode(), Mode::Wide);
    }

    #[test]
    fn test_window_average() {
        let _ = ::env_logger::try_init();
        let (mut mon, _state) = setup(
            Duration::from_secs(0),
            2,
            vec![cpus(100.0, 100.0), cpus(40.0, 40.0), cpus(60.0, 60.0)],
        );
        let now = Instant::now();
        mon.sample(now);
        mon.sample(now);
        assert!((mon.util() - 70.0).abs() < 1e-9);
        assert_eq!(mon.sample(now), Mode::Narrow);
        assert!((mon.util() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_and_failed_commit() {
        let _ = ::env_logger::try_init();
        let (mut mon, state) = setup(
            Duration::from_secs(0),
            1,
            vec![None, cpus(10.0, 10.0), cpus(10.0, 10.0)],
        );
        let mut events: Vec<Event> = vec![];
        let now = Instant::now();
        mon.start(&mut events);

        assert_eq!(mon.sample(now), Mode::Wide);

        state.lock().unwrap().fail = true;
        let target = mon.sample(now);
        assert_eq!(target, Mode::Narrow);
        assert!(!mon.commit(target, &mut events));
        assert_eq!(mon.mode(), Mode::Wide);
        assert_eq!(mon.pending(), Some(Mode::Narrow));
        assert_eq!(events.len(), 1);

        state.lock().unwrap().fail = false;
        let target = mon.sample(now);
        assert!(mon.commit(target, &mut events));
        assert_eq!(mon.mode(), Mode::Narrow);
        assert_eq!(mon.pending(), None);

        mon.restore_default(&mut events);
        assert_eq!(mon.mode(), Mode::Wide);
        assert_eq!(events.last().unwrap().kind, EventKind::UpdateCores);
        assert_eq!(events.last().unwrap().cores.unwrap().to_string(), "0-1");
    }
}
