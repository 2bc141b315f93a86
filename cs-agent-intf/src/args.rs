// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use clap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use super::DFL_SERVICE_NAME;
use cs_util::*;

const HELP_BODY: &str = "\
Core-sharing agent.

cs-agent shares a small set of cores between a latency-critical service and a
queue of batch jobs. The service's cpu utilization is sampled every tick and
the service is switched between the narrow and wide core reservations of
TOPDIR/knobs.json. Whatever the service doesn't reserve is handed to the batch
jobs of TOPDIR/job-defs.json in tier order. Batch jobs run as docker
containers which are created, started, paused, resumed and resized on their
core sets as the reservation changes.

Job transitions are appended to TOPDIR/events.log and the current state is
reported in TOPDIR/report.json. The agent exits once all jobs are complete.
";

lazy_static! {
    static ref ARGS_STR: String = format!(
        "-d, --dir=[TOPDIR]     'Top-level dir for configuration, report and event log (default: {dfl_dir})'
         -t, --tick=[DUR]       'Control loop period (default: {dfl_tick})'
         -u, --high=[PCT]       'Switch to wide mode above this utilization (default: {dfl_high})'
         -l, --low=[PCT]        'Switch to narrow mode below this utilization (default: {dfl_low})'
         -w, --dwell=[DUR]      'Stay in wide mode at least this long (default: {dfl_dwell})'
         -W, --window=[NR]      'Number of utilization samples to average (default: {dfl_window})'
         -s, --service=[NAME]   'Process name of the latency-critical service (default: {dfl_service})'
         -r, --runtime-bin=[PATH] 'Container runtime binary (default: {dfl_runtime})'
         -a, --args=[FILE]      'Load base command line arguments from FILE'
             --remove           'Remove the batch job containers on exit'
             --dry-run          'Log the actions instead of touching the service and containers'
         -v...                  'Sets the level of verbosity'",
        dfl_dir = Args::default().dir,
        dfl_tick = format_duration(Args::default().tick),
        dfl_high = Args::default().high,
        dfl_low = Args::default().low,
        dfl_dwell = format_duration(Args::default().dwell),
        dfl_window = Args::default().window,
        dfl_service = Args::default().service,
        dfl_runtime = Args::default().runtime_bin,
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub dir: String,
    pub tick: f64,
    pub high: f64,
    pub low: f64,
    pub dwell: f64,
    pub window: usize,
    pub service: String,
    pub runtime_bin: String,

    #[serde(skip)]
    pub remove: bool,
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            dir: "/var/lib/cs-agent".into(),
            tick: 1.0,
            high: 80.0,
            low: 75.0,
            dwell: 5.0,
            window: 3,
            service: DFL_SERVICE_NAME.into(),
            runtime_bin: "docker".into(),
            remove: false,
            dry_run: false,
        }
    }
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if !self.tick.is_finite() || self.tick <= 0.0 {
            bail!("tick {} must be positive", self.tick);
        }
        if !self.dwell.is_finite() || self.dwell < 0.0 {
            bail!("dwell {} can't be negative", self.dwell);
        }
        if self.window == 0 {
            bail!("window must be at least 1");
        }
        if self.high <= 0.0 || self.high > 100.0 {
            bail!("high threshold {} out of (0, 100]", self.high);
        }
        if self.low < 0.0 || self.low >= self.high {
            bail!(
                "low threshold {} must be in [0, high threshold {})",
                self.low,
                self.high
            );
        }
        if self.service.is_empty() {
            bail!("service name can't be empty");
        }
        Ok(())
    }
}

impl JsonLoad for Args {
    fn loaded(&mut self) -> Result<()> {
        self.validate()
    }
}

impl JsonSave for Args {}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("cs-agent")
            .version(env!("CARGO_PKG_VERSION"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = Args::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("dir") {
            self.dir = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.dir.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("tick") {
            self.tick = if v.len() > 0 {
                parse_duration(v).context("parsing --tick")?
            } else {
                dfl.tick
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("high") {
            self.high = if v.len() > 0 {
                v.parse::<f64>().context("parsing --high")?
            } else {
                dfl.high
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("low") {
            self.low = if v.len() > 0 {
                v.parse::<f64>().context("parsing --low")?
            } else {
                dfl.low
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("dwell") {
            self.dwell = if v.len() > 0 {
                parse_duration(v).context("parsing --dwell")?
            } else {
                dfl.dwell
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("window") {
            self.window = if v.len() > 0 {
                v.parse::<usize>().context("parsing --window")?
            } else {
                dfl.window
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("service") {
            self.service = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.service.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("runtime-bin") {
            self.runtime_bin = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.runtime_bin.clone()
            };
            updated_base = true;
        }

        self.remove = matches.is_present("remove");
        self.dry_run = matches.is_present("dry-run");

        Ok(updated_base)
    }
}

#[cfg(test)]
mod tests {
    use super::Args;

    #[test]
    fn test_args_validate() {
        let _ = ::env_logger::try_init();
        Args::default().validate().unwrap();
        Args {
            dwell: 0.0,
            ..Default::default()
        }
        .validate()
        .unwrap();

        for args in &[
            Args {
                tick: 0.0,
                ..Default::default()
            },
            Args {
                tick: f64::INFINITY,
                ..Default::default()
            },
            Args {
                dwell: -1.0,
                ..Default::default()
            },
            Args {
                window: 0,
                ..Default::default()
            },
            Args {
                low: 80.0,
                ..Default::default()
            },
            Args {
                low: 90.0,
                ..Default::default()
            },
            Args {
                high: 120.0,
                ..Default::default()
            },
        ] {
            assert!(args.validate().is_err(), "{:?}", args);
        }
    }
}
