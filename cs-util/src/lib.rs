// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::info;
use scan_fmt::scan_fmt;
use simplelog as sl;
use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub mod json_file;

pub use json_file::{
    JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave,
};

pub const TO_PCT: f64 = 100.0;

lazy_static::lazy_static! {
    pub static ref NR_SYSTEM_CPUS: usize = ::num_cpus::get();
}

pub fn nr_cpus() -> usize {
    *NR_SYSTEM_CPUS
}

/// Compact human readable duration, e.g. `300m` for 0.3 seconds and `2.5M`
/// for two and a half minutes.
pub fn format_duration(dur: f64) -> String {
    let format_nsecs_helper = |nsecs: u64, unit: u64, max: u64, suffix: &str| -> Option<String> {
        if nsecs == 0 {
            Some("0".to_string())
        } else if (nsecs as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (nsecs as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (nsecs as f64 / unit as f64) < max as f64 {
            Some(format!("{:.0}{}", nsecs as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let nsecs = (dur * 1_000_000_000.0).round() as u64;

    format_nsecs_helper(nsecs, 10_u64.pow(6), 1000, "m")
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9), 60, "s"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60, 60, "M"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60, 24, "H"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60 * 24, 365, "D"))
        .unwrap_or_else(|| "INF".into())
}

/// Parse durations in the format produced by `format_duration()`. Units can
/// be mixed and `_` is ignored, so `1M_30s` is 90 seconds. A bare number is
/// in seconds.
pub fn parse_duration(input: &str) -> Result<f64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, f64> = [
            ('u', 0.000_001),
            ('m', 0.001),
            ('s', 1.0),
            ('M', 60.0),
            ('H', 3600.0),
            ('D', 3600.0 * 24.0),
        ]
            .iter()
            .cloned()
            .collect();
    }

    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += num
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("invalid duration {:?}", input))?
                    * UNITS[&ch];
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += num
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid duration {:?}", input))?;
    }
    if sum < 0.0 {
        bail!("duration {:?} is negative", input);
    }
    Ok(sum)
}

/// Parse a Linux cpu-list string ("0", "1-3", "0,2-3") into sorted, deduped
/// cpu indices. An empty string is an empty list.
pub fn parse_cpu_list(input: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for tok in input.trim().split(',').map(|x| x.trim()).filter(|x| x.len() > 0) {
        if tok.contains('-') {
            let (lo, hi) = scan_fmt!(tok, "{d}-{d}", usize, usize)
                .map_err(|e| anyhow!("invalid cpu range {:?} ({})", tok, &e))?;
            if lo > hi {
                bail!("invalid cpu range {:?}", tok);
            }
            cpus.extend(lo..=hi);
        } else {
            cpus.push(
                tok.parse::<usize>()
                    .with_context(|| format!("invalid cpu {:?}", tok))?,
            );
        }
    }
    cpus.sort();
    cpus.dedup();
    Ok(cpus)
}

/// Inverse of `parse_cpu_list()`. Consecutive runs are collapsed into ranges.
pub fn format_cpu_list(cpus: &[usize]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut ranges: Vec<(usize, usize)> = vec![];
    for cpu in sorted {
        match ranges.last_mut() {
            Some(last) if last.1 + 1 == cpu => last.1 = cpu,
            _ => ranges.push((cpu, cpu)),
        }
    }

    ranges
        .iter()
        .map(|(lo, hi)| {
            if lo == hi {
                format!("{}", lo)
            } else {
                format!("{}-{}", lo, hi)
            }
        })
        .collect::<Vec<String>>()
        .join(",")
}

fn is_executable<P: AsRef<Path>>(path_in: P) -> bool {
    let path = path_in.as_ref();
    match path.metadata() {
        Ok(md) => md.is_file() && md.mode() & 0o111 != 0,
        Err(_) => false,
    }
}

pub fn find_bin<N: AsRef<OsStr>, P: AsRef<OsStr>>(
    name_in: N,
    prepend_in: Option<P>,
) -> Option<PathBuf> {
    let name = name_in.as_ref();
    let mut search = OsString::new();
    if let Some(prepend) = prepend_in.as_ref() {
        search.push(prepend);
        search.push(":");
    }
    if let Some(dirs) = env::var_os("PATH") {
        search.push(dirs);
    }
    for dir in env::split_paths(&search) {
        let mut path = dir.to_owned();
        path.push(name);
        if let Ok(path) = path.canonicalize() {
            if is_executable(&path) {
                return Some(path);
            }
        }
    }
    None
}

pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    let cmd_str = format!("{:?}", &cmd);

    match cmd.status() {
        Ok(rc) if rc.success() => Ok(()),
        Ok(rc) => bail!("{:?} ({:?}): {}", &cmd_str, &rc, emsg,),
        Err(e) => bail!("{:?} ({:?}): {}", &cmd_str, &e, emsg,),
    }
}

/// Output of a finished command. `stdout` and `stderr` are lossily decoded
/// and trimmed.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion and capture its output. Only failing to execute
/// is an error, a non-zero exit is reported through `success`.
pub fn command_output(cmd: &mut Command) -> Result<CommandOutput> {
    let cmd_str = format!("{:?}", &cmd);
    let output = cmd
        .output()
        .with_context(|| format!("failed to execute {}", &cmd_str))?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Error)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            if let Err(e) = sl::SimpleLogger::init(sl_level, lcfg.build()) {
                eprintln!("failed to initialize logging ({:?})", &e);
            }
        }
    }
}

struct GlobalProgState {
    exiting: bool,
}

lazy_static::lazy_static! {
    static ref PROG_STATE: Mutex<GlobalProgState> = Mutex::new(GlobalProgState {
        exiting: false,
    });
    static ref PROG_WAITQ: Condvar = Condvar::new();
}

pub fn setup_prog_state() -> Result<()> {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .context("Error setting term handler")
}

pub fn set_prog_exiting() {
    let mut state = PROG_STATE.lock().unwrap_or_else(|e| e.into_inner());
    state.exiting = true;
    PROG_WAITQ.notify_all();
}

pub fn prog_exiting() -> bool {
    PROG_STATE.lock().unwrap_or_else(|e| e.into_inner()).exiting
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

/// Sleep for `dur` unless the program starts exiting in the meantime.
pub fn wait_prog_state(dur: Duration) -> ProgState {
    let state = PROG_STATE.lock().unwrap_or_else(|e| e.into_inner());
    if state.exiting {
        return ProgState::Exiting;
    }

    let (state, _) = PROG_WAITQ
        .wait_timeout_while(state, dur, |st| !st.exiting)
        .unwrap_or_else(|e| e.into_inner());
    if state.exiting {
        ProgState::Exiting
    } else {
        ProgState::Running
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_format_duration() {
        for pair in &[
            (0.0, "0"),
            (0.00448, "4.5m"),
            (0.3, "300m"),
            (2.0, "2.0s"),
            (150.0, "2.5M"),
            (2042.0, "34.0M"),
            (3456000.0, "40.0D"),
        ] {
            let result = super::format_duration(pair.0);
            assert_eq!(&result, pair.1);
        }
    }

    #[test]
    fn test_parse_duration() {
        for pair in &[
            (0.3, "300m"),
            (1.0, "1"),
            (2.5, "2.5s"),
            (90.0, "1M_30s"),
            (90.0, "1M30"),
            (3600.5, "1H 500m"),
        ] {
            let result = super::parse_duration(pair.1).unwrap();
            assert!((pair.0 - result).abs() < 1e-9, "{} -> {}", pair.1, result);
        }
        assert!(super::parse_duration("abc").is_err());
        assert!(super::parse_duration("-1s").is_err());
    }

    #[test]
    fn test_cpu_list() {
        assert_eq!(super::parse_cpu_list("").unwrap(), Vec::<usize>::new());
        assert_eq!(super::parse_cpu_list("0").unwrap(), vec![0]);
        assert_eq!(super::parse_cpu_list("1-3").unwrap(), vec![1, 2, 3]);
        assert_eq!(super::parse_cpu_list("3, 0,1-2,2").unwrap(), vec![0, 1, 2, 3]);
        assert!(super::parse_cpu_list("3-1").is_err());
        assert!(super::parse_cpu_list("x").is_err());

        assert_eq!(super::format_cpu_list(&[]), "");
        assert_eq!(super::format_cpu_list(&[2]), "2");
        assert_eq!(super::format_cpu_list(&[3, 1, 2]), "1-3");
        assert_eq!(super::format_cpu_list(&[0, 2, 3, 5]), "0,2-3,5");
    }
}
