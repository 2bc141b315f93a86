// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use enum_iterator::IntoEnumIterator;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::CoreSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoEnumIterator, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Start,
    Pause,
    Unpause,
    UpdateCores,
    End,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Pause => "pause",
            EventKind::Unpause => "unpause",
            EventKind::UpdateCores => "update-cores",
            EventKind::End => "end",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One job transition. Formats as a log line:
///
///   <timestamp> <kind> <job> [<cpu-list>] <threads> duration=<secs>
///
/// with the optional fields left out when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Local>,
    pub kind: EventKind,
    pub job: String,
    pub cores: Option<CoreSet>,
    pub threads: Option<usize>,
    pub duration: Option<f64>,
}

impl Event {
    pub fn new(kind: EventKind, job: &str) -> Self {
        Self {
            at: Local::now(),
            kind,
            job: job.to_string(),
            cores: None,
            threads: None,
            duration: None,
        }
    }

    pub fn cores(mut self, cores: CoreSet) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn duration(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, false),
            self.kind,
            &self.job
        )?;
        if let Some(cores) = self.cores.as_ref() {
            write!(f, " [{}]", cores)?;
        }
        if let Some(threads) = self.threads {
            write!(f, " {}", threads)?;
        }
        if let Some(dur) = self.duration {
            write!(f, " duration={:.3}", dur)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventKind};
    use chrono::prelude::*;
    use enum_iterator::IntoEnumIterator;

    #[test]
    fn test_event_line() {
        let _ = ::env_logger::try_init();
        let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut ev = Event::new(EventKind::Start, "memcached")
            .cores("0".parse().unwrap())
            .threads(2);
        ev.at = at;
        let line = ev.to_string();
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields[1..], ["start", "memcached", "[0]", "2"]);
        assert_eq!(DateTime::parse_from_rfc3339(fields[0]).unwrap(), at);

        let mut ev = Event::new(EventKind::End, "radix").duration(12.5);
        ev.at = at;
        let line = ev.to_string();
        assert!(line.ends_with(" end radix duration=12.500"), "{}", line);

        let names: Vec<&str> = EventKind::into_enum_iter().map(|k| k.name()).collect();
        assert_eq!(names, ["start", "pause", "unpause", "update-cores", "end"]);
        assert_eq!(
            serde_json::to_string(&EventKind::UpdateCores).unwrap(),
            "\"update-cores\""
        );
    }
}
