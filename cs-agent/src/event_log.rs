// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, error, info};
use std::fs::{self, File};
use std::io::prelude::*;
use std::path::PathBuf;

use cs_agent_intf::Event;

/// Destination of job transition events. Emitting never fails, sinks deal
/// with their own errors.
pub trait EventSink {
    fn emit(&mut self, ev: Event);
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, ev: Event) {
        self.push(ev);
    }
}

/// Appends one line per event to a file. A write failure disables the file
/// and the events are only logged from then on.
pub struct FileEventLog {
    path: PathBuf,
    file: Option<File>,
}

impl FileEventLog {
    pub fn new<P>(path: P) -> Result<Self>
    where
        PathBuf: std::convert::From<P>,
    {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        debug!("event-log: path={:?}", &path);
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Log-only sink.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
        }
    }
}

impl EventSink for FileEventLog {
    fn emit(&mut self, ev: Event) {
        let line = format!("{}\n", &ev);
        info!("event: {}", line.trim_end());

        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(line.as_ref()) {
                error!(
                    "event-log: Failed to write to {:?} ({:?}), disabling",
                    &self.path, &e
                );
                self.file = None;
            }
        }
    }
}
