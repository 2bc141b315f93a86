// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use enum_iterator::IntoEnumIterator;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::CoreSet;
use cs_util::*;

const KNOBS_DOC: &str = "\
//
// cs-agent core layout
//
// The cores [0, nr_cores) are split between the latency-critical service and
// batch jobs. Each mode reserves a set of cores for the service and the rest
// is available to batch jobs. wide_cores must be a strict superset of
// narrow_cores and leave at least one core for batch jobs.
//
//  nr_cores: Number of cores under management [1..64]
//  narrow_cores[]: Cores reserved for the service in Narrow mode
//  wide_cores[]: Cores reserved for the service in Wide mode
//
";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoEnumIterator, Serialize, Deserialize,
)]
pub enum Mode {
    Narrow,
    Wide,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Wide
    }
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Narrow => "narrow",
            Mode::Wide => "wide",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreKnobs {
    pub nr_cores: usize,
    pub narrow_cores: Vec<usize>,
    pub wide_cores: Vec<usize>,
}

impl Default for CoreKnobs {
    fn default() -> Self {
        Self {
            nr_cores: 4,
            narrow_cores: vec![0],
            wide_cores: vec![0, 1],
        }
    }
}

impl CoreKnobs {
    fn reserved_list(&self, mode: Mode) -> &[usize] {
        match mode {
            Mode::Narrow => &self.narrow_cores,
            Mode::Wide => &self.wide_cores,
        }
    }

    fn check_reserved(&self, mode: Mode) -> Result<CoreSet> {
        let mut set = CoreSet::new();
        for &core in self.reserved_list(mode).iter() {
            if core >= self.nr_cores {
                bail!(
                    "{} mode core {} is outside [0, {})",
                    mode,
                    core,
                    self.nr_cores
                );
            }
            if !set.insert(core) {
                bail!("{} mode core {} is listed more than once", mode, core);
            }
        }
        if set.is_empty() {
            bail!("{} mode reserves no core for the service", mode);
        }
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_cores == 0 || self.nr_cores > CoreSet::MAX_CORES {
            bail!(
                "nr_cores {} must be in [1, {}]",
                self.nr_cores,
                CoreSet::MAX_CORES
            );
        }

        let narrow = self.check_reserved(Mode::Narrow)?;
        let wide = self.check_reserved(Mode::Wide)?;

        if !narrow.is_subset(&wide) || narrow == wide {
            bail!(
                "wide cores [{}] must be a strict superset of narrow cores [{}]",
                wide,
                narrow
            );
        }
        if wide == self.universe() {
            bail!("wide mode leaves no core for batch jobs");
        }
        Ok(())
    }

    pub fn universe(&self) -> CoreSet {
        CoreSet::universe(self.nr_cores)
    }

    /// Cores reserved for the service in `mode`. Entries outside the
    /// universe are ignored, `validate()` rejects them.
    pub fn reserved(&self, mode: Mode) -> CoreSet {
        let mut set = CoreSet::new();
        for &core in self.reserved_list(mode).iter() {
            if core < self.nr_cores {
                set.insert(core);
            }
        }
        set
    }

    pub fn available(&self, mode: Mode) -> CoreSet {
        self.universe() - self.reserved(mode)
    }

    /// The most cores batch jobs can ever hold.
    pub fn batch_capacity(&self) -> usize {
        Mode::into_enum_iter()
            .map(|mode| self.available(mode).len())
            .max()
            .unwrap_or(0)
    }

    pub fn warn_nr_system_cpus(&self) -> Option<String> {
        if self.nr_cores > nr_cpus() {
            Some(format!(
                "nr_cores {} exceeds the {} cpus on this system",
                self.nr_cores,
                nr_cpus()
            ))
        } else {
            None
        }
    }
}

impl JsonLoad for CoreKnobs {
    fn loaded(&mut self) -> Result<()> {
        self.validate()
    }
}

impl JsonSave for CoreKnobs {
    fn preamble() -> Option<String> {
        Some(KNOBS_DOC.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreKnobs, Mode};
    use enum_iterator::IntoEnumIterator;

    #[test]
    fn test_partition() {
        let _ = ::env_logger::try_init();
        let knobs = CoreKnobs::default();
        knobs.validate().unwrap();

        for mode in Mode::into_enum_iter() {
            let rsvd = knobs.reserved(mode);
            let avail = knobs.available(mode);
            assert!(rsvd.is_disjoint(&avail), "{}", mode);
            assert_eq!(rsvd | avail, knobs.universe(), "{}", mode);
        }
        assert_eq!(knobs.available(Mode::Narrow).to_string(), "1-3");
        assert_eq!(knobs.available(Mode::Wide).to_string(), "2-3");
        assert_eq!(knobs.batch_capacity(), 3);
        assert_eq!(Mode::default(), Mode::Wide);
    }

    #[test]
    fn test_validate() {
        let _ = ::env_logger::try_init();
        let dfl = CoreKnobs::default();

        let bad = vec![
            CoreKnobs {
                nr_cores: 0,
                ..dfl.clone()
            },
            CoreKnobs {
                nr_cores: 65,
                ..dfl.clone()
            },
            CoreKnobs {
                wide_cores: vec![0, 4],
                ..dfl.clone()
            },
            CoreKnobs {
                wide_cores: vec![0, 1, 1],
                ..dfl.clone()
            },
            CoreKnobs {
                wide_cores: vec![0],
                ..dfl.clone()
            },
            CoreKnobs {
                narrow_cores: vec![2],
                ..dfl.clone()
            },
            CoreKnobs {
                narrow_cores: vec![],
                ..dfl.clone()
            },
            CoreKnobs {
                wide_cores: vec![0, 1, 2, 3],
                ..dfl.clone()
            },
        ];
        for knobs in bad.iter() {
            assert!(knobs.validate().is_err(), "{:?}", knobs);
        }

        CoreKnobs {
            nr_cores: 8,
            narrow_cores: vec![0, 1],
            wide_cores: vec![0, 1, 2, 3],
        }
        .validate()
        .unwrap();
    }
}
