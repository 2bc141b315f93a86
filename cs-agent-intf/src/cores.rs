// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops;
use std::str::FromStr;

use cs_util::*;

/// A set of logical cpu indices below `CoreSet::MAX_CORES`. The text form,
/// also used for serialization, is the Linux cpu-list syntax.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CoreSet(u64);

impl CoreSet {
    pub const MAX_CORES: usize = 64;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_cores(cores: &[usize]) -> Result<Self> {
        let mut set = Self::new();
        for &core in cores.iter() {
            if core >= Self::MAX_CORES {
                bail!("cpu {} out of range, max {}", core, Self::MAX_CORES - 1);
            }
            set.insert(core);
        }
        Ok(set)
    }

    /// `[0, nr_cores)`
    pub fn universe(nr_cores: usize) -> Self {
        assert!(nr_cores <= Self::MAX_CORES);
        match nr_cores {
            Self::MAX_CORES => Self(u64::MAX),
            n => Self((1u64 << n) - 1),
        }
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, core: usize) -> bool {
        core < Self::MAX_CORES && self.0 & (1 << core) != 0
    }

    pub fn insert(&mut self, core: usize) -> bool {
        assert!(core < Self::MAX_CORES);
        let was = self.contains(core);
        self.0 |= 1 << core;
        !was
    }

    pub fn is_subset(&self, other: &CoreSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn is_disjoint(&self, other: &CoreSet) -> bool {
        self.0 & other.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..Self::MAX_CORES).filter(move |i| bits & (1 << i) != 0)
    }

    /// The lowest `nr` cores of the set, or all of them if there are fewer.
    pub fn lowest(&self, nr: usize) -> CoreSet {
        let mut set = CoreSet::new();
        for core in self.iter().take(nr) {
            set.insert(core);
        }
        set
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

impl ops::BitOr for CoreSet {
    type Output = CoreSet;
    fn bitor(self, rhs: CoreSet) -> CoreSet {
        CoreSet(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for CoreSet {
    fn bitor_assign(&mut self, rhs: CoreSet) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for CoreSet {
    type Output = CoreSet;
    fn bitand(self, rhs: CoreSet) -> CoreSet {
        CoreSet(self.0 & rhs.0)
    }
}

impl ops::Sub for CoreSet {
    type Output = CoreSet;
    fn sub(self, rhs: CoreSet) -> CoreSet {
        CoreSet(self.0 & !rhs.0)
    }
}

impl ops::SubAssign for CoreSet {
    fn sub_assign(&mut self, rhs: CoreSet) {
        self.0 &= !rhs.0;
    }
}

impl fmt::Display for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format_cpu_list(&self.to_vec()))
    }
}

impl fmt::Debug for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CoreSet[{}]", self)
    }
}

impl FromStr for CoreSet {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Self::from_cores(&parse_cpu_list(input)?)
    }
}

impl Serialize for CoreSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CoreSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<CoreSet>().map_err(de::Error::custom)
    }
}
