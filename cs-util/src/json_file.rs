// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

// Leading "//" and "#" lines are documentation. Strip them from the body but
// keep the line count so that serde error positions stay meaningful.
fn read_json<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let buf = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;

    let mut body = String::new();
    for line in buf.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with("#") {
            body += "\n";
        } else {
            body += line;
            body += "\n";
        }
    }
    Ok(body)
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    /// Called after a successful load, the place to validate.
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let body = read_json(&path)?;
        serde_json::from_str::<Self>(&body)
            .with_context(|| format!("parsing {:?}", path.as_ref()))
    }
}

pub trait JsonSave
where
    Self: Default + Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn maybe_create_dfl<P: AsRef<Path>>(path_in: P) -> Result<bool> {
        let path = path_in.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(&parent)?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                let data: Self = Default::default();
                f.write_all(data.as_json()?.as_ref())?;
                Ok(true)
            }
            Err(e) => match e.kind() {
                io::ErrorKind::AlreadyExists => Ok(false),
                _ => Err(e.into()),
            },
        }
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        match Self::preamble() {
            Some(pre) => Ok(pre + &serialized),
            None => Ok(serialized),
        }
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.write_all(self.as_json()?.as_ref())?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path_in: P) -> Result<Self> {
        let path = AsRef::<Path>::as_ref(&path_in);

        let mut data = T::load(&path)?;
        data.loaded()
            .with_context(|| format!("validating {:?}", path))?;

        Ok(Self {
            path: Some(PathBuf::from(path)),
            data,
        })
    }

    /// Load `path_opt`, writing out the defaults first if the file doesn't
    /// exist yet. Without a path, the defaults are used as-is.
    pub fn load_or_create<P: AsRef<Path>>(path_opt: Option<P>) -> Result<Self> {
        match path_opt {
            Some(path_in) => {
                let path = AsRef::<Path>::as_ref(&path_in);

                if T::maybe_create_dfl(&path)? {
                    info!("cfg: Created {:?}", &path);
                }

                Self::load(path)
            }
            None => {
                let mut data: T = Default::default();
                data.loaded()?;

                Ok(Self { path: None, data })
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = self.path.as_deref() {
            self.data.save(&path)
        } else {
            Ok(())
        }
    }
}

pub trait JsonArgs
where
    Self: JsonLoad + JsonSave,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<Self>, bool)>;
    fn save_args(args_file: &JsonConfigFile<Self>) -> Result<()>;
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T> JsonArgsHelper for T
where
    T: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<T>, bool)> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args"))?;
        let updated = args_file.data.process_cmdline(&matches)?;
        args_file.data.loaded()?;

        Ok((args_file, updated))
    }

    fn save_args(args_file: &JsonConfigFile<T>) -> Result<()> {
        if let Some(path) = args_file.path.as_deref() {
            info!("Updating command line arguments file {:?}", path);
            args_file.save()?;
        }
        Ok(())
    }

    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let (args_file, updated) = Self::init_args_and_logging_nosave()?;
        if updated {
            Self::save_args(&args_file)?;
        }
        Ok(args_file)
    }
}

/// A report file which is updated atomically. `commit()` writes to a
/// ".staging" sibling and renames it over the target.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: Option<PathBuf>,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path_opt: Option<P>) -> Self {
        let (path, staging) = match path_opt {
            Some(p) => {
                let pb = PathBuf::from(p.as_ref());
                let mut st = pb.clone().into_os_string();
                st.push(".staging");
                (Some(pb), PathBuf::from(st))
            }
            None => (None, PathBuf::new()),
        };

        Self {
            path,
            staging,
            data: Default::default(),
        }
    }

    pub fn commit(&self) -> Result<()> {
        let path = match self.path.as_ref() {
            Some(v) => v,
            None => return Ok(()),
        };

        self.data.save(&self.staging)?;
        fs::rename(&self.staging, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonConfigFile, JsonLoad, JsonReportFile, JsonSave};
    use anyhow::{bail, Result};
    use serde::{Deserialize, Serialize};
    use std::fs;
    use std::path::PathBuf;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Knobs {
        period: u32,
        name: String,
    }

    impl Default for Knobs {
        fn default() -> Self {
            Self {
                period: 5,
                name: "dfl".into(),
            }
        }
    }

    impl JsonLoad for Knobs {
        fn loaded(&mut self) -> Result<()> {
            if self.period == 0 {
                bail!("period can't be zero");
            }
            Ok(())
        }
    }

    impl JsonSave for Knobs {
        fn preamble() -> Option<String> {
            Some("//\n// test knobs\n//\n".into())
        }
    }

    fn scratch_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("cs-util-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn test_load_or_create_with_preamble() {
        let path = scratch_path("knobs.json");
        let _ = fs::remove_file(&path);

        let created = JsonConfigFile::<Knobs>::load_or_create(Some(&path)).unwrap();
        assert_eq!(created.data, Knobs::default());
        assert!(fs::read_to_string(&path).unwrap().starts_with("//\n// test knobs"));

        fs::write(&path, "// edited\n{ \"period\": 7 }\n").unwrap();
        let loaded = JsonConfigFile::<Knobs>::load(&path).unwrap();
        assert_eq!(loaded.data.period, 7);
        assert_eq!(loaded.data.name, "dfl");

        fs::write(&path, "{ \"period\": 0 }\n").unwrap();
        assert!(JsonConfigFile::<Knobs>::load(&path).is_err());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_report_commit() {
        let path = scratch_path("report.json");
        let mut rep = JsonReportFile::<Knobs>::new(Some(&path));
        rep.data.period = 11;
        rep.commit().unwrap();
        assert!(!rep.staging.exists());
        assert_eq!(Knobs::load(&path).unwrap().period, 11);
        let _ = fs::remove_file(&path);

        JsonReportFile::<Knobs>::new(Option::<&str>::None)
            .commit()
            .unwrap();
    }
}
