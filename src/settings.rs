extern crate ini;

use self::ini::Ini;
use crate::error::{Error, Result};
use crc16::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::Sender;

pub const DEFAULT_CONFIG: &str = "wemod.conf";
pub const WATCH_INTERVAL_SECS: f32 = 2.0; //secs between config file checks

pub struct Settings {
    ini: Ini,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let ini = Ini::load_from_file(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Ok(Self { ini })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { ini })
    }

    pub fn empty() -> Self {
        Self { ini: Ini::new() }
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.ini.section(Some(section.to_owned())).is_some()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.ini
            .section(Some(section.to_owned()))
            .and_then(|s| s.get(key))
            .map(|v| v.trim().to_string())
    }

    pub fn get_bool(&self, section: &str, key: &str) -> bool {
        match self.get(section, key) {
            Some(v) => matches!(
                v.to_ascii_lowercase().as_str(),
                "true" | "yes" | "on" | "1"
            ),
            None => false,
        }
    }

    pub fn get_parsed<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>> {
        match self.get(section, key) {
            Some(v) => match v.parse::<T>() {
                Ok(parsed) => Ok(Some(parsed)),
                Err(_) => Err(Error::Config(format!(
                    "{}.{}: cannot parse {:?}",
                    section, key, v
                ))),
            },
            None => Ok(None),
        }
    }

    //reads a humantime duration like `3s` or `1m 30s`
    pub fn get_duration(&self, section: &str, key: &str) -> Result<Option<Duration>> {
        match self.get(section, key) {
            Some(v) => match humantime::parse_duration(&v) {
                Ok(d) => Ok(Some(d)),
                Err(e) => Err(Error::Config(format!("{}.{}: {}", section, key, e))),
            },
            None => Ok(None),
        }
    }

    pub fn get_list(&self, section: &str, key: &str) -> Vec<String> {
        match self.get(section, key) {
            Some(v) => v
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            None => vec![],
        }
    }

    pub fn duration_or(&self, section: &str, key: &str, default: Duration) -> Duration {
        match self.get_duration(section, key) {
            Ok(Some(d)) => d,
            Ok(None) => default,
            Err(e) => {
                warn!("{}, using {:?}", e, default);
                default
            }
        }
    }
}

pub struct Watcher {
    pub name: String,
    pub path: PathBuf,
    pub transmitter: Sender<Settings>,
    last_modified: Option<SystemTime>,
    last_len: u64,
    last_crc: Option<u16>,
    primed: bool,
}

impl Watcher {
    pub fn new(path: PathBuf, transmitter: Sender<Settings>) -> Self {
        let mut watcher = Self {
            name: "settings".into(),
            path,
            transmitter,
            last_modified: None,
            last_len: 0,
            last_crc: None,
            primed: false,
        };
        //remember the state we started with, so only later edits trigger a reload
        if let Err(e) = watcher.poll() {
            warn!(
                "{}: cannot read {} at startup: {}",
                watcher.name,
                watcher.path.display(),
                e
            );
        }
        watcher.primed = true;
        watcher
    }

    //returns the new file content when it differs from the last seen one
    pub fn poll(&mut self) -> std::io::Result<Option<String>> {
        let meta = std::fs::metadata(&self.path)?;
        let modified = meta.modified().ok();
        if self.last_crc.is_some() && modified == self.last_modified && meta.len() == self.last_len
        {
            return Ok(None);
        }
        self.last_modified = modified;
        self.last_len = meta.len();

        let content = std::fs::read(&self.path)?;
        let crc = State::<ARC>::calculate(&content);
        if self.last_crc == Some(crc) {
            trace!("{}: {} touched, content unchanged", self.name, self.path.display());
            return Ok(None);
        }
        //the startup read is the baseline, a later first read is already a change
        let baseline = self.last_crc.is_none() && !self.primed;
        self.last_crc = Some(crc);
        if baseline {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&content).into_owned()))
    }

    pub async fn worker(&mut self, worker_cancel_flag: Arc<AtomicBool>) {
        info!("{}: watching {}", self.name, self.path.display());
        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                debug!("{}: Got terminate signal from main", self.name);
                break;
            }

            match self.poll() {
                Ok(Some(content)) => match Settings::parse(&content) {
                    Ok(settings) => {
                        info!("⚙️ {}: {} changed, reloading", self.name, self.path.display());
                        if self.transmitter.send(settings).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("{}: ignoring broken config: {}", self.name, e);
                    }
                },
                Ok(None) => (),
                Err(e) => {
                    error!("{}: cannot check {}: {:?}", self.name, self.path.display(), e);
                }
            }

            tokio::time::sleep(Duration::from_secs_f32(WATCH_INTERVAL_SECS)).await;
        }
        info!("{}: Stopping task", self.name);
    }
}
