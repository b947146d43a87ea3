use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use cgroup_rules::DEFAULT_RULES_FILE;
use ini::Ini;
use proc_connector::ChannelOptions;
use thiserror::Error;

use super::resolver::DEFAULT_PROC_ROOT;
use crate::cli::CgredOpts;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/cgrulesd.ini";
pub const DEFAULT_LOG_FILE: &str = "/var/log/cgrulesd.log";

const MIN_RECV_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    NotFound(String),
    #[error("error loading configuration from {path}")]
    Load {
        path: String,
        #[source]
        source: ini::Error,
    },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

/// Key/value pairs of one INI section.
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    name: String,
    inner: HashMap<String, String>,
}

impl SectionConfig {
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(key)
            .map(|value| self.parse(key, value))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` when missing.
    pub fn with_default<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn field(&self, key: &str) -> String {
        format!("{}.{key}", self.name)
    }

    fn parse<T>(&self, key: &str, value: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        T::from_str(value).map_err(|err| ConfigError::InvalidValue {
            field: self.field(key),
            value: value.to_string(),
            err: err.to_string(),
        })
    }
}

/// Daemon configuration backed by an `INI` file.
#[derive(Debug, Clone, Default)]
pub struct CgredConfig {
    sections: HashMap<String, SectionConfig>,
}

impl CgredConfig {
    /// Loads `custom_file`, which must exist, or the default file when
    /// present. Without any file every setting has its default value.
    pub fn load(custom_file: Option<&Path>) -> Result<Self, ConfigError> {
        match custom_file {
            Some(path) if !path.exists() => {
                Err(ConfigError::NotFound(path.display().to_string()))
            }
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    log::debug!("{DEFAULT_CONFIG_FILE} not found, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let conf = Ini::load_from_file(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_ini(&conf))
    }

    pub fn from_ini(conf: &Ini) -> Self {
        let mut sections: HashMap<String, SectionConfig> = HashMap::new();
        for (section, prop) in conf {
            let Some(section) = section else {
                continue;
            };
            let entry = sections
                .entry(section.to_string())
                .or_insert_with(|| SectionConfig {
                    name: section.to_string(),
                    inner: HashMap::new(),
                });
            for (key, value) in prop.iter() {
                log::debug!("{}.{}={}", section, key, value);
                entry.inner.insert(key.to_string(), value.to_string());
            }
        }
        Self { sections }
    }

    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections.get(name).cloned().unwrap_or_else(|| SectionConfig {
            name: name.to_string(),
            inner: HashMap::new(),
        })
    }
}

/// Effective settings after merging the configuration file and the command
/// line. Flags win over file values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub daemonize: bool,
    pub logging: bool,
    pub log_file: PathBuf,
    pub proc_root: PathBuf,
    pub rules_file: PathBuf,
    /// `None` means the cgroup2 mount point is detected at startup.
    pub cgroup_root: Option<PathBuf>,
    pub use_cache: bool,
    pub channel: ChannelOptions,
}

impl DaemonSettings {
    pub fn resolve(config: &CgredConfig, opts: &CgredOpts) -> Result<Self, ConfigError> {
        let daemon = config.section("daemon");
        let engine = config.section("engine");
        let channel = config.section("channel");

        let recv_buffer =
            channel.with_default("recv_buffer", ChannelOptions::default().recv_buffer)?;
        if recv_buffer < MIN_RECV_BUFFER {
            return Err(ConfigError::InvalidValue {
                field: "channel.recv_buffer".to_string(),
                value: recv_buffer.to_string(),
                err: format!("must be at least {MIN_RECV_BUFFER} bytes"),
            });
        }

        Ok(Self {
            daemonize: !opts.nodaemon && daemon.with_default("daemonize", true)?,
            logging: !opts.nolog && daemon.with_default("logging", true)?,
            log_file: match &opts.log {
                Some(path) => path.clone(),
                None => daemon.with_default("log_file", PathBuf::from(DEFAULT_LOG_FILE))?,
            },
            proc_root: daemon.with_default("proc_root", PathBuf::from(DEFAULT_PROC_ROOT))?,
            rules_file: match &opts.rules {
                Some(path) => path.clone(),
                None => engine.with_default("rules_file", PathBuf::from(DEFAULT_RULES_FILE))?,
            },
            cgroup_root: engine.optional("cgroup_root")?,
            use_cache: engine.with_default("use_cache", true)?,
            channel: ChannelOptions {
                recv_buffer,
                socket_rcvbuf: channel.optional("socket_rcvbuf")?,
            },
        })
    }
}
