//! Configuration tree loader (spec §6). TOML is the sole source; the raw
//! deserialize shape mirrors the file layout with every field optional,
//! then gets validated/defaulted into the strict [`Config`] the rest of
//! the runtime actually reads.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{0}': {1}")]
    Io(String, String),
    #[error("parsing config: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// The bootstrap fields required at `/...` per spec §6, plus the
/// `/activeapps` and `/apps/<name>` subtrees.
#[derive(Debug, Clone)]
pub struct Config {
    pub router_name: String,
    pub domain: String,
    pub username: String,
    pub passwd: String,
    pub port: u16,
    pub unixpath: String,
    pub logfile: String,
    pub loglevel: LogLevel,
    pub syslog: String,
    pub actlog: String,
    pub client: ClientConfig,
    pub log_protect: Vec<String>,
    pub activeapps: Vec<String>,
    pub apps: IndexMap<String, AppConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Activity,
    Debug,
    Internal,
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "ERROR" => LogLevel::Error,
            "WARNING" => LogLevel::Warning,
            "INFO" => LogLevel::Info,
            "ACTIVITY" => LogLevel::Activity,
            "DEBUG" => LogLevel::Debug,
            "INTERNAL" => LogLevel::Internal,
            other => return Err(ConfigError::InvalidValue("loglevel".into(), other.to_owned())),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_requests: u32,
    pub min_children: u32,
    pub max_children: u32,
    pub max_backlog_queue: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_requests: 1000,
            min_children: 3,
            max_children: 30,
            max_backlog_queue: 1000,
        }
    }
}

/// `/apps/<name>`: only `language = "c"` is launched by this runtime
/// (spec §6) — other languages are recognized but `service-ctl` skips
/// them at `start_all` time.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub language: String,
    pub implementation: String,
    pub settings: BTreeMap<String, toml::Value>,
}

impl AppConfig {
    pub fn is_launchable(&self) -> bool {
        self.language.eq_ignore_ascii_case("c")
    }
}

pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
    raw.validate()
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    router_name: Option<String>,
    domain: Option<String>,
    username: Option<String>,
    passwd: Option<String>,
    port: Option<u16>,
    unixpath: Option<String>,
    logfile: Option<String>,
    loglevel: Option<String>,
    syslog: Option<String>,
    actlog: Option<String>,
    client: Option<RawClientConfig>,
    log_protect: Option<RawLogProtect>,
    activeapps: Option<RawActiveApps>,
    apps: Option<IndexMap<String, RawAppConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawClientConfig {
    max_requests: Option<u32>,
    min_children: Option<u32>,
    max_children: Option<u32>,
    max_backlog_queue: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLogProtect {
    match_string: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawActiveApps {
    appname: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawAppConfig {
    language: Option<String>,
    implementation: Option<String>,
    #[serde(flatten)]
    settings: BTreeMap<String, toml::Value>,
}

impl RawConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        let req = |field: &str, value: Option<String>| value.ok_or_else(|| ConfigError::MissingField(field.to_owned()));

        let router_name = req("router_name", self.router_name)?;
        let domain = req("domain", self.domain)?;
        let username = req("username", self.username)?;
        let passwd = req("passwd", self.passwd)?;
        let port = self.port.ok_or_else(|| ConfigError::MissingField("port".to_owned()))?;
        let unixpath = req("unixpath", self.unixpath)?;
        let logfile = req("logfile", self.logfile)?;
        let loglevel: LogLevel = req("loglevel", self.loglevel)?.parse()?;
        let syslog = req("syslog", self.syslog)?;
        let actlog = req("actlog", self.actlog)?;

        let log_protect = self
            .log_protect
            .and_then(|lp| lp.match_string)
            .ok_or_else(|| ConfigError::MissingField("log_protect/match_string".to_owned()))?;

        let activeapps = self.activeapps.and_then(|a| a.appname).unwrap_or_default();

        let client = self
            .client
            .map(|c| ClientConfig {
                max_requests: c.max_requests.unwrap_or_else(|| ClientConfig::default().max_requests),
                min_children: c.min_children.unwrap_or_else(|| ClientConfig::default().min_children),
                max_children: c.max_children.unwrap_or_else(|| ClientConfig::default().max_children),
                max_backlog_queue: c.max_backlog_queue.unwrap_or_else(|| ClientConfig::default().max_backlog_queue),
            })
            .unwrap_or_default();

        let mut apps = IndexMap::new();
        for (name, raw_app) in self.apps.unwrap_or_default() {
            let language = raw_app
                .language
                .ok_or_else(|| ConfigError::MissingField(format!("apps.{name}.language")))?;
            let implementation = raw_app
                .implementation
                .ok_or_else(|| ConfigError::MissingField(format!("apps.{name}.implementation")))?;
            apps.insert(
                name,
                AppConfig {
                    language,
                    implementation,
                    settings: raw_app.settings,
                },
            );
        }

        Ok(Config {
            router_name,
            domain,
            username,
            passwd,
            port,
            unixpath,
            logfile,
            loglevel,
            syslog,
            actlog,
            client,
            log_protect,
            activeapps,
            apps,
        })
    }
}
