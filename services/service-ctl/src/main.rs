//! service-ctl: starts and stops the processes behind each configured
//! service, tracking each one by a PID file (spec.md §6).
//!
//! This mirrors what the original `opensrf_ctl.pl` actually does: fork/exec
//! the binary named by a service's `implementation` setting and remember its
//! pid. It does not itself host an `osrf-dispatch` registry — this port's
//! application methods are Rust closures compiled into a specific service
//! binary (see `osrf-dispatch::registry`'s note on why shared-library
//! loading has no counterpart here), so `service-ctl` only ever supervises
//! whatever binary a service's config entry names.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use clap::{Arg, ArgAction, Command as ClapCommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use osrf_config::{AppConfig, Config};
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum CtlError {
    #[error("loading config: {0}")]
    Config(#[from] osrf_config::ConfigError),
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("service '{0}' is not a launchable (language=\"c\") application")]
    NotLaunchable(String),
    #[error("reading pid file '{0}': {1}")]
    PidFileRead(String, String),
    #[error("writing pid file '{0}': {1}")]
    PidFileWrite(String, String),
    #[error("pid file '{0}' holds a non-numeric pid: {1}")]
    BadPid(String, String),
    #[error("spawning '{implementation}' for service '{service}': {source}")]
    Spawn {
        service: String,
        implementation: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sending signal to pid {0}: {1}")]
    Signal(i32, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    StartAll,
    Stop,
    StopAll,
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "start" => Action::Start,
            "start_all" => Action::StartAll,
            "stop" => Action::Stop,
            "stop_all" => Action::StopAll,
            other => return Err(format!("unrecognized action '{other}' (expected start, start_all, stop, or stop_all)")),
        })
    }
}

struct Args {
    host: String,
    configfile: PathBuf,
    context: String,
    piddir: PathBuf,
    action: Action,
    service: Option<String>,
}

fn cli() -> ClapCommand {
    ClapCommand::new("service-ctl")
        .about("Starts and stops opensrf-compatible service processes")
        .arg(Arg::new("host").short('h').long("host").required(true).help("domain this host answers to in the bus"))
        .arg(
            Arg::new("configfile")
                .short('c')
                .long("config")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("path to the opensrf config TOML"),
        )
        .arg(Arg::new("context").short('x').long("context").required(true).help("config context this host runs under"))
        .arg(
            Arg::new("piddir")
                .short('p')
                .long("piddir")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("directory holding one <service>.pid file per running service"),
        )
        .arg(
            Arg::new("action")
                .short('a')
                .long("action")
                .required(true)
                .value_parser(["start", "start_all", "stop", "stop_all"])
                .help("start|start_all|stop|stop_all"),
        )
        .arg(
            Arg::new("service")
                .short('s')
                .long("service")
                .required(false)
                .action(ArgAction::Set)
                .help("service name; required for start/stop, ignored for start_all/stop_all"),
        )
}

fn parse_args() -> Args {
    let matches = cli().get_matches();
    let action: Action = matches.get_one::<String>("action").unwrap().parse().expect("validated by value_parser");
    Args {
        host: matches.get_one::<String>("host").unwrap().clone(),
        configfile: matches.get_one::<PathBuf>("configfile").unwrap().clone(),
        context: matches.get_one::<String>("context").unwrap().clone(),
        piddir: matches.get_one::<PathBuf>("piddir").unwrap().clone(),
        action,
        service: matches.get_one::<String>("service").cloned(),
    }
}

fn pid_file(piddir: &std::path::Path, service: &str) -> PathBuf {
    piddir.join(format!("{service}.pid"))
}

fn launchable_app<'a>(config: &'a Config, service: &str) -> Result<&'a AppConfig, CtlError> {
    let app = config.apps.get(service).ok_or_else(|| CtlError::UnknownService(service.to_owned()))?;
    if !app.is_launchable() {
        return Err(CtlError::NotLaunchable(service.to_owned()));
    }
    Ok(app)
}

fn start_one(config: &Config, piddir: &std::path::Path, service: &str) -> Result<(), CtlError> {
    let path = pid_file(piddir, service);
    if let Some(pid) = read_pid_file(&path)? {
        if process_is_alive(pid) {
            info!(service, pid, "already running, skipping start");
            return Ok(());
        }
        warn!(service, pid, "stale pid file found, removing before restart");
        let _ = fs::remove_file(&path);
    }

    let app = launchable_app(config, service)?;
    let child = Command::new(&app.implementation)
        .arg(service)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| CtlError::Spawn {
            service: service.to_owned(),
            implementation: app.implementation.clone(),
            source,
        })?;

    let pid = child.id();
    fs::write(&path, pid.to_string()).map_err(|e| CtlError::PidFileWrite(path.display().to_string(), e.to_string()))?;
    info!(service, pid, implementation = %app.implementation, "started");
    Ok(())
}

fn stop_one(piddir: &std::path::Path, service: &str) -> Result<(), CtlError> {
    let path = pid_file(piddir, service);
    let Some(pid) = read_pid_file(&path)? else {
        warn!(service, "no pid file, nothing to stop");
        return Ok(());
    };

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => info!(service, pid, "sent SIGTERM"),
        Err(nix::errno::Errno::ESRCH) => warn!(service, pid, "process already gone"),
        Err(e) => return Err(CtlError::Signal(pid, e.to_string())),
    }

    fs::remove_file(&path).map_err(|e| CtlError::PidFileWrite(path.display().to_string(), e.to_string()))?;
    Ok(())
}

fn read_pid_file(path: &std::path::Path) -> Result<Option<i32>, CtlError> {
    match fs::read_to_string(path) {
        Ok(text) => text
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|e| CtlError::BadPid(path.display().to_string(), e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CtlError::PidFileRead(path.display().to_string(), e.to_string())),
    }
}

fn process_is_alive(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Ok(()))
}

fn run(args: &Args) -> Result<(), CtlError> {
    fs::create_dir_all(&args.piddir).map_err(|e| CtlError::PidFileWrite(args.piddir.display().to_string(), e.to_string()))?;
    let config = osrf_config::load_from_path(&args.configfile)?;
    info!(host = %args.host, context = %args.context, domain = %config.domain, "config loaded");

    match args.action {
        Action::Start => start_one(&config, &args.piddir, args.service.as_deref().expect("clap requires -s for start"))?,
        Action::Stop => stop_one(&args.piddir, args.service.as_deref().expect("clap requires -s for stop"))?,
        Action::StartAll => {
            for service in &config.activeapps {
                match launchable_app(&config, service) {
                    Ok(_) => {
                        if let Err(e) = start_one(&config, &args.piddir, service) {
                            error!(service, error = %e, "failed to start");
                        }
                    }
                    Err(CtlError::NotLaunchable(_)) => debug_skip(service),
                    Err(e) => error!(service, error = %e, "failed to start"),
                }
            }
        }
        Action::StopAll => {
            for service in &config.activeapps {
                if let Err(e) = stop_one(&args.piddir, service) {
                    error!(service, error = %e, "failed to stop");
                }
            }
        }
    }
    Ok(())
}

fn debug_skip(service: &str) {
    tracing::debug!(service, "skipping non-c-language application");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let args = parse_args();
    if let Err(e) = run(&args) {
        error!(error = %e, "service-ctl failed");
        std::process::exit(1);
    }
}
