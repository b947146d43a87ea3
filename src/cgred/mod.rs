//! The daemon: startup sequence, background mode and the event loop.

use std::io::{self, Write};

use cgroup_rules::{Classifier, ClassifyFlags, RulesEngine, RulesError};
use nix::unistd::{Pid, geteuid};
use proc_connector::{ChannelError, ProcConnector};
use thiserror::Error;

use crate::cli::CgredOpts;

mod background;
mod config;
mod controller;
mod dispatch;
mod log_sink;
mod pipeline;
mod resolver;
mod signals;

pub use background::{BackgroundError, BackgroundOptions, enter_background};
pub use config::{CgredConfig, ConfigError, DaemonSettings, SectionConfig};
pub use controller::{Controller, DaemonPhase, reload_policy};
pub use dispatch::{ClassificationOutcome, Dispatcher};
pub use log_sink::LogSink;
pub use pipeline::{BatchReport, EventPipeline, PipelineStats};
pub use resolver::{CredentialResolver, ResolveError, ResolvedCredential};
pub use signals::{ControlRequest, ControlSignals};

/// Process exit status of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    PermissionDenied = 1,
    InvalidArgument = 2,
    EngineInit = 3,
    Daemonize = 4,
    SignalSetup = 5,
    ChannelOpen = 6,
    ChannelLost = 7,
}

/// Fatal failures, each ending the daemon with its own exit code.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("only root can start the cgroup rules engine daemon")]
    PermissionDenied,
    #[error("invalid configuration")]
    InvalidArgument(#[from] ConfigError),
    #[error("cgroup rules engine initialization failed")]
    EngineInit(#[from] RulesError),
    #[error("failed to launch the daemon")]
    Daemonize(#[from] BackgroundError),
    #[error("failed to set up signal handling")]
    SignalSetup(#[source] io::Error),
    #[error("failed to subscribe to process events")]
    ChannelOpen(#[source] ChannelError),
    #[error("lost the process events channel")]
    ChannelLost(#[source] ChannelError),
}

impl StartupError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            StartupError::PermissionDenied => ExitCode::PermissionDenied,
            StartupError::InvalidArgument(_) => ExitCode::InvalidArgument,
            StartupError::EngineInit(_) => ExitCode::EngineInit,
            StartupError::Daemonize(_) => ExitCode::Daemonize,
            StartupError::SignalSetup(_) => ExitCode::SignalSetup,
            StartupError::ChannelOpen(_) => ExitCode::ChannelOpen,
            StartupError::ChannelLost(_) => ExitCode::ChannelLost,
        }
    }
}

/// Runs the daemon until it is told to stop.
///
/// `sink` is the handle the logger writes to; it is redirected to the
/// configured log destination here and left open for the caller to close.
pub fn run(options: &CgredOpts, sink: LogSink) -> Result<(), StartupError> {
    log::trace!("cgrulesd options: {:?}", options);

    if !geteuid().is_root() {
        return Err(StartupError::PermissionDenied);
    }

    let config = CgredConfig::load(options.config.as_deref())?;
    let settings = DaemonSettings::resolve(&config, options)?;
    log::debug!("Effective settings: {:?}", settings);

    let mut engine = RulesEngine::new(&settings.rules_file, settings.cgroup_root.clone());
    engine.init()?;
    engine.init_rules_cache()?;

    open_log(&sink, &settings);

    if settings.daemonize {
        enter_background(BackgroundOptions {
            keep_stdout: sink.is_stdout(),
        })?;
    }
    log::info!("Proceeding with PID {}", Pid::this());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(StartupError::SignalSetup)?;

    runtime.block_on(async move {
        let mut signals = ControlSignals::register().map_err(StartupError::SignalSetup)?;

        print_rules(&engine, &mut sink.clone());

        let channel = ProcConnector::open(settings.channel).map_err(StartupError::ChannelOpen)?;
        log::debug!("Subscribed to process events as netlink port {}", channel.port_id());

        let flags = if settings.use_cache {
            ClassifyFlags::USE_CACHE
        } else {
            ClassifyFlags::NONE
        };
        let pipeline = EventPipeline::new(
            CredentialResolver::new(&settings.proc_root),
            Dispatcher::new(flags),
            engine,
        );

        Controller::new(sink, channel, pipeline)
            .run(&mut signals)
            .await
            .map_err(StartupError::ChannelLost)
    })
}

/// Points `sink` at the log file, falling back to stdout when it cannot be
/// opened. With logging disabled the stream goes to stdout.
fn open_log(sink: &LogSink, settings: &DaemonSettings) {
    if !settings.logging {
        sink.use_stdout();
        log::info!("Logging disabled, proceeding with stdout as log output.");
        return;
    }

    match sink.open_file(&settings.log_file) {
        Ok(()) => {
            println!("Opened log file: {}", settings.log_file.display());
            log::info!("CGroup Rules Engine Daemon");
        }
        Err(err) => {
            eprintln!(
                "Failed to open log file {}, error: {err}. Continuing anyway.",
                settings.log_file.display()
            );
            sink.use_stdout();
            log::info!("Proceeding with stdout as log output.");
        }
    }
}

fn print_rules(classifier: &dyn Classifier, out: &mut dyn Write) {
    let result = writeln!(out, "Rules (generation 0):")
        .and_then(|()| classifier.print_rules(out))
        .and_then(|()| writeln!(out))
        .and_then(|()| out.flush());
    if let Err(err) = result {
        log::warn!("Failed to write the rules listing: {err}");
    }
}
