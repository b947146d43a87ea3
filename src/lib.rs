//! `cgrulesd` is the cgroup rules engine daemon.
//!
//! It subscribes to the kernel process events connector and, every time a
//! process changes its uid or gid, asks the classification engine to move
//! the process to the cgroup its rules assign to the new credentials.
//!
//! ```sh
//! # Run in the foreground, log to stdout
//! cgrulesd --nodaemon --log /dev/stdout
//!
//! # Reload the rules
//! kill -USR2 $(pidof cgrulesd)
//! ```
//!
//! The work is split across three crates:
//!
//! - [`proc_connector`] owns the netlink socket and decodes credential events.
//! - [`cgroup_rules`] is the classification engine behind the
//!   [`Classifier`](cgroup_rules::Classifier) trait.
//! - this crate holds the daemon itself: [configuration](crate::cgred::DaemonSettings),
//!   the [credential resolver](crate::cgred::CredentialResolver) completing
//!   events from `/proc/<pid>/status`, and the [controller](crate::cgred::Controller)
//!   reacting to signals.

pub mod cgred;
pub mod cli;

use cgred::LogSink;

/// Init logger writing to `sink`. We log from info level and above, or from
/// the level requested on the command line.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(
    override_log_level: Option<log::LevelFilter>,
    sink: LogSink,
) -> Result<(), log::SetLoggerError> {
    let mut builder = if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_default_env()
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level_filter);
        builder
    };

    builder
        .target(env_logger::Target::Pipe(Box::new(sink)))
        .write_style(env_logger::WriteStyle::Never)
        .try_init()
}
