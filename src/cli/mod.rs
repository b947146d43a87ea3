use std::{env, ffi::OsString, path::PathBuf};

use clap::{ArgAction, Parser};

pub const NAME: &str = "cgrulesd";

#[derive(Parser, Debug, Clone, Default)]
#[clap(name = NAME)]
#[clap(about = "CGroup Rules Engine Daemon: moves processes to their cgroup when their uid or gid changes")]
#[clap(version)]
pub struct CgredOpts {
    /// Stay in the foreground instead of detaching
    #[clap(long)]
    pub nodaemon: bool,

    /// Disable logging
    #[clap(long)]
    pub nolog: bool,

    /// Write the log to FILE instead of the configured log file
    #[clap(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Read the daemon configuration from FILE
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Read the classification rules from FILE
    #[clap(long, value_name = "FILE")]
    pub rules: Option<PathBuf>,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl CgredOpts {
    /// Log level requested with `-v`.
    pub fn log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbose).to_level_filter()
    }
}

pub fn parse_from_args() -> CgredOpts {
    parse_from(&mut std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> CgredOpts
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<CgredOpts, clap::Error>
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    CgredOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::Level {
    match num {
        u8::MIN..=0 => log::Level::Info,
        1 => log::Level::Debug,
        2..=u8::MAX => log::Level::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // One record for the whole chain. With debug logs or RUST_BACKTRACE=1
    // the alternate format adds the backtrace when available.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CgredOpts, clap::Error> {
        try_parse_from(std::iter::once(NAME).chain(args.iter().copied()))
    }

    #[test]
    fn no_flags() {
        let opts = parse(&[]).unwrap();
        assert!(!opts.nodaemon);
        assert!(!opts.nolog);
        assert_eq!(opts.log, None);
        assert_eq!(opts.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn all_flags() {
        let opts = parse(&[
            "--nodaemon",
            "--nolog",
            "--log",
            "/tmp/cgrulesd.log",
            "--config",
            "/tmp/cgrulesd.ini",
            "--rules",
            "/tmp/cgrules.conf",
            "-vv",
        ])
        .unwrap();
        assert!(opts.nodaemon);
        assert!(opts.nolog);
        assert_eq!(opts.log, Some(PathBuf::from("/tmp/cgrulesd.log")));
        assert_eq!(opts.config, Some(PathBuf::from("/tmp/cgrulesd.ini")));
        assert_eq!(opts.rules, Some(PathBuf::from("/tmp/cgrules.conf")));
        assert_eq!(opts.log_level(), log::LevelFilter::Trace);
    }

    #[test]
    fn verbosity() {
        assert_eq!(parse(&["-v"]).unwrap().log_level(), log::LevelFilter::Debug);
        assert_eq!(
            parse(&["-vvvv"]).unwrap().log_level(),
            log::LevelFilter::Trace
        );
    }

    #[test]
    fn invalid_argument() {
        let err = parse(&["--bogus"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(parse(&["--log"]).is_err());
    }
}
