use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicBool, Ordering},
};

use nix::{
    errno::Errno,
    fcntl::{OFlag, open},
    libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO},
    sys::stat::{Mode, umask},
    unistd::{ForkResult, chdir, close, dup2, fork, setsid},
};
use thiserror::Error;

static IN_BACKGROUND: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
#[error("{step} failed while entering background mode")]
pub struct BackgroundError {
    step: &'static str,
    #[source]
    source: Errno,
}

impl BackgroundError {
    fn step(step: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Self { step, source }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundOptions {
    /// Leave stdout open because the log stream goes there.
    pub keep_stdout: bool,
}

/// Detaches the daemon from the invoking terminal.
///
/// The parent reports "Starting in daemon mode." and exits successfully, the
/// child continues in a new session with `/` as working directory, a zero
/// umask and the standard streams pointing to `/dev/null`. Calling it again
/// in the child does nothing.
///
/// Must run before any other thread (including the tokio runtime) exists.
pub fn enter_background(options: BackgroundOptions) -> Result<(), BackgroundError> {
    if IN_BACKGROUND.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    // SAFETY: single threaded at this point, the child only continues with
    // plain Rust code.
    match unsafe { fork() }.map_err(BackgroundError::step("fork"))? {
        ForkResult::Parent { child } => {
            log::debug!("Forked daemon child {child}");
            println!("Starting in daemon mode.");
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    setsid().map_err(BackgroundError::step("setsid"))?;
    chdir("/").map_err(BackgroundError::step("chdir"))?;
    redirect_std_streams(options.keep_stdout)
}

fn redirect_std_streams(keep_stdout: bool) -> Result<(), BackgroundError> {
    let null: RawFd = open("/dev/null", OFlag::O_RDWR, Mode::empty())
        .map_err(BackgroundError::step("opening /dev/null"))?;

    let mut targets = vec![STDIN_FILENO, STDERR_FILENO];
    if !keep_stdout {
        targets.push(STDOUT_FILENO);
    }
    for fd in targets {
        dup2(null, fd).map_err(BackgroundError::step("redirecting standard streams"))?;
    }

    if null > STDERR_FILENO {
        close(null).map_err(BackgroundError::step("closing /dev/null"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_names_step() {
        let err = BackgroundError::step("setsid")(Errno::EPERM);
        assert_eq!(err.to_string(), "setsid failed while entering background mode");
        assert_eq!(
            std::error::Error::source(&err).map(ToString::to_string),
            Some(Errno::EPERM.to_string())
        );
    }
}
