use std::io;

use tokio::signal::unix::{Signal, SignalKind, signal};

/// What the operator asked for through a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// SIGUSR2: read the rules again.
    Reload,
    /// SIGINT or SIGTERM, with the name of the signal received.
    Terminate(&'static str),
}

/// The signals the daemon reacts to.
///
/// The handlers installed by tokio only record the delivery; the reload and
/// shutdown work runs in the controller loop once [`ControlSignals::recv`]
/// returns.
pub struct ControlSignals {
    reload: Signal,
    interrupt: Signal,
    terminate: Signal,
}

impl ControlSignals {
    /// Must be called from within a tokio runtime.
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            reload: signal(SignalKind::user_defined2())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next request. Cancel safe.
    pub async fn recv(&mut self) -> ControlRequest {
        tokio::select! {
            _ = self.reload.recv() => ControlRequest::Reload,
            _ = self.interrupt.recv() => ControlRequest::Terminate("SIGINT"),
            _ = self.terminate.recv() => ControlRequest::Terminate("SIGTERM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::{Signal as NixSignal, raise};

    use super::*;

    #[tokio::test]
    async fn reload_request() {
        let mut signals = ControlSignals::register().unwrap();
        raise(NixSignal::SIGUSR2).unwrap();
        assert_eq!(signals.recv().await, ControlRequest::Reload);
    }
}
