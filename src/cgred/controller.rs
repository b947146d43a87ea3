use std::{
    fmt,
    io::{self, Write},
};

use cgroup_rules::Classifier;
use proc_connector::{ChannelError, ProcConnector};

use super::{
    log_sink::LogSink,
    pipeline::EventPipeline,
    signals::{ControlRequest, ControlSignals},
};

/// Lifecycle of the daemon once the channel is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    Running,
    Reloading,
    Stopping,
    Stopped,
}

impl fmt::Display for DaemonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonPhase::Running => "running",
            DaemonPhase::Reloading => "reloading",
            DaemonPhase::Stopping => "stopping",
            DaemonPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Owns the daemon state: the log sink, the kernel channel, the event
/// pipeline and the rules generation counter.
pub struct Controller<C> {
    sink: LogSink,
    channel: ProcConnector,
    pipeline: EventPipeline<C>,
    generation: u64,
    phase: DaemonPhase,
}

impl<C: Classifier> Controller<C> {
    pub fn new(sink: LogSink, channel: ProcConnector, pipeline: EventPipeline<C>) -> Self {
        Self {
            sink,
            channel,
            pipeline,
            generation: 0,
            phase: DaemonPhase::Running,
        }
    }

    fn set_phase(&mut self, phase: DaemonPhase) {
        log::debug!("Daemon {} -> {phase}", self.phase);
        self.phase = phase;
    }

    /// Runs until a terminate signal arrives or the channel fails.
    ///
    /// Signals interrupt a pending receive, never a batch being processed:
    /// `handle_batch` runs to completion before the next `select!`.
    pub async fn run(&mut self, signals: &mut ControlSignals) -> Result<(), ChannelError> {
        log::info!("Started the CGroup Rules Engine Daemon.");

        let result = loop {
            let request = tokio::select! {
                request = signals.recv() => Some(request),
                batch = self.channel.receive_batch() => {
                    match batch {
                        Ok(batch) if batch.from_kernel() => {
                            self.pipeline.handle_batch(batch.bytes);
                        }
                        Ok(batch) => {
                            log::debug!("Ignoring message from netlink port {:?}", batch.sender);
                        }
                        Err(err) => break Err(err),
                    }
                    None
                }
            };

            match request {
                Some(ControlRequest::Reload) => self.reload(),
                Some(ControlRequest::Terminate(name)) => {
                    log::debug!("{name} received");
                    break Ok(());
                }
                None => {}
            }
        };

        self.shutdown();
        result
    }

    fn reload(&mut self) {
        self.set_phase(DaemonPhase::Reloading);
        self.generation += 1;
        log::info!("Reloading rules configuration (generation {}).", self.generation);

        let mut out = self.sink.clone();
        if let Err(err) = reload_policy(self.pipeline.classifier_mut(), &mut out, self.generation)
        {
            log::warn!("Failed to write the rules listing: {err}");
        }
        self.set_phase(DaemonPhase::Running);
    }

    fn shutdown(&mut self) {
        self.set_phase(DaemonPhase::Stopping);
        log::info!("Stopped CGroup Rules Engine Daemon");
        log::info!(
            "Processed {} with {} rule reloads",
            self.pipeline.stats(),
            self.generation
        );
        if self.channel.overruns() > 0 {
            log::info!("{} kernel buffer overruns", self.channel.overruns());
        }
        self.channel.close();
        if let Err(err) = self.sink.flush() {
            log::warn!("Failed to flush the log: {err}");
        }
        self.set_phase(DaemonPhase::Stopped);
    }
}

/// Reloads the classifier rules and prints them to `out`.
///
/// A failed reload keeps the previous rules, which are printed again.
pub fn reload_policy<C: Classifier + ?Sized>(
    classifier: &mut C,
    out: &mut dyn Write,
    generation: u64,
) -> io::Result<()> {
    if let Err(err) = classifier.reload_rules() {
        log::error!("Failed to reload the rules, keeping the previous ones: {err}");
    }
    writeln!(out, "Rules (generation {generation}):")?;
    classifier.print_rules(out)?;
    writeln!(out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use cgroup_rules::test_utils::RecordingClassifier;

    use super::*;

    #[test]
    fn reload_prints_rules() {
        let mut classifier = RecordingClassifier::new();
        let mut out = Vec::new();
        reload_policy(&mut classifier, &mut out, 1).unwrap();

        assert_eq!(classifier.reloads(), 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Rules (generation 1):\nRule: *\n  DEST: /recorded\n\n"
        );
    }

    #[test]
    fn reload_twice_same_listing() {
        let mut classifier = RecordingClassifier::new();
        let mut first = Vec::new();
        let mut second = Vec::new();
        reload_policy(&mut classifier, &mut first, 3).unwrap();
        reload_policy(&mut classifier, &mut second, 3).unwrap();

        assert_eq!(classifier.reloads(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn phase_names() {
        assert_eq!(DaemonPhase::Reloading.to_string(), "reloading");
        assert_eq!(DaemonPhase::Stopped.to_string(), "stopped");
    }
}
