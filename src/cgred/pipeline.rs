use std::fmt;

use cgroup_rules::Classifier;
use proc_connector::{DecodeStats, Interruption, decode};

use super::{
    dispatch::{ClassificationOutcome, Dispatcher},
    resolver::CredentialResolver,
};

/// What happened to one received batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub events: u64,
    pub dispatched: u64,
    pub failed: u64,
    pub unresolved: u64,
    pub interruption: Option<Interruption>,
}

/// Counters over the lifetime of the daemon, printed on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub batches: u64,
    pub interrupted_batches: u64,
    pub decode: DecodeStats,
    pub dispatched: u64,
    pub failed: u64,
    pub unresolved: u64,
}

impl PipelineStats {
    fn record(&mut self, report: &BatchReport, decode: &DecodeStats) {
        self.batches += 1;
        if report.interruption.is_some() {
            self.interrupted_batches += 1;
        }
        self.decode.merge(decode);
        self.dispatched += report.dispatched;
        self.failed += report.failed;
        self.unresolved += report.unresolved;
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} batches ({} cut short), {} credential events, {} ignored, {} truncated, \
             {} classified ({} failed), {} unresolved",
            self.batches,
            self.interrupted_batches,
            self.decode.credential_events,
            self.decode.ignored,
            self.decode.truncated,
            self.dispatched,
            self.failed,
            self.unresolved,
        )
    }
}

/// Decode, resolve and dispatch, one batch at a time.
///
/// Events are handled strictly in delivery order and each one is fully
/// dispatched before the next is resolved.
pub struct EventPipeline<C> {
    resolver: CredentialResolver,
    dispatcher: Dispatcher,
    classifier: C,
    stats: PipelineStats,
}

impl<C: Classifier> EventPipeline<C> {
    pub fn new(resolver: CredentialResolver, dispatcher: Dispatcher, classifier: C) -> Self {
        Self {
            resolver,
            dispatcher,
            classifier,
            stats: PipelineStats::default(),
        }
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn classifier_mut(&mut self) -> &mut C {
        &mut self.classifier
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn handle_batch(&mut self, bytes: &[u8]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut events = decode(bytes);

        for event in events.by_ref() {
            log::debug!("{event}");
            report.events += 1;

            let credential = match self.resolver.resolve(&event) {
                Ok(credential) => credential,
                Err(err) => {
                    log::warn!(
                        "Dropping {} event for PID {} (tGID {}): {err}",
                        event.kind,
                        event.pid,
                        event.tgid
                    );
                    report.unresolved += 1;
                    continue;
                }
            };

            report.dispatched += 1;
            if let ClassificationOutcome::Failure(_) =
                self.dispatcher.dispatch(&self.classifier, &credential)
            {
                report.failed += 1;
            }
        }

        report.interruption = events.interruption();
        if let Some(interruption) = report.interruption {
            log::warn!("Kernel reported an {interruption}, rest of the batch discarded");
        }

        self.stats.record(&report, events.stats());
        report
    }
}

#[cfg(test)]
mod tests {
    use cgroup_rules::{
        ClassifyFlags,
        test_utils::{ClassifyCall, RecordingClassifier, TempDir},
    };
    use nix::unistd::{Gid, Pid, Uid};
    use proc_connector::wire::{
        NLMSG_ERROR, NLMSG_MIN_TYPE, NLMSG_NOOP, NLMSG_OVERRUN, PROC_EVENT_UID,
        testing::{control_frame, gid_frame, id_event_frame, uid_frame},
    };

    use super::*;

    fn status(uid: u32, gid: u32) -> String {
        format!("Name:\tsh\nUid:\t0\t{uid}\t0\t0\nGid:\t0\t{gid}\t0\t0\n")
    }

    fn pipeline(
        proc_root: &TempDir,
        classifier: RecordingClassifier,
    ) -> EventPipeline<RecordingClassifier> {
        EventPipeline::new(
            CredentialResolver::new(proc_root.path()),
            Dispatcher::default(),
            classifier,
        )
    }

    fn call(uid: u32, gid: u32, pid: i32) -> ClassifyCall {
        ClassifyCall {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
            pid: Pid::from_raw(pid),
            flags: ClassifyFlags::USE_CACHE,
        }
    }

    #[test]
    fn uid_change_is_classified() {
        let proc_root = TempDir::new("pipeline").unwrap();
        proc_root
            .write("100/status", "Name:\tsh\nGid:\t0\t50\t0\t0\n")
            .unwrap();
        let mut pipeline = pipeline(&proc_root, RecordingClassifier::new());

        let report = pipeline.handle_batch(&uid_frame(100, 0, 1000));

        assert_eq!(report.dispatched, 1);
        assert_eq!(pipeline.classifier().calls(), vec![call(1000, 50, 100)]);
    }

    #[test]
    fn gid_change_is_classified() {
        let proc_root = TempDir::new("pipeline").unwrap();
        proc_root.write("7/status", &status(1000, 50)).unwrap();
        let mut pipeline = pipeline(&proc_root, RecordingClassifier::new());

        pipeline.handle_batch(&gid_frame(7, 0, 60));

        assert_eq!(pipeline.classifier().calls(), vec![call(1000, 60, 7)]);
    }

    #[test]
    fn exited_process_is_not_dispatched() {
        let proc_root = TempDir::new("pipeline").unwrap();
        let mut pipeline = pipeline(&proc_root, RecordingClassifier::new());

        let report = pipeline.handle_batch(&uid_frame(100, 0, 1000));

        assert_eq!(report.unresolved, 1);
        assert_eq!(report.dispatched, 0);
        assert!(pipeline.classifier().calls().is_empty());
    }

    #[test]
    fn error_marker_ends_batch() {
        let proc_root = TempDir::new("pipeline").unwrap();
        proc_root.write("5/status", &status(1000, 50)).unwrap();
        proc_root.write("6/status", &status(1001, 51)).unwrap();
        let mut pipeline = pipeline(&proc_root, RecordingClassifier::new());

        let batch = [
            control_frame(NLMSG_NOOP),
            id_event_frame(NLMSG_MIN_TYPE, PROC_EVENT_UID, 5, 5, 0, 1000),
            control_frame(NLMSG_ERROR),
            id_event_frame(NLMSG_MIN_TYPE, PROC_EVENT_UID, 6, 6, 0, 1001),
        ]
        .concat();
        let report = pipeline.handle_batch(&batch);

        assert_eq!(report.events, 1);
        assert_eq!(report.interruption, Some(Interruption::Error));
        assert_eq!(pipeline.classifier().calls(), vec![call(1000, 50, 5)]);

        // The next batch is handled normally.
        pipeline.handle_batch(&uid_frame(6, 0, 1001));
        assert_eq!(pipeline.classifier().calls().len(), 2);
        assert_eq!(pipeline.stats().batches, 2);
        assert_eq!(pipeline.stats().interrupted_batches, 1);
    }

    #[test]
    fn overrun_marker_ends_batch() {
        let proc_root = TempDir::new("pipeline").unwrap();
        proc_root.write("5/status", &status(1000, 50)).unwrap();
        let mut pipeline = pipeline(&proc_root, RecordingClassifier::new());

        let batch = [
            control_frame(NLMSG_OVERRUN),
            id_event_frame(NLMSG_MIN_TYPE, PROC_EVENT_UID, 5, 5, 0, 1000),
        ]
        .concat();
        let report = pipeline.handle_batch(&batch);

        assert_eq!(report.interruption, Some(Interruption::Overrun));
        assert!(pipeline.classifier().calls().is_empty());
    }

    #[test]
    fn failures_are_counted() {
        let proc_root = TempDir::new("pipeline").unwrap();
        proc_root.write("5/status", &status(1000, 50)).unwrap();
        let mut pipeline = pipeline(&proc_root, RecordingClassifier::failing(2));

        let report = pipeline.handle_batch(&uid_frame(5, 0, 1000));
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.failed, 1);

        let stats = pipeline.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.decode.credential_events, 1);
        assert!(stats.to_string().contains("1 classified (1 failed)"));
    }
}
