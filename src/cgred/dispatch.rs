use cgroup_rules::{Classifier, ClassifyFlags};

use super::resolver::ResolvedCredential;

/// Result of one classification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationOutcome {
    Success,
    /// Errno style code reported by the engine.
    Failure(i32),
}

/// Forwards resolved credentials to the classification engine.
///
/// Requests are sent once: a failure is logged and the process stays where
/// it is until its credentials change again or the rules are reloaded.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    flags: ClassifyFlags,
}

impl Dispatcher {
    pub fn new(flags: ClassifyFlags) -> Self {
        Self { flags }
    }

    pub fn dispatch<C: Classifier + ?Sized>(
        &self,
        classifier: &C,
        credential: &ResolvedCredential,
    ) -> ClassificationOutcome {
        let ResolvedCredential { pid, uid, gid } = *credential;
        log::info!("Attempting to change cgroup for PID: {pid}, UID: {uid}, GID: {gid}");

        match classifier.change_cgroup(uid, gid, pid, self.flags) {
            Ok(()) => {
                log::info!("OK");
                ClassificationOutcome::Success
            }
            Err(err) => {
                let code = err.code();
                log::warn!("FAILED (Error Code: {code}): {err}");
                ClassificationOutcome::Failure(code)
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(ClassifyFlags::USE_CACHE)
    }
}

#[cfg(test)]
mod tests {
    use cgroup_rules::test_utils::{ClassifyCall, RecordingClassifier};
    use nix::{
        errno::Errno,
        unistd::{Gid, Pid, Uid},
    };

    use super::*;

    fn credential() -> ResolvedCredential {
        ResolvedCredential {
            pid: Pid::from_raw(100),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(50),
        }
    }

    #[test]
    fn forwards_triple_with_cache_flag() {
        let classifier = RecordingClassifier::new();
        let outcome = Dispatcher::default().dispatch(&classifier, &credential());

        assert_eq!(outcome, ClassificationOutcome::Success);
        assert_eq!(
            classifier.calls(),
            vec![ClassifyCall {
                uid: Uid::from_raw(1000),
                gid: Gid::from_raw(50),
                pid: Pid::from_raw(100),
                flags: ClassifyFlags::USE_CACHE,
            }]
        );
    }

    #[test]
    fn failure_is_not_retried() {
        let classifier = RecordingClassifier::failing(Errno::ENOENT as i32);
        let outcome = Dispatcher::new(ClassifyFlags::NONE).dispatch(&classifier, &credential());

        assert_eq!(outcome, ClassificationOutcome::Failure(Errno::ENOENT as i32));
        assert_eq!(classifier.calls().len(), 1);
        assert_eq!(classifier.calls()[0].flags, ClassifyFlags::NONE);
    }
}
