//! Completes a credential event with the id the kernel did not send.
//!
//! A uid change record carries no gid and vice versa, so the missing half is
//! read from `<proc>/<pid>/status`. The process may be gone by then: every
//! failure here means "not found" and the event is dropped.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::PathBuf,
};

use nix::unistd::{Gid, Pid, Uid};
use proc_connector::{CredentialEvent, CredentialKind};
use thiserror::Error;

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Effective ids of a process, ready to be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub pid: Pid,
    pub uid: Uid,
    pub gid: Gid,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("reading {path} failed")]
    StatusUnavailable {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("no {label} line in {path}")]
    FieldMissing { label: &'static str, path: String },
    #[error("malformed {label} line in {path}: {line:?}")]
    Malformed {
        label: &'static str,
        path: String,
        line: String,
    },
}

#[derive(Debug, Clone)]
pub struct CredentialResolver {
    proc_root: PathBuf,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl CredentialResolver {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    pub fn resolve(&self, event: &CredentialEvent) -> Result<ResolvedCredential, ResolveError> {
        let path = self.proc_root.join(event.pid.to_string()).join("status");
        let path_str = path.display().to_string();
        let file = File::open(&path).map_err(|source| ResolveError::StatusUnavailable {
            source,
            path: path_str.clone(),
        })?;

        let label = match event.kind {
            CredentialKind::UidChanged => "Gid:",
            CredentialKind::GidChanged => "Uid:",
        };
        let complement = effective_id(BufReader::new(file), label, &path_str)?;

        let (uid, gid) = match event.kind {
            CredentialKind::UidChanged => (event.primary.effective, complement),
            CredentialKind::GidChanged => (complement, event.primary.effective),
        };
        Ok(ResolvedCredential {
            pid: event.pid,
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        })
    }
}

/// Effective id from the `label` line of a status record. The values after
/// the label are real, effective, saved and filesystem ids.
///
/// Lines are matched as bytes: the task name printed in `Name:` is not
/// escaped by the kernel and may be any byte sequence.
fn effective_id(
    reader: impl BufRead,
    label: &'static str,
    path: &str,
) -> Result<u32, ResolveError> {
    for line in reader.split(b'\n').map_while(Result::ok) {
        let Some(values) = line.strip_prefix(label.as_bytes()) else {
            continue;
        };
        if values.first().is_some_and(|byte| !byte.is_ascii_whitespace()) {
            continue;
        }

        let values = String::from_utf8_lossy(values);
        let mut fields = values.split_whitespace();
        let real = fields.next().map(str::parse::<u32>);
        let effective = fields.next().map(str::parse::<u32>);
        return match (real, effective) {
            (Some(Ok(_)), Some(Ok(effective))) => Ok(effective),
            _ => Err(ResolveError::Malformed {
                label,
                path: path.to_string(),
                line: String::from_utf8_lossy(&line).into_owned(),
            }),
        };
    }

    Err(ResolveError::FieldMissing {
        label,
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use cgroup_rules::test_utils::TempDir;
    use proc_connector::IdPair;

    use super::*;

    const STATUS: &str = "\
Name:\tsh
Umask:\t0022
State:\tS (sleeping)
Tgid:\t100
Pid:\t100
PPid:\t1
Uid:\t0\t1000\t0\t0
Gid:\t0\t50\t0\t0
Groups:\t50
";

    fn event(pid: i32, kind: CredentialKind, real: u32, effective: u32) -> CredentialEvent {
        CredentialEvent {
            pid: Pid::from_raw(pid),
            tgid: Pid::from_raw(pid),
            kind,
            primary: IdPair { real, effective },
        }
    }

    fn proc_root(status: &str) -> TempDir {
        let dir = TempDir::new("proc-root").unwrap();
        dir.write("100/status", status).unwrap();
        dir
    }

    #[test]
    fn uid_event_looks_up_gid() {
        let dir = proc_root(STATUS);
        let resolver = CredentialResolver::new(dir.path());
        let resolved = resolver
            .resolve(&event(100, CredentialKind::UidChanged, 0, 1000))
            .unwrap();
        assert_eq!(
            resolved,
            ResolvedCredential {
                pid: Pid::from_raw(100),
                uid: Uid::from_raw(1000),
                gid: Gid::from_raw(50),
            }
        );
    }

    #[test]
    fn gid_event_looks_up_uid() {
        let dir = proc_root(STATUS);
        let resolver = CredentialResolver::new(dir.path());
        let resolved = resolver
            .resolve(&event(100, CredentialKind::GidChanged, 0, 60))
            .unwrap();
        assert_eq!(resolved.uid, Uid::from_raw(1000));
        assert_eq!(resolved.gid, Gid::from_raw(60));
    }

    #[test]
    fn exited_process() {
        let dir = proc_root(STATUS);
        let resolver = CredentialResolver::new(dir.path());
        let err = resolver
            .resolve(&event(101, CredentialKind::UidChanged, 0, 1000))
            .unwrap_err();
        assert!(matches!(err, ResolveError::StatusUnavailable { .. }));
    }

    #[test]
    fn missing_line() {
        let dir = proc_root("Name:\tsh\nUid:\t0\t1000\t0\t0\n");
        let resolver = CredentialResolver::new(dir.path());
        let err = resolver
            .resolve(&event(100, CredentialKind::UidChanged, 0, 1000))
            .unwrap_err();
        assert!(matches!(err, ResolveError::FieldMissing { label: "Gid:", .. }));
    }

    #[test]
    fn malformed_line() {
        for status in ["Gid:\t0\n", "Gid:\t0\tfifty\t0\t0\n", "Gid:\n"] {
            let dir = proc_root(status);
            let resolver = CredentialResolver::new(dir.path());
            let err = resolver
                .resolve(&event(100, CredentialKind::UidChanged, 0, 1000))
                .unwrap_err();
            assert!(matches!(err, ResolveError::Malformed { .. }), "{status:?}");
        }
    }

    #[test]
    fn task_name_with_raw_bytes() {
        let dir = proc_root("");
        fs::write(
            dir.join("100/status"),
            b"Name:\t\xff\xfeevil\nUid:\t0\t1000\t0\t0\nGid:\t0\t50\t0\t0\n",
        )
        .unwrap();
        let resolver = CredentialResolver::new(dir.path());

        let resolved = resolver
            .resolve(&event(100, CredentialKind::UidChanged, 0, 1000))
            .unwrap();
        assert_eq!(resolved.uid, Uid::from_raw(1000));
        assert_eq!(resolved.gid, Gid::from_raw(50));
    }

    #[test]
    fn label_must_match_exactly() {
        let status = "GidMap:\t1\t2\nGid :\t1\t2\n";
        let err = effective_id(status.as_bytes(), "Gid:", "status").unwrap_err();
        assert!(matches!(err, ResolveError::FieldMissing { .. }));
    }
}
