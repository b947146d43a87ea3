use std::io;

use nix::unistd::Pid;
use thiserror::Error;

use crate::mountinfo::MountinfoError;

#[derive(Error, Debug)]
pub enum RulesError {
    #[error("reading rules file {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("{path}:{line}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("cgroup root {0} is not a directory")]
    CgroupRootMissing(String),
    #[error("detecting the cgroup2 mount point failed")]
    Mountinfo(#[from] MountinfoError),
}

/// Failure of a single classification request.
///
/// Every variant maps to a numeric [`ClassifyError::code`] reported in logs.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("classification engine not initialized")]
    NotInitialized,
    #[error("cgroup {0} does not exist")]
    CgroupNotFound(String),
    #[error("moving process {pid} to {path} failed")]
    Attach {
        pid: Pid,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("loading rules failed")]
    Rules(#[source] RulesError),
    #[error("classification failed with code {0}")]
    Code(i32),
}

impl ClassifyError {
    /// Errno style code of this failure.
    pub fn code(&self) -> i32 {
        match self {
            ClassifyError::NotInitialized => libc::EINVAL,
            ClassifyError::CgroupNotFound(_) => libc::ENOENT,
            ClassifyError::Attach { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            ClassifyError::Rules(_) => libc::EBADMSG,
            ClassifyError::Code(code) => *code,
        }
    }
}
