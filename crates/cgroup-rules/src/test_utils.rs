//! Helpers for tests exercising the classification boundary.

use std::{
    cell::RefCell,
    collections::HashMap,
    env,
    fs::{self, create_dir},
    io::{self, Write},
    path::{Path, PathBuf},
};

use nix::unistd::{Gid, Pid, Uid};
use uuid::Uuid;

use crate::{Classifier, ClassifyError, ClassifyFlags, GroupEntry, IdentityDb, RulesError};

/// A temporary directory which is removed on `drop`.
pub struct TempDir {
    dir_path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> io::Result<Self> {
        let dir_path = env::temp_dir().join(format!("{prefix}-{}", Uuid::new_v4()));
        create_dir(dir_path.as_path())?;
        Ok(Self { dir_path })
    }

    pub fn path(&self) -> &Path {
        &self.dir_path
    }

    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.dir_path.join(path)
    }

    /// Writes `contents` to `relative`, creating parent directories.
    pub fn write(&self, relative: impl AsRef<Path>, contents: &str) -> io::Result<PathBuf> {
        let path = self.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }
}

impl AsRef<Path> for TempDir {
    fn as_ref(&self) -> &Path {
        self.dir_path.as_path()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir_path);
    }
}

/// In-memory user and group database.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentities {
    users: HashMap<String, Uid>,
    groups: HashMap<String, GroupEntry>,
}

impl StaticIdentities {
    pub fn with_user(mut self, name: &str, uid: u32) -> Self {
        self.users.insert(name.to_string(), Uid::from_raw(uid));
        self
    }

    pub fn with_group(mut self, name: &str, gid: u32, members: &[&str]) -> Self {
        self.groups.insert(
            name.to_string(),
            GroupEntry {
                gid: Gid::from_raw(gid),
                members: members.iter().map(|member| member.to_string()).collect(),
            },
        );
        self
    }
}

impl IdentityDb for StaticIdentities {
    fn uid_by_name(&self, name: &str) -> Option<Uid> {
        self.users.get(name).copied()
    }

    fn group_by_name(&self, name: &str) -> Option<GroupEntry> {
        self.groups.get(name).cloned()
    }

    fn group_by_gid(&self, gid: Gid) -> Option<GroupEntry> {
        self.groups.values().find(|entry| entry.gid == gid).cloned()
    }

    fn user_name(&self, uid: Uid) -> Option<String> {
        self.users
            .iter()
            .find(|(_, user_uid)| **user_uid == uid)
            .map(|(name, _)| name.clone())
    }
}

/// A classification request seen by [`RecordingClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyCall {
    pub uid: Uid,
    pub gid: Gid,
    pub pid: Pid,
    pub flags: ClassifyFlags,
}

/// Classifier fake recording every request.
#[derive(Debug, Default)]
pub struct RecordingClassifier {
    calls: RefCell<Vec<ClassifyCall>>,
    failure: Option<i32>,
    reloads: usize,
}

impl RecordingClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A classifier rejecting every request with `code`.
    pub fn failing(code: i32) -> Self {
        Self {
            failure: Some(code),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ClassifyCall> {
        self.calls.borrow().clone()
    }

    pub fn reloads(&self) -> usize {
        self.reloads
    }
}

impl Classifier for RecordingClassifier {
    fn change_cgroup(
        &self,
        uid: Uid,
        gid: Gid,
        pid: Pid,
        flags: ClassifyFlags,
    ) -> Result<(), ClassifyError> {
        self.calls.borrow_mut().push(ClassifyCall {
            uid,
            gid,
            pid,
            flags,
        });
        match self.failure {
            Some(code) => Err(ClassifyError::Code(code)),
            None => Ok(()),
        }
    }

    fn reload_rules(&mut self) -> Result<(), RulesError> {
        self.reloads += 1;
        Ok(())
    }

    fn print_rules(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Rule: *")?;
        writeln!(out, "  DEST: /recorded")
    }
}
