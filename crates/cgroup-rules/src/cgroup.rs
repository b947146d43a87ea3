use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use nix::unistd::Pid;

const PROCS_FILE: &str = "cgroup.procs";

/// A directory in the unified cgroup hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGroup(PathBuf);

impl CGroup {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self(PathBuf::from(path.as_ref()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// # Examples
    ///
    /// ```
    /// use cgroup_rules::CGroup;
    ///
    /// let mut cgroup = CGroup::from_path("/sys/fs/cgroup");
    /// cgroup.append("users/alice");
    /// assert_eq!(cgroup.as_path().to_str(), Some("/sys/fs/cgroup/users/alice"));
    /// ```
    pub fn append(&mut self, path: impl AsRef<Path>) {
        self.0.push(path);
    }

    pub fn exists(&self) -> bool {
        self.0.is_dir()
    }

    /// Moves `pid` into this cgroup.
    pub fn attach(&self, pid: Pid) -> io::Result<()> {
        let mut procs = OpenOptions::new()
            .write(true)
            .open(self.0.join(PROCS_FILE))?;
        procs.write_all(pid.to_string().as_bytes())
    }
}

impl AsRef<Path> for CGroup {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_utils::TempDir;

    #[test]
    fn attach_writes_pid() {
        let root = TempDir::new("cgroup-attach").unwrap();
        root.write(PROCS_FILE, "").unwrap();

        let cgroup = CGroup::from_path(&root);
        assert!(cgroup.exists());
        cgroup.attach(Pid::from_raw(4321)).unwrap();
        assert_eq!(
            fs::read_to_string(root.join(PROCS_FILE)).unwrap(),
            "4321"
        );
    }

    #[test]
    fn attach_to_missing_cgroup_fails() {
        let cgroup = CGroup::from_path("/nonexistent/cgroup");
        assert!(!cgroup.exists());
        assert!(cgroup.attach(Pid::from_raw(1)).is_err());
    }
}
