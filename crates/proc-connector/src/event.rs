use std::fmt;

use nix::unistd::Pid;

/// Which identity of the process changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    UidChanged,
    GidChanged,
}

impl CredentialKind {
    /// Short label used in log records ("UID" / "GID").
    pub fn label(&self) -> &'static str {
        match self {
            CredentialKind::UidChanged => "UID",
            CredentialKind::GidChanged => "GID",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Real and effective id as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdPair {
    pub real: u32,
    pub effective: u32,
}

/// A credential change notification for a single task.
///
/// `primary` holds uids for [`CredentialKind::UidChanged`] and gids for
/// [`CredentialKind::GidChanged`]. The complementary id is not part of the
/// kernel record and has to be looked up separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialEvent {
    pub pid: Pid,
    pub tgid: Pid,
    pub kind: CredentialKind,
    pub primary: IdPair,
}

impl fmt::Display for CredentialEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.kind.label();
        write!(
            f,
            "{label} Event: PID = {}, tGID = {}, r{label} = {}, e{label} = {}",
            self.pid, self.tgid, self.primary.real, self.primary.effective
        )
    }
}
