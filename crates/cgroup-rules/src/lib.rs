//! Classification engine deciding which control group a process belongs to.
//!
//! The daemon only talks to the engine through the [`Classifier`] trait. The
//! default implementation, [`RulesEngine`], reads a `cgrules.conf` style file
//! mapping users and groups to destination cgroups and moves processes by
//! writing their pid to `cgroup.procs` in the unified (v2) hierarchy.

use std::io::Write;

use nix::unistd::{Gid, Pid, Uid};

mod cgroup;
mod engine;
mod error;
mod identity;
pub mod mountinfo;
mod rules;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cgroup::CGroup;
pub use engine::{DEFAULT_RULES_FILE, RulesEngine};
pub use error::{ClassifyError, RulesError};
pub use identity::{GroupEntry, IdentityDb, SystemIdentities};
pub use rules::{Controllers, Rule, RuleSet, Subject};

/// Options of a single classification request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyFlags {
    /// Use the cached rules instead of parsing the rules file again.
    pub use_cache: bool,
}

impl ClassifyFlags {
    pub const NONE: ClassifyFlags = ClassifyFlags { use_cache: false };
    pub const USE_CACHE: ClassifyFlags = ClassifyFlags { use_cache: true };
}

/// Boundary of the classification engine.
pub trait Classifier {
    /// Moves `pid` to the cgroup the rules assign to `uid`/`gid`.
    ///
    /// A process no rule applies to is left alone and reported as success.
    fn change_cgroup(
        &self,
        uid: Uid,
        gid: Gid,
        pid: Pid,
        flags: ClassifyFlags,
    ) -> Result<(), ClassifyError>;

    /// Parses the rules again and replaces the cached copy on success.
    fn reload_rules(&mut self) -> Result<(), RulesError>;

    /// Writes a human readable listing of the cached rules.
    fn print_rules(&self, out: &mut dyn Write) -> std::io::Result<()>;
}
