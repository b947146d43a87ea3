use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use nix::unistd::{Gid, Pid, Uid};

use crate::{
    Classifier, ClassifyFlags,
    cgroup::CGroup,
    error::{ClassifyError, RulesError},
    identity::{IdentityDb, SystemIdentities},
    mountinfo,
    rules::RuleSet,
};

pub const DEFAULT_RULES_FILE: &str = "/etc/cgrules.conf";

/// Rules file driven classification engine.
///
/// Lifecycle: [`RulesEngine::init`] settles the cgroup root, then
/// [`RulesEngine::init_rules_cache`] loads the rules. Until both succeeded
/// every request fails with [`ClassifyError::NotInitialized`].
pub struct RulesEngine<I = SystemIdentities> {
    rules_file: PathBuf,
    configured_root: Option<PathBuf>,
    cgroup_root: Option<PathBuf>,
    identities: I,
    cache: Option<RuleSet>,
}

impl RulesEngine<SystemIdentities> {
    /// Engine using the system user and group databases. Without a
    /// `cgroup_root` the cgroup2 mount point is detected on [`RulesEngine::init`].
    pub fn new(rules_file: impl Into<PathBuf>, cgroup_root: Option<PathBuf>) -> Self {
        Self::with_identities(rules_file, cgroup_root, SystemIdentities)
    }
}

impl<I: IdentityDb> RulesEngine<I> {
    pub fn with_identities(
        rules_file: impl Into<PathBuf>,
        cgroup_root: Option<PathBuf>,
        identities: I,
    ) -> Self {
        Self {
            rules_file: rules_file.into(),
            configured_root: cgroup_root,
            cgroup_root: None,
            identities,
            cache: None,
        }
    }

    pub fn rules_file(&self) -> &Path {
        &self.rules_file
    }

    pub fn cgroup_root(&self) -> Option<&Path> {
        self.cgroup_root.as_deref()
    }

    /// Resolves and checks the cgroup hierarchy root.
    pub fn init(&mut self) -> Result<(), RulesError> {
        let root = match &self.configured_root {
            Some(root) => root.clone(),
            None => mountinfo::cgroup2_mountpoint()?,
        };
        if !root.is_dir() {
            return Err(RulesError::CgroupRootMissing(root.display().to_string()));
        }
        log::debug!("Using cgroup root {}", root.display());
        self.cgroup_root = Some(root);
        Ok(())
    }

    /// Loads the rules file into the cache.
    pub fn init_rules_cache(&mut self) -> Result<(), RulesError> {
        let rules = self.load()?;
        log::debug!(
            "Loaded {} rules from {}",
            rules.rules().len(),
            self.rules_file.display()
        );
        self.cache = Some(rules);
        Ok(())
    }

    fn load(&self) -> Result<RuleSet, RulesError> {
        let path = self.rules_file.display().to_string();
        let text = fs::read_to_string(&self.rules_file).map_err(|source| RulesError::ReadFile {
            source,
            path: path.clone(),
        })?;
        RuleSet::parse(&text, &path, &self.identities)
    }
}

impl<I: IdentityDb> Classifier for RulesEngine<I> {
    fn change_cgroup(
        &self,
        uid: Uid,
        gid: Gid,
        pid: Pid,
        flags: ClassifyFlags,
    ) -> Result<(), ClassifyError> {
        let root = self
            .cgroup_root
            .as_ref()
            .ok_or(ClassifyError::NotInitialized)?;

        let fresh;
        let rules = if flags.use_cache {
            self.cache.as_ref().ok_or(ClassifyError::NotInitialized)?
        } else {
            fresh = self.load().map_err(ClassifyError::Rules)?;
            &fresh
        };

        let user_name = self.identities.user_name(uid);
        let matched = rules.matching(uid, gid, user_name.as_deref());
        if matched.is_empty() {
            log::debug!("No rule for UID {uid}, GID {gid}, leaving PID {pid} alone");
            return Ok(());
        }

        for rule in matched {
            let mut cgroup = CGroup::from_path(root);
            cgroup.append(&rule.destination);
            if !cgroup.exists() {
                return Err(ClassifyError::CgroupNotFound(
                    cgroup.as_path().display().to_string(),
                ));
            }
            cgroup.attach(pid).map_err(|source| ClassifyError::Attach {
                pid,
                path: cgroup.as_path().display().to_string(),
                source,
            })?;
            log::debug!(
                "Moved PID {pid} to {} (rule at line {})",
                cgroup.as_path().display(),
                rule.line
            );
        }
        Ok(())
    }

    fn reload_rules(&mut self) -> Result<(), RulesError> {
        self.init_rules_cache()
    }

    fn print_rules(&self, out: &mut dyn Write) -> io::Result<()> {
        match &self.cache {
            Some(rules) => rules.write_to(out),
            None => writeln!(out, "Rules cache not initialized."),
        }
    }
}
