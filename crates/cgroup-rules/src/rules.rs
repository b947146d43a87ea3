use std::{
    fmt,
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

use nix::unistd::{Gid, Uid};

use crate::{
    error::RulesError,
    identity::{GroupEntry, IdentityDb},
};

/// Who a rule applies to, resolved to numeric ids when the rules are loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    User {
        name: String,
        uid: Uid,
    },
    Group {
        name: String,
        gid: Gid,
        members: Vec<String>,
    },
    Anyone,
}

impl Subject {
    fn matches(&self, uid: Uid, gid: Gid, user_name: Option<&str>) -> bool {
        match self {
            Subject::User { uid: rule_uid, .. } => *rule_uid == uid,
            Subject::Group {
                gid: rule_gid,
                members,
                ..
            } => {
                *rule_gid == gid
                    || user_name.is_some_and(|name| members.iter().any(|member| member == name))
            }
            Subject::Anyone => true,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User { name, .. } => f.write_str(name),
            Subject::Group { name, .. } => write!(f, "@{name}"),
            Subject::Anyone => f.write_str("*"),
        }
    }
}

/// Controllers field of a rule. On the unified hierarchy it is informative
/// only, every controller enabled on the destination applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Controllers {
    All,
    Named(Vec<String>),
}

impl Controllers {
    fn parse(field: &str) -> Self {
        if field == "*" {
            return Controllers::All;
        }
        Controllers::Named(
            field
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect(),
        )
    }
}

impl fmt::Display for Controllers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Controllers::All => f.write_str("*"),
            Controllers::Named(names) => f.write_str(&names.join(",")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub subject: Subject,
    pub controllers: Controllers,
    /// Destination relative to the cgroup root.
    pub destination: PathBuf,
    /// Written as `%`: an extra destination of the rule above.
    pub continuation: bool,
    pub line: usize,
}

/// Parsed content of a rules file, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Parses a rules file.
    ///
    /// Each non-comment line is `<who> <controllers> <destination>` where
    /// `who` is a user (name or uid), `@group` (name or gid), `*` or `%`.
    /// Rules naming unknown users or groups are skipped with a warning,
    /// together with their `%` continuations.
    pub fn parse(text: &str, path: &str, ids: &dyn IdentityDb) -> Result<Self, RulesError> {
        let mut rules: Vec<Rule> = Vec::new();
        let mut previous: Option<Option<Subject>> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            let parse_error = |reason: String| RulesError::Parse {
                path: path.to_string(),
                line,
                reason,
            };

            let fields: Vec<&str> = content.split_whitespace().collect();
            let [who, controllers, destination] = fields[..] else {
                return Err(parse_error(format!(
                    "expected `<who> <controllers> <destination>`, found {} fields",
                    fields.len()
                )));
            };

            let destination = parse_destination(destination).map_err(parse_error)?;
            let controllers = Controllers::parse(controllers);

            let (subject, continuation) = if who == "%" {
                match &previous {
                    Some(subject) => (subject.clone(), true),
                    None => {
                        return Err(parse_error(
                            "`%` does not follow another rule".to_string(),
                        ));
                    }
                }
            } else {
                let subject = parse_subject(who, ids).map_err(parse_error)?;
                if subject.is_none() {
                    log::warn!("{path}:{line}: skipping rule for unknown subject {who}");
                }
                previous = Some(subject.clone());
                (subject, false)
            };

            if let Some(subject) = subject {
                rules.push(Rule {
                    subject,
                    controllers,
                    destination,
                    continuation,
                    line,
                });
            }
        }

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The first rule matching the credentials, followed by its `%`
    /// continuations. Empty when no rule applies.
    pub fn matching(&self, uid: Uid, gid: Gid, user_name: Option<&str>) -> &[Rule] {
        let Some(start) = self
            .rules
            .iter()
            .position(|rule| !rule.continuation && rule.subject.matches(uid, gid, user_name))
        else {
            return &[];
        };

        let end = self.rules[start + 1..]
            .iter()
            .position(|rule| !rule.continuation)
            .map_or(self.rules.len(), |offset| start + 1 + offset);

        &self.rules[start..end]
    }

    /// Deterministic listing of the rules, one block per rule.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.rules.is_empty() {
            return writeln!(out, "No rules loaded.");
        }

        for rule in &self.rules {
            if rule.continuation {
                writeln!(out, "Rule: % ({})", rule.subject)?;
            } else {
                writeln!(out, "Rule: {}", rule.subject)?;
            }
            match &rule.subject {
                Subject::User { uid, .. } => {
                    writeln!(out, "  UID: {uid}")?;
                    writeln!(out, "  GID: N/A")?;
                }
                Subject::Group { gid, .. } => {
                    writeln!(out, "  UID: N/A")?;
                    writeln!(out, "  GID: {gid}")?;
                }
                Subject::Anyone => {
                    writeln!(out, "  UID: any")?;
                    writeln!(out, "  GID: any")?;
                }
            }
            writeln!(out, "  DEST: /{}", rule.destination.display())?;
            writeln!(out, "  CONTROLLERS: {}", rule.controllers)?;
            writeln!(out)?;
        }
        Ok(())
    }
}

fn parse_destination(field: &str) -> Result<PathBuf, String> {
    let path = Path::new(field.trim_start_matches('/'));
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(format!("destination {field} leaves the cgroup root"));
    }
    Ok(path.to_path_buf())
}

/// Resolves `who`. `Ok(None)` means a well formed name that does not exist.
fn parse_subject(who: &str, ids: &dyn IdentityDb) -> Result<Option<Subject>, String> {
    if who == "*" {
        return Ok(Some(Subject::Anyone));
    }
    if who.contains(':') {
        return Err(format!("process name rules are not supported: {who}"));
    }

    if let Some(group) = who.strip_prefix('@') {
        if group.is_empty() {
            return Err("empty group name".to_string());
        }
        let entry = match group.parse::<u32>() {
            Ok(gid) => {
                let gid = Gid::from_raw(gid);
                Some(ids.group_by_gid(gid).unwrap_or(GroupEntry {
                    gid,
                    members: Vec::new(),
                }))
            }
            Err(_) => ids.group_by_name(group),
        };
        return Ok(entry.map(|GroupEntry { gid, members }| Subject::Group {
            name: group.to_string(),
            gid,
            members,
        }));
    }

    let uid = match who.parse::<u32>() {
        Ok(uid) => Some(Uid::from_raw(uid)),
        Err(_) => ids.uid_by_name(who),
    };
    Ok(uid.map(|uid| Subject::User {
        name: who.to_string(),
        uid,
    }))
}
