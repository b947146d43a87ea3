use nix::unistd::{Gid, Group, Uid, User};

/// A group and the user names listed as its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub gid: Gid,
    pub members: Vec<String>,
}

/// Lookups in the user and group databases.
pub trait IdentityDb {
    fn uid_by_name(&self, name: &str) -> Option<Uid>;
    fn group_by_name(&self, name: &str) -> Option<GroupEntry>;
    fn group_by_gid(&self, gid: Gid) -> Option<GroupEntry>;
    fn user_name(&self, uid: Uid) -> Option<String>;
}

/// Identity lookups through the system databases (`getpwnam(3)` and friends).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentities;

impl IdentityDb for SystemIdentities {
    fn uid_by_name(&self, name: &str) -> Option<Uid> {
        User::from_name(name).ok().flatten().map(|user| user.uid)
    }

    fn group_by_name(&self, name: &str) -> Option<GroupEntry> {
        Group::from_name(name).ok().flatten().map(GroupEntry::from)
    }

    fn group_by_gid(&self, gid: Gid) -> Option<GroupEntry> {
        Group::from_gid(gid).ok().flatten().map(GroupEntry::from)
    }

    fn user_name(&self, uid: Uid) -> Option<String> {
        User::from_uid(uid).ok().flatten().map(|user| user.name)
    }
}

impl From<Group> for GroupEntry {
    fn from(group: Group) -> Self {
        Self {
            gid: group.gid,
            members: group.mem,
        }
    }
}
