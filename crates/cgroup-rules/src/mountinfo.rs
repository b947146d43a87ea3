use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::PathBuf,
};

use thiserror::Error;

static MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

#[derive(Error, Debug)]
pub enum MountinfoError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("could not find cgroup2 filesystem mount")]
    Cgroup2NotFound,
}

/// Finds the cgroup2 mount point in mountinfo formatted lines.
///
/// Each line looks like
///
/// ```ignore
/// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - cgroup2 none rw
/// ```
///
/// with a variable number of optional fields before the ` - ` separator. The
/// mount point is the 5th field before it, the filesystem type the first
/// field after it. Lines that are not valid UTF-8 are skipped.
pub fn find_cgroup2_mountpoint<R: BufRead>(reader: R) -> Result<PathBuf, MountinfoError> {
    for line in reader.split(b'\n').map_while(Result::ok) {
        let Ok(line) = String::from_utf8(line) else {
            continue;
        };
        let Some((mount, filesystem)) = line.split_once(" - ") else {
            continue;
        };
        if filesystem.split_whitespace().next() != Some("cgroup2") {
            continue;
        }
        if let Some(mountpoint) = mount.split_whitespace().nth(4) {
            return Ok(PathBuf::from(mountpoint));
        }
    }

    Err(MountinfoError::Cgroup2NotFound)
}

/// Mount point of the unified hierarchy, usually `/sys/fs/cgroup` or
/// `/sys/fs/cgroup/unified`.
pub fn cgroup2_mountpoint() -> Result<PathBuf, MountinfoError> {
    let file = File::open(MOUNTINFO_PATH).map_err(|source| MountinfoError::ReadFile {
        source,
        path: MOUNTINFO_PATH.to_owned(),
    })?;
    find_cgroup2_mountpoint(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_layout() {
        let mountinfo = b"24 31 0:22 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw
34 25 0:30 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime - tmpfs cgroup_root rw,size=10240k,mode=755
35 34 0:31 / /sys/fs/cgroup/openrc rw,nosuid,nodev,noexec,relatime - cgroup openrc rw,name=openrc
36 34 0:32 / /sys/fs/cgroup/unified rw,nosuid,nodev,noexec,relatime - cgroup2 none rw,nsdelegate
37 34 0:33 / /sys/fs/cgroup/cpuset rw,nosuid,nodev,noexec,relatime - cgroup cpuset rw,cpuset
";
        assert_eq!(
            find_cgroup2_mountpoint(&mountinfo[..]).unwrap(),
            PathBuf::from("/sys/fs/cgroup/unified")
        );
    }

    #[test]
    fn unified_with_optional_fields() {
        let mountinfo =
            b"35 24 0:30 / /sys/fs/cgroup rw,nosuid shared:9 master:2 - cgroup2 cgroup2 rw\n";
        assert_eq!(
            find_cgroup2_mountpoint(&mountinfo[..]).unwrap(),
            PathBuf::from("/sys/fs/cgroup")
        );
    }

    #[test]
    fn mount_with_raw_bytes_before_cgroup2() {
        let mountinfo = b"40 25 8:1 / /media/\xff\xfedisk rw - ext4 /dev/sdb1 rw
35 24 0:30 / /sys/fs/cgroup rw,nosuid - cgroup2 cgroup2 rw
";
        assert_eq!(
            find_cgroup2_mountpoint(&mountinfo[..]).unwrap(),
            PathBuf::from("/sys/fs/cgroup")
        );
    }

    #[test]
    fn no_cgroup2() {
        let mountinfo = b"24 31 0:22 / /proc rw - proc proc rw\n";
        assert!(matches!(
            find_cgroup2_mountpoint(&mountinfo[..]),
            Err(MountinfoError::Cgroup2NotFound)
        ));
    }
}
