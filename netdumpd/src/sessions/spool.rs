/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the netdumpd contributors                           *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Dump spool directory and output-slot allocation.
//!
//! The spool directory is opened once at bootstrap and held as a directory
//! fd for the life of the daemon; every create, unlink and symlink goes
//! through it with the `*at` family. Nothing in the daemon ever touches the
//! spool through an absolute path after startup, so a confined process
//! cannot be steered outside the directory.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{open, openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{symlinkat, unlinkat, UnlinkatFlags};
use thiserror::Error;
use tracing::error;

/// Maximum saved dumps per remote host.
pub const MAX_DUMPS: u32 = 256;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("no free dump slot for host '{host}' (all {MAX_DUMPS} in use)")]
    NoSlot { host: String },
}

/// A reserved `(info, vmcore)` file pair. Both were exclusively created;
/// the names are spool-relative and share the same numeric suffix.
#[derive(Debug)]
pub struct DumpOutput {
    pub info_name: String,
    pub core_name: String,
    pub info: File,
    pub core: File,
}

#[derive(Debug)]
pub struct SpoolDir {
    dir: OwnedFd,
    root: PathBuf,
}

impl SpoolDir {
    pub fn open(path: &Path) -> io::Result<Self> {
        let fd = open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(to_io)?;
        // open() just returned this fd and nothing else owns it.
        let dir = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { dir, root: path.to_path_buf() })
    }

    /// Absolute location of a spool-relative artifact name, for consumers
    /// outside the daemon (the notification hook).
    pub fn locate(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn dirfd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }

    fn create_exclusive(&self, name: &str, extra: OFlag) -> nix::Result<File> {
        let fd = openat(
            self.dirfd(),
            name,
            extra | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        // openat() just returned this fd and nothing else owns it.
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn unlink(&self, name: &str) {
        if let Err(e) = unlinkat(Some(self.dirfd()), name, UnlinkatFlags::NoRemoveDir) {
            error!("unlink(\"{name}\"): {e}");
        }
    }

    /// Reserve the next unused `(info, vmcore)` pair for `host`, trying the
    /// numeric suffixes 0..256 in order. The info file is created first; if
    /// the matching core file cannot be created the info file is unlinked so
    /// the two numbers stay in lockstep. Nothing is ever opened over an
    /// existing file.
    pub fn reserve(&self, prefix: &str, host: &str) -> Result<DumpOutput, SpoolError> {
        for n in 0..MAX_DUMPS {
            let info_name = spool_name(prefix, "info", host, n);
            let core_name = spool_name(prefix, "vmcore", host, n);

            let info = match self.create_exclusive(&info_name, OFlag::O_WRONLY) {
                Ok(file) => file,
                Err(Errno::EEXIST) => continue,
                Err(e) => {
                    error!("openat(\"{info_name}\"): {e}");
                    continue;
                }
            };

            let core = match self.create_exclusive(&core_name, OFlag::O_RDWR) {
                Ok(file) => file,
                Err(e) => {
                    if e != Errno::EEXIST {
                        error!("openat(\"{core_name}\"): {e}");
                    }
                    drop(info);
                    self.unlink(&info_name);
                    continue;
                }
            };

            return Ok(DumpOutput { info_name, core_name, info, core });
        }

        Err(SpoolError::NoSlot { host: host.to_string() })
    }

    /// Point the `.last` symlinks for `host` at the given artifacts,
    /// unlinking stale links first (a missing link is benign). The links and
    /// their targets are both spool-relative.
    pub fn commit_last_links(
        &self,
        prefix: &str,
        host: &str,
        info_name: &str,
        core_name: &str,
    ) -> nix::Result<()> {
        for (target, link) in [
            (core_name, spool_link(prefix, "vmcore", host)),
            (info_name, spool_link(prefix, "info", host)),
        ] {
            match unlinkat(Some(self.dirfd()), link.as_str(), UnlinkatFlags::NoRemoveDir) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => return Err(e),
            }
            symlinkat(target, Some(self.dirfd()), link.as_str())?;
        }
        Ok(())
    }
}

fn spool_name(prefix: &str, kind: &str, host: &str, n: u32) -> String {
    if prefix.is_empty() {
        format!("{kind}.{host}.{n}")
    } else {
        format!("{prefix}/{kind}.{host}.{n}")
    }
}

fn spool_link(prefix: &str, kind: &str, host: &str) -> String {
    if prefix.is_empty() {
        format!("{kind}.{host}.last")
    } else {
        format!("{prefix}/{kind}.{host}.last")
    }
}

/// Extract and validate the spool sub-directory carried by a herald payload.
/// The payload is an optional NUL-terminated relative path; an empty payload
/// means the spool root. Returns `None` for anything that could escape the
/// spool.
pub fn herald_path(payload: &[u8]) -> Option<String> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let raw = std::str::from_utf8(&payload[..end]).ok()?;
    if raw.is_empty() {
        return Some(String::new());
    }
    if raw.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return None;
    }
    Some(raw.to_string())
}

fn to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spool() -> (tempfile::TempDir, SpoolDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = SpoolDir::open(dir.path()).expect("open");
        (dir, spool)
    }

    #[test]
    fn first_reservation_takes_slot_zero() {
        let (dir, spool) = spool();
        let out = spool.reserve("", "nodeA").expect("reserve");
        assert_eq!(out.info_name, "info.nodeA.0");
        assert_eq!(out.core_name, "vmcore.nodeA.0");
        assert!(dir.path().join("info.nodeA.0").exists());
        assert!(dir.path().join("vmcore.nodeA.0").exists());
    }

    #[test]
    fn existing_pairs_are_skipped() {
        let (dir, spool) = spool();
        std::fs::write(dir.path().join("info.nodeA.0"), b"").expect("write");
        let out = spool.reserve("", "nodeA").expect("reserve");
        assert_eq!(out.info_name, "info.nodeA.1");
    }

    #[test]
    fn info_is_unlinked_when_core_create_fails() {
        let (dir, spool) = spool();
        // Only the core file of slot 0 exists; the scan must not leave a
        // stray info.nodeA.0 behind when it moves on.
        std::fs::write(dir.path().join("vmcore.nodeA.0"), b"").expect("write");
        let out = spool.reserve("", "nodeA").expect("reserve");
        assert_eq!(out.info_name, "info.nodeA.1");
        assert!(!dir.path().join("info.nodeA.0").exists());
    }

    #[test]
    fn last_slot_is_usable_and_exhaustion_fails_cleanly() {
        let (dir, spool) = spool();
        for n in 0..MAX_DUMPS - 1 {
            std::fs::write(dir.path().join(format!("info.nodeA.{n}")), b"").expect("write");
        }
        let out = spool.reserve("", "nodeA").expect("reserve");
        assert_eq!(out.info_name, format!("info.nodeA.{}", MAX_DUMPS - 1));

        // Every slot is now taken.
        assert!(matches!(
            spool.reserve("", "nodeA"),
            Err(SpoolError::NoSlot { host }) if host == "nodeA"
        ));
    }

    #[test]
    fn hosts_do_not_share_slots() {
        let (_dir, spool) = spool();
        let a = spool.reserve("", "nodeA").expect("reserve");
        let b = spool.reserve("", "nodeB").expect("reserve");
        assert_eq!(a.info_name, "info.nodeA.0");
        assert_eq!(b.info_name, "info.nodeB.0");
    }

    #[test]
    fn reservation_in_a_subdirectory() {
        let (dir, spool) = spool();
        std::fs::create_dir(dir.path().join("rack7")).expect("mkdir");
        let out = spool.reserve("rack7", "nodeA").expect("reserve");
        assert_eq!(out.info_name, "rack7/info.nodeA.0");
        assert!(dir.path().join("rack7/info.nodeA.0").exists());
    }

    #[test]
    fn last_links_replace_stale_ones() {
        let (dir, spool) = spool();
        let first = spool.reserve("", "nodeA").expect("reserve");
        spool
            .commit_last_links("", "nodeA", &first.info_name, &first.core_name)
            .expect("commit");
        let second = spool.reserve("", "nodeA").expect("reserve");
        spool
            .commit_last_links("", "nodeA", &second.info_name, &second.core_name)
            .expect("commit");

        let target = std::fs::read_link(dir.path().join("vmcore.nodeA.last")).expect("readlink");
        assert_eq!(target, Path::new("vmcore.nodeA.1"));
        let target = std::fs::read_link(dir.path().join("info.nodeA.last")).expect("readlink");
        assert_eq!(target, Path::new("info.nodeA.1"));
    }

    #[test]
    fn herald_path_accepts_only_confined_relative_paths() {
        assert_eq!(herald_path(b""), Some(String::new()));
        assert_eq!(herald_path(b"rack7\0junk"), Some("rack7".to_string()));
        assert_eq!(herald_path(b"a/b"), Some("a/b".to_string()));
        assert_eq!(herald_path(b"/abs"), None);
        assert_eq!(herald_path(b".."), None);
        assert_eq!(herald_path(b"a/../b"), None);
        assert_eq!(herald_path(b"a//b"), None);
        assert_eq!(herald_path(b"a/"), None);
        assert_eq!(herald_path(&[0xFF, 0xFE]), None);
    }
}
