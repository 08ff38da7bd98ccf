//! Guest file table and path sandboxing.
//!
//! Every guest-visible path is rewritten against a root filesystem: an
//! `fs_root` prefix for absolute paths, the emulated `cwd` for relative
//! ones, and `/proc/<pid|self>/...` re-resolved against the emulated
//! process. A path escaping the root rewrites to the empty string, which
//! syscall handlers translate to an access error.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::{Component, Path, PathBuf};

use libc::pid_t;

use crate::errors::{ArionError, Result};
use crate::process::{Arion, ArionCpu};

/// One guest fd backed by a host file.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub host_fd: RawFd,
    pub path: String,
    pub flags: i32,
    pub mode: u32,
    pub blocking: bool,
    /// Host offset captured at snapshot time (when positive).
    pub saved_off: i64,
}

impl FileEntry {
    pub fn new(host_fd: RawFd, path: String, flags: i32, mode: u32) -> FileEntry {
        FileEntry {
            host_fd,
            path,
            flags,
            mode,
            blocking: true,
            saved_off: 0,
        }
    }
}

pub struct FileTable {
    pub files: BTreeMap<i32, FileEntry>,
    fs_path: String,
    cwd_path: String,
}

fn with_trailing_slash(mut s: String) -> String {
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// Lexically resolves `.` and `..` without touching the filesystem, so
/// escape checks also work for paths that do not exist yet.
fn normalize_lexically(path: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in Path::new(path).components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn host_fd_path(fd: RawFd) -> Result<String> {
    let link = format!("/proc/self/fd/{}", fd);
    let target = std::fs::read_link(&link).map_err(|_| ArionError::FileNotFound(link))?;
    Ok(target.to_string_lossy().into_owned())
}

impl FileTable {
    /// Builds the table with guest fds 0..2 aliased to the host's standard
    /// streams.
    pub fn new(fs_path: &str, cwd_path: &str) -> Result<FileTable> {
        let fs_path = with_trailing_slash(if fs_path.is_empty() {
            "/".to_string()
        } else {
            fs_path.to_string()
        });
        let cwd_path = with_trailing_slash(if cwd_path.is_empty() {
            fs_path.clone()
        } else {
            cwd_path.to_string()
        });

        let mut table = FileTable {
            files: BTreeMap::new(),
            fs_path,
            cwd_path,
        };
        if !table.is_in_fs(&table.cwd_path) {
            return Err(ArionError::FileNotInFs(
                table.fs_path.clone(),
                table.cwd_path.clone(),
            ));
        }

        let stdio_defaults = ["/dev/stdin", "/dev/stdout", "/dev/stderr"];
        for (fd, default) in stdio_defaults.iter().enumerate() {
            let path = host_fd_path(fd as RawFd).unwrap_or_else(|_| default.to_string());
            let flags = if fd == 0 { libc::O_RDONLY } else { libc::O_WRONLY };
            table
                .files
                .insert(fd as i32, FileEntry::new(fd as RawFd, path, flags, 0));
        }
        Ok(table)
    }

    pub fn fs_path(&self) -> &str {
        &self.fs_path
    }

    pub fn cwd_path(&self) -> &str {
        &self.cwd_path
    }

    pub fn set_cwd_path(&mut self, cwd: &str) {
        self.cwd_path = with_trailing_slash(cwd.to_string());
    }

    pub fn has_file_entry(&self, fd: i32) -> bool {
        self.files.contains_key(&fd)
    }

    pub fn file_entry(&self, fd: i32) -> Result<&FileEntry> {
        self.files
            .get(&fd)
            .ok_or_else(|| ArionError::InvalidArgument(format!("no file at fd {}", fd)))
    }

    pub fn file_entry_mut(&mut self, fd: i32) -> Result<&mut FileEntry> {
        self.files
            .get_mut(&fd)
            .ok_or_else(|| ArionError::InvalidArgument(format!("no file at fd {}", fd)))
    }

    pub fn rm_file_entry(&mut self, fd: i32) -> Result<FileEntry> {
        self.files
            .remove(&fd)
            .ok_or_else(|| ArionError::InvalidArgument(format!("no file at fd {}", fd)))
    }

    /// True when `path` resolves inside the root filesystem.
    pub fn is_in_fs(&self, path: &str) -> bool {
        let root = std::fs::canonicalize(&self.fs_path)
            .unwrap_or_else(|_| normalize_lexically(&self.fs_path));
        let candidate = normalize_lexically(path);
        candidate.starts_with(&root)
    }
}

/// Registers `entry` under `guest_fd`. With `safe`, refuses fds already
/// used by the file or socket table (they must stay disjoint).
pub fn add_file_entry(state: &mut Arion, guest_fd: i32, entry: FileEntry, safe: bool) -> Result<()> {
    if safe {
        if state.fs.has_file_entry(guest_fd) {
            return Err(ArionError::InvalidArgument(format!(
                "fd {} already maps a file",
                guest_fd
            )));
        }
        if state.sock.has_socket_entry(guest_fd) {
            return Err(ArionError::InvalidArgument(format!(
                "fd {} already maps a socket",
                guest_fd
            )));
        }
    }
    state.fs.files.insert(guest_fd, entry);
    Ok(())
}

/// Re-resolves `/proc/<pid|self>/exe` against the emulated process tree.
/// Returns `None` for non-procfs paths, `Some("")` for unresolvable ones.
fn procfs_convert(uc: &ArionCpu, path: &str) -> Option<String> {
    let rest = path.strip_prefix("/proc/")?;
    let mut parts = rest.splitn(2, '/');
    let pid_part = parts.next()?;
    let entry = parts.next().unwrap_or("");

    let pid: pid_t = if pid_part == "self" {
        uc.get_data().pid
    } else {
        pid_part.parse().ok()?
    };

    let state = uc.get_data();
    let args = if pid == state.pid {
        state.program_args.clone()
    } else {
        let group = state.group.upgrade()?;
        let group = group.borrow();
        let proc_inst = group.instance(pid).ok()?;
        let args = proc_inst.borrow().state().program_args.clone();
        args
    };

    if entry == "exe" {
        return Some(args.get(0).cloned().unwrap_or_default());
    }
    Some(String::new())
}

/// Rewrites a guest path into the sandbox. An empty result means the path
/// escapes `fs_root`.
pub fn to_fs_path(uc: &ArionCpu, path: &str) -> String {
    let mut path = path.trim().to_string();
    if let Some(converted) = procfs_convert(uc, &path) {
        path = converted;
    }
    let state = uc.get_data();
    let fs_path = state.fs.fs_path().to_string();
    let fmt_path = if path.is_empty() {
        fs_path.clone()
    } else if path.starts_with('/') {
        if state.fs.is_in_fs(&path) {
            path
        } else {
            format!("{}{}", fs_path, &path[1..])
        }
    } else {
        format!("{}{}", state.fs.cwd_path(), path)
    };
    if state.fs.is_in_fs(&fmt_path) {
        fmt_path
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_normalization_strips_dots() {
        assert_eq!(
            normalize_lexically("/a/b/../c/./d"),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexically("/../.."), PathBuf::from("/"));
    }

    #[test]
    fn stdio_fds_are_aliased() {
        let table = FileTable::new("/", "").unwrap();
        assert!(table.has_file_entry(0));
        assert!(table.has_file_entry(1));
        assert!(table.has_file_entry(2));
        assert_eq!(table.file_entry(1).unwrap().host_fd, 1);
        assert!(!table.has_file_entry(3));
    }

    #[test]
    fn escape_detection_is_lexical() {
        let table = FileTable::new("/tmp", "/tmp").unwrap();
        assert!(table.is_in_fs("/tmp/inside/file"));
        assert!(!table.is_in_fs("/tmp/../etc/passwd"));
        assert!(!table.is_in_fs("/etc/passwd"));
    }
}
