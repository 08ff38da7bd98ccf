//! Program loaders: produce the initial memory image and main-thread
//! register state for a process.

pub mod baremetal;
pub mod elf;

use crate::fs::FileTable;
use crate::Addr;

/// Addresses of the regions a loader stood up; zero means absent.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoaderParams {
    pub load: Addr,
    pub interp: Addr,
    pub vvar: Addr,
    pub vdso: Addr,
    pub stack: Addr,
    pub vsyscall: Addr,
    pub arm_traps: Addr,
}

/// Rewrites a program path against the sandbox before any process state
/// exists (no procfs yet: the process has no pid at this point).
pub fn resolve_program_path(table: &FileTable, path: &str) -> String {
    let path = path.trim();
    let fmt_path = if path.is_empty() {
        table.fs_path().to_string()
    } else if path.starts_with('/') {
        if table.is_in_fs(path) {
            path.to_string()
        } else {
            format!("{}{}", table.fs_path(), &path[1..])
        }
    } else {
        format!("{}{}", table.cwd_path(), path)
    };
    if table.is_in_fs(&fmt_path) {
        fmt_path
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_paths_stay_inside_the_root() {
        let table = FileTable::new("/tmp", "/tmp").unwrap();
        assert_eq!(resolve_program_path(&table, "/bin/ls"), "/tmp/bin/ls");
        assert_eq!(resolve_program_path(&table, "ls"), "/tmp/ls");
        assert_eq!(resolve_program_path(&table, "/tmp/bin/ls"), "/tmp/bin/ls");
        assert_eq!(resolve_program_path(&table, "../../etc/passwd"), "");
    }
}
