//! Linux syscall emulation: the dispatcher plus per-syscall handlers that
//! translate the guest ABI into host actions.
//!
//! The dispatcher reads the syscall number from the syscalling
//! convention's number register, resolves the name through the ABI table,
//! reads the documented number of argument registers, invokes the handler
//! and writes the return value back following the kernel convention
//! (`-errno` on failure). Unknown numbers log a warning and return 0.

pub mod id;
pub mod info;
pub mod io;
pub mod mem;
pub mod net;
pub mod proc;
pub mod sig;

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::abi::{self, Abi};
use crate::errors::Result;
use crate::hooks;
use crate::process::{self, ArionCpu};

/// Outcome of one handler.
pub enum SysRet {
    Val(u64),
    /// The handler could not complete without blocking: roll the PC back
    /// to the syscall instruction and yield the quantum.
    Cancel,
}

pub type SyscallHandler = fn(&mut ArionCpu, &[u64]) -> Result<SysRet>;

pub struct SyscallEntry {
    pub name: &'static str,
    pub params_n: u8,
    pub handler: SyscallHandler,
}

/// Per-process sysno -> handler table, resolved against the ABI's
/// number/name map at construction.
#[derive(Default)]
pub struct SyscallTable {
    funcs: HashMap<u64, SyscallEntry>,
}

impl SyscallTable {
    pub fn set_syscall_func(&mut self, sysno: u64, entry: SyscallEntry) {
        self.funcs.insert(sysno, entry);
    }

    pub fn get(&self, sysno: u64) -> Option<&SyscallEntry> {
        self.funcs.get(&sysno)
    }
}

pub fn neg_errno(errno: i32) -> u64 {
    (-(errno as i64)) as u64
}

pub fn val(v: u64) -> Result<SysRet> {
    Ok(SysRet::Val(v))
}

pub fn err(errno: i32) -> Result<SysRet> {
    Ok(SysRet::Val(neg_errno(errno)))
}

/// Host fd, blocking flag and file/socket discriminator for a guest fd.
pub fn host_fd_of(uc: &ArionCpu, fd: i32) -> Option<(RawFd, bool, bool)> {
    let state = uc.get_data();
    if let Ok(file) = state.fs.file_entry(fd) {
        return Some((file.host_fd, file.blocking, true));
    }
    if let Ok(sock) = state.sock.socket_entry(fd) {
        return Some((sock.host_fd, sock.blocking, false));
    }
    None
}

/// Non-blocking readiness probe on a host fd.
pub fn fd_ready(host_fd: RawFd, events: nix::poll::PollFlags) -> bool {
    let mut fds = [nix::poll::PollFd::new(host_fd, events)];
    match nix::poll::poll(&mut fds, 0) {
        Ok(n) if n > 0 => fds[0]
            .revents()
            .map(|r| r.intersects(events | nix::poll::PollFlags::POLLHUP))
            .unwrap_or(false),
        _ => false,
    }
}

/// Reads a guest path argument and rewrites it into the sandbox. Empty
/// result means the path escapes the root.
pub fn path_arg(uc: &ArionCpu, addr: u64) -> Result<String> {
    let raw = crate::memory::read_c_string(uc, addr)?;
    Ok(crate::fs::to_fs_path(uc, &raw))
}

pub fn dispatch(uc: &mut ArionCpu) -> Result<()> {
    let (sysno_reg, sys_ret_reg, sys_params, pc_reg) = {
        let table = uc.get_data().abi.table;
        (table.sysno, table.sys_ret, table.sys_params, table.pc)
    };
    let sysno = abi::read_arch_reg(uc, sysno_reg)?;

    let (name, params_n, handler) = match uc.get_data().syscalls.get(sysno) {
        Some(entry) => (entry.name, entry.params_n, entry.handler),
        None => {
            warn!("no handler for syscall number {:#x}", sysno);
            abi::write_arch_reg(uc, sys_ret_reg, 0)?;
            return Ok(());
        }
    };

    let mut args = Vec::with_capacity(params_n as usize);
    for i in 0..params_n as usize {
        args.push(abi::read_arch_reg(uc, sys_params[i])?);
    }

    match handler(uc, &args)? {
        SysRet::Val(ret) => {
            debug!("SYSCALL -> {}{:x?} = {:#x}", name, args, ret);
            abi::write_arch_reg(uc, sys_ret_reg, ret)?;
            hooks::trigger_syscall_hook(uc, name, &args)?;
        }
        SysRet::Cancel => {
            // Re-execute the syscall once this thread is scheduled again.
            let ops = uc.get_data().abi.ops.clone();
            let insn_sz = ops.sys_insn_sz(uc);
            let pc = abi::read_arch_reg(uc, pc_reg)?;
            abi::write_arch_reg(uc, pc_reg, pc - insn_sz)?;
            trace!("SYSCALL -> {} yielded", name);
            process::sync_threads(uc)?;
        }
    }
    Ok(())
}

macro_rules! handlers {
    ($(($name:expr, $func:path)),* $(,)?) => {
        &[$(($name, $func as SyscallHandler)),*]
    };
}

/// Handler registry by syscall name; `init_table` resolves these against
/// the target's number table, silently skipping names the architecture
/// does not carry.
static HANDLER_REGISTRY: &[(&str, SyscallHandler)] = handlers![
        ("read", io::sys_read),
        ("write", io::sys_write),
        ("open", io::sys_open),
        ("openat", io::sys_openat),
        ("close", io::sys_close),
        ("lseek", io::sys_lseek),
        ("_llseek", io::sys_llseek),
        ("pread64", io::sys_pread64),
        ("pwrite64", io::sys_pwrite64),
        ("readv", io::sys_readv),
        ("writev", io::sys_writev),
        ("access", io::sys_access),
        ("faccessat", io::sys_faccessat),
        ("faccessat2", io::sys_faccessat),
        ("dup", io::sys_dup),
        ("dup2", io::sys_dup2),
        ("dup3", io::sys_dup3),
        ("pipe", io::sys_pipe),
        ("pipe2", io::sys_pipe2),
        ("fcntl", io::sys_fcntl),
        ("fcntl64", io::sys_fcntl),
        ("ioctl", io::sys_ioctl),
        ("truncate", io::sys_truncate),
        ("ftruncate", io::sys_ftruncate),
        ("getcwd", io::sys_getcwd),
        ("chdir", io::sys_chdir),
        ("fchdir", io::sys_fchdir),
        ("rename", io::sys_rename),
        ("renameat", io::sys_renameat),
        ("renameat2", io::sys_renameat),
        ("mkdir", io::sys_mkdir),
        ("mkdirat", io::sys_mkdirat),
        ("rmdir", io::sys_rmdir),
        ("link", io::sys_link),
        ("unlink", io::sys_unlink),
        ("unlinkat", io::sys_unlinkat),
        ("symlink", io::sys_symlink),
        ("readlink", io::sys_readlink),
        ("readlinkat", io::sys_readlinkat),
        ("chmod", io::sys_chmod),
        ("fchmod", io::sys_fchmod),
        ("fchmodat", io::sys_fchmodat),
        ("fchmodat2", io::sys_fchmodat),
        ("poll", io::sys_poll),
        ("ppoll", io::sys_ppoll),
        ("select", io::sys_select),
        ("_newselect", io::sys_select),
        ("pselect6", io::sys_pselect6),
        ("getdents64", io::sys_getdents64),
        ("getdents", io::sys_getdents),
        ("newstat", io::sys_newstat),
        ("newfstat", io::sys_newfstat),
        ("newlstat", io::sys_newlstat),
        ("newfstatat", io::sys_newfstatat),
        ("stat64", io::sys_stat64),
        ("lstat64", io::sys_lstat64),
        ("fstat64", io::sys_fstat64),
        ("fstatat64", io::sys_newfstatat),
        ("statx", io::sys_statx),
        ("statfs", io::sys_statfs),
        ("statfs64", io::sys_statfs),
        ("fstatfs", io::sys_fstatfs),
        ("fstatfs64", io::sys_fstatfs),
        ("sync", io::sys_sync),
        ("fsync", io::sys_fsync),
        ("fdatasync", io::sys_fsync),
        ("getxattr", io::sys_getxattr),
        ("lgetxattr", io::sys_getxattr),
        ("socket", net::sys_socket),
        ("socketcall", net::sys_socketcall),
        ("bind", net::sys_bind),
        ("listen", net::sys_listen),
        ("connect", net::sys_connect),
        ("accept", net::sys_accept),
        ("accept4", net::sys_accept4),
        ("send", net::sys_send),
        ("sendto", net::sys_sendto),
        ("recv", net::sys_recv),
        ("recvfrom", net::sys_recvfrom),
        ("sendmsg", net::sys_sendmsg),
        ("recvmsg", net::sys_recvmsg),
        ("shutdown", net::sys_shutdown),
        ("getsockname", net::sys_getsockname),
        ("getpeername", net::sys_getpeername),
        ("socketpair", net::sys_socketpair),
        ("setsockopt", net::sys_setsockopt),
        ("getsockopt", net::sys_getsockopt),
        ("mmap", mem::sys_mmap),
        ("mmap2", mem::sys_mmap2),
        ("mmap_pgoff", mem::sys_mmap2),
        ("mprotect", mem::sys_mprotect),
        ("munmap", mem::sys_munmap),
        ("brk", mem::sys_brk),
        ("madvise", mem::sys_madvise),
        ("mlock", mem::sys_mlock),
        ("munlock", mem::sys_mlock),
        ("msync", mem::sys_msync),
        ("membarrier", mem::sys_membarrier),
        ("clone", proc::sys_clone),
        ("clone3", proc::sys_clone3),
        ("fork", proc::sys_fork),
        ("vfork", proc::sys_fork),
        ("execve", proc::sys_execve),
        ("exit", proc::sys_exit),
        ("exit_group", proc::sys_exit_group),
        ("futex", proc::sys_futex),
        ("futex_time64", proc::sys_futex),
        ("set_tid_address", proc::sys_set_tid_address),
        ("set_thread_area", proc::sys_set_thread_area),
        ("get_thread_area", proc::sys_get_thread_area),
        ("set_tls", proc::sys_set_tls),
        ("set_robust_list", proc::sys_set_robust_list),
        ("get_robust_list", proc::sys_get_robust_list),
        ("rseq", proc::sys_rseq),
        ("sched_yield", proc::sys_sched_yield),
        ("gettid", proc::sys_gettid),
        ("arch_prctl", proc::sys_arch_prctl),
        ("prctl", proc::sys_prctl),
        ("personality", proc::sys_personality),
        ("sched_getaffinity", proc::sys_sched_getaffinity),
        ("sched_setaffinity", proc::sys_sched_setaffinity),
        ("restart_syscall", proc::sys_restart_syscall),
        ("rt_sigaction", sig::sys_rt_sigaction),
        ("sigaction", sig::sys_rt_sigaction),
        ("rt_sigprocmask", sig::sys_rt_sigprocmask),
        ("sigprocmask", sig::sys_rt_sigprocmask),
        ("rt_sigreturn", sig::sys_rt_sigreturn),
        ("sigreturn", sig::sys_sigreturn),
        ("rt_sigsuspend", sig::sys_pause),
        ("sigaltstack", sig::sys_sigaltstack),
        ("pause", sig::sys_pause),
        ("kill", sig::sys_kill),
        ("tkill", sig::sys_tkill),
        ("tgkill", sig::sys_tgkill),
        ("wait4", sig::sys_wait4),
        ("waitid", sig::sys_waitid),
        ("alarm", sig::sys_alarm),
        ("getpid", id::sys_getpid),
        ("getppid", id::sys_getppid),
        ("getpgrp", id::sys_getpgrp),
        ("getpgid", id::sys_getpgid),
        ("setpgid", id::sys_setpgid),
        ("getsid", id::sys_getsid),
        ("setsid", id::sys_setsid),
        ("getuid", id::sys_getuid),
        ("geteuid", id::sys_geteuid),
        ("getgid", id::sys_getgid),
        ("getegid", id::sys_getegid),
        ("setuid", id::sys_ignore_set),
        ("setgid", id::sys_ignore_set),
        ("setreuid", id::sys_ignore_set),
        ("setregid", id::sys_ignore_set),
        ("setresuid", id::sys_ignore_set),
        ("setresgid", id::sys_ignore_set),
        ("setfsuid", id::sys_ignore_set),
        ("setfsgid", id::sys_ignore_set),
        ("getresuid", id::sys_getresuid),
        ("getresgid", id::sys_getresgid),
        ("getgroups", id::sys_getgroups),
        ("setgroups", id::sys_ignore_set),
        ("capget", id::sys_capget),
        ("capset", id::sys_ignore_set),
        ("newuname", info::sys_newuname),
        ("uname", info::sys_newuname),
        ("sysinfo", info::sys_sysinfo),
        ("gettimeofday", info::sys_gettimeofday),
        ("time", info::sys_time),
        ("clock_gettime", info::sys_clock_gettime),
        ("clock_gettime64", info::sys_clock_gettime64),
        ("clock_getres", info::sys_clock_getres),
        ("clock_nanosleep", info::sys_nanosleep),
        ("clock_nanosleep_time64", info::sys_nanosleep),
        ("nanosleep", info::sys_nanosleep),
        ("getrandom", info::sys_getrandom),
        ("getrlimit", info::sys_getrlimit),
        ("ugetrlimit", info::sys_getrlimit),
        ("old_getrlimit", info::sys_getrlimit),
        ("setrlimit", info::sys_setrlimit),
        ("prlimit64", info::sys_prlimit64),
        ("getrusage", info::sys_getrusage),
        ("times", info::sys_times),
        ("getcpu", info::sys_getcpu),
        ("syslog", info::sys_syslog),
        ("umask", info::sys_umask),
        ("getpriority", info::sys_getpriority),
        ("setpriority", info::sys_ignore),
        ("ioprio_set", info::sys_ignore),
        ("setitimer", info::sys_ignore),
        ("getitimer", info::sys_ignore),
        ("sched_get_priority_max", info::sys_ignore),
        ("sched_get_priority_min", info::sys_ignore),
    ];

/// Binds every registered handler to the architecture's syscall numbers.
pub fn init_table(abi: &Abi) -> SyscallTable {
    let mut table = SyscallTable::default();
    for (name, handler) in HANDLER_REGISTRY {
        if let Ok(sysno) = abi.syscall_no_by_name(name) {
            let params_n = PARAMS_N_BY_SYSCALL_NAME
                .get(name)
                .copied()
                .unwrap_or(abi.table.sys_params.len() as u8);
            table.set_syscall_func(
                sysno,
                SyscallEntry {
                    name,
                    params_n,
                    handler: *handler,
                },
            );
        }
    }
    table
}

lazy_static! {
    /// Documented parameter count per syscall name, used to decide how
    /// many argument registers to read.
    pub static ref PARAMS_N_BY_SYSCALL_NAME: HashMap<&'static str, u8> = {
        let entries: &[(&str, u8)] = &[
            ("read", 3), ("write", 3), ("open", 3), ("close", 1),
            ("newstat", 2), ("newfstat", 2), ("newlstat", 2), ("poll", 3),
            ("lseek", 3), ("_llseek", 5), ("mmap", 6), ("mmap2", 6),
            ("mmap_pgoff", 6), ("mprotect", 3), ("munmap", 2), ("brk", 1),
            ("rt_sigaction", 4), ("sigaction", 3), ("rt_sigprocmask", 4),
            ("sigprocmask", 3), ("rt_sigreturn", 0), ("sigreturn", 0),
            ("ioctl", 3), ("pread64", 4), ("pwrite64", 4), ("readv", 3),
            ("writev", 3), ("access", 2), ("pipe", 1), ("pipe2", 2),
            ("select", 5), ("_newselect", 5), ("sched_yield", 0),
            ("mremap", 5), ("msync", 3), ("mincore", 3), ("madvise", 3),
            ("dup", 1), ("dup2", 2), ("dup3", 3), ("pause", 0),
            ("nanosleep", 2), ("getitimer", 2), ("alarm", 1),
            ("setitimer", 3), ("getpid", 0), ("socket", 3),
            ("socketcall", 2), ("connect", 3), ("accept", 3), ("accept4", 4),
            ("sendto", 6), ("send", 4), ("recvfrom", 6), ("recv", 4),
            ("sendmsg", 3), ("recvmsg", 3), ("shutdown", 2), ("bind", 3),
            ("listen", 2), ("getsockname", 3), ("getpeername", 3),
            ("socketpair", 4), ("setsockopt", 5), ("getsockopt", 5),
            ("clone", 5), ("clone3", 2), ("fork", 0), ("vfork", 0),
            ("execve", 3), ("exit", 1), ("exit_group", 1), ("wait4", 4),
            ("waitid", 5), ("kill", 2), ("tkill", 2), ("tgkill", 3),
            ("newuname", 1), ("uname", 1), ("fcntl", 3), ("fcntl64", 3),
            ("flock", 2), ("fsync", 1), ("fdatasync", 1), ("truncate", 2),
            ("ftruncate", 2), ("getdents", 3), ("getdents64", 3),
            ("getcwd", 2), ("chdir", 1), ("fchdir", 1), ("rename", 2),
            ("renameat", 4), ("renameat2", 5), ("mkdir", 2), ("mkdirat", 3),
            ("rmdir", 1), ("creat", 2), ("link", 2), ("unlink", 1),
            ("unlinkat", 3), ("symlink", 2), ("readlink", 3),
            ("readlinkat", 4), ("chmod", 2), ("fchmod", 2), ("fchmodat", 3),
            ("fchmodat2", 4), ("chown", 3), ("fchown", 3), ("lchown", 3),
            ("umask", 1), ("gettimeofday", 2), ("getrlimit", 2),
            ("ugetrlimit", 2), ("old_getrlimit", 2), ("setrlimit", 2),
            ("getrusage", 2), ("sysinfo", 1), ("times", 1), ("getuid", 0),
            ("syslog", 3), ("getgid", 0), ("setuid", 1), ("setgid", 1),
            ("geteuid", 0), ("getegid", 0), ("setpgid", 2), ("getppid", 0),
            ("getpgrp", 0), ("setsid", 0), ("setreuid", 2), ("setregid", 2),
            ("getgroups", 2), ("setgroups", 2), ("setresuid", 3),
            ("getresuid", 3), ("setresgid", 3), ("getresgid", 3),
            ("getpgid", 1), ("setfsuid", 1), ("setfsgid", 1), ("getsid", 1),
            ("capget", 2), ("capset", 2), ("rt_sigsuspend", 2),
            ("sigaltstack", 2), ("personality", 1), ("statfs", 2),
            ("statfs64", 3), ("fstatfs", 2), ("fstatfs64", 3),
            ("getpriority", 2), ("setpriority", 3), ("prctl", 5),
            ("arch_prctl", 2), ("sync", 0), ("gettid", 0), ("futex", 6),
            ("futex_time64", 6), ("sched_setaffinity", 3),
            ("sched_getaffinity", 3), ("set_tid_address", 1),
            ("set_thread_area", 1), ("get_thread_area", 1), ("set_tls", 1),
            ("restart_syscall", 0), ("clock_gettime", 2),
            ("clock_gettime64", 2), ("clock_getres", 2),
            ("clock_nanosleep", 4), ("clock_nanosleep_time64", 4),
            ("time", 1), ("openat", 4), ("newfstatat", 4), ("fstatat64", 4),
            ("stat64", 2), ("lstat64", 2), ("fstat64", 2), ("faccessat", 3),
            ("faccessat2", 4), ("pselect6", 6), ("ppoll", 5),
            ("set_robust_list", 2), ("get_robust_list", 3),
            ("prlimit64", 4), ("getcpu", 3), ("getrandom", 3),
            ("memfd_create", 2), ("membarrier", 3), ("statx", 5),
            ("rseq", 4), ("pidfd_send_signal", 4), ("close_range", 3),
            ("mlock", 2), ("munlock", 2), ("ioprio_set", 3),
            ("getxattr", 4), ("lgetxattr", 4),
            ("sched_get_priority_max", 1), ("sched_get_priority_min", 1),
        ];
        entries.iter().cloned().collect()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_binds_handlers_to_target_numbers() {
        let abi = Abi::init(crate::CpuArch::X8664).unwrap();
        let table = init_table(&abi);
        let entry = table.get(1).expect("write must be bound");
        assert_eq!(entry.name, "write");
        assert_eq!(entry.params_n, 3);
        // x86-only names are skipped on x86-64.
        assert!(abi.syscall_no_by_name("socketcall").is_err());
    }

    #[test]
    fn param_counts_cover_the_registry() {
        for (name, _) in HANDLER_REGISTRY {
            assert!(
                PARAMS_N_BY_SYSCALL_NAME.contains_key(name),
                "missing parameter count for {}",
                name
            );
        }
    }
}
