//! Identity syscall handlers. Getters answer from the process's cached
//! identity; setters are accepted and ignored — the runtime never changes
//! host credentials on behalf of a guest.

use crate::errors::Result;
use crate::memory;
use crate::process::ArionCpu;
use crate::syscalls::{val, SysRet};

pub fn sys_getpid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().pid as u64)
}

pub fn sys_getppid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().parent.unwrap_or(0) as u64)
}

pub fn sys_getpgrp(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().pgid as u64)
}

pub fn sys_getpgid(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let pid = args[0] as i64;
    let state = uc.get_data();
    if pid == 0 || pid == state.pid as i64 {
        return val(state.pgid as u64);
    }
    let pgid = state
        .group
        .upgrade()
        .and_then(|g| g.borrow().instance_pgid(pid as libc::pid_t))
        .unwrap_or(0);
    val(pgid as u64)
}

pub fn sys_setpgid(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let pid = args[0] as i64;
    let pgid = args[1] as i64;
    let my_pid = uc.get_data().pid;
    if pid == 0 || pid == my_pid as i64 {
        let state = uc.get_data_mut();
        state.pgid = if pgid == 0 { my_pid } else { pgid as libc::pid_t };
    }
    val(0)
}

pub fn sys_getsid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().sid as u64)
}

pub fn sys_setsid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    let state = uc.get_data_mut();
    state.sid = state.pid;
    state.pgid = state.pid;
    val(state.pid as u64)
}

pub fn sys_getuid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().uid as u64)
}

pub fn sys_geteuid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().euid as u64)
}

pub fn sys_getgid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().gid as u64)
}

pub fn sys_getegid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().egid as u64)
}

pub fn sys_ignore_set(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_getresuid(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (uid, euid) = {
        let state = uc.get_data();
        (state.uid as u64, state.euid as u64)
    };
    memory::write_val(uc, args[0], uid, 4)?;
    memory::write_val(uc, args[1], euid, 4)?;
    memory::write_val(uc, args[2], euid, 4)?;
    val(0)
}

pub fn sys_getresgid(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (gid, egid) = {
        let state = uc.get_data();
        (state.gid as u64, state.egid as u64)
    };
    memory::write_val(uc, args[0], gid, 4)?;
    memory::write_val(uc, args[1], egid, 4)?;
    memory::write_val(uc, args[2], egid, 4)?;
    val(0)
}

pub fn sys_getgroups(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_capget(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    // Header is echoed back; the data triple reads as no capabilities.
    if args[1] != 0 {
        memory::write(uc, args[1], &[0u8; 24])?;
    }
    val(0)
}
