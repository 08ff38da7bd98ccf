//! Signal syscall handlers, cooperating with the signal and threading
//! managers.

use libc::pid_t;

use crate::abi;
use crate::errors::{ArionError, Result};
use crate::kernel::KSigaction;
use crate::memory;
use crate::process::{self, ArionCpu};
use crate::signal;
use crate::syscalls::{err, val, SysRet};
use crate::threads;

/// Reads/writes the kernel `struct sigaction` layout: handler, flags,
/// restorer, mask — all pointer-width except the 64-bit mask tail.
pub fn sys_rt_sigaction(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let signo = args[0] as i32;
    let act_addr = args[1];
    let old_act_addr = args[2];
    let ptr_sz = uc.get_data().abi.table.ptr_sz as u64;

    if old_act_addr != 0 {
        if let Some(old) = uc.get_data().signals.sighandler(signo).cloned() {
            memory::write_ptr(uc, old_act_addr, old.handler)?;
            memory::write_ptr(uc, old_act_addr + ptr_sz, old.flags)?;
            memory::write_ptr(uc, old_act_addr + 2 * ptr_sz, old.restorer)?;
            memory::write_val(uc, old_act_addr + 3 * ptr_sz, old.mask, 8)?;
        }
    }
    if act_addr != 0 {
        let action = KSigaction {
            handler: memory::read_ptr(uc, act_addr)?,
            flags: memory::read_ptr(uc, act_addr + ptr_sz)?,
            restorer: memory::read_ptr(uc, act_addr + 2 * ptr_sz)?,
            mask: memory::read_val(uc, act_addr + 3 * ptr_sz, 8)?,
        };
        uc.get_data_mut().signals.set_sighandler(signo, action);
    }
    val(0)
}

pub fn sys_rt_sigprocmask(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_rt_sigreturn(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    if signal::sigreturn(uc)? {
        let ret_reg = uc.get_data().abi.table.sys_ret;
        return val(abi::read_arch_reg(uc, ret_reg)?);
    }
    val(u64::MAX)
}

pub fn sys_sigreturn(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    sys_rt_sigreturn(uc, args)
}

pub fn sys_sigaltstack(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_pause(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    let tid = uc.get_data().threads.running_tid();
    uc.get_data_mut().threads.thread_mut(tid)?.paused = true;
    process::sync_threads(uc)?;
    val(0)
}

pub fn sys_wait4(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let pid = args[0] as i64 as pid_t;
    let stat_addr = args[1];

    match threads::signal_wait_curr(uc, pid, stat_addr) {
        Ok(_) => {}
        Err(ArionError::WaitSameProcess(_)) => return err(libc::ECHILD),
        Err(e) => return Err(e),
    }
    process::sync_threads(uc)?;
    val(0)
}

pub fn sys_waitid(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let idtype = args[0];
    let id = args[1] as i64;

    let wait_pid: pid_t = match idtype {
        crate::kernel::P_PID => id as pid_t,
        crate::kernel::P_PGID => {
            if id != 0 {
                -(id as pid_t)
            } else {
                0
            }
        }
        _ => -1,
    };
    match threads::signal_wait_curr(uc, wait_pid, 0) {
        Ok(_) => {}
        Err(ArionError::WaitSameProcess(_)) => return err(libc::ECHILD),
        Err(e) => return Err(e),
    }
    process::sync_threads(uc)?;
    val(0)
}

pub fn sys_kill(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let pid = args[0] as i64 as pid_t;
    let signo = args[1] as i32;
    let my_pid = uc.get_data().pid;

    if signo == 0 {
        return val(0);
    }
    if pid == my_pid {
        process::send_signal(uc, my_pid, signo)?;
        return val(0);
    }

    let group = uc
        .get_data()
        .group
        .upgrade()
        .ok_or(ArionError::ExpiredWeakPtr("ArionGroup"))?;
    let target = group.borrow().instance(pid)?;
    let mut target = target
        .try_borrow_mut()
        .map_err(|_| ArionError::NoProcessWithPid(pid))?;
    process::send_signal(&mut target.uc, my_pid, signo)?;
    val(0)
}

pub fn sys_tkill(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    // Threads share the process-level signal surface.
    let my_pid = uc.get_data().pid as u64;
    sys_kill(uc, &[my_pid, args[1]])
}

pub fn sys_tgkill(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let tgid = args[0] as i64 as pid_t;
    let tid = args[1] as i64 as pid_t;
    let signo = args[2];
    if tgid <= 0 || tid <= 0 {
        return err(libc::EINVAL);
    }

    let my_pid = uc.get_data().pid;
    if tgid == my_pid {
        if !uc.get_data().threads.threads.contains_key(&tid) {
            return err(libc::EINVAL);
        }
        process::send_signal(uc, my_pid, signo as i32)?;
        process::sync_threads(uc)?;
        return val(0);
    }

    let group = uc
        .get_data()
        .group
        .upgrade()
        .ok_or(ArionError::ExpiredWeakPtr("ArionGroup"))?;
    let target = match group.borrow().instance(tgid) {
        Ok(t) => t,
        Err(_) => return err(libc::EINVAL),
    };
    {
        let mut target = target
            .try_borrow_mut()
            .map_err(|_| ArionError::NoProcessWithPid(tgid))?;
        if !target.state().threads.threads.contains_key(&tid) {
            return err(libc::EINVAL);
        }
        process::send_signal(&mut target.uc, my_pid, signo as i32)?;
    }
    process::sync_threads(uc)?;
    val(0)
}

pub fn sys_alarm(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}
