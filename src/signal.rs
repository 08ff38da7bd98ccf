//! Signal manager: synchronous fault translation, per-process signal
//! handler table, user handler trampolines and default dispositions.

use std::cell::Cell;
use std::rc::Rc;

use libc::pid_t;

use crate::abi::{self, RegMap};
use crate::context;
use crate::errors::{ArionError, Result};
use crate::hooks;
use crate::kernel::{KSigaction, SA_SIGINFO};
use crate::cpu;
use crate::memory;
use crate::process::{self, Arion, ArionCpu};

const SIGINFO_SZ: u64 = 128;

/// Per-process signal state.
#[derive(Default)]
pub struct SignalTable {
    handlers: std::collections::HashMap<i32, KSigaction>,
    /// Register file captured at SA_SIGINFO delivery, reloaded by
    /// sigreturn.
    saved_ucontext: Option<RegMap>,
}

impl SignalTable {
    pub fn has_sighandler(&self, signo: i32) -> bool {
        self.handlers.contains_key(&signo)
    }

    pub fn sighandler(&self, signo: i32) -> Option<&KSigaction> {
        self.handlers.get(&signo)
    }

    pub fn set_sighandler(&mut self, signo: i32, action: KSigaction) {
        self.handlers.insert(signo, action);
    }
}

pub fn signal_name(signo: i32) -> Option<&'static str> {
    Some(match signo {
        libc::SIGFPE => "SIGFPE (Floating-point exception)",
        libc::SIGILL => "SIGILL (Illegal instruction)",
        libc::SIGSEGV => "SIGSEGV (Segmentation fault)",
        libc::SIGBUS => "SIGBUS (Bus error)",
        libc::SIGTRAP => "SIGTRAP (Trace or breakpoint trap)",
        libc::SIGABRT => "SIGABRT (Abort)",
        libc::SIGSYS => "SIGSYS (Bad system call)",
        libc::SIGHUP => "SIGHUP (Hangup)",
        libc::SIGINT => "SIGINT (Interrupt)",
        libc::SIGQUIT => "SIGQUIT (Quit)",
        libc::SIGKILL => "SIGKILL (Killed)",
        libc::SIGPIPE => "SIGPIPE (Broken pipe)",
        libc::SIGALRM => "SIGALRM (Alarm clock)",
        libc::SIGTERM => "SIGTERM (Terminated)",
        libc::SIGUSR1 => "SIGUSR1 (User signal 1)",
        libc::SIGUSR2 => "SIGUSR2 (User signal 2)",
        libc::SIGCHLD => "SIGCHLD (Child status)",
        libc::SIGPWR => "SIGPWR (Power fail)",
        libc::SIGWINCH => "SIGWINCH (Window size change)",
        libc::SIGURG => "SIGURG (Urgent socket condition)",
        libc::SIGPOLL => "SIGPOLL (Socket I/O possible)",
        libc::SIGSTOP => "SIGSTOP (Stopped (signal))",
        libc::SIGTSTP => "SIGTSTP (Stopped (user))",
        libc::SIGCONT => "SIGCONT (Continued)",
        libc::SIGTTIN => "SIGTTIN (Stopped (tty input))",
        libc::SIGTTOU => "SIGTTOU (Stopped (tty output))",
        libc::SIGVTALRM => "SIGVTALRM (Virtual timer expired)",
        libc::SIGPROF => "SIGPROF (Profiling timer expired)",
        libc::SIGXCPU => "SIGXCPU (CPU time limit exceeded)",
        libc::SIGXFSZ => "SIGXFSZ (File size limit exceeded)",
        _ => return None,
    })
}

/// Installs the fault-translation hooks: CPU interrupts resolve through
/// the IDT to a signal; invalid memory accesses and undecodable
/// instructions deliver SIGSEGV/SIGILL. Runs once per process.
pub fn install_fault_hooks(uc: &mut ArionCpu) -> Result<()> {
    hooks::hook_intr(
        uc,
        Rc::new(|uc, intno| {
            if uc.get_data().abi.has_idt_entry(intno as u64) {
                let intr = uc.get_data().abi.idt_entry(intno as u64)?;
                let signo = abi::signal_from_intr(intr)?;
                let pid = uc.get_data().pid;
                handle_signal(uc, pid, signo)?;
            }
            Ok(())
        }),
    )?;

    let segv: hooks::MemCallback = Rc::new(|uc, _access, _addr, _sz, _val| {
        let pid = uc.get_data().pid;
        handle_signal(uc, pid, libc::SIGSEGV)?;
        // Returning true to the backend is not enough to recover cleanly;
        // the run must also leave at the next safe point.
        process::sync_threads(uc)?;
        Ok(true)
    });
    hooks::hook_mem_read_unmapped(uc, 0, u64::MAX, segv.clone())?;
    hooks::hook_mem_write_unmapped(uc, 0, u64::MAX, segv.clone())?;
    hooks::hook_mem_fetch_unmapped(uc, 0, u64::MAX, segv.clone())?;
    hooks::hook_mem_read_prot(uc, 0, u64::MAX, segv.clone())?;
    hooks::hook_mem_write_prot(uc, 0, u64::MAX, segv.clone())?;
    hooks::hook_mem_fetch_prot(uc, 0, u64::MAX, segv)?;

    hooks::hook_insn_invalid(
        uc,
        Rc::new(|uc| {
            let pid = uc.get_data().pid;
            handle_signal(uc, pid, libc::SIGILL)?;
            process::sync_threads(uc)?;
            Ok(true)
        }),
    )?;
    Ok(())
}

/// Runs an installed user handler: saves the context, frames the call on
/// the guest stack, repoints the PC and arms a transient restore hook at
/// the return address.
fn handle_sighandler(uc: &mut ArionCpu, source_pid: pid_t, signo: i32) -> Result<bool> {
    let action = match uc.get_data().signals.sighandler(signo) {
        Some(a) => a.clone(),
        None => return Ok(false),
    };
    let (pc_reg, sp_reg, ptr_sz, param_regs) = {
        let table = uc.get_data().abi.table;
        (table.pc, table.sp, table.ptr_sz, table.call_params)
    };

    let ctx = Rc::new(context::save(uc)?);
    let curr_pc = abi::read_arch_reg(uc, pc_reg)?;
    abi::write_arch_reg(uc, pc_reg, action.handler)?;

    let mut siginfo_ptr = 0u64;
    if action.flags & SA_SIGINFO != 0 {
        // ucontext is not materialized; the raw register file is kept for
        // sigreturn instead and the third parameter stays NULL.
        let saved = abi::dump_regs(uc)?;
        uc.get_data_mut().signals.saved_ucontext = Some(saved);

        let mut info = vec![0u8; SIGINFO_SZ as usize];
        info[0..4].copy_from_slice(&signo.to_le_bytes());
        let pid_off = if ptr_sz == 8 { 16 } else { 12 };
        info[pid_off..pid_off + 4].copy_from_slice(&source_pid.to_le_bytes());
        let sp = abi::read_arch_reg(uc, sp_reg)? - SIGINFO_SZ;
        abi::write_arch_reg(uc, sp_reg, sp)?;
        memory::write(uc, sp, &info)?;
        siginfo_ptr = sp;
    }

    if param_regs.is_empty() {
        // Stack-parameter convention: arguments in reverse, return address
        // pushed last below.
        if action.flags & SA_SIGINFO != 0 {
            memory::stack_push(uc, 0)?;
            memory::stack_push(uc, siginfo_ptr)?;
        }
        memory::stack_push(uc, signo as u64)?;
    } else {
        abi::write_arch_reg(uc, param_regs[0], signo as u64)?;
        if action.flags & SA_SIGINFO != 0 && param_regs.len() >= 3 {
            abi::write_arch_reg(uc, param_regs[1], siginfo_ptr)?;
            abi::write_arch_reg(uc, param_regs[2], 0)?;
        }
    }
    memory::stack_push(uc, curr_pc)?;

    // The PC was rewritten under the translator's feet.
    cpu::remove_cache(uc, curr_pc, curr_pc + 1)?;

    let hook_id = Rc::new(Cell::new(0u64));
    let hook_id_inner = hook_id.clone();
    let id = hooks::hook_addr(
        uc,
        curr_pc,
        Rc::new(move |uc, _addr, _sz| {
            context::restore(uc, &ctx, false)?;
            hooks::unhook(uc, hook_id_inner.get())
        }),
    )?;
    hook_id.set(id);
    Ok(true)
}

/// Completes a pending sigwait on SIGCHLD arrival: writes the wait status,
/// places the child pid in the syscall return register and reaps the
/// child.
fn handle_sigchld(uc: &mut ArionCpu, source_pid: pid_t) -> Result<()> {
    let (running_tid, target_pid) = {
        let state = uc.get_data();
        let tid = state.threads.running_tid();
        match state.threads.sigwait.get(&tid) {
            Some(&pid) => (tid, pid),
            None => return Ok(()),
        }
    };

    let (pgid, has_child) = {
        let state = uc.get_data();
        (state.pgid, state.children.contains(&source_pid))
    };
    let source_pgid = {
        let group = uc
            .get_data()
            .group
            .upgrade()
            .ok_or(ArionError::ExpiredWeakPtr("ArionGroup"))?;
        let pgid = group.borrow().instance_pgid(source_pid);
        pgid
    };

    let matches = target_pid == source_pid
        || (target_pid == 0 && has_child && source_pgid == Some(pgid))
        || (target_pid == -1 && has_child)
        || (target_pid < -1 && has_child && source_pgid == Some(-target_pid));
    if !matches {
        return Ok(());
    }

    let (wait_status_addr, sys_ret) = {
        let state = uc.get_data_mut();
        let thread = state.threads.thread_mut(running_tid)?;
        thread.paused = false;
        let addr = thread.wait_status_addr;
        thread.wait_status_addr = 0;
        (addr, state.abi.table.sys_ret)
    };
    if wait_status_addr != 0 {
        memory::write_val(uc, wait_status_addr, 0, 4)?;
    }
    abi::write_arch_reg(uc, sys_ret, source_pid as u64)?;
    {
        let state = uc.get_data_mut();
        state.children.retain(|&c| c != source_pid);
        state.threads.sigwait.remove(&running_tid);
    }
    // Detach the reaped child so the group can collect the zombie.
    if let Some(group) = uc.get_data().group.upgrade() {
        let child = group.borrow().instance(source_pid).ok();
        if let Some(child) = child {
            if let Ok(mut child) = child.try_borrow_mut() {
                child.state_mut().parent = None;
            }
        }
    }
    Ok(())
}

/// Delivers `signo` to this process: user handler if installed, default
/// disposition otherwise.
pub fn handle_signal(uc: &mut ArionCpu, source_pid: pid_t, signo: i32) -> Result<()> {
    let desc = signal_name(signo).ok_or_else(|| {
        let state = uc.get_data();
        ArionError::UnknownSignal(state.pid, state.threads.running_tid(), signo)
    })?;
    debug!("SIGNAL -> {}", desc);

    if handle_sighandler(uc, source_pid, signo)? {
        return Ok(());
    }

    match signo {
        libc::SIGFPE | libc::SIGILL | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP
        | libc::SIGABRT | libc::SIGSYS => {
            let state = uc.get_data();
            Err(ArionError::UnhandledSyncSignal(
                state.pid,
                state.threads.running_tid(),
                desc.to_string(),
            ))
        }
        libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU => {
            uc.get_data_mut().run.stopped = true;
            process::sync_threads(uc)
        }
        libc::SIGCONT => {
            uc.get_data_mut().run.stopped = false;
            Ok(())
        }
        libc::SIGCHLD => handle_sigchld(uc, source_pid),
        libc::SIGKILL | libc::SIGTERM | libc::SIGHUP | libc::SIGINT | libc::SIGQUIT
        | libc::SIGPIPE | libc::SIGALRM | libc::SIGUSR1 | libc::SIGUSR2 | libc::SIGVTALRM
        | libc::SIGPROF | libc::SIGXCPU | libc::SIGXFSZ => process::stop(uc),
        _ => Ok(()),
    }
}

/// Marks `target_tid` as waiting for a signal from `source_pid`.
pub fn wait_for_sig(
    state: &mut Arion,
    target_tid: pid_t,
    source_pid: pid_t,
    wait_status_addr: u64,
) -> Result<()> {
    if state.threads.sigwait.contains_key(&target_tid) {
        return Err(ArionError::ThreadAlreadySigWaiting(state.pid, target_tid));
    }
    let thread = state.threads.thread_mut(target_tid)?;
    thread.paused = true;
    thread.wait_status_addr = wait_status_addr;
    state.threads.sigwait.insert(target_tid, source_pid);
    Ok(())
}

/// Reverses a user handler invocation by reloading the register file
/// captured at delivery.
pub fn sigreturn(uc: &mut ArionCpu) -> Result<bool> {
    let saved = match uc.get_data_mut().signals.saved_ucontext.take() {
        Some(regs) => regs,
        None => return Ok(false),
    };
    abi::load_regs(uc, &saved)?;
    Ok(true)
}
