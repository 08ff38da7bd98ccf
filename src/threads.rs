//! Guest threading: cooperative time-sliced scheduling of guest threads
//! over the single backend CPU, plus the futex wait-queue subset the
//! syscall layer relies on.
//!
//! At most one guest thread runs at a time. A descheduled thread's
//! register file lives in its [`ArionThread::regs`]; the running thread's
//! registers live in the backend and its `regs` is `None`.

use std::collections::{BTreeMap, HashMap};

use libc::pid_t;

use crate::abi::{self, RegMap};
use crate::errors::{ArionError, Result};
use crate::kernel::{CLONE_CHILD_SETTID, CLONE_PARENT_SETTID, CLONE_SETTLS};
use crate::process::{Arion, ArionCpu};
use crate::{Addr, CpuArch};

/// One guest thread.
#[derive(Clone, Debug, Default)]
pub struct ArionThread {
    pub tid: pid_t,
    pub tgid: pid_t,
    pub exit_signal: i32,
    pub flags: u64,
    pub child_tid_addr: Addr,
    pub parent_tid_addr: Addr,
    /// Saved register map; `None` while this thread is the running one.
    pub regs: Option<RegMap>,
    /// Saved TLS base, maintained through the ABI's TLS dump/load hooks.
    pub tls: Addr,
    pub paused: bool,
    /// Guest address to store the wait status at when a sigwait completes.
    pub wait_status_addr: Addr,
    pub robust_list_head: Addr,
    pub rseq_addr: Addr,
    pub rseq_len: u32,
    pub rseq_sig: u32,
}

impl ArionThread {
    pub fn new(
        exit_signal: i32,
        flags: u64,
        child_tid_addr: Addr,
        parent_tid_addr: Addr,
        regs: Option<RegMap>,
    ) -> ArionThread {
        ArionThread {
            exit_signal,
            flags,
            child_tid_addr,
            parent_tid_addr,
            regs,
            ..Default::default()
        }
    }
}

/// A thread parked on a futex word.
#[derive(Clone, Debug, PartialEq)]
pub struct FutexEntry {
    pub addr: Addr,
    pub bitmask: u32,
    pub tid: pid_t,
}

/// Per-process thread table. BTreeMap keeps round-robin order stable.
pub struct ThreadTable {
    pub threads: BTreeMap<pid_t, ArionThread>,
    pub futexes: HashMap<Addr, Vec<FutexEntry>>,
    /// tid -> pid selector the thread is sigwaiting on.
    pub sigwait: HashMap<pid_t, pid_t>,
    running_tid: pid_t,
    next_tid: pid_t,
    free_tids: Vec<pid_t>,
}

impl Default for ThreadTable {
    fn default() -> ThreadTable {
        ThreadTable {
            threads: BTreeMap::new(),
            futexes: HashMap::new(),
            sigwait: HashMap::new(),
            running_tid: 1,
            next_tid: 1,
            free_tids: Vec::new(),
        }
    }
}

impl ThreadTable {
    fn gen_next_id(&mut self) -> Result<pid_t> {
        if let Some(tid) = self.free_tids.pop() {
            return Ok(tid);
        }
        if self.next_tid == pid_t::MAX {
            return Err(ArionError::TooManyThreads);
        }
        let tid = self.next_tid;
        self.next_tid += 1;
        Ok(tid)
    }

    pub fn running_tid(&self) -> pid_t {
        self.running_tid
    }

    pub fn set_running_tid(&mut self, tid: pid_t) {
        self.running_tid = tid;
    }

    pub fn count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, tid: pid_t) -> Result<&ArionThread> {
        self.threads.get(&tid).ok_or(ArionError::WrongThreadId(tid))
    }

    pub fn thread_mut(&mut self, tid: pid_t) -> Result<&mut ArionThread> {
        self.threads
            .get_mut(&tid)
            .ok_or(ArionError::WrongThreadId(tid))
    }

    /// Successor of the running tid in stable table order, wrapping.
    fn next_tid_after_running(&self) -> Option<pid_t> {
        let mut iter = self.threads.range((self.running_tid + 1)..);
        if let Some((&tid, _)) = iter.next() {
            return Some(tid);
        }
        self.threads.keys().next().copied()
    }
}

/// Registers `thread` under a fresh tid and returns it. The first thread
/// of a process becomes the running one.
pub fn add_thread(state: &mut Arion, mut thread: ArionThread) -> Result<pid_t> {
    let tid = state.threads.gen_next_id()?;
    thread.tid = tid;
    thread.tgid = state.pid;
    if state.threads.threads.is_empty() {
        state.threads.running_tid = tid;
    }
    state.threads.threads.insert(tid, thread);
    Ok(tid)
}

/// Removes a thread; removing the running thread switches to the next one
/// first. Tids are recycled once the table is non-empty, and the counter
/// resets when the last thread leaves.
pub fn remove_thread(uc: &mut ArionCpu, tid: pid_t) -> Result<()> {
    if !uc.get_data().threads.threads.contains_key(&tid) {
        return Err(ArionError::WrongThreadId(tid));
    }
    if uc.get_data().threads.count() > 1 {
        switch_to_next_thread(uc)?;
    }
    let state = uc.get_data_mut();
    state.threads.threads.remove(&tid);
    if state.threads.threads.is_empty() {
        state.threads.free_tids.clear();
        state.threads.next_tid = 1;
    } else {
        state.threads.free_tids.push(tid);
    }
    Ok(())
}

pub fn clear_threads(state: &mut Arion) {
    state.threads.threads.clear();
    state.threads.futexes.clear();
    state.threads.sigwait.clear();
    state.threads.free_tids.clear();
    state.threads.next_tid = 1;
}

/// Creates a guest thread for a `clone(CLONE_THREAD)` call, honoring the
/// architecture's TLS convention and the set-tid clone flags.
pub fn clone_thread(
    uc: &mut ArionCpu,
    flags: u64,
    new_sp: Addr,
    new_tls: Addr,
    child_tid_addr: Addr,
    parent_tid_addr: Addr,
    exit_signal: i32,
) -> Result<pid_t> {
    let (arch, pc_reg, sp_reg, sys_ret_reg, tls_reg) = {
        let table = uc.get_data().abi.table;
        (table.arch, table.pc, table.sp, table.sys_ret, table.tls)
    };

    let pc = abi::read_arch_reg(uc, pc_reg)?;
    let sp = if new_sp != 0 {
        new_sp
    } else {
        abi::read_arch_reg(uc, sp_reg)?
    };

    let mut tls_addr = new_tls;
    match arch {
        CpuArch::X8664 => {
            if new_tls == 0 || flags & CLONE_SETTLS == 0 {
                if let Some(tls_reg) = tls_reg {
                    tls_addr = abi::read_arch_reg(uc, tls_reg)?;
                }
            }
        }
        CpuArch::X86 => {
            if new_tls != 0 {
                // new_tls points at a user_desc; route it through the GDT.
                let base = crate::memory::read_val(uc, new_tls + 4, 4)?;
                crate::abi::gdt::load_tls_base(uc, base)?;
                tls_addr = base;
            }
        }
        _ => {}
    }

    let mut regs = abi::init_thread_regs(uc, pc, sp, Some(tls_addr))?;
    regs.insert(sys_ret_reg, 0);
    let mut thread = ArionThread::new(exit_signal, flags, child_tid_addr, parent_tid_addr, Some(regs));
    thread.tls = tls_addr;

    if arch == CpuArch::Arm && new_tls != 0 {
        let ops = uc.get_data().abi.ops.clone();
        ops.load_tls(uc, new_tls)?;
    }

    let parent_tid = uc.get_data().threads.running_tid();
    let child_tid = add_thread(uc.get_data_mut(), thread)?;
    if flags & CLONE_CHILD_SETTID != 0 {
        crate::memory::write_val(uc, child_tid_addr, child_tid as u64, 4)?;
    }
    if flags & CLONE_PARENT_SETTID != 0 {
        crate::memory::write_val(uc, parent_tid_addr, parent_tid as u64, 4)?;
    }
    Ok(child_tid)
}

/// Saves the running thread's registers and TLS and loads `tid`'s.
pub fn switch_to_thread(uc: &mut ArionCpu, tid: pid_t) -> Result<()> {
    let running_tid = uc.get_data().threads.running_tid();
    if running_tid == tid {
        return Ok(());
    }
    if !uc.get_data().threads.threads.contains_key(&tid) {
        return Err(ArionError::WrongThreadId(tid));
    }

    let ops = uc.get_data().abi.ops.clone();
    let curr_regs = abi::dump_regs(uc)?;
    let curr_tls = ops.dump_tls(uc)?;
    {
        let curr = uc.get_data_mut().threads.thread_mut(running_tid)?;
        curr.regs = Some(curr_regs);
        curr.tls = curr_tls;
    }

    let (next_regs, next_tls) = {
        let next = uc.get_data_mut().threads.thread_mut(tid)?;
        (next.regs.take(), next.tls)
    };
    if let Some(regs) = next_regs {
        abi::load_regs(uc, &regs)?;
    }
    if next_tls != 0 {
        ops.load_tls(uc, next_tls)?;
    }
    uc.get_data_mut().threads.set_running_tid(tid);
    trace!("switched to thread {}", tid);
    Ok(())
}

/// Round-robin to the successor of the running thread.
pub fn switch_to_next_thread(uc: &mut ArionCpu) -> Result<()> {
    match uc.get_data().threads.next_tid_after_running() {
        Some(tid) if tid != uc.get_data().threads.running_tid() => switch_to_thread(uc, tid),
        _ => Ok(()),
    }
}

/// Parks `tid` on `addr` with `bitmask` and pauses it.
pub fn futex_wait(state: &mut Arion, tid: pid_t, addr: Addr, bitmask: u32) -> Result<()> {
    state.threads.thread_mut(tid)?.paused = true;
    state
        .threads
        .futexes
        .entry(addr)
        .or_insert_with(Vec::new)
        .push(FutexEntry { addr, bitmask, tid });
    Ok(())
}

pub fn futex_wait_curr(state: &mut Arion, addr: Addr, bitmask: u32) -> Result<()> {
    let tid = state.threads.running_tid();
    futex_wait(state, tid, addr, bitmask)
}

/// Unpauses every waiter on `addr` whose stored bitmask intersects
/// `bitmask`; waiters with disjoint masks stay parked. Returns the number
/// of woken threads.
pub fn futex_wake(state: &mut Arion, addr: Addr, bitmask: u32) -> Result<usize> {
    let waiters = match state.threads.futexes.remove(&addr) {
        Some(w) => w,
        None => return Ok(0),
    };
    let mut kept = Vec::new();
    let mut woken = 0;
    for entry in waiters {
        if entry.bitmask & bitmask != 0 {
            state.threads.thread_mut(entry.tid)?.paused = false;
            woken += 1;
        } else {
            kept.push(entry);
        }
    }
    if !kept.is_empty() {
        state.threads.futexes.insert(addr, kept);
    }
    Ok(woken)
}

/// Parks the running thread until a matching SIGCHLD arrives. Returns
/// false (no wait entered) when no candidate child exists.
pub fn signal_wait_curr(uc: &mut ArionCpu, source_pid: pid_t, wait_status_addr: Addr) -> Result<bool> {
    let (pid, pgid, target_tid) = {
        let state = uc.get_data();
        (state.pid, state.pgid, state.threads.running_tid())
    };
    if source_pid == pid {
        return Err(ArionError::WaitSameProcess(source_pid));
    }

    let group = uc
        .get_data()
        .group
        .upgrade()
        .ok_or(ArionError::ExpiredWeakPtr("ArionGroup"))?;
    let has_candidate = {
        let group = group.borrow();
        let state = uc.get_data();
        if source_pid > 0 {
            group.has_instance(source_pid)
        } else if source_pid == 0 {
            state
                .children
                .iter()
                .any(|&c| group.instance_pgid(c) == Some(pgid))
        } else if source_pid == -1 {
            !state.children.is_empty()
        } else {
            state
                .children
                .iter()
                .any(|&c| group.instance_pgid(c) == Some(-source_pid))
        }
    };
    if !has_candidate {
        return Ok(false);
    }

    crate::signal::wait_for_sig(uc.get_data_mut(), target_tid, source_pid, wait_status_addr)?;
    Ok(true)
}

/// Whether the running thread is blocked: stopped process, zombie process,
/// futex wait or sigwait.
pub fn is_curr_locked(uc: &ArionCpu) -> bool {
    let state = uc.get_data();
    if state.run.stopped || state.run.zombie {
        return true;
    }
    state
        .threads
        .thread(state.threads.running_tid())
        .map(|t| t.paused)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(tids: &[pid_t]) -> ThreadTable {
        let mut table = ThreadTable::default();
        for &tid in tids {
            table.threads.insert(tid, ArionThread::default());
        }
        table
    }

    #[test]
    fn fresh_tids_are_smallest_unused() {
        let mut table = ThreadTable::default();
        assert_eq!(table.gen_next_id().unwrap(), 1);
        assert_eq!(table.gen_next_id().unwrap(), 2);
        table.free_tids.push(1);
        assert_eq!(table.gen_next_id().unwrap(), 1);
        assert_eq!(table.gen_next_id().unwrap(), 3);
    }

    #[test]
    fn round_robin_wraps_in_order() {
        let mut table = table_with(&[1, 3, 7]);
        table.set_running_tid(1);
        assert_eq!(table.next_tid_after_running(), Some(3));
        table.set_running_tid(3);
        assert_eq!(table.next_tid_after_running(), Some(7));
        table.set_running_tid(7);
        assert_eq!(table.next_tid_after_running(), Some(1));
    }

    #[test]
    fn futex_wake_respects_bitmask() {
        let mut state = crate::process::Arion::new_for_tests();
        state.threads = table_with(&[1, 2]);
        futex_wait(&mut state, 1, 0x1000, 0x1).unwrap();
        futex_wait(&mut state, 2, 0x1000, 0x2).unwrap();
        assert!(state.threads.thread(1).unwrap().paused);
        assert!(state.threads.thread(2).unwrap().paused);

        let woken = futex_wake(&mut state, 0x1000, 0x1).unwrap();
        assert_eq!(woken, 1);
        assert!(!state.threads.thread(1).unwrap().paused);
        assert!(state.threads.thread(2).unwrap().paused);
        // The disjoint-mask waiter is retained.
        assert_eq!(state.threads.futexes.get(&0x1000).unwrap().len(), 1);

        let woken = futex_wake(&mut state, 0x1000, 0xFFFF_FFFF).unwrap();
        assert_eq!(woken, 1);
        assert!(state.threads.futexes.get(&0x1000).is_none());
    }

    #[test]
    fn futex_wake_on_empty_queue_is_zero() {
        let mut state = crate::process::Arion::new_for_tests();
        assert_eq!(futex_wake(&mut state, 0xdead, 0xFFFF_FFFF).unwrap(), 0);
    }
}
