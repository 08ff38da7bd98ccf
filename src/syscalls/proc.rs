//! Process-control syscall handlers: fork/clone/execve/exit, futex, TLS
//! and the per-thread bookkeeping calls.

use libc::pid_t;

use crate::abi;
use crate::context;
use crate::errors::{ArionError, Result};
use crate::hooks::{self, HookKind};
use crate::kernel::*;
use crate::memory;
use crate::process::{self, ArionCpu, Process};
use crate::structs;
use crate::syscalls::{err, val, SysRet};
use crate::threads;
use crate::CpuArch;

/// Deep-copies the calling process into a new group member. The child
/// resumes right after the syscall instruction with a zero return value.
fn fork_process(uc: &mut ArionCpu) -> Result<pid_t> {
    let ctx = context::save(uc)?;
    let (args, env, fs_root, cwd, config, baremetal, my_pid, my_pgid) = {
        let state = uc.get_data();
        (
            state.program_args.clone(),
            state.program_env.clone(),
            state.fs.fs_path().to_string(),
            state.fs.cwd_path().to_string(),
            state.config.clone(),
            state.baremetal.clone(),
            state.pid,
            state.pgid,
        )
    };

    let child = match baremetal {
        Some(bm) => Process::new_baremetal_instance(bm, &fs_root, env, &cwd, config)?,
        None => Process::new_instance(args, &fs_root, env, &cwd, config)?,
    };

    let group = uc
        .get_data()
        .group
        .upgrade()
        .ok_or(ArionError::ExpiredWeakPtr("ArionGroup"))?;
    group
        .borrow_mut()
        .add_instance(child.clone(), None, Some(my_pgid));

    let child_pid = {
        let mut child_ref = child.borrow_mut();
        context::restore(&mut child_ref.uc, &ctx, true)?;
        let child_pid = child_ref.pid();
        let state = child_ref.state_mut();
        state.parent = Some(my_pid);
        for thread in state.threads.threads.values_mut() {
            thread.tgid = child_pid;
        }
        let ret_reg = child_ref.state().abi.table.sys_ret;
        abi::write_arch_reg(&mut child_ref.uc, ret_reg, 0)?;
        child_pid
    };
    uc.get_data_mut().children.push(child_pid);
    hooks::trigger_process_hook(uc, HookKind::Fork, &child)?;
    Ok(child_pid)
}

pub fn sys_fork(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    let child_pid = fork_process(uc)?;
    process::sync_threads(uc)?;
    val(child_pid as u64)
}

pub fn sys_clone(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let clone_flags = args[0];
    let new_sp = args[1];
    let parent_tidptr = args[2];
    let (mut child_tidptr, mut new_tls) = (args[3], args[4]);
    // Every target but x86-64 swaps the last two clone arguments.
    if uc.get_data().abi.table.arch != CpuArch::X8664 {
        std::mem::swap(&mut child_tidptr, &mut new_tls);
    }

    let child = if clone_flags & CLONE_THREAD != 0 {
        threads::clone_thread(uc, clone_flags, new_sp, new_tls, child_tidptr, parent_tidptr, 0)?
    } else {
        fork_process(uc)?
    };
    process::sync_threads(uc)?;
    val(child as u64)
}

pub fn sys_clone3(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fields = structs::CLONE_ARGS.build(uc, args[0])?;
    let flags = structs::field(&fields, "flags")?;
    let stack = structs::field(&fields, "stack")?;
    let stack_size = structs::field(&fields, "stack_size")?;
    let tls = structs::field(&fields, "tls")?;
    let child_tid = structs::field(&fields, "child_tid")?;
    let parent_tid = structs::field(&fields, "parent_tid")?;
    let exit_signal = structs::field(&fields, "exit_signal")? as i32;

    let child = if flags & CLONE_THREAD != 0 {
        threads::clone_thread(
            uc,
            flags,
            stack + stack_size,
            tls,
            child_tid,
            parent_tid,
            exit_signal,
        )?
    } else {
        fork_process(uc)?
    };
    process::sync_threads(uc)?;
    val(child as u64)
}

pub fn sys_execve(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let file_name = memory::read_c_string(uc, args[0])?;
    let file_path = crate::fs::to_fs_path(uc, &file_name);
    if file_path.is_empty() {
        return err(libc::EACCES);
    }

    let mut argv = Vec::new();
    if args[1] != 0 {
        for ptr in memory::read_ptr_arr(uc, args[1])? {
            argv.push(memory::read_c_string(uc, ptr)?);
        }
    }
    if argv.is_empty() {
        argv.push(file_path.clone());
    } else {
        argv[0] = file_path;
    }
    let mut envp = Vec::new();
    if args[2] != 0 {
        for ptr in memory::read_ptr_arr(uc, args[2])? {
            envp.push(memory::read_c_string(uc, ptr)?);
        }
    }

    let (fs_root, cwd, config, my_pid, my_pgid, my_parent) = {
        let state = uc.get_data();
        (
            state.fs.fs_path().to_string(),
            state.fs.cwd_path().to_string(),
            state.config.clone(),
            state.pid,
            state.pgid,
            state.parent,
        )
    };

    let new_inst = Process::new_instance(argv, &fs_root, envp, &cwd, config)?;
    let group = uc
        .get_data()
        .group
        .upgrade()
        .ok_or(ArionError::ExpiredWeakPtr("ArionGroup"))?;
    group
        .borrow_mut()
        .add_instance(new_inst.clone(), Some(my_pid), Some(my_pgid));
    new_inst.borrow_mut().state_mut().parent = my_parent;

    hooks::trigger_process_hook(uc, HookKind::Execve, &new_inst)?;
    process::stop(uc)?;
    val(0)
}

fn clear_child_tid(uc: &mut ArionCpu, tid: pid_t) -> Result<()> {
    let (flags, child_tid_addr) = {
        let thread = uc.get_data().threads.thread(tid)?;
        (thread.flags, thread.child_tid_addr)
    };
    if flags & CLONE_CHILD_CLEARTID != 0 && child_tid_addr != 0 {
        memory::write_val(uc, child_tid_addr, 0, 4)?;
        threads::futex_wake(uc.get_data_mut(), child_tid_addr, FUTEX_BITSET_MATCH_ANY)?;
    }
    Ok(())
}

/// The terminating thread's PC is rewound by one syscall instruction so
/// the thread switched to resumes its own pending syscall correctly.
fn rewind_syscall_pc(uc: &mut ArionCpu) -> Result<u64> {
    let ops = uc.get_data().abi.ops.clone();
    let insn_sz = ops.sys_insn_sz(uc);
    let (pc_reg, ret_reg) = {
        let table = uc.get_data().abi.table;
        (table.pc, table.sys_ret)
    };
    let pc = abi::read_arch_reg(uc, pc_reg)?;
    abi::write_arch_reg(uc, pc_reg, pc - insn_sz)?;
    abi::read_arch_reg(uc, ret_reg)
}

pub fn sys_exit(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let code = args[0] as i32;
    let tid = uc.get_data().threads.running_tid();
    clear_child_tid(uc, tid)?;
    threads::remove_thread(uc, tid)?;
    if uc.get_data().threads.count() == 0 {
        uc.get_data_mut().run.exit_code = Some(code);
    }
    process::sync_threads(uc)?;
    val(rewind_syscall_pc(uc)?)
}

pub fn sys_exit_group(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let code = args[0] as i32;
    let tids: Vec<pid_t> = uc.get_data().threads.threads.keys().copied().collect();
    for tid in tids.iter() {
        clear_child_tid(uc, *tid)?;
    }
    for tid in tids {
        threads::remove_thread(uc, tid)?;
    }
    uc.get_data_mut().run.exit_code = Some(code);
    process::sync_threads(uc)?;
    val(rewind_syscall_pc(uc)?)
}

pub fn sys_futex(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let uaddr = args[0];
    let op = args[1] as u32;
    let value = args[2] as u32;
    let val3 = args[5] as u32;

    let masked_op = op & (FUTEX_PRIVATE_FLAG - 1);
    let ret = match masked_op {
        FUTEX_WAIT | FUTEX_WAIT_BITSET => {
            let current = if uaddr != 0 {
                memory::read_val(uc, uaddr, 4)? as u32
            } else {
                0
            };
            if current != value {
                process::sync_threads(uc)?;
                return err(libc::EAGAIN);
            }
            let mask = if masked_op == FUTEX_WAIT {
                FUTEX_BITSET_MATCH_ANY
            } else {
                val3
            };
            threads::futex_wait_curr(uc.get_data_mut(), uaddr, mask)?;
            0
        }
        FUTEX_WAKE | FUTEX_WAKE_BITSET => {
            let mask = if masked_op == FUTEX_WAKE {
                FUTEX_BITSET_MATCH_ANY
            } else {
                val3
            };
            threads::futex_wake(uc.get_data_mut(), uaddr, mask)? as u64
        }
        _ => 0,
    };
    process::sync_threads(uc)?;
    val(ret)
}

pub fn sys_set_tid_address(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let tid_ptr = args[0];
    let tid = uc.get_data().threads.running_tid();
    uc.get_data_mut().threads.thread_mut(tid)?.child_tid_addr = tid_ptr;
    memory::write_val(uc, tid_ptr, tid as u64, 4)?;
    val(tid as u64)
}

/// x86 thread areas route through the GDT; the chosen descriptor index is
/// written back into the guest's user_desc.
pub fn sys_set_thread_area(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let u_info_addr = args[0];
    if u_info_addr == 0 {
        return err(libc::EFAULT);
    }
    if uc.get_data().abi.table.arch != CpuArch::X86 {
        return err(libc::ENOSYS);
    }

    let mut entry_number = memory::read_val(uc, u_info_addr, 4)? as u32;
    let base = memory::read_val(uc, u_info_addr + 4, 4)? as u32;
    let limit = memory::read_val(uc, u_info_addr + 8, 4)? as u32;

    if entry_number == 0xFFFF_FFFF {
        entry_number = abi::gdt::find_free_idx(uc, 12)? as u32;
    }
    abi::gdt::insert_entry(
        uc,
        entry_number as u8,
        base,
        limit,
        abi::gdt::A_PRESENT
            | abi::gdt::A_DATA
            | abi::gdt::A_DATA_WRITABLE
            | abi::gdt::A_PRIV_3
            | abi::gdt::A_DIR_CON_BIT,
        abi::gdt::F_PROT_32,
    )?;
    if !memory::is_mapped(uc, base as u64) && base != 0 {
        let sz = memory::align_up(limit.max(1) as u64);
        memory::map(
            uc,
            base as u64,
            sz,
            crate::memory::Prot::READ | crate::memory::Prot::WRITE,
            "[TLS]",
        )?;
    }
    memory::write_val(uc, u_info_addr, entry_number as u64, 4)?;
    val(0)
}

pub fn sys_get_thread_area(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    err(libc::ENOSYS)
}

/// ARM private syscall: installs the TPIDRURO base and the trap-page slot.
pub fn sys_set_tls(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let tls_addr = args[0];
    if uc.get_data().abi.table.arch == CpuArch::Arm {
        let ops = uc.get_data().abi.ops.clone();
        ops.load_tls(uc, tls_addr)?;
    }
    val(tls_addr)
}

pub fn sys_set_robust_list(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let head = args[0];
    let len = args[1];
    let ptr_sz = uc.get_data().abi.table.ptr_sz;
    if len != robust_list_head_sz(ptr_sz) {
        return err(libc::EINVAL);
    }
    let tid = uc.get_data().threads.running_tid();
    uc.get_data_mut().threads.thread_mut(tid)?.robust_list_head = head;
    val(0)
}

pub fn sys_get_robust_list(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let tid = if args[0] == 0 {
        uc.get_data().threads.running_tid()
    } else {
        args[0] as pid_t
    };
    let head = uc.get_data().threads.thread(tid)?.robust_list_head;
    let ptr_sz = uc.get_data().abi.table.ptr_sz;
    memory::write_ptr(uc, args[1], head)?;
    memory::write_ptr(uc, args[2], robust_list_head_sz(ptr_sz))?;
    val(0)
}

pub fn sys_rseq(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let rseq_addr = args[0];
    let rseq_len = args[1] as u32;
    let rseq_sig = args[3] as u32;
    if rseq_len as u64 != RSEQ_SZ {
        return err(libc::EINVAL);
    }
    let tid = uc.get_data().threads.running_tid();
    let thread = uc.get_data_mut().threads.thread_mut(tid)?;
    thread.rseq_addr = rseq_addr;
    thread.rseq_len = rseq_len;
    thread.rseq_sig = rseq_sig;
    val(0)
}

pub fn sys_sched_yield(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    process::sync_threads(uc)?;
    val(0)
}

pub fn sys_gettid(uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(uc.get_data().threads.running_tid() as u64)
}

pub fn sys_arch_prctl(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    if uc.get_data().abi.table.arch != CpuArch::X8664 {
        return err(libc::EINVAL);
    }
    let fs_base = unicorn_engine::RegisterX86::FS_BASE as i32;
    let gs_base = unicorn_engine::RegisterX86::GS_BASE as i32;
    match args[0] {
        ARCH_SET_FS => {
            crate::cpu::reg_write(uc, fs_base, args[1])?;
            val(0)
        }
        ARCH_SET_GS => {
            crate::cpu::reg_write(uc, gs_base, args[1])?;
            val(0)
        }
        ARCH_GET_FS => {
            let v = crate::cpu::reg_read(uc, fs_base)?;
            memory::write_ptr(uc, args[1], v)?;
            val(0)
        }
        ARCH_GET_GS => {
            let v = crate::cpu::reg_read(uc, gs_base)?;
            memory::write_ptr(uc, args[1], v)?;
            val(0)
        }
        _ => err(libc::EINVAL),
    }
}

pub fn sys_prctl(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_personality(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_sched_getaffinity(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    if (args[1] as usize) < 8 {
        return err(libc::EINVAL);
    }
    // Exactly one virtual CPU.
    memory::write_val(uc, args[2], 1, 8)?;
    val(8)
}

pub fn sys_sched_setaffinity(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_restart_syscall(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}
