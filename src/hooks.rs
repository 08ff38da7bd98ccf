//! Hook manager: uniform registration and dispatch for backend-provided
//! hooks (instructions, blocks, memory events, interrupts) and the
//! synthetic events the runtime itself emits (fork, execve, syscall).
//!
//! Every backend trampoline routes callback errors to `process::crash`, so
//! an error escaping a callback halts `run` and re-surfaces afterwards
//! instead of being lost inside the engine.

use std::collections::BTreeMap;
use std::rc::Rc;

use unicorn_engine::unicorn_const::HookType;

use crate::cpu::BackendHookId;
use crate::errors::{ArionError, Result};
use crate::process::{self, ArionCpu, ProcessSharedPtr};
use crate::{Addr, HookId};

pub use unicorn_engine::unicorn_const::MemType as MemAccess;

pub type IntrCallback = Rc<dyn Fn(&mut ArionCpu, u32) -> Result<()>>;
pub type InsnCallback = Rc<dyn Fn(&mut ArionCpu) -> Result<()>>;
pub type AddrSzCallback = Rc<dyn Fn(&mut ArionCpu, Addr, usize) -> Result<()>>;
pub type MemCallback = Rc<dyn Fn(&mut ArionCpu, MemAccess, Addr, usize, i64) -> Result<bool>>;
pub type InsnInvalidCallback = Rc<dyn Fn(&mut ArionCpu) -> Result<bool>>;
pub type ProcessCallback = Rc<dyn Fn(&mut ArionCpu, &ProcessSharedPtr) -> Result<()>>;
pub type SyscallCallback = Rc<dyn Fn(&mut ArionCpu, &str, &[u64]) -> Result<()>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
    Intr,
    Insn,
    Code,
    Block,
    MemReadUnmapped,
    MemWriteUnmapped,
    MemFetchUnmapped,
    MemReadProt,
    MemWriteProt,
    MemFetchProt,
    MemRead,
    MemWrite,
    MemFetch,
    MemReadAfter,
    InsnInvalid,
    Fork,
    Execve,
    Syscall,
}

impl HookKind {
    /// Backend hook type for kinds with a backend counterpart.
    fn backend_type(self) -> Option<HookType> {
        match self {
            HookKind::Intr => Some(HookType::INTR),
            HookKind::Insn => Some(HookType::INSN),
            HookKind::Code => Some(HookType::CODE),
            HookKind::Block => Some(HookType::BLOCK),
            HookKind::MemReadUnmapped => Some(HookType::MEM_READ_UNMAPPED),
            HookKind::MemWriteUnmapped => Some(HookType::MEM_WRITE_UNMAPPED),
            HookKind::MemFetchUnmapped => Some(HookType::MEM_FETCH_UNMAPPED),
            HookKind::MemReadProt => Some(HookType::MEM_READ_PROT),
            HookKind::MemWriteProt => Some(HookType::MEM_WRITE_PROT),
            HookKind::MemFetchProt => Some(HookType::MEM_FETCH_PROT),
            HookKind::MemRead => Some(HookType::MEM_READ),
            HookKind::MemWrite => Some(HookType::MEM_WRITE),
            HookKind::MemFetch => Some(HookType::MEM_FETCH),
            HookKind::MemReadAfter => Some(HookType::MEM_READ_AFTER),
            HookKind::InsnInvalid => Some(HookType::INSN_INVALID),
            HookKind::Fork | HookKind::Execve | HookKind::Syscall => None,
        }
    }
}

#[derive(Clone)]
pub enum HookCallback {
    Intr(IntrCallback),
    Insn(InsnCallback),
    AddrSz(AddrSzCallback),
    Mem(MemCallback),
    InsnInvalid(InsnInvalidCallback),
    Process(ProcessCallback),
    Syscall(SyscallCallback),
}

pub struct Hook {
    pub kind: HookKind,
    pub backend_id: Option<BackendHookId>,
    pub callback: HookCallback,
}

/// Process-local hook table with recycled ids.
#[derive(Default)]
pub struct HookTable {
    hooks: BTreeMap<HookId, Hook>,
    free_ids: Vec<HookId>,
    next_id: HookId,
}

impl HookTable {
    fn alloc_id(&mut self) -> HookId {
        if let Some(id) = self.free_ids.pop() {
            id
        } else {
            self.next_id += 1;
            self.next_id
        }
    }

    fn callback(&self, id: HookId) -> Option<HookCallback> {
        self.hooks.get(&id).map(|h| h.callback.clone())
    }

    /// Callbacks of every hook of `kind`, in registration order.
    fn callbacks_of_kind(&self, kind: HookKind) -> Vec<HookCallback> {
        self.hooks
            .values()
            .filter(|h| h.kind == kind)
            .map(|h| h.callback.clone())
            .collect()
    }
}

fn register(uc: &mut ArionCpu, id: HookId, hook: Hook) -> HookId {
    uc.get_data_mut().hooks.hooks.insert(id, hook);
    id
}

fn crash_on_err(uc: &mut ArionCpu, res: Result<()>) {
    if let Err(err) = res {
        process::crash(uc, err);
    }
}

pub fn hook_intr(uc: &mut ArionCpu, cb: IntrCallback) -> Result<HookId> {
    let id = uc.get_data_mut().hooks.alloc_id();
    let backend_id = uc
        .add_intr_hook(move |uc, intno| {
            if let Some(HookCallback::Intr(cb)) = uc.get_data().hooks.callback(id) {
                let res = cb(uc, intno);
                crash_on_err(uc, res);
            }
        })
        .map_err(ArionError::CpuHookAdd)?;
    Ok(register(
        uc,
        id,
        Hook {
            kind: HookKind::Intr,
            backend_id: Some(backend_id),
            callback: HookCallback::Intr(cb),
        },
    ))
}

/// Instruction hook for a backend-special instruction (x86 syscall and
/// sysenter interception).
pub fn hook_insn_sys(
    uc: &mut ArionCpu,
    insn: unicorn_engine::unicorn_const::InsnSysX86,
    cb: InsnCallback,
) -> Result<HookId> {
    let id = uc.get_data_mut().hooks.alloc_id();
    let backend_id = uc
        .add_insn_sys_hook(insn, 0, u64::MAX, move |uc| {
            if let Some(HookCallback::Insn(cb)) = uc.get_data().hooks.callback(id) {
                let res = cb(uc);
                crash_on_err(uc, res);
            }
        })
        .map_err(ArionError::CpuHookAdd)?;
    Ok(register(
        uc,
        id,
        Hook {
            kind: HookKind::Insn,
            backend_id: Some(backend_id),
            callback: HookCallback::Insn(cb),
        },
    ))
}

pub fn hook_code(uc: &mut ArionCpu, start: Addr, end: Addr, cb: AddrSzCallback) -> Result<HookId> {
    let id = uc.get_data_mut().hooks.alloc_id();
    let backend_id = uc
        .add_code_hook(start, end, move |uc, addr, sz| {
            if let Some(HookCallback::AddrSz(cb)) = uc.get_data().hooks.callback(id) {
                let res = cb(uc, addr, sz as usize);
                crash_on_err(uc, res);
            }
        })
        .map_err(ArionError::CpuHookAdd)?;
    Ok(register(
        uc,
        id,
        Hook {
            kind: HookKind::Code,
            backend_id: Some(backend_id),
            callback: HookCallback::AddrSz(cb),
        },
    ))
}

/// Single-address convenience wrapper over [`hook_code`].
pub fn hook_addr(uc: &mut ArionCpu, addr: Addr, cb: AddrSzCallback) -> Result<HookId> {
    hook_code(uc, addr, addr, cb)
}

pub fn hook_block(uc: &mut ArionCpu, start: Addr, end: Addr, cb: AddrSzCallback) -> Result<HookId> {
    let id = uc.get_data_mut().hooks.alloc_id();
    let backend_id = uc
        .add_block_hook(start, end, move |uc, addr, sz| {
            if let Some(HookCallback::AddrSz(cb)) = uc.get_data().hooks.callback(id) {
                let res = cb(uc, addr, sz as usize);
                crash_on_err(uc, res);
            }
        })
        .map_err(ArionError::CpuHookAdd)?;
    Ok(register(
        uc,
        id,
        Hook {
            kind: HookKind::Block,
            backend_id: Some(backend_id),
            callback: HookCallback::AddrSz(cb),
        },
    ))
}

fn hook_mem_kind(
    uc: &mut ArionCpu,
    kind: HookKind,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    let hook_type = kind.backend_type().expect("memory hook kinds are backed");
    let id = uc.get_data_mut().hooks.alloc_id();
    let backend_id = uc
        .add_mem_hook(hook_type, start, end, move |uc, access, addr, sz, val| {
            match uc.get_data().hooks.callback(id) {
                Some(HookCallback::Mem(cb)) => match cb(uc, access, addr, sz, val) {
                    Ok(handled) => handled,
                    Err(err) => {
                        process::crash(uc, err);
                        false
                    }
                },
                _ => false,
            }
        })
        .map_err(ArionError::CpuHookAdd)?;
    Ok(register(
        uc,
        id,
        Hook {
            kind,
            backend_id: Some(backend_id),
            callback: HookCallback::Mem(cb),
        },
    ))
}

pub fn hook_mem_read(uc: &mut ArionCpu, start: Addr, end: Addr, cb: MemCallback) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemRead, start, end, cb)
}

pub fn hook_mem_write(uc: &mut ArionCpu, start: Addr, end: Addr, cb: MemCallback) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemWrite, start, end, cb)
}

pub fn hook_mem_fetch(uc: &mut ArionCpu, start: Addr, end: Addr, cb: MemCallback) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemFetch, start, end, cb)
}

pub fn hook_mem_read_after(
    uc: &mut ArionCpu,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemReadAfter, start, end, cb)
}

pub fn hook_mem_read_unmapped(
    uc: &mut ArionCpu,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemReadUnmapped, start, end, cb)
}

pub fn hook_mem_write_unmapped(
    uc: &mut ArionCpu,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemWriteUnmapped, start, end, cb)
}

pub fn hook_mem_fetch_unmapped(
    uc: &mut ArionCpu,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemFetchUnmapped, start, end, cb)
}

pub fn hook_mem_read_prot(
    uc: &mut ArionCpu,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemReadProt, start, end, cb)
}

pub fn hook_mem_write_prot(
    uc: &mut ArionCpu,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemWriteProt, start, end, cb)
}

pub fn hook_mem_fetch_prot(
    uc: &mut ArionCpu,
    start: Addr,
    end: Addr,
    cb: MemCallback,
) -> Result<HookId> {
    hook_mem_kind(uc, HookKind::MemFetchProt, start, end, cb)
}

pub fn hook_insn_invalid(uc: &mut ArionCpu, cb: InsnInvalidCallback) -> Result<HookId> {
    let id = uc.get_data_mut().hooks.alloc_id();
    let backend_id = uc
        .add_insn_invalid_hook(move |uc| match uc.get_data().hooks.callback(id) {
            Some(HookCallback::InsnInvalid(cb)) => match cb(uc) {
                Ok(handled) => handled,
                Err(err) => {
                    process::crash(uc, err);
                    false
                }
            },
            _ => false,
        })
        .map_err(ArionError::CpuHookAdd)?;
    Ok(register(
        uc,
        id,
        Hook {
            kind: HookKind::InsnInvalid,
            backend_id: Some(backend_id),
            callback: HookCallback::InsnInvalid(cb),
        },
    ))
}

fn hook_synthetic(uc: &mut ArionCpu, kind: HookKind, callback: HookCallback) -> HookId {
    let id = uc.get_data_mut().hooks.alloc_id();
    register(
        uc,
        id,
        Hook {
            kind,
            backend_id: None,
            callback,
        },
    )
}

/// Fires after a successful fork-style clone, before the parent advances.
pub fn hook_fork(uc: &mut ArionCpu, cb: ProcessCallback) -> HookId {
    hook_synthetic(uc, HookKind::Fork, HookCallback::Process(cb))
}

/// Fires after an execve swapped a fresh process into the group.
pub fn hook_execve(uc: &mut ArionCpu, cb: ProcessCallback) -> HookId {
    hook_synthetic(uc, HookKind::Execve, HookCallback::Process(cb))
}

/// Fires after each syscall handler returns, with the decoded name.
pub fn hook_syscall(uc: &mut ArionCpu, cb: SyscallCallback) -> HookId {
    hook_synthetic(uc, HookKind::Syscall, HookCallback::Syscall(cb))
}

/// Removes a hook from the backend (when backed) and releases its id.
pub fn unhook(uc: &mut ArionCpu, hook_id: HookId) -> Result<()> {
    let hook = uc
        .get_data_mut()
        .hooks
        .hooks
        .remove(&hook_id)
        .ok_or(ArionError::WrongHookId(hook_id))?;
    uc.get_data_mut().hooks.free_ids.push(hook_id);
    if let Some(backend_id) = hook.backend_id {
        crate::cpu::remove_hook(uc, backend_id)?;
    }
    Ok(())
}

/// Invokes every fork or execve hook with the affected process.
pub fn trigger_process_hook(
    uc: &mut ArionCpu,
    kind: HookKind,
    child: &ProcessSharedPtr,
) -> Result<()> {
    debug_assert!(matches!(kind, HookKind::Fork | HookKind::Execve));
    let callbacks = uc.get_data().hooks.callbacks_of_kind(kind);
    for callback in callbacks {
        match callback {
            HookCallback::Process(cb) => cb(uc, child)?,
            _ => unreachable!("process hook kinds only hold process callbacks"),
        }
    }
    Ok(())
}

/// Invokes every syscall hook with the decoded name and arguments.
pub fn trigger_syscall_hook(uc: &mut ArionCpu, name: &str, args: &[u64]) -> Result<()> {
    let callbacks = uc.get_data().hooks.callbacks_of_kind(HookKind::Syscall);
    for callback in callbacks {
        match callback {
            HookCallback::Syscall(cb) => cb(uc, name, args)?,
            _ => unreachable!("syscall hook kind only holds syscall callbacks"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_ids_are_recycled() {
        let mut table = HookTable::default();
        let a = table.alloc_id();
        let b = table.alloc_id();
        assert_ne!(a, b);
        table.free_ids.push(a);
        assert_eq!(table.alloc_id(), a);
    }

    #[test]
    fn synthetic_kinds_have_no_backend_type() {
        assert!(HookKind::Fork.backend_type().is_none());
        assert!(HookKind::Execve.backend_type().is_none());
        assert!(HookKind::Syscall.backend_type().is_none());
        assert!(HookKind::Code.backend_type().is_some());
    }
}
