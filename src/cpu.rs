//! Emulator backend adapter.
//!
//! Wraps the external CPU emulator (unicorn) behind typed, error-returning
//! calls so the rest of the runtime never touches the backend API directly.
//! The backend's user-data slot carries the whole process state
//! ([`crate::process::Arion`]), which is how hook trampolines re-enter the
//! runtime without aliasing the engine handle.

use capstone::prelude::*;
use capstone::Capstone;
use unicorn_engine::unicorn_const::{Arch, MemRegion, Mode, Permission};
use unicorn_engine::Unicorn;

use crate::errors::{ArionError, Result};
use crate::memory::Prot;
use crate::process::{Arion, ArionCpu};
use crate::{Addr, CpuArch, RegId};

/// Backend-side hook identifier, paired with the process-local hook id by
/// the hook manager.
pub type BackendHookId = unicorn_engine::UcHookId;

/// Why the backend returned from `run`.
#[derive(Debug)]
pub enum StopReason {
    /// `stop()` was called (cooperative stop, sync or crash).
    RequestedStop,
    /// The explicit end address was reached.
    HitEnd,
    /// The cycle cap for this quantum was consumed.
    CyclesExhausted,
    /// The backend aborted with a CPU-level fault.
    Fault(unicorn_engine::unicorn_const::uc_error),
}

pub fn uc_arch_mode(arch: CpuArch) -> (Arch, Mode) {
    match arch {
        CpuArch::X86 => (Arch::X86, Mode::MODE_32),
        CpuArch::X8664 => (Arch::X86, Mode::MODE_64),
        CpuArch::Arm => (Arch::ARM, Mode::ARM),
        CpuArch::Arm64 => (Arch::ARM64, Mode::LITTLE_ENDIAN),
        CpuArch::Ppc32 => (Arch::PPC, Mode::PPC32 | Mode::BIG_ENDIAN),
    }
}

fn uc_perms(prot: Prot) -> Permission {
    let mut perms = Permission::NONE;
    if prot.contains(Prot::READ) {
        perms |= Permission::READ;
    }
    if prot.contains(Prot::WRITE) {
        perms |= Permission::WRITE;
    }
    if prot.contains(Prot::EXEC) {
        perms |= Permission::EXEC;
    }
    perms
}

pub fn prot_from_backend(perms: Permission) -> Prot {
    let mut prot = Prot::empty();
    if perms.contains(Permission::READ) {
        prot |= Prot::READ;
    }
    if perms.contains(Permission::WRITE) {
        prot |= Prot::WRITE;
    }
    if perms.contains(Permission::EXEC) {
        prot |= Prot::EXEC;
    }
    prot
}

/// Opens a backend engine for `arch` carrying `data` as its process state.
pub fn open(arch: CpuArch, data: Arion) -> Result<ArionCpu> {
    let (uc_arch, uc_mode) = uc_arch_mode(arch);
    Unicorn::new_with_data(uc_arch, uc_mode, data).map_err(ArionError::CpuOpen)
}

/// Runs the backend from `begin` until `until` (when present), an explicit
/// stop, or `cycles` executed instructions (0 = unbounded).
pub fn run(
    uc: &mut ArionCpu,
    begin: Addr,
    until: Option<Addr>,
    cycles: usize,
    pc_reg: RegId,
) -> Result<StopReason> {
    uc.get_data_mut().run.stop_requested = false;
    match uc.emu_start(begin, until.unwrap_or(0), 0, cycles) {
        Ok(()) => {
            let pc = uc.reg_read(pc_reg).map_err(|e| ArionError::CpuRegRead(e, pc_reg))?;
            if until.map_or(false, |end| pc == end) {
                Ok(StopReason::HitEnd)
            } else if uc.get_data().run.stop_requested {
                Ok(StopReason::RequestedStop)
            } else {
                Ok(StopReason::CyclesExhausted)
            }
        }
        Err(e) => Ok(StopReason::Fault(e)),
    }
}

/// Cooperatively halts a backend `run` in progress.
pub fn stop(uc: &mut ArionCpu) -> Result<()> {
    uc.get_data_mut().run.stop_requested = true;
    uc.emu_stop().map_err(ArionError::CpuStop)
}

/// Tells the backend whether `run` callers will supply explicit exit
/// addresses.
pub fn use_exits(uc: &mut ArionCpu, enabled: bool) -> Result<()> {
    let res = if enabled {
        uc.ctl_exits_enable()
    } else {
        uc.ctl_exits_disable()
    };
    res.map_err(ArionError::CpuCtl)
}

pub fn set_exits(uc: &mut ArionCpu, exits: &[Addr]) -> Result<()> {
    uc.ctl_set_exits(exits).map_err(ArionError::CpuCtl)
}

/// Drops translated blocks covering `[begin, end)`. Needed after the PC is
/// rewritten behind the translator's back (signal delivery).
pub fn remove_cache(uc: &mut ArionCpu, begin: Addr, end: Addr) -> Result<()> {
    uc.ctl_remove_cache(begin, end).map_err(ArionError::CpuCtl)
}

pub fn map(uc: &mut ArionCpu, start: Addr, size: u64, prot: Prot) -> Result<()> {
    uc.mem_map(start, size as usize, uc_perms(prot))
        .map_err(|e| ArionError::CpuMap(e, start))
}

pub fn unmap(uc: &mut ArionCpu, start: Addr, size: u64) -> Result<()> {
    uc.mem_unmap(start, size as usize)
        .map_err(|e| ArionError::CpuUnmap(e, start))
}

pub fn protect(uc: &mut ArionCpu, start: Addr, size: u64, prot: Prot) -> Result<()> {
    uc.mem_protect(start, size as usize, uc_perms(prot))
        .map_err(|e| ArionError::CpuProtect(e, start))
}

pub fn read(uc: &ArionCpu, addr: Addr, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    uc.mem_read(addr, &mut buf)
        .map_err(|e| ArionError::CpuMemRead(e, addr))?;
    Ok(buf)
}

pub fn write(uc: &mut ArionCpu, addr: Addr, data: &[u8]) -> Result<()> {
    uc.mem_write(addr, data)
        .map_err(|e| ArionError::CpuMemWrite(e, addr))
}

pub fn regions(uc: &ArionCpu) -> Result<Vec<MemRegion>> {
    uc.mem_regions().map_err(ArionError::CpuMemRegions)
}

pub fn reg_read(uc: &ArionCpu, reg: RegId) -> Result<u64> {
    uc.reg_read(reg).map_err(|e| ArionError::CpuRegRead(e, reg))
}

pub fn reg_write(uc: &mut ArionCpu, reg: RegId, val: u64) -> Result<()> {
    uc.reg_write(reg, val)
        .map_err(|e| ArionError::CpuRegWrite(e, reg))
}

pub fn reg_write_long(uc: &mut ArionCpu, reg: RegId, val: &[u8]) -> Result<()> {
    uc.reg_write_long(reg, val)
        .map_err(|e| ArionError::CpuRegWrite(e, reg))
}

pub fn remove_hook(uc: &mut ArionCpu, id: BackendHookId) -> Result<()> {
    uc.remove_hook(id).map_err(ArionError::CpuHookDel)
}

/// Builds a disassembler context for an architecture and (on ARM) its
/// current instruction set.
pub fn disassembler(arch: CpuArch, thumb: bool) -> Result<Capstone> {
    let cs = match arch {
        CpuArch::X86 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode32)
            .build(),
        CpuArch::X8664 => Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .build(),
        CpuArch::Arm if thumb => Capstone::new()
            .arm()
            .mode(arch::arm::ArchMode::Thumb)
            .build(),
        CpuArch::Arm => Capstone::new().arm().mode(arch::arm::ArchMode::Arm).build(),
        CpuArch::Arm64 => Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .build(),
        CpuArch::Ppc32 => Capstone::new()
            .ppc()
            .mode(arch::ppc::ArchMode::Mode32)
            .endian(capstone::Endian::Big)
            .build(),
    };
    cs.map_err(|e| ArionError::Disasm(e.to_string()))
}
