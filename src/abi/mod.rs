//! ABI manager: per-architecture register tables, calling and syscalling
//! conventions, interrupt-to-signal resolution and width-checked register
//! access.
//!
//! Each architecture contributes one immutable [`AbiTable`] plus an
//! [`AbiOps`] implementation for the operations that cannot be table-driven
//! (one-time machine setup, TLS dump/load, pre-run address fixups, the
//! current disassembler mode).

pub mod arm;
pub mod arm64;
pub mod gdt;
pub mod ppc32;
pub mod x86;
pub mod x86_64;

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use capstone::Capstone;

use crate::cpu;
use crate::errors::{ArionError, Result};
use crate::process::ArionCpu;
use crate::{Addr, CpuArch, RegId};

/// Saved register file of a descheduled thread, each value held at the
/// register's declared width.
pub type RegMap = BTreeMap<RegId, u64>;

/// Architecture-agnostic CPU interrupt categories, resolved from the raw
/// backend interrupt number through each architecture's IDT table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CpuIntr {
    // x86
    DivideError,
    DebugException,
    NonMaskableIntr,
    Breakpoint,
    Overflow,
    BoundRangeExceeded,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    CoprocessorSegmentOverrun,
    InvalidTss,
    SegmentNotPresent,
    StackSegmentFault,
    GeneralProtectionFault,
    PageFault,
    Reserved,
    X87FloatingPoint,
    AlignmentCheck,
    MachineCheck,
    SimdFloatingPoint,
    // ARM
    Udef,
    PrefetchAbort,
    DataAbort,
    Irq,
    Fiq,
    Bkpt,
    ExceptionExit,
    KernelTrap,
    Hvc,
    HypTrap,
    Smc,
    Virq,
    Vfiq,
    Semihost,
    Nocp,
    Invstate,
    Stkof,
    Lazyfp,
    Lserr,
    Unaligned,
}

/// The Linux signal delivered to the guest when a CPU interrupt of this
/// category fires without being consumed by the syscall layer.
pub fn signal_from_intr(intr: CpuIntr) -> Result<i32> {
    use CpuIntr::*;
    Ok(match intr {
        DivideError | Overflow | BoundRangeExceeded | DeviceNotAvailable
        | CoprocessorSegmentOverrun | X87FloatingPoint | SimdFloatingPoint => libc::SIGFPE,
        DebugException | Breakpoint | Bkpt => libc::SIGTRAP,
        InvalidOpcode | Udef | Hvc | HypTrap => libc::SIGILL,
        NonMaskableIntr | DoubleFault | InvalidTss | SegmentNotPresent | StackSegmentFault
        | GeneralProtectionFault | PageFault | Reserved | DataAbort | KernelTrap | Smc | Virq
        | Vfiq | Invstate | Stkof | Lazyfp => libc::SIGSEGV,
        AlignmentCheck | PrefetchAbort | Nocp | Lserr | Unaligned => libc::SIGBUS,
        MachineCheck => libc::SIGABRT,
        Irq | Fiq => libc::SIGINT,
        ExceptionExit => libc::SIGTERM,
        Semihost => libc::SIGUSR1,
    })
}

/// Immutable per-architecture attribute table.
pub struct AbiTable {
    pub arch: CpuArch,
    /// Width of general-purpose registers, in bits.
    pub arch_sz: u16,
    /// Width of a guest pointer, in bytes.
    pub ptr_sz: usize,
    pub hwcap: u32,
    pub hwcap2: u32,
    /// Which kernel segments the loader should stand up (`kernel::SEG_*`).
    pub seg_flags: u8,
    pub pc: RegId,
    pub sp: RegId,
    pub tls: Option<RegId>,
    pub call_ret: RegId,
    pub call_params: &'static [RegId],
    pub sysno: RegId,
    pub sys_ret: RegId,
    pub sys_params: &'static [RegId],
    /// True when syscalls reach the runtime through an interrupt hook
    /// rather than an instruction hook.
    pub hooks_intr: bool,
    pub regs_by_name: &'static HashMap<&'static str, RegId>,
    pub reg_sizes: &'static HashMap<RegId, u8>,
    /// Registers making up the portable per-thread context.
    pub ctxt_regs: &'static [RegId],
    pub idt: &'static HashMap<u64, CpuIntr>,
    pub syscall_names: &'static HashMap<u64, &'static str>,
}

/// Architecture-specific operations that need live machine state.
pub trait AbiOps {
    /// One-time architectural preparation at process construction (e.g.
    /// syscall interception hooks, ARM VFP enablement).
    fn setup(&self, uc: &mut ArionCpu) -> Result<()>;
    /// Current TLS base, read from the architecture's thread register.
    fn dump_tls(&self, uc: &mut ArionCpu) -> Result<Addr>;
    /// Installs a new TLS base.
    fn load_tls(&self, uc: &mut ArionCpu, tls: Addr) -> Result<()>;
    /// Last-chance entry-address fixup before `run` (ARM sets bit 0 when
    /// the CPSR says Thumb).
    fn prerun_hook(&self, uc: &mut ArionCpu, _start: &mut Addr) -> Result<()> {
        let _ = uc;
        Ok(())
    }
    /// Whether the CPU currently decodes the compact instruction set.
    fn is_thumb(&self, _uc: &ArionCpu) -> bool {
        false
    }
    /// Disassembler for the current CPU mode. Recomputed per call on ARM.
    fn curr_cs(&self, uc: &ArionCpu) -> Result<Capstone>;
    /// Machine code of one vsyscall-segment entry (x86-64 only).
    fn vsyscall_entry(&self, _sysno: u64) -> Vec<u8> {
        Vec::new()
    }
    /// Size in bytes of the syscall instruction that just trapped.
    fn sys_insn_sz(&self, _uc: &ArionCpu) -> u64;
}

/// The ABI manager owned by every process.
pub struct Abi {
    pub table: &'static AbiTable,
    pub ops: Rc<dyn AbiOps>,
}

impl Abi {
    pub fn init(arch: CpuArch) -> Result<Abi> {
        let (table, ops): (&'static AbiTable, Rc<dyn AbiOps>) = match arch {
            CpuArch::X86 => (&*x86::TABLE, Rc::new(x86::X86Ops)),
            CpuArch::X8664 => (&*x86_64::TABLE, Rc::new(x86_64::X8664Ops)),
            CpuArch::Arm => (&*arm::TABLE, Rc::new(arm::ArmOps)),
            CpuArch::Arm64 => (&*arm64::TABLE, Rc::new(arm64::Arm64Ops)),
            CpuArch::Ppc32 => (&*ppc32::TABLE, Rc::new(ppc32::Ppc32Ops)),
        };
        Ok(Abi { table, ops })
    }

    pub fn reg_size(&self, reg: RegId) -> Result<u8> {
        self.table
            .reg_sizes
            .get(&reg)
            .copied()
            .ok_or(ArionError::NoRegWithId(reg))
    }

    pub fn reg_by_name(&self, name: &str) -> Result<RegId> {
        let upper = name.to_ascii_uppercase();
        self.table
            .regs_by_name
            .get(upper.as_str())
            .copied()
            .ok_or(ArionError::NoRegWithName(upper))
    }

    pub fn name_by_syscall_no(&self, sysno: u64) -> Result<&'static str> {
        self.table
            .syscall_names
            .get(&sysno)
            .copied()
            .ok_or(ArionError::InvalidSyscallNo(sysno))
    }

    pub fn has_syscall_with_name(&self, name: &str) -> bool {
        self.table.syscall_names.values().any(|n| *n == name)
    }

    pub fn syscall_no_by_name(&self, name: &str) -> Result<u64> {
        self.table
            .syscall_names
            .iter()
            .find(|(_, n)| **n == name)
            .map(|(no, _)| *no)
            .ok_or_else(|| ArionError::InvalidSyscallName(name.to_string()))
    }

    pub fn has_idt_entry(&self, intno: u64) -> bool {
        self.table.idt.contains_key(&intno)
    }

    pub fn idt_entry(&self, intno: u64) -> Result<CpuIntr> {
        self.table
            .idt
            .get(&intno)
            .copied()
            .ok_or(ArionError::NoIdtEntry(intno))
    }
}

fn checked_width(uc: &ArionCpu, reg: RegId, dest_sz: usize) -> Result<u8> {
    let reg_sz = uc.get_data().abi.reg_size(reg)?;
    if dest_sz < reg_sz as usize {
        return Err(ArionError::HeavierReg(reg_sz, dest_sz));
    }
    Ok(reg_sz)
}

/// Reads `reg` into a destination of `dest_sz` bytes; a destination
/// narrower than the register's declared width is an error.
pub fn read_reg_sized(uc: &ArionCpu, reg: RegId, dest_sz: usize) -> Result<u64> {
    checked_width(uc, reg, dest_sz)?;
    cpu::reg_read(uc, reg)
}

pub fn write_reg_sized(uc: &mut ArionCpu, reg: RegId, val: u64, src_sz: usize) -> Result<()> {
    checked_width(uc, reg, src_sz)?;
    cpu::reg_write(uc, reg, val)
}

pub fn read_reg_u8(uc: &ArionCpu, reg: RegId) -> Result<u8> {
    Ok(read_reg_sized(uc, reg, 1)? as u8)
}

pub fn read_reg_u16(uc: &ArionCpu, reg: RegId) -> Result<u16> {
    Ok(read_reg_sized(uc, reg, 2)? as u16)
}

pub fn read_reg_u32(uc: &ArionCpu, reg: RegId) -> Result<u32> {
    Ok(read_reg_sized(uc, reg, 4)? as u32)
}

pub fn read_reg_u64(uc: &ArionCpu, reg: RegId) -> Result<u64> {
    read_reg_sized(uc, reg, 8)
}

pub fn write_reg_u64(uc: &mut ArionCpu, reg: RegId, val: u64) -> Result<()> {
    write_reg_sized(uc, reg, val, 8)
}

/// Reads a register by name (case-insensitive).
pub fn read_reg_by_name(uc: &ArionCpu, name: &str) -> Result<u64> {
    let reg = uc.get_data().abi.reg_by_name(name)?;
    read_reg_sized(uc, reg, 8)
}

pub fn write_reg_by_name(uc: &mut ArionCpu, name: &str, val: u64) -> Result<()> {
    let reg = uc.get_data().abi.reg_by_name(name)?;
    write_reg_sized(uc, reg, val, 8)
}

/// Reads a general-purpose register at the architecture's natural width.
pub fn read_arch_reg(uc: &ArionCpu, reg: RegId) -> Result<u64> {
    match uc.get_data().abi.table.arch_sz {
        64 => read_reg_sized(uc, reg, 8),
        32 => Ok(read_reg_sized(uc, reg, 4)? & 0xFFFF_FFFF),
        _ => Err(ArionError::UnsupportedCpuArch("register width".to_string())),
    }
}

pub fn write_arch_reg(uc: &mut ArionCpu, reg: RegId, val: u64) -> Result<()> {
    match uc.get_data().abi.table.arch_sz {
        64 => write_reg_sized(uc, reg, val, 8),
        32 => write_reg_sized(uc, reg, val & 0xFFFF_FFFF, 4),
        _ => Err(ArionError::UnsupportedCpuArch("register width".to_string())),
    }
}

/// Dumps every context register at its declared width.
pub fn dump_regs(uc: &ArionCpu) -> Result<RegMap> {
    let table = uc.get_data().abi.table;
    let mut regs = RegMap::new();
    for &reg in table.ctxt_regs {
        let sz = uc.get_data().abi.reg_size(reg)? as usize;
        regs.insert(reg, read_reg_sized(uc, reg, sz.max(8))?);
    }
    Ok(regs)
}

/// Loads a previously dumped register map.
pub fn load_regs(uc: &mut ArionCpu, regs: &RegMap) -> Result<()> {
    for (&reg, &val) in regs.iter() {
        let sz = uc.get_data().abi.reg_size(reg)? as usize;
        write_reg_sized(uc, reg, val, sz.max(8))?;
    }
    Ok(())
}

/// Clones the current register file and seeds pc/sp (and tls when the
/// architecture keeps TLS in a plain register). Used by thread creation.
pub fn init_thread_regs(uc: &ArionCpu, pc: Addr, sp: Addr, tls: Option<Addr>) -> Result<RegMap> {
    let table = uc.get_data().abi.table;
    let mut regs = dump_regs(uc)?;
    regs.insert(table.pc, pc);
    regs.insert(table.sp, sp);
    if let (Some(tls_reg), Some(tls_val)) = (table.tls, tls) {
        regs.insert(tls_reg, tls_val);
    }
    Ok(regs)
}

/// Disassembler for the current CPU mode.
pub fn curr_cs(uc: &ArionCpu) -> Result<Capstone> {
    let ops = uc.get_data().abi.ops.clone();
    ops.curr_cs(uc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intr_signals_cover_faults() {
        assert_eq!(signal_from_intr(CpuIntr::PageFault).unwrap(), libc::SIGSEGV);
        assert_eq!(signal_from_intr(CpuIntr::InvalidOpcode).unwrap(), libc::SIGILL);
        assert_eq!(signal_from_intr(CpuIntr::DivideError).unwrap(), libc::SIGFPE);
        assert_eq!(signal_from_intr(CpuIntr::AlignmentCheck).unwrap(), libc::SIGBUS);
    }

    #[test]
    fn syscall_name_lookup_round_trips() {
        let abi = Abi::init(crate::CpuArch::X8664).unwrap();
        let no = abi.syscall_no_by_name("write").unwrap();
        assert_eq!(no, 1);
        assert_eq!(abi.name_by_syscall_no(no).unwrap(), "write");
        assert!(abi.has_syscall_with_name("mmap"));
        assert!(abi.syscall_no_by_name("not_a_syscall").is_err());
    }

    #[test]
    fn reg_lookup_is_case_insensitive() {
        let abi = Abi::init(crate::CpuArch::X8664).unwrap();
        let a = abi.reg_by_name("rax").unwrap();
        let b = abi.reg_by_name("RAX").unwrap();
        assert_eq!(a, b);
        assert!(abi.reg_by_name("xyzzy").is_err());
    }
}
