//! ELF loader: static and PIE executables plus dynamically linked
//! programs through their interpreter. Lays out the image, heap, stack
//! (argv/envp/auxv), and the architecture-mandated kernel regions.

use goblin::elf::header::{EM_386, EM_AARCH64, EM_ARM, EM_PPC, EM_X86_64, ET_DYN};
use goblin::elf::program_header::{PT_INTERP, PT_LOAD};
use goblin::elf::Elf;
use rand::RngCore;

use crate::abi;
use crate::errors::{ArionError, Result};
use crate::kernel::*;
use crate::loader::LoaderParams;
use crate::memory::{self, Prot};
use crate::process::ArionCpu;
use crate::threads::{self, ArionThread};
use crate::{Addr, CpuArch, PAGE_SZ};

/// Identifies the guest architecture from an ELF header.
pub fn sniff_arch(path: &str) -> Result<CpuArch> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 0x40 {
        return Err(ArionError::FileTooSmall(path.to_string()));
    }
    let elf = Elf::parse(&bytes)?;
    match elf.header.e_machine {
        EM_386 => Ok(CpuArch::X86),
        EM_X86_64 => Ok(CpuArch::X8664),
        EM_ARM => Ok(CpuArch::Arm),
        EM_AARCH64 => Ok(CpuArch::Arm64),
        EM_PPC => Ok(CpuArch::Ppc32),
        other => Err(ArionError::UnsupportedCpuArch(format!(
            "ELF machine {:#x}",
            other
        ))),
    }
}

struct MappedImage {
    base: Addr,
    entry: Addr,
    phdr: Addr,
    phent: u64,
    phnum: u64,
}

/// Maps every PT_LOAD segment of `bytes` with `bias` applied, returning
/// the image geometry. Page granularity is used regardless of the
/// segment's declared alignment; pages shared between adjacent segments
/// are kept with the first segment's protection.
fn map_segments(uc: &mut ArionCpu, bytes: &[u8], bias: Addr, info: &str) -> Result<(MappedImage, Addr)> {
    let elf = Elf::parse(bytes)?;
    let mut first_addr = u64::MAX;
    let mut last_addr = 0u64;

    for ph in elf.program_headers.iter().filter(|p| p.p_type == PT_LOAD) {
        let seg_addr = ph.p_vaddr + bias;
        let mut map_start = memory::align_down(seg_addr);
        let map_end = memory::align_up(seg_addr + ph.p_memsz.max(1));
        first_addr = first_addr.min(map_start);
        last_addr = last_addr.max(map_end);

        let prot = Prot::from_bits_truncate(ph.p_flags);
        while map_start < map_end && uc.get_data().mem.is_mapped(map_start) {
            map_start += PAGE_SZ;
        }
        if map_start < map_end {
            memory::map(uc, map_start, map_end - map_start, prot, info)?;
        }

        let file_start = ph.p_offset as usize;
        let file_end = (ph.p_offset + ph.p_filesz) as usize;
        if file_end > bytes.len() {
            return Err(ArionError::Elf(format!(
                "segment at {:#x} overruns the file",
                ph.p_vaddr
            )));
        }
        if file_end > file_start {
            memory::write(uc, seg_addr, &bytes[file_start..file_end])?;
        }
    }

    if first_addr == u64::MAX {
        return Err(ArionError::Elf("no loadable segment".to_string()));
    }

    let image = MappedImage {
        base: first_addr,
        entry: elf.header.e_entry + bias,
        phdr: bias + elf.header.e_phoff,
        phent: elf.header.e_phentsize as u64,
        phnum: elf.header.e_phnum as u64,
    };
    Ok((image, last_addr))
}

fn map_vvar(uc: &mut ArionCpu, arch_sz: u16) -> Result<Addr> {
    let (addr, sz) = if arch_sz == 64 {
        (LINUX_64_VVAR_ADDR, LINUX_64_VVAR_SZ)
    } else {
        (LINUX_32_VVAR_ADDR, LINUX_32_VVAR_SZ)
    };
    memory::unmap(uc, addr, addr + sz)?;
    memory::map(uc, addr, sz, Prot::READ, "[vvar]")
}

fn map_vdso(uc: &mut ArionCpu, arch_sz: u16) -> Result<Addr> {
    let (addr, sz) = if arch_sz == 64 {
        (LINUX_64_VDSO_ADDR, LINUX_64_VDSO_SZ)
    } else {
        (LINUX_32_VDSO_ADDR, LINUX_32_VDSO_SZ)
    };
    memory::unmap(uc, addr, addr + sz)?;
    memory::map(uc, addr, sz, Prot::READ | Prot::EXEC, "[vdso]")
}

/// x86-64 only: synthesizes the legacy vsyscall entries as real syscall
/// stubs.
fn map_vsyscall(uc: &mut ArionCpu) -> Result<Addr> {
    if uc.get_data().abi.table.arch != CpuArch::X8664 {
        return Ok(0);
    }
    let vsyscalls = ["gettimeofday", "time", "getcpu"];
    let mut seg_sz = (vsyscalls.len() * VSYSCALL_ENTRY_SZ) as u64;
    seg_sz += LINUX_64_VSYSCALL_ALIGN - seg_sz % LINUX_64_VSYSCALL_ALIGN;

    let addr = memory::map(
        uc,
        LINUX_64_VSYSCALL_ADDR,
        seg_sz,
        Prot::READ | Prot::EXEC,
        "[vsyscall]",
    )?;
    let ops = uc.get_data().abi.ops.clone();
    for (i, name) in vsyscalls.iter().enumerate() {
        let sysno = uc.get_data().abi.syscall_no_by_name(name)?;
        let stub = ops.vsyscall_entry(sysno);
        memory::write(uc, addr + (i * VSYSCALL_ENTRY_SZ) as u64, &stub)?;
    }
    Ok(addr)
}

/// ARM kernel helper page: memory_barrier, cmpxchg and get_tls at their
/// architectural offsets.
pub fn map_arm_traps(uc: &mut ArionCpu) -> Result<Addr> {
    let traps: [(u64, &[u8]); 3] = [
        (
            0xFA0,
            &[0xBA, 0x0F, 0x07, 0xEE, 0x00, 0xF0, 0x20, 0xE3, 0x0E, 0xF0, 0xA0, 0xE1],
        ),
        (
            0xFC0,
            &[
                0x00, 0x30, 0x92, 0xE5, 0x00, 0x30, 0x53, 0xE0, 0x00, 0x10, 0x82, 0x05, 0x00,
                0x00, 0x73, 0xE2, 0x0E, 0xF0, 0xA0, 0xE1,
            ],
        ),
        (
            0xFE0,
            &[
                0x08, 0x00, 0x9F, 0xE5, 0x0E, 0xF0, 0xA0, 0xE1, 0x70, 0x0F, 0x1D, 0xEE, 0xE7,
                0xFD, 0xDE, 0xF1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00,
            ],
        ),
    ];
    let addr = memory::map(
        uc,
        LINUX_32_ARM_TRAPS_ADDR,
        LINUX_32_ARM_TRAPS_SZ,
        Prot::READ | Prot::EXEC,
        "[arm_traps]",
    )?;
    for (off, code) in traps.iter() {
        memory::write(uc, addr + off, code)?;
    }
    Ok(addr)
}

struct AuxvInputs {
    entry: Addr,
    base: Addr,
    phdr: Addr,
    phent: u64,
    phnum: u64,
    vdso: Addr,
}

/// Stands up `[stack]` with the SysV initial layout: strings, AT_RANDOM,
/// auxv, envp, argv and argc.
fn map_stack(uc: &mut ArionCpu, program_path: &str, auxv: &AuxvInputs) -> Result<Addr> {
    let arch_sz = uc.get_data().abi.table.arch_sz;
    let (stack_addr, stack_sz) = if arch_sz == 64 {
        (LINUX_64_STACK_ADDR, LINUX_64_STACK_SZ)
    } else {
        (LINUX_32_STACK_ADDR, LINUX_32_STACK_SZ)
    };
    let sp_reg = uc.get_data().abi.table.sp;

    memory::map(uc, stack_addr, stack_sz, Prot::READ | Prot::WRITE, "[stack]")?;
    abi::write_arch_reg(uc, sp_reg, stack_addr + stack_sz)?;

    let execfn_ptr = memory::stack_push_string(uc, program_path)?;
    let platform = uc.get_data().abi.table.arch.name().to_string();
    let platform_ptr = memory::stack_push_string(uc, &platform)?;

    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    let random_ptr = memory::stack_push_bytes(uc, &random)?;

    let env: Vec<String> = uc.get_data().program_env.clone();
    let mut env_ptrs = Vec::with_capacity(env.len());
    for var in env.iter() {
        env_ptrs.push(memory::stack_push_string(uc, var)?);
    }
    let args: Vec<String> = uc.get_data().program_args.clone();
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args.iter() {
        arg_ptrs.push(memory::stack_push_string(uc, arg)?);
    }
    memory::stack_align(uc)?;

    let (hwcap, hwcap2, uid, gid, euid, egid) = {
        let state = uc.get_data();
        (
            state.abi.table.hwcap,
            state.abi.table.hwcap2,
            state.uid,
            state.gid,
            state.euid,
            state.egid,
        )
    };
    let mut auxv_pairs: Vec<(u64, u64)> = vec![
        (AT_PHDR, auxv.phdr),
        (AT_PHENT, auxv.phent),
        (AT_PHNUM, auxv.phnum),
        (AT_PAGESZ, PAGE_SZ),
        (AT_BASE, auxv.base),
        (AT_FLAGS, 0),
        (AT_ENTRY, auxv.entry),
        (AT_UID, uid as u64),
        (AT_EUID, euid as u64),
        (AT_GID, gid as u64),
        (AT_EGID, egid as u64),
        (AT_PLATFORM, platform_ptr),
        (AT_HWCAP, hwcap as u64),
        (AT_HWCAP2, hwcap2 as u64),
        (AT_CLKTCK, 100),
        (AT_SECURE, 0),
        (AT_RANDOM, random_ptr),
        (AT_EXECFN, execfn_ptr),
    ];
    if auxv.vdso != 0 {
        auxv_pairs.push((AT_SYSINFO_EHDR, auxv.vdso));
    }

    // Keep the final SP 16-byte aligned across auxv/envp/argv/argc.
    let words = 2 * (auxv_pairs.len() + 1) + (env_ptrs.len() + 1) + (arg_ptrs.len() + 1) + 1;
    let ptr_sz = uc.get_data().abi.table.ptr_sz as u64;
    let sp = abi::read_arch_reg(uc, sp_reg)?;
    if (sp - words as u64 * ptr_sz) % 16 != 0 {
        let pad = (sp - words as u64 * ptr_sz) % 16 / ptr_sz;
        for _ in 0..pad {
            memory::stack_push(uc, 0)?;
        }
    }

    memory::stack_push(uc, 0)?;
    memory::stack_push(uc, 0)?;
    for (key, val) in auxv_pairs.iter().rev() {
        memory::stack_push(uc, *val)?;
        memory::stack_push(uc, *key)?;
    }
    memory::stack_push(uc, 0)?;
    for ptr in env_ptrs.iter().rev() {
        memory::stack_push(uc, *ptr)?;
    }
    memory::stack_push(uc, 0)?;
    for ptr in arg_ptrs.iter().rev() {
        memory::stack_push(uc, *ptr)?;
    }
    memory::stack_push(uc, arg_ptrs.len() as u64)?;
    Ok(stack_addr)
}

fn init_main_thread(uc: &mut ArionCpu, entry: Addr) -> Result<()> {
    let sp_reg = uc.get_data().abi.table.sp;
    let sp = abi::read_arch_reg(uc, sp_reg)?;
    let regs = abi::init_thread_regs(uc, entry, sp, Some(0))?;
    abi::load_regs(uc, &regs)?;
    threads::add_thread(uc.get_data_mut(), ArionThread::new(0, 0, 0, 0, None))?;
    Ok(())
}

/// Loads `program_path` (host path, already sandboxed) into the process.
pub fn load(uc: &mut ArionCpu, program_path: &str) -> Result<LoaderParams> {
    let bytes = std::fs::read(program_path)?;
    let elf = Elf::parse(&bytes)?;
    let arch_sz = uc.get_data().abi.table.arch_sz;

    let is_pie = elf.header.e_type == ET_DYN;
    let interpreter = elf.interpreter.map(|s| s.to_string());
    let has_interp = elf
        .program_headers
        .iter()
        .any(|ph| ph.p_type == PT_INTERP);
    drop(elf);

    let mut params = LoaderParams::default();

    let bias = if is_pie {
        if arch_sz == 64 {
            LINUX_64_LOAD_ADDR
        } else {
            LINUX_32_LOAD_ADDR
        }
    } else {
        0
    };
    let (image, image_end) = map_segments(uc, &bytes, bias, program_path)?;
    params.load = image.base;

    let heap_start = memory::align_up(image_end);
    memory::map(uc, heap_start, HEAP_SZ, Prot::READ | Prot::WRITE, "[heap]")?;
    uc.get_data_mut().mem.set_brk(heap_start + HEAP_SZ);

    let mut entry = image.entry;
    let mut base = image.base;
    if has_interp {
        let interp_guest = interpreter
            .ok_or_else(|| ArionError::UnknownLinkageType(program_path.to_string()))?;
        let interp_host = {
            let state = uc.get_data();
            let p = crate::loader::resolve_program_path(&state.fs, &interp_guest);
            p
        };
        if interp_host.is_empty() || !std::path::Path::new(&interp_host).exists() {
            return Err(ArionError::FileNotFound(interp_guest));
        }
        let interp_bytes = std::fs::read(&interp_host)?;
        let interp_elf = Elf::parse(&interp_bytes)?;
        if interp_elf.interpreter.is_some() {
            return Err(ArionError::BadLinkageType(interp_guest));
        }
        drop(interp_elf);
        let interp_bias = if arch_sz == 64 {
            LINUX_64_INTERP_ADDR
        } else {
            LINUX_32_INTERP_ADDR
        };
        let (interp_image, _) = map_segments(uc, &interp_bytes, interp_bias, &interp_host)?;
        params.interp = interp_image.base;
        entry = interp_image.entry;
        base = interp_image.base;
    }

    let seg_flags = uc.get_data().abi.table.seg_flags;
    if seg_flags & SEG_VVAR != 0 {
        params.vvar = map_vvar(uc, arch_sz)?;
    }
    if seg_flags & SEG_VDSO != 0 {
        params.vdso = map_vdso(uc, arch_sz)?;
    }

    let auxv = AuxvInputs {
        entry: image.entry,
        base,
        phdr: image.phdr,
        phent: image.phent,
        phnum: image.phnum,
        vdso: params.vdso,
    };
    params.stack = map_stack(uc, program_path, &auxv)?;

    if seg_flags & SEG_VSYSCALL != 0 {
        params.vsyscall = map_vsyscall(uc)?;
    }
    if seg_flags & SEG_ARM_TRAPS != 0 {
        params.arm_traps = map_arm_traps(uc)?;
    }

    init_main_thread(uc, entry)?;
    Ok(params)
}
