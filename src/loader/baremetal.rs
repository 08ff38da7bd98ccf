//! Baremetal loader: stands up raw shellcode without any ELF structure.
//! Only a code region, a data region and a stack (with envp) exist; the
//! main thread starts at the code base.

use crate::abi;
use crate::errors::Result;
use crate::kernel::*;
use crate::loader::LoaderParams;
use crate::memory::{self, Prot};
use crate::process::{ArionCpu, Baremetal};
use crate::threads::{self, ArionThread};
use crate::{Addr, CpuArch};

fn map_code(uc: &mut ArionCpu, bm: &Baremetal, load_addr: Addr) -> Result<Addr> {
    memory::map(
        uc,
        load_addr,
        bm.code.len() as u64,
        Prot::READ | Prot::WRITE | Prot::EXEC,
        "[code]",
    )?;
    memory::write(uc, load_addr, &bm.code)?;
    let code_end = memory::align_up(bm.code.len() as u64);
    debug!(
        "baremetal code is {} bytes, rounded up to {:#x}",
        bm.code.len(),
        code_end
    );
    if bm.setup_memory {
        memory::map(
            uc,
            load_addr + code_end,
            BAREMETAL_DATA_SZ,
            Prot::READ | Prot::WRITE,
            "[data]",
        )?;
    }
    Ok(load_addr)
}

fn map_stack(uc: &mut ArionCpu) -> Result<Addr> {
    let arch_sz = uc.get_data().abi.table.arch_sz;
    let (stack_addr, stack_sz) = if arch_sz == 64 {
        (LINUX_64_STACK_ADDR, LINUX_64_STACK_SZ)
    } else {
        (LINUX_32_STACK_ADDR, LINUX_32_STACK_SZ)
    };
    let sp_reg = uc.get_data().abi.table.sp;

    memory::map(uc, stack_addr, stack_sz, Prot::READ | Prot::WRITE, "[stack]")?;
    abi::write_arch_reg(uc, sp_reg, stack_addr + stack_sz)?;

    let env: Vec<String> = uc.get_data().program_env.clone();
    let mut env_ptrs = Vec::with_capacity(env.len());
    for var in env.iter() {
        env_ptrs.push(memory::stack_push_string(uc, var)?);
    }
    memory::stack_align(uc)?;
    memory::stack_push(uc, 0)?;
    for ptr in env_ptrs.iter().rev() {
        memory::stack_push(uc, *ptr)?;
    }
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

pub fn load(uc: &mut ArionCpu, bm: &Baremetal) -> Result<LoaderParams> {
    let load_addr = if uc.get_data().abi.table.arch_sz == 64 {
        LINUX_64_LOAD_ADDR
    } else {
        LINUX_32_LOAD_ADDR
    };
    let mut params = LoaderParams::default();
    params.load = map_code(uc, bm, load_addr)?;
    if bm.setup_memory {
        params.stack = map_stack(uc)?;
    }
    if bm.arch == CpuArch::Arm {
        params.arm_traps = crate::loader::elf::map_arm_traps(uc)?;
    }
    init_main_thread(uc, params.load)?;
    Ok(params)
}
