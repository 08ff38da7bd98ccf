//! Memory syscall handlers: the mmap family and the program break.

use crate::errors::Result;
use crate::kernel::*;
use crate::memory;
use crate::process::ArionCpu;
use crate::syscalls::{err, val, SysRet};
use crate::{Addr, PAGE_SZ};

fn do_mmap(
    uc: &mut ArionCpu,
    addr: Addr,
    len: u64,
    prot: u64,
    flags: u64,
    fd: u64,
    off: i64,
) -> Result<SysRet> {
    let mut addr = memory::align_up(addr);
    if addr < MMAP_MIN_ADDR {
        addr = MMAP_MIN_ADDR;
    }
    let len = memory::align_up(len);
    let mem_prot = prot_from_kernel(prot);

    let mut info = "[mmap]".to_string();
    let mut data = vec![0u8; len as usize];
    if flags & MAP_ANONYMOUS != 0 {
        if flags & MAP_STACK != 0 {
            info = "[thread_stack]".to_string();
        }
    } else {
        let host_fd = {
            match uc.get_data().fs.file_entry(fd as i32) {
                Ok(entry) => {
                    info = entry.path.clone();
                    entry.host_fd
                }
                Err(_) => return err(libc::EACCES),
            }
        };
        // Read the backing range without disturbing the host position.
        match nix::sys::uio::pread(host_fd, &mut data, off) {
            Ok(_) => {}
            Err(_) => return err(libc::EBADF),
        }
    }

    let map_addr = if flags & MAP_FIXED != 0 {
        if !uc.get_data().mem.can_map(addr, len) {
            memory::unmap(uc, addr, addr + len)?;
        }
        memory::map(uc, addr, len, mem_prot, &info)?
    } else if flags & MAP_FIXED_NOREPLACE != 0 {
        if !uc.get_data().mem.can_map(addr, len) {
            return err(libc::EEXIST);
        }
        memory::map(uc, addr, len, mem_prot, &info)?
    } else {
        // Place below vvar (or the interpreter window) scanning downward.
        let hint = if uc.get_data().mem.has_mapping_with_info("[vvar]") {
            uc.get_data().mem.mapping_by_info("[vvar]")?.start
        } else if uc.get_data().abi.table.arch_sz == 32 {
            LINUX_32_INTERP_ADDR
        } else {
            LINUX_64_INTERP_ADDR
        };
        memory::map_anywhere(uc, hint, len, mem_prot, false, &info)?
    };

    memory::write(uc, map_addr, &data)?;
    val(map_addr)
}

pub fn sys_mmap(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_mmap(uc, args[0], args[1], args[2], args[3], args[4], args[5] as i64)
}

/// mmap2 takes the offset in pages.
pub fn sys_mmap2(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_mmap(
        uc,
        args[0],
        args[1],
        args[2],
        args[3],
        args[4],
        (args[5] * PAGE_SZ) as i64,
    )
}

pub fn sys_mprotect(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let addr = args[0];
    let len = args[1];
    let prot = prot_from_kernel(args[2]);
    memory::protect(uc, addr, addr + len, prot)?;
    val(0)
}

pub fn sys_munmap(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let addr = args[0];
    let len = args[1];
    memory::unmap(uc, addr, addr + len)?;
    val(0)
}

pub fn sys_brk(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let addr = args[0];
    let brk = uc.get_data().mem.brk();
    if addr == 0 || brk == 0 || addr == brk {
        return val(brk);
    }
    let heap_start = match uc.get_data().mem.mapping_by_info("[heap]") {
        Ok(m) => m.start,
        Err(_) => return val(brk),
    };
    if addr <= heap_start {
        return val(brk);
    }
    memory::resize_mapping(uc, heap_start, heap_start, addr)?;
    uc.get_data_mut().mem.set_brk(addr);
    val(addr)
}

pub fn sys_madvise(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_mlock(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_msync(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_membarrier(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}
