//! Guest-kernel ABI constants shared by the syscall layer, the threading
//! manager and the loaders. These are the *guest* Linux values; they match
//! the host's libc where the numbering is universal and are spelled out
//! where it is not.

use crate::memory::Prot;
use crate::Addr;

// clone(2) flags
pub const CLONE_VM: u64 = 0x0000_0100;
pub const CLONE_FS: u64 = 0x0000_0200;
pub const CLONE_FILES: u64 = 0x0000_0400;
pub const CLONE_SIGHAND: u64 = 0x0000_0800;
pub const CLONE_VFORK: u64 = 0x0000_4000;
pub const CLONE_PARENT: u64 = 0x0000_8000;
pub const CLONE_THREAD: u64 = 0x0001_0000;
pub const CLONE_SETTLS: u64 = 0x0008_0000;
pub const CLONE_PARENT_SETTID: u64 = 0x0010_0000;
pub const CLONE_CHILD_CLEARTID: u64 = 0x0020_0000;
pub const CLONE_CHILD_SETTID: u64 = 0x0100_0000;

// futex(2) operations
pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_WAKE: u32 = 1;
pub const FUTEX_WAIT_BITSET: u32 = 9;
pub const FUTEX_WAKE_BITSET: u32 = 10;
pub const FUTEX_PRIVATE_FLAG: u32 = 128;
pub const FUTEX_CLOCK_REALTIME: u32 = 256;
pub const FUTEX_BITSET_MATCH_ANY: u32 = 0xFFFF_FFFF;

// mmap(2) flags (identical across the supported guests)
pub const MAP_SHARED: u64 = 0x01;
pub const MAP_PRIVATE: u64 = 0x02;
pub const MAP_FIXED: u64 = 0x10;
pub const MAP_ANONYMOUS: u64 = 0x20;
pub const MAP_STACK: u64 = 0x2_0000;
pub const MAP_FIXED_NOREPLACE: u64 = 0x10_0000;
pub const MMAP_MIN_ADDR: Addr = 0x10000;

// mmap(2) prot bits
pub const PROT_READ: u64 = 0x1;
pub const PROT_WRITE: u64 = 0x2;
pub const PROT_EXEC: u64 = 0x4;

/// Translates guest `PROT_*` bits to runtime mapping protections.
pub fn prot_from_kernel(kprot: u64) -> Prot {
    let mut prot = Prot::empty();
    if kprot & PROT_READ != 0 {
        prot |= Prot::READ;
    }
    if kprot & PROT_WRITE != 0 {
        prot |= Prot::WRITE;
    }
    if kprot & PROT_EXEC != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

// wait4/waitid id types
pub const P_ALL: u64 = 0;
pub const P_PID: u64 = 1;
pub const P_PGID: u64 = 2;

// arch_prctl(2) codes (x86-64)
pub const ARCH_SET_GS: u64 = 0x1001;
pub const ARCH_SET_FS: u64 = 0x1002;
pub const ARCH_GET_FS: u64 = 0x1003;
pub const ARCH_GET_GS: u64 = 0x1004;

// openat(2) special dirfd
pub const AT_FDCWD: i64 = -100;

// rt_sigaction flags
pub const SA_SIGINFO: u64 = 4;

/// In-guest signal handler registration, one per signal number.
/// Layout-compatible with the kernel's `struct sigaction` as read from and
/// written back to guest memory by `rt_sigaction`.
#[derive(Clone, Debug, Default)]
pub struct KSigaction {
    pub handler: Addr,
    pub flags: u64,
    pub restorer: Addr,
    pub mask: u64,
}

// Auxiliary vector keys
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_BASE: u64 = 7;
pub const AT_FLAGS: u64 = 8;
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_PLATFORM: u64 = 15;
pub const AT_HWCAP: u64 = 16;
pub const AT_CLKTCK: u64 = 17;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;
pub const AT_HWCAP2: u64 = 26;
pub const AT_EXECFN: u64 = 31;
pub const AT_SYSINFO: u64 = 32;
pub const AT_SYSINFO_EHDR: u64 = 33;

// robust_list / rseq sizes (fixed by the guest ABI, pointer-width scaled)
pub fn robust_list_head_sz(ptr_sz: usize) -> u64 {
    3 * ptr_sz as u64
}
pub const RSEQ_SZ: u64 = 32;

// Default guest address-space layout.
pub const LINUX_64_LOAD_ADDR: Addr = 0x0000_5555_5555_4000;
pub const LINUX_32_LOAD_ADDR: Addr = 0x5655_6000;
pub const LINUX_64_INTERP_ADDR: Addr = 0x0000_7FFF_F700_0000;
pub const LINUX_32_INTERP_ADDR: Addr = 0xF700_0000;
pub const LINUX_64_STACK_ADDR: Addr = 0x0000_7FFF_FF70_0000;
pub const LINUX_64_STACK_SZ: u64 = 0x0080_0000;
pub const LINUX_32_STACK_ADDR: Addr = 0xFF00_0000;
pub const LINUX_32_STACK_SZ: u64 = 0x0080_0000;
pub const LINUX_64_VVAR_ADDR: Addr = 0x0000_7FFF_F7FB_C000;
pub const LINUX_64_VVAR_SZ: u64 = 0x4000;
pub const LINUX_32_VVAR_ADDR: Addr = 0xFFD0_0000;
pub const LINUX_32_VVAR_SZ: u64 = 0x4000;
pub const LINUX_64_VDSO_ADDR: Addr = 0x0000_7FFF_F7FC_0000;
pub const LINUX_64_VDSO_SZ: u64 = 0x2000;
pub const LINUX_32_VDSO_ADDR: Addr = 0xFFD0_4000;
pub const LINUX_32_VDSO_SZ: u64 = 0x2000;
pub const LINUX_64_VSYSCALL_ADDR: Addr = 0xFFFF_FFFF_FF60_0000;
pub const LINUX_64_VSYSCALL_ALIGN: u64 = 0x1000;
pub const VSYSCALL_ENTRY_SZ: usize = 1024;
pub const LINUX_32_ARM_TRAPS_ADDR: Addr = 0xFFFF_0000;
pub const LINUX_32_ARM_TRAPS_SZ: u64 = 0x1000;
/// Address of the `__kuser_get_tls` helper inside the ARM trap page.
pub const LINUX_32_ARM_GETTLS_ADDR: Addr = 0xFFFF_0FE0;

pub const HEAP_SZ: u64 = 0x0010_0000;
pub const BAREMETAL_DATA_SZ: u64 = 0x0010_0000;

// Kernel-segment presence flags advertised by each architecture table.
pub const SEG_VVAR: u8 = 1 << 0;
pub const SEG_VDSO: u8 = 1 << 1;
pub const SEG_VSYSCALL: u8 = 1 << 2;
pub const SEG_ARM_TRAPS: u8 = 1 << 3;
