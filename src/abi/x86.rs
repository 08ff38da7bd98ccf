//! 32-bit x86 ABI tables and operations. Syscalls arrive through
//! `int 0x80`; TLS lives in GDT entries managed by [`crate::abi::gdt`].

use std::collections::HashMap;
use std::rc::Rc;

use capstone::Capstone;
use unicorn_engine::RegisterX86 as R;

use crate::abi::x86_64::x86_idt;
use crate::abi::{gdt, AbiOps, AbiTable, CpuIntr};
use crate::errors::Result;
use crate::hooks;
use crate::kernel::{SEG_VDSO, SEG_VVAR};
use crate::process::ArionCpu;
use crate::syscalls;
use crate::{Addr, CpuArch, RegId};

const INT80: u32 = 0x80;

lazy_static! {
    static ref ARCH_REGS: HashMap<&'static str, RegId> = {
        let mut m = HashMap::new();
        m.insert("EAX", R::EAX as i32);
        m.insert("EBX", R::EBX as i32);
        m.insert("ECX", R::ECX as i32);
        m.insert("EDX", R::EDX as i32);
        m.insert("ESI", R::ESI as i32);
        m.insert("EDI", R::EDI as i32);
        m.insert("EBP", R::EBP as i32);
        m.insert("ESP", R::ESP as i32);
        m.insert("EIP", R::EIP as i32);
        m.insert("EFLAGS", R::EFLAGS as i32);
        m.insert("CS", R::CS as i32);
        m.insert("DS", R::DS as i32);
        m.insert("ES", R::ES as i32);
        m.insert("FS", R::FS as i32);
        m.insert("GS", R::GS as i32);
        m.insert("SS", R::SS as i32);
        m
    };
    static ref ARCH_REGS_SZ: HashMap<RegId, u8> = {
        let mut m = HashMap::new();
        for reg in [
            R::EAX,
            R::EBX,
            R::ECX,
            R::EDX,
            R::ESI,
            R::EDI,
            R::EBP,
            R::ESP,
            R::EIP,
            R::EFLAGS,
        ]
        .iter()
        {
            m.insert(*reg as i32, 4);
        }
        for reg in [R::CS, R::DS, R::ES, R::FS, R::GS, R::SS].iter() {
            m.insert(*reg as i32, 2);
        }
        m
    };
    static ref CTXT_REGS: Vec<RegId> = vec![
        R::EAX as i32,
        R::EBX as i32,
        R::ECX as i32,
        R::EDX as i32,
        R::ESI as i32,
        R::EDI as i32,
        R::EBP as i32,
        R::ESP as i32,
        R::EIP as i32,
        R::EFLAGS as i32,
        R::CS as i32,
        R::DS as i32,
        R::ES as i32,
        R::FS as i32,
        R::GS as i32,
        R::SS as i32,
    ];
    static ref IDT: HashMap<u64, CpuIntr> = x86_idt();
    static ref SYSCALL_NAMES: HashMap<u64, &'static str> = {
        let mut m = HashMap::new();
        for (no, name) in SYSCALLS.iter() {
            m.insert(*no, *name);
        }
        m
    };
    static ref SYS_PARAM_REGS: Vec<RegId> = vec![
        R::EBX as i32,
        R::ECX as i32,
        R::EDX as i32,
        R::ESI as i32,
        R::EDI as i32,
        R::EBP as i32,
    ];
    static ref CALL_PARAM_REGS: Vec<RegId> = Vec::new();
    pub static ref TABLE: AbiTable = AbiTable {
        arch: CpuArch::X86,
        arch_sz: 32,
        ptr_sz: 4,
        hwcap: 0x0078_BFBF,
        hwcap2: 0,
        seg_flags: SEG_VVAR | SEG_VDSO,
        pc: R::EIP as i32,
        sp: R::ESP as i32,
        tls: None,
        call_ret: R::EAX as i32,
        call_params: CALL_PARAM_REGS.as_slice(),
        sysno: R::EAX as i32,
        sys_ret: R::EAX as i32,
        sys_params: SYS_PARAM_REGS.as_slice(),
        hooks_intr: true,
        regs_by_name: &*ARCH_REGS,
        reg_sizes: &*ARCH_REGS_SZ,
        ctxt_regs: CTXT_REGS.as_slice(),
        idt: &*IDT,
        syscall_names: &*SYSCALL_NAMES,
    };
}

pub struct X86Ops;

impl AbiOps for X86Ops {
    fn setup(&self, uc: &mut ArionCpu) -> Result<()> {
        hooks::hook_intr(
            uc,
            Rc::new(|uc, intno| {
                if intno == INT80 {
                    syscalls::dispatch(uc)?;
                }
                Ok(())
            }),
        )?;
        Ok(())
    }

    fn dump_tls(&self, uc: &mut ArionCpu) -> Result<Addr> {
        gdt::dump_tls_base(uc)
    }

    fn load_tls(&self, uc: &mut ArionCpu, tls: Addr) -> Result<()> {
        gdt::load_tls_base(uc, tls)
    }

    fn curr_cs(&self, _uc: &ArionCpu) -> Result<Capstone> {
        crate::cpu::disassembler(CpuArch::X86, false)
    }

    fn sys_insn_sz(&self, _uc: &ArionCpu) -> u64 {
        2
    }
}

// The 32-bit table resolves the *32 uid/gid generation to the same handlers
// as the modern names.
#[rustfmt::skip]
const SYSCALLS: &[(u64, &str)] = &[
    (1, "exit"), (2, "fork"), (3, "read"), (4, "write"), (5, "open"),
    (6, "close"), (9, "link"), (10, "unlink"), (11, "execve"), (12, "chdir"),
    (13, "time"), (15, "chmod"), (19, "lseek"), (20, "getpid"), (24, "getuid"),
    (27, "alarm"), (29, "pause"), (33, "access"), (36, "sync"), (37, "kill"),
    (38, "rename"), (39, "mkdir"), (40, "rmdir"), (41, "dup"), (42, "pipe"),
    (43, "times"), (45, "brk"), (47, "getgid"), (49, "geteuid"),
    (50, "getegid"), (54, "ioctl"), (55, "fcntl"), (57, "setpgid"),
    (60, "umask"), (63, "dup2"), (64, "getppid"), (65, "getpgrp"),
    (66, "setsid"), (75, "setrlimit"), (76, "old_getrlimit"),
    (77, "getrusage"), (78, "gettimeofday"), (83, "symlink"), (85, "readlink"),
    (91, "munmap"), (93, "ftruncate"), (94, "fchmod"), (96, "getpriority"),
    (97, "setpriority"), (102, "socketcall"), (104, "setitimer"),
    (105, "getitimer"), (106, "newstat"), (107, "newlstat"), (108, "newfstat"),
    (114, "wait4"), (116, "sysinfo"), (118, "fsync"), (119, "sigreturn"),
    (120, "clone"), (122, "newuname"), (125, "mprotect"), (132, "getpgid"),
    (133, "fchdir"), (140, "_llseek"), (141, "getdents"), (142, "select"),
    (143, "flock"), (145, "readv"), (146, "writev"), (147, "getsid"),
    (148, "fdatasync"), (158, "sched_yield"),
    (159, "sched_get_priority_max"), (160, "sched_get_priority_min"),
    (162, "nanosleep"), (163, "mremap"), (168, "poll"), (172, "prctl"),
    (173, "rt_sigreturn"), (174, "rt_sigaction"), (175, "rt_sigprocmask"),
    (179, "rt_sigsuspend"), (180, "pread64"), (181, "pwrite64"),
    (183, "getcwd"), (186, "sigaltstack"), (190, "vfork"), (191, "getrlimit"),
    (192, "mmap2"), (195, "stat64"), (196, "lstat64"), (197, "fstat64"),
    (199, "getuid"), (200, "getgid"), (201, "geteuid"), (202, "getegid"),
    (203, "setreuid"), (204, "setregid"), (205, "getgroups"),
    (206, "setgroups"), (208, "setresuid"), (209, "getresuid"),
    (210, "setresgid"), (211, "getresgid"), (212, "chown"), (213, "setuid"),
    (214, "setgid"), (219, "madvise"), (220, "getdents64"), (221, "fcntl64"),
    (224, "gettid"), (229, "getxattr"), (230, "lgetxattr"), (238, "tkill"),
    (240, "futex"), (241, "sched_setaffinity"), (242, "sched_getaffinity"),
    (243, "set_thread_area"), (244, "get_thread_area"), (252, "exit_group"),
    (258, "set_tid_address"), (265, "clock_gettime"), (266, "clock_getres"),
    (268, "statfs64"), (269, "fstatfs64"), (270, "tgkill"),
    (272, "fadvise64_64"), (289, "ioprio_set"), (295, "openat"),
    (296, "mkdirat"), (300, "fstatat64"), (301, "unlinkat"), (302, "renameat"),
    (305, "readlinkat"), (306, "fchmodat"), (307, "faccessat"),
    (308, "pselect6"), (309, "ppoll"), (311, "set_robust_list"),
    (312, "get_robust_list"), (320, "utimensat"), (331, "pipe2"),
    (330, "dup3"), (340, "prlimit64"), (345, "sendmmsg"), (355, "getrandom"),
    (356, "memfd_create"), (359, "socket"), (360, "socketpair"),
    (361, "bind"), (362, "connect"), (363, "listen"), (364, "accept4"),
    (365, "getsockopt"), (366, "setsockopt"), (367, "getsockname"),
    (368, "getpeername"), (369, "sendto"), (370, "sendmsg"),
    (371, "recvfrom"), (372, "recvmsg"), (373, "shutdown"), (375, "membarrier"),
    (383, "statx"), (384, "arch_prctl"), (386, "rseq"),
    (403, "clock_gettime64"), (407, "clock_nanosleep_time64"),
    (422, "futex_time64"), (435, "clone3"), (439, "faccessat2"),
];
