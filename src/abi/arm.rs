//! ARM (AArch32, ARM+Thumb dual encoding) ABI tables and operations.
//!
//! Syscalls arrive through the `svc`/`swi` interrupt. TLS is the CP15
//! TPIDRURO register, mirrored into the kernel-helper trap page so the
//! `__kuser_get_tls` sequence keeps working.

use std::collections::HashMap;
use std::rc::Rc;

use capstone::Capstone;
use unicorn_engine::RegisterARM as R;

use crate::abi::{AbiOps, AbiTable, CpuIntr};
use crate::errors::Result;
use crate::hooks;
use crate::kernel::{LINUX_32_ARM_GETTLS_ADDR, SEG_ARM_TRAPS, SEG_VDSO, SEG_VVAR};
use crate::process::ArionCpu;
use crate::syscalls;
use crate::{cpu, memory, Addr, CpuArch, RegId};

const EXCP_SWI: u32 = 2;
const CPSR_THUMB_BIT: u64 = 1 << 5;
/// CP15 c13/c0/3, user read-only thread id register.
const TPIDRURO: RegId = R::C13_C0_3 as i32;
/// CP15 c1/c0/2, coprocessor access control register.
const CPACR: RegId = R::C1_C0_2 as i32;

lazy_static! {
    static ref ARCH_REGS: HashMap<&'static str, RegId> = {
        let mut m = HashMap::new();
        m.insert("R0", R::R0 as i32);
        m.insert("R1", R::R1 as i32);
        m.insert("R2", R::R2 as i32);
        m.insert("R3", R::R3 as i32);
        m.insert("R4", R::R4 as i32);
        m.insert("R5", R::R5 as i32);
        m.insert("R6", R::R6 as i32);
        m.insert("R7", R::R7 as i32);
        m.insert("R8", R::R8 as i32);
        m.insert("R9", R::R9 as i32);
        m.insert("R10", R::R10 as i32);
        m.insert("R11", R::R11 as i32);
        m.insert("R12", R::R12 as i32);
        m.insert("SP", R::SP as i32);
        m.insert("LR", R::LR as i32);
        m.insert("PC", R::PC as i32);
        m.insert("CPSR", R::CPSR as i32);
        m.insert("FP", R::R11 as i32);
        m.insert("IP", R::R12 as i32);
        m
    };
    static ref ARCH_REGS_SZ: HashMap<RegId, u8> = {
        let mut m = HashMap::new();
        for reg in [
            R::R0,
            R::R1,
            R::R2,
            R::R3,
            R::R4,
            R::R5,
            R::R6,
            R::R7,
            R::R8,
            R::R9,
            R::R10,
            R::R11,
            R::R12,
            R::SP,
            R::LR,
            R::PC,
            R::CPSR,
        ]
        .iter()
        {
            m.insert(*reg as i32, 4);
        }
        m
    };
    static ref CTXT_REGS: Vec<RegId> = vec![
        R::R0 as i32,
        R::R1 as i32,
        R::R2 as i32,
        R::R3 as i32,
        R::R4 as i32,
        R::R5 as i32,
        R::R6 as i32,
        R::R7 as i32,
        R::R8 as i32,
        R::R9 as i32,
        R::R10 as i32,
        R::R11 as i32,
        R::R12 as i32,
        R::SP as i32,
        R::LR as i32,
        R::PC as i32,
        R::CPSR as i32,
    ];
    static ref IDT: HashMap<u64, CpuIntr> = {
        let mut m = HashMap::new();
        m.insert(1, CpuIntr::Udef);
        m.insert(3, CpuIntr::PrefetchAbort);
        m.insert(4, CpuIntr::DataAbort);
        m.insert(5, CpuIntr::Irq);
        m.insert(6, CpuIntr::Fiq);
        m.insert(7, CpuIntr::Bkpt);
        m.insert(8, CpuIntr::ExceptionExit);
        m.insert(9, CpuIntr::KernelTrap);
        m.insert(11, CpuIntr::Hvc);
        m.insert(12, CpuIntr::HypTrap);
        m.insert(13, CpuIntr::Smc);
        m.insert(14, CpuIntr::Virq);
        m.insert(15, CpuIntr::Vfiq);
        m.insert(16, CpuIntr::Semihost);
        m.insert(17, CpuIntr::Nocp);
        m.insert(18, CpuIntr::Invstate);
        m.insert(19, CpuIntr::Stkof);
        m.insert(20, CpuIntr::Lazyfp);
        m.insert(21, CpuIntr::Lserr);
        m.insert(22, CpuIntr::Unaligned);
        m
    };
    static ref SYSCALL_NAMES: HashMap<u64, &'static str> = {
        let mut m = HashMap::new();
        for (no, name) in SYSCALLS.iter() {
            m.insert(*no, *name);
        }
        m
    };
    static ref SYS_PARAM_REGS: Vec<RegId> = vec![
        R::R0 as i32,
        R::R1 as i32,
        R::R2 as i32,
        R::R3 as i32,
        R::R4 as i32,
        R::R5 as i32,
        R::R6 as i32,
    ];
    static ref CALL_PARAM_REGS: Vec<RegId> =
        vec![R::R0 as i32, R::R1 as i32, R::R2 as i32, R::R3 as i32];
    pub static ref TABLE: AbiTable = AbiTable {
        arch: CpuArch::Arm,
        arch_sz: 32,
        ptr_sz: 4,
        hwcap: 0x0027_B0D6,
        hwcap2: 0x1F,
        seg_flags: SEG_VVAR | SEG_VDSO | SEG_ARM_TRAPS,
        pc: R::PC as i32,
        sp: R::SP as i32,
        tls: None,
        call_ret: R::R0 as i32,
        call_params: CALL_PARAM_REGS.as_slice(),
        sysno: R::R7 as i32,
        sys_ret: R::R0 as i32,
        sys_params: SYS_PARAM_REGS.as_slice(),
        hooks_intr: true,
        regs_by_name: &*ARCH_REGS,
        reg_sizes: &*ARCH_REGS_SZ,
        ctxt_regs: CTXT_REGS.as_slice(),
        idt: &*IDT,
        syscall_names: &*SYSCALL_NAMES,
    };
}

pub struct ArmOps;

impl ArmOps {
    fn enable_vfp(&self, uc: &mut ArionCpu) -> Result<()> {
        let mut cpacr = cpu::reg_read(uc, CPACR)?;
        cpacr |= (0b11 << 20) | (0b11 << 22);
        cpu::reg_write(uc, CPACR, cpacr)?;
        let mut fpexc = cpu::reg_read(uc, R::FPEXC as i32)?;
        fpexc |= 1 << 30;
        cpu::reg_write(uc, R::FPEXC as i32, fpexc)
    }
}

impl AbiOps for ArmOps {
    fn setup(&self, uc: &mut ArionCpu) -> Result<()> {
        hooks::hook_intr(
            uc,
            Rc::new(|uc, intno| {
                if intno == EXCP_SWI {
                    syscalls::dispatch(uc)?;
                }
                Ok(())
            }),
        )?;
        self.enable_vfp(uc)
    }

    fn dump_tls(&self, uc: &mut ArionCpu) -> Result<Addr> {
        cpu::reg_read(uc, TPIDRURO)
    }

    fn load_tls(&self, uc: &mut ArionCpu, tls: Addr) -> Result<()> {
        cpu::reg_write(uc, TPIDRURO, tls)?;
        // Keep the __kuser_get_tls slot in the trap page coherent.
        if memory::is_mapped(uc, LINUX_32_ARM_GETTLS_ADDR) {
            memory::write_ptr(uc, LINUX_32_ARM_GETTLS_ADDR + 0x10, tls)?;
        }
        Ok(())
    }

    fn prerun_hook(&self, uc: &mut ArionCpu, start: &mut Addr) -> Result<()> {
        if self.is_thumb(uc) {
            *start |= 1;
        }
        Ok(())
    }

    fn is_thumb(&self, uc: &ArionCpu) -> bool {
        cpu::reg_read(uc, R::CPSR as i32)
            .map(|cpsr| cpsr & CPSR_THUMB_BIT != 0)
            .unwrap_or(false)
    }

    fn curr_cs(&self, uc: &ArionCpu) -> Result<Capstone> {
        cpu::disassembler(CpuArch::Arm, self.is_thumb(uc))
    }

    fn sys_insn_sz(&self, uc: &ArionCpu) -> u64 {
        if self.is_thumb(uc) {
            2
        } else {
            4
        }
    }
}

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
    (66, "setsid"), (75, "setrlimit"), (77, "getrusage"),
    (78, "gettimeofday"), (83, "symlink"), (85, "readlink"), (91, "munmap"),
    (93, "ftruncate"), (94, "fchmod"), (102, "socketcall"), (104, "setitimer"),
    (106, "newstat"), (107, "newlstat"), (108, "newfstat"), (114, "wait4"),
    (116, "sysinfo"), (118, "fsync"), (119, "sigreturn"), (120, "clone"),
    (122, "newuname"), (125, "mprotect"), (132, "getpgid"), (133, "fchdir"),
    (140, "_llseek"), (141, "getdents"), (142, "select"), (143, "flock"),
    (145, "readv"), (146, "writev"), (147, "getsid"), (148, "fdatasync"),
    (158, "sched_yield"), (162, "nanosleep"), (163, "mremap"), (168, "poll"),
    (172, "prctl"), (173, "rt_sigreturn"), (174, "rt_sigaction"),
    (175, "rt_sigprocmask"), (179, "rt_sigsuspend"), (180, "pread64"),
    (181, "pwrite64"), (183, "getcwd"), (186, "sigaltstack"), (190, "vfork"),
    (191, "getrlimit"), (192, "mmap2"), (195, "stat64"), (196, "lstat64"),
    (197, "fstat64"), (199, "getuid"), (200, "getgid"), (201, "geteuid"),
    (202, "getegid"), (203, "setreuid"), (204, "setregid"), (205, "getgroups"),
    (206, "setgroups"), (208, "setresuid"), (209, "getresuid"),
    (210, "setresgid"), (211, "getresgid"), (212, "chown"), (213, "setuid"),
    (214, "setgid"), (219, "madvise"), (217, "getdents64"), (221, "fcntl64"),
    (224, "gettid"), (229, "getxattr"), (230, "lgetxattr"), (238, "tkill"),
    (240, "futex"), (241, "sched_setaffinity"), (242, "sched_getaffinity"),
    (248, "exit_group"), (256, "set_tid_address"), (263, "clock_gettime"),
    (264, "clock_getres"), (266, "statfs64"), (267, "fstatfs64"),
    (268, "tgkill"), (281, "socket"), (282, "bind"), (283, "connect"),
    (284, "listen"), (285, "accept"), (286, "getsockname"),
    (287, "getpeername"), (288, "socketpair"), (289, "send"), (290, "sendto"),
    (291, "recv"), (292, "recvfrom"), (293, "shutdown"), (294, "setsockopt"),
    (295, "getsockopt"), (296, "sendmsg"), (297, "recvmsg"), (322, "openat"),
    (323, "mkdirat"), (327, "fstatat64"), (328, "unlinkat"), (329, "renameat"),
    (332, "readlinkat"), (333, "fchmodat"), (334, "faccessat"),
    (335, "pselect6"), (336, "ppoll"), (338, "set_robust_list"),
    (339, "get_robust_list"), (348, "utimensat"), (358, "dup3"),
    (359, "pipe2"), (366, "accept4"), (369, "prlimit64"), (374, "sendmmsg"),
    (384, "getrandom"), (385, "memfd_create"), (397, "statx"), (398, "rseq"),
    (403, "clock_gettime64"), (407, "clock_nanosleep_time64"),
    (422, "futex_time64"), (435, "clone3"), (439, "faccessat2"),
    (983045, "set_tls"),
];
