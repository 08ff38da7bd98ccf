//! PowerPC32 (big-endian) ABI tables and operations. Syscalls arrive
//! through the `sc` system-call exception.

use std::collections::HashMap;
use std::rc::Rc;

use capstone::Capstone;
use unicorn_engine::RegisterPPC as R;

use crate::abi::{AbiOps, AbiTable, CpuIntr};
use crate::errors::Result;
use crate::hooks;
use crate::kernel::{SEG_VDSO, SEG_VVAR};
use crate::process::ArionCpu;
use crate::syscalls;
use crate::{cpu, Addr, CpuArch, RegId};

const EXCP_SYSCALL: u32 = 8;

lazy_static! {
    static ref GPRS: Vec<RegId> = vec![
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
        R::R13 as i32,
        R::R14 as i32,
        R::R15 as i32,
        R::R16 as i32,
        R::R17 as i32,
        R::R18 as i32,
        R::R19 as i32,
        R::R20 as i32,
        R::R21 as i32,
        R::R22 as i32,
        R::R23 as i32,
        R::R24 as i32,
        R::R25 as i32,
        R::R26 as i32,
        R::R27 as i32,
        R::R28 as i32,
        R::R29 as i32,
        R::R30 as i32,
        R::R31 as i32,
    ];
    static ref ARCH_REGS: HashMap<&'static str, RegId> = {
        let mut m = HashMap::new();
        let names = [
            "R0", "R1", "R2", "R3", "R4", "R5", "R6", "R7", "R8", "R9", "R10", "R11", "R12",
            "R13", "R14", "R15", "R16", "R17", "R18", "R19", "R20", "R21", "R22", "R23", "R24",
            "R25", "R26", "R27", "R28", "R29", "R30", "R31",
        ];
        for (name, reg) in names.iter().zip(GPRS.iter()) {
            m.insert(*name, *reg);
        }
        m.insert("PC", R::PC as i32);
        m.insert("SP", R::R1 as i32);
        m.insert("LR", R::LR as i32);
        m.insert("CTR", R::CTR as i32);
        m.insert("XER", R::XER as i32);
        m.insert("MSR", R::MSR as i32);
        m.insert("CR0", R::CR0 as i32);
        m
    };
    static ref ARCH_REGS_SZ: HashMap<RegId, u8> = {
        let mut m = HashMap::new();
        for reg in GPRS.iter() {
            m.insert(*reg, 4);
        }
        for reg in [
            R::PC as i32,
            R::LR as i32,
            R::CTR as i32,
            R::XER as i32,
            R::MSR as i32,
            R::CR0 as i32,
        ]
        .iter()
        {
            m.insert(*reg, 4);
        }
        m
    };
    static ref CTXT_REGS: Vec<RegId> = {
        let mut v = GPRS.clone();
        v.extend_from_slice(&[
            R::PC as i32,
            R::LR as i32,
            R::CTR as i32,
            R::XER as i32,
            R::CR0 as i32,
            R::MSR as i32,
        ]);
        v
    };
    static ref IDT: HashMap<u64, CpuIntr> = {
        let mut m = HashMap::new();
        m.insert(1, CpuIntr::MachineCheck);
        m.insert(2, CpuIntr::DataAbort);
        m.insert(3, CpuIntr::PrefetchAbort);
        m.insert(4, CpuIntr::Irq);
        m.insert(5, CpuIntr::Unaligned);
        m.insert(6, CpuIntr::Udef);
        m.insert(7, CpuIntr::Nocp);
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
        R::R3 as i32,
        R::R4 as i32,
        R::R5 as i32,
        R::R6 as i32,
        R::R7 as i32,
        R::R8 as i32,
        R::R9 as i32,
        R::R10 as i32,
    ];
    static ref CALL_PARAM_REGS: Vec<RegId> = vec![
        R::R3 as i32,
        R::R4 as i32,
        R::R5 as i32,
        R::R6 as i32,
        R::R7 as i32,
        R::R8 as i32,
        R::R9 as i32,
        R::R10 as i32,
    ];
    pub static ref TABLE: AbiTable = AbiTable {
        arch: CpuArch::Ppc32,
        arch_sz: 32,
        ptr_sz: 4,
        hwcap: 0,
        hwcap2: 0,
        seg_flags: SEG_VVAR | SEG_VDSO,
        pc: R::PC as i32,
        sp: R::R1 as i32,
        tls: Some(R::R2 as i32),
        call_ret: R::R3 as i32,
        call_params: CALL_PARAM_REGS.as_slice(),
        sysno: R::R0 as i32,
        sys_ret: R::R3 as i32,
        sys_params: SYS_PARAM_REGS.as_slice(),
        hooks_intr: true,
        regs_by_name: &*ARCH_REGS,
        reg_sizes: &*ARCH_REGS_SZ,
        ctxt_regs: CTXT_REGS.as_slice(),
        idt: &*IDT,
        syscall_names: &*SYSCALL_NAMES,
    };
}

pub struct Ppc32Ops;

impl AbiOps for Ppc32Ops {
    fn setup(&self, uc: &mut ArionCpu) -> Result<()> {
        hooks::hook_intr(
            uc,
            Rc::new(|uc, intno| {
                if intno == EXCP_SYSCALL {
                    syscalls::dispatch(uc)?;
                }
                Ok(())
            }),
        )?;
        Ok(())
    }

    fn dump_tls(&self, uc: &mut ArionCpu) -> Result<Addr> {
        cpu::reg_read(uc, R::R2 as i32)
    }

    fn load_tls(&self, uc: &mut ArionCpu, tls: Addr) -> Result<()> {
        cpu::reg_write(uc, R::R2 as i32, tls)
    }

    fn curr_cs(&self, _uc: &ArionCpu) -> Result<Capstone> {
        cpu::disassembler(CpuArch::Ppc32, false)
    }

    fn sys_insn_sz(&self, _uc: &ArionCpu) -> u64 {
        4
    }
}

#[rustfmt::skip]
const SYSCALLS: &[(u64, &str)] = &[
    (0, "restart_syscall"), (1, "exit"), (2, "fork"), (3, "read"),
    (4, "write"), (5, "open"), (6, "close"), (9, "link"), (10, "unlink"),
    (11, "execve"), (12, "chdir"), (13, "time"), (15, "chmod"), (19, "lseek"),
    (20, "getpid"), (23, "setuid"), (24, "getuid"), (27, "alarm"),
    (29, "pause"), (33, "access"), (36, "sync"), (37, "kill"), (38, "rename"),
    (39, "mkdir"), (40, "rmdir"), (41, "dup"), (42, "pipe"), (43, "times"),
    (45, "brk"), (46, "setgid"), (47, "getgid"), (49, "geteuid"),
    (50, "getegid"), (54, "ioctl"), (55, "fcntl"), (57, "setpgid"),
    (60, "umask"), (63, "dup2"), (64, "getppid"), (65, "getpgrp"),
    (66, "setsid"), (70, "setreuid"), (71, "setregid"), (75, "setrlimit"),
    (76, "getrlimit"), (77, "getrusage"), (78, "gettimeofday"),
    (80, "getgroups"), (81, "setgroups"), (83, "symlink"), (85, "readlink"),
    (90, "mmap"), (91, "munmap"), (92, "truncate"), (93, "ftruncate"),
    (94, "fchmod"), (102, "socketcall"), (106, "newstat"), (107, "newlstat"),
    (108, "newfstat"), (114, "wait4"), (116, "sysinfo"), (118, "fsync"),
    (119, "sigreturn"), (120, "clone"), (122, "newuname"), (125, "mprotect"),
    (132, "getpgid"), (133, "fchdir"), (136, "personality"), (140, "_llseek"),
    (141, "getdents"), (142, "_newselect"), (143, "flock"), (145, "readv"),
    (146, "writev"), (147, "getsid"), (148, "fdatasync"), (158, "sched_yield"),
    (162, "nanosleep"), (163, "mremap"), (164, "setresuid"),
    (165, "getresuid"), (167, "poll"), (169, "setresgid"), (170, "getresgid"),
    (171, "prctl"), (172, "rt_sigreturn"), (173, "rt_sigaction"),
    (174, "rt_sigprocmask"), (178, "rt_sigsuspend"), (179, "pread64"),
    (180, "pwrite64"), (181, "chown"), (182, "getcwd"), (185, "sigaltstack"),
    (189, "vfork"), (190, "ugetrlimit"), (192, "mmap2"), (195, "stat64"),
    (196, "lstat64"), (197, "fstat64"), (202, "getdents64"),
    (204, "fcntl64"), (205, "madvise"), (207, "gettid"), (208, "tkill"),
    (212, "getxattr"), (213, "lgetxattr"), (221, "futex"),
    (222, "sched_setaffinity"), (223, "sched_getaffinity"),
    (232, "set_tid_address"), (233, "fadvise64"), (234, "exit_group"),
    (246, "clock_gettime"), (247, "clock_getres"), (248, "clock_nanosleep"),
    (250, "tgkill"), (252, "statfs64"), (253, "fstatfs64"), (272, "waitid"),
    (280, "pselect6"), (281, "ppoll"), (286, "openat"), (287, "mkdirat"),
    (291, "fstatat64"), (292, "unlinkat"), (293, "renameat"),
    (296, "readlinkat"), (297, "fchmodat"), (298, "faccessat"),
    (300, "set_robust_list"), (299, "get_robust_list"), (302, "getcpu"),
    (304, "utimensat"), (316, "dup3"), (317, "pipe2"), (325, "prlimit64"),
    (326, "socket"), (327, "bind"), (328, "connect"), (329, "listen"),
    (330, "accept"), (331, "getsockname"), (332, "getpeername"),
    (333, "socketpair"), (334, "send"), (335, "sendto"), (336, "recv"),
    (337, "recvfrom"), (338, "shutdown"), (339, "setsockopt"),
    (340, "getsockopt"), (341, "sendmsg"), (342, "recvmsg"), (344, "accept4"),
    (349, "sendmmsg"), (357, "renameat2"), (359, "getrandom"),
    (360, "memfd_create"), (365, "membarrier"), (383, "statx"), (387, "rseq"),
    (403, "clock_gettime64"), (407, "clock_nanosleep_time64"),
    (422, "futex_time64"), (435, "clone3"), (439, "faccessat2"),
];
