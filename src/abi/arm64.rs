//! ARM64 (AArch64) ABI tables and operations. Syscalls arrive through the
//! `svc` interrupt; TLS is TPIDR_EL0.

use std::collections::HashMap;
use std::rc::Rc;

use capstone::Capstone;
use unicorn_engine::RegisterARM64 as R;

use crate::abi::{AbiOps, AbiTable, CpuIntr};
use crate::errors::Result;
use crate::hooks;
use crate::kernel::{SEG_VDSO, SEG_VVAR};
use crate::process::ArionCpu;
use crate::syscalls;
use crate::{cpu, Addr, CpuArch, RegId};

const EXCP_SWI: u32 = 2;

lazy_static! {
    static ref ARCH_REGS: HashMap<&'static str, RegId> = {
        let mut m = HashMap::new();
        let xregs = [
            R::X0,
            R::X1,
            R::X2,
            R::X3,
            R::X4,
            R::X5,
            R::X6,
            R::X7,
            R::X8,
            R::X9,
            R::X10,
            R::X11,
            R::X12,
            R::X13,
            R::X14,
            R::X15,
            R::X16,
            R::X17,
            R::X18,
            R::X19,
            R::X20,
            R::X21,
            R::X22,
            R::X23,
            R::X24,
            R::X25,
            R::X26,
            R::X27,
            R::X28,
        ];
        let names = [
            "X0", "X1", "X2", "X3", "X4", "X5", "X6", "X7", "X8", "X9", "X10", "X11", "X12",
            "X13", "X14", "X15", "X16", "X17", "X18", "X19", "X20", "X21", "X22", "X23", "X24",
            "X25", "X26", "X27", "X28",
        ];
        for (name, reg) in names.iter().zip(xregs.iter()) {
            m.insert(*name, *reg as i32);
        }
        m.insert("X29", R::X29 as i32);
        m.insert("FP", R::X29 as i32);
        m.insert("X30", R::X30 as i32);
        m.insert("LR", R::X30 as i32);
        m.insert("SP", R::SP as i32);
        m.insert("PC", R::PC as i32);
        m.insert("NZCV", R::NZCV as i32);
        m.insert("TPIDR_EL0", R::TPIDR_EL0 as i32);
        m
    };
    static ref ARCH_REGS_SZ: HashMap<RegId, u8> = {
        let mut m = HashMap::new();
        for (_, reg) in ARCH_REGS.iter() {
            m.insert(*reg, 8);
        }
        m
    };
    static ref CTXT_REGS: Vec<RegId> = {
        let mut v: Vec<RegId> = vec![
            R::X0 as i32,
            R::X1 as i32,
            R::X2 as i32,
            R::X3 as i32,
            R::X4 as i32,
            R::X5 as i32,
            R::X6 as i32,
            R::X7 as i32,
            R::X8 as i32,
            R::X9 as i32,
            R::X10 as i32,
            R::X11 as i32,
            R::X12 as i32,
            R::X13 as i32,
            R::X14 as i32,
            R::X15 as i32,
            R::X16 as i32,
            R::X17 as i32,
            R::X18 as i32,
            R::X19 as i32,
            R::X20 as i32,
            R::X21 as i32,
            R::X22 as i32,
            R::X23 as i32,
            R::X24 as i32,
            R::X25 as i32,
            R::X26 as i32,
            R::X27 as i32,
            R::X28 as i32,
            R::X29 as i32,
            R::X30 as i32,
            R::SP as i32,
            R::PC as i32,
            R::NZCV as i32,
        ];
        v.dedup();
        v
    };
    static ref IDT: HashMap<u64, CpuIntr> = {
        let mut m = HashMap::new();
        m.insert(1, CpuIntr::Udef);
        m.insert(3, CpuIntr::PrefetchAbort);
        m.insert(4, CpuIntr::DataAbort);
        m.insert(5, CpuIntr::Irq);
        m.insert(6, CpuIntr::Fiq);
        m.insert(7, CpuIntr::Bkpt);
        m.insert(11, CpuIntr::Hvc);
        m.insert(12, CpuIntr::HypTrap);
        m.insert(13, CpuIntr::Smc);
        m.insert(14, CpuIntr::Virq);
        m.insert(15, CpuIntr::Vfiq);
        m.insert(16, CpuIntr::Semihost);
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
        R::X0 as i32,
        R::X1 as i32,
        R::X2 as i32,
        R::X3 as i32,
        R::X4 as i32,
        R::X5 as i32,
    ];
    static ref CALL_PARAM_REGS: Vec<RegId> = vec![
        R::X0 as i32,
        R::X1 as i32,
        R::X2 as i32,
        R::X3 as i32,
        R::X4 as i32,
        R::X5 as i32,
        R::X6 as i32,
        R::X7 as i32,
    ];
    pub static ref TABLE: AbiTable = AbiTable {
        arch: CpuArch::Arm64,
        arch_sz: 64,
        ptr_sz: 8,
        hwcap: 0x0000_08F7,
        hwcap2: 0,
        seg_flags: SEG_VVAR | SEG_VDSO,
        pc: R::PC as i32,
        sp: R::SP as i32,
        tls: Some(R::TPIDR_EL0 as i32),
        call_ret: R::X0 as i32,
        call_params: CALL_PARAM_REGS.as_slice(),
        sysno: R::X8 as i32,
        sys_ret: R::X0 as i32,
        sys_params: SYS_PARAM_REGS.as_slice(),
        hooks_intr: true,
        regs_by_name: &*ARCH_REGS,
        reg_sizes: &*ARCH_REGS_SZ,
        ctxt_regs: CTXT_REGS.as_slice(),
        idt: &*IDT,
        syscall_names: &*SYSCALL_NAMES,
    };
}

pub struct Arm64Ops;

impl AbiOps for Arm64Ops {
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
        Ok(())
    }

    fn dump_tls(&self, uc: &mut ArionCpu) -> Result<Addr> {
        cpu::reg_read(uc, R::TPIDR_EL0 as i32)
    }

    fn load_tls(&self, uc: &mut ArionCpu, tls: Addr) -> Result<()> {
        cpu::reg_write(uc, R::TPIDR_EL0 as i32, tls)
    }

    fn curr_cs(&self, _uc: &ArionCpu) -> Result<Capstone> {
        cpu::disassembler(CpuArch::Arm64, false)
    }

    fn sys_insn_sz(&self, _uc: &ArionCpu) -> u64 {
        4
    }
}

#[rustfmt::skip]
const SYSCALLS: &[(u64, &str)] = &[
    (17, "getcwd"), (23, "dup"), (24, "dup3"), (25, "fcntl"), (29, "ioctl"),
    (34, "mkdirat"), (35, "unlinkat"), (37, "linkat"), (38, "renameat"),
    (43, "statfs"), (44, "fstatfs"), (45, "truncate"), (46, "ftruncate"),
    (48, "faccessat"), (49, "chdir"), (50, "fchdir"), (53, "fchmodat"),
    (56, "openat"), (57, "close"), (59, "pipe2"), (61, "getdents64"),
    (62, "lseek"), (63, "read"), (64, "write"), (65, "readv"), (66, "writev"),
    (67, "pread64"), (68, "pwrite64"), (72, "pselect6"), (73, "ppoll"),
    (77, "tee"), (78, "readlinkat"), (79, "newfstatat"), (80, "newfstat"),
    (82, "fsync"), (83, "fdatasync"), (88, "utimensat"), (90, "capget"),
    (91, "capset"), (93, "exit"), (94, "exit_group"), (95, "waitid"),
    (96, "set_tid_address"), (98, "futex"), (99, "set_robust_list"),
    (100, "get_robust_list"), (101, "nanosleep"), (113, "clock_gettime"),
    (114, "clock_getres"), (115, "clock_nanosleep"), (122, "sched_setaffinity"),
    (123, "sched_getaffinity"), (124, "sched_yield"), (129, "kill"),
    (130, "tkill"), (131, "tgkill"), (132, "sigaltstack"),
    (134, "rt_sigaction"), (135, "rt_sigprocmask"), (137, "rt_sigtimedwait"),
    (139, "rt_sigreturn"), (153, "times"), (154, "setpgid"), (155, "getpgid"),
    (156, "getsid"), (157, "setsid"), (158, "getgroups"), (159, "setgroups"),
    (160, "newuname"), (163, "getrlimit"), (164, "setrlimit"),
    (165, "getrusage"), (166, "umask"), (167, "prctl"), (169, "gettimeofday"),
    (172, "getpid"), (173, "getppid"), (174, "getuid"), (175, "geteuid"),
    (176, "getgid"), (177, "getegid"), (178, "gettid"), (179, "sysinfo"),
    (198, "socket"), (199, "socketpair"), (200, "bind"), (201, "listen"),
    (202, "connect"), (203, "getsockname"), (204, "getpeername"),
    (206, "sendto"), (207, "recvfrom"), (208, "setsockopt"),
    (209, "getsockopt"), (210, "shutdown"), (211, "sendmsg"), (212, "recvmsg"),
    (214, "brk"), (215, "munmap"), (216, "mremap"), (220, "clone"),
    (221, "execve"), (222, "mmap"), (223, "fadvise64"), (226, "mprotect"),
    (233, "madvise"), (242, "accept4"), (243, "recvmmsg"), (260, "wait4"),
    (261, "prlimit64"), (269, "sendmmsg"), (276, "renameat2"),
    (278, "getrandom"), (279, "memfd_create"), (283, "membarrier"),
    (291, "statx"), (293, "rseq"), (435, "clone3"), (439, "faccessat2"),
];
