//! x86-64 ABI tables and operations.

use std::collections::HashMap;
use std::rc::Rc;

use capstone::Capstone;
use unicorn_engine::RegisterX86 as R;

use crate::abi::{AbiOps, AbiTable, CpuIntr};
use crate::errors::Result;
use crate::hooks;
use crate::kernel::{SEG_VDSO, SEG_VSYSCALL, SEG_VVAR, VSYSCALL_ENTRY_SZ};
use crate::process::ArionCpu;
use crate::syscalls;
use crate::{cpu, Addr, CpuArch, RegId};

lazy_static! {
    static ref ARCH_REGS: HashMap<&'static str, RegId> = {
        let mut m = HashMap::new();
        m.insert("RAX", R::RAX as i32);
        m.insert("RBX", R::RBX as i32);
        m.insert("RCX", R::RCX as i32);
        m.insert("RDX", R::RDX as i32);
        m.insert("RSI", R::RSI as i32);
        m.insert("RDI", R::RDI as i32);
        m.insert("RBP", R::RBP as i32);
        m.insert("RSP", R::RSP as i32);
        m.insert("RIP", R::RIP as i32);
        m.insert("R8", R::R8 as i32);
        m.insert("R9", R::R9 as i32);
        m.insert("R10", R::R10 as i32);
        m.insert("R11", R::R11 as i32);
        m.insert("R12", R::R12 as i32);
        m.insert("R13", R::R13 as i32);
        m.insert("R14", R::R14 as i32);
        m.insert("R15", R::R15 as i32);
        m.insert("EFLAGS", R::EFLAGS as i32);
        m.insert("CS", R::CS as i32);
        m.insert("DS", R::DS as i32);
        m.insert("ES", R::ES as i32);
        m.insert("FS", R::FS as i32);
        m.insert("GS", R::GS as i32);
        m.insert("SS", R::SS as i32);
        m.insert("FS_BASE", R::FS_BASE as i32);
        m.insert("GS_BASE", R::GS_BASE as i32);
        m
    };
    static ref ARCH_REGS_SZ: HashMap<RegId, u8> = {
        let mut m = HashMap::new();
        for reg in [
            R::RAX,
            R::RBX,
            R::RCX,
            R::RDX,
            R::RSI,
            R::RDI,
            R::RBP,
            R::RSP,
            R::RIP,
            R::R8,
            R::R9,
            R::R10,
            R::R11,
            R::R12,
            R::R13,
            R::R14,
            R::R15,
            R::EFLAGS,
            R::FS_BASE,
            R::GS_BASE,
        ]
        .iter()
        {
            m.insert(*reg as i32, 8);
        }
        for reg in [R::CS, R::DS, R::ES, R::FS, R::GS, R::SS].iter() {
            m.insert(*reg as i32, 2);
        }
        m
    };
    static ref CTXT_REGS: Vec<RegId> = vec![
        R::RAX as i32,
        R::RBX as i32,
        R::RCX as i32,
        R::RDX as i32,
        R::RSI as i32,
        R::RDI as i32,
        R::RBP as i32,
        R::RSP as i32,
        R::RIP as i32,
        R::R8 as i32,
        R::R9 as i32,
        R::R10 as i32,
        R::R11 as i32,
        R::R12 as i32,
        R::R13 as i32,
        R::R14 as i32,
        R::R15 as i32,
        R::EFLAGS as i32,
        R::FS_BASE as i32,
        R::GS_BASE as i32,
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
        R::RDI as i32,
        R::RSI as i32,
        R::RDX as i32,
        R::R10 as i32,
        R::R8 as i32,
        R::R9 as i32,
    ];
    static ref CALL_PARAM_REGS: Vec<RegId> = vec![
        R::RDI as i32,
        R::RSI as i32,
        R::RDX as i32,
        R::RCX as i32,
        R::R8 as i32,
        R::R9 as i32,
    ];
    pub static ref TABLE: AbiTable = AbiTable {
        arch: CpuArch::X8664,
        arch_sz: 64,
        ptr_sz: 8,
        hwcap: 0x0078_BFBF,
        hwcap2: 0x2,
        seg_flags: SEG_VVAR | SEG_VDSO | SEG_VSYSCALL,
        pc: R::RIP as i32,
        sp: R::RSP as i32,
        tls: Some(R::FS_BASE as i32),
        call_ret: R::RAX as i32,
        call_params: CALL_PARAM_REGS.as_slice(),
        sysno: R::RAX as i32,
        sys_ret: R::RAX as i32,
        sys_params: SYS_PARAM_REGS.as_slice(),
        hooks_intr: false,
        regs_by_name: &*ARCH_REGS,
        reg_sizes: &*ARCH_REGS_SZ,
        ctxt_regs: CTXT_REGS.as_slice(),
        idt: &*IDT,
        syscall_names: &*SYSCALL_NAMES,
    };
}

/// Intel protected-mode exception vectors, shared with 32-bit x86.
pub fn x86_idt() -> HashMap<u64, CpuIntr> {
    let mut m = HashMap::new();
    m.insert(0, CpuIntr::DivideError);
    m.insert(1, CpuIntr::DebugException);
    m.insert(2, CpuIntr::NonMaskableIntr);
    m.insert(3, CpuIntr::Breakpoint);
    m.insert(4, CpuIntr::Overflow);
    m.insert(5, CpuIntr::BoundRangeExceeded);
    m.insert(6, CpuIntr::InvalidOpcode);
    m.insert(7, CpuIntr::DeviceNotAvailable);
    m.insert(8, CpuIntr::DoubleFault);
    m.insert(9, CpuIntr::CoprocessorSegmentOverrun);
    m.insert(10, CpuIntr::InvalidTss);
    m.insert(11, CpuIntr::SegmentNotPresent);
    m.insert(12, CpuIntr::StackSegmentFault);
    m.insert(13, CpuIntr::GeneralProtectionFault);
    m.insert(14, CpuIntr::PageFault);
    m.insert(15, CpuIntr::Reserved);
    m.insert(16, CpuIntr::X87FloatingPoint);
    m.insert(17, CpuIntr::AlignmentCheck);
    m.insert(18, CpuIntr::MachineCheck);
    m.insert(19, CpuIntr::SimdFloatingPoint);
    m
}

pub struct X8664Ops;

impl AbiOps for X8664Ops {
    fn setup(&self, uc: &mut ArionCpu) -> Result<()> {
        hooks::hook_insn_sys(
            uc,
            unicorn_engine::unicorn_const::InsnSysX86::SYSCALL,
            Rc::new(|uc| syscalls::dispatch(uc)),
        )?;
        hooks::hook_insn_sys(
            uc,
            unicorn_engine::unicorn_const::InsnSysX86::SYSENTER,
            Rc::new(|uc| syscalls::dispatch(uc)),
        )?;
        Ok(())
    }

    fn dump_tls(&self, uc: &mut ArionCpu) -> Result<Addr> {
        cpu::reg_read(uc, R::FS_BASE as i32)
    }

    fn load_tls(&self, uc: &mut ArionCpu, tls: Addr) -> Result<()> {
        cpu::reg_write(uc, R::FS_BASE as i32, tls)
    }

    fn curr_cs(&self, _uc: &ArionCpu) -> Result<Capstone> {
        cpu::disassembler(CpuArch::X8664, false)
    }

    fn vsyscall_entry(&self, sysno: u64) -> Vec<u8> {
        // mov rax, imm32 ; syscall ; ret
        let mut code = vec![0x48, 0xC7, 0xC0];
        code.extend_from_slice(&(sysno as u32).to_le_bytes());
        code.extend_from_slice(&[0x0F, 0x05, 0xC3]);
        code.resize(VSYSCALL_ENTRY_SZ, 0xCC);
        code
    }

    fn sys_insn_sz(&self, _uc: &ArionCpu) -> u64 {
        2
    }
}

#[rustfmt::skip]
const SYSCALLS: &[(u64, &str)] = &[
    (0, "read"), (1, "write"), (2, "open"), (3, "close"), (4, "newstat"),
    (5, "newfstat"), (6, "newlstat"), (7, "poll"), (8, "lseek"), (9, "mmap"),
    (10, "mprotect"), (11, "munmap"), (12, "brk"), (13, "rt_sigaction"),
    (14, "rt_sigprocmask"), (15, "rt_sigreturn"), (16, "ioctl"),
    (17, "pread64"), (18, "pwrite64"), (19, "readv"), (20, "writev"),
    (21, "access"), (22, "pipe"), (23, "select"), (24, "sched_yield"),
    (25, "mremap"), (26, "msync"), (27, "mincore"), (28, "madvise"),
    (32, "dup"), (33, "dup2"), (34, "pause"), (35, "nanosleep"),
    (37, "alarm"), (39, "getpid"), (41, "socket"), (42, "connect"),
    (43, "accept"), (44, "sendto"), (45, "recvfrom"), (46, "sendmsg"),
    (47, "recvmsg"), (48, "shutdown"), (49, "bind"), (50, "listen"),
    (51, "getsockname"), (52, "getpeername"), (53, "socketpair"),
    (54, "setsockopt"), (55, "getsockopt"), (56, "clone"), (57, "fork"),
    (58, "vfork"), (59, "execve"), (60, "exit"), (61, "wait4"), (62, "kill"),
    (63, "newuname"), (72, "fcntl"), (73, "flock"), (74, "fsync"),
    (75, "fdatasync"), (76, "truncate"), (77, "ftruncate"), (78, "getdents"),
    (79, "getcwd"), (80, "chdir"), (81, "fchdir"), (82, "rename"),
    (83, "mkdir"), (84, "rmdir"), (85, "creat"), (86, "link"), (87, "unlink"),
    (88, "symlink"), (89, "readlink"), (90, "chmod"), (91, "fchmod"),
    (92, "chown"), (93, "fchown"), (95, "umask"), (96, "gettimeofday"),
    (97, "getrlimit"), (98, "getrusage"), (99, "sysinfo"), (100, "times"),
    (102, "getuid"), (103, "syslog"), (104, "getgid"), (105, "setuid"),
    (106, "setgid"), (107, "geteuid"), (108, "getegid"), (109, "setpgid"),
    (110, "getppid"), (111, "getpgrp"), (112, "setsid"), (113, "setreuid"),
    (114, "setregid"), (115, "getgroups"), (116, "setgroups"),
    (117, "setresuid"), (118, "getresuid"), (119, "setresgid"),
    (120, "getresgid"), (121, "getpgid"), (122, "setfsuid"), (123, "setfsgid"),
    (124, "getsid"), (125, "capget"), (126, "capset"), (127, "rt_sigpending"),
    (128, "rt_sigtimedwait"), (130, "rt_sigsuspend"), (131, "sigaltstack"),
    (137, "statfs"), (138, "fstatfs"), (141, "sched_setscheduler"),
    (145, "sched_getscheduler"), (146, "sched_get_priority_max"),
    (147, "sched_get_priority_min"), (148, "sched_rr_get_interval"),
    (149, "mlock"), (150, "munlock"), (157, "prctl"), (158, "arch_prctl"),
    (160, "setrlimit"), (161, "chroot"), (162, "sync"), (186, "gettid"),
    (187, "readahead"), (191, "getxattr"), (192, "lgetxattr"),
    (200, "tkill"), (201, "time"), (202, "futex"), (203, "sched_setaffinity"),
    (204, "sched_getaffinity"), (213, "epoll_create"), (217, "getdents64"),
    (218, "set_tid_address"), (219, "restart_syscall"), (221, "fadvise64"),
    (228, "clock_gettime"), (229, "clock_getres"), (230, "clock_nanosleep"),
    (231, "exit_group"), (232, "epoll_wait"), (233, "epoll_ctl"),
    (234, "tgkill"), (257, "openat"), (258, "mkdirat"), (262, "newfstatat"),
    (263, "unlinkat"), (264, "renameat"), (265, "linkat"), (266, "symlinkat"),
    (267, "readlinkat"), (268, "fchmodat"), (269, "faccessat"),
    (270, "pselect6"), (271, "ppoll"), (272, "unshare"),
    (273, "set_robust_list"), (274, "get_robust_list"), (280, "utimensat"),
    (284, "eventfd"), (288, "accept4"), (290, "eventfd2"),
    (291, "epoll_create1"), (292, "dup3"), (293, "pipe2"), (295, "preadv"),
    (296, "pwritev"), (299, "recvmmsg"), (302, "prlimit64"),
    (307, "sendmmsg"), (309, "getcpu"), (316, "renameat2"), (318, "getrandom"),
    (319, "memfd_create"), (324, "membarrier"), (332, "statx"), (334, "rseq"),
    (424, "pidfd_send_signal"), (435, "clone3"), (436, "close_range"),
    (439, "faccessat2"), (452, "fchmodat2"),
];
