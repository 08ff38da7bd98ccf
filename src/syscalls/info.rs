//! System-information syscall handlers: uname, time, limits, randomness.

use rand::RngCore;

use crate::errors::Result;
use crate::memory;
use crate::process::ArionCpu;
use crate::structs;
use crate::syscalls::{val, SysRet};
use crate::CpuArch;

const UTS_FIELD_SZ: usize = 65;

fn uts_machine(arch: CpuArch) -> &'static str {
    match arch {
        CpuArch::X86 => "i686",
        CpuArch::X8664 => "x86_64",
        CpuArch::Arm => "armv7l",
        CpuArch::Arm64 => "aarch64",
        CpuArch::Ppc32 => "ppc",
    }
}

pub fn sys_newuname(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let machine = uts_machine(uc.get_data().abi.table.arch);
    let fields = [
        "Linux",
        "arion",
        "6.1.0",
        "#1 SMP PREEMPT_DYNAMIC",
        machine,
        "(none)",
    ];
    let mut buf = vec![0u8; UTS_FIELD_SZ * fields.len()];
    for (i, field) in fields.iter().enumerate() {
        let bytes = field.as_bytes();
        buf[i * UTS_FIELD_SZ..i * UTS_FIELD_SZ + bytes.len()].copy_from_slice(bytes);
    }
    memory::write(uc, args[0], &buf)?;
    val(0)
}

pub fn sys_sysinfo(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    structs::SYSINFO.feed(
        uc,
        args[0],
        &[
            ("uptime", 3600),
            ("totalram", 0x8000_0000),
            ("freeram", 0x4000_0000),
            ("procs", 16),
            ("mem_unit", 1),
        ],
    )?;
    val(0)
}

fn host_now() -> (u64, u64) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    (ts.tv_sec as u64, ts.tv_nsec as u64)
}

pub fn sys_gettimeofday(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    if args[0] != 0 {
        let (sec, nsec) = host_now();
        structs::TIMEVAL.feed(uc, args[0], &[("tv_sec", sec), ("tv_usec", nsec / 1000)])?;
    }
    val(0)
}

pub fn sys_time(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (sec, _) = host_now();
    if args[0] != 0 {
        memory::write_ptr(uc, args[0], sec)?;
    }
    val(sec)
}

pub fn sys_clock_gettime(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(args[0] as libc::clockid_t, &mut ts) };
    structs::TIMESPEC.feed(
        uc,
        args[1],
        &[("tv_sec", ts.tv_sec as u64), ("tv_nsec", ts.tv_nsec as u64)],
    )?;
    val(0)
}

/// Fixed 64-bit timespec regardless of the guest's pointer width.
pub fn sys_clock_gettime64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(args[0] as libc::clockid_t, &mut ts) };
    structs::TIMESPEC64.feed(
        uc,
        args[1],
        &[("tv_sec", ts.tv_sec as u64), ("tv_nsec", ts.tv_nsec as u64)],
    )?;
    val(0)
}

pub fn sys_clock_getres(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    if args[1] != 0 {
        structs::TIMESPEC.feed(uc, args[1], &[("tv_sec", 0), ("tv_nsec", 1)])?;
    }
    val(0)
}

pub fn sys_nanosleep(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    // Sleeping would stall the cooperative loop; report completion.
    val(0)
}

pub fn sys_getrandom(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let len = args[1] as usize;
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    memory::write(uc, args[0], &buf)?;
    val(len as u64)
}

fn rlim_infinity(uc: &ArionCpu) -> u64 {
    if uc.get_data().abi.table.arch_sz == 64 {
        u64::MAX
    } else {
        u32::MAX as u64
    }
}

pub fn sys_getrlimit(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    const RLIMIT_STACK: u64 = 3;
    const RLIMIT_NOFILE: u64 = 7;
    let infinity = rlim_infinity(uc);
    let (cur, max) = match args[0] {
        RLIMIT_STACK => (0x0080_0000, infinity),
        RLIMIT_NOFILE => (1024, 4096),
        _ => (infinity, infinity),
    };
    structs::RLIMIT.feed(uc, args[1], &[("rlim_cur", cur), ("rlim_max", max)])?;
    val(0)
}

pub fn sys_setrlimit(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_prlimit64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    const RLIMIT_STACK: u64 = 3;
    const RLIMIT_NOFILE: u64 = 7;
    if args[3] != 0 {
        let (cur, max) = match args[1] {
            RLIMIT_STACK => (0x0080_0000u64, u64::MAX),
            RLIMIT_NOFILE => (1024, 4096),
            _ => (u64::MAX, u64::MAX),
        };
        structs::RLIMIT64.feed(uc, args[3], &[("rlim_cur", cur), ("rlim_max", max)])?;
    }
    val(0)
}

pub fn sys_getrusage(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    memory::write(uc, args[1], &vec![0u8; 144])?;
    val(0)
}

pub fn sys_times(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    if args[0] != 0 {
        let ptr_sz = uc.get_data().abi.table.ptr_sz;
        memory::write(uc, args[0], &vec![0u8; 4 * ptr_sz])?;
    }
    val(0)
}

pub fn sys_getcpu(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    if args[0] != 0 {
        memory::write_val(uc, args[0], 0, 4)?;
    }
    if args[1] != 0 {
        memory::write_val(uc, args[1], 0, 4)?;
    }
    val(0)
}

pub fn sys_syslog(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_umask(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0o022)
}

pub fn sys_getpriority(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_ignore(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}
