//! Error taxonomy for the emulation runtime.
//!
//! Every fallible path returns [`ArionError`]. Errors raised inside hook or
//! syscall callbacks are captured on the owning process through
//! `process::crash` and re-raised once the backend leaves `run`.

use libc::pid_t;
use thiserror::Error;

use crate::Addr;

pub type Result<T> = std::result::Result<T, ArionError>;

#[derive(Error, Debug)]
pub enum ArionError {
    // Input / construction
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file \"{1}\" is not inside root filesystem \"{0}\"")]
    FileNotInFs(String, String),
    #[error("file too small: {0}")]
    FileTooSmall(String),
    #[error("unsupported CPU architecture: {0}")]
    UnsupportedCpuArch(String),
    #[error("unsupported host CPU architecture")]
    UnsupportedHostCpuArch,
    #[error("unknown linkage type for {0}")]
    UnknownLinkageType(String),
    #[error("interpreter \"{0}\" must be statically linked")]
    BadLinkageType(String),

    // State
    #[error("expired weak reference to {0}")]
    ExpiredWeakPtr(&'static str),
    #[error("no thread with tid {0}")]
    WrongThreadId(pid_t),
    #[error("no hook with id {0}")]
    WrongHookId(u64),
    #[error("no struct field named {0}")]
    WrongStructField(String),
    #[error("path too long: {0}")]
    PathTooLong(String),
    #[error("too many threads")]
    TooManyThreads,
    #[error("too many hooks")]
    TooManyHooks,

    // Registers
    #[error("no register with id {0}")]
    NoRegWithId(i32),
    #[error("no register named {0}")]
    NoRegWithName(String),
    #[error("register is {0} bytes wide but destination holds only {1}")]
    HeavierReg(u8, usize),
    #[error("no IDT entry for interrupt {0:#x}")]
    NoIdtEntry(u64),
    #[error("no signal mapped for this CPU interrupt")]
    NoSignalForIntr,

    // Memory
    #[error("no mapping at address {0:#x}")]
    NoMappingAtAddr(Addr),
    #[error("no mapping with info \"{0}\"")]
    NoMappingWithInfo(String),
    #[error("mapping [{0:#x}, {1:#x}) is not present")]
    MappingNotPresent(Addr, Addr),
    #[error("range [{0:#x}, +{1:#x}) overlaps an existing mapping")]
    AlreadyMapped(Addr, u64),
    #[error("cannot unmap [{2:#x}, {3:#x}) outside mapping [{0:#x}, {1:#x})")]
    UnmapOutsideMapping(Addr, Addr, Addr, Addr),
    #[error("memory recorder already started")]
    RecorderAlreadyStarted,
    #[error("memory recorder already stopped")]
    RecorderAlreadyStopped,

    // Emulator backend
    #[error("backend open failed: {0:?}")]
    CpuOpen(unicorn_engine::unicorn_const::uc_error),
    #[error("backend ctl failed: {0:?}")]
    CpuCtl(unicorn_engine::unicorn_const::uc_error),
    #[error("backend map failed at {1:#x}: {0:?}")]
    CpuMap(unicorn_engine::unicorn_const::uc_error, Addr),
    #[error("backend unmap failed at {1:#x}: {0:?}")]
    CpuUnmap(unicorn_engine::unicorn_const::uc_error, Addr),
    #[error("backend protect failed at {1:#x}: {0:?}")]
    CpuProtect(unicorn_engine::unicorn_const::uc_error, Addr),
    #[error("backend read failed at {1:#x}: {0:?}")]
    CpuMemRead(unicorn_engine::unicorn_const::uc_error, Addr),
    #[error("backend write failed at {1:#x}: {0:?}")]
    CpuMemWrite(unicorn_engine::unicorn_const::uc_error, Addr),
    #[error("backend region listing failed: {0:?}")]
    CpuMemRegions(unicorn_engine::unicorn_const::uc_error),
    #[error("backend register read failed for {1}: {0:?}")]
    CpuRegRead(unicorn_engine::unicorn_const::uc_error, i32),
    #[error("backend register write failed for {1}: {0:?}")]
    CpuRegWrite(unicorn_engine::unicorn_const::uc_error, i32),
    #[error("backend hook install failed: {0:?}")]
    CpuHookAdd(unicorn_engine::unicorn_const::uc_error),
    #[error("backend hook removal failed: {0:?}")]
    CpuHookDel(unicorn_engine::unicorn_const::uc_error),
    #[error("backend run failed: {0:?}")]
    CpuRun(unicorn_engine::unicorn_const::uc_error),
    #[error("backend stop failed: {0:?}")]
    CpuStop(unicorn_engine::unicorn_const::uc_error),
    #[error("disassembler error: {0}")]
    Disasm(String),

    // Syscalls / signals
    #[error("invalid syscall number {0:#x}")]
    InvalidSyscallNo(u64),
    #[error("no syscall named {0}")]
    InvalidSyscallName(String),
    #[error("thread {1} of process {0} is already waiting for a signal")]
    ThreadAlreadySigWaiting(pid_t, pid_t),
    #[error("process {0} cannot wait on itself")]
    WaitSameProcess(pid_t),
    #[error("process {0} has no child with pid {1}")]
    NoChildWithPid(pid_t, pid_t),
    #[error("no process with pid {0}")]
    NoProcessWithPid(pid_t),
    #[error("unknown signal {2} for process {0} thread {1}")]
    UnknownSignal(pid_t, pid_t, i32),
    #[error("unhandled synchronous signal on process {0} thread {1}: {2}")]
    UnhandledSyncSignal(pid_t, pid_t, String),

    // Context files
    #[error("wrong context file magic in {0}")]
    WrongContextFileMagic(String),
    #[error("context file {0} has a newer version than this runtime")]
    NewerContextFileVersion(String),
    #[error("context file {0} is truncated")]
    TruncatedContextFile(String),
    #[error("could not open {0}: {1}")]
    FileOpen(String, std::io::Error),

    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed ELF image: {0}")]
    Elf(String),
}

impl From<goblin::error::Error> for ArionError {
    fn from(e: goblin::error::Error) -> ArionError {
        ArionError::Elf(e.to_string())
    }
}
