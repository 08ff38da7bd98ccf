//! User-mode multi-architecture Linux emulation runtime.
//!
//! An emulated process ([`Process`]) couples a CPU emulator backend with a
//! guest address-space manager, a cooperative threading layer, a hook
//! dispatcher, snapshot/restore and a per-syscall Linux emulation layer.
//! Processes are grouped in an [`ArionGroup`] which owns scheduling and pid
//! issuance.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod abi;
pub mod config;
pub mod context;
pub mod cpu;
pub mod errors;
pub mod flags;
pub mod fs;
pub mod group;
pub mod hooks;
pub mod kernel;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod process;
pub mod signal;
pub mod socket;
pub mod structs;
pub mod syscalls;
pub mod threads;

pub use crate::config::Config;
pub use crate::errors::{ArionError, Result};
pub use crate::group::{ArionGroup, ArionGroupSharedPtr};
pub use crate::process::{Arion, ArionCpu, Baremetal, Process, ProcessSharedPtr};

/// A guest virtual address.
pub type Addr = u64;
/// A backend register identifier (the emulator's raw register enum value).
pub type RegId = i32;
/// A process-local hook identifier.
pub type HookId = u64;

/// Guest page size. All mapping bounds are aligned to this.
pub const PAGE_SZ: u64 = 0x1000;
/// Cycle budget handed to the backend per thread quantum when more than one
/// process or guest thread is runnable.
pub const CYCLES_PER_THREAD: usize = 0x2000;
/// Scratch buffer size for chunked guest-memory scans.
pub const BUF_SZ: usize = 0x400;

/// Supported guest CPU architectures.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CpuArch {
    X86,
    X8664,
    Arm,
    Arm64,
    Ppc32,
}

impl CpuArch {
    pub fn name(self) -> &'static str {
        match self {
            CpuArch::X86 => "x86",
            CpuArch::X8664 => "x86-64",
            CpuArch::Arm => "arm",
            CpuArch::Arm64 => "arm64",
            CpuArch::Ppc32 => "ppc32",
        }
    }

    /// Whether guest multi-byte values are stored big-endian.
    pub fn big_endian(self) -> bool {
        matches!(self, CpuArch::Ppc32)
    }
}

impl std::str::FromStr for CpuArch {
    type Err = ArionError;

    fn from_str(s: &str) -> Result<CpuArch> {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "i386" => Ok(CpuArch::X86),
            "x86-64" | "x86_64" | "x64" | "amd64" => Ok(CpuArch::X8664),
            "arm" => Ok(CpuArch::Arm),
            "arm64" | "aarch64" => Ok(CpuArch::Arm64),
            "ppc32" | "ppc" | "powerpc" => Ok(CpuArch::Ppc32),
            other => Err(ArionError::UnsupportedCpuArch(other.to_string())),
        }
    }
}
