//! Command-line surface of the `arion` binary.

use structopt::StructOpt;

use crate::CpuArch;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "arion",
    about = "Run an unmodified Linux binary or raw shellcode under emulation"
)]
pub struct Flags {
    /// Root filesystem the guest is sandboxed into.
    #[structopt(long = "rootfs", default_value = "/")]
    pub rootfs: String,

    /// Guest working directory (inside the rootfs).
    #[structopt(long = "cwd", default_value = "")]
    pub cwd: String,

    /// Environment variables handed to the guest (KEY=VALUE, repeatable).
    #[structopt(long = "env", number_of_values = 1)]
    pub env: Vec<String>,

    /// Log level: off, error, warn, info, debug or trace.
    #[structopt(long = "log-level", default_value = "info")]
    pub log_level: log::LevelFilter,

    /// Let I/O handlers block on the host instead of yielding the quantum.
    #[structopt(long = "blocking-io")]
    pub blocking_io: bool,

    /// Treat the program argument as a raw shellcode file.
    #[structopt(long = "raw")]
    pub raw: bool,

    /// Guest CPU architecture for raw shellcode (x86, x86-64, arm, arm64,
    /// ppc32). Ignored for ELF images, which carry their own.
    #[structopt(long = "arch", default_value = "x86-64")]
    pub arch: CpuArch,

    /// Dump the final mapping table after the run.
    #[structopt(long = "maps")]
    pub maps: bool,

    /// Program to emulate followed by its arguments.
    #[structopt(required = true)]
    pub program_args: Vec<String>,
}
