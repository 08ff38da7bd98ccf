//! The emulated process: composes the backend CPU, the ABI, guest memory,
//! fd tables, hooks, threading, signals and the syscall layer, and drives
//! one scheduling quantum at a time for the owning group.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use libc::pid_t;
use unicorn_engine::Unicorn;

use crate::abi::gdt::{self, GdtState};
use crate::abi::Abi;
use crate::config::Config;
use crate::cpu::{self, StopReason};
use crate::errors::{ArionError, Result};
use crate::fs::FileTable;
use crate::group::ArionGroup;
use crate::hooks::HookTable;
use crate::loader::{self, LoaderParams};
use crate::memory::MemState;
use crate::signal::{self, SignalTable};
use crate::socket::SocketTable;
use crate::syscalls::{self, SyscallTable};
use crate::threads::{self, ThreadTable};
use crate::{logging, Addr, CpuArch, CYCLES_PER_THREAD};

/// The backend engine carrying the whole process state as its user data.
pub type ArionCpu = Unicorn<'static, Arion>;

pub type ProcessSharedPtr = Rc<RefCell<Process>>;
pub type ArionGroupSharedWeakPtr = Weak<RefCell<ArionGroup>>;

/// Raw-shellcode construction descriptor.
#[derive(Clone)]
pub struct Baremetal {
    pub arch: CpuArch,
    pub word_sz: u16,
    pub code: Vec<u8>,
    /// When set, the loader also stands up a data region and a stack.
    pub setup_memory: bool,
}

impl Baremetal {
    pub fn new(arch: CpuArch, code: Vec<u8>) -> Baremetal {
        Baremetal {
            arch,
            word_sz: if arch == CpuArch::X8664 || arch == CpuArch::Arm64 {
                64
            } else {
                32
            },
            code,
            setup_memory: true,
        }
    }
}

/// Cooperative run-loop state.
#[derive(Default)]
pub struct RunState {
    pub running: bool,
    /// Set by `sync_threads`: the current quantum should end at the next
    /// safe point and the scheduler re-selects a thread.
    pub sync: bool,
    pub stopped: bool,
    pub zombie: bool,
    pub stop_requested: bool,
    /// One-shot PC override queued by the group for the next quantum.
    pub start: Option<Addr>,
    /// Explicit run end address; cleared once reached.
    pub end: Option<Addr>,
    /// First error captured from a hook or syscall callback via `crash`.
    pub exception: Option<ArionError>,
    /// Status passed to exit/exit_group by the last thread.
    pub exit_code: Option<i32>,
}

/// Per-process state, owned by the backend engine's data slot.
pub struct Arion {
    pub pid: pid_t,
    pub pgid: pid_t,
    pub sid: pid_t,
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub parent: Option<pid_t>,
    pub children: Vec<pid_t>,
    pub program_args: Vec<String>,
    pub program_env: Vec<String>,
    pub config: Config,
    pub abi: Abi,
    pub mem: MemState,
    pub fs: FileTable,
    pub sock: SocketTable,
    pub hooks: HookTable,
    pub threads: ThreadTable,
    pub signals: SignalTable,
    pub syscalls: SyscallTable,
    pub gdt: Option<GdtState>,
    pub run: RunState,
    pub group: ArionGroupSharedWeakPtr,
    pub baremetal: Option<Baremetal>,
    pub loader_params: Option<LoaderParams>,
}

impl Arion {
    fn new(
        arch: CpuArch,
        program_args: Vec<String>,
        program_env: Vec<String>,
        fs_root: &str,
        cwd: &str,
        config: Config,
    ) -> Result<Arion> {
        Ok(Arion {
            pid: 0,
            pgid: 0,
            sid: unsafe { libc::getsid(0) },
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            euid: nix::unistd::geteuid().as_raw(),
            egid: nix::unistd::getegid().as_raw(),
            parent: None,
            children: Vec::new(),
            program_args,
            program_env,
            config,
            abi: Abi::init(arch)?,
            mem: MemState::default(),
            fs: FileTable::new(fs_root, cwd)?,
            sock: SocketTable::default(),
            hooks: HookTable::default(),
            threads: ThreadTable::default(),
            signals: SignalTable::default(),
            syscalls: SyscallTable::default(),
            gdt: None,
            run: RunState::default(),
            group: Weak::new(),
            baremetal: None,
            loader_params: None,
        })
    }

    pub fn has_child(&self, child_pid: pid_t) -> bool {
        self.children.contains(&child_pid)
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Arion {
        Arion::new(
            CpuArch::X8664,
            vec!["/bin/true".to_string()],
            Vec::new(),
            "/",
            "",
            Config::default(),
        )
        .expect("test state")
    }
}

/// One emulated process. The backend engine is the only field; every piece
/// of guest state lives in its data slot so hook trampolines can reach it.
pub struct Process {
    pub uc: ArionCpu,
}

impl Process {
    pub fn state(&self) -> &Arion {
        self.uc.get_data()
    }

    pub fn state_mut(&mut self) -> &mut Arion {
        self.uc.get_data_mut()
    }

    pub fn pid(&self) -> pid_t {
        self.state().pid
    }

    fn common_init(state: Arion) -> Result<Process> {
        let arch = state.abi.table.arch;
        let uc = cpu::open(arch, state)?;
        let mut process = Process { uc };

        let ops = process.uc.get_data().abi.ops.clone();
        ops.setup(&mut process.uc)?;
        if arch == CpuArch::X86 {
            gdt::setup(&mut process.uc)?;
        }
        signal::install_fault_hooks(&mut process.uc)?;
        let table = syscalls::init_table(&process.uc.get_data().abi);
        process.uc.get_data_mut().syscalls = table;
        Ok(process)
    }

    /// Builds a process around an executable image. `program_args[0]` must
    /// name an existing file inside `fs_root`; the loader picks the ELF
    /// flavour from the image itself.
    pub fn new_instance(
        program_args: Vec<String>,
        fs_root: &str,
        program_env: Vec<String>,
        cwd: &str,
        config: Config,
    ) -> Result<ProcessSharedPtr> {
        logging::init(&config);
        if program_args.is_empty() {
            return Err(ArionError::InvalidArgument(
                "program arguments must at least contain the target name".to_string(),
            ));
        }

        let file_table = FileTable::new(fs_root, cwd)?;
        let program_path = loader::resolve_program_path(&file_table, &program_args[0]);
        if program_path.is_empty() {
            return Err(ArionError::FileNotInFs(
                file_table.fs_path().to_string(),
                program_args[0].clone(),
            ));
        }
        if !std::path::Path::new(&program_path).exists() {
            return Err(ArionError::FileNotFound(program_path));
        }

        let arch = loader::elf::sniff_arch(&program_path)?;
        let state = Arion::new(arch, program_args, program_env, fs_root, cwd, config)?;
        let mut process = Process::common_init(state)?;
        info!("initializing emulated process for image \"{}\"", program_path);

        let params = loader::elf::load(&mut process.uc, &program_path)?;
        process.uc.get_data_mut().loader_params = Some(params);
        Ok(Rc::new(RefCell::new(process)))
    }

    /// Builds a process around raw shellcode.
    pub fn new_baremetal_instance(
        baremetal: Baremetal,
        fs_root: &str,
        program_env: Vec<String>,
        cwd: &str,
        config: Config,
    ) -> Result<ProcessSharedPtr> {
        logging::init(&config);
        let arch = baremetal.arch;
        let state = Arion::new(
            arch,
            Vec::new(),
            program_env,
            fs_root,
            cwd,
            config,
        )?;
        let mut process = Process::common_init(state)?;
        info!("initializing emulated process in baremetal mode");

        process.uc.get_data_mut().baremetal = Some(baremetal.clone());
        let params = loader::baremetal::load(&mut process.uc, &baremetal)?;
        process.uc.get_data_mut().loader_params = Some(params);
        Ok(Rc::new(RefCell::new(process)))
    }

    /// Runs one scheduling quantum. Returns false when the process has no
    /// more work (last thread gone or the end address was reached).
    pub fn run_current(&mut self, multi_process: bool) -> Result<bool> {
        let uc = &mut self.uc;
        let threads_count = uc.get_data().threads.count();
        if threads_count == 0 {
            return Ok(false);
        }
        let multi_thread = threads_count > 1;

        if threads::is_curr_locked(uc) {
            threads::switch_to_next_thread(uc)?;
            return Ok(true);
        }

        let pc_reg = uc.get_data().abi.table.pc;
        let mut pc_addr = match uc.get_data().run.start {
            Some(start) => {
                crate::abi::write_arch_reg(uc, pc_reg, start)?;
                start
            }
            None => crate::abi::read_arch_reg(uc, pc_reg)?,
        };

        let end = uc.get_data().run.end;
        if end.is_none() {
            cpu::use_exits(uc, true)?;
        }

        let ops = uc.get_data().abi.ops.clone();
        ops.prerun_hook(uc, &mut pc_addr)?;

        let cycles = if multi_process || multi_thread {
            CYCLES_PER_THREAD
        } else {
            0
        };

        uc.get_data_mut().run.running = true;
        let stop_reason = cpu::run(uc, pc_addr, end, cycles, pc_reg)?;
        uc.get_data_mut().run.running = false;

        if let Some(err) = uc.get_data_mut().run.exception.take() {
            return Err(err);
        }
        if let StopReason::Fault(e) = stop_reason {
            if !uc.get_data().run.sync {
                return Err(ArionError::CpuRun(e));
            }
        }

        let pc_now = crate::abi::read_arch_reg(uc, pc_reg)?;
        if end == Some(pc_now) {
            uc.get_data_mut().run.end = None;
            return Ok(false);
        }

        if uc.get_data().threads.count() == 0 {
            return Ok(false);
        }
        threads::switch_to_next_thread(uc)?;
        if uc.get_data().run.sync {
            uc.get_data_mut().run.sync = false;
        }
        Ok(true)
    }

    pub fn set_run_bounds(&mut self, start: Option<Addr>, end: Option<Addr>) {
        let run = &mut self.state_mut().run;
        run.start = start;
        run.end = end;
    }

    pub fn is_running(&self) -> bool {
        self.state().run.running
    }
}

/// Cooperatively halts the backend's current `run`.
pub fn stop(uc: &mut ArionCpu) -> Result<()> {
    cpu::stop(uc)
}

/// Requests a reschedule: the backend leaves `run` at the next safe point
/// and the scheduler re-selects a thread.
pub fn sync_threads(uc: &mut ArionCpu) -> Result<()> {
    uc.get_data_mut().run.sync = true;
    cpu::stop(uc)
}

/// Stores the first callback error on the process and halts `run`; the
/// run loop re-raises it after the backend returns.
pub fn crash(uc: &mut ArionCpu, err: ArionError) {
    let run = &mut uc.get_data_mut().run;
    if run.exception.is_none() {
        run.exception = Some(err);
    }
    let _ = cpu::stop(uc);
}

/// Delivers a signal to this process.
pub fn send_signal(uc: &mut ArionCpu, source_pid: pid_t, signo: i32) -> Result<()> {
    signal::handle_signal(uc, source_pid, signo)
}
