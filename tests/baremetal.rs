//! End-to-end shellcode scenarios driving the real backend.

use std::os::unix::io::RawFd;

use arion::{ArionGroup, Baremetal, Config, CpuArch, Process};

// write(1, "Hello World!\n", 14); exit(0)
#[rustfmt::skip]
const HELLO_X8664: &[u8] = &[
    0x48, 0x83, 0xEC, 0x10, 0xC7, 0x04, 0x24, 0x00, 0x00, 0x00, 0x48,
    0xC7, 0x44, 0x24, 0x04, 0x65, 0x6C, 0x6C, 0x6F, 0xC7, 0x44, 0x24,
    0x08, 0x20, 0x57, 0x6F, 0x72, 0xC7, 0x44, 0x24, 0x0C, 0x6C, 0x64,
    0x21, 0x0A, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xBF, 0x01, 0x00, 0x00,
    0x00, 0x48, 0x89, 0xE6, 0x48, 0x83, 0xC6, 0x03, 0xBA, 0x0E, 0x00,
    0x00, 0x00, 0x0F, 0x05, 0xB8, 0x3C, 0x00, 0x00, 0x00, 0x48, 0x31,
    0xFF, 0x0F, 0x05,
];

// exit(42)
#[rustfmt::skip]
const EXIT42_X8664: &[u8] = &[
    0xB8, 0x3C, 0x00, 0x00, 0x00, 0xBF, 0x2A, 0x00, 0x00, 0x00, 0x0F, 0x05,
];

// Same hello world for 32-bit ARM: write(1, ..., 14) via svc, then exit.
#[rustfmt::skip]
const HELLO_ARM: &[u8] = &[
    0x10, 0xD0, 0x4D, 0xE2, 0x0D, 0x00, 0xA0, 0xE1, 0x3C, 0x10, 0x9F, 0xE5,
    0x0C, 0x10, 0x80, 0xE5, 0x38, 0x10, 0x9F, 0xE5, 0x08, 0x10, 0x80, 0xE5,
    0x34, 0x10, 0x9F, 0xE5, 0x04, 0x10, 0x80, 0xE5, 0x12, 0x13, 0xA0, 0xE3,
    0x00, 0x10, 0x80, 0xE5, 0x00, 0x10, 0xA0, 0xE1, 0x03, 0x10, 0x81, 0xE2,
    0x0E, 0x20, 0xA0, 0xE3, 0x04, 0x70, 0xA0, 0xE3, 0x01, 0x00, 0xA0, 0xE3,
    0x00, 0x00, 0x00, 0xEF, 0x00, 0x00, 0xA0, 0xE3, 0x01, 0x70, 0xA0, 0xE3,
    0x00, 0x00, 0x00, 0xEF, 0x6C, 0x64, 0x21, 0x0A, 0x20, 0x57, 0x6F, 0x72,
    0x65, 0x6C, 0x6C, 0x6F,
];

/// Redirects the guest's stdout to a fresh pipe and returns the read end.
fn redirect_stdout(process: &arion::ProcessSharedPtr) -> RawFd {
    let (read_fd, write_fd) = nix::unistd::pipe().expect("pipe");
    process
        .borrow_mut()
        .state_mut()
        .fs
        .file_entry_mut(1)
        .expect("stdout entry")
        .host_fd = write_fd;
    read_fd
}

fn drain(read_fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match nix::unistd::read(read_fd, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

#[test]
fn x86_64_hello_world_shellcode() {
    let process = Process::new_baremetal_instance(
        Baremetal::new(CpuArch::X8664, HELLO_X8664.to_vec()),
        "/",
        Vec::new(),
        "",
        Config::default(),
    )
    .expect("baremetal construction");

    let read_fd = redirect_stdout(&process);

    let group = ArionGroup::new();
    group.borrow_mut().add_instance(process.clone(), None, None);
    ArionGroup::run(&group).expect("group run");

    // The guest wrote through a host pipe; close the write end so the
    // drain terminates.
    let write_fd = process.borrow().state().fs.file_entry(1).unwrap().host_fd;
    let _ = nix::unistd::close(write_fd);
    let out = drain(read_fd);
    let _ = nix::unistd::close(read_fd);

    assert_eq!(&out[..13], b"Hello World!\n");
    assert_eq!(process.borrow().state().run.exit_code, Some(0));
    // The terminated, parentless process left the group.
    assert_eq!(group.borrow().count(), 0);
}

#[test]
fn arm_hello_world_shellcode() {
    let process = Process::new_baremetal_instance(
        Baremetal::new(CpuArch::Arm, HELLO_ARM.to_vec()),
        "/",
        Vec::new(),
        "",
        Config::default(),
    )
    .expect("baremetal construction");

    let read_fd = redirect_stdout(&process);

    let group = ArionGroup::new();
    group.borrow_mut().add_instance(process.clone(), None, None);
    ArionGroup::run(&group).expect("group run");

    let write_fd = process.borrow().state().fs.file_entry(1).unwrap().host_fd;
    let _ = nix::unistd::close(write_fd);
    let out = drain(read_fd);
    let _ = nix::unistd::close(read_fd);

    assert_eq!(&out[..13], b"Hello World!\n");
    assert_eq!(process.borrow().state().run.exit_code, Some(0));
}

#[test]
fn exit_code_is_reported() {
    let process = Process::new_baremetal_instance(
        Baremetal::new(CpuArch::X8664, EXIT42_X8664.to_vec()),
        "/",
        Vec::new(),
        "",
        Config::default(),
    )
    .expect("baremetal construction");

    let group = ArionGroup::new();
    group.borrow_mut().add_instance(process.clone(), None, None);
    ArionGroup::run(&group).expect("group run");

    assert_eq!(process.borrow().state().run.exit_code, Some(42));
    assert_eq!(process.borrow().state().threads.count(), 0);
}

#[test]
fn pids_are_issued_monotonically() {
    let a = Process::new_baremetal_instance(
        Baremetal::new(CpuArch::X8664, EXIT42_X8664.to_vec()),
        "/",
        Vec::new(),
        "",
        Config::default(),
    )
    .unwrap();
    let b = Process::new_baremetal_instance(
        Baremetal::new(CpuArch::X8664, EXIT42_X8664.to_vec()),
        "/",
        Vec::new(),
        "",
        Config::default(),
    )
    .unwrap();

    let group = ArionGroup::new();
    group.borrow_mut().add_instance(a.clone(), None, None);
    group.borrow_mut().add_instance(b.clone(), None, None);
    assert_eq!(a.borrow().pid(), 1);
    assert_eq!(b.borrow().pid(), 2);
    // Processes lead their own process groups by default.
    assert_eq!(a.borrow().state().pgid, 1);
    assert_eq!(b.borrow().state().pgid, 2);
}
