//! Snapshot/restore identity checks against the real backend.

use arion::memory::{self, MemEdit, Prot};
use arion::{abi, context, Baremetal, Config, CpuArch, Process, ProcessSharedPtr};

fn make_process() -> ProcessSharedPtr {
    Process::new_baremetal_instance(
        Baremetal::new(CpuArch::X8664, vec![0x90; 32]),
        "/",
        Vec::new(),
        "",
        Config::default(),
    )
    .expect("baremetal construction")
}

#[test]
fn save_restore_is_identity_on_idle_process() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let scratch = memory::map(&mut p.uc, 0x1000_0000, 0x1000, Prot::READ | Prot::WRITE, "[s]")
        .unwrap();
    memory::write(&mut p.uc, scratch, b"snapshot me").unwrap();
    abi::write_reg_by_name(&mut p.uc, "rax", 0x1122_3344_5566_7788).unwrap();
    abi::write_reg_by_name(&mut p.uc, "r15", 0xCAFE).unwrap();

    let layout_before: Vec<(u64, u64)> = p
        .state()
        .mem
        .mappings
        .iter()
        .map(|m| (m.start, m.end))
        .collect();

    let ctx = context::save(&mut p.uc).unwrap();

    // Disturb registers and memory, then rewind.
    abi::write_reg_by_name(&mut p.uc, "rax", 0).unwrap();
    abi::write_reg_by_name(&mut p.uc, "r15", 0).unwrap();
    memory::write(&mut p.uc, scratch, b"overwritten").unwrap();
    memory::map(&mut p.uc, 0x2000_0000, 0x1000, Prot::READ, "[extra]").unwrap();

    context::restore(&mut p.uc, &ctx, true).unwrap();

    assert_eq!(
        abi::read_reg_by_name(&p.uc, "rax").unwrap(),
        0x1122_3344_5566_7788
    );
    assert_eq!(abi::read_reg_by_name(&p.uc, "r15").unwrap(), 0xCAFE);
    assert_eq!(
        memory::read(&p.uc, scratch, 11).unwrap(),
        b"snapshot me".to_vec()
    );
    let layout_after: Vec<(u64, u64)> = p
        .state()
        .mem
        .mappings
        .iter()
        .map(|m| (m.start, m.end))
        .collect();
    assert_eq!(layout_before, layout_after);
    assert_eq!(p.state().threads.running_tid(), ctx.running_tid);
}

#[test]
fn delta_restore_rewinds_only_recorded_bytes() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let scratch = memory::map(&mut p.uc, 0x1100_0000, 0x1000, Prot::READ | Prot::WRITE, "[d]")
        .unwrap();
    memory::write(&mut p.uc, scratch, &[0x11; 0x20]).unwrap();
    let ctx = context::save(&mut p.uc).unwrap();

    // Two disjoint dirty ranges, only the first one recorded.
    memory::write(&mut p.uc, scratch, &[0x22; 0x10]).unwrap();
    memory::write(&mut p.uc, scratch + 0x18, &[0x33; 0x8]).unwrap();

    let edits = vec![MemEdit {
        addr: scratch,
        sz: 0x10,
    }];
    context::restore_delta(&mut p.uc, &ctx, &edits).unwrap();

    assert_eq!(memory::read(&p.uc, scratch, 0x10).unwrap(), vec![0x11; 0x10]);
    // The unrecorded range keeps its post-snapshot contents.
    assert_eq!(
        memory::read(&p.uc, scratch + 0x18, 8).unwrap(),
        vec![0x33; 8]
    );
}

#[test]
fn context_survives_a_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proc.arionctx");
    let path = path.to_str().unwrap();

    let process = make_process();
    {
        let mut p = process.borrow_mut();
        let scratch =
            memory::map(&mut p.uc, 0x1200_0000, 0x1000, Prot::READ | Prot::WRITE, "[f]").unwrap();
        memory::write(&mut p.uc, scratch, b"to disk").unwrap();
        abi::write_reg_by_name(&mut p.uc, "rbx", 0xB00B).unwrap();
        context::save_to_file(&mut p.uc, path).unwrap();

        memory::write(&mut p.uc, scratch, b"corrupt").unwrap();
        abi::write_reg_by_name(&mut p.uc, "rbx", 0).unwrap();
    }

    // Restore into a brand-new process of the same architecture.
    let fresh = make_process();
    let mut f = fresh.borrow_mut();
    context::restore_from_file(&mut f.uc, path).unwrap();
    assert_eq!(abi::read_reg_by_name(&f.uc, "rbx").unwrap(), 0xB00B);
    assert_eq!(
        memory::read(&f.uc, 0x1200_0000, 7).unwrap(),
        b"to disk".to_vec()
    );
}

#[test]
fn recorder_captures_guest_writes() {
    // The recorder hooks guest-side stores, so drive a store through the
    // backend: mov byte [rip+data], 0x7F ; exit(0)
    #[rustfmt::skip]
    let code: Vec<u8> = vec![
        // mov rax, imm64 (address patched below)
        0x48, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0,
        // mov byte [rax], 0x7F
        0xC6, 0x00, 0x7F,
        // mov eax, 60 ; xor edi, edi ; syscall
        0xB8, 0x3C, 0x00, 0x00, 0x00, 0x48, 0x31, 0xFF, 0x0F, 0x05,
    ];
    let process = Process::new_baremetal_instance(
        Baremetal::new(CpuArch::X8664, code),
        "/",
        Vec::new(),
        "",
        Config::default(),
    )
    .unwrap();

    {
        let mut p = process.borrow_mut();
        let load = p.state().loader_params.unwrap().load;
        let target = load + 0x800;
        let bytes = target.to_le_bytes();
        memory::write(&mut p.uc, load + 2, &bytes).unwrap();
        memory::recorder_start(&mut p.uc).unwrap();
    }

    let group = arion::ArionGroup::new();
    group.borrow_mut().add_instance(process.clone(), None, None);
    arion::ArionGroup::run(&group).unwrap();

    let p = process.borrow();
    let load = p.state().loader_params.unwrap().load;
    let edits = p.state().mem.recorder.edits();
    assert!(
        edits.iter().any(|e| e.addr == load + 0x800),
        "guest store was not recorded: {:?}",
        edits
    );
}
