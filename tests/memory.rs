//! Address-space invariants exercised against the real backend.

use arion::memory::{self, Prot};
use arion::{Baremetal, Config, CpuArch, Process, ProcessSharedPtr, PAGE_SZ};

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

fn assert_list_invariants(process: &ProcessSharedPtr) {
    let p = process.borrow();
    let mappings = &p.state().mem.mappings;
    for m in mappings.iter() {
        assert_eq!(m.start % PAGE_SZ, 0, "start aligned");
        assert_eq!(m.end % PAGE_SZ, 0, "end aligned");
        assert!(m.start < m.end, "non-empty");
    }
    for pair in mappings.windows(2) {
        assert!(pair[0].end <= pair[1].start, "sorted and disjoint");
    }
}

/// The runtime's mapping list and the backend's regions agree 1:1 on the
/// covered byte ranges.
fn assert_backend_agreement(process: &ProcessSharedPtr) {
    let p = process.borrow();
    let mut ours: Vec<(u64, u64)> = p
        .state()
        .mem
        .mappings
        .iter()
        .map(|m| (m.start, m.end))
        .collect();
    let mut backend: Vec<(u64, u64)> = arion::cpu::regions(&p.uc)
        .expect("regions")
        .iter()
        .map(|r| (r.begin, r.end + 1))
        .collect();
    // Merge adjacency on both sides: the backend may split or coalesce
    // physically contiguous ranges differently than the bookkeeping.
    let merge = |list: &mut Vec<(u64, u64)>| {
        list.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::new();
        for (start, end) in list.iter().copied() {
            match merged.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => merged.push((start, end)),
            }
        }
        *list = merged;
    };
    merge(&mut ours);
    merge(&mut backend);
    assert_eq!(ours, backend);
}

#[test]
fn map_read_write_unmap_round_trip() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let addr = memory::map(&mut p.uc, 0x1000_0000, 0x2000, Prot::READ | Prot::WRITE, "[t]")
        .expect("map");
    assert_eq!(addr, 0x1000_0000);
    let payload = vec![0xA5u8; 0x2000];
    memory::write(&mut p.uc, addr, &payload).unwrap();
    assert_eq!(memory::read(&p.uc, addr, 0x2000).unwrap(), payload);

    // Double-map of any overlapping byte is refused.
    assert!(memory::map(&mut p.uc, 0x1000_1000, 0x1000, Prot::READ, "[t2]").is_err());

    memory::unmap(&mut p.uc, addr, addr + 0x2000).unwrap();
    assert!(!p.state().mem.is_mapped(addr));
    drop(p);
    assert_list_invariants(&process);
    assert_backend_agreement(&process);
}

#[test]
fn partial_unmap_leaves_two_residues() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let base = 0x2000_0000u64;
    memory::map(&mut p.uc, base, 0x4000, Prot::READ | Prot::WRITE, "[anon]").unwrap();
    memory::unmap(&mut p.uc, base + 0x1000, base + 0x2000).unwrap();

    let pieces: Vec<(u64, u64)> = p
        .state()
        .mem
        .mappings
        .iter()
        .filter(|m| m.info == "[anon]")
        .map(|m| (m.start, m.end))
        .collect();
    assert_eq!(pieces, vec![(base, base + 0x1000), (base + 0x2000, base + 0x4000)]);
    drop(p);
    assert_list_invariants(&process);
    assert_backend_agreement(&process);
}

#[test]
fn protect_splits_into_three() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let base = 0x3000_0000u64;
    memory::map(&mut p.uc, base, 0x3000, Prot::READ | Prot::WRITE, "[rw]").unwrap();
    memory::protect(&mut p.uc, base + 0x1000, base + 0x2000, Prot::READ).unwrap();

    let pieces: Vec<(u64, u64, Prot)> = p
        .state()
        .mem
        .mappings
        .iter()
        .filter(|m| m.info == "[rw]")
        .map(|m| (m.start, m.end, m.prot))
        .collect();
    assert_eq!(pieces.len(), 3);
    assert_eq!(pieces[0], (base, base + 0x1000, Prot::READ | Prot::WRITE));
    assert_eq!(pieces[1], (base + 0x1000, base + 0x2000, Prot::READ));
    assert_eq!(pieces[2], (base + 0x2000, base + 0x3000, Prot::READ | Prot::WRITE));
    drop(p);
    assert_list_invariants(&process);
}

#[test]
fn map_anywhere_fills_gaps_in_both_directions() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let lo = 0x4000_0000u64;
    memory::map(&mut p.uc, lo, 0x1000, Prot::READ, "[a]").unwrap();
    memory::map(&mut p.uc, lo + 0x3000, 0x1000, Prot::READ, "[b]").unwrap();

    // Ascending from the hint lands in the interior gap.
    let got = memory::map_anywhere(&mut p.uc, lo, 0x1000, Prot::READ, true, "[gap]").unwrap();
    assert_eq!(got, lo + 0x1000);

    // Descending from the hint places below it.
    let got = memory::map_anywhere(&mut p.uc, lo, 0x1000, Prot::READ, false, "[below]").unwrap();
    assert!(got + 0x1000 <= lo);
    drop(p);
    assert_list_invariants(&process);
}

#[test]
fn resize_grows_and_removes() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let base = 0x5000_0000u64;
    memory::map(&mut p.uc, base, 0x1000, Prot::READ | Prot::WRITE, "[heap]").unwrap();
    memory::resize_mapping(&mut p.uc, base, base, base + 0x3000).unwrap();
    {
        let m = p.state().mem.mapping_at(base).unwrap();
        assert_eq!(m.end, base + 0x3000);
    }
    // Shrinking to nothing removes the mapping.
    memory::resize_mapping(&mut p.uc, base, base, base).unwrap();
    assert!(p.state().mem.mapping_at(base).is_err());
}

#[test]
fn c_string_reads_stop_at_mapping_end() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let base = 0x6000_0000u64;
    memory::map(&mut p.uc, base, 0x1000, Prot::READ | Prot::WRITE, "[str]").unwrap();
    memory::write_string(&mut p.uc, base, "hello").unwrap();
    assert_eq!(memory::read_c_string(&p.uc, base).unwrap(), "hello");

    // No terminator: the read is bounded by the mapping.
    let unterminated = vec![b'A'; 0x1000];
    memory::write(&mut p.uc, base, &unterminated).unwrap();
    let s = memory::read_c_string(&p.uc, base).unwrap();
    assert_eq!(s.len(), 0x1000);
}

#[test]
fn instruction_reads_use_the_current_disassembler() {
    let process = make_process();
    let p = process.borrow();
    let code = p.state().loader_params.unwrap().load;
    // The baremetal image is a nop sled.
    let instrs = memory::read_instrs(&p.uc, code, 4).unwrap();
    assert_eq!(instrs.len(), 4);
    for (i, insn) in instrs.iter().enumerate() {
        assert_eq!(insn.addr, code + i as u64);
        assert_eq!(insn.size, 1);
        assert!(insn.text.starts_with("nop"));
    }
}

#[test]
fn pointer_arrays_are_null_terminated() {
    let process = make_process();
    let mut p = process.borrow_mut();

    let base = 0x7000_0000u64;
    memory::map(&mut p.uc, base, 0x1000, Prot::READ | Prot::WRITE, "[arr]").unwrap();
    memory::write_ptr(&mut p.uc, base, 0x1111).unwrap();
    memory::write_ptr(&mut p.uc, base + 8, 0x2222).unwrap();
    memory::write_ptr(&mut p.uc, base + 16, 0).unwrap();
    assert_eq!(
        memory::read_ptr_arr(&p.uc, base).unwrap(),
        vec![0x1111, 0x2222]
    );
}
