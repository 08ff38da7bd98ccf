//! Guest address-space bookkeeping on top of the backend's mappings.
//!
//! The mapping list is kept sorted by start address, disjoint and
//! page-aligned, and mirrors the backend's view after every
//! map/unmap/protect/resize. Partial unmaps and protects split mappings;
//! the residual pieces inherit the original protection and info string.

use std::fmt::Write as _;

use crate::abi;
use crate::errors::{ArionError, Result};
use crate::hooks;
use crate::process::ArionCpu;
use crate::{cpu, Addr, HookId, BUF_SZ, PAGE_SZ};

bitflags! {
    /// Mapping protection flags. Bit layout matches the guest's ELF segment
    /// flag encoding (PF_X/PF_W/PF_R).
    pub struct Prot: u32 {
        const EXEC  = 1;
        const WRITE = 2;
        const READ  = 4;
    }
}

impl Prot {
    pub fn to_str(self) -> String {
        let mut s = String::new();
        s.push(if self.contains(Prot::READ) { 'r' } else { '-' });
        s.push(if self.contains(Prot::WRITE) { 'w' } else { '-' });
        s.push(if self.contains(Prot::EXEC) { 'x' } else { '-' });
        s
    }
}

/// One guest mapping: half-open page-aligned range plus a free-form info
/// string used by loaders and clients to identify modules.
#[derive(Clone, Debug, PartialEq)]
pub struct Mapping {
    pub start: Addr,
    pub end: Addr,
    pub prot: Prot,
    pub info: String,
}

impl Mapping {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A recorded guest-side write.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MemEdit {
    pub addr: Addr,
    pub sz: usize,
}

/// Captures (addr, size) for every guest write between `start` and `stop`,
/// feeding delta restore and fuzz-reset clients.
#[derive(Default)]
pub struct MemoryRecorder {
    edits: Vec<MemEdit>,
    hook_id: Option<HookId>,
}

impl MemoryRecorder {
    pub fn push(&mut self, addr: Addr, sz: usize) {
        self.edits.push(MemEdit { addr, sz });
    }

    pub fn edits(&self) -> &[MemEdit] {
        &self.edits
    }

    pub fn clear(&mut self) {
        self.edits.clear();
    }
}

/// Address-space state owned by each process.
#[derive(Default)]
pub struct MemState {
    pub mappings: Vec<Mapping>,
    brk: Addr,
    pub recorder: MemoryRecorder,
}

impl MemState {
    pub fn is_mapped(&self, addr: Addr) -> bool {
        self.mappings.iter().any(|m| m.contains(addr))
    }

    pub fn can_map(&self, start: Addr, sz: u64) -> bool {
        let end = start + sz;
        !self
            .mappings
            .iter()
            .any(|m| start < m.end && end > m.start)
    }

    pub fn mapping_at(&self, addr: Addr) -> Result<&Mapping> {
        self.mappings
            .iter()
            .find(|m| m.contains(addr))
            .ok_or(ArionError::NoMappingAtAddr(addr))
    }

    pub fn has_mapping_with_info(&self, info: &str) -> bool {
        self.mappings.iter().any(|m| m.info == info)
    }

    pub fn mapping_by_info(&self, info: &str) -> Result<&Mapping> {
        self.mappings
            .iter()
            .find(|m| m.info == info)
            .ok_or_else(|| ArionError::NoMappingWithInfo(info.to_string()))
    }

    pub fn brk(&self) -> Addr {
        self.brk
    }

    pub fn set_brk(&mut self, brk: Addr) {
        self.brk = brk;
    }

    fn insert(&mut self, mapping: Mapping) {
        let pos = self
            .mappings
            .iter()
            .position(|m| m.start > mapping.start)
            .unwrap_or(self.mappings.len());
        self.mappings.insert(pos, mapping);
    }

    fn remove_exact(&mut self, start: Addr, end: Addr) -> Result<Mapping> {
        let pos = self
            .mappings
            .iter()
            .position(|m| m.start == start && m.end == end)
            .ok_or(ArionError::MappingNotPresent(start, end))?;
        Ok(self.mappings.remove(pos))
    }
}

pub fn align_up(addr: Addr) -> Addr {
    let delta = addr % PAGE_SZ;
    if delta == 0 {
        addr
    } else {
        addr + PAGE_SZ - delta
    }
}

pub fn align_down(addr: Addr) -> Addr {
    addr - addr % PAGE_SZ
}

pub fn is_mapped(uc: &ArionCpu, addr: Addr) -> bool {
    uc.get_data().mem.is_mapped(addr)
}

/// Maps `[start, start+sz)` with `prot`. Fails if any byte of the range is
/// already mapped.
pub fn map(uc: &mut ArionCpu, start: Addr, sz: u64, prot: Prot, info: &str) -> Result<Addr> {
    let start = align_up(start);
    let sz = align_up(sz);
    if !uc.get_data().mem.can_map(start, sz) {
        return Err(ArionError::AlreadyMapped(start, sz));
    }
    cpu::map(uc, start, sz, prot)?;
    uc.get_data_mut().mem.insert(Mapping {
        start,
        end: start + sz,
        prot,
        info: info.to_string(),
    });
    debug!(
        "mapped [{:#x}, {:#x}) {} {}",
        start,
        start + sz,
        prot.to_str(),
        info
    );
    Ok(start)
}

/// Finds a gap of `sz` bytes scanning from `hint` in the requested
/// direction and maps there. Falls back past the last (or before the
/// first) mapping when no interior gap fits.
pub fn map_anywhere(
    uc: &mut ArionCpu,
    hint: Addr,
    sz: u64,
    prot: Prot,
    asc: bool,
    info: &str,
) -> Result<Addr> {
    let hint = align_up(hint);
    let sz = align_up(sz);
    if asc {
        let mut start = hint;
        let gaps: Vec<(Addr, Addr)> = uc
            .get_data()
            .mem
            .mappings
            .iter()
            .map(|m| (m.start, m.end))
            .collect();
        for (m_start, m_end) in gaps {
            if m_start < start {
                start = start.max(m_end);
                continue;
            }
            if sz <= m_start - start {
                return map(uc, start, sz, prot, info);
            }
            start = m_end;
        }
        map(uc, start, sz, prot, info)
    } else {
        let mut end = hint;
        let gaps: Vec<(Addr, Addr)> = uc
            .get_data()
            .mem
            .mappings
            .iter()
            .rev()
            .map(|m| (m.start, m.end))
            .collect();
        for (m_start, m_end) in gaps {
            if m_end > end {
                end = end.min(m_start);
                continue;
            }
            if sz <= end - m_end {
                return map(uc, end - sz, sz, prot, info);
            }
            end = m_start;
        }
        map(uc, end - sz, sz, prot, info)
    }
}

fn unmap_piece(uc: &mut ArionCpu, mapping: Mapping, start: Addr, end: Addr) -> Result<()> {
    if start > end || start > mapping.end || end <= mapping.start {
        return Err(ArionError::UnmapOutsideMapping(
            mapping.start,
            mapping.end,
            start,
            end,
        ));
    }
    let start = start.max(mapping.start);
    let end = end.min(mapping.end);

    uc.get_data_mut()
        .mem
        .remove_exact(mapping.start, mapping.end)?;
    cpu::unmap(uc, start, end - start)?;

    if mapping.start != start {
        uc.get_data_mut().mem.insert(Mapping {
            start: mapping.start,
            end: start,
            prot: mapping.prot,
            info: mapping.info.clone(),
        });
    }
    if mapping.end != end {
        uc.get_data_mut().mem.insert(Mapping {
            start: end,
            end: mapping.end,
            prot: mapping.prot,
            info: mapping.info,
        });
    }
    Ok(())
}

/// Unmaps `[start, end)`, splitting any mapping it lands inside.
pub fn unmap(uc: &mut ArionCpu, start: Addr, end: Addr) -> Result<()> {
    let start = align_down(start);
    let end = align_up(end);
    let overlapping: Vec<Mapping> = uc
        .get_data()
        .mem
        .mappings
        .iter()
        .filter(|m| start < m.end && end > m.start)
        .cloned()
        .collect();
    for mapping in overlapping {
        let s = start.max(mapping.start);
        let e = end.min(mapping.end);
        unmap_piece(uc, mapping, s, e)?;
    }
    Ok(())
}

/// Unmaps the whole mapping containing `seg_addr`.
pub fn unmap_mapping(uc: &mut ArionCpu, seg_addr: Addr) -> Result<()> {
    let mapping = uc.get_data().mem.mapping_at(seg_addr)?.clone();
    unmap_piece(uc, mapping.clone(), mapping.start, mapping.end)
}

pub fn unmap_all(uc: &mut ArionCpu) -> Result<()> {
    let all: Vec<Mapping> = uc.get_data().mem.mappings.clone();
    for mapping in all {
        unmap_piece(uc, mapping.clone(), mapping.start, mapping.end)?;
    }
    Ok(())
}

/// Changes the protection of `[start, end)`, splitting affected mappings
/// into up to three pieces each.
pub fn protect(uc: &mut ArionCpu, start: Addr, end: Addr, prot: Prot) -> Result<()> {
    let start = align_down(start);
    let end = align_up(end);
    let overlapping: Vec<Mapping> = uc
        .get_data()
        .mem
        .mappings
        .iter()
        .filter(|m| start < m.end && end > m.start)
        .cloned()
        .collect();
    for mapping in overlapping {
        let s = start.max(mapping.start);
        let e = end.min(mapping.end);

        uc.get_data_mut()
            .mem
            .remove_exact(mapping.start, mapping.end)?;
        cpu::protect(uc, s, e - s, prot)?;

        if mapping.start != s {
            uc.get_data_mut().mem.insert(Mapping {
                start: mapping.start,
                end: s,
                prot: mapping.prot,
                info: mapping.info.clone(),
            });
        }
        uc.get_data_mut().mem.insert(Mapping {
            start: s,
            end: e,
            prot,
            info: mapping.info.clone(),
        });
        if mapping.end != e {
            uc.get_data_mut().mem.insert(Mapping {
                start: e,
                end: mapping.end,
                prot: mapping.prot,
                info: mapping.info,
            });
        }
    }
    Ok(())
}

/// Grows or shrinks the mapping containing `seg_addr` to
/// `[new_start, new_end)`; an empty target range removes it.
pub fn resize_mapping(uc: &mut ArionCpu, seg_addr: Addr, new_start: Addr, new_end: Addr) -> Result<()> {
    let new_start = align_up(new_start);
    let new_end = align_up(new_end);
    let mapping = uc.get_data().mem.mapping_at(align_down(seg_addr))?.clone();

    if new_start >= new_end {
        uc.get_data_mut()
            .mem
            .remove_exact(mapping.start, mapping.end)?;
        cpu::unmap(uc, mapping.start, mapping.size())?;
        return Ok(());
    }

    if new_start < mapping.start {
        cpu::map(uc, new_start, mapping.start - new_start, mapping.prot)?;
    } else if new_start > mapping.start {
        cpu::unmap(uc, mapping.start, new_start - mapping.start)?;
    }
    if new_end > mapping.end {
        cpu::map(uc, mapping.end, new_end - mapping.end, mapping.prot)?;
    } else if new_end < mapping.end {
        cpu::unmap(uc, new_end, mapping.end - new_end)?;
    }

    let state = uc.get_data_mut();
    state.mem.remove_exact(mapping.start, mapping.end)?;
    state.mem.insert(Mapping {
        start: new_start,
        end: new_end,
        prot: mapping.prot,
        info: mapping.info,
    });
    Ok(())
}

pub fn read(uc: &ArionCpu, addr: Addr, sz: usize) -> Result<Vec<u8>> {
    cpu::read(uc, addr, sz)
}

pub fn write(uc: &mut ArionCpu, addr: Addr, data: &[u8]) -> Result<()> {
    cpu::write(uc, addr, data)
}

/// Reads an `n`-byte integer honoring the guest's endianness.
pub fn read_val(uc: &ArionCpu, addr: Addr, n: u8) -> Result<u64> {
    let data = read(uc, addr, n as usize)?;
    let mut val: u64 = 0;
    if uc.get_data().abi.table.arch.big_endian() {
        for b in data.iter() {
            val = (val << 8) | *b as u64;
        }
    } else {
        for b in data.iter().rev() {
            val = (val << 8) | *b as u64;
        }
    }
    Ok(val)
}

pub fn write_val(uc: &mut ArionCpu, addr: Addr, val: u64, n: u8) -> Result<()> {
    let le = val.to_le_bytes();
    let mut data: Vec<u8> = le[..n as usize].to_vec();
    if uc.get_data().abi.table.arch.big_endian() {
        data.reverse();
    }
    write(uc, addr, &data)
}

pub fn read_ptr(uc: &ArionCpu, addr: Addr) -> Result<Addr> {
    let ptr_sz = uc.get_data().abi.table.ptr_sz as u8;
    read_val(uc, addr, ptr_sz)
}

pub fn write_ptr(uc: &mut ArionCpu, addr: Addr, ptr: Addr) -> Result<()> {
    let ptr_sz = uc.get_data().abi.table.ptr_sz as u8;
    write_val(uc, addr, ptr, ptr_sz)
}

pub fn write_string(uc: &mut ArionCpu, addr: Addr, s: &str) -> Result<()> {
    let mut data = s.as_bytes().to_vec();
    data.push(0);
    write(uc, addr, &data)
}

/// Reads a NUL-terminated string, never crossing the end of the containing
/// mapping.
pub fn read_c_string(uc: &ArionCpu, addr: Addr) -> Result<String> {
    let end = uc.get_data().mem.mapping_at(addr)?.end;
    let mut out = Vec::new();
    let mut curr = addr;
    while curr < end {
        let chunk_sz = BUF_SZ.min((end - curr) as usize);
        let chunk = read(uc, curr, chunk_sz)?;
        match memchr::memchr(0, &chunk) {
            Some(nul) => {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            None => out.extend_from_slice(&chunk),
        }
        curr += chunk_sz as u64;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Reads a NULL-terminated array of guest pointers.
pub fn read_ptr_arr(uc: &ArionCpu, addr: Addr) -> Result<Vec<Addr>> {
    let ptr_sz = uc.get_data().abi.table.ptr_sz as u64;
    let mut arr = Vec::new();
    let mut off = 0;
    loop {
        let val = read_ptr(uc, addr + off)?;
        if val == 0 {
            return Ok(arr);
        }
        arr.push(val);
        off += ptr_sz;
    }
}

/// One decoded guest instruction.
#[derive(Clone, Debug)]
pub struct Insn {
    pub addr: Addr,
    pub size: usize,
    pub text: String,
}

/// Disassembles `count` instructions at `addr` with the ABI's current
/// disassembler mode.
pub fn read_instrs(uc: &ArionCpu, addr: Addr, count: usize) -> Result<Vec<Insn>> {
    let cs = abi::curr_cs(uc)?;
    let mut instrs = Vec::with_capacity(count);
    let mut off = 0u64;
    while instrs.len() < count {
        let code = read(uc, addr + off, BUF_SZ)?;
        let left = count - instrs.len();
        let decoded = cs
            .disasm_count(&code, addr + off, left)
            .map_err(|e| ArionError::Disasm(e.to_string()))?;
        if decoded.is_empty() {
            return Err(ArionError::Disasm(format!(
                "undecodable instruction at {:#x}",
                addr + off
            )));
        }
        for insn in decoded.iter() {
            instrs.push(Insn {
                addr: insn.address(),
                size: insn.bytes().len(),
                text: format!(
                    "{} {}",
                    insn.mnemonic().unwrap_or(""),
                    insn.op_str().unwrap_or("")
                ),
            });
        }
        let last = instrs.last().map(|i| i.addr + i.size as u64).unwrap_or(0);
        off = last - addr;
    }
    instrs.truncate(count);
    Ok(instrs)
}

pub fn stack_push(uc: &mut ArionCpu, val: u64) -> Result<()> {
    let (sp_reg, ptr_sz) = {
        let table = uc.get_data().abi.table;
        (table.sp, table.ptr_sz as u64)
    };
    let sp = abi::read_arch_reg(uc, sp_reg)? - ptr_sz;
    abi::write_arch_reg(uc, sp_reg, sp)?;
    write_val(uc, sp, val, ptr_sz as u8)
}

pub fn stack_push_bytes(uc: &mut ArionCpu, data: &[u8]) -> Result<Addr> {
    let sp_reg = uc.get_data().abi.table.sp;
    let sp = abi::read_arch_reg(uc, sp_reg)? - data.len() as u64;
    abi::write_arch_reg(uc, sp_reg, sp)?;
    write(uc, sp, data)?;
    Ok(sp)
}

pub fn stack_push_string(uc: &mut ArionCpu, s: &str) -> Result<Addr> {
    let mut data = s.as_bytes().to_vec();
    data.push(0);
    stack_push_bytes(uc, &data)
}

pub fn stack_pop(uc: &mut ArionCpu) -> Result<u64> {
    let (sp_reg, ptr_sz) = {
        let table = uc.get_data().abi.table;
        (table.sp, table.ptr_sz as u64)
    };
    let sp = abi::read_arch_reg(uc, sp_reg)?;
    let val = read_ptr(uc, sp)?;
    abi::write_arch_reg(uc, sp_reg, sp + ptr_sz)?;
    Ok(val)
}

pub fn stack_align(uc: &mut ArionCpu) -> Result<()> {
    let (sp_reg, ptr_sz) = {
        let table = uc.get_data().abi.table;
        (table.sp, table.ptr_sz as u64)
    };
    let sp = abi::read_arch_reg(uc, sp_reg)?;
    abi::write_arch_reg(uc, sp_reg, sp - sp % ptr_sz)
}

/// Starts recording guest writes; the edits feed delta restore.
pub fn recorder_start(uc: &mut ArionCpu) -> Result<()> {
    if uc.get_data().mem.recorder.hook_id.is_some() {
        return Err(ArionError::RecorderAlreadyStarted);
    }
    let hook_id = hooks::hook_mem_write(
        uc,
        0,
        u64::MAX,
        std::rc::Rc::new(|uc, _access, addr, sz, _val| {
            uc.get_data_mut().mem.recorder.push(addr, sz);
            Ok(true)
        }),
    )?;
    uc.get_data_mut().mem.recorder.hook_id = Some(hook_id);
    Ok(())
}

pub fn recorder_stop(uc: &mut ArionCpu) -> Result<()> {
    let hook_id = uc
        .get_data_mut()
        .mem
        .recorder
        .hook_id
        .take()
        .ok_or(ArionError::RecorderAlreadyStopped)?;
    hooks::unhook(uc, hook_id)
}

/// Human-readable mapping table, one line per mapping.
pub fn mappings_str(uc: &ArionCpu) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "{:<19}{:<19}{:<8}[INFO]", "[START]", "[END]", "[FLAGS]");
    for m in uc.get_data().mem.mappings.iter() {
        let _ = writeln!(
            s,
            "{:<19}{:<19}{:<8}{}",
            format!("{:#x}", m.start),
            format!("{:#x}", m.end),
            m.prot.to_str(),
            m.info
        );
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(start: Addr, end: Addr) -> Mapping {
        Mapping {
            start,
            end,
            prot: Prot::READ | Prot::WRITE,
            info: String::new(),
        }
    }

    #[test]
    fn align_up_rounds_to_page() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), PAGE_SZ);
        assert_eq!(align_up(PAGE_SZ), PAGE_SZ);
        assert_eq!(align_up(PAGE_SZ + 1), 2 * PAGE_SZ);
    }

    #[test]
    fn can_map_rejects_any_overlap() {
        let mut state = MemState::default();
        state.insert(m(0x2000, 0x4000));
        assert!(state.can_map(0x0000, 0x2000));
        assert!(state.can_map(0x4000, 0x1000));
        assert!(!state.can_map(0x1000, 0x2000));
        assert!(!state.can_map(0x3000, 0x1000));
        assert!(!state.can_map(0x1000, 0x4000));
    }

    #[test]
    fn insert_keeps_list_sorted() {
        let mut state = MemState::default();
        state.insert(m(0x5000, 0x6000));
        state.insert(m(0x1000, 0x2000));
        state.insert(m(0x3000, 0x4000));
        let starts: Vec<Addr> = state.mappings.iter().map(|x| x.start).collect();
        assert_eq!(starts, vec![0x1000, 0x3000, 0x5000]);
    }

    #[test]
    fn mapping_lookup_by_addr_and_info() {
        let mut state = MemState::default();
        let mut heap = m(0x8000, 0x9000);
        heap.info = "[heap]".to_string();
        state.insert(heap);
        assert!(state.mapping_at(0x8000).is_ok());
        assert!(state.mapping_at(0x9000).is_err());
        assert!(state.has_mapping_with_info("[heap]"));
        assert_eq!(state.mapping_by_info("[heap]").unwrap().start, 0x8000);
        assert!(state.mapping_by_info("[stack]").is_err());
    }
}
