//! x86 Global Descriptor Table manager.
//!
//! Builds a 32-entry GDT at a fixed guest address with writable/executable
//! segments for CS/DS/SS and a GS segment at a fixed address. This layout
//! is guest-visible architectural state and is kept exactly as 32-bit
//! guests expect it.

use unicorn_engine::RegisterX86 as R;

use crate::errors::Result;
use crate::memory::Prot;
use crate::process::ArionCpu;
use crate::{abi, cpu, memory, Addr};

pub const GDT_ADDR: Addr = 0xC000_0000;
pub const GDT_LIMIT: u64 = 0x1000;
pub const GDT_ENTRY_SZ: u64 = 0x8;
pub const GDT_ENTRIES_N: u64 = 0x20;

pub const GS_SEGMENT_ADDR: Addr = 0xC000_1000;
pub const GS_SEGMENT_SZ: u64 = 0x1000;

pub const F_GRANULARITY: u8 = 0x8;
pub const F_PROT_32: u8 = 0x4;
pub const A_PRESENT: u8 = 0x80;
pub const A_PRIV_3: u8 = 0x60;
pub const A_PRIV_0: u8 = 0x0;
pub const A_CODE: u8 = 0x10;
pub const A_DATA: u8 = 0x10;
pub const A_EXEC: u8 = 0x8;
pub const A_DATA_WRITABLE: u8 = 0x2;
pub const A_CODE_READABLE: u8 = 0x2;
pub const A_DIR_CON_BIT: u8 = 0x4;
pub const S_GDT: u16 = 0x0;
pub const S_PRIV_3: u16 = 0x3;
pub const S_PRIV_0: u16 = 0x0;

/// Index of the GDT slot used for the thread-area TLS segment.
const TLS_IDX: u8 = 12;
const GS_IDX: u8 = 15;

#[derive(Clone, Debug, Default)]
pub struct GdtState {
    pub gdt_addr: Addr,
}

pub fn selector(idx: u8, flags: u16) -> u16 {
    flags | ((idx as u16) << 3)
}

pub fn entry(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut e = (limit as u64) & 0xFFFF;
    e |= ((base as u64) & 0xFF_FFFF) << 16;
    e |= (access as u64) << 40;
    e |= (((limit as u64) >> 16) & 0xF) << 48;
    e |= (flags as u64) << 52;
    e |= (((base as u64) >> 24) & 0xFF) << 56;
    e
}

fn write_gdtr(uc: &mut ArionCpu, base: Addr, limit: u32) -> Result<()> {
    // Serialized uc_x86_mmr: u16 selector, pad, u64 base, u32 limit, u32 flags.
    let mut mmr = [0u8; 24];
    mmr[8..16].copy_from_slice(&base.to_le_bytes());
    mmr[16..20].copy_from_slice(&limit.to_le_bytes());
    cpu::reg_write_long(uc, R::GDTR as i32, &mmr)
}

/// Maps the GDT and GS segments, fills the fixed descriptors and loads the
/// segment selectors. Runs once per 32-bit x86 process.
pub fn setup(uc: &mut ArionCpu) -> Result<()> {
    let gdt_addr = memory::map(uc, GDT_ADDR, GDT_LIMIT, Prot::READ | Prot::WRITE, "[GDT]")?;
    uc.get_data_mut().gdt = Some(GdtState { gdt_addr });

    let gs_addr = memory::map(
        uc,
        GS_SEGMENT_ADDR,
        GS_SEGMENT_SZ,
        Prot::READ | Prot::WRITE,
        "[GS]",
    )?;

    let mut entries = vec![0u64; GDT_ENTRIES_N as usize];
    entries[GS_IDX as usize] = entry(
        gs_addr as u32,
        GS_SEGMENT_SZ as u32,
        A_PRESENT | A_DATA | A_DATA_WRITABLE | A_PRIV_3 | A_DIR_CON_BIT,
        F_PROT_32,
    );
    entries[16] = entry(
        0,
        0xFFFF_F000,
        A_PRESENT | A_DATA | A_DATA_WRITABLE | A_PRIV_3 | A_DIR_CON_BIT,
        F_PROT_32,
    );
    entries[17] = entry(
        0,
        0xFFFF_F000,
        A_PRESENT | A_CODE | A_CODE_READABLE | A_EXEC | A_PRIV_3 | A_DIR_CON_BIT,
        F_PROT_32,
    );
    entries[18] = entry(
        0,
        0xFFFF_F000,
        A_PRESENT | A_DATA | A_DATA_WRITABLE | A_PRIV_0 | A_DIR_CON_BIT,
        F_PROT_32,
    );

    let mut raw = Vec::with_capacity((GDT_ENTRY_SZ * GDT_ENTRIES_N) as usize);
    for e in entries.iter() {
        raw.extend_from_slice(&e.to_le_bytes());
    }
    memory::write(uc, gdt_addr, &raw)?;

    write_gdtr(uc, gdt_addr, (GDT_ENTRY_SZ * GDT_ENTRIES_N - 1) as u32)?;

    abi::write_reg_sized(uc, R::GS as i32, selector(GS_IDX, S_GDT | S_PRIV_3) as u64, 2)?;
    abi::write_reg_sized(uc, R::DS as i32, selector(16, S_GDT | S_PRIV_3) as u64, 2)?;
    abi::write_reg_sized(uc, R::CS as i32, selector(17, S_GDT | S_PRIV_3) as u64, 2)?;
    abi::write_reg_sized(uc, R::SS as i32, selector(18, S_GDT | S_PRIV_0) as u64, 2)?;
    Ok(())
}

fn gdt_base(uc: &ArionCpu) -> Addr {
    uc.get_data()
        .gdt
        .as_ref()
        .map(|g| g.gdt_addr)
        .unwrap_or(GDT_ADDR)
}

/// First empty descriptor slot at or after `start_idx`.
pub fn find_free_idx(uc: &mut ArionCpu, start_idx: u8) -> Result<u8> {
    let base = gdt_base(uc);
    let mut idx = start_idx;
    while (idx as u64) < GDT_ENTRIES_N {
        let e = memory::read_val(uc, base + idx as u64 * GDT_ENTRY_SZ, GDT_ENTRY_SZ as u8)?;
        if e == 0 {
            return Ok(idx);
        }
        idx += 1;
    }
    Err(crate::errors::ArionError::InvalidArgument(
        "no free GDT entry".to_string(),
    ))
}

pub fn insert_entry(
    uc: &mut ArionCpu,
    idx: u8,
    base: u32,
    mut limit: u32,
    access: u8,
    mut flags: u8,
) -> Result<()> {
    if limit > (1 << 16) {
        limit >>= 12;
        flags |= F_GRANULARITY;
    }
    let e = entry(base, limit, access, flags);
    let gdt = gdt_base(uc);
    memory::write_val(uc, gdt + idx as u64 * GDT_ENTRY_SZ, e, GDT_ENTRY_SZ as u8)
}

/// Linear base address encoded in the descriptor a selector points at.
pub fn segment_base(uc: &mut ArionCpu, sel: u16) -> Result<u32> {
    let idx = (sel >> 3) as u64;
    let gdt = gdt_base(uc);
    let e = memory::read_val(uc, gdt + idx * GDT_ENTRY_SZ, GDT_ENTRY_SZ as u8)?;
    let mut base = ((e >> 16) & 0xFF_FFFF) as u32;
    base |= (((e >> 56) & 0xFF) as u32) << 24;
    Ok(base)
}

/// Installs a TLS base through the dedicated GDT slot and points GS at it.
pub fn load_tls_base(uc: &mut ArionCpu, tls: Addr) -> Result<()> {
    let idx = find_free_idx(uc, TLS_IDX).unwrap_or(TLS_IDX);
    insert_entry(
        uc,
        idx,
        tls as u32,
        0xFFFF,
        A_PRESENT | A_DATA | A_DATA_WRITABLE | A_PRIV_3 | A_DIR_CON_BIT,
        F_PROT_32,
    )?;
    abi::write_reg_sized(uc, R::GS as i32, selector(idx, S_GDT | S_PRIV_3) as u64, 2)
}

/// Resolves the current GS selector back to its segment base.
pub fn dump_tls_base(uc: &mut ArionCpu) -> Result<Addr> {
    let sel = abi::read_reg_sized(uc, R::GS as i32, 2)? as u16;
    Ok(segment_base(uc, sel)? as Addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_encoding_round_trips_base() {
        let base: u32 = 0xC000_1000;
        let e = entry(base, 0x1000, A_PRESENT | A_DATA, F_PROT_32);
        let mut decoded = ((e >> 16) & 0xFF_FFFF) as u32;
        decoded |= (((e >> 56) & 0xFF) as u32) << 24;
        assert_eq!(decoded, base);
    }

    #[test]
    fn selector_packs_index_and_flags() {
        assert_eq!(selector(15, S_GDT | S_PRIV_3), (15 << 3) | 3);
    }
}
