//! Polymorphic guest-struct layouts.
//!
//! Kernel structs crossing the syscall boundary (stat, statx, timespec,
//! clone_args, ...) are described once as a declarative field schema; the
//! per-architecture layout (field widths, natural alignment, padding,
//! endianness) is computed from the ABI table instead of being hardcoded
//! per target.

use std::collections::HashMap;

use crate::abi::AbiTable;
use crate::errors::{ArionError, Result};
use crate::memory;
use crate::process::ArionCpu;
use crate::{Addr, CpuArch};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FieldWidth {
    V8,
    V16,
    V32,
    V64,
    /// Guest pointer width.
    PtrSz,
}

impl FieldWidth {
    fn bytes(self, ptr_sz: usize) -> usize {
        match self {
            FieldWidth::V8 => 1,
            FieldWidth::V16 => 2,
            FieldWidth::V32 => 4,
            FieldWidth::V64 => 8,
            FieldWidth::PtrSz => ptr_sz,
        }
    }
}

/// Which targets a field applies to.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ArchTag {
    Any,
    /// Only guests of this register width (32 or 64).
    Bits(u16),
    /// Only this exact architecture.
    Arch(CpuArch),
}

impl ArchTag {
    fn applies(self, table: &AbiTable) -> bool {
        match self {
            ArchTag::Any => true,
            ArchTag::Bits(bits) => table.arch_sz == bits,
            ArchTag::Arch(arch) => table.arch == arch,
        }
    }
}

pub struct FieldSpec {
    pub when: ArchTag,
    pub width: FieldWidth,
    pub name: &'static str,
}

const fn f(when: ArchTag, width: FieldWidth, name: &'static str) -> FieldSpec {
    FieldSpec { when, width, name }
}

/// A compiled-per-call schema; field order is layout order.
pub struct StructFactory {
    fields: &'static [FieldSpec],
}

/// One resolved field: name, byte offset, byte size.
pub struct FieldLayout {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
}

impl StructFactory {
    pub const fn new(fields: &'static [FieldSpec]) -> StructFactory {
        StructFactory { fields }
    }

    /// Resolves the schema for one target, applying natural alignment
    /// capped at the pointer size.
    pub fn layout(&self, table: &AbiTable) -> Vec<FieldLayout> {
        let ptr_sz = table.ptr_sz;
        let mut out = Vec::new();
        let mut offset = 0usize;
        for spec in self.fields.iter().filter(|s| s.when.applies(table)) {
            let size = spec.width.bytes(ptr_sz);
            let align = size.min(ptr_sz);
            if align > 0 && offset % align != 0 {
                offset += align - offset % align;
            }
            out.push(FieldLayout {
                name: spec.name,
                offset,
                size,
            });
            offset += size;
        }
        out
    }

    pub fn size(&self, table: &AbiTable) -> usize {
        let layout = self.layout(table);
        let end = layout.last().map(|f| f.offset + f.size).unwrap_or(0);
        let align = table.ptr_sz;
        if end % align != 0 {
            end + align - end % align
        } else {
            end
        }
    }

    /// Serializes `values` into the guest layout at `addr`; absent fields
    /// become zero padding.
    pub fn feed(&self, uc: &mut ArionCpu, addr: Addr, values: &[(&str, u64)]) -> Result<()> {
        let table = uc.get_data().abi.table;
        let big_endian = table.arch.big_endian();
        let layout = self.layout(table);
        let mut buf = vec![0u8; self.size(table)];
        let map: HashMap<&str, u64> = values.iter().cloned().collect();
        for field in layout.iter() {
            if let Some(&val) = map.get(field.name) {
                put_val(&mut buf, field.offset, field.size, val, big_endian);
            }
        }
        memory::write(uc, addr, &buf)
    }

    /// Parses a guest struct at `addr` into a field map.
    pub fn build(&self, uc: &ArionCpu, addr: Addr) -> Result<HashMap<&'static str, u64>> {
        let table = uc.get_data().abi.table;
        let big_endian = table.arch.big_endian();
        let layout = self.layout(table);
        let buf = memory::read(uc, addr, self.size(table))?;
        let mut out = HashMap::new();
        for field in layout.iter() {
            out.insert(field.name, get_val(&buf, field.offset, field.size, big_endian));
        }
        Ok(out)
    }
}

fn put_val(buf: &mut [u8], offset: usize, size: usize, val: u64, big_endian: bool) {
    let bytes = val.to_le_bytes();
    if big_endian {
        for i in 0..size {
            buf[offset + size - 1 - i] = bytes[i];
        }
    } else {
        buf[offset..offset + size].copy_from_slice(&bytes[..size]);
    }
}

fn get_val(buf: &[u8], offset: usize, size: usize, big_endian: bool) -> u64 {
    let mut val = 0u64;
    if big_endian {
        for b in &buf[offset..offset + size] {
            val = (val << 8) | *b as u64;
        }
    } else {
        for b in buf[offset..offset + size].iter().rev() {
            val = (val << 8) | *b as u64;
        }
    }
    val
}

/// Field map lookup that surfaces schema mistakes as typed errors.
pub fn field(map: &HashMap<&'static str, u64>, name: &str) -> Result<u64> {
    map.iter()
        .find(|(n, _)| **n == name)
        .map(|(_, v)| *v)
        .ok_or_else(|| ArionError::WrongStructField(name.to_string()))
}

use ArchTag::{Any, Arch, Bits};
use CpuArch::{Arm64, X8664};
use FieldWidth::{PtrSz, V16, V32, V64};

pub static STAT: StructFactory = StructFactory::new(&[
    f(Any, PtrSz, "st_dev"),
    f(Any, PtrSz, "st_ino"),
    f(Bits(32), V16, "st_mode"),
    f(Arch(Arm64), V32, "st_mode"),
    f(Bits(32), V16, "st_nlink"),
    f(Arch(X8664), V64, "st_nlink"),
    f(Arch(Arm64), V32, "st_nlink"),
    f(Arch(X8664), V32, "st_mode"),
    f(Bits(32), V16, "st_uid"),
    f(Bits(64), V32, "st_uid"),
    f(Bits(32), V16, "st_gid"),
    f(Bits(64), V32, "st_gid"),
    f(Any, PtrSz, "st_rdev"),
    f(Arch(Arm64), PtrSz, "__pad1"),
    f(Any, PtrSz, "st_size"),
    f(Bits(32), PtrSz, "st_blksize"),
    f(Arch(X8664), PtrSz, "st_blksize"),
    f(Arch(Arm64), V32, "st_blksize"),
    f(Arch(Arm64), V32, "__pad2"),
    f(Any, PtrSz, "st_blocks"),
    f(Any, PtrSz, "st_atime"),
    f(Any, PtrSz, "st_atime_ns"),
    f(Any, PtrSz, "st_mtime"),
    f(Any, PtrSz, "st_mtime_ns"),
    f(Any, PtrSz, "st_ctime"),
    f(Any, PtrSz, "st_ctime_ns"),
    f(Bits(32), PtrSz, "__unused1"),
    f(Arch(X8664), PtrSz, "__unused1"),
    f(Arch(Arm64), V32, "__unused1"),
    f(Bits(32), PtrSz, "__unused2"),
    f(Arch(X8664), PtrSz, "__unused2"),
    f(Arch(Arm64), V32, "__unused2"),
    f(Arch(X8664), PtrSz, "__unused3"),
]);

/// 32-bit `struct stat64`: wide inode/size fields on narrow guests.
pub static STAT64: StructFactory = StructFactory::new(&[
    f(Any, V64, "st_dev"),
    f(Any, V32, "__pad1"),
    f(Any, V32, "__st_ino"),
    f(Any, V32, "st_mode"),
    f(Any, V32, "st_nlink"),
    f(Any, V32, "st_uid"),
    f(Any, V32, "st_gid"),
    f(Any, V64, "st_rdev"),
    f(Any, V32, "__pad2"),
    f(Any, V64, "st_size"),
    f(Any, V32, "st_blksize"),
    f(Any, V64, "st_blocks"),
    f(Any, V32, "st_atime"),
    f(Any, V32, "st_atime_ns"),
    f(Any, V32, "st_mtime"),
    f(Any, V32, "st_mtime_ns"),
    f(Any, V32, "st_ctime"),
    f(Any, V32, "st_ctime_ns"),
    f(Any, V64, "st_ino"),
]);

pub static TIMESPEC: StructFactory = StructFactory::new(&[
    f(Any, PtrSz, "tv_sec"),
    f(Any, PtrSz, "tv_nsec"),
]);

/// 64-bit time even on narrow guests (the *_time64 syscall generation).
pub static TIMESPEC64: StructFactory = StructFactory::new(&[
    f(Any, V64, "tv_sec"),
    f(Any, V64, "tv_nsec"),
]);

pub static TIMEVAL: StructFactory = StructFactory::new(&[
    f(Any, PtrSz, "tv_sec"),
    f(Any, PtrSz, "tv_usec"),
]);

pub static RLIMIT: StructFactory = StructFactory::new(&[
    f(Any, PtrSz, "rlim_cur"),
    f(Any, PtrSz, "rlim_max"),
]);

pub static RLIMIT64: StructFactory = StructFactory::new(&[
    f(Any, V64, "rlim_cur"),
    f(Any, V64, "rlim_max"),
]);

pub static IOVEC: StructFactory = StructFactory::new(&[
    f(Any, PtrSz, "iov_base"),
    f(Any, PtrSz, "iov_len"),
]);

/// clone3's argument block is fixed-width on every target.
pub static CLONE_ARGS: StructFactory = StructFactory::new(&[
    f(Any, V64, "flags"),
    f(Any, V64, "pidfd"),
    f(Any, V64, "child_tid"),
    f(Any, V64, "parent_tid"),
    f(Any, V64, "exit_signal"),
    f(Any, V64, "stack"),
    f(Any, V64, "stack_size"),
    f(Any, V64, "tls"),
    f(Any, V64, "set_tid"),
    f(Any, V64, "set_tid_size"),
    f(Any, V64, "cgroup"),
]);

pub static SYSINFO: StructFactory = StructFactory::new(&[
    f(Any, PtrSz, "uptime"),
    f(Any, PtrSz, "loads_1"),
    f(Any, PtrSz, "loads_5"),
    f(Any, PtrSz, "loads_15"),
    f(Any, PtrSz, "totalram"),
    f(Any, PtrSz, "freeram"),
    f(Any, PtrSz, "sharedram"),
    f(Any, PtrSz, "bufferram"),
    f(Any, PtrSz, "totalswap"),
    f(Any, PtrSz, "freeswap"),
    f(Any, V16, "procs"),
    f(Any, PtrSz, "totalhigh"),
    f(Any, PtrSz, "freehigh"),
    f(Any, V32, "mem_unit"),
]);

/// statx is fixed-layout on every architecture.
pub static STATX: StructFactory = StructFactory::new(&[
    f(Any, V32, "stx_mask"),
    f(Any, V32, "stx_blksize"),
    f(Any, V64, "stx_attributes"),
    f(Any, V32, "stx_nlink"),
    f(Any, V32, "stx_uid"),
    f(Any, V32, "stx_gid"),
    f(Any, V16, "stx_mode"),
    f(Any, V16, "__pad1"),
    f(Any, V64, "stx_ino"),
    f(Any, V64, "stx_size"),
    f(Any, V64, "stx_blocks"),
    f(Any, V64, "stx_attributes_mask"),
    f(Any, V64, "stx_atime_sec"),
    f(Any, V32, "stx_atime_nsec"),
    f(Any, V32, "__pad2"),
    f(Any, V64, "stx_btime_sec"),
    f(Any, V32, "stx_btime_nsec"),
    f(Any, V32, "__pad3"),
    f(Any, V64, "stx_ctime_sec"),
    f(Any, V32, "stx_ctime_nsec"),
    f(Any, V32, "__pad4"),
    f(Any, V64, "stx_mtime_sec"),
    f(Any, V32, "stx_mtime_nsec"),
    f(Any, V32, "__pad5"),
    f(Any, V32, "stx_rdev_major"),
    f(Any, V32, "stx_rdev_minor"),
    f(Any, V32, "stx_dev_major"),
    f(Any, V32, "stx_dev_minor"),
]);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi;

    fn layout_map(factory: &StructFactory, table: &AbiTable) -> HashMap<&'static str, usize> {
        factory
            .layout(table)
            .into_iter()
            .map(|f| (f.name, f.offset))
            .collect()
    }

    #[test]
    fn x86_64_stat_matches_kernel_offsets() {
        let table = &*abi::x86_64::TABLE;
        let offsets = layout_map(&STAT, table);
        assert_eq!(offsets["st_dev"], 0);
        assert_eq!(offsets["st_ino"], 8);
        assert_eq!(offsets["st_nlink"], 16);
        assert_eq!(offsets["st_mode"], 24);
        assert_eq!(offsets["st_uid"], 28);
        assert_eq!(offsets["st_gid"], 32);
        assert_eq!(offsets["st_rdev"], 40);
        assert_eq!(offsets["st_size"], 48);
        assert_eq!(offsets["st_blksize"], 56);
        assert_eq!(offsets["st_blocks"], 64);
        assert_eq!(offsets["st_atime"], 72);
        assert_eq!(STAT.size(table), 144);
    }

    #[test]
    fn timespec_width_follows_pointer_size() {
        assert_eq!(TIMESPEC.size(&*abi::x86_64::TABLE), 16);
        assert_eq!(TIMESPEC.size(&*abi::arm::TABLE), 8);
    }

    #[test]
    fn clone_args_is_width_invariant() {
        assert_eq!(CLONE_ARGS.size(&*abi::x86_64::TABLE), 88);
        // 32-bit guests still see the fixed 64-bit block.
        let layout = CLONE_ARGS.layout(&*abi::arm::TABLE);
        assert_eq!(layout.last().unwrap().offset, 80);
    }

    #[test]
    fn big_endian_values_round_trip() {
        let mut buf = vec![0u8; 8];
        put_val(&mut buf, 0, 4, 0x1122_3344, true);
        assert_eq!(&buf[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(get_val(&buf, 0, 4, true), 0x1122_3344);
        put_val(&mut buf, 4, 4, 0x1122_3344, false);
        assert_eq!(&buf[4..], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(get_val(&buf, 4, 4, false), 0x1122_3344);
    }
}
