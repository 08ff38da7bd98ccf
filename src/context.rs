//! Context manager: self-contained snapshots of a process and the three
//! restore flavours (full, structural-only, delta), plus the on-disk
//! `ARIONCTX` format.

use std::fs::File;
use std::io::{Read, Write};

use libc::pid_t;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Whence;

use crate::errors::{ArionError, Result};
use crate::fs::FileEntry;
use crate::memory::{self, MemEdit, Prot};
use crate::process::ArionCpu;
use crate::socket::SocketEntry;
use crate::threads::{self, ArionThread, FutexEntry};
use crate::{abi, Addr, CpuArch};

const CONTEXT_FILE_MAGIC: &[u8; 8] = b"ARIONCTX";
const CONTEXT_FILE_VERSION: f32 = 1.0;

/// A mapping plus its byte contents at snapshot time.
#[derive(Clone)]
pub struct SavedMapping {
    pub start: Addr,
    pub end: Addr,
    pub prot: Prot,
    pub info: String,
    pub data: Vec<u8>,
}

/// Everything needed to reconstruct a process exactly.
pub struct ArionContext {
    pub running_tid: pid_t,
    pub threads: Vec<ArionThread>,
    pub futexes: Vec<FutexEntry>,
    pub mappings: Vec<SavedMapping>,
    pub files: Vec<(i32, FileEntry)>,
    pub sockets: Vec<(i32, SocketEntry)>,
}

/// Captures the process state: threads (with the running thread's live
/// registers and TLS), futexes, mappings with contents, files with their
/// current host offsets, and sockets.
pub fn save(uc: &mut ArionCpu) -> Result<ArionContext> {
    let running_tid = uc.get_data().threads.running_tid();
    let ops = uc.get_data().abi.ops.clone();

    let mut thread_list: Vec<ArionThread> = uc.get_data().threads.threads.values().cloned().collect();
    let live_regs = abi::dump_regs(uc)?;
    let live_tls = ops.dump_tls(uc).unwrap_or(0);
    for thread in thread_list.iter_mut() {
        if thread.tid == running_tid {
            thread.regs = Some(live_regs.clone());
            thread.tls = live_tls;
        }
    }

    let futex_list: Vec<FutexEntry> = uc
        .get_data()
        .threads
        .futexes
        .values()
        .flat_map(|v| v.iter().cloned())
        .collect();

    let mappings_meta: Vec<(Addr, Addr, Prot, String)> = uc
        .get_data()
        .mem
        .mappings
        .iter()
        .map(|m| (m.start, m.end, m.prot, m.info.clone()))
        .collect();
    let mut mapping_list = Vec::with_capacity(mappings_meta.len());
    for (start, end, prot, info) in mappings_meta {
        let data = memory::read(uc, start, (end - start) as usize)?;
        mapping_list.push(SavedMapping {
            start,
            end,
            prot,
            info,
            data,
        });
    }

    let mut file_list = Vec::new();
    for (&guest_fd, entry) in uc.get_data().fs.files.iter() {
        let mut entry = entry.clone();
        if let Ok(off) = nix::unistd::lseek(entry.host_fd, 0, Whence::SeekCur) {
            if off > 0 {
                entry.saved_off = off;
            }
        }
        file_list.push((guest_fd, entry));
    }

    let socket_list: Vec<(i32, SocketEntry)> = uc
        .get_data()
        .sock
        .sockets
        .iter()
        .map(|(&fd, s)| (fd, s.clone()))
        .collect();

    Ok(ArionContext {
        running_tid,
        threads: thread_list,
        futexes: futex_list,
        mappings: mapping_list,
        files: file_list,
        sockets: socket_list,
    })
}

fn restore_files(uc: &mut ArionCpu, ctx: &ArionContext) -> Result<()> {
    let stale: Vec<(i32, i32)> = uc
        .get_data()
        .fs
        .files
        .iter()
        .filter(|(&fd, _)| fd > 2)
        .map(|(&fd, e)| (fd, e.host_fd))
        .collect();
    for (guest_fd, host_fd) in stale {
        let _ = nix::unistd::close(host_fd);
        let _ = uc.get_data_mut().fs.rm_file_entry(guest_fd);
    }
    for (guest_fd, saved) in ctx.files.iter() {
        if *guest_fd <= 2 {
            continue;
        }
        let mut entry = saved.clone();
        let host_fd = nix::fcntl::open(
            std::path::Path::new(&entry.path),
            OFlag::from_bits_truncate(entry.flags),
            Mode::from_bits_truncate(entry.mode),
        )
        .map_err(|_| ArionError::FileNotFound(entry.path.clone()))?;
        entry.host_fd = host_fd;
        if entry.saved_off > 0 {
            let _ = nix::unistd::lseek(host_fd, entry.saved_off, Whence::SeekSet);
        }
        uc.get_data_mut().fs.files.insert(*guest_fd, entry);
    }
    Ok(())
}

fn restore_sockets(uc: &mut ArionCpu, ctx: &ArionContext) {
    let stale: Vec<i32> = uc
        .get_data()
        .sock
        .sockets
        .values()
        .map(|s| s.host_fd)
        .collect();
    for host_fd in stale {
        unsafe {
            libc::shutdown(host_fd, libc::SHUT_RDWR);
            libc::close(host_fd);
        }
    }
    uc.get_data_mut().sock.sockets.clear();

    for (guest_fd, saved) in ctx.sockets.iter() {
        let mut entry = saved.clone();
        let host_fd = unsafe { libc::socket(entry.family, entry.type_, entry.protocol) };
        entry.host_fd = host_fd;
        if host_fd >= 0 && !entry.addr.is_empty() {
            let addr_ptr = entry.addr.as_ptr() as *const libc::sockaddr;
            let addr_len = entry.addr.len() as libc::socklen_t;
            unsafe {
                if entry.server {
                    libc::bind(host_fd, addr_ptr, addr_len);
                    if entry.server_listen {
                        libc::listen(host_fd, entry.backlog);
                    }
                } else {
                    libc::connect(host_fd, addr_ptr, addr_len);
                }
            }
        }
        uc.get_data_mut().sock.add_socket_entry(*guest_fd, entry);
    }
}

fn restore_threads_and_regs(uc: &mut ArionCpu, ctx: &ArionContext) -> Result<()> {
    {
        let state = uc.get_data_mut();
        threads::clear_threads(state);
        for thread in ctx.threads.iter() {
            state.threads.threads.insert(thread.tid, thread.clone());
        }
        for futex in ctx.futexes.iter() {
            threads::futex_wait(state, futex.tid, futex.addr, futex.bitmask)?;
        }
        state.threads.set_running_tid(ctx.running_tid);
    }

    let (regs, tls) = {
        let state = uc.get_data_mut();
        let thread = state.threads.thread_mut(ctx.running_tid)?;
        (thread.regs.take(), thread.tls)
    };
    if let Some(regs) = regs {
        abi::load_regs(uc, &regs)?;
    }

    // TLS restore is skipped in baremetal mode when the ARM trap page has
    // not been stood up.
    let skip_tls = {
        let state = uc.get_data();
        state.baremetal.is_some()
            && state.abi.table.arch == CpuArch::Arm
            && !state.mem.has_mapping_with_info("[arm_traps]")
    };
    if !skip_tls && tls != 0 {
        let ops = uc.get_data().abi.ops.clone();
        ops.load_tls(uc, tls)?;
    }
    Ok(())
}

/// Restores a snapshot. With `restore_mem`, every mapping is unmapped,
/// remapped and refilled from the saved bytes; without it the current
/// address space is left in place and only the structural state (threads,
/// futexes, registers, files, sockets) is rewound.
pub fn restore(uc: &mut ArionCpu, ctx: &ArionContext, restore_mem: bool) -> Result<()> {
    restore_files(uc, ctx)?;
    restore_sockets(uc, ctx);
    if restore_mem {
        memory::unmap_all(uc)?;
        for m in ctx.mappings.iter() {
            memory::map(uc, m.start, m.end - m.start, m.prot, &m.info)?;
            memory::write(uc, m.start, &m.data)?;
        }
    }
    restore_threads_and_regs(uc, ctx)
}

/// Delta restore: rewinds only the bytes recorded as touched since the
/// snapshot, leaving the rest of memory in place.
pub fn restore_delta(uc: &mut ArionCpu, ctx: &ArionContext, edits: &[MemEdit]) -> Result<()> {
    restore_files(uc, ctx)?;
    restore_sockets(uc, ctx);
    for edit in edits {
        if let Some(m) = ctx
            .mappings
            .iter()
            .find(|m| edit.addr >= m.start && edit.addr < m.end)
        {
            let off = (edit.addr - m.start) as usize;
            let len = edit.sz.min(m.data.len() - off);
            let data = m.data[off..off + len].to_vec();
            memory::write(uc, edit.addr, &data)?;
        }
    }
    restore_threads_and_regs(uc, ctx)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    path: &'a str,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(ArionError::TruncatedContextFile(self.path.to_string()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.bytes()?).into_owned())
    }
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
}

fn serialize_thread(t: &ArionThread) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&t.tid.to_le_bytes());
    out.extend_from_slice(&t.tgid.to_le_bytes());
    out.extend_from_slice(&t.exit_signal.to_le_bytes());
    out.extend_from_slice(&t.flags.to_le_bytes());
    out.extend_from_slice(&t.child_tid_addr.to_le_bytes());
    out.extend_from_slice(&t.parent_tid_addr.to_le_bytes());
    out.extend_from_slice(&t.tls.to_le_bytes());
    out.push(t.paused as u8);
    out.extend_from_slice(&t.wait_status_addr.to_le_bytes());
    out.extend_from_slice(&t.robust_list_head.to_le_bytes());
    out.extend_from_slice(&t.rseq_addr.to_le_bytes());
    out.extend_from_slice(&t.rseq_len.to_le_bytes());
    out.extend_from_slice(&t.rseq_sig.to_le_bytes());
    match &t.regs {
        Some(regs) => {
            out.extend_from_slice(&(regs.len() as u64).to_le_bytes());
            for (&reg, &val) in regs.iter() {
                out.extend_from_slice(&reg.to_le_bytes());
                out.extend_from_slice(&val.to_le_bytes());
            }
        }
        None => out.extend_from_slice(&0u64.to_le_bytes()),
    }
    out
}

fn deserialize_thread(data: &[u8], path: &str) -> Result<ArionThread> {
    let mut c = Cursor { data, pos: 0, path };
    let mut t = ArionThread::default();
    t.tid = c.i32()?;
    t.tgid = c.i32()?;
    t.exit_signal = c.i32()?;
    t.flags = c.u64()?;
    t.child_tid_addr = c.u64()?;
    t.parent_tid_addr = c.u64()?;
    t.tls = c.u64()?;
    t.paused = c.u8()? != 0;
    t.wait_status_addr = c.u64()?;
    t.robust_list_head = c.u64()?;
    t.rseq_addr = c.u64()?;
    t.rseq_len = c.u32()?;
    t.rseq_sig = c.u32()?;
    let regs_n = c.u64()?;
    if regs_n > 0 {
        let mut regs = abi::RegMap::new();
        for _ in 0..regs_n {
            let reg = c.i32()?;
            let val = c.u64()?;
            regs.insert(reg, val);
        }
        t.regs = Some(regs);
    }
    Ok(t)
}

fn serialize_futex(f: &FutexEntry) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&f.addr.to_le_bytes());
    out.extend_from_slice(&f.bitmask.to_le_bytes());
    out.extend_from_slice(&f.tid.to_le_bytes());
    out
}

fn deserialize_futex(data: &[u8], path: &str) -> Result<FutexEntry> {
    let mut c = Cursor { data, pos: 0, path };
    Ok(FutexEntry {
        addr: c.u64()?,
        bitmask: c.u32()?,
        tid: c.i32()?,
    })
}

fn serialize_mapping(m: &SavedMapping) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&m.start.to_le_bytes());
    out.extend_from_slice(&m.end.to_le_bytes());
    out.extend_from_slice(&m.prot.bits().to_le_bytes());
    put_bytes(&mut out, m.info.as_bytes());
    out.extend_from_slice(&m.data);
    out
}

fn deserialize_mapping(data: &[u8], path: &str) -> Result<SavedMapping> {
    let mut c = Cursor { data, pos: 0, path };
    let start = c.u64()?;
    let end = c.u64()?;
    let prot = Prot::from_bits_truncate(c.u32()?);
    let info = c.string()?;
    let contents = c.take((end - start) as usize)?.to_vec();
    Ok(SavedMapping {
        start,
        end,
        prot,
        info,
        data: contents,
    })
}

fn serialize_file(guest_fd: i32, f: &FileEntry) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&guest_fd.to_le_bytes());
    put_bytes(&mut out, f.path.as_bytes());
    out.extend_from_slice(&f.flags.to_le_bytes());
    out.extend_from_slice(&f.mode.to_le_bytes());
    out.push(f.blocking as u8);
    out.extend_from_slice(&f.saved_off.to_le_bytes());
    out
}

fn deserialize_file(data: &[u8], path: &str) -> Result<(i32, FileEntry)> {
    let mut c = Cursor { data, pos: 0, path };
    let guest_fd = c.i32()?;
    let fpath = c.string()?;
    let flags = c.i32()?;
    let mode = c.u32()?;
    let blocking = c.u8()? != 0;
    let saved_off = c.i64()?;
    let mut entry = FileEntry::new(-1, fpath, flags, mode);
    entry.blocking = blocking;
    entry.saved_off = saved_off;
    Ok((guest_fd, entry))
}

fn serialize_socket(guest_fd: i32, s: &SocketEntry) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&guest_fd.to_le_bytes());
    out.extend_from_slice(&s.family.to_le_bytes());
    out.extend_from_slice(&s.type_.to_le_bytes());
    out.extend_from_slice(&s.protocol.to_le_bytes());
    put_bytes(&mut out, s.ip.as_bytes());
    out.extend_from_slice(&s.port.to_le_bytes());
    put_bytes(&mut out, s.path.as_bytes());
    out.push(s.server as u8);
    out.push(s.server_listen as u8);
    out.extend_from_slice(&s.backlog.to_le_bytes());
    out.push(s.blocking as u8);
    put_bytes(&mut out, &s.addr);
    out
}

fn deserialize_socket(data: &[u8], path: &str) -> Result<(i32, SocketEntry)> {
    let mut c = Cursor { data, pos: 0, path };
    let guest_fd = c.i32()?;
    let family = c.i32()?;
    let type_ = c.i32()?;
    let protocol = c.i32()?;
    let mut entry = SocketEntry::new(-1, family, type_, protocol);
    entry.ip = c.string()?;
    entry.port = c.u16()?;
    entry.path = c.string()?;
    entry.server = c.u8()? != 0;
    entry.server_listen = c.u8()? != 0;
    entry.backlog = c.i32()?;
    entry.blocking = c.u8()? != 0;
    entry.addr = c.bytes()?;
    Ok((guest_fd, entry))
}

fn write_section(out: &mut Vec<u8>, blobs: Vec<Vec<u8>>) {
    out.extend_from_slice(&(blobs.len() as u64).to_le_bytes());
    for blob in blobs {
        put_bytes(out, &blob);
    }
}

/// Serializes a fresh snapshot to `path`.
pub fn save_to_file(uc: &mut ArionCpu, path: &str) -> Result<()> {
    let ctx = save(uc)?;
    let mut out = Vec::new();
    out.extend_from_slice(CONTEXT_FILE_MAGIC);
    out.extend_from_slice(&CONTEXT_FILE_VERSION.to_le_bytes());
    out.extend_from_slice(&ctx.running_tid.to_le_bytes());
    write_section(&mut out, ctx.threads.iter().map(serialize_thread).collect());
    write_section(&mut out, ctx.futexes.iter().map(serialize_futex).collect());
    write_section(&mut out, ctx.mappings.iter().map(serialize_mapping).collect());
    write_section(
        &mut out,
        ctx.files.iter().map(|(fd, f)| serialize_file(*fd, f)).collect(),
    );
    write_section(
        &mut out,
        ctx.sockets
            .iter()
            .map(|(fd, s)| serialize_socket(*fd, s))
            .collect(),
    );

    let mut file =
        File::create(path).map_err(|e| ArionError::FileOpen(path.to_string(), e))?;
    file.write_all(&out)?;
    Ok(())
}

/// Parses a context file. Files written by a newer major version are
/// refused.
pub fn load_from_file(path: &str) -> Result<ArionContext> {
    let mut data = Vec::new();
    File::open(path)
        .map_err(|e| ArionError::FileOpen(path.to_string(), e))?
        .read_to_end(&mut data)?;
    let mut c = Cursor {
        data: &data,
        pos: 0,
        path,
    };

    if c.take(8)? != CONTEXT_FILE_MAGIC {
        return Err(ArionError::WrongContextFileMagic(path.to_string()));
    }
    let ver_bytes = c.take(4)?;
    let version = f32::from_le_bytes([ver_bytes[0], ver_bytes[1], ver_bytes[2], ver_bytes[3]]);
    if version.trunc() > CONTEXT_FILE_VERSION.trunc() {
        return Err(ArionError::NewerContextFileVersion(path.to_string()));
    }
    let running_tid = c.i32()?;

    let mut ctx = ArionContext {
        running_tid,
        threads: Vec::new(),
        futexes: Vec::new(),
        mappings: Vec::new(),
        files: Vec::new(),
        sockets: Vec::new(),
    };

    let count = c.u64()?;
    for _ in 0..count {
        let blob = c.bytes()?;
        ctx.threads.push(deserialize_thread(&blob, path)?);
    }
    let count = c.u64()?;
    for _ in 0..count {
        let blob = c.bytes()?;
        ctx.futexes.push(deserialize_futex(&blob, path)?);
    }
    let count = c.u64()?;
    for _ in 0..count {
        let blob = c.bytes()?;
        ctx.mappings.push(deserialize_mapping(&blob, path)?);
    }
    let count = c.u64()?;
    for _ in 0..count {
        let blob = c.bytes()?;
        ctx.files.push(deserialize_file(&blob, path)?);
    }
    let count = c.u64()?;
    for _ in 0..count {
        let blob = c.bytes()?;
        ctx.sockets.push(deserialize_socket(&blob, path)?);
    }
    Ok(ctx)
}

/// Restores this process from a context file written by `save_to_file`.
pub fn restore_from_file(uc: &mut ArionCpu, path: &str) -> Result<()> {
    let ctx = load_from_file(path)?;
    restore(uc, &ctx, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_blob_round_trips() {
        let mut t = ArionThread::new(17, 0x11300, 0x1000, 0x2000, None);
        t.tid = 4;
        t.tgid = 9;
        t.tls = 0xdead_0000;
        t.paused = true;
        let mut regs = abi::RegMap::new();
        regs.insert(35, 0x4141_4141);
        regs.insert(44, 0x7fff_0000);
        t.regs = Some(regs.clone());

        let blob = serialize_thread(&t);
        let back = deserialize_thread(&blob, "test").unwrap();
        assert_eq!(back.tid, 4);
        assert_eq!(back.tgid, 9);
        assert_eq!(back.exit_signal, 17);
        assert_eq!(back.flags, 0x11300);
        assert_eq!(back.tls, 0xdead_0000);
        assert!(back.paused);
        assert_eq!(back.regs.unwrap(), regs);
    }

    #[test]
    fn mapping_blob_round_trips() {
        let m = SavedMapping {
            start: 0x1000,
            end: 0x3000,
            prot: Prot::READ | Prot::EXEC,
            info: "/lib/libc.so.6".to_string(),
            data: vec![0xAB; 0x2000],
        };
        let blob = serialize_mapping(&m);
        let back = deserialize_mapping(&blob, "test").unwrap();
        assert_eq!(back.start, m.start);
        assert_eq!(back.end, m.end);
        assert_eq!(back.prot, m.prot);
        assert_eq!(back.info, m.info);
        assert_eq!(back.data, m.data);
    }

    #[test]
    fn socket_blob_round_trips() {
        let mut s = SocketEntry::new(7, libc::AF_INET, libc::SOCK_STREAM, 0);
        s.ip = "127.0.0.1".to_string();
        s.port = 8080;
        s.server = true;
        s.server_listen = true;
        s.backlog = 16;
        s.addr = vec![2, 0, 0x1F, 0x90, 127, 0, 0, 1];
        let blob = serialize_socket(3, &s);
        let (fd, back) = deserialize_socket(&blob, "test").unwrap();
        assert_eq!(fd, 3);
        assert_eq!(back.ip, s.ip);
        assert_eq!(back.port, s.port);
        assert!(back.server && back.server_listen);
        assert_eq!(back.addr, s.addr);
    }

    #[test]
    fn newer_major_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.bin");
        let mut data = Vec::new();
        data.extend_from_slice(CONTEXT_FILE_MAGIC);
        data.extend_from_slice(&2.0f32.to_le_bytes());
        data.extend_from_slice(&1i32.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        match load_from_file(path.to_str().unwrap()) {
            Err(ArionError::NewerContextFileVersion(_)) => {}
            other => panic!("expected version refusal, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn wrong_magic_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.bin");
        std::fs::write(&path, b"NOTARION________").unwrap();
        match load_from_file(path.to_str().unwrap()) {
            Err(ArionError::WrongContextFileMagic(_)) => {}
            other => panic!("expected magic refusal, got {:?}", other.map(|_| ())),
        }
    }
}
