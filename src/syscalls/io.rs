//! File and fd syscall handlers. All paths go through the sandbox rewrite;
//! all potentially blocking operations honor the `thread_blocking_io`
//! configuration by probing the host fd and yielding the quantum instead
//! of blocking the whole group.

use std::ffi::CString;

use nix::fcntl::OFlag;
use nix::poll::PollFlags;
use nix::sys::stat::Mode;
use nix::unistd::Whence;

use crate::errors::Result;
use crate::fs::{self, FileEntry};
use crate::kernel::AT_FDCWD;
use crate::memory;
use crate::process::ArionCpu;
use crate::structs::{self, StructFactory};
use crate::syscalls::{err, fd_ready, host_fd_of, path_arg, val, SysRet};
use crate::Addr;

fn nix_errno(e: nix::Error) -> i32 {
    e.as_errno().map(|e| e as i32).unwrap_or(libc::EIO)
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn cstr(path: &str) -> CString {
    CString::new(path).unwrap_or_default()
}

/// Resolves an `*at` path argument against its directory fd.
fn path_at(uc: &ArionCpu, dfd: u64, path_addr: Addr) -> Result<String> {
    let file_name = memory::read_c_string(uc, path_addr)?;
    if dfd as i64 != AT_FDCWD && !file_name.starts_with('/') {
        let dir_path = match uc.get_data().fs.file_entry(dfd as i32) {
            Ok(entry) => entry.path.clone(),
            Err(_) => return Ok(String::new()),
        };
        return Ok(fs::to_fs_path(uc, &format!("{}/{}", dir_path, file_name)));
    }
    Ok(fs::to_fs_path(uc, &file_name))
}

fn blocking_io(uc: &ArionCpu) -> bool {
    uc.get_data().config.thread_blocking_io
}

pub fn sys_read(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let buf_addr = args[1];
    let count = args[2] as usize;

    let (host_fd, blocking, _) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLIN | PollFlags::POLLPRI) {
        return Ok(SysRet::Cancel);
    }

    let mut buf = vec![0u8; count];
    match nix::unistd::read(host_fd, &mut buf) {
        Ok(n) => {
            memory::write(uc, buf_addr, &buf[..n])?;
            val(n as u64)
        }
        Err(e) => err(nix_errno(e)),
    }
}

pub fn sys_write(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let buf_addr = args[1];
    let count = args[2] as usize;

    let (host_fd, blocking, _) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLOUT) {
        return Ok(SysRet::Cancel);
    }

    let buf = memory::read(uc, buf_addr, count)?;
    match nix::unistd::write(host_fd, &buf) {
        Ok(n) => val(n as u64),
        Err(e) => err(nix_errno(e)),
    }
}

fn do_open(uc: &mut ArionCpu, path: String, flags: u64, mode: u64) -> Result<SysRet> {
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let oflag = OFlag::from_bits_truncate(flags as i32);
    match nix::fcntl::open(
        std::path::Path::new(&path),
        oflag,
        Mode::from_bits_truncate(mode as u32),
    ) {
        Ok(host_fd) => {
            let mut entry = FileEntry::new(host_fd, path, flags as i32, mode as u32);
            entry.blocking = !oflag.contains(OFlag::O_NONBLOCK);
            fs::add_file_entry(uc.get_data_mut(), host_fd, entry, false)?;
            val(host_fd as u64)
        }
        Err(e) => err(nix_errno(e)),
    }
}

pub fn sys_open(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_open(uc, path, args[1], args[2])
}

pub fn sys_openat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_at(uc, args[0], args[1])?;
    do_open(uc, path, args[2], args[3])
}

pub fn sys_close(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    if fd <= 2 {
        return val(0);
    }
    let state = uc.get_data_mut();
    if let Ok(entry) = state.fs.rm_file_entry(fd) {
        let _ = nix::unistd::close(entry.host_fd);
        return val(0);
    }
    if let Ok(entry) = state.sock.rm_socket_entry(fd) {
        let _ = nix::unistd::close(entry.host_fd);
        return val(0);
    }
    err(libc::EBADF)
}

pub fn sys_lseek(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let off = args[1] as i64;
    let whence = match args[2] as i32 {
        0 => Whence::SeekSet,
        1 => Whence::SeekCur,
        2 => Whence::SeekEnd,
        _ => return err(libc::EINVAL),
    };
    let (host_fd, _, _) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    match nix::unistd::lseek(host_fd, off, whence) {
        Ok(new_off) => val(new_off as u64),
        Err(e) => err(nix_errno(e)),
    }
}

pub fn sys_llseek(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let off = ((args[1] << 32) | (args[2] & 0xFFFF_FFFF)) as i64;
    let result_addr = args[3];
    let whence = args[4];

    match sys_lseek(uc, &[fd as u64, off as u64, whence])? {
        SysRet::Val(v) if (v as i64) >= 0 => {
            memory::write_val(uc, result_addr, v, 8)?;
            val(0)
        }
        other => Ok(other),
    }
}

pub fn sys_pread64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let buf_addr = args[1];
    let count = args[2] as usize;
    let off = args[3] as i64;

    let (host_fd, _, _) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let mut buf = vec![0u8; count];
    match nix::sys::uio::pread(host_fd, &mut buf, off) {
        Ok(n) => {
            memory::write(uc, buf_addr, &buf[..n])?;
            val(n as u64)
        }
        Err(e) => err(nix_errno(e)),
    }
}

pub fn sys_pwrite64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let buf_addr = args[1];
    let count = args[2] as usize;
    let off = args[3] as i64;

    let (host_fd, _, _) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let buf = memory::read(uc, buf_addr, count)?;
    match nix::sys::uio::pwrite(host_fd, &buf, off) {
        Ok(n) => val(n as u64),
        Err(e) => err(nix_errno(e)),
    }
}

/// Reads a guest iovec array into (base, len) pairs.
fn read_iovecs(uc: &ArionCpu, iov_addr: Addr, iovcnt: usize) -> Result<Vec<(Addr, u64)>> {
    let table = uc.get_data().abi.table;
    let iov_sz = structs::IOVEC.size(table) as u64;
    let mut iovecs = Vec::with_capacity(iovcnt);
    for i in 0..iovcnt {
        let fields = structs::IOVEC.build(uc, iov_addr + i as u64 * iov_sz)?;
        iovecs.push((
            structs::field(&fields, "iov_base")?,
            structs::field(&fields, "iov_len")?,
        ));
    }
    Ok(iovecs)
}

pub fn sys_readv(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, blocking, _) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLIN | PollFlags::POLLPRI) {
        return Ok(SysRet::Cancel);
    }

    let iovecs = read_iovecs(uc, args[1], args[2] as usize)?;
    let mut total = 0u64;
    for (base, len) in iovecs {
        let mut buf = vec![0u8; len as usize];
        match nix::unistd::read(host_fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                memory::write(uc, base, &buf[..n])?;
                total += n as u64;
                if (n as u64) < len {
                    break;
                }
            }
            Err(e) => {
                if total == 0 {
                    return err(nix_errno(e));
                }
                break;
            }
        }
    }
    val(total)
}

pub fn sys_writev(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, blocking, _) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLOUT) {
        return Ok(SysRet::Cancel);
    }

    let iovecs = read_iovecs(uc, args[1], args[2] as usize)?;
    let mut total = 0u64;
    for (base, len) in iovecs {
        if len == 0 {
            continue;
        }
        let buf = memory::read(uc, base, len as usize)?;
        match nix::unistd::write(host_fd, &buf) {
            Ok(n) => {
                total += n as u64;
                if (n as u64) < len {
                    break;
                }
            }
            Err(e) => {
                if total == 0 {
                    return err(nix_errno(e));
                }
                break;
            }
        }
    }
    val(total)
}

fn do_access(path: String, mode: u64) -> Result<SysRet> {
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::access(cstr(&path).as_ptr(), mode as i32) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_access(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_access(path, args[1])
}

pub fn sys_faccessat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_at(uc, args[0], args[1])?;
    do_access(path, args[2])
}

pub fn sys_dup(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let entry = match uc.get_data().fs.file_entry(fd) {
        Ok(e) => e.clone(),
        Err(_) => return err(libc::EBADF),
    };
    match nix::unistd::dup(entry.host_fd) {
        Ok(new_fd) => {
            let mut new_entry = entry;
            new_entry.host_fd = new_fd;
            fs::add_file_entry(uc.get_data_mut(), new_fd, new_entry, false)?;
            val(new_fd as u64)
        }
        Err(e) => err(nix_errno(e)),
    }
}

fn do_dup2(uc: &mut ArionCpu, old_fd: i32, new_fd: i32) -> Result<SysRet> {
    let entry = match uc.get_data().fs.file_entry(old_fd) {
        Ok(e) => e.clone(),
        Err(_) => return err(libc::EBADF),
    };
    match nix::unistd::dup2(entry.host_fd, new_fd) {
        Ok(host_fd) => {
            let mut new_entry = entry;
            new_entry.host_fd = host_fd;
            fs::add_file_entry(uc.get_data_mut(), new_fd, new_entry, false)?;
            val(new_fd as u64)
        }
        Err(e) => err(nix_errno(e)),
    }
}

pub fn sys_dup2(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_dup2(uc, args[0] as i32, args[1] as i32)
}

pub fn sys_dup3(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    if args[0] == args[1] {
        return err(libc::EINVAL);
    }
    do_dup2(uc, args[0] as i32, args[1] as i32)
}

fn do_pipe(uc: &mut ArionCpu, fds_addr: Addr, flags: u64) -> Result<SysRet> {
    match nix::unistd::pipe() {
        Ok((read_fd, write_fd)) => {
            let blocking = flags & libc::O_NONBLOCK as u64 == 0;
            for (host_fd, oflag) in [(read_fd, libc::O_RDONLY), (write_fd, libc::O_WRONLY)].iter() {
                let mut entry =
                    FileEntry::new(*host_fd, "[pipe]".to_string(), *oflag | flags as i32, 0);
                entry.blocking = blocking;
                fs::add_file_entry(uc.get_data_mut(), *host_fd, entry, false)?;
            }
            memory::write_val(uc, fds_addr, read_fd as u64, 4)?;
            memory::write_val(uc, fds_addr + 4, write_fd as u64, 4)?;
            val(0)
        }
        Err(e) => err(nix_errno(e)),
    }
}

pub fn sys_pipe(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_pipe(uc, args[0], 0)
}

pub fn sys_pipe2(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_pipe(uc, args[0], args[1])
}

pub fn sys_fcntl(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let cmd = args[1] as i32;
    let arg = args[2];

    let (host_fd, _, is_file) = match host_fd_of(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    match cmd {
        libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => {
            if !is_file {
                return err(libc::EBADF);
            }
            sys_dup(uc, &[fd as u64])
        }
        libc::F_GETFD | libc::F_SETFD => val(0),
        libc::F_GETFL => {
            let ret = unsafe { libc::fcntl(host_fd, libc::F_GETFL) };
            if ret < 0 {
                err(last_errno())
            } else {
                val(ret as u64)
            }
        }
        libc::F_SETFL => {
            let blocking = arg & libc::O_NONBLOCK as u64 == 0;
            {
                let state = uc.get_data_mut();
                if is_file {
                    state.fs.file_entry_mut(fd)?.blocking = blocking;
                } else {
                    state.sock.socket_entry_mut(fd)?.blocking = blocking;
                }
            }
            let ret = unsafe { libc::fcntl(host_fd, libc::F_SETFL, arg as i32) };
            if ret < 0 {
                err(last_errno())
            } else {
                val(0)
            }
        }
        _ => val(0),
    }
}

pub fn sys_ioctl(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let request = args[1];
    let argp = args[2];

    if host_fd_of(uc, fd).is_none() {
        return err(libc::EBADF);
    }
    const TIOCGWINSZ: u64 = 0x5413;
    if request == TIOCGWINSZ {
        // rows, cols, xpixel, ypixel
        for (i, v) in [24u64, 80, 0, 0].iter().enumerate() {
            memory::write_val(uc, argp + 2 * i as u64, *v, 2)?;
        }
        return val(0);
    }
    err(libc::ENOTTY)
}

pub fn sys_truncate(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::truncate(cstr(&path).as_ptr(), args[1] as i64) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_ftruncate(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _, _) = match host_fd_of(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let ret = unsafe { libc::ftruncate(host_fd, args[1] as i64) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_getcwd(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let buf_addr = args[0];
    let buf_sz = args[1] as usize;

    // Present the cwd as the guest sees it: relative to the sandbox root.
    let guest_cwd = {
        let state = uc.get_data();
        let cwd = state.fs.cwd_path();
        let root = state.fs.fs_path();
        let stripped = cwd.strip_prefix(root.trim_end_matches('/')).unwrap_or(cwd);
        let mut s = stripped.trim_end_matches('/').to_string();
        if !s.starts_with('/') {
            s.insert(0, '/');
        }
        s
    };
    if guest_cwd.len() + 1 > buf_sz {
        return err(libc::ERANGE);
    }
    memory::write_string(uc, buf_addr, &guest_cwd)?;
    val(guest_cwd.len() as u64 + 1)
}

pub fn sys_chdir(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    if path.is_empty() {
        return err(libc::EACCES);
    }
    if !std::path::Path::new(&path).is_dir() {
        return err(libc::ENOTDIR);
    }
    uc.get_data_mut().fs.set_cwd_path(&path);
    val(0)
}

pub fn sys_fchdir(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = match uc.get_data().fs.file_entry(args[0] as i32) {
        Ok(entry) => entry.path.clone(),
        Err(_) => return err(libc::EBADF),
    };
    uc.get_data_mut().fs.set_cwd_path(&path);
    val(0)
}

pub fn sys_rename(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let old = path_arg(uc, args[0])?;
    let new = path_arg(uc, args[1])?;
    if old.is_empty() || new.is_empty() {
        return err(libc::EACCES);
    }
    match std::fs::rename(&old, &new) {
        Ok(()) => val(0),
        Err(e) => err(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

pub fn sys_renameat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let old = path_at(uc, args[0], args[1])?;
    let new = path_at(uc, args[2], args[3])?;
    if old.is_empty() || new.is_empty() {
        return err(libc::EACCES);
    }
    match std::fs::rename(&old, &new) {
        Ok(()) => val(0),
        Err(e) => err(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

fn do_mkdir(path: String, mode: u64) -> Result<SysRet> {
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::mkdir(cstr(&path).as_ptr(), mode as libc::mode_t) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_mkdir(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_mkdir(path, args[1])
}

pub fn sys_mkdirat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_at(uc, args[0], args[1])?;
    do_mkdir(path, args[2])
}

pub fn sys_rmdir(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::rmdir(cstr(&path).as_ptr()) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_link(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let old = path_arg(uc, args[0])?;
    let new = path_arg(uc, args[1])?;
    if old.is_empty() || new.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::link(cstr(&old).as_ptr(), cstr(&new).as_ptr()) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

fn do_unlink(path: String, flags: u64) -> Result<SysRet> {
    if path.is_empty() {
        return err(libc::EACCES);
    }
    const AT_REMOVEDIR: u64 = 0x200;
    let ret = if flags & AT_REMOVEDIR != 0 {
        unsafe { libc::rmdir(cstr(&path).as_ptr()) }
    } else {
        unsafe { libc::unlink(cstr(&path).as_ptr()) }
    };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_unlink(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_unlink(path, 0)
}

pub fn sys_unlinkat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_at(uc, args[0], args[1])?;
    do_unlink(path, args[2])
}

pub fn sys_symlink(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let target = memory::read_c_string(uc, args[0])?;
    let link = path_arg(uc, args[1])?;
    if link.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::symlink(cstr(&target).as_ptr(), cstr(&link).as_ptr()) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

fn do_readlink(uc: &mut ArionCpu, path: String, buf_addr: Addr, buf_sz: usize) -> Result<SysRet> {
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let mut buf = vec![0u8; buf_sz];
    let n = unsafe {
        libc::readlink(
            cstr(&path).as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf_sz,
        )
    };
    if n < 0 {
        return err(last_errno());
    }
    memory::write(uc, buf_addr, &buf[..n as usize])?;
    val(n as u64)
}

pub fn sys_readlink(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_readlink(uc, path, args[1], args[2] as usize)
}

pub fn sys_readlinkat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_at(uc, args[0], args[1])?;
    do_readlink(uc, path, args[2], args[3] as usize)
}

pub fn sys_chmod(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::chmod(cstr(&path).as_ptr(), args[1] as libc::mode_t) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_fchmod(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _, _) = match host_fd_of(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let ret = unsafe { libc::fchmod(host_fd, args[1] as libc::mode_t) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_fchmodat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_at(uc, args[0], args[1])?;
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let ret = unsafe { libc::chmod(cstr(&path).as_ptr(), args[2] as libc::mode_t) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

/// Guest `struct pollfd` is identical on every supported target.
fn do_poll(uc: &mut ArionCpu, fds_addr: Addr, nfds: usize, timeout_ms: i32) -> Result<SysRet> {
    let mut host_fds = Vec::with_capacity(nfds);
    for i in 0..nfds {
        let base = fds_addr + i as u64 * 8;
        let guest_fd = memory::read_val(uc, base, 4)? as i32;
        let events = memory::read_val(uc, base + 4, 2)? as i16;
        let host_fd = host_fd_of(uc, guest_fd).map(|(fd, _, _)| fd).unwrap_or(-1);
        host_fds.push(nix::poll::PollFd::new(
            host_fd,
            PollFlags::from_bits_truncate(events),
        ));
    }

    // Timeouts are clamped to zero when handlers must not block.
    let timeout = if blocking_io(uc) { timeout_ms } else { 0 };
    let ready = match nix::poll::poll(&mut host_fds, timeout) {
        Ok(n) => n,
        Err(e) => return err(nix_errno(e)),
    };
    for (i, pfd) in host_fds.iter().enumerate() {
        let revents = pfd.revents().map(|r| r.bits()).unwrap_or(0);
        memory::write_val(uc, fds_addr + i as u64 * 8 + 6, revents as u64, 2)?;
    }
    val(ready as u64)
}

pub fn sys_poll(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_poll(uc, args[0], args[1] as usize, args[2] as i32)
}

pub fn sys_ppoll(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let timeout_ms = if args[2] == 0 {
        -1
    } else {
        let fields = structs::TIMESPEC.build(uc, args[2])?;
        let sec = structs::field(&fields, "tv_sec")?;
        let nsec = structs::field(&fields, "tv_nsec")?;
        (sec * 1000 + nsec / 1_000_000) as i32
    };
    do_poll(uc, args[0], args[1] as usize, timeout_ms)
}

pub fn sys_select(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    // Treated as an expired timeout; select users re-poll.
    val(0)
}

pub fn sys_pselect6(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    val(0)
}

pub fn sys_getdents64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _, _) = match host_fd_of(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let count = args[2] as usize;
    let mut buf = vec![0u8; count];
    let n = unsafe {
        libc::syscall(
            libc::SYS_getdents64,
            host_fd,
            buf.as_mut_ptr(),
            count,
        )
    };
    if n < 0 {
        return err(last_errno());
    }
    memory::write(uc, args[1], &buf[..n as usize])?;
    val(n as u64)
}

pub fn sys_getdents(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    err(libc::ENOSYS)
}

fn empty_stat() -> libc::stat {
    unsafe { std::mem::zeroed() }
}

fn host_stat(path: &str, follow: bool) -> std::result::Result<libc::stat, i32> {
    let mut st = empty_stat();
    let ret = unsafe {
        if follow {
            libc::stat(cstr(path).as_ptr(), &mut st)
        } else {
            libc::lstat(cstr(path).as_ptr(), &mut st)
        }
    };
    if ret < 0 {
        Err(last_errno())
    } else {
        Ok(st)
    }
}

fn host_fstat(fd: i32) -> std::result::Result<libc::stat, i32> {
    let mut st = empty_stat();
    let ret = unsafe { libc::fstat(fd, &mut st) };
    if ret < 0 {
        Err(last_errno())
    } else {
        Ok(st)
    }
}

/// Serializes a host stat into the guest's layout: `struct stat` for
/// 64-bit targets and the plain 32-bit stat, `struct stat64` for the
/// wide 32-bit variants.
fn write_stat(uc: &mut ArionCpu, addr: Addr, st: &libc::stat, wide: bool) -> Result<()> {
    let factory: &StructFactory = if uc.get_data().abi.table.arch_sz == 32 && wide {
        &structs::STAT64
    } else {
        &structs::STAT
    };
    factory.feed(
        uc,
        addr,
        &[
            ("st_dev", st.st_dev as u64),
            ("st_ino", st.st_ino as u64),
            ("__st_ino", st.st_ino as u64),
            ("st_mode", st.st_mode as u64),
            ("st_nlink", st.st_nlink as u64),
            ("st_uid", st.st_uid as u64),
            ("st_gid", st.st_gid as u64),
            ("st_rdev", st.st_rdev as u64),
            ("st_size", st.st_size as u64),
            ("st_blksize", st.st_blksize as u64),
            ("st_blocks", st.st_blocks as u64),
            ("st_atime", st.st_atime as u64),
            ("st_atime_ns", st.st_atime_nsec as u64),
            ("st_mtime", st.st_mtime as u64),
            ("st_mtime_ns", st.st_mtime_nsec as u64),
            ("st_ctime", st.st_ctime as u64),
            ("st_ctime_ns", st.st_ctime_nsec as u64),
        ],
    )
}

fn do_stat_path(uc: &mut ArionCpu, path: String, addr: Addr, follow: bool, wide: bool) -> Result<SysRet> {
    if path.is_empty() {
        return err(libc::EACCES);
    }
    match host_stat(&path, follow) {
        Ok(st) => {
            write_stat(uc, addr, &st, wide)?;
            val(0)
        }
        Err(errno) => err(errno),
    }
}

pub fn sys_newstat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_stat_path(uc, path, args[1], true, false)
}

pub fn sys_newlstat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_stat_path(uc, path, args[1], false, false)
}

pub fn sys_newfstat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _, _) = match host_fd_of(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    match host_fstat(host_fd) {
        Ok(st) => {
            write_stat(uc, args[1], &st, false)?;
            val(0)
        }
        Err(errno) => err(errno),
    }
}

pub fn sys_stat64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_stat_path(uc, path, args[1], true, true)
}

pub fn sys_lstat64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let path = path_arg(uc, args[0])?;
    do_stat_path(uc, path, args[1], false, true)
}

pub fn sys_fstat64(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _, _) = match host_fd_of(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    match host_fstat(host_fd) {
        Ok(st) => {
            write_stat(uc, args[1], &st, true)?;
            val(0)
        }
        Err(errno) => err(errno),
    }
}

pub fn sys_newfstatat(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    const AT_EMPTY_PATH: u64 = 0x1000;
    const AT_SYMLINK_NOFOLLOW: u64 = 0x100;
    let flags = args[3];

    if flags & AT_EMPTY_PATH != 0 {
        return match host_fd_of(uc, args[0] as i32) {
            Some((host_fd, _, _)) => match host_fstat(host_fd) {
                Ok(st) => {
                    write_stat(uc, args[2], &st, true)?;
                    val(0)
                }
                Err(errno) => err(errno),
            },
            None => err(libc::EBADF),
        };
    }
    let path = path_at(uc, args[0], args[1])?;
    do_stat_path(uc, path, args[2], flags & AT_SYMLINK_NOFOLLOW == 0, true)
}

pub fn sys_statx(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    const STATX_BASIC_STATS: u64 = 0x7FF;
    let path = path_at(uc, args[0], args[1])?;
    if path.is_empty() {
        return err(libc::EACCES);
    }
    let st = match host_stat(&path, true) {
        Ok(st) => st,
        Err(errno) => return err(errno),
    };
    structs::STATX.feed(
        uc,
        args[4],
        &[
            ("stx_mask", STATX_BASIC_STATS),
            ("stx_blksize", st.st_blksize as u64),
            ("stx_nlink", st.st_nlink as u64),
            ("stx_uid", st.st_uid as u64),
            ("stx_gid", st.st_gid as u64),
            ("stx_mode", st.st_mode as u64),
            ("stx_ino", st.st_ino as u64),
            ("stx_size", st.st_size as u64),
            ("stx_blocks", st.st_blocks as u64),
            ("stx_atime_sec", st.st_atime as u64),
            ("stx_atime_nsec", st.st_atime_nsec as u64),
            ("stx_ctime_sec", st.st_ctime as u64),
            ("stx_ctime_nsec", st.st_ctime_nsec as u64),
            ("stx_mtime_sec", st.st_mtime as u64),
            ("stx_mtime_nsec", st.st_mtime_nsec as u64),
        ],
    )?;
    val(0)
}

pub fn sys_statfs(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let sz = if uc.get_data().abi.table.arch_sz == 64 { 120 } else { 64 };
    memory::write(uc, args[1], &vec![0u8; sz])?;
    val(0)
}

pub fn sys_fstatfs(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    sys_statfs(uc, args)
}

pub fn sys_sync(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    unsafe { libc::sync() };
    val(0)
}

pub fn sys_fsync(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _, _) = match host_fd_of(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    match nix::unistd::fsync(host_fd) {
        Ok(()) => val(0),
        Err(e) => err(nix_errno(e)),
    }
}

pub fn sys_getxattr(_uc: &mut ArionCpu, _args: &[u64]) -> Result<SysRet> {
    err(libc::ENODATA)
}

#[cfg(test)]
mod tests {
    use crate::syscalls::neg_errno;

    #[test]
    fn neg_errno_follows_kernel_convention() {
        assert_eq!(neg_errno(libc::EBADF) as i64, -(libc::EBADF as i64));
        assert_eq!(neg_errno(libc::ENOSYS) as i64, -38);
    }
}
