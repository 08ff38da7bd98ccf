//! Socket syscall handlers. Guest sockaddr layouts match the host's, so
//! address blobs pass through raw; unix-domain paths are rewritten into
//! the sandbox first.

use nix::poll::PollFlags;

use crate::errors::Result;
use crate::fs;
use crate::memory;
use crate::process::ArionCpu;
use crate::socket::SocketEntry;
use crate::structs;
use crate::syscalls::{err, fd_ready, host_fd_of, val, SysRet};
use crate::Addr;

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn blocking_io(uc: &ArionCpu) -> bool {
    uc.get_data().config.thread_blocking_io
}

fn sock_host_fd(uc: &ArionCpu, fd: i32) -> Option<(i32, bool)> {
    uc.get_data()
        .sock
        .socket_entry(fd)
        .ok()
        .map(|s| (s.host_fd, s.blocking))
}

/// Reads a guest sockaddr, rewriting unix paths into the sandbox.
fn read_sockaddr(uc: &ArionCpu, addr: Addr, len: usize) -> Result<Vec<u8>> {
    let mut raw = memory::read(uc, addr, len.min(128))?;
    if raw.len() >= 2 {
        let family = u16::from_le_bytes([raw[0], raw[1]]) as i32;
        if family == libc::AF_UNIX && raw.len() > 2 {
            let is_abstract = raw[2] == 0;
            let path_start = 2 + is_abstract as usize;
            let path_end = raw[path_start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| path_start + p)
                .unwrap_or(raw.len());
            let guest_path = String::from_utf8_lossy(&raw[path_start..path_end]).into_owned();
            let host_path = fs::to_fs_path(uc, &guest_path);
            let mut rewritten = raw[..path_start].to_vec();
            rewritten.extend_from_slice(host_path.as_bytes());
            rewritten.push(0);
            raw = rewritten;
        }
    }
    Ok(raw)
}

fn remember_addr(entry: &mut SocketEntry, raw: &[u8]) {
    entry.addr = raw.to_vec();
    if raw.len() >= 2 {
        let family = u16::from_le_bytes([raw[0], raw[1]]) as i32;
        match family {
            libc::AF_INET if raw.len() >= 8 => {
                entry.port = u16::from_be_bytes([raw[2], raw[3]]);
                entry.ip = format!("{}.{}.{}.{}", raw[4], raw[5], raw[6], raw[7]);
            }
            libc::AF_UNIX => {
                let start = 2 + (raw.get(2) == Some(&0)) as usize;
                let end = raw[start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| start + p)
                    .unwrap_or(raw.len());
                entry.path = String::from_utf8_lossy(&raw[start..end]).into_owned();
            }
            _ => {}
        }
    }
}

pub fn sys_socket(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let family = args[0] as i32;
    let type_ = args[1] as i32;
    let protocol = args[2] as i32;

    let host_fd = unsafe { libc::socket(family, type_, protocol) };
    if host_fd < 0 {
        return err(last_errno());
    }
    let mut entry = SocketEntry::new(host_fd, family, type_, protocol);
    entry.blocking = type_ & libc::SOCK_NONBLOCK == 0;
    uc.get_data_mut().sock.add_socket_entry(host_fd, entry);
    val(host_fd as u64)
}

pub fn sys_bind(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, _) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let raw = read_sockaddr(uc, args[1], args[2] as usize)?;
    let ret = unsafe {
        libc::bind(
            host_fd,
            raw.as_ptr() as *const libc::sockaddr,
            raw.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return err(last_errno());
    }
    let entry = uc.get_data_mut().sock.socket_entry_mut(fd)?;
    entry.server = true;
    remember_addr(entry, &raw);
    val(0)
}

pub fn sys_listen(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let backlog = args[1] as i32;
    let (host_fd, _) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let ret = unsafe { libc::listen(host_fd, backlog) };
    if ret < 0 {
        return err(last_errno());
    }
    let entry = uc.get_data_mut().sock.socket_entry_mut(fd)?;
    entry.server_listen = true;
    entry.backlog = backlog;
    val(0)
}

pub fn sys_connect(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, _) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let raw = read_sockaddr(uc, args[1], args[2] as usize)?;
    let ret = unsafe {
        libc::connect(
            host_fd,
            raw.as_ptr() as *const libc::sockaddr,
            raw.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return err(last_errno());
    }
    let entry = uc.get_data_mut().sock.socket_entry_mut(fd)?;
    entry.server = false;
    remember_addr(entry, &raw);
    val(0)
}

fn do_accept(uc: &mut ArionCpu, args: &[u64], flags: i32) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, blocking) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLIN) {
        return Ok(SysRet::Cancel);
    }

    let mut addr = [0u8; 128];
    let mut addr_len: libc::socklen_t = addr.len() as libc::socklen_t;
    let conn_fd = unsafe {
        libc::accept4(
            host_fd,
            addr.as_mut_ptr() as *mut libc::sockaddr,
            &mut addr_len,
            flags,
        )
    };
    if conn_fd < 0 {
        return err(last_errno());
    }

    let (family, type_, protocol) = {
        let parent = uc.get_data().sock.socket_entry(fd)?;
        (parent.family, parent.type_, parent.protocol)
    };
    let mut entry = SocketEntry::new(conn_fd, family, type_, protocol);
    remember_addr(&mut entry, &addr[..addr_len as usize]);
    uc.get_data_mut().sock.add_socket_entry(conn_fd, entry);

    if args.len() > 2 && args[1] != 0 && args[2] != 0 {
        let guest_len = memory::read_val(uc, args[2], 4)? as usize;
        let copy = guest_len.min(addr_len as usize);
        memory::write(uc, args[1], &addr[..copy])?;
        memory::write_val(uc, args[2], addr_len as u64, 4)?;
    }
    val(conn_fd as u64)
}

pub fn sys_accept(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_accept(uc, args, 0)
}

pub fn sys_accept4(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let flags = args[3] as i32;
    do_accept(uc, args, flags)
}

pub fn sys_sendto(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, blocking) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLOUT) {
        return Ok(SysRet::Cancel);
    }

    let buf = memory::read(uc, args[1], args[2] as usize)?;
    let dest = if args.len() > 5 && args[4] != 0 && args[5] != 0 {
        read_sockaddr(uc, args[4], args[5] as usize)?
    } else {
        Vec::new()
    };
    let ret = unsafe {
        libc::sendto(
            host_fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            args[3] as i32,
            if dest.is_empty() {
                std::ptr::null()
            } else {
                dest.as_ptr() as *const libc::sockaddr
            },
            dest.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        err(last_errno())
    } else {
        val(ret as u64)
    }
}

pub fn sys_send(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    sys_sendto(uc, &[args[0], args[1], args[2], args[3], 0, 0])
}

pub fn sys_recvfrom(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, blocking) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLIN) {
        return Ok(SysRet::Cancel);
    }

    let mut buf = vec![0u8; args[2] as usize];
    let mut addr = [0u8; 128];
    let mut addr_len: libc::socklen_t = addr.len() as libc::socklen_t;
    let ret = unsafe {
        libc::recvfrom(
            host_fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            args[3] as i32,
            addr.as_mut_ptr() as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if ret < 0 {
        return err(last_errno());
    }
    memory::write(uc, args[1], &buf[..ret as usize])?;
    if args.len() > 5 && args[4] != 0 && args[5] != 0 {
        let guest_len = memory::read_val(uc, args[5], 4)? as usize;
        let copy = guest_len.min(addr_len as usize);
        memory::write(uc, args[4], &addr[..copy])?;
        memory::write_val(uc, args[5], addr_len as u64, 4)?;
    }
    val(ret as u64)
}

pub fn sys_recv(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    sys_recvfrom(uc, &[args[0], args[1], args[2], args[3], 0, 0])
}

/// Guest msghdr field offsets are all pointer-width.
fn read_msghdr(uc: &ArionCpu, addr: Addr) -> Result<(Addr, u64, Addr, u64)> {
    let ptr_sz = uc.get_data().abi.table.ptr_sz as u64;
    let name = memory::read_ptr(uc, addr)?;
    let name_len = memory::read_val(uc, addr + ptr_sz, 4)?;
    let iov = memory::read_ptr(uc, addr + 2 * ptr_sz)?;
    let iov_len = memory::read_ptr(uc, addr + 3 * ptr_sz)?;
    Ok((name, name_len, iov, iov_len))
}

pub fn sys_sendmsg(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, blocking) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLOUT) {
        return Ok(SysRet::Cancel);
    }

    let (name, name_len, iov, iov_cnt) = read_msghdr(uc, args[1])?;
    let table = uc.get_data().abi.table;
    let iov_sz = structs::IOVEC.size(table) as u64;
    let mut payload = Vec::new();
    for i in 0..iov_cnt {
        let fields = structs::IOVEC.build(uc, iov + i * iov_sz)?;
        let base = structs::field(&fields, "iov_base")?;
        let len = structs::field(&fields, "iov_len")?;
        payload.extend_from_slice(&memory::read(uc, base, len as usize)?);
    }
    let dest = if name != 0 && name_len != 0 {
        read_sockaddr(uc, name, name_len as usize)?
    } else {
        Vec::new()
    };
    let ret = unsafe {
        libc::sendto(
            host_fd,
            payload.as_ptr() as *const libc::c_void,
            payload.len(),
            args[2] as i32,
            if dest.is_empty() {
                std::ptr::null()
            } else {
                dest.as_ptr() as *const libc::sockaddr
            },
            dest.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        err(last_errno())
    } else {
        val(ret as u64)
    }
}

pub fn sys_recvmsg(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let fd = args[0] as i32;
    let (host_fd, blocking) = match sock_host_fd(uc, fd) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    if !blocking_io(uc) && blocking && !fd_ready(host_fd, PollFlags::POLLIN) {
        return Ok(SysRet::Cancel);
    }

    let (_, _, iov, iov_cnt) = read_msghdr(uc, args[1])?;
    let table = uc.get_data().abi.table;
    let iov_sz = structs::IOVEC.size(table) as u64;
    let mut total = 0u64;
    for i in 0..iov_cnt {
        let fields = structs::IOVEC.build(uc, iov + i * iov_sz)?;
        let base = structs::field(&fields, "iov_base")?;
        let len = structs::field(&fields, "iov_len")?;
        let mut buf = vec![0u8; len as usize];
        let ret = unsafe {
            libc::recv(
                host_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                args[2] as i32,
            )
        };
        if ret < 0 {
            if total == 0 {
                return err(last_errno());
            }
            break;
        }
        memory::write(uc, base, &buf[..ret as usize])?;
        total += ret as u64;
        if (ret as u64) < len {
            break;
        }
    }
    val(total)
}

pub fn sys_shutdown(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _) = match sock_host_fd(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let ret = unsafe { libc::shutdown(host_fd, args[1] as i32) };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

fn do_sockname(uc: &mut ArionCpu, args: &[u64], peer: bool) -> Result<SysRet> {
    let (host_fd, _) = match sock_host_fd(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let mut addr = [0u8; 128];
    let mut addr_len: libc::socklen_t = addr.len() as libc::socklen_t;
    let ret = unsafe {
        if peer {
            libc::getpeername(host_fd, addr.as_mut_ptr() as *mut libc::sockaddr, &mut addr_len)
        } else {
            libc::getsockname(host_fd, addr.as_mut_ptr() as *mut libc::sockaddr, &mut addr_len)
        }
    };
    if ret < 0 {
        return err(last_errno());
    }
    let guest_len = memory::read_val(uc, args[2], 4)? as usize;
    let copy = guest_len.min(addr_len as usize);
    memory::write(uc, args[1], &addr[..copy])?;
    memory::write_val(uc, args[2], addr_len as u64, 4)?;
    val(0)
}

pub fn sys_getsockname(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_sockname(uc, args, false)
}

pub fn sys_getpeername(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    do_sockname(uc, args, true)
}

pub fn sys_socketpair(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let family = args[0] as i32;
    let type_ = args[1] as i32;
    let protocol = args[2] as i32;
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::socketpair(family, type_, protocol, fds.as_mut_ptr()) };
    if ret < 0 {
        return err(last_errno());
    }
    for fd in fds.iter() {
        uc.get_data_mut()
            .sock
            .add_socket_entry(*fd, SocketEntry::new(*fd, family, type_, protocol));
    }
    memory::write_val(uc, args[3], fds[0] as u64, 4)?;
    memory::write_val(uc, args[3] + 4, fds[1] as u64, 4)?;
    val(0)
}

pub fn sys_setsockopt(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _) = match sock_host_fd(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let optval = memory::read(uc, args[3], args[4] as usize)?;
    let ret = unsafe {
        libc::setsockopt(
            host_fd,
            args[1] as i32,
            args[2] as i32,
            optval.as_ptr() as *const libc::c_void,
            optval.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        err(last_errno())
    } else {
        val(0)
    }
}

pub fn sys_getsockopt(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let (host_fd, _) = match sock_host_fd(uc, args[0] as i32) {
        Some(f) => f,
        None => return err(libc::EBADF),
    };
    let guest_len = memory::read_val(uc, args[4], 4)? as usize;
    let mut optval = vec![0u8; guest_len.min(256)];
    let mut optlen: libc::socklen_t = optval.len() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            host_fd,
            args[1] as i32,
            args[2] as i32,
            optval.as_mut_ptr() as *mut libc::c_void,
            &mut optlen,
        )
    };
    if ret < 0 {
        return err(last_errno());
    }
    memory::write(uc, args[3], &optval[..optlen as usize])?;
    memory::write_val(uc, args[4], optlen as u64, 4)?;
    val(0)
}

// socketcall(2) multiplexer numbers (x86 and ppc32).
const SYS_SOCKET: u64 = 1;
const SYS_BIND: u64 = 2;
const SYS_CONNECT: u64 = 3;
const SYS_LISTEN: u64 = 4;
const SYS_ACCEPT: u64 = 5;
const SYS_GETSOCKNAME: u64 = 6;
const SYS_GETPEERNAME: u64 = 7;
const SYS_SOCKETPAIR: u64 = 8;
const SYS_SEND: u64 = 9;
const SYS_RECV: u64 = 10;
const SYS_SENDTO: u64 = 11;
const SYS_RECVFROM: u64 = 12;
const SYS_SHUTDOWN: u64 = 13;
const SYS_SETSOCKOPT: u64 = 14;
const SYS_GETSOCKOPT: u64 = 15;
const SYS_SENDMSG: u64 = 16;
const SYS_RECVMSG: u64 = 17;
const SYS_ACCEPT4: u64 = 18;

/// 32-bit demultiplexer: the call number selects the operation and the
/// second argument points at the packed argument array.
pub fn sys_socketcall(uc: &mut ArionCpu, args: &[u64]) -> Result<SysRet> {
    let call = args[0];
    let args_addr = args[1];

    let (handler, argc): (fn(&mut ArionCpu, &[u64]) -> Result<SysRet>, usize) = match call {
        SYS_SOCKET => (sys_socket, 3),
        SYS_BIND => (sys_bind, 3),
        SYS_CONNECT => (sys_connect, 3),
        SYS_LISTEN => (sys_listen, 2),
        SYS_ACCEPT => (sys_accept, 3),
        SYS_GETSOCKNAME => (sys_getsockname, 3),
        SYS_GETPEERNAME => (sys_getpeername, 3),
        SYS_SOCKETPAIR => (sys_socketpair, 4),
        SYS_SEND => (sys_send, 4),
        SYS_RECV => (sys_recv, 4),
        SYS_SENDTO => (sys_sendto, 6),
        SYS_RECVFROM => (sys_recvfrom, 6),
        SYS_SHUTDOWN => (sys_shutdown, 2),
        SYS_SETSOCKOPT => (sys_setsockopt, 5),
        SYS_GETSOCKOPT => (sys_getsockopt, 5),
        SYS_SENDMSG => (sys_sendmsg, 3),
        SYS_RECVMSG => (sys_recvmsg, 3),
        SYS_ACCEPT4 => (sys_accept4, 4),
        _ => return err(libc::EINVAL),
    };

    let ptr_sz = uc.get_data().abi.table.ptr_sz as u64;
    let mut call_args = Vec::with_capacity(argc);
    for i in 0..argc {
        call_args.push(memory::read_val(uc, args_addr + i as u64 * ptr_sz, ptr_sz as u8)?);
    }
    handler(uc, &call_args)
}
