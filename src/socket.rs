//! Guest socket table. Each entry mirrors the state needed to recreate the
//! host socket after a context restore: family/type/protocol, the raw
//! sockaddr last used, and the server-side bind/listen parameters.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

use crate::errors::{ArionError, Result};

#[derive(Clone, Debug)]
pub struct SocketEntry {
    pub host_fd: RawFd,
    pub family: i32,
    pub type_: i32,
    pub protocol: i32,
    /// Printable peer/bind address for IP sockets.
    pub ip: String,
    pub port: u16,
    /// Filesystem path for unix-domain sockets (already rewritten).
    pub path: String,
    pub server: bool,
    pub server_listen: bool,
    pub backlog: i32,
    pub blocking: bool,
    /// Raw sockaddr bytes from the last bind/connect, replayed on restore.
    pub addr: Vec<u8>,
}

impl SocketEntry {
    pub fn new(host_fd: RawFd, family: i32, type_: i32, protocol: i32) -> SocketEntry {
        SocketEntry {
            host_fd,
            family,
            type_,
            protocol,
            ip: String::new(),
            port: 0,
            path: String::new(),
            server: false,
            server_listen: false,
            backlog: 0,
            blocking: true,
            addr: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct SocketTable {
    pub sockets: BTreeMap<i32, SocketEntry>,
}

impl SocketTable {
    pub fn has_socket_entry(&self, fd: i32) -> bool {
        self.sockets.contains_key(&fd)
    }

    pub fn socket_entry(&self, fd: i32) -> Result<&SocketEntry> {
        self.sockets
            .get(&fd)
            .ok_or_else(|| ArionError::InvalidArgument(format!("no socket at fd {}", fd)))
    }

    pub fn socket_entry_mut(&mut self, fd: i32) -> Result<&mut SocketEntry> {
        self.sockets
            .get_mut(&fd)
            .ok_or_else(|| ArionError::InvalidArgument(format!("no socket at fd {}", fd)))
    }

    pub fn add_socket_entry(&mut self, guest_fd: i32, entry: SocketEntry) {
        self.sockets.insert(guest_fd, entry);
    }

    pub fn rm_socket_entry(&mut self, fd: i32) -> Result<SocketEntry> {
        self.sockets
            .remove(&fd)
            .ok_or_else(|| ArionError::InvalidArgument(format!("no socket at fd {}", fd)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_round_trip() {
        let mut table = SocketTable::default();
        table.add_socket_entry(5, SocketEntry::new(9, libc::AF_INET, libc::SOCK_STREAM, 0));
        assert!(table.has_socket_entry(5));
        assert_eq!(table.socket_entry(5).unwrap().host_fd, 9);
        table.rm_socket_entry(5).unwrap();
        assert!(!table.has_socket_entry(5));
        assert!(table.socket_entry(5).is_err());
    }
}
