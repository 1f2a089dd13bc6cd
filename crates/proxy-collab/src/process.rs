//! Best-effort attribution of an inbound TCP peer address to a local
//! process name, purely for log lines ("connection from firefox on
//! 127.0.0.1:54321"). Never consulted for authorization.

use std::net::SocketAddr;

use sysinfo::{Pid, System};

/// Looks up the process that owns the local end of a TCP connection.
pub trait ProcessLookup: Send + Sync {
    /// Returns the owning process's name, or `None` if it can't be
    /// determined (unsupported platform, permissions, or the connection
    /// already closed).
    fn process_for_peer(&self, peer: SocketAddr) -> Option<String>;
}

/// Linux-only lookup via `/proc/net/tcp[6]` (port → inode) and `/proc/*/fd`
/// (inode → pid), with the process name resolved through [`sysinfo`]. On
/// any other platform, or if `/proc` can't be read, every lookup returns
/// `None`.
pub struct SystemProcessLookup {
    system: std::sync::Mutex<System>,
}

impl SystemProcessLookup {
    pub fn new() -> Self {
        Self { system: std::sync::Mutex::new(System::new()) }
    }
}

impl Default for SystemProcessLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLookup for SystemProcessLookup {
    #[cfg(target_os = "linux")]
    fn process_for_peer(&self, peer: SocketAddr) -> Option<String> {
        let pid = pid_for_port(peer.port(), peer.is_ipv6())?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.name().to_string_lossy().into_owned())
    }

    #[cfg(not(target_os = "linux"))]
    fn process_for_peer(&self, _peer: SocketAddr) -> Option<String> {
        None
    }
}

#[cfg(target_os = "linux")]
fn pid_for_port(port: u16, is_v6: bool) -> Option<Pid> {
    let inode = find_inode_for_port(port, is_v6)?;
    find_pid_owning_inode(inode)
}

#[cfg(target_os = "linux")]
fn find_inode_for_port(port: u16, is_v6: bool) -> Option<u64> {
    let path = if is_v6 { "/proc/net/tcp6" } else { "/proc/net/tcp" };
    let contents = std::fs::read_to_string(path).ok()?;
    let port_hex = format!("{:04X}", port);
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let local = fields.first()?;
        let (_, local_port) = local.rsplit_once(':')?;
        if local_port.eq_ignore_ascii_case(&port_hex) {
            return fields.get(9).and_then(|s| s.parse().ok());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn find_pid_owning_inode(inode: u64) -> Option<Pid> {
    let target = format!("socket:[{inode}]");
    let proc_dir = std::fs::read_dir("/proc").ok()?;
    for entry in proc_dir.flatten() {
        let pid_str = entry.file_name().to_string_lossy().into_owned();
        let Ok(pid_num) = pid_str.parse::<i32>() else { continue };
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else { continue };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link.to_string_lossy() == target {
                    return Some(Pid::from(pid_num as usize));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lookup_does_not_panic() {
        let lookup = SystemProcessLookup::new();
        let _ = lookup.process_for_peer("127.0.0.1:1".parse().unwrap());
    }
}
