//! Inherited-socket handoff for zero-downtime binary upgrades (spec §6).
//! No pack repo implements this (checked `other_examples/` for
//! `AsRawFd`/`dup` patterns — only incidental `use` statements, nothing
//! resembling a handoff), so this is written directly from the wire
//! format spec.md §6 specifies: an ordered sequence of
//! `{address, fd_index, file_name}` records, `;`-joined, passed through a
//! single environment variable to the child process.

use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;

use crate::error::{MuxError, MuxResult};
use crate::listener::ListenerAddress;

/// Name of the environment variable the parent process sets on the child
/// carrying the serialized fd manifest (spec §6).
pub const INHERIT_FDS_ENV: &str = "MUX_INHERIT_FDS";

/// `fd_index` starts at 3 (after stdin/out/err) and counts sequentially
/// for each passed descriptor (spec §6).
pub const FIRST_FD_INDEX: i32 = 3;

/// One record in the handoff manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptorEntry {
    pub address: ListenerAddress,
    pub fd_index: i32,
    pub file_name: String,
}

impl fmt::Display for FileDescriptorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.address, self.fd_index, self.file_name)
    }
}

impl FromStr for FileDescriptorEntry {
    type Err = MuxError;

    fn from_str(s: &str) -> MuxResult<Self> {
        let mut parts = s.splitn(3, '|');
        let address_str = parts.next().ok_or_else(|| MuxError::invalid_argument("missing address"))?;
        let fd_index_str = parts.next().ok_or_else(|| MuxError::invalid_argument("missing fd_index"))?;
        let file_name = parts.next().ok_or_else(|| MuxError::invalid_argument("missing file_name"))?;

        let (network_str, host_port) = address_str
            .split_once(':')
            .ok_or_else(|| MuxError::invalid_argument(format!("malformed address: {:?}", address_str)))?;
        let network = match network_str {
            "tcp" => crate::listener::Network::Tcp,
            "tcp6" => crate::listener::Network::Tcp6,
            other => return Err(MuxError::invalid_argument(format!("unknown network: {:?}", other))),
        };
        let fd_index: i32 = fd_index_str
            .parse()
            .map_err(|_| MuxError::invalid_argument(format!("malformed fd_index: {:?}", fd_index_str)))?;

        Ok(FileDescriptorEntry {
            address: ListenerAddress::new(network, host_port),
            fd_index,
            file_name: file_name.to_string(),
        })
    }
}

/// Serialize an ordered manifest as a `;`-joined sequence of records
/// (spec §6, §8: "Serialize(files) → Deserialize → Serialize yields a
/// byte-identical string").
pub fn serialize(entries: &[FileDescriptorEntry]) -> String {
    entries.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(";")
}

pub fn deserialize(s: &str) -> MuxResult<Vec<FileDescriptorEntry>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(';').map(FileDescriptorEntry::from_str).collect()
}

/// A handed-off listening socket: its original address and the owned
/// file descriptor the child reconstructs a `TcpListener` from.
pub struct InheritedFile {
    pub address: ListenerAddress,
    pub file: OwnedFd,
}

/// Duplicate `fd` (via `dup(2)`) so the original listening socket is
/// never consumed by the handoff itself — `GetFiles` exposes a copy, the
/// live socket keeps serving until the owning Server shuts down (spec §5).
pub fn dup_fd(fd: RawFd) -> MuxResult<OwnedFd> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(MuxError::internal(format!("dup(2) failed: {}", std::io::Error::last_os_error())));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Build the manifest and environment-variable-ready string for a set of
/// `(address, fd)` pairs collected from `Mux::get_files`, assigning
/// sequential `fd_index`es starting at `FIRST_FD_INDEX`.
pub fn build_manifest(files: &[(ListenerAddress, OwnedFd)]) -> (Vec<FileDescriptorEntry>, String) {
    let entries: Vec<FileDescriptorEntry> = files
        .iter()
        .enumerate()
        .map(|(i, (address, fd))| FileDescriptorEntry {
            address: address.clone(),
            fd_index: FIRST_FD_INDEX + i as i32,
            file_name: format!("mux-listener-{}.sock", fd.as_raw_fd()),
        })
        .collect();
    let serialized = serialize(&entries);
    (entries, serialized)
}

/// Parse `MUX_INHERIT_FDS` in the child, reconstructing `(address, file)`
/// pairs from the documented `fd_index` convention (no `dup` needed here —
/// the child owns these descriptors outright).
pub fn take_from_env() -> MuxResult<Vec<InheritedFile>> {
    let raw = match std::env::var(INHERIT_FDS_ENV) {
        Ok(v) => v,
        Err(_) => return Ok(Vec::new()),
    };
    let entries = deserialize(&raw)?;
    Ok(entries
        .into_iter()
        .map(|e| InheritedFile { address: e.address, file: unsafe { OwnedFd::from_raw_fd(e.fd_index) } })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Network;

    #[test]
    fn round_trip_is_byte_identical() {
        let entries = vec![
            FileDescriptorEntry { address: ListenerAddress::new(Network::Tcp, ":8081"), fd_index: 3, file_name: "a.sock".into() },
            FileDescriptorEntry { address: ListenerAddress::new(Network::Tcp6, "[::]:8443"), fd_index: 4, file_name: "b.sock".into() },
        ];
        let first = serialize(&entries);
        let parsed = deserialize(&first).unwrap();
        let second = serialize(&parsed);
        assert_eq!(first, second);
        assert_eq!(parsed, entries);
    }

    #[test]
    fn empty_manifest_round_trips() {
        assert_eq!(deserialize("").unwrap(), Vec::new());
        assert_eq!(serialize(&[]), "");
    }

    #[test]
    fn malformed_entry_is_invalid_argument() {
        assert!(deserialize("not-a-valid-entry").is_err());
    }
}
