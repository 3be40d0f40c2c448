//! Parsers for `/proc/net/tcp`, `tcp6` and `unix`.

use std::{
    fs, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
};

use crate::{
    event::{Endpoint, SocketPath},
    sampler::SampleError,
};

pub const DEFAULT_PROC_NET_DIR: &str = "/proc/net";

const TCP_LISTEN: u8 = 0x0A;
const UNIX_UNCONNECTED: u8 = 0x01;
const UNIX_CONNECTING: u8 = 0x02;
const UNIX_CONNECTED: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Reader rooted at a `/proc/net`-shaped directory.
#[derive(Debug, Clone)]
pub struct ProcNet {
    dir: PathBuf,
}

impl Default for ProcNet {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_NET_DIR)
    }
}

impl ProcNet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Listening endpoints from `tcp` and `tcp6`. A missing `tcp6` (IPv6
    /// disabled in the guest) is not an error.
    pub fn listening_ports(&self) -> Result<Vec<Endpoint>, SampleError> {
        let mut ports = parse_tcp(&self.read("tcp")?, Family::V4)?;
        match self.read("tcp6") {
            Ok(content) => ports.extend(parse_tcp(&content, Family::V6)?),
            Err(SampleError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                tracing::trace!(dir = %self.dir.display(), "tcp6 table not present");
            }
            Err(err) => return Err(err),
        }
        Ok(ports)
    }

    pub fn unix_sockets(&self) -> Result<Vec<SocketPath>, SampleError> {
        parse_unix(&self.read("unix")?)
    }

    fn read(&self, name: &str) -> Result<String, SampleError> {
        let path = self.dir.join(name);
        fs::read_to_string(&path).map_err(|source| SampleError::Io { path, source })
    }
}

/// Keeps the sockets in the LISTEN state.
pub fn parse_tcp(content: &str, family: Family) -> Result<Vec<Endpoint>, SampleError> {
    let mut ports = Vec::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            continue;
        }
        let state = u8::from_str_radix(parts[3], 16)
            .map_err(|_| SampleError::Parse(format!("invalid tcp state: {}", parts[3])))?;
        if state != TCP_LISTEN {
            continue;
        }
        let (ip, port) = match family {
            Family::V4 => parse_hex_addr_v4(parts[1])?,
            Family::V6 => parse_hex_addr_v6(parts[1])?,
        };
        ports.push(Endpoint::new(ip, port));
    }
    Ok(ports)
}

/// Keeps bound paths of sockets that are unconnected, connecting or
/// connected. Unnamed sockets are skipped.
pub fn parse_unix(content: &str) -> Result<Vec<SocketPath>, SampleError> {
    let mut sockets = Vec::new();
    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            continue;
        }
        let state = u8::from_str_radix(parts[5], 16)
            .map_err(|_| SampleError::Parse(format!("invalid unix socket state: {}", parts[5])))?;
        match state {
            UNIX_UNCONNECTED | UNIX_CONNECTING | UNIX_CONNECTED => {
                if let Some(path) = after_fields(line, 7) {
                    sockets.push(path.to_string());
                }
            }
            _ => {}
        }
    }
    Ok(sockets)
}

/// Rest of `line` after `count` whitespace-separated fields, verbatim.
fn after_fields(line: &str, count: usize) -> Option<&str> {
    let mut rest = line;
    for _ in 0..count {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        rest = &rest[end..];
    }
    let rest = rest.trim_start();
    (!rest.is_empty()).then_some(rest)
}

fn split_hex_addr(s: &str) -> Result<(&str, u16), SampleError> {
    let Some((addr, port)) = s.split_once(':') else {
        return Err(SampleError::Parse(format!("invalid address: {s}")));
    };
    let port = u16::from_str_radix(port, 16)
        .map_err(|_| SampleError::Parse(format!("invalid port: {port}")))?;
    Ok((addr, port))
}

// Address words are printed from little-endian memory as `%08X`.
fn parse_hex_word(word: &str) -> Result<[u8; 4], SampleError> {
    let value = u32::from_str_radix(word, 16)
        .map_err(|_| SampleError::Parse(format!("invalid address word: {word}")))?;
    Ok(value.to_le_bytes())
}

fn parse_hex_addr_v4(s: &str) -> Result<(IpAddr, u16), SampleError> {
    let (addr, port) = split_hex_addr(s)?;
    if addr.len() != 8 {
        return Err(SampleError::Parse(format!("invalid IPv4 address: {addr}")));
    }
    let octets = parse_hex_word(addr)?;
    Ok((IpAddr::V4(Ipv4Addr::from(octets)), port))
}

fn parse_hex_addr_v6(s: &str) -> Result<(IpAddr, u16), SampleError> {
    let (addr, port) = split_hex_addr(s)?;
    if addr.len() != 32 || !addr.is_ascii() {
        return Err(SampleError::Parse(format!("invalid IPv6 address: {addr}")));
    }
    let mut octets = [0u8; 16];
    for i in 0..4 {
        let word = parse_hex_word(&addr[i * 8..(i + 1) * 8])?;
        octets[i * 4..(i + 1) * 4].copy_from_slice(&word);
    }
    Ok((IpAddr::V6(Ipv6Addr::from(octets)), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP4: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 100 0 0 10 0
   2: 0100007F:1F90 0100007F:1234 01 00000000:00000000 00:00000000 00000000  1000        0 12347 1 0000000000000000 100 0 0 10 0";

    const TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:1F90 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12348 1 0000000000000000 100 0 0 10 0
   1: 00000000000000000000000001000000:0016 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12349 1 0000000000000000 100 0 0 10 0";

    const UNIX: &str = "Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00010000 0001 01 20157 /run/user/1000/bus
0000000000000000: 00000003 00000000 00000000 0001 03 20158 /run/systemd/journal/stdout
0000000000000000: 00000003 00000000 00000000 0001 03 20159
0000000000000000: 00000002 00000000 00000000 0002 04 20160 /run/disconnecting.sock
0000000000000000: 00000002 00000000 00010000 0001 01 20161 @/tmp/.X11-unix/X0";

    #[test]
    fn parse_tcp_keeps_only_listening_v4() {
        let ports = parse_tcp(TCP4, Family::V4).unwrap();
        assert_eq!(
            ports,
            vec![
                Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 80),
                Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            ]
        );
    }

    #[test]
    fn parse_tcp_decodes_v6_words() {
        let ports = parse_tcp(TCP6, Family::V6).unwrap();
        assert_eq!(
            ports,
            vec![
                Endpoint::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 8080),
                Endpoint::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 22),
            ]
        );
    }

    #[test]
    fn parse_tcp_rejects_bad_hex() {
        let content = "header\n   0: GGGGGGGG:0050 00000000:0000 0A 00000000:00000000\n";
        assert!(matches!(
            parse_tcp(content, Family::V4),
            Err(SampleError::Parse(_))
        ));
    }

    #[test]
    fn parse_tcp_rejects_missing_port_separator() {
        let content = "header\n   0: 0100007F 00000000:0000 0A 00000000:00000000\n";
        assert!(parse_tcp(content, Family::V4).is_err());
    }

    #[test]
    fn parse_unix_keeps_named_sockets_in_live_states() {
        let sockets = parse_unix(UNIX).unwrap();
        assert_eq!(
            sockets,
            vec![
                "/run/user/1000/bus".to_string(),
                "/run/systemd/journal/stdout".to_string(),
                "@/tmp/.X11-unix/X0".to_string(),
            ]
        );
    }

    #[test]
    fn parse_unix_keeps_inner_whitespace_of_paths() {
        let content = "Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00010000 0001 01 20157 /tmp/my  app/run.sock";
        assert_eq!(
            parse_unix(content).unwrap(),
            vec!["/tmp/my  app/run.sock".to_string()]
        );
    }

    #[test]
    fn proc_net_reads_both_tcp_tables() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("tcp"), TCP4).unwrap();
        std::fs::write(temp.path().join("tcp6"), TCP6).unwrap();

        let ports = ProcNet::new(temp.path()).listening_ports().unwrap();

        assert_eq!(ports.len(), 4);
    }

    #[test]
    fn proc_net_tolerates_missing_tcp6() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("tcp"), TCP4).unwrap();

        let ports = ProcNet::new(temp.path()).listening_ports().unwrap();

        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn proc_net_missing_tcp_is_an_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = ProcNet::new(temp.path()).listening_ports().unwrap_err();
        assert!(matches!(err, SampleError::Io { .. }));
    }
}
