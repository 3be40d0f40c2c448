use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    process::{Command, Stdio},
};

use crate::{event::Endpoint, sampler::SampleError};

const IPTABLES_PROGRAM: &str = "iptables";

/// Port-forwarding rules installed in the guest's packet filter.
pub trait PacketFilter: Send + Sync {
    fn forwarded_ports(&self) -> Result<Vec<Endpoint>, SampleError>;
}

/// Reads DNAT rules via `iptables --list-rules --table nat`.
#[derive(Debug, Clone)]
pub struct Iptables {
    program: PathBuf,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            program: PathBuf::from(IPTABLES_PROGRAM),
        }
    }
}

impl Iptables {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PacketFilter for Iptables {
    fn forwarded_ports(&self) -> Result<Vec<Endpoint>, SampleError> {
        tracing::debug!(program = %self.program.display(), "querying nat table");
        let output = Command::new(&self.program)
            .args(["--list-rules", "--table", "nat"])
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                SampleError::PacketFilter(format!("{}: {err}", self.program.display()))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SampleError::PacketFilter(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(parse_rules(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Published endpoint of every TCP DNAT rule; no `-d` means `0.0.0.0`.
pub fn parse_rules(content: &str) -> Vec<Endpoint> {
    content.lines().filter_map(parse_rule).collect()
}

fn parse_rule(line: &str) -> Option<Endpoint> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"-A") {
        return None;
    }

    let mut ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let mut port = None;
    let mut is_tcp = false;
    let mut is_dnat = false;
    let mut negated = false;
    let mut iter = tokens.iter().skip(2);
    while let Some(token) = iter.next() {
        match *token {
            "!" => {
                negated = true;
                continue;
            }
            "-d" | "--destination" => {
                let value = iter.next()?;
                if !negated {
                    let addr = value.strip_suffix("/32").unwrap_or(value);
                    ip = IpAddr::V4(addr.parse::<Ipv4Addr>().ok()?);
                }
            }
            "-p" | "--protocol" => {
                is_tcp = !negated && *iter.next()? == "tcp";
            }
            "--dport" | "--destination-port" => {
                if !negated {
                    port = iter.next()?.parse::<u16>().ok();
                }
            }
            "-j" | "--jump" => {
                is_dnat = *iter.next()? == "DNAT";
            }
            _ => {}
        }
        negated = false;
    }

    if is_tcp && is_dnat {
        port.map(|port| Endpoint::new(ip, port))
    } else {
        None
    }
}
