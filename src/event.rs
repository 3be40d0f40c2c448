use std::{
    collections::BTreeSet,
    fmt,
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Path of a local (unix domain) socket as reported by the kernel.
pub type SocketPath = String;

/// A listening TCP endpoint inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub ports: BTreeSet<Endpoint>,
    pub sockets: BTreeSet<SocketPath>,
}

impl StateSnapshot {
    pub fn new(
        ports: impl IntoIterator<Item = Endpoint>,
        sockets: impl IntoIterator<Item = SocketPath>,
    ) -> Self {
        Self {
            ports: ports.into_iter().collect(),
            sockets: sockets.into_iter().collect(),
        }
    }

    pub fn info(&self) -> Info {
        Info {
            local_ports: self.ports.iter().copied().collect(),
            local_sockets: self.sockets.iter().cloned().collect(),
        }
    }
}

/// On-demand view of what is currently reachable in the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    #[serde(default)]
    pub local_ports: Vec<Endpoint>,
    #[serde(default)]
    pub local_sockets: Vec<SocketPath>,
}

/// One cycle's worth of changes. Only emitted when something besides `time`
/// is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_added: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_ports_removed: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_sockets_added: Vec<SocketPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_sockets_removed: Vec<SocketPath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ChangeEvent {
    pub fn empty(time: OffsetDateTime) -> Self {
        Self {
            time,
            local_ports_added: Vec::new(),
            local_ports_removed: Vec::new(),
            local_sockets_added: Vec::new(),
            local_sockets_removed: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Event describing a failed sample. Carries nothing but the error.
    pub fn failed(time: OffsetDateTime, error: impl Into<String>) -> Self {
        let mut event = Self::empty(time);
        event.errors.push(error.into());
        event
    }

    /// Differences going from `old` to `new`.
    pub fn between(old: &StateSnapshot, new: &StateSnapshot, time: OffsetDateTime) -> Self {
        let (local_ports_added, local_ports_removed) = diff(&old.ports, &new.ports);
        let (local_sockets_added, local_sockets_removed) = diff(&old.sockets, &new.sockets);
        Self {
            time,
            local_ports_added,
            local_ports_removed,
            local_sockets_added,
            local_sockets_removed,
            errors: Vec::new(),
        }
    }

    /// True when nothing but the timestamp is set.
    pub fn is_empty(&self) -> bool {
        self.local_ports_added.is_empty()
            && self.local_ports_removed.is_empty()
            && self.local_sockets_added.is_empty()
            && self.local_sockets_removed.is_empty()
            && self.errors.is_empty()
    }
}

/// Returns `(new - old, old - new)`.
pub fn diff<T: Ord + Clone>(old: &BTreeSet<T>, new: &BTreeSet<T>) -> (Vec<T>, Vec<T>) {
    let added = new.difference(old).cloned().collect();
    let removed = old.difference(new).cloned().collect();
    (added, removed)
}
