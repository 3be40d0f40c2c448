use std::{collections::BTreeSet, io, path::PathBuf, sync::RwLock};

use thiserror::Error;

use crate::{
    event::{Endpoint, SocketPath, StateSnapshot},
    iptables::PacketFilter,
    procnet::ProcNet,
    worthiness::Worthiness,
};

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("big-endian hosts are unsupported: kernel connection tables cannot be decoded")]
    UnsupportedPlatform,
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("packet filter query failed: {0}")]
    PacketFilter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Reads listening ports and local sockets from the kernel.
///
/// The packet-filter table is only queried while the shared worthiness flag
/// is set; otherwise the last result is reused.
pub struct StateSampler {
    proc_net: ProcNet,
    packet_filter: Box<dyn PacketFilter>,
    worthiness: Worthiness,
    byte_order: ByteOrder,
    filter_cache: RwLock<Vec<Endpoint>>,
}

impl StateSampler {
    pub fn new(
        proc_net: ProcNet,
        packet_filter: impl PacketFilter + 'static,
        worthiness: Worthiness,
    ) -> Self {
        Self {
            proc_net,
            packet_filter: Box::new(packet_filter),
            worthiness,
            byte_order: ByteOrder::native(),
            filter_cache: RwLock::new(Vec::new()),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn sample(&self) -> Result<StateSnapshot, SampleError> {
        Ok(StateSnapshot {
            ports: self.local_ports()?,
            sockets: self.local_sockets()?,
        })
    }

    pub fn local_ports(&self) -> Result<BTreeSet<Endpoint>, SampleError> {
        if self.byte_order == ByteOrder::Big {
            return Err(SampleError::UnsupportedPlatform);
        }
        let mut ports: BTreeSet<Endpoint> = self.proc_net.listening_ports()?.into_iter().collect();

        let filtered = self.packet_filter_ports()?;
        for endpoint in filtered {
            if ports.iter().any(|known| known.port == endpoint.port) {
                continue;
            }
            ports.insert(endpoint);
        }
        Ok(ports)
    }

    pub fn local_sockets(&self) -> Result<BTreeSet<SocketPath>, SampleError> {
        Ok(self.proc_net.unix_sockets()?.into_iter().collect())
    }

    fn packet_filter_ports(&self) -> Result<Vec<Endpoint>, SampleError> {
        let worth_checking = self.worthiness.is_worth_checking();
        tracing::trace!(worth_checking, "sampling local ports");
        if !worth_checking {
            let cache = self
                .filter_cache
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            return Ok(cache.clone());
        }

        let fresh = self.packet_filter.forwarded_ports()?;
        let mut cache = self
            .filter_cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.clone_from(&fresh);
        Ok(fresh)
    }
}
