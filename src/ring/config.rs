use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::common::RingId;
use crate::transport::DEFAULT_REQUEST_TIMEOUT;
use crate::{Error, Result};

/// Default pause between two maintenance ticks.
pub const DEFAULT_STABILIZE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
/// Ring node configurations
pub struct Config {
    /// Bootstrap list, logical peer index to address.
    ///
    /// The node binds the entry at [Self::index] and dials every other one.
    pub peers: BTreeMap<usize, SocketAddr>,
    /// This node's own index in [Self::peers].
    pub index: usize,
    /// Pin the node's id instead of hashing its address.
    ///
    /// Defaults to None, where [RingId::from_addr] of the bound address is used.
    pub id: Option<RingId>,
    /// Pause between two stabilize + fix_fingers rounds.
    ///
    /// Defaults to [DEFAULT_STABILIZE_INTERVAL]
    pub stabilize_interval: Duration,
    /// Deadline for every remote ring call.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peers: BTreeMap::new(),
            index: 0,
            id: None,
            stabilize_interval: DEFAULT_STABILIZE_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Config {
    /// Config for the node at `index` of the `peers` list.
    pub fn new(peers: impl IntoIterator<Item = (usize, SocketAddr)>, index: usize) -> Self {
        Self {
            peers: peers.into_iter().collect(),
            index,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: RingId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_stabilize_interval(mut self, interval: Duration) -> Self {
        self.stabilize_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The address this node binds, looked up from its own index.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.peers.get(&self.index).copied().ok_or_else(|| {
            Error::Connection(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("peer list has no entry for own index {}", self.index),
            ))
        })
    }

    /// Every bootstrap entry except this node's own.
    pub(crate) fn remote_peers(&self) -> impl Iterator<Item = (usize, SocketAddr)> + '_ {
        self.peers
            .iter()
            .filter(|(index, _)| **index != self.index)
            .map(|(index, address)| (*index, *address))
    }
}
