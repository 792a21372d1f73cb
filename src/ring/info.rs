use std::net::SocketAddr;

use crate::common::RingId;

use super::{NodeStatus, RingNode};

/// Snapshot of a ring node's routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    id: RingId,
    local_addr: SocketAddr,
    status: NodeStatus,
    successor: RingId,
    predecessor: Option<RingId>,
    fingers: Vec<RingId>,
}

impl Info {
    /// This node's [RingId]
    pub fn id(&self) -> RingId {
        self.id
    }
    /// Local TCP socket address that this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    pub fn status(&self) -> NodeStatus {
        self.status
    }
    pub fn successor(&self) -> RingId {
        self.successor
    }
    /// `None` until some node notified us.
    pub fn predecessor(&self) -> Option<RingId> {
        self.predecessor
    }
    /// Successor of every finger, index 0 first.
    pub fn fingers(&self) -> &[RingId] {
        &self.fingers
    }
}

impl From<&RingNode> for Info {
    fn from(node: &RingNode) -> Self {
        let state = node.state();

        Self {
            id: node.id(),
            local_addr: node.local_addr(),
            status: node.status(),
            successor: state.successor,
            predecessor: state.predecessor,
            fingers: state
                .fingers
                .entries()
                .iter()
                .map(|entry| entry.successor)
                .collect(),
        }
    }
}
