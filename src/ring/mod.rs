//! Chord ring node.
//!
//! A [RingNode] binds its own address, dials every other bootstrap peer, joins the
//! ring through them, and then keeps its successor, predecessor and fingers fresh
//! from a background maintenance thread. Peers are only ever referenced by
//! [RingId]; the link table maps each id to the transport connection that reaches it.

mod config;
mod finger_table;
mod handle_request;
mod info;
mod maintenance;
mod state;

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use std::thread;

use dashmap::DashMap;
use flume::Sender;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::common::{Message, RingId, RING_BITS};
use crate::transport::{self, ConnectionId, Transport};
use crate::{Error, Result};

use state::RingState;

pub use config::{Config, DEFAULT_STABILIZE_INTERVAL};
pub use finger_table::{FingerEntry, FingerTable};
pub use info::Info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a [RingNode].
pub enum NodeStatus {
    /// Bound, still dialing the bootstrap peers.
    Uninitialized,
    /// Looking for a successor.
    Joining,
    /// Member of the ring, maintenance is running.
    Stable,
    /// Every join attempt failed.
    Failed,
    /// [RingNode::shutdown] was called.
    Stopped,
}

#[derive(Clone)]
/// A node of the Chord ring, cheap to clone.
pub struct RingNode {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    id: RingId,
    local_addr: SocketAddr,
    config: Config,
    transport: Transport<Message>,
    handler: Arc<Handler>,
    state: RwLock<RingState>,
    /// Peer id to the connection used for calls to it.
    links: DashMap<RingId, ConnectionId>,
    status: RwLock<NodeStatus>,
    /// Dropping this sender stops the maintenance thread.
    stop: Sender<()>,
}

/// Persistent listener installed on every connection of a node.
pub(crate) struct Handler {
    node: OnceLock<Weak<Inner>>,
}

impl RingNode {
    /// Bind, dial the bootstrap peers, join, and start maintenance.
    ///
    /// Fails if the own address can't be bound, or if peers were reachable but none
    /// of them could place this node on the ring.
    pub fn new(config: Config) -> Result<Self> {
        let bind_addr = config.local_addr()?;

        let transport = Transport::new(transport::Config {
            request_timeout: config.request_timeout,
            ..Default::default()
        })?;

        let socket = TcpListener::bind(bind_addr).map_err(Error::Connection)?;
        let local_addr = socket.local_addr().map_err(Error::Connection)?;

        let handler = Arc::new(Handler {
            node: OnceLock::new(),
        });

        let id = config.id.unwrap_or_else(|| RingId::from_addr(&local_addr));
        let (stop, stop_rx) = flume::bounded(1);

        let node = RingNode {
            inner: Arc::new(Inner {
                id,
                local_addr,
                config,
                transport,
                handler: handler.clone(),
                state: RwLock::new(RingState::new(id)),
                links: DashMap::new(),
                status: RwLock::new(NodeStatus::Uninitialized),
                stop,
            }),
        };
        let _ = handler.node.set(Arc::downgrade(&node.inner));

        // Only accept once the handler can reach the node.
        node.inner.transport.serve(socket, handler)?;

        info!(%id, ?local_addr, "Ring node listening");

        let peers = node.connect_peers();

        node.set_status(NodeStatus::Joining);

        if let Err(error) = node.join(&peers) {
            node.set_status(NodeStatus::Failed);
            node.inner.transport.shutdown();

            return Err(error);
        }

        maintenance::spawn(
            Arc::downgrade(&node.inner),
            node.inner.config.stabilize_interval,
            stop_rx,
        )?;

        node.set_status(NodeStatus::Stable);

        Ok(node)
    }

    // === Getters ===

    /// This node's [RingId], fixed at construction.
    pub fn id(&self) -> RingId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn status(&self) -> NodeStatus {
        *self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn successor(&self) -> RingId {
        self.read_state().successor
    }

    pub fn predecessor(&self) -> Option<RingId> {
        self.read_state().predecessor
    }

    /// Ids of the peers this node holds a connection to, ascending.
    pub fn links(&self) -> Vec<RingId> {
        let mut links: Vec<_> = self.inner.links.iter().map(|entry| *entry.key()).collect();
        links.sort_unstable();
        links
    }

    /// Returns a snapshot of this node's routing state.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Find the node owning `target`: the first node at or after it on the ring.
    pub fn find_successor(&self, target: RingId) -> Result<RingId> {
        let predecessor = self.find_predecessor(target)?;

        if predecessor == self.id() {
            return Ok(self.successor());
        }

        match self.call(predecessor, Message::GetSuccessor)? {
            Message::GetSuccessorResponse { result } => Ok(result),
            other => Err(unexpected(predecessor, &other)),
        }
    }

    /// Find the node immediately preceding `target` on the ring.
    pub fn find_predecessor(&self, target: RingId) -> Result<RingId> {
        self.find_predecessor_from(target, None)
    }

    /// Place this node on the ring by asking each of `peers` in turn for our successor.
    ///
    /// With no peers this node forms a ring on its own.
    pub fn join(&self, peers: &[RingId]) -> Result<()> {
        let id = self.id();

        if peers.is_empty() {
            let mut state = self.write_state();
            state.predecessor = Some(id);
            state.set_successor(id);

            info!(%id, "Formed a new ring");
            return Ok(());
        }

        for peer in peers {
            let successor = match self.call(*peer, Message::FindSuccessor { target: id }) {
                Ok(Message::FindSuccessorResponse {
                    success: true,
                    result: Some(successor),
                    ..
                }) => successor,
                Ok(other) => {
                    debug!(%id, %peer, ?other, "Join attempt refused");
                    continue;
                }
                Err(error) => {
                    debug!(%id, %peer, %error, "Join attempt failed");
                    continue;
                }
            };

            if !self.is_reachable(successor) {
                debug!(%id, %peer, %successor, "Join returned an unlinked successor");
                continue;
            }

            {
                let mut state = self.write_state();
                state.predecessor = None;
                state.set_successor(successor);
            }

            info!(%id, via = %peer, %successor, "Joined ring");
            return Ok(());
        }

        Err(Error::operation_failed("unable to join"))
    }

    /// One stabilization round: learn about nodes that slipped in between us and our
    /// successor, then let the successor know about us.
    pub fn stabilize(&self) -> Result<()> {
        let id = self.id();
        let (successor, predecessor) = {
            let state = self.read_state();
            (state.successor, state.predecessor)
        };

        let candidate = if successor == id {
            predecessor
        } else {
            match self.call(successor, Message::GetPredecessor)? {
                Message::GetPredecessorResponse { result } => result,
                other => return Err(unexpected(successor, &other)),
            }
        };

        if let Some(candidate) = candidate {
            if candidate.is_between(id, successor) && self.is_reachable(candidate) {
                let mut state = self.write_state();

                // Someone else may have moved the successor while we were asking.
                if state.successor == successor {
                    trace!(context = "ring_stabilize", %id, from = %successor, to = %candidate);
                    state.set_successor(candidate);
                }
            }
        }

        let successor = self.successor();
        if successor != id {
            let connection = self.link(successor)?;
            self.inner
                .transport
                .send(connection, Message::Notify { target: id })
                .map_err(|error| unreachable_peer(successor, error))?;
        }

        Ok(())
    }

    /// `candidate` thinks it might be our predecessor.
    ///
    /// Returns true if it was adopted.
    pub fn notify_from_predecessor(&self, candidate: RingId) -> bool {
        let adopted = self.write_state().notify(candidate);

        if adopted {
            trace!(context = "ring_notify", id = %self.id(), predecessor = %candidate);
        }

        adopted
    }

    /// Refresh one randomly chosen finger.
    ///
    /// Finger 0 is left alone, it follows the successor.
    pub fn fix_fingers(&self) -> Result<()> {
        let index = rand::thread_rng().gen_range(1..RING_BITS as usize);

        self.fix_finger(index)
    }

    /// Recompute finger `index` with a lookup of its start.
    pub fn fix_finger(&self, index: usize) -> Result<()> {
        let start = match self.read_state().fingers.get(index) {
            Some(entry) => entry.start,
            None => return Err(Error::operation_failed(format!("no finger {index}"))),
        };

        let successor = self.find_successor(start)?;

        if self.is_reachable(successor) {
            self.write_state().fingers.set(index, successor);
        }

        Ok(())
    }

    /// One maintenance round: [Self::stabilize] then [Self::fix_fingers].
    ///
    /// Failures are logged and left for the next round.
    pub fn maintain(&self) {
        if let Err(error) = self.stabilize() {
            debug!(id = %self.id(), %error, "Stabilize failed");
        }

        if let Err(error) = self.fix_fingers() {
            debug!(id = %self.id(), %error, "Fix fingers failed");
        }
    }

    /// Stop maintenance, stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.set_status(NodeStatus::Stopped);

        let _ = self.inner.stop.try_send(());
        self.inner.transport.shutdown();
        self.inner.links.clear();

        info!(id = %self.id(), "Ring node shut down");
    }

    // === Private Methods ===

    pub(crate) fn state(&self) -> RingState {
        self.read_state().clone()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RingState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RingState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: NodeStatus) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Route towards the predecessor of `target`, `origin` being the first hop.
    fn find_predecessor_from(&self, target: RingId, origin: Option<RingId>) -> Result<RingId> {
        let id = self.id();

        let next = {
            let state = self.read_state();

            if state.precedes(target) {
                return Ok(id);
            }

            state.fingers.closest_preceding_finger(target)
        };

        if next == id {
            debug!(%id, %target, "No finger precedes target, answering for it");
            return Ok(id);
        }

        let origin = origin.unwrap_or(id);
        if next == origin {
            return Err(Error::operation_failed("cycle reached"));
        }

        let request = Message::FindPredecessor {
            target,
            origin: Some(origin),
        };

        match self.call(next, request)? {
            Message::FindPredecessorResponse {
                success: true,
                result: Some(predecessor),
                ..
            } => Ok(predecessor),
            Message::FindPredecessorResponse { .. } => Err(Error::operation_failed(format!(
                "lookup of {target} failed at {next}"
            ))),
            other => Err(unexpected(next, &other)),
        }
    }

    /// Send `request` to `peer` and wait for its reply.
    fn call(&self, peer: RingId, request: Message) -> Result<Message> {
        let connection = self.link(peer)?;
        let expected = request.clone();

        self.inner
            .transport
            .send_for_response(
                connection,
                request,
                move |message| message.is_response_to(&expected),
                self.inner.config.request_timeout,
            )
            .map_err(|error| unreachable_peer(peer, error))
    }

    fn link(&self, peer: RingId) -> Result<ConnectionId> {
        self.inner
            .links
            .get(&peer)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::operation_failed(format!("no connection to {peer}")))
    }

    /// Ring state only ever points at ourselves or at nodes we can call.
    fn is_reachable(&self, node: RingId) -> bool {
        node == self.id() || self.inner.links.contains_key(&node)
    }

    /// Dial every bootstrap peer at once and return the ids that got linked.
    fn connect_peers(&self) -> Vec<RingId> {
        let peers: Vec<_> = self.inner.config.remote_peers().collect();

        let mut linked: Vec<RingId> = thread::scope(|scope| {
            let dials: Vec<_> = peers
                .iter()
                .map(|(index, address)| {
                    let address = *address;
                    let index = *index;
                    scope.spawn(move || match self.dial(address) {
                        Ok(peer) => Some(peer),
                        Err(error) => {
                            debug!(id = %self.id(), index, ?address, %error, "Bootstrap peer unreachable");
                            None
                        }
                    })
                })
                .collect();

            dials
                .into_iter()
                .filter_map(|dial| dial.join().ok().flatten())
                .collect()
        });

        linked.sort_unstable();
        linked.dedup();
        linked
    }

    /// Connect to `address` and exchange ids.
    fn dial(&self, address: SocketAddr) -> Result<RingId> {
        let transport = &self.inner.transport;
        let connection = transport.connect(address)?;
        transport.set_persistent_listener(connection, self.inner.handler.clone())?;

        let request = Message::ConnectionRequest { id: self.id() };
        let expected = request.clone();

        let reply = transport.send_for_response(
            connection,
            request,
            move |message| message.is_response_to(&expected),
            self.inner.config.request_timeout,
        );

        let peer = match reply {
            Ok(Message::ConnectionAccepted { id }) => id,
            Ok(other) => {
                let _ = transport.close_connection(connection);
                return Err(unexpected_addr(address, &other));
            }
            Err(error) => {
                let _ = transport.close_connection(connection);
                return Err(error);
            }
        };

        if peer == self.id() {
            let _ = transport.close_connection(connection);
            return Err(Error::operation_failed(format!("{address} has our own id")));
        }

        // A connection the peer dialed may have been linked in the meantime,
        // this one then stays open unused.
        self.inner.links.entry(peer).or_insert(connection);

        debug!(id = %self.id(), %peer, connection, "Linked peer");

        Ok(peer)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}

impl std::fmt::Debug for RingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingNode")
            .field("id", &self.id())
            .field("local_addr", &self.local_addr())
            .field("status", &self.status())
            .finish()
    }
}

fn unreachable_peer(peer: RingId, error: Error) -> Error {
    Error::operation_failed(format!("{peer} unreachable: {error}"))
}

fn unexpected(peer: RingId, message: &Message) -> Error {
    Error::operation_failed(format!("unexpected {} from {peer}", message.kind()))
}

fn unexpected_addr(address: SocketAddr, message: &Message) -> Error {
    Error::operation_failed(format!("unexpected {} from {address}", message.kind()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    /// Two nodes, 100 and 200, linked to each other with no background rounds.
    fn two_node_ring() -> (RingNode, RingNode) {
        let peers: Vec<_> = (0..2)
            .map(|index| {
                let address = TcpListener::bind("127.0.0.1:0")
                    .unwrap()
                    .local_addr()
                    .unwrap();
                (index, address)
            })
            .collect();

        let config = |index, id| {
            Config::new(peers.iter().copied(), index)
                .with_id(RingId(id))
                .with_stabilize_interval(Duration::from_secs(600))
        };

        let a = RingNode::new(config(0, 100)).unwrap();
        let b = RingNode::new(config(1, 200)).unwrap();

        // Each round ends with an asynchronous NOTIFY.
        b.stabilize().unwrap();
        wait_until(|| a.predecessor() == Some(RingId(200)));
        a.stabilize().unwrap();
        wait_until(|| b.predecessor() == Some(RingId(100)));

        (a, b)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);

        while !condition() {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn manual_rounds_converge() {
        let (a, b) = two_node_ring();

        assert_eq!(a.successor(), RingId(200));
        assert_eq!(b.successor(), RingId(100));
        assert_eq!(b.predecessor(), Some(RingId(100)));
        assert_eq!(a.predecessor(), Some(RingId(200)));
    }

    #[test]
    fn routing_back_to_origin_is_a_cycle() {
        let (a, b) = two_node_ring();

        // From 200, the closest finger preceding 150 is 100, which stamped the lookup.
        let result = b.find_predecessor_from(RingId(150), Some(a.id()));

        assert!(matches!(result, Err(Error::OperationFailed(reason)) if reason == "cycle reached"));

        // Started at 200 the same route is fine.
        assert_eq!(b.find_predecessor(RingId(150)).unwrap(), RingId(100));
    }

    #[test]
    fn stale_finger_pointing_at_origin_is_a_cycle() {
        let (a, _b) = two_node_ring();

        {
            let mut state = a.write_state();
            state.set_successor(RingId(120));
            state.fingers.set(7, RingId(140));
        }

        // 140 precedes 300 but is also the origin of the lookup.
        let result = a.find_predecessor_from(RingId(300), Some(RingId(140)));

        assert!(matches!(result, Err(Error::OperationFailed(reason)) if reason == "cycle reached"));
    }

    #[test]
    fn handler_reaches_node_once_built() {
        let (a, _b) = two_node_ring();

        assert!(a
            .inner
            .handler
            .node()
            .is_some_and(|node| node.id() == a.id()));
    }
}
