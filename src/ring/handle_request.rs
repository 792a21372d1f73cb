use std::thread;

use dashmap::mapref::entry::Entry;
use tracing::{debug, trace};

use crate::common::{Message, RingId};
use crate::transport::{ConnectionId, Listener};
use crate::Error;

use super::{Handler, RingNode};

impl Listener<Message> for Handler {
    fn on_message(&self, connection: ConnectionId, message: Message) {
        match self.node() {
            Some(node) => node.handle_request(connection, message),
            None => trace!(context = "ring_handler", connection, ?message, "Node gone, dropping"),
        }
    }

    fn on_error(&self, connection: ConnectionId, error: &Error) {
        if let Some(node) = self.node() {
            node.unlink(connection, error);
        }
    }
}

impl Handler {
    pub(super) fn node(&self) -> Option<RingNode> {
        self.node
            .get()
            .and_then(|node| node.upgrade())
            .map(|inner| RingNode { inner })
    }
}

impl RingNode {
    /// Answer an inbound ring request.
    ///
    /// Runs on the connection's receive thread, so anything that may call out to
    /// other nodes is moved to a worker thread.
    pub(super) fn handle_request(&self, connection: ConnectionId, message: Message) {
        let reply = match message {
            Message::ConnectionRequest { id } => {
                self.accept_link(connection, id);
                return;
            }
            Message::GetPredecessor => Message::GetPredecessorResponse {
                result: self.predecessor(),
            },
            Message::GetSuccessor => Message::GetSuccessorResponse {
                result: self.successor(),
            },
            Message::Notify { target } => {
                self.notify_from_predecessor(target);
                return;
            }
            Message::FindPredecessor { .. } | Message::FindSuccessor { .. } => {
                let node = self.clone();
                let spawned = thread::Builder::new()
                    .name(format!("lookup-{}", self.id()))
                    .spawn(move || {
                        let reply = node.answer_lookup(message);
                        node.reply(connection, reply);
                    });

                if let Err(error) = spawned {
                    debug!(id = %self.id(), %error, "Failed to spawn lookup worker");
                }
                return;
            }
            response => {
                // A reply whose request already timed out.
                trace!(context = "ring_handler", id = %self.id(), connection, ?response, "Dropping unclaimed response");
                return;
            }
        };

        self.reply(connection, reply);
    }

    /// Resolve a FIND_* request into its response.
    fn answer_lookup(&self, request: Message) -> Message {
        match request {
            Message::FindPredecessor { target, origin } => {
                let result = self.find_predecessor_from(target, origin);
                if let Err(error) = &result {
                    debug!(id = %self.id(), %target, %error, "Remote find_predecessor failed");
                }

                Message::FindPredecessorResponse {
                    target,
                    success: result.is_ok(),
                    result: result.ok(),
                }
            }
            Message::FindSuccessor { target } => {
                let result = self.find_successor(target);
                if let Err(error) = &result {
                    debug!(id = %self.id(), %target, %error, "Remote find_successor failed");
                }

                Message::FindSuccessorResponse {
                    target,
                    success: result.is_ok(),
                    result: result.ok(),
                }
            }
            other => other,
        }
    }

    fn reply(&self, connection: ConnectionId, reply: Message) {
        if let Err(error) = self.inner.transport.send(connection, reply) {
            debug!(id = %self.id(), connection, %error, "Failed to send reply");
        }
    }

    /// Link the peer that dialed us, unless a connection to it is already linked.
    fn accept_link(&self, connection: ConnectionId, peer: RingId) {
        if peer == self.id() {
            debug!(id = %self.id(), connection, "Peer claims our own id, closing");
            let _ = self.inner.transport.close_connection(connection);
            return;
        }

        match self.inner.links.entry(peer) {
            Entry::Occupied(existing) => {
                debug!(
                    id = %self.id(),
                    %peer,
                    connection,
                    existing = *existing.get(),
                    "Duplicate connection request, closing"
                );
                drop(existing);
                let _ = self.inner.transport.close_connection(connection);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(connection);
                trace!(context = "ring_link", id = %self.id(), %peer, connection);

                self.reply(connection, Message::ConnectionAccepted { id: self.id() });
            }
        }
    }

    /// Forget the peers reached through a connection that just closed.
    fn unlink(&self, connection: ConnectionId, error: &Error) {
        let mut lost = Vec::new();
        self.inner.links.retain(|peer, linked| {
            if *linked == connection {
                lost.push(*peer);
                false
            } else {
                true
            }
        });

        if lost.is_empty() {
            return;
        }

        let mut state = self.write_state();
        for peer in lost {
            debug!(id = %self.id(), %peer, connection, %error, "Lost connection to peer");
            state.forget(peer);
        }
    }
}
