//! Generic request/response transport over persistent TCP connections.
//!
//! A [Transport] owns a table of connections, each identified by a small reusable
//! [ConnectionId] and served by its own receive thread. On top of plain
//! fire-and-forget [Transport::send] it correlates replies: a request registers a
//! filter, and the first inbound message that passes the filter resolves it, unless
//! its deadline passes first. Messages no request claims go to the connection's
//! persistent [Listener].
//!
//! Nothing here knows about the ring; any serde message type works.

mod config;
mod connection;
mod connection_ids;
mod inflight_requests;
mod timer;

use std::fmt::{self, Debug, Formatter};
use std::io::{self, BufReader, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use flume::Sender;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, trace};

use crate::common::Message;
use crate::{Error, Result};

use connection::{read_frame, Connection};
use connection_ids::ConnectionIds;
use inflight_requests::PendingRequest;
use timer::Deadline;

pub use config::{
    Config, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_REQUEST_TIMEOUT,
};

/// Identifier of an open connection, the smallest free one is handed out first.
pub type ConnectionId = usize;

/// The maximum duration the accept loop sleeps when no connection is waiting.
const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Anything that can travel over a [Transport].
pub trait Payload: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static
{}

/// Standing handler for inbound messages that no pending request claimed.
pub trait Listener<M>: Send + Sync {
    /// Called on the connection's receive thread, in arrival order.
    fn on_message(&self, connection: ConnectionId, message: M);

    /// Called once when the connection is torn down.
    fn on_error(&self, connection: ConnectionId, error: &Error) {
        let _ = (connection, error);
    }
}

impl<M, F> Listener<M> for F
where
    F: Fn(ConnectionId, M) + Send + Sync,
{
    fn on_message(&self, connection: ConnectionId, message: M) {
        self(connection, message)
    }
}

/// Connection table and reply correlation, cheap to clone.
pub struct Transport<M: Payload = Message> {
    shared: Arc<Shared<M>>,
}

struct Shared<M> {
    config: Config,
    connections: DashMap<ConnectionId, Arc<Connection<M>>>,
    ids: Mutex<ConnectionIds>,
    timer: Sender<Deadline<M>>,
    shutdown: AtomicBool,
}

impl<M: Payload> Clone for Transport<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Payload> Transport<M> {
    pub fn new(config: Config) -> Result<Self> {
        let timer = timer::spawn()?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                connections: DashMap::new(),
                ids: Mutex::new(ConnectionIds::new()),
                timer,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    // === Getters ===

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Ids of the currently open connections, ascending.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .shared
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remote address of an open connection.
    pub fn peer_addr(&self, id: ConnectionId) -> Result<SocketAddr> {
        Ok(self.connection(id)?.peer_addr())
    }

    // === Public Methods ===

    /// Accept connections on `address` in a background thread.
    ///
    /// Each accepted connection starts out with `listener` as its persistent listener.
    /// Returns the bound address, useful when binding port `0`.
    pub fn listen(
        &self,
        address: impl ToSocketAddrs,
        listener: Arc<dyn Listener<M>>,
    ) -> Result<SocketAddr> {
        let socket = TcpListener::bind(address).map_err(Error::Connection)?;

        self.serve(socket, listener)
    }

    /// Accept connections on an already bound `socket` in a background thread.
    ///
    /// Lets a caller learn the bound address before anything is accepted.
    pub fn serve(&self, socket: TcpListener, listener: Arc<dyn Listener<M>>) -> Result<SocketAddr> {
        let local_addr = socket.local_addr().map_err(Error::Connection)?;
        socket.set_nonblocking(true).map_err(Error::Connection)?;

        let transport = self.clone();

        thread::Builder::new()
            .name(format!("accept-{}", local_addr.port()))
            .spawn(move || transport.accept_loop(socket, listener))?;

        info!(?local_addr, "Transport listening");

        Ok(local_addr)
    }

    /// Dial `address` and start receiving on the new connection.
    ///
    /// Messages arriving before [Self::set_persistent_listener] is called, and not
    /// claimed by a request, are dropped.
    pub fn connect(&self, address: impl ToSocketAddrs) -> Result<ConnectionId> {
        let timeout = self.shared.config.connect_timeout;
        let mut last_error = io::Error::new(ErrorKind::InvalidInput, "no address to connect to");

        for address in address.to_socket_addrs().map_err(Error::Connection)? {
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(stream) => return self.register(stream, None),
                Err(error) => {
                    trace!(context = "transport_connect", ?address, ?error);
                    last_error = error;
                }
            }
        }

        Err(Error::Connection(last_error))
    }

    /// Fire and forget.
    pub fn send(&self, id: ConnectionId, message: M) -> Result<()> {
        let connection = self.connection(id)?;

        connection
            .write(&message)
            .inspect_err(|error| self.shared.abort_on_write_error(&connection, error))
    }

    /// Send `message` and block until a reply passing `filter` arrives.
    ///
    /// Fails with [Error::Timeout] if nothing matches within `timeout`, counted from
    /// the moment the message was written, and with [Error::Receive] if the
    /// connection dies first.
    ///
    /// Must not be called from this same connection's receive thread (that is, from
    /// its [Listener] or an async callback), since that thread is the one that would
    /// deliver the reply.
    pub fn send_for_response<F>(
        &self,
        id: ConnectionId,
        message: M,
        filter: F,
        timeout: Duration,
    ) -> Result<M>
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        let (sender, receiver) = flume::bounded(1);

        self.send_for_response_with(id, message, filter, timeout, move |result| {
            let _ = sender.send(result);
        })?;

        receiver
            .recv()
            .map_err(|_| Error::Receive("request dropped before resolution".to_string()))?
    }

    /// Non blocking flavour of [Self::send_for_response].
    ///
    /// `on_result` is called exactly once: on the connection's receive thread for a
    /// reply or a receive error, on a thread of its own for a timeout, and on the
    /// calling thread if writing the request fails. An `Err` return means the
    /// request was never issued and `on_result` will not be called.
    pub fn send_for_response_with<F, C>(
        &self,
        id: ConnectionId,
        message: M,
        filter: F,
        timeout: Duration,
        on_result: C,
    ) -> Result<()>
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
        C: FnOnce(Result<M>) + Send + 'static,
    {
        let connection = self.connection(id)?;

        let request = Arc::new(PendingRequest::new(
            message,
            Box::new(filter),
            Box::new(on_result),
        ));

        connection.register(request.clone())?;

        if let Err(error) = connection.write(request.request()) {
            debug!(connection = id, ?error, "Error sending request message");
            let broken = write_failure(&error);
            request.resolve(Err(error));

            if let Some(reason) = broken {
                self.shared.teardown(&connection, &reason);
            }
            return Ok(());
        }

        // Round trip time is measured from the wire.
        let _ = self.shared.timer.send(Deadline::after(timeout, &request));

        Ok(())
    }

    /// [Self::send_for_response] with the configured default timeout.
    pub fn request<F>(&self, id: ConnectionId, message: M, filter: F) -> Result<M>
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        let timeout = self.shared.config.request_timeout;
        self.send_for_response(id, message, filter, timeout)
    }

    /// Replace the connection's persistent listener.
    pub fn set_persistent_listener(
        &self,
        id: ConnectionId,
        listener: Arc<dyn Listener<M>>,
    ) -> Result<()> {
        self.connection(id)?.set_listener(Some(listener));
        Ok(())
    }

    /// Close a connection, its id is free for reuse once this returns.
    pub fn close_connection(&self, id: ConnectionId) -> Result<()> {
        let connection = self.connection(id)?;

        self.shared.teardown(
            &connection,
            &Error::Receive("connection closed locally".to_string()),
        );

        Ok(())
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);

        for id in self.connections() {
            let _ = self.close_connection(id);
        }
    }

    // === Private Methods ===

    fn connection(&self, id: ConnectionId) -> Result<Arc<Connection<M>>> {
        self.shared
            .connections
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotConnected(id))
    }

    fn register(
        &self,
        stream: TcpStream,
        listener: Option<Arc<dyn Listener<M>>>,
    ) -> Result<ConnectionId> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let id = self
            .shared
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate();

        let connection = match Connection::new(id, stream, listener) {
            Ok(connection) => Arc::new(connection),
            Err(error) => {
                self.shared.release(id);
                return Err(error.into());
            }
        };

        self.shared.connections.insert(id, connection.clone());

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("connection-{id}"))
            .spawn(move || shared.receive_loop(connection, reader));

        if let Err(error) = spawned {
            if let Ok(connection) = self.connection(id) {
                self.shared.teardown(&connection, &Error::Io(io::Error::other("spawn failed")));
            }
            return Err(error.into());
        }

        debug!(connection = id, "Connection opened");

        Ok(id)
    }

    fn accept_loop(&self, socket: TcpListener, listener: Arc<dyn Listener<M>>) {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            match socket.accept() {
                Ok((stream, from)) => match self.register(stream, Some(listener.clone())) {
                    Ok(id) => trace!(context = "transport_accept", connection = id, ?from),
                    Err(error) => debug!(?from, ?error, "Failed to register accepted connection"),
                },
                Err(ref error) if error.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(MAX_THREAD_BLOCK_DURATION);
                }
                Err(error) => {
                    debug!(?error, "accept failed unexpectedly");
                    thread::sleep(MAX_THREAD_BLOCK_DURATION);
                }
            }
        }

        trace!(context = "transport_accept", "Accept loop exiting");
    }
}

impl<M: Payload> Shared<M> {
    fn receive_loop(&self, connection: Arc<Connection<M>>, reader: TcpStream) {
        let mut reader = BufReader::new(reader);

        let error = loop {
            match read_frame(&mut reader, self.config.max_frame_size) {
                Ok(message) => connection.dispatch(message),
                Err(error) => break error,
            }
        };

        if self.teardown(&connection, &error) {
            debug!(connection = connection.id(), %error, "Connection closed");
        }
    }

    /// Tear the connection down and free its id, a no-op the second time.
    fn teardown(&self, connection: &Arc<Connection<M>>, error: &Error) -> bool {
        if !connection.teardown(error) {
            return false;
        }

        let id = connection.id();
        self.connections
            .remove_if(&id, |_, current| Arc::ptr_eq(current, connection));
        self.release(id);

        true
    }

    /// A failed socket write may have left half a frame on the stream, nothing
    /// can follow it.
    fn abort_on_write_error(&self, connection: &Arc<Connection<M>>, error: &Error) {
        if let Some(reason) = write_failure(error) {
            self.teardown(connection, &reason);
        }
    }

    fn release(&self, id: ConnectionId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(id);
    }
}

/// The teardown reason for a write error that broke the stream, `None` for
/// errors raised before any byte was written.
fn write_failure(error: &Error) -> Option<Error> {
    match error {
        Error::Io(io_error) => Some(Error::Receive(format!("write failed: {io_error}"))),
        _ => None,
    }
}

impl<M: Payload> Debug for Transport<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.shared.config)
            .field("connections", &self.connections())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;

    use crate::common::RingId;

    use super::*;

    #[test]
    fn write_failure_tears_connection_down() {
        // Accepts but never reads, so nothing closes the streams from that side.
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = server.local_addr().unwrap();

        let client: Transport<Message> = Transport::new(Config::default()).unwrap();
        let first = client.connect(address).unwrap();
        let second = client.connect(address).unwrap();
        let _accepted = (server.accept().unwrap(), server.accept().unwrap());

        client.connection(first).unwrap().shutdown_write();

        let result = client.send(first, Message::Notify { target: RingId(1) });

        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(client.connections(), vec![second]);
        assert!(matches!(
            client.peer_addr(first),
            Err(Error::NotConnected(_))
        ));

        client.connection(second).unwrap().shutdown_write();
        let (tx, rx) = flume::bounded(1);

        client
            .send_for_response_with(
                second,
                Message::GetSuccessor,
                |_| true,
                Duration::from_secs(5),
                move |result| {
                    let _ = tx.send(result);
                },
            )
            .unwrap();

        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Io(_))));
        assert!(client.connections().is_empty());
    }

    #[test]
    fn serve_uses_prebound_socket() {
        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = socket.local_addr().unwrap();

        let server: Transport<Message> = Transport::new(Config::default()).unwrap();
        let responder = server.clone();
        let served = server
            .serve(
                socket,
                Arc::new(move |connection: ConnectionId, _: Message| {
                    let reply = Message::GetSuccessorResponse { result: RingId(3) };
                    let _ = responder.send(connection, reply);
                }),
            )
            .unwrap();
        assert_eq!(served, bound);

        let client: Transport<Message> = Transport::new(Config::default()).unwrap();
        let connection = client.connect(bound).unwrap();

        let reply = client
            .request(connection, Message::GetSuccessor, |message| {
                message.is_response_to(&Message::GetSuccessor)
            })
            .unwrap();

        assert_eq!(reply, Message::GetSuccessorResponse { result: RingId(3) });
    }
}
