//! One TCP stream: framed writes and in-order dispatch of what it reads.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::{Error, Result};

use super::inflight_requests::{InflightRequests, PendingRequest};
use super::{ConnectionId, Listener, Payload};

/// Size of the big endian length prefix in front of every frame.
const LENGTH_PREFIX: usize = 4;

pub(crate) struct Connection<M> {
    id: ConnectionId,
    peer_addr: SocketAddr,
    /// Every frame is written with one `write_all` under this lock.
    writer: Mutex<TcpStream>,
    inflight: Mutex<InflightRequests<M>>,
    listener: Mutex<Option<Arc<dyn Listener<M>>>>,
    closed: AtomicBool,
}

impl<M: Payload> Connection<M> {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        listener: Option<Arc<dyn Listener<M>>>,
    ) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;

        Ok(Self {
            id,
            peer_addr,
            writer: Mutex::new(stream),
            inflight: Mutex::new(InflightRequests::new()),
            listener: Mutex::new(listener),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encode and write a single frame.
    pub fn write(&self, message: &M) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected(self.id));
        }

        let frame = encode_frame(message)?;

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&frame)?;
        writer.flush()?;

        trace!(context = "connection_message_sending", connection = self.id, ?message);

        Ok(())
    }

    /// Register a request before its message is written, so an early reply can't slip by.
    pub fn register(&self, request: Arc<PendingRequest<M>>) -> Result<()> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);

        // Checked under the same lock `teardown` drains with.
        if self.is_closed() {
            return Err(Error::NotConnected(self.id));
        }

        inflight.add(request);
        Ok(())
    }

    #[cfg(test)]
    pub fn shutdown_write(&self) {
        let _ = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown(Shutdown::Write);
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn Listener<M>>>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Hand an inbound message to the first pending request that accepts it,
    /// or to the persistent listener.
    pub fn dispatch(&self, message: M) {
        trace!(context = "connection_message_receiving", connection = self.id, ?message);

        let claimed = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_match(&message);

        if let Some(on_result) = claimed {
            on_result(Ok(message));
            return;
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match listener {
            Some(listener) => listener.on_message(self.id, message),
            None => {
                debug!(connection = self.id, ?message, "Dropping unclaimed message, no listener");
            }
        }
    }

    /// Mark closed and shut the socket down, unblocking the reader.
    ///
    /// Returns `false` if the connection was already torn down. Everything still
    /// waiting on this connection is resolved with a receive error and the
    /// listener hears about `error` once.
    pub fn teardown(&self, error: &Error) -> bool {
        let pending = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);

            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }

            inflight.drain()
        };

        let _ = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown(Shutdown::Both);

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(listener) = listener {
            listener.on_error(self.id, error);
        }

        let reason = error.to_string();
        for request in pending {
            request.resolve(Err(Error::Receive(reason.clone())));
        }

        true
    }
}

/// Blocks until one whole frame is read and decoded.
pub(crate) fn read_frame<M: Payload>(reader: &mut impl Read, max_frame_size: usize) -> Result<M> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix)?;

    let length = u32::from_be_bytes(prefix) as usize;
    if length > max_frame_size {
        return Err(Error::Receive(format!(
            "frame of {length} bytes exceeds the {max_frame_size} bytes limit"
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;

    Ok(serde_bencode::from_bytes(&body)?)
}

fn encode_frame<M: Payload>(message: &M) -> Result<Vec<u8>> {
    let body = serde_bencode::to_bytes(message)?;

    let length = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&body);

    Ok(frame)
}
