//! Background stabilization thread.

use std::io;
use std::sync::Weak;
use std::thread;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tracing::trace;

use super::{Inner, RingNode};

/// Run [RingNode::maintain] every `interval` until `stop` fires, its sender is
/// dropped, or the node itself is gone.
///
/// Rounds never overlap: the next wait only starts once a round, remote calls
/// included, has finished.
pub(super) fn spawn(
    node: Weak<Inner>,
    interval: Duration,
    stop: Receiver<()>,
) -> io::Result<()> {
    thread::Builder::new()
        .name("ring-maintenance".to_string())
        .spawn(move || {
            loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                // Only held for the round.
                let Some(inner) = node.upgrade() else {
                    break;
                };
                RingNode { inner }.maintain();
            }

            trace!(context = "ring_maintenance", "Maintenance loop exiting");
        })?;

    Ok(())
}
