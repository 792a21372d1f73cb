//! Deadline thread shared by every connection of a [super::Transport].

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::{Error, Result};

use super::inflight_requests::{OnResult, PendingRequest};

/// A request to time out `request` once `at` has passed.
pub struct Deadline<M> {
    at: Instant,
    timeout: Duration,
    request: Weak<PendingRequest<M>>,
}

impl<M> Deadline<M> {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration, request: &Arc<PendingRequest<M>>) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
            request: Arc::downgrade(request),
        }
    }
}

impl<M> PartialEq for Deadline<M> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl<M> Eq for Deadline<M> {}

impl<M> PartialOrd for Deadline<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Deadline<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at)
    }
}

/// Spawn the timer thread, it exits once every [Sender] is dropped.
pub fn spawn<M>() -> std::io::Result<Sender<Deadline<M>>>
where
    M: Debug + Send + Sync + 'static,
{
    let (sender, receiver) = flume::unbounded();

    thread::Builder::new()
        .name("transport-timer".to_string())
        .spawn(move || run(receiver))?;

    Ok(sender)
}

fn run<M: Debug + Send + 'static>(receiver: Receiver<Deadline<M>>) {
    let mut deadlines: BinaryHeap<Reverse<Deadline<M>>> = BinaryHeap::new();

    loop {
        let received = match deadlines.peek() {
            Some(Reverse(next)) => receiver.recv_deadline(next.at),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(deadline) => deadlines.push(Reverse(deadline)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();

        while deadlines
            .peek()
            .is_some_and(|Reverse(deadline)| deadline.at <= now)
        {
            let Some(Reverse(deadline)) = deadlines.pop() else {
                break;
            };

            // Already answered and forgotten by its connection.
            let Some(request) = deadline.request.upgrade() else {
                continue;
            };

            match request.claim() {
                Some(on_result) => {
                    debug!(request = ?request.request(), timeout = ?deadline.timeout, "Request timed out");
                    deliver(on_result, Err(Error::Timeout(deadline.timeout)));
                }
                None => trace!(context = "transport_timer", "Deadline passed after resolution"),
            }
        }
    }

    trace!(context = "transport_timer", "Timer thread exiting");
}

/// Run a claimed timeout callback on its own thread.
///
/// The timer thread never runs callbacks itself, a slow or blocking one would
/// otherwise hold back every later deadline.
fn deliver<M: Send + 'static>(on_result: OnResult<M>, result: Result<M>) {
    let slot = Arc::new(Mutex::new(Some((on_result, result))));
    let pending = slot.clone();

    let spawned = thread::Builder::new()
        .name("transport-timeout".to_string())
        .spawn(move || run_slot(&pending));

    if let Err(error) = spawned {
        debug!(?error, "Failed to spawn timeout thread, resolving inline");
        run_slot(&slot);
    }
}

type Slot<M> = Mutex<Option<(OnResult<M>, Result<M>)>>;

fn run_slot<M>(slot: &Slot<M>) {
    let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();

    if let Some((on_result, result)) = taken {
        on_result(result);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let sender = spawn::<u32>().unwrap();
        let (tx, rx) = flume::unbounded();

        let mut requests = vec![];
        for (label, millis) in [(1u32, 120u64), (2, 40), (3, 80)] {
            let tx = tx.clone();
            let request = Arc::new(PendingRequest::new(
                label,
                Box::new(|_: &u32| false),
                Box::new(move |result| {
                    assert!(matches!(result, Err(Error::Timeout(_))));
                    let _ = tx.send(label);
                }),
            ));
            sender
                .send(Deadline::after(Duration::from_millis(millis), &request))
                .unwrap();
            requests.push(request);
        }

        let order: Vec<u32> = (0..3).map(|_| rx.recv().unwrap()).collect();

        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn resolved_requests_are_not_timed_out() {
        let sender = spawn::<u32>().unwrap();
        let (tx, rx) = flume::unbounded();

        let request = Arc::new(PendingRequest::new(
            0u32,
            Box::new(|_: &u32| true),
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        ));
        sender
            .send(Deadline::after(Duration::from_millis(20), &request))
            .unwrap();

        assert!(request.resolve(Ok(1)));
        assert!(rx.recv().unwrap());

        std::thread::sleep(Duration::from_millis(60));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn slow_callback_does_not_hold_back_later_deadlines() {
        let sender = spawn::<u32>().unwrap();
        let (tx, rx) = flume::unbounded();

        let slow = Arc::new(PendingRequest::new(
            1u32,
            Box::new(|_: &u32| false),
            Box::new(|_| thread::sleep(Duration::from_millis(1500))),
        ));
        let fast = Arc::new(PendingRequest::new(
            2u32,
            Box::new(|_: &u32| false),
            Box::new(move |result| {
                let _ = tx.send(result.is_err());
            }),
        ));

        let started = Instant::now();
        sender
            .send(Deadline::after(Duration::from_millis(20), &slow))
            .unwrap();
        sender
            .send(Deadline::after(Duration::from_millis(60), &fast))
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(started.elapsed() < Duration::from_millis(1000));
    }
}
