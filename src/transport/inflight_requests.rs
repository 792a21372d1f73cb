use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::Result;

/// Decides whether an inbound message is the reply a request is waiting for.
pub type Filter<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;
/// Receives the single outcome of a correlated request.
pub type OnResult<M> = Box<dyn FnOnce(Result<M>) + Send>;

/// A correlated send waiting for its filtered reply, its deadline, or the
/// connection to die, whichever comes first.
pub struct PendingRequest<M> {
    request: M,
    filter: Filter<M>,
    resolved: AtomicBool,
    on_result: Mutex<Option<OnResult<M>>>,
}

impl<M> PendingRequest<M> {
    pub fn new(request: M, filter: Filter<M>, on_result: OnResult<M>) -> Self {
        Self {
            request,
            filter,
            resolved: AtomicBool::new(false),
            on_result: Mutex::new(Some(on_result)),
        }
    }

    pub fn request(&self) -> &M {
        &self.request
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub fn accepts(&self, message: &M) -> bool {
        !self.is_resolved() && (self.filter)(message)
    }

    /// Win the right to resolve this request.
    ///
    /// Only the first caller gets the callback, every later claim is `None`.
    pub fn claim(&self) -> Option<OnResult<M>> {
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        self.on_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Claim and resolve in one go, returns `false` if someone else already won.
    pub fn resolve(&self, result: Result<M>) -> bool {
        match self.claim() {
            Some(on_result) => {
                on_result(result);
                true
            }
            None => false,
        }
    }
}

impl<M: Debug> Debug for PendingRequest<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request", &self.request)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[derive(Debug)]
/// Outstanding requests of one connection, in registration order.
pub struct InflightRequests<M> {
    requests: Vec<Arc<PendingRequest<M>>>,
}

impl<M> InflightRequests<M> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    pub fn add(&mut self, request: Arc<PendingRequest<M>>) {
        self.cleanup();
        self.requests.push(request);
    }

    /// Find the first request accepting `message` and claim it.
    ///
    /// A request that accepts but loses the claim to its timer is skipped,
    /// the message is then offered to the next one.
    pub fn take_match(&mut self, message: &M) -> Option<OnResult<M>> {
        let mut claimed = None;

        for request in &self.requests {
            if request.accepts(message) {
                if let Some(on_result) = request.claim() {
                    claimed = Some(on_result);
                    break;
                }
            }
        }

        self.cleanup();
        claimed
    }

    /// Remove every request, resolved or not.
    pub fn drain(&mut self) -> Vec<Arc<PendingRequest<M>>> {
        std::mem::take(&mut self.requests)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Drop requests already resolved by their timer.
    fn cleanup(&mut self) {
        self.requests.retain(|request| !request.is_resolved());
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn pending(
        expected: u32,
        calls: &Arc<AtomicUsize>,
    ) -> Arc<PendingRequest<u32>> {
        let calls = calls.clone();

        Arc::new(PendingRequest::new(
            0,
            Box::new(move |message: &u32| *message == expected),
            Box::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }

    #[test]
    fn resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let request = pending(1, &calls);

        assert!(request.resolve(Ok(1)));
        assert!(!request.resolve(Ok(1)));
        assert!(request.claim().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_match_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut inflight = InflightRequests::new();

        let first = pending(5, &calls);
        let second = pending(5, &calls);
        inflight.add(first.clone());
        inflight.add(second.clone());

        let on_result = inflight.take_match(&5).unwrap();
        on_result(Ok(5));

        assert!(first.is_resolved());
        assert!(!second.is_resolved());
        assert_eq!(inflight.len(), 1);
    }

    #[test]
    fn skips_requests_resolved_by_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut inflight = InflightRequests::new();

        let timed_out = pending(5, &calls);
        let waiting = pending(5, &calls);
        inflight.add(timed_out.clone());
        inflight.add(waiting.clone());

        assert!(timed_out.resolve(Err(crate::Error::Timeout(Default::default()))));

        assert!(inflight.take_match(&5).is_some());
        assert!(waiting.is_resolved());
        assert_eq!(inflight.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_match() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut inflight = InflightRequests::new();
        inflight.add(pending(5, &calls));

        assert!(inflight.take_match(&6).is_none());
        assert_eq!(inflight.len(), 1);
    }
}
