use std::collections::BTreeSet;

use super::ConnectionId;

#[derive(Debug, Default)]
/// Allocator for connection ids that always hands out the smallest free id.
pub(crate) struct ConnectionIds {
    /// Every id below `next` is either in use or in `free`.
    next: ConnectionId,
    free: BTreeSet<ConnectionId>,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> ConnectionId {
        if let Some(id) = self.free.pop_first() {
            return id;
        }

        let id = self.next;
        self.next += 1;
        id
    }

    pub fn release(&mut self, id: ConnectionId) {
        if id >= self.next || !self.free.insert(id) {
            return;
        }

        // Trailing free ids fold back into `next`.
        while self.next > 0 && self.free.remove(&(self.next - 1)) {
            self.next -= 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequential() {
        let mut ids = ConnectionIds::new();

        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);
    }

    #[test]
    fn reuse_highest() {
        let mut ids = ConnectionIds::new();
        for _ in 0..4 {
            ids.allocate();
        }

        ids.release(3);

        assert_eq!(ids.allocate(), 3);
        assert_eq!(ids.allocate(), 4);
    }

    #[test]
    fn reuse_smallest_first() {
        let mut ids = ConnectionIds::new();
        for _ in 0..5 {
            ids.allocate();
        }

        ids.release(1);
        ids.release(3);

        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 3);
        assert_eq!(ids.allocate(), 5);
    }

    #[test]
    fn release_all_resets() {
        let mut ids = ConnectionIds::new();
        for _ in 0..3 {
            ids.allocate();
        }

        ids.release(0);
        ids.release(2);
        ids.release(1);

        assert!(ids.free.is_empty());
        assert_eq!(ids.allocate(), 0);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut ids = ConnectionIds::new();
        ids.allocate();
        ids.allocate();

        ids.release(0);
        ids.release(0);
        ids.release(7);

        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 2);
    }
}
