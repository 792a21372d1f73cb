use crate::common::RingId;

use super::finger_table::FingerTable;

#[derive(Debug, Clone)]
/// A node's view of its neighbourhood.
pub(crate) struct RingState {
    pub id: RingId,
    pub predecessor: Option<RingId>,
    pub successor: RingId,
    pub fingers: FingerTable,
}

impl RingState {
    /// A node that only knows itself.
    pub fn new(id: RingId) -> Self {
        Self {
            id,
            predecessor: None,
            successor: id,
            fingers: FingerTable::new(id),
        }
    }

    /// Set the successor and the finger mirroring it.
    pub fn set_successor(&mut self, successor: RingId) {
        self.successor = successor;
        self.fingers.set(0, successor);
    }

    /// Adopt `candidate` as predecessor if it is closer than the current one.
    ///
    /// Returns true if the predecessor changed.
    pub fn notify(&mut self, candidate: RingId) -> bool {
        if candidate == self.id {
            return false;
        }

        let closer = match self.predecessor {
            None => true,
            Some(predecessor) => candidate.is_between(predecessor, self.id),
        };

        if closer {
            self.predecessor = Some(candidate);
        }

        closer
    }

    /// Is `target` owned by our successor, making us its predecessor?
    pub fn precedes(&self, target: RingId) -> bool {
        target == self.successor || target.is_between(self.id, self.successor)
    }

    /// Drop every reference to a node we can no longer reach.
    pub fn forget(&mut self, node: RingId) {
        if self.predecessor == Some(node) {
            self.predecessor = None;
        }
        self.fingers.remove(node);
        if self.successor == node {
            self.successor = self.id;
            // Fall back to the nearest finger still alive.
            if let Some(next) = self
                .fingers
                .entries()
                .iter()
                .map(|entry| entry.successor)
                .find(|successor| *successor != self.id)
            {
                self.successor = next;
            }
        }
        self.fingers.set(0, self.successor);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn successor_mirrors_first_finger() {
        let mut state = RingState::new(RingId(10));
        state.set_successor(RingId(20));

        assert_eq!(state.successor, RingId(20));
        assert_eq!(state.fingers.get(0).unwrap().successor, RingId(20));
    }

    #[test]
    fn notify_adopts_closer_predecessor() {
        let mut state = RingState::new(RingId(100));

        assert!(state.notify(RingId(10)));
        assert!(state.notify(RingId(50)));
        assert!(!state.notify(RingId(20)));
        assert!(!state.notify(RingId(100)));
        assert_eq!(state.predecessor, Some(RingId(50)));

        // Wrapping: 200 lies after 100, so it is further away than 50.
        assert!(!state.notify(RingId(200)));
    }

    #[test]
    fn singleton_owns_everything() {
        let state = RingState::new(RingId(100));

        assert!(state.precedes(RingId(0)));
        assert!(state.precedes(RingId(100)));
        assert!(state.precedes(RingId(u32::MAX)));
    }

    #[test]
    fn precedes_includes_successor() {
        let mut state = RingState::new(RingId(100));
        state.set_successor(RingId(200));

        assert!(state.precedes(RingId(150)));
        assert!(state.precedes(RingId(200)));
        assert!(!state.precedes(RingId(100)));
        assert!(!state.precedes(RingId(201)));
    }

    #[test]
    fn forget_falls_back_to_next_finger() {
        let mut state = RingState::new(RingId(100));
        state.set_successor(RingId(200));
        state.fingers.set(9, RingId(700));
        state.predecessor = Some(RingId(200));

        state.forget(RingId(200));

        assert_eq!(state.predecessor, None);
        assert_eq!(state.successor, RingId(700));
        assert_eq!(state.fingers.get(0).unwrap().successor, RingId(700));
    }
}
