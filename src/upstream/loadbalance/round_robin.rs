//! Plain round-robin: a monotonic cursor advancing exactly once per `select`,
//! ignoring weight entirely (weighted selection is `weighted_round_robin`'s job).
//!
//! Grounded on the teacher's `RoundRobinBalancer` cursor/`ArcSwap`-free shape,
//! simplified from its prefix-sum weighting since plain round-robin has none.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct RoundRobinState {
    cursor: AtomicU64,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some((n as usize) % count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_every_index_in_order() {
        let rr = RoundRobinState::new();
        assert_eq!(rr.select(3), Some(0));
        assert_eq!(rr.select(3), Some(1));
        assert_eq!(rr.select(3), Some(2));
        assert_eq!(rr.select(3), Some(0));
    }

    #[test]
    fn empty_set_returns_none() {
        let rr = RoundRobinState::new();
        assert_eq!(rr.select(0), None);
    }
}
