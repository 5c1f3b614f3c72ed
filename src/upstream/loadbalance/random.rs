//! Uniform random selection over the enabled set.
//!
//! Simplified from the teacher's `RandomBalancer`, which is weighted (a
//! prefix-sum binary search over cumulative weight) — the spec's `random`
//! strategy is plain uniform; weighting lives in `weighted_round_robin`
//! instead. `rand`'s thread-local RNG is kept from the teacher's version.

use rand::Rng;

pub fn select(count: usize) -> Option<usize> {
    if count == 0 {
        return None;
    }
    let mut rng = rand::thread_rng();
    Some(rng.gen_range(0..count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_index_within_bounds() {
        for _ in 0..1000 {
            let idx = select(4).unwrap();
            assert!(idx < 4);
        }
    }

    #[test]
    fn empty_set_returns_none() {
        assert_eq!(select(0), None);
    }
}
