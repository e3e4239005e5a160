use matching::{DistanceType, Neighbor};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Distance between two descriptors. Euclidean is reported squared.
pub fn distance(kind: DistanceType, a: &[f32], b: &[f32]) -> f64 {
    match kind {
        DistanceType::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = (*x - *y) as f64;
                d * d
            })
            .sum(),
        DistanceType::Manhattan => a
            .iter()
            .zip(b)
            .map(|(x, y)| ((*x - *y) as f64).abs())
            .sum(),
    }
}

/// Lower bound of `distance` for points on the far side of a cutting plane
/// at `diff` from the query.
pub fn plane_bound(kind: DistanceType, diff: f64) -> f64 {
    match kind {
        DistanceType::Euclidean => diff * diff,
        DistanceType::Manhattan => diff.abs(),
    }
}

#[derive(Clone, Copy, Debug)]
struct Hit {
    dist: f64,
    row: u32,
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Hit {}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.row.cmp(&other.row))
    }
}

/// Keeps the `k` best hits seen so far, ordered by distance and then row.
pub struct KBest {
    k: usize,
    heap: BinaryHeap<Hit>,
}

impl KBest {
    pub fn new(k: usize) -> Self {
        KBest {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Distance a new hit has to beat once the collector is full.
    pub fn worst(&self) -> f64 {
        match self.heap.peek() {
            Some(hit) if self.is_full() => hit.dist,
            _ => f64::INFINITY,
        }
    }

    pub fn push(&mut self, row: u32, dist: f64) {
        if self.k == 0 {
            return;
        }
        let hit = Hit { dist, row };
        if !self.is_full() {
            self.heap.push(hit);
        } else if let Some(top) = self.heap.peek() {
            if hit < *top {
                self.heap.pop();
                self.heap.push(hit);
            }
        }
    }

    pub fn into_neighbors(self) -> Vec<Neighbor> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|hit| Neighbor::new(hit.row as usize, hit.dist))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 0.0, 3.0];
        assert_eq!(distance(DistanceType::Euclidean, &a, &b), 13.0);
        assert_eq!(distance(DistanceType::Manhattan, &a, &b), 5.0);
        assert_eq!(plane_bound(DistanceType::Euclidean, -3.0), 9.0);
        assert_eq!(plane_bound(DistanceType::Manhattan, -3.0), 3.0);
    }

    #[test]
    fn test_kbest_orders_ties_by_row() {
        let mut best = KBest::new(3);
        assert_eq!(best.worst(), f64::INFINITY);
        for (row, dist) in [(4, 2.0), (7, 1.0), (2, 2.0), (1, 9.0), (0, 2.0)] {
            best.push(row, dist);
        }
        assert!(best.is_full());
        assert_eq!(best.worst(), 2.0);
        assert_eq!(
            best.into_neighbors(),
            vec![
                Neighbor::new(7, 1.0),
                Neighbor::new(0, 2.0),
                Neighbor::new(2, 2.0)
            ]
        );
    }
}
