use crate::check_shape;
use crate::distance::{distance, KBest};
use matching::{Dataset, DistanceType, Neighbor, Result};
use rayon::prelude::*;

/// Exact search over every row.
pub struct LinearIndex {
    distance: DistanceType,
    rows: usize,
}

impl LinearIndex {
    pub fn new(distance: DistanceType, rows: usize) -> Self {
        LinearIndex { distance, rows }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn distance(&self) -> DistanceType {
        self.distance
    }

    pub fn knn(&self, dataset: &Dataset, queries: &Dataset, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        check_shape(self.rows, dataset, queries)?;
        Ok((0..queries.len())
            .into_par_iter()
            .map(|i| {
                let q = queries.vector(i);
                let mut best = KBest::new(k);
                for row in 0..dataset.len() {
                    best.push(row as u32, distance(self.distance, q, dataset.vector(row)));
                }
                best.into_neighbors()
            })
            .collect())
    }
}
