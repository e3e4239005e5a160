use crate::cache::save_atomic;
use crate::error::{MatchingError, Result};
use crate::feature::Dataset;
use crate::params::SearchParams;
use log::{info, warn};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::time::Instant;

/// One nearest-neighbour hit: a dataset row and its descriptor distance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub dist: f64,
}

impl Neighbor {
    pub fn new(row: usize, dist: f64) -> Self {
        Neighbor { row, dist }
    }
}

/// A searchable structure over the vectors of a dataset. The index does not
/// own the vectors, they are handed in again on every search.
pub trait NeighborIndex: Send + Sync {
    /// Up to `k` neighbours for every row of `queries`, nearest first.
    fn knn(&self, dataset: &Dataset, queries: &Dataset, k: usize) -> Result<Vec<Vec<Neighbor>>>;

    fn save(&self, out: &mut dyn Write) -> Result<()>;
}

pub trait IndexBuilder: Send + Sync {
    fn build(&self, dataset: &Dataset, params: &SearchParams) -> Result<Box<dyn NeighborIndex>>;

    /// Reads a saved index. `Ok(None)` means the file does not describe
    /// `dataset` and must be rebuilt.
    fn load(
        &self,
        input: &mut dyn Read,
        dataset: &Dataset,
        params: &SearchParams,
    ) -> Result<Option<Box<dyn NeighborIndex>>>;
}

/// Loads the index cached at `path`, or builds it and stores it there.
pub fn open_index(
    builder: &dyn IndexBuilder,
    dataset: &Dataset,
    params: &SearchParams,
    path: &Path,
) -> Result<Box<dyn NeighborIndex>> {
    if path.exists() {
        let start = Instant::now();
        let file = File::open(path).map_err(|e| MatchingError::io(path, e))?;
        let mut reader = BufReader::new(file);
        if let Some(index) = builder.load(&mut reader, dataset, params)? {
            info!(
                "index load of {} took {:.3}s",
                path.display(),
                start.elapsed().as_secs_f64()
            );
            return Ok(index);
        }
        warn!(
            "cached index {} does not match its dataset, rebuilding",
            path.display()
        );
    }

    info!("creating {}", path.display());
    let start = Instant::now();
    let index = builder.build(dataset, params)?;
    info!(
        "index creation took {:.3}s",
        start.elapsed().as_secs_f64()
    );
    save_atomic(path, |out| index.save(out))?;
    Ok(index)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Exhaustive euclidean search that counts how often it had to build.
    #[derive(Default)]
    pub struct CountingBuilder {
        pub builds: AtomicUsize,
    }

    impl CountingBuilder {
        pub fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    struct Exhaustive {
        rows: usize,
    }

    impl NeighborIndex for Exhaustive {
        fn knn(&self, dataset: &Dataset, queries: &Dataset, k: usize) -> Result<Vec<Vec<Neighbor>>> {
            Ok((0..queries.len())
                .map(|i| {
                    let q = queries.vector(i);
                    let mut hits: Vec<Neighbor> = (0..dataset.len())
                        .map(|row| {
                            let dist = q
                                .iter()
                                .zip(dataset.vector(row))
                                .map(|(a, b)| ((a - b) as f64).powi(2))
                                .sum();
                            Neighbor::new(row, dist)
                        })
                        .collect();
                    hits.sort_by(|a, b| a.dist.total_cmp(&b.dist).then(a.row.cmp(&b.row)));
                    hits.truncate(k);
                    hits
                })
                .collect())
        }

        fn save(&self, out: &mut dyn Write) -> Result<()> {
            serde_json::to_writer(out, &self.rows)?;
            Ok(())
        }
    }

    impl IndexBuilder for CountingBuilder {
        fn build(&self, dataset: &Dataset, _params: &SearchParams) -> Result<Box<dyn NeighborIndex>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Exhaustive { rows: dataset.len() }))
        }

        fn load(
            &self,
            input: &mut dyn Read,
            dataset: &Dataset,
            _params: &SearchParams,
        ) -> Result<Option<Box<dyn NeighborIndex>>> {
            let rows: usize = serde_json::from_reader(input)?;
            if rows != dataset.len() {
                return Ok(None);
            }
            Ok(Some(Box::new(Exhaustive { rows })))
        }
    }
}
