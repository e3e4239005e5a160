use crate::cache::index_file_name;
use crate::error::{MatchingError, Result};
use crate::feature::Dataset;
use crate::index::{open_index, IndexBuilder, Neighbor, NeighborIndex};
use crate::params::SearchParams;
use crate::store::load_cells;
use log::info;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct Decoy {
    dataset: Dataset,
    index: Box<dyn NeighborIndex>,
}

/// A cell known to hold no true matches. Query features that match it more
/// closely than the searched cell are discarded by the filter vote.
///
/// The cell is loaded and indexed on first use and then shared by every
/// query of the run.
pub struct DecoyCache {
    cell: PathBuf,
    cache_dir: PathBuf,
    builder: Arc<dyn IndexBuilder>,
    params: SearchParams,
    slot: Mutex<Option<Arc<Decoy>>>,
}

impl fmt::Debug for DecoyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoyCache")
            .field("cell", &self.cell)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl DecoyCache {
    pub fn new(
        cell: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        builder: Arc<dyn IndexBuilder>,
        params: SearchParams,
    ) -> Self {
        DecoyCache {
            cell: cell.into(),
            cache_dir: cache_dir.into(),
            builder,
            params,
            slot: Mutex::new(None),
        }
    }

    pub fn cell(&self) -> &Path {
        &self.cell
    }

    fn get(&self) -> Result<Arc<Decoy>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(decoy) = slot.as_ref() {
            return Ok(decoy.clone());
        }
        if !self.cell.is_dir() {
            return Err(MatchingError::Config(format!(
                "decoy cell {} is not available",
                self.cell.display()
            )));
        }

        info!("loading decoy cell {}", self.cell.display());
        let cells = [self.cell.clone()];
        let dataset = load_cells(&cells, self.params.descriptor, None)?;
        let path = self
            .cache_dir
            .join(index_file_name(&cells, None, &self.params));
        let index = open_index(self.builder.as_ref(), &dataset, &self.params, &path)?;
        let decoy = Arc::new(Decoy { dataset, index });
        *slot = Some(decoy.clone());
        Ok(decoy)
    }

    /// Nearest decoy feature of every query feature.
    pub fn search(&self, query: &Dataset) -> Result<Vec<Vec<Neighbor>>> {
        let decoy = self.get()?;
        decoy.index.knn(&decoy.dataset, query, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::testing::{dataset, feature};
    use crate::index::testing::CountingBuilder;
    use crate::params::VoteMethod;
    use crate::vote::VotingEngine;
    use std::fs;
    use tempdir::TempDir;

    fn decoy_cell(root: &Path) -> PathBuf {
        let cell = root.join("37.90,-122.30");
        fs::create_dir_all(&cell).unwrap();
        let mut values = vec!["0"; 128];
        values[0] = "10";
        fs::write(
            cell.join("decoysift.txt"),
            format!("1 128\n4 4 1 0 {}\n", values.join(" ")),
        )
        .unwrap();
        cell
    }

    fn filter_params() -> SearchParams {
        let mut params = SearchParams::default();
        params.vote_method = VoteMethod::Filter;
        params
    }

    #[test]
    fn test_missing_cell_is_a_config_error() {
        let temp_dir = TempDir::new("decoy").unwrap();
        let decoy = DecoyCache::new(
            temp_dir.path().join("gone"),
            temp_dir.path().join("cache"),
            Arc::new(CountingBuilder::default()),
            filter_params(),
        );
        let query = dataset(vec![("q", vec![feature(0.0, 0.0, 1.0)])]);
        assert!(matches!(decoy.search(&query), Err(MatchingError::Config(_))));
    }

    #[test]
    fn test_decoy_is_indexed_once() {
        let temp_dir = TempDir::new("decoy").unwrap();
        let builder = Arc::new(CountingBuilder::default());
        let decoy = DecoyCache::new(
            decoy_cell(temp_dir.path()),
            temp_dir.path().join("cache"),
            builder.clone(),
            filter_params(),
        );
        let query = dataset(vec![("q", vec![feature(0.0, 0.0, 11.0), feature(1.0, 0.0, 30.0)])]);

        let first = decoy.search(&query).unwrap();
        assert_eq!(first, vec![vec![Neighbor::new(0, 1.0)], vec![Neighbor::new(0, 400.0)]]);
        assert_eq!(decoy.search(&query).unwrap(), first);
        assert_eq!(builder.builds(), 1);
    }

    #[test]
    fn test_filter_vote_drops_features_closer_to_the_decoy() {
        let temp_dir = TempDir::new("decoy").unwrap();
        let decoy = Arc::new(DecoyCache::new(
            decoy_cell(temp_dir.path()),
            temp_dir.path().join("cache"),
            Arc::new(CountingBuilder::default()),
            filter_params(),
        ));
        let query = dataset(vec![("q", vec![feature(0.0, 0.0, 11.0), feature(1.0, 0.0, 30.0)])]);
        let cell = dataset(vec![("imgA", vec![feature(5.0, 5.0, 20.0)])]);
        let neighbors = vec![vec![Neighbor::new(0, 81.0)], vec![Neighbor::new(0, 100.0)]];

        let ballot = VotingEngine::new(filter_params())
            .with_decoy(decoy)
            .vote(&query, &cell, &neighbors)
            .unwrap();
        assert_eq!(ballot.tally.accepted, 1);
        assert_eq!(ballot.tally.losing, 1);
        assert_eq!(ballot.ranked.len(), 1);
        assert_eq!(ballot.ranked[0].image, "imgA");
        assert_eq!(ballot.ranked[0].matches[0].query.x, 1.0);
    }
}
