mod distance;
mod kdtree;
mod linear;

use kdtree::{KdForest, KdTree};
use linear::LinearIndex;
use log::debug;
use matching::{
    Algorithm, Dataset, DistanceType, IndexBuilder, MatchingError, Neighbor, NeighborIndex,
    Result, SearchParams,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::{Read, Write};

/// Bumped whenever the saved layout changes, so older files get rebuilt.
const INDEX_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
enum SavedKind<'a> {
    KdTree { trees: Cow<'a, [KdTree]> },
    Linear,
}

#[derive(Serialize, Deserialize)]
struct SavedIndex<'a> {
    version: u32,
    rows: usize,
    dim: usize,
    distance: DistanceType,
    index: SavedKind<'a>,
}

fn check_shape(rows: usize, dataset: &Dataset, queries: &Dataset) -> Result<()> {
    if dataset.len() != rows {
        return Err(MatchingError::Dataset(format!(
            "index was built over {} rows but the dataset has {}",
            rows,
            dataset.len()
        )));
    }
    if !queries.is_empty() && queries.dim() != dataset.dim() {
        return Err(MatchingError::Dataset(format!(
            "query descriptors have {} dimensions, the dataset {}",
            queries.dim(),
            dataset.dim()
        )));
    }
    Ok(())
}

struct FlannIndex {
    dim: usize,
    kind: FlannKind,
}

enum FlannKind {
    KdTree(KdForest),
    Linear(LinearIndex),
}

impl NeighborIndex for FlannIndex {
    fn knn(&self, dataset: &Dataset, queries: &Dataset, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        match &self.kind {
            FlannKind::KdTree(forest) => forest.knn(dataset, queries, k),
            FlannKind::Linear(linear) => linear.knn(dataset, queries, k),
        }
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        let (rows, distance, index) = match &self.kind {
            FlannKind::KdTree(forest) => (
                forest.rows(),
                forest.distance(),
                SavedKind::KdTree {
                    trees: Cow::Borrowed(forest.trees()),
                },
            ),
            FlannKind::Linear(linear) => (linear.rows(), linear.distance(), SavedKind::Linear),
        };
        let saved = SavedIndex {
            version: INDEX_VERSION,
            rows,
            dim: self.dim,
            distance,
            index,
        };
        serde_json::to_writer(out, &saved)?;
        Ok(())
    }
}

/// Builds kd-tree forests or linear indexes according to
/// `SearchParams::algorithm`.
#[derive(Default)]
pub struct FlannBuilder {}

impl IndexBuilder for FlannBuilder {
    fn build(&self, dataset: &Dataset, params: &SearchParams) -> Result<Box<dyn NeighborIndex>> {
        let kind = match params.algorithm {
            Algorithm::KdTree => {
                debug!(
                    "building {} kd-trees over {} rows",
                    params.trees,
                    dataset.len()
                );
                FlannKind::KdTree(KdForest::build(
                    dataset,
                    params.trees,
                    params.distance_type,
                    params.checks,
                ))
            }
            Algorithm::Linear => {
                FlannKind::Linear(LinearIndex::new(params.distance_type, dataset.len()))
            }
        };
        Ok(Box::new(FlannIndex {
            dim: dataset.dim(),
            kind,
        }))
    }

    fn load(
        &self,
        input: &mut dyn Read,
        dataset: &Dataset,
        params: &SearchParams,
    ) -> Result<Option<Box<dyn NeighborIndex>>> {
        let saved: SavedIndex<'static> = match serde_json::from_reader(input) {
            Ok(saved) => saved,
            Err(e) => {
                debug!("unreadable index: {}", e);
                return Ok(None);
            }
        };
        if saved.version != INDEX_VERSION
            || saved.rows != dataset.len()
            || saved.dim != dataset.dim()
            || saved.distance != params.distance_type
        {
            return Ok(None);
        }

        let kind = match (saved.index, params.algorithm) {
            (SavedKind::KdTree { trees }, Algorithm::KdTree) => {
                let trees = trees.into_owned();
                if trees.len() != params.trees
                    || !trees
                        .iter()
                        .all(|t| t.is_consistent(saved.rows, saved.dim))
                {
                    return Ok(None);
                }
                FlannKind::KdTree(KdForest::from_trees(
                    trees,
                    saved.rows,
                    saved.distance,
                    params.checks,
                ))
            }
            (SavedKind::Linear, Algorithm::Linear) => {
                FlannKind::Linear(LinearIndex::new(saved.distance, saved.rows))
            }
            _ => return Ok(None),
        };
        Ok(Some(Box::new(FlannIndex {
            dim: saved.dim,
            kind,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matching::{open_index, DescriptorKind, Feature, Geometry, ImageFeatures};
    use tempdir::TempDir;

    fn dataset(values: &[f32]) -> Dataset {
        let features = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut descriptor = vec![0.0; 128];
                descriptor[0] = *v;
                descriptor[1] = (i % 3) as f32;
                Feature {
                    geometry: Geometry::new(i as f64, 0.0, 1.0, 0.0),
                    descriptor,
                }
            })
            .collect();
        Dataset::from_images(DescriptorKind::Sift, vec![ImageFeatures::new("a", features)])
            .unwrap()
    }

    fn saved(index: &dyn NeighborIndex) -> Vec<u8> {
        let mut out = Vec::new();
        index.save(&mut out).unwrap();
        out
    }

    #[test]
    fn test_saved_index_loads_and_answers_the_same() {
        let values: Vec<f32> = (0..60).map(|i| (i * 7 % 50) as f32).collect();
        let ds = dataset(&values);
        let mut params = SearchParams::default();
        params.trees = 3;
        params.checks = -1;
        let builder = FlannBuilder::default();

        let built = builder.build(&ds, &params).unwrap();
        let bytes = saved(built.as_ref());
        let loaded = builder
            .load(&mut bytes.as_slice(), &ds, &params)
            .unwrap()
            .unwrap();
        assert_eq!(saved(loaded.as_ref()), bytes);
        assert_eq!(
            loaded.knn(&ds, &ds, 2).unwrap(),
            built.knn(&ds, &ds, 2).unwrap()
        );
    }

    #[test]
    fn test_mismatched_index_is_not_loaded() {
        let ds = dataset(&[1.0, 2.0, 3.0]);
        let params = SearchParams::default();
        let builder = FlannBuilder::default();
        let bytes = saved(builder.build(&ds, &params).unwrap().as_ref());

        let bigger = dataset(&[1.0, 2.0, 3.0, 4.0]);
        assert!(builder
            .load(&mut bytes.as_slice(), &bigger, &params)
            .unwrap()
            .is_none());

        let mut other = params.clone();
        other.trees = 2;
        assert!(builder.load(&mut bytes.as_slice(), &ds, &other).unwrap().is_none());
        other = params.clone();
        other.algorithm = Algorithm::Linear;
        assert!(builder.load(&mut bytes.as_slice(), &ds, &other).unwrap().is_none());
        other = params.clone();
        other.distance_type = DistanceType::Manhattan;
        assert!(builder.load(&mut bytes.as_slice(), &ds, &other).unwrap().is_none());

        assert!(builder
            .load(&mut &b"not json"[..], &ds, &params)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_checks_come_from_the_current_parameters() {
        let ds = dataset(&[1.0, 2.0, 3.0]);
        let params = SearchParams::default();
        let builder = FlannBuilder::default();
        let bytes = saved(builder.build(&ds, &params).unwrap().as_ref());
        let mut other = params.clone();
        other.checks = -1;
        assert!(builder.load(&mut bytes.as_slice(), &ds, &other).unwrap().is_some());
    }

    #[test]
    fn test_linear_index_through_the_cache() {
        let temp_dir = TempDir::new("flann").unwrap();
        let path = temp_dir.path().join("cell-linear.uint8.index");
        let ds = dataset(&[10.0, 0.0, 5.0]);
        let mut params = SearchParams::default();
        params.algorithm = Algorithm::Linear;
        let builder = FlannBuilder::default();

        open_index(&builder, &ds, &params, &path).unwrap();
        let index = open_index(&builder, &ds, &params, &path).unwrap();
        let query = dataset(&[4.0]);
        assert_eq!(index.knn(&ds, &query, 1).unwrap(), vec![vec![Neighbor::new(2, 5.0)]]);
    }
}
