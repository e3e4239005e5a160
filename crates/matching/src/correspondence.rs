use crate::feature::Geometry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A query feature paired with the database feature it voted for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub query: Geometry,
    pub db: Geometry,
    pub feature_dist: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pt_3d: Option<[f64; 3]>,
}

impl Correspondence {
    pub fn new(query: Geometry, db: Geometry, feature_dist: f64) -> Self {
        Correspondence {
            query,
            db,
            feature_dist,
            point: None,
            pt_3d: None,
        }
    }

    /// Copy with the query position scaled, e.g. to draw on a resized image.
    pub fn with_scaled_query(&self, scale: f64) -> Correspondence {
        let mut scaled = self.clone();
        scaled.query.x *= scale;
        scaled.query.y *= scale;
        scaled
    }

    /// Identity of the pair by geometry alone.
    pub fn geometry_key(&self) -> [u64; 8] {
        let q = self.query.key();
        let d = self.db.key();
        [q[0], q[1], q[2], q[3], d[0], d[1], d[2], d[3]]
    }
}

/// A database image and the correspondences that voted for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateImage {
    pub image: String,
    pub matches: Vec<Correspondence>,
}

impl CandidateImage {
    pub fn votes(&self) -> usize {
        self.matches.len()
    }
}

/// Collects correspondences per image, remembering the order in which
/// images received their first vote so that ranking is reproducible.
#[derive(Debug, Default)]
pub struct BallotBox {
    slots: HashMap<String, usize>,
    candidates: Vec<CandidateImage>,
}

impl BallotBox {
    pub fn new() -> Self {
        BallotBox::default()
    }

    pub fn add(&mut self, image: &str, m: Correspondence) {
        self.entry(image).push(m);
    }

    pub fn extend(&mut self, image: &str, matches: impl IntoIterator<Item = Correspondence>) {
        self.entry(image).extend(matches);
    }

    fn entry(&mut self, image: &str) -> &mut Vec<Correspondence> {
        let idx = match self.slots.get(image) {
            Some(&idx) => idx,
            None => {
                let idx = self.candidates.len();
                self.slots.insert(image.to_owned(), idx);
                self.candidates.push(CandidateImage {
                    image: image.to_owned(),
                    matches: Vec::new(),
                });
                idx
            }
        };
        &mut self.candidates[idx].matches
    }

    pub fn into_ranked(self) -> Vec<CandidateImage> {
        rank(self.candidates)
    }
}

/// Sorts by descending vote count. The sort is stable, ties keep their order.
pub fn rank(mut candidates: Vec<CandidateImage>) -> Vec<CandidateImage> {
    candidates.sort_by(|a, b| b.votes().cmp(&a.votes()));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corr(x: f64) -> Correspondence {
        Correspondence::new(
            Geometry::new(x, x, 1.0, 0.0),
            Geometry::new(x + 1.0, x + 1.0, 1.0, 0.0),
            10.0,
        )
    }

    #[test]
    fn test_ballot_box_ranks_by_votes() {
        let mut ballots = BallotBox::new();
        ballots.add("a", corr(1.0));
        ballots.add("b", corr(2.0));
        ballots.add("b", corr(3.0));
        ballots.add("c", corr(4.0));
        let ranked = ballots.into_ranked();
        let names: Vec<_> = ranked.iter().map(|c| c.image.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert!(ranked.windows(2).all(|w| w[0].votes() >= w[1].votes()));
    }

    #[test]
    fn test_scaling_does_not_touch_original() {
        let original = corr(10.0);
        let scaled = original.with_scaled_query(0.5);
        assert_eq!(scaled.query.x, 5.0);
        assert_eq!(scaled.db, original.db);
        assert_eq!(original.query.x, 10.0);
    }

    #[test]
    fn test_json_omits_missing_side_data() {
        let json = serde_json::to_string(&corr(1.0)).unwrap();
        assert!(!json.contains("pt_3d"));
        let back: Correspondence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, corr(1.0));
    }
}
