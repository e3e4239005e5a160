use crate::error::{MatchingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    KdTree,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceType {
    /// Squared L2, which is what FLANN reports for its euclidean metric.
    Euclidean,
    Manhattan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Sift,
    Chog,
    Surf,
}

impl DescriptorKind {
    pub fn dimensions(self) -> usize {
        match self {
            DescriptorKind::Sift => 128,
            DescriptorKind::Chog => 63,
            DescriptorKind::Surf => 64,
        }
    }

    /// Suffix that turns an image name into its descriptor file name.
    pub fn file_suffix(self) -> &'static str {
        match self {
            DescriptorKind::Sift => "sift.txt",
            DescriptorKind::Chog => "chog.txt",
            DescriptorKind::Surf => "surf.txt",
        }
    }

    /// Element type name of the stored vectors, part of the index file name.
    pub fn dtype_name(self) -> &'static str {
        match self {
            DescriptorKind::Sift => "uint8",
            DescriptorKind::Chog | DescriptorKind::Surf => "float32",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorKind::Sift => "sift",
            DescriptorKind::Chog => "chog",
            DescriptorKind::Surf => "surf",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteMethod {
    #[serde(rename = "matchonce")]
    MatchOnce,
    #[serde(rename = "top_n")]
    TopN,
    #[serde(rename = "ratio")]
    Ratio,
    #[serde(rename = "filter")]
    Filter,
    #[serde(rename = "ransac")]
    Ransac,
    #[serde(rename = "highest")]
    Highest,
}

impl VoteMethod {
    pub fn name(self) -> &'static str {
        match self {
            VoteMethod::MatchOnce => "matchonce",
            VoteMethod::TopN => "top_n",
            VoteMethod::Ratio => "ratio",
            VoteMethod::Filter => "filter",
            VoteMethod::Ransac => "ransac",
            VoteMethod::Highest => "highest",
        }
    }
}

impl fmt::Display for VoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Nearest-neighbour search and voting parameters.
///
/// Every field is required when read from JSON and unknown fields are
/// rejected, so a parameter file either describes a complete run or fails
/// before any work starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchParams {
    pub algorithm: Algorithm,
    pub trees: usize,
    /// Leaf checks per query, `-1` searches exhaustively.
    pub checks: i64,
    pub dist_threshold: f64,
    pub descriptor: DescriptorKind,
    pub distance_type: DistanceType,
    pub num_neighbors: usize,
    pub vote_method: VoteMethod,
    pub confstring: String,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            algorithm: Algorithm::KdTree,
            trees: 1,
            checks: 1024,
            dist_threshold: 70000.0,
            descriptor: DescriptorKind::Sift,
            distance_type: DistanceType::Euclidean,
            num_neighbors: 1,
            vote_method: VoteMethod::MatchOnce,
            confstring: String::new(),
        }
    }
}

impl SearchParams {
    pub fn from_json(json: &str) -> Result<SearchParams> {
        let params: SearchParams = serde_json::from_str(json)
            .map_err(|e| MatchingError::Config(format!("bad search parameters: {}", e)))?;
        params.validate()?;
        Ok(params)
    }

    pub fn load(path: &Path) -> Result<SearchParams> {
        let json = std::fs::read_to_string(path).map_err(|e| MatchingError::io(path, e))?;
        SearchParams::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.trees == 0 {
            return Err(MatchingError::Config("trees must be at least 1".to_owned()));
        }
        if self.checks == 0 || self.checks < -1 {
            return Err(MatchingError::Config(format!(
                "checks must be positive or -1, got {}",
                self.checks
            )));
        }
        if !self.dist_threshold.is_finite() || self.dist_threshold < 0.0 {
            return Err(MatchingError::Config(format!(
                "dist_threshold must be a non-negative number, got {}",
                self.dist_threshold
            )));
        }
        if self.num_neighbors == 0 {
            return Err(MatchingError::Config(
                "num_neighbors must be at least 1".to_owned(),
            ));
        }

        let nn = self.num_neighbors;
        let ok = match self.vote_method {
            VoteMethod::MatchOnce | VoteMethod::Filter | VoteMethod::Highest => nn == 1,
            VoteMethod::Ratio => nn > 1,
            VoteMethod::TopN | VoteMethod::Ransac => true,
        };
        if !ok {
            return Err(MatchingError::Config(format!(
                "vote method '{}' cannot run with num_neighbors = {}",
                self.vote_method, nn
            )));
        }
        Ok(())
    }

    /// Name of the index flavour; two parameter sets with the same index type
    /// can share a cached index.
    pub fn index_type(&self) -> String {
        let distname = match self.distance_type {
            DistanceType::Euclidean => String::new(),
            DistanceType::Manhattan => "-manhattan".to_owned(),
        };
        let des = match self.descriptor {
            DescriptorKind::Sift => String::new(),
            other => format!("-{}", other.name()),
        };
        match self.algorithm {
            Algorithm::KdTree => format!("kdtree{}{}{}", self.trees, distname, des),
            Algorithm::Linear => format!("linear{}{}", distname, des),
        }
    }

    /// Human readable tag of the whole search configuration, used to name
    /// result files.
    pub fn search_type(&self) -> String {
        let nn = if self.num_neighbors == 1 {
            String::new()
        } else {
            format!(",nn={}", self.num_neighbors)
        };
        let vote = if self.vote_method == VoteMethod::Highest {
            String::new()
        } else {
            format!(",{}", self.vote_method)
        };
        let conf = if self.confstring.is_empty() {
            String::new()
        } else {
            format!(",{}", self.confstring)
        };
        format!(
            "{},threshold={}k,searchparam={}{}{}{}",
            self.index_type(),
            (self.dist_threshold / 1000.0) as i64,
            self.checks,
            nn,
            vote,
            conf
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "algorithm": "kdtree",
        "trees": 1,
        "checks": 1024,
        "dist_threshold": 70000,
        "descriptor": "sift",
        "distance_type": "euclidean",
        "num_neighbors": 1,
        "vote_method": "matchonce",
        "confstring": ""
    }"#;

    #[test]
    fn test_full_json_matches_default() {
        let params = SearchParams::from_json(FULL).unwrap();
        assert_eq!(params, SearchParams::default());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(FULL).unwrap();
        value.as_object_mut().unwrap().remove("confstring");
        assert!(matches!(
            SearchParams::from_json(&value.to_string()),
            Err(MatchingError::Config(_))
        ));
    }

    #[test]
    fn test_extra_key_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(FULL).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("leaf_size".to_owned(), serde_json::json!(4));
        assert!(SearchParams::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn test_policy_needs_matching_neighbor_count() {
        let mut params = SearchParams::default();
        params.vote_method = VoteMethod::Ratio;
        assert!(params.validate().is_err());
        params.num_neighbors = 4;
        assert!(params.validate().is_ok());

        params.vote_method = VoteMethod::Filter;
        assert!(params.validate().is_err());
        params.vote_method = VoteMethod::TopN;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_search_type_strings() {
        let params = SearchParams::default();
        assert_eq!(params.index_type(), "kdtree1");
        assert_eq!(
            params.search_type(),
            "kdtree1,threshold=70k,searchparam=1024,matchonce"
        );

        let params = SearchParams {
            algorithm: Algorithm::KdTree,
            trees: 4,
            distance_type: DistanceType::Manhattan,
            descriptor: DescriptorKind::Surf,
            num_neighbors: 8,
            vote_method: VoteMethod::TopN,
            confstring: "hsv".to_owned(),
            ..SearchParams::default()
        };
        assert_eq!(params.index_type(), "kdtree4-manhattan-surf");
        assert_eq!(
            params.search_type(),
            "kdtree4-manhattan-surf,threshold=70k,searchparam=1024,nn=8,top_n,hsv"
        );
    }
}
