use crate::correspondence::{CandidateImage, Correspondence};
use crate::geometry::{
    is_homography_good, lmeds, ransac, FundamentalModel, HomographyModel, PointPair, RobustConfig,
};
use log::debug;
use nalgebra::Matrix3;
use std::f64::consts::PI;

const MAX_PIXEL_DEVIATION: f64 = 5.0;
const CONFIDENCE_LEVEL: f64 = 0.9999999;
const ROT_THRESHOLD_RADIANS: f64 = 0.2;

const COARSE_ROT_THRESHOLD_RADIANS: f64 = 30.0 * PI / 180.0;
const HOMOGRAPHY_PIXEL_DEVIATION: f64 = 35.0;
const FALLBACK_PIXEL_DEVIATIONS: [f64; 5] = [15.0, 9.0, 5.0, 3.0, 1.0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Epipolar geometry between the two views, followed by a rotation check.
    Fundamental,
    /// A homography mapping database points onto query points. With
    /// `ransac_pass` a rotation-only pass first drops gross outliers.
    Homography { ransac_pass: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Verification {
    pub matrix: Matrix3<f64>,
    /// One flag per input correspondence.
    pub inliers: Vec<bool>,
    pub success: bool,
}

impl Verification {
    fn failed(n: usize) -> Self {
        Verification {
            matrix: Matrix3::zeros(),
            inliers: vec![false; n],
            success: false,
        }
    }

    pub fn num_inliers(&self) -> usize {
        self.inliers.iter().filter(|&&i| i).count()
    }

    pub fn inlier_matches(&self, matches: &[Correspondence]) -> Vec<Correspondence> {
        matches
            .iter()
            .zip(&self.inliers)
            .filter(|(_, &inlier)| inlier)
            .map(|(m, _)| m.clone())
            .collect()
    }
}

/// Smallest angle between the query and database keypoint orientations.
pub fn rotation_delta(m: &Correspondence) -> f64 {
    let a = m.query.orientation;
    let b = m.db.orientation;
    let turn = 2.0 * PI;
    (a - b).rem_euclid(turn).min((b - a).rem_euclid(turn))
}

/// Demotes every inlier whose keypoints disagree on orientation by more
/// than `threshold` radians. Assumes both cameras share the same roll.
pub fn filter_rotation(matches: &[Correspondence], inliers: &mut [bool], threshold: f64) {
    for (m, inlier) in matches.iter().zip(inliers.iter_mut()) {
        if *inlier && rotation_delta(m) > threshold {
            *inlier = false;
        }
    }
}

fn query_to_db(matches: &[Correspondence]) -> Vec<PointPair> {
    matches
        .iter()
        .map(|m| PointPair {
            src: (m.query.x, m.query.y),
            dst: (m.db.x, m.db.y),
        })
        .collect()
}

fn db_to_query(matches: &[Correspondence]) -> Vec<PointPair> {
    matches
        .iter()
        .map(|m| PointPair {
            src: (m.db.x, m.db.y),
            dst: (m.query.x, m.query.y),
        })
        .collect()
}

pub fn find_corr(matches: &[Correspondence], mode: Mode) -> Verification {
    match mode {
        Mode::Fundamental => fundamental(matches),
        Mode::Homography { ransac_pass } => homography(matches, ransac_pass),
    }
}

fn fundamental(matches: &[Correspondence]) -> Verification {
    let pairs = query_to_db(matches);
    let config = RobustConfig::new(MAX_PIXEL_DEVIATION, CONFIDENCE_LEVEL);
    let result = ransac(&FundamentalModel, &pairs, &config);
    let matrix = match result.model {
        Some(matrix) => matrix,
        None => return Verification::failed(matches.len()),
    };
    let mut inliers = result.inliers;
    filter_rotation(matches, &mut inliers, ROT_THRESHOLD_RADIANS);
    Verification {
        matrix,
        inliers,
        success: true,
    }
}

fn homography(matches: &[Correspondence], ransac_pass: bool) -> Verification {
    let mut kept: Vec<usize> = (0..matches.len()).collect();
    if ransac_pass {
        let mut coarse = vec![true; matches.len()];
        filter_rotation(matches, &mut coarse, COARSE_ROT_THRESHOLD_RADIANS);
        kept.retain(|&i| coarse[i]);
    }
    if kept.len() < 4 {
        return Verification::failed(matches.len());
    }

    let subset: Vec<Correspondence> = kept.iter().map(|&i| matches[i].clone()).collect();
    let pairs = db_to_query(&subset);

    let thresholds = std::iter::once(HOMOGRAPHY_PIXEL_DEVIATION).chain(FALLBACK_PIXEL_DEVIATIONS);
    let mut found = None;
    for threshold in thresholds {
        let result = ransac(&HomographyModel, &pairs, &RobustConfig::new(threshold, CONFIDENCE_LEVEL));
        match result.model {
            Some(h) if is_homography_good(&h) => {
                found = Some((h, result.inliers, true));
                break;
            }
            _ => debug!("homography at {}px is implausible", threshold),
        }
    }

    let (matrix, subset_inliers, success) = match found {
        Some(found) => found,
        None => {
            let result = lmeds(&HomographyModel, &pairs, &RobustConfig::new(0.0, CONFIDENCE_LEVEL));
            match result.model {
                Some(h) => {
                    let good = is_homography_good(&h);
                    (h, result.inliers, good)
                }
                None => return Verification::failed(matches.len()),
            }
        }
    };

    let mut inliers = vec![false; matches.len()];
    for (&i, &inlier) in kept.iter().zip(&subset_inliers) {
        inliers[i] = inlier;
    }
    Verification {
        matrix,
        inliers,
        success,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    fn of(self, g: &crate::feature::Geometry) -> f64 {
        match self {
            Axis::X => g.x,
            Axis::Y => g.y,
        }
    }
}

/// Keeps the inliers forming the longest chain that increases in the query
/// coordinate when walked in database order along `axis`.
pub fn spatially_ordered(matches: &[Correspondence], axis: Axis, inliers: &[bool]) -> Vec<bool> {
    let mut points: Vec<(f64, f64, usize)> = matches
        .iter()
        .enumerate()
        .filter(|(i, _)| inliers[*i])
        .map(|(i, m)| (axis.of(&m.db), axis.of(&m.query), i))
        .collect();
    if points.is_empty() {
        return inliers.to_vec();
    }
    points.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then(a.1.total_cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    // chains[j] is the best chain ending at j, most recent entry first
    let mut chains: Vec<(usize, Vec<usize>)> = Vec::with_capacity(points.len());
    for j in 0..points.len() {
        let best = (0..j)
            .filter(|&i| points[i].1 <= points[j].1)
            .map(|i| &chains[i])
            .max();
        let chain = match best {
            Some((len, members)) => {
                let mut list = Vec::with_capacity(members.len() + 1);
                list.push(points[j].2);
                list.extend_from_slice(members);
                (len + 1, list)
            }
            None => (1, vec![points[j].2]),
        };
        chains.push(chain);
    }

    let mut ordered = vec![false; inliers.len()];
    if let Some((_, members)) = chains.iter().max() {
        for &i in members {
            ordered[i] = true;
        }
    }
    ordered
}

#[derive(Clone, Debug)]
pub struct VerifiedCandidate {
    pub image: String,
    pub matches: Vec<Correspondence>,
    pub verification: Verification,
}

impl VerifiedCandidate {
    pub fn num_inliers(&self) -> usize {
        self.verification.num_inliers()
    }
}

/// Verifies the first `max_considered` candidates and re-ranks them by
/// inlier count. Candidates with fewer than `min_consistent` inliers drop out.
pub fn rank_candidates(
    ranked: &[CandidateImage],
    mode: Mode,
    max_considered: usize,
    min_consistent: usize,
) -> Vec<VerifiedCandidate> {
    let mut verified: Vec<VerifiedCandidate> = ranked
        .iter()
        .take(max_considered)
        .map(|candidate| VerifiedCandidate {
            image: candidate.image.clone(),
            matches: candidate.matches.clone(),
            verification: find_corr(&candidate.matches, mode),
        })
        .filter(|v| v.num_inliers() >= min_consistent)
        .collect();
    verified.sort_by(|a, b| b.num_inliers().cmp(&a.num_inliers()));
    verified
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::feature::Geometry;
    use nalgebra::{Matrix3x4, Vector3, Vector4};

    pub fn corr(q: (f64, f64, f64), d: (f64, f64, f64)) -> Correspondence {
        Correspondence::new(
            Geometry::new(q.0, q.1, 1.0, q.2),
            Geometry::new(d.0, d.1, 1.0, d.2),
            100.0,
        )
    }

    /// Views of a non-planar scene from two cameras a short sideways step apart.
    pub fn two_view_scene() -> Vec<Correspondence> {
        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        let cam_q = k * Matrix3x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0);
        let cam_d = k * Matrix3x4::new(1.0, 0.0, 0.0, -0.5, 0.0, 1.0, 0.0, 0.1, 0.0, 0.0, 1.0, 0.0);
        let project = |cam: &Matrix3x4<f64>, p: &Vector4<f64>| {
            let v: Vector3<f64> = cam * p;
            (v[0] / v[2], v[1] / v[2])
        };
        let mut matches = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                let depth = 4.0 + ((i * 7 + j * 3) % 5) as f64;
                let p = Vector4::new(-2.0 + i as f64, -1.5 + j as f64, depth, 1.0);
                let q = project(&cam_q, &p);
                let d = project(&cam_d, &p);
                matches.push(corr((q.0, q.1, 0.3), (d.0, d.1, 0.3)));
            }
        }
        matches
    }
}
