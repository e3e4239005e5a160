//! Robust estimation of planar transforms between matched keypoints.
//!
//! The estimators work on plain point pairs. `verify` decides which side of
//! a correspondence becomes the source of a model.

use nalgebra::{Matrix3, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

const EPS: f64 = 1e-12;

/// Matrices with a smaller determinant collapse the image and are rejected.
pub const BAD_HOMOGRAPHY_DET_THRESHOLD: f64 = 0.005;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointPair {
    pub src: (f64, f64),
    pub dst: (f64, f64),
}

#[derive(Clone, Debug)]
pub struct RobustConfig {
    pub threshold: f64,
    pub confidence: f64,
    pub max_iterations: usize,
}

impl RobustConfig {
    pub fn new(threshold: f64, confidence: f64) -> Self {
        RobustConfig {
            threshold,
            confidence,
            max_iterations: 2000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RobustResult<M> {
    pub model: Option<M>,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

impl<M> RobustResult<M> {
    fn empty(n: usize) -> Self {
        RobustResult {
            model: None,
            inliers: vec![false; n],
            num_inliers: 0,
        }
    }
}

pub trait RobustModel {
    type Model: Clone;

    fn min_sample_size(&self) -> usize;

    /// Fits a model to `data`, which holds at least `min_sample_size` pairs.
    fn estimate(&self, data: &[&PointPair]) -> Option<Self::Model>;

    fn error(&self, model: &Self::Model, pair: &PointPair) -> f64;
}

fn score<M: RobustModel>(estimator: &M, model: &M::Model, data: &[PointPair], threshold: f64) -> (Vec<bool>, usize) {
    let inliers: Vec<bool> = data
        .iter()
        .map(|pair| estimator.error(model, pair) <= threshold)
        .collect();
    let count = inliers.iter().filter(|&&i| i).count();
    (inliers, count)
}

fn needed_iterations(confidence: f64, inlier_ratio: f64, sample_size: usize, max: usize) -> usize {
    let good_sample = inlier_ratio.powi(sample_size as i32);
    if good_sample >= 1.0 {
        return 1;
    }
    if good_sample <= 0.0 {
        return max;
    }
    let num = (1.0 - confidence).max(f64::MIN_POSITIVE).ln();
    let denom = (1.0 - good_sample).ln();
    if denom >= 0.0 {
        return max;
    }
    ((num / denom).ceil() as usize).clamp(1, max)
}

/// The generator is seeded from the input size so that repeated runs over
/// the same correspondences agree.
fn seeded_rng(n: usize) -> StdRng {
    StdRng::seed_from_u64(0x5eed_0000 ^ n as u64)
}

pub fn ransac<M: RobustModel>(estimator: &M, data: &[PointPair], config: &RobustConfig) -> RobustResult<M::Model> {
    let n = data.len();
    let k = estimator.min_sample_size();
    if n < k {
        return RobustResult::empty(n);
    }

    let mut rng = seeded_rng(n);
    let mut best = RobustResult::empty(n);
    let mut iterations = config.max_iterations;
    let mut iter = 0;

    while iter < iterations {
        iter += 1;
        let sample: Vec<&PointPair> = rand::seq::index::sample(&mut rng, n, k)
            .iter()
            .map(|i| &data[i])
            .collect();
        let model = match estimator.estimate(&sample) {
            Some(model) => model,
            None => continue,
        };
        let (inliers, count) = score(estimator, &model, data, config.threshold);
        if count > best.num_inliers {
            best = RobustResult {
                model: Some(model),
                inliers,
                num_inliers: count,
            };
            iterations = needed_iterations(
                config.confidence,
                count as f64 / n as f64,
                k,
                config.max_iterations,
            );
        }
    }

    if best.num_inliers >= k {
        let support: Vec<&PointPair> = data
            .iter()
            .zip(&best.inliers)
            .filter(|(_, &inlier)| inlier)
            .map(|(pair, _)| pair)
            .collect();
        if let Some(refined) = estimator.estimate(&support) {
            let (inliers, count) = score(estimator, &refined, data, config.threshold);
            if count >= best.num_inliers {
                best = RobustResult {
                    model: Some(refined),
                    inliers,
                    num_inliers: count,
                };
            }
        }
    }
    best
}

/// Least median of squares. Needs no threshold; inliers are the pairs
/// within 2.5 robust standard deviations of the best model.
pub fn lmeds<M: RobustModel>(estimator: &M, data: &[PointPair], config: &RobustConfig) -> RobustResult<M::Model> {
    let n = data.len();
    let k = estimator.min_sample_size();
    if n < k {
        return RobustResult::empty(n);
    }

    let mut rng = seeded_rng(n);
    let mut best_model = None;
    let mut best_median = f64::INFINITY;
    let iterations = needed_iterations(config.confidence, 0.55, k, config.max_iterations);

    for _ in 0..iterations {
        let sample: Vec<&PointPair> = rand::seq::index::sample(&mut rng, n, k)
            .iter()
            .map(|i| &data[i])
            .collect();
        let model = match estimator.estimate(&sample) {
            Some(model) => model,
            None => continue,
        };
        let mut errors: Vec<f64> = data.iter().map(|p| estimator.error(&model, p)).collect();
        errors.sort_by(|a, b| a.total_cmp(b));
        let median = errors[n / 2];
        if median < best_median {
            best_median = median;
            best_model = Some(model);
        }
    }

    match best_model {
        Some(model) => {
            let sigma = 1.4826 * (1.0 + 5.0 / (n - k).max(1) as f64) * best_median;
            let (inliers, num_inliers) = score(estimator, &model, data, 2.5 * sigma);
            RobustResult {
                model: Some(model),
                inliers,
                num_inliers,
            }
        }
        None => RobustResult::empty(n),
    }
}

/// Similarity transform moving the centroid to the origin with a mean
/// distance of sqrt(2), as in Hartley's normalised algorithms.
fn normalization<'a>(points: impl Iterator<Item = &'a (f64, f64)> + Clone) -> Option<Matrix3<f64>> {
    let n = points.clone().count() as f64;
    let (sx, sy) = points.clone().fold((0.0, 0.0), |(sx, sy), p| (sx + p.0, sy + p.1));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = points.map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt()).sum::<f64>() / n;
    if mean_dist < EPS {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

fn apply(t: &Matrix3<f64>, p: (f64, f64)) -> (f64, f64) {
    let v = t * Vector3::new(p.0, p.1, 1.0);
    (v[0] / v[2], v[1] / v[2])
}

/// Unit vector minimising |A x| given the rows of A.
fn null_vector(rows: &[SVector<f64, 9>]) -> Option<SVector<f64, 9>> {
    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for row in rows {
        ata += row * row.transpose();
    }
    let eigen = SymmetricEigen::new(ata);
    let (idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let v: SVector<f64, 9> = eigen.eigenvectors.column(idx).into_owned();
    if v.iter().all(|x| x.is_finite()) {
        Some(v)
    } else {
        None
    }
}

fn to_matrix(v: &SVector<f64, 9>) -> Matrix3<f64> {
    Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8])
}

/// Homography mapping `src` onto `dst`, normalised so that `H[2][2] = 1`.
pub struct HomographyModel;

impl RobustModel for HomographyModel {
    type Model = Matrix3<f64>;

    fn min_sample_size(&self) -> usize {
        4
    }

    fn estimate(&self, data: &[&PointPair]) -> Option<Matrix3<f64>> {
        let t_src = normalization(data.iter().map(|p| &p.src))?;
        let t_dst = normalization(data.iter().map(|p| &p.dst))?;

        let mut rows = Vec::with_capacity(data.len() * 2);
        for pair in data {
            let (x1, y1) = apply(&t_src, pair.src);
            let (x2, y2) = apply(&t_dst, pair.dst);
            rows.push(SVector::<f64, 9>::from_column_slice(&[
                -x1, -y1, -1.0, 0.0, 0.0, 0.0, x2 * x1, x2 * y1, x2,
            ]));
            rows.push(SVector::<f64, 9>::from_column_slice(&[
                0.0, 0.0, 0.0, -x1, -y1, -1.0, y2 * x1, y2 * y1, y2,
            ]));
        }
        let h = to_matrix(&null_vector(&rows)?);
        let h = t_dst.try_inverse()? * h * t_src;
        if h[(2, 2)].abs() < EPS {
            return None;
        }
        let h = h / h[(2, 2)];
        if h.iter().all(|x| x.is_finite()) {
            Some(h)
        } else {
            None
        }
    }

    fn error(&self, h: &Matrix3<f64>, pair: &PointPair) -> f64 {
        let p = h * Vector3::new(pair.src.0, pair.src.1, 1.0);
        if p[2].abs() < EPS {
            return f64::INFINITY;
        }
        ((p[0] / p[2] - pair.dst.0).powi(2) + (p[1] / p[2] - pair.dst.1).powi(2)).sqrt()
    }
}

/// Fundamental matrix with `dst^T F src = 0`, rank two.
pub struct FundamentalModel;

impl RobustModel for FundamentalModel {
    type Model = Matrix3<f64>;

    fn min_sample_size(&self) -> usize {
        8
    }

    fn estimate(&self, data: &[&PointPair]) -> Option<Matrix3<f64>> {
        let t_src = normalization(data.iter().map(|p| &p.src))?;
        let t_dst = normalization(data.iter().map(|p| &p.dst))?;

        let rows: Vec<SVector<f64, 9>> = data
            .iter()
            .map(|pair| {
                let (x1, y1) = apply(&t_src, pair.src);
                let (x2, y2) = apply(&t_dst, pair.dst);
                SVector::<f64, 9>::from_column_slice(&[
                    x2 * x1, x2 * y1, x2, y2 * x1, y2 * y1, y2, x1, y1, 1.0,
                ])
            })
            .collect();
        let f = to_matrix(&null_vector(&rows)?);

        let mut svd = f.svd(true, true);
        svd.singular_values[2] = 0.0;
        let f = svd.recompose().ok()?;

        let f = t_dst.transpose() * f * t_src;
        let norm = f.norm();
        if norm < EPS || !norm.is_finite() {
            return None;
        }
        Some(f / norm)
    }

    /// Larger of the two point-to-epipolar-line distances.
    fn error(&self, f: &Matrix3<f64>, pair: &PointPair) -> f64 {
        let p1 = Vector3::new(pair.src.0, pair.src.1, 1.0);
        let p2 = Vector3::new(pair.dst.0, pair.dst.1, 1.0);
        let l2 = f * p1;
        let l1 = f.transpose() * p2;
        let residual = p2.dot(&l2).abs();
        let n2 = (l2[0].powi(2) + l2[1].powi(2)).sqrt();
        let n1 = (l1[0].powi(2) + l1[1].powi(2)).sqrt();
        if n1 < EPS || n2 < EPS {
            return f64::INFINITY;
        }
        (residual / n1).max(residual / n2)
    }
}

/// An image location given as (row, col).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferencePoint {
    pub row: i64,
    pub col: i64,
}

/// Corner and two edges of a right angle near the centre of a 768x512 frame.
pub const REFERENCE_POINTS: [ReferencePoint; 3] = [
    ReferencePoint { row: 384, col: 256 },
    ReferencePoint { row: 384, col: 361 },
    ReferencePoint { row: 489, col: 256 },
];

/// Projects `point` through `h` as `(x = col, y = row, 1)` and returns the
/// truncated image location as (row, col).
pub fn project_reference_point(h: &Matrix3<f64>, point: ReferencePoint) -> (i64, i64) {
    let v = h * Vector3::new(point.col as f64, point.row as f64, 1.0);
    let x = v[0] / v[2];
    let y = v[1] / v[2];
    if v[2].abs() < EPS || !x.is_finite() || !y.is_finite() {
        return degenerate_projection();
    }
    (y as i64, x as i64)
}

/// Points at infinity cannot be compared; they all land on the origin.
fn degenerate_projection() -> (i64, i64) {
    (0, 0)
}

/// Whether `h` maps the reference right angle to a shape a real camera
/// motion could produce.
pub fn is_homography_good(h: &Matrix3<f64>) -> bool {
    if !(h.determinant() >= BAD_HOMOGRAPHY_DET_THRESHOLD) {
        return false;
    }
    let dests: Vec<(f64, f64)> = REFERENCE_POINTS
        .iter()
        .map(|&p| {
            let (r, c) = project_reference_point(h, p);
            (r as f64, c as f64)
        })
        .collect();

    let a = (dests[1].0 - dests[0].0, dests[1].1 - dests[0].1);
    let b = (dests[2].0 - dests[0].0, dests[2].1 - dests[0].1);
    let a_len = (a.0 * a.0 + a.1 * a.1).sqrt();
    let b_len = (b.0 * b.0 + b.1 * b.1).sqrt();
    if a_len == 0.0 || b_len == 0.0 {
        return false;
    }
    let length_ratio = a_len / b_len;
    if length_ratio > 5.0 || 1.0 / length_ratio > 5.0 {
        return false;
    }
    let cos = ((a.0 * b.0 + a.1 * b.1) / (a_len * b_len)).clamp(-1.0, 1.0);
    let angle = cos.acos().to_degrees();
    (30.0..=160.0).contains(&angle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_pairs(h: &Matrix3<f64>) -> Vec<PointPair> {
        let mut pairs = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                let src = (40.0 + 90.0 * i as f64, 30.0 + 80.0 * j as f64);
                let p = h * Vector3::new(src.0, src.1, 1.0);
                pairs.push(PointPair {
                    src,
                    dst: (p[0] / p[2], p[1] / p[2]),
                });
            }
        }
        pairs
    }

    fn similarity(angle: f64, scale: f64, tx: f64, ty: f64) -> Matrix3<f64> {
        let (s, c) = angle.sin_cos();
        Matrix3::new(scale * c, -scale * s, tx, scale * s, scale * c, ty, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_homography_recovered_despite_outliers() {
        let truth = Matrix3::new(1.1, 0.05, 12.0, -0.03, 0.95, -7.0, 0.0001, 0.00005, 1.0);
        let mut pairs = grid_pairs(&truth);
        for (i, pair) in pairs.iter_mut().enumerate().filter(|(i, _)| i % 5 == 0) {
            pair.dst = (pair.dst.0 + 150.0 + i as f64, pair.dst.1 - 120.0);
        }
        let result = ransac(&HomographyModel, &pairs, &RobustConfig::new(3.0, 0.999));
        let h = result.model.unwrap();
        assert!((h[(2, 2)] - 1.0).abs() < 1e-12);
        assert!((h - truth).abs().max() < 1e-3);
        assert_eq!(result.num_inliers, 24);
        assert!(result.inliers.iter().enumerate().all(|(i, &ok)| ok == (i % 5 != 0)));
    }

    #[test]
    fn test_ransac_is_deterministic() {
        let mut pairs = grid_pairs(&similarity(0.2, 1.3, 5.0, 9.0));
        pairs[3].dst.0 += 40.0;
        pairs[11].dst.1 -= 60.0;
        let config = RobustConfig::new(2.0, 0.99);
        let a = ransac(&HomographyModel, &pairs, &config);
        let b = ransac(&HomographyModel, &pairs, &config);
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.model, b.model);
    }

    #[test]
    fn test_too_few_pairs_give_no_model() {
        let pairs = grid_pairs(&Matrix3::identity());
        let result = ransac(&FundamentalModel, &pairs[..7], &RobustConfig::new(5.0, 0.99));
        assert!(result.model.is_none());
        assert_eq!(result.inliers, vec![false; 7]);
    }

    #[test]
    fn test_lmeds_finds_similarity() {
        let truth = similarity(-0.3, 0.8, -20.0, 40.0);
        let mut pairs = grid_pairs(&truth);
        pairs[0].dst = (0.0, 0.0);
        pairs[7].dst = (900.0, 900.0);
        let result = lmeds(&HomographyModel, &pairs, &RobustConfig::new(0.0, 0.999));
        let h = result.model.unwrap();
        assert!((h - truth).abs().max() < 1e-4);
        assert!(!result.inliers[0]);
        assert!(!result.inliers[7]);
    }

    #[test]
    fn test_identity_is_plausible() {
        assert!(is_homography_good(&Matrix3::identity()));
        assert_eq!(
            project_reference_point(&Matrix3::identity(), REFERENCE_POINTS[1]),
            (384, 361)
        );
    }

    #[test]
    fn test_bounded_rotation_and_scale_is_plausible() {
        assert!(is_homography_good(&similarity(0.35, 1.5, 30.0, -20.0)));
        assert!(is_homography_good(&similarity(-0.5, 0.6, 0.0, 0.0)));
    }

    #[test]
    fn test_small_determinant_is_rejected() {
        let h = Matrix3::<f64>::new(0.1, 0.0, 0.0, 0.0, 0.01, 0.0, 0.0, 0.0, 1.0);
        assert!((h.determinant() - 0.001).abs() < 1e-12);
        assert!(!is_homography_good(&h));
    }

    #[test]
    fn test_mirror_and_shear_are_rejected() {
        let mirror = Matrix3::new(-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(!is_homography_good(&mirror));
        let stretch = Matrix3::new(8.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(!is_homography_good(&stretch));
        let shear = Matrix3::new(1.0, 5.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(!is_homography_good(&shear));
    }

    #[test]
    fn test_point_at_infinity_projects_to_origin() {
        let h = Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0);
        for &p in REFERENCE_POINTS.iter() {
            assert_eq!(project_reference_point(&h, p), (0, 0));
        }
        assert!(!is_homography_good(&h));
    }
}
