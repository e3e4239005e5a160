use crate::correspondence::{BallotBox, CandidateImage, Correspondence};
use std::collections::{HashMap, HashSet};

/// Two votes whose 3d positions are at most this far apart agree on a place.
pub const CLUSTER_DISTANCE: f64 = 15.0;

/// Merges the rankings of several cells by image. Votes for the same image
/// from different cells add up; `admit` can drop single correspondences.
pub fn combine_matches<F>(per_cell: &[Vec<CandidateImage>], admit: F) -> Vec<CandidateImage>
where
    F: Fn(&Correspondence) -> bool,
{
    let mut ballots = BallotBox::new();
    for ranked in per_cell {
        for candidate in ranked {
            ballots.extend(
                &candidate.image,
                candidate.matches.iter().filter(|m| admit(m)).cloned(),
            );
        }
    }
    ballots.into_ranked()
}

fn position(m: &Correspondence) -> [f64; 3] {
    m.pt_3d.unwrap_or([0.0, 0.0, 0.0])
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Connected components of `matches`, where two matches connect when their
/// 3d positions are within `CLUSTER_DISTANCE`. Returns member indices.
pub fn cluster_matches(matches: &[Correspondence]) -> Vec<Vec<usize>> {
    let n = matches.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if distance(&position(&matches[i]), &position(&matches[j])) <= CLUSTER_DISTANCE {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut slots: HashMap<usize, usize> = HashMap::new();
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        let slot = *slots.entry(root).or_insert_with(|| {
            clusters.push(Vec::new());
            clusters.len() - 1
        });
        clusters[slot].push(i);
    }
    clusters
}

/// Among the matches of a single query feature, keeps the members of the
/// largest clusters that are closer than average in descriptor space.
pub fn pick_likeliest(matches: &[Correspondence]) -> Vec<usize> {
    if matches.is_empty() {
        return Vec::new();
    }
    let mean = matches.iter().map(|m| m.feature_dist).sum::<f64>() / matches.len() as f64;
    let clusters = cluster_matches(matches);
    let largest = clusters.iter().map(Vec::len).max().unwrap_or(0);
    clusters
        .into_iter()
        .filter(|c| c.len() == largest)
        .flatten()
        .filter(|&i| matches[i].feature_dist < mean)
        .collect()
}

/// Merges the rankings of several cells, resolving every query feature that
/// voted in more than one place to its spatially most consistent votes.
pub fn combine_spatial(per_cell: &[Vec<CandidateImage>]) -> Vec<CandidateImage> {
    let mut groups: Vec<(Vec<Correspondence>, Vec<&str>)> = Vec::new();
    let mut slots: HashMap<[u64; 4], usize> = HashMap::new();
    for ranked in per_cell {
        for candidate in ranked {
            for m in &candidate.matches {
                let slot = *slots.entry(m.query.key()).or_insert_with(|| {
                    groups.push((Vec::new(), Vec::new()));
                    groups.len() - 1
                });
                groups[slot].0.push(m.clone());
                groups[slot].1.push(&candidate.image);
            }
        }
    }

    let mut ballots = BallotBox::new();
    for (matches, images) in &groups {
        for i in pick_likeliest(matches) {
            ballots.add(images[i], matches[i].clone());
        }
    }
    ballots.into_ranked()
}

/// Number of distinct query/database pairs among `matches`.
pub fn count_unique_matches(matches: &[Correspondence]) -> usize {
    matches
        .iter()
        .map(Correspondence::geometry_key)
        .collect::<HashSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Geometry;

    fn vote(qx: f64, dbx: f64, dist: f64, pt: Option<[f64; 3]>) -> Correspondence {
        let mut m = Correspondence::new(
            Geometry::new(qx, 0.0, 1.0, 0.0),
            Geometry::new(dbx, 0.0, 1.0, 0.0),
            dist,
        );
        m.pt_3d = pt;
        m
    }

    fn candidate(image: &str, matches: Vec<Correspondence>) -> CandidateImage {
        CandidateImage {
            image: image.to_owned(),
            matches,
        }
    }

    #[test]
    fn test_flat_combine_adds_up_cells() {
        let cell1 = vec![
            candidate("a", vec![vote(1.0, 1.0, 1.0, None)]),
            candidate("b", vec![vote(2.0, 2.0, 1.0, None)]),
        ];
        let cell2 = vec![candidate(
            "b",
            vec![vote(3.0, 3.0, 1.0, None), vote(3.0, 3.0, 1.0, None)],
        )];
        let combined = combine_matches(&[cell1.clone(), cell2.clone()], |_| true);
        assert_eq!(combined[0].image, "b");
        assert_eq!(combined[0].votes(), 3);
        assert_eq!(combined[1].votes(), 1);
        assert_eq!(count_unique_matches(&combined[0].matches), 2);

        let combined = combine_matches(&[cell1, cell2], |m| m.query.x != 3.0);
        assert_eq!(combined[0].votes(), 1);
        assert_eq!(combined[1].votes(), 1);
    }

    #[test]
    fn test_clusters_are_connected_components() {
        let matches = vec![
            vote(0.0, 0.0, 1.0, Some([0.0, 0.0, 0.0])),
            vote(0.0, 1.0, 1.0, Some([100.0, 0.0, 0.0])),
            vote(0.0, 2.0, 1.0, Some([10.0, 0.0, 0.0])),
            vote(0.0, 3.0, 1.0, Some([25.0, 0.0, 0.0])),
            vote(0.0, 4.0, 1.0, None),
        ];
        assert_eq!(cluster_matches(&matches), vec![vec![0, 2, 3, 4], vec![1]]);
    }

    #[test]
    fn test_pick_likeliest_prefers_close_votes_of_largest_cluster() {
        let matches = vec![
            vote(0.0, 0.0, 10.0, Some([0.0, 0.0, 0.0])),
            vote(0.0, 1.0, 40.0, Some([5.0, 0.0, 0.0])),
            vote(0.0, 2.0, 1.0, Some([500.0, 0.0, 0.0])),
        ];
        // mean 17, cluster {0, 1} wins; only the first is below the mean
        assert_eq!(pick_likeliest(&matches), vec![0]);
    }

    #[test]
    fn test_spatial_combine_resolves_per_query_feature() {
        let cell1 = vec![candidate(
            "near",
            vec![
                vote(1.0, 1.0, 10.0, Some([0.0, 0.0, 0.0])),
                vote(2.0, 2.0, 10.0, Some([1.0, 0.0, 0.0])),
            ],
        )];
        let cell2 = vec![
            candidate("near2", vec![vote(1.0, 5.0, 30.0, Some([3.0, 0.0, 0.0]))]),
            candidate("far", vec![vote(1.0, 6.0, 2.0, Some([900.0, 0.0, 0.0]))]),
        ];
        let combined = combine_spatial(&[cell1, cell2]);
        // query feature 1: mean 14, cluster {near, near2} wins, keeps near (10)
        // query feature 2: a single vote never beats its own mean
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].image, "near");
        assert_eq!(combined[0].votes(), 1);
        assert_eq!(combined[0].matches[0].db.x, 1.0);
    }
}
