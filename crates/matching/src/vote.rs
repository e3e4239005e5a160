use crate::correspondence::{rank, BallotBox, CandidateImage, Correspondence};
use crate::decoy::DecoyCache;
use crate::error::{MatchingError, Result};
use crate::feature::Dataset;
use crate::index::Neighbor;
use crate::params::{SearchParams, VoteMethod};
use crate::verify::{find_corr, Mode};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

const RATIO_BUBBLE_METERS: f64 = 10.0;
const RATIO_THRESHOLD: f64 = 0.95;
const RANSAC_MAX_FILTERED: usize = 10;
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// How the votes of one query were decided.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub accepted: usize,
    pub rejected: usize,
    /// Rejected because the database feature already took a vote.
    pub collisions: usize,
    /// Rejected by the spatial ratio test.
    pub ratio: usize,
    /// Rejected because the decoy cell matched closer.
    pub losing: usize,
    /// Lost against a decoy feature that had already been beaten once.
    pub escaped: usize,
}

impl VoteTally {
    fn log(&self) {
        info!(
            "accepted {}/{} votes",
            self.accepted,
            self.accepted + self.rejected
        );
        if self.collisions > 0 {
            info!("discarded {} vote collisions", self.collisions);
        }
        if self.ratio > 0 {
            info!("discarded {} votes using ratio test", self.ratio);
        }
        if self.losing > 0 {
            info!("discarded {} losing votes", self.losing);
        }
        if self.escaped > 0 {
            info!("{} votes escaped filtering", self.escaped);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ballot {
    pub ranked: Vec<CandidateImage>,
    pub tally: VoteTally,
}

pub struct VotingEngine {
    params: SearchParams,
    decoy: Option<Arc<DecoyCache>>,
}

impl VotingEngine {
    pub fn new(params: SearchParams) -> Self {
        VotingEngine {
            params,
            decoy: None,
        }
    }

    pub fn with_decoy(mut self, decoy: Arc<DecoyCache>) -> Self {
        self.decoy = Some(decoy);
        self
    }

    /// Turns the neighbours of every query feature into ranked candidates.
    /// `neighbors[i]` lists the hits of query row `i`, nearest first.
    pub fn vote(&self, query: &Dataset, dataset: &Dataset, neighbors: &[Vec<Neighbor>]) -> Result<Ballot> {
        if neighbors.len() != query.len() {
            return Err(MatchingError::Dataset(format!(
                "{} neighbour lists for {} query features",
                neighbors.len(),
                query.len()
            )));
        }
        info!("voting with method {}", self.params.vote_method);
        let threshold = self.params.dist_threshold;
        let k = self.params.num_neighbors;
        let ballot = match self.params.vote_method {
            VoteMethod::MatchOnce => vote_matchonce(query, dataset, neighbors, threshold),
            VoteMethod::TopN if k > 1 => vote_top_n(query, dataset, neighbors, threshold),
            VoteMethod::TopN => vote_matchonce(query, dataset, neighbors, threshold),
            VoteMethod::Highest => vote_highest(query, dataset, neighbors, threshold),
            VoteMethod::Ratio => {
                if !dataset.has_3d_map() {
                    return Err(MatchingError::Config(
                        "ratio voting needs a 3d map for the searched cells".to_owned(),
                    ));
                }
                vote_ratio(query, dataset, neighbors, threshold)
            }
            VoteMethod::Filter => {
                let decoy = self.decoy.as_ref().ok_or_else(|| {
                    MatchingError::Config("filter voting needs a decoy cell".to_owned())
                })?;
                let contest = decoy.search(query)?;
                vote_filter(query, dataset, neighbors, &contest, threshold)
            }
            VoteMethod::Ransac => vote_ransac(query, dataset, neighbors, threshold, k),
        };
        ballot.tally.log();
        Ok(ballot)
    }
}

fn correspondence(query: &Dataset, i: usize, dataset: &Dataset, n: &Neighbor) -> Correspondence {
    Correspondence::new(query.geometry(i), dataset.geometry(n.row), n.dist)
}

/// Each database feature takes at most one vote; the earliest query
/// feature claims it.
pub fn vote_matchonce(query: &Dataset, dataset: &Dataset, neighbors: &[Vec<Neighbor>], threshold: f64) -> Ballot {
    let mut tally = VoteTally::default();
    let mut ballots = BallotBox::new();
    let mut closed = HashSet::new();
    for (i, hits) in neighbors.iter().enumerate() {
        let n = match hits.first() {
            Some(n) if n.dist <= threshold => n,
            _ => {
                tally.rejected += 1;
                continue;
            }
        };
        if !closed.insert(n.row) {
            tally.rejected += 1;
            tally.collisions += 1;
            continue;
        }
        tally.accepted += 1;
        let mut m = correspondence(query, i, dataset, n);
        m.point = dataset.point(n.row).map(|p| p.to_vec());
        m.pt_3d = Some([0.0, 0.0, 0.0]);
        ballots.add(dataset.image(n.row), m);
    }
    Ballot {
        ranked: ballots.into_ranked(),
        tally,
    }
}

/// Up to one vote per image from each of a query feature's neighbours.
pub fn vote_top_n(query: &Dataset, dataset: &Dataset, neighbors: &[Vec<Neighbor>], threshold: f64) -> Ballot {
    let mut tally = VoteTally::default();
    let mut ballots = BallotBox::new();
    let mut closed = HashSet::new();
    for (i, hits) in neighbors.iter().enumerate() {
        let mut marked = HashSet::new();
        for n in hits {
            if closed.contains(&n.row) {
                tally.rejected += 1;
                tally.collisions += 1;
            } else if n.dist < threshold {
                closed.insert(n.row);
                let image = dataset.image(n.row);
                if marked.insert(image) {
                    ballots.add(image, correspondence(query, i, dataset, n));
                }
                tally.accepted += 1;
            } else {
                tally.rejected += 1;
            }
        }
    }
    Ballot {
        ranked: ballots.into_ranked(),
        tally,
    }
}

/// Every neighbour under the threshold votes, with no collision handling.
pub fn vote_highest(query: &Dataset, dataset: &Dataset, neighbors: &[Vec<Neighbor>], threshold: f64) -> Ballot {
    let mut tally = VoteTally::default();
    let mut ballots = BallotBox::new();
    for (i, hits) in neighbors.iter().enumerate() {
        match hits.first() {
            Some(n) if n.dist < threshold => {
                tally.accepted += 1;
                ballots.add(dataset.image(n.row), correspondence(query, i, dataset, n));
            }
            _ => tally.rejected += 1,
        }
    }
    Ballot {
        ranked: ballots.into_ranked(),
        tally,
    }
}

/// Approximate distance in meters between two (lat, lon, alt) positions.
fn distance_3d(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let (lat1, lat2) = (a[0].to_radians(), b[0].to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b[1] - a[1]).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let ground = 2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin();
    (ground * ground + (b[2] - a[2]).powi(2)).sqrt()
}

/// Distance to the first other neighbour that is unlocated or lies outside
/// the bubble around `origin`.
fn first_distant_neighbor(dataset: &Dataset, hits: &[Neighbor], origin: &[f64; 3]) -> Option<f64> {
    hits.iter()
        .skip(1)
        .find(|n| match dataset.pt_3d(n.row) {
            None => true,
            Some(p) => distance_3d(&p, origin) > RATIO_BUBBLE_METERS,
        })
        .map(|n| n.dist)
}

/// Match-once voting where the nearest neighbour must also beat, by ratio,
/// the nearest neighbour that shows a different place.
pub fn vote_ratio(query: &Dataset, dataset: &Dataset, neighbors: &[Vec<Neighbor>], threshold: f64) -> Ballot {
    let mut tally = VoteTally::default();
    let mut ballots = BallotBox::new();
    let mut closed = HashSet::new();
    for (i, hits) in neighbors.iter().enumerate() {
        let n = match hits.first() {
            Some(n) => n,
            None => {
                tally.rejected += 1;
                continue;
            }
        };
        if closed.contains(&n.row) {
            tally.collisions += 1;
            tally.rejected += 1;
            continue;
        }
        if n.dist > threshold {
            tally.rejected += 1;
            continue;
        }
        let passes = match dataset.pt_3d(n.row) {
            None => true,
            Some(origin) => match first_distant_neighbor(dataset, hits, &origin) {
                None => true,
                Some(other) => n.dist / other < RATIO_THRESHOLD,
            },
        };
        if !passes {
            tally.ratio += 1;
            tally.rejected += 1;
            continue;
        }
        closed.insert(n.row);
        ballots.add(dataset.image(n.row), correspondence(query, i, dataset, n));
        tally.accepted += 1;
    }
    Ballot {
        ranked: ballots.into_ranked(),
        tally,
    }
}

/// Match-once voting where every vote must also beat the nearest feature
/// of the decoy cell, given per query feature in `contest`.
pub fn vote_filter(
    query: &Dataset,
    dataset: &Dataset,
    neighbors: &[Vec<Neighbor>],
    contest: &[Vec<Neighbor>],
    threshold: f64,
) -> Ballot {
    let mut tally = VoteTally::default();
    let mut ballots = BallotBox::new();
    let mut closed = HashSet::new();
    let mut beaten = HashSet::new();
    for (i, hits) in neighbors.iter().enumerate() {
        let n = match hits.first() {
            Some(n) if n.dist <= threshold => n,
            _ => {
                tally.rejected += 1;
                continue;
            }
        };
        let decoy = contest.get(i).and_then(|c| c.first());
        if let Some(decoy) = decoy.filter(|d| n.dist > d.dist) {
            tally.rejected += 1;
            if beaten.insert(decoy.row) {
                tally.losing += 1;
            } else {
                tally.escaped += 1;
            }
            continue;
        }
        if !closed.insert(n.row) {
            tally.rejected += 1;
            tally.collisions += 1;
            continue;
        }
        tally.accepted += 1;
        let mut m = correspondence(query, i, dataset, n);
        m.point = dataset.point(n.row).map(|p| p.to_vec());
        ballots.add(dataset.image(n.row), m);
    }
    Ballot {
        ranked: ballots.into_ranked(),
        tally,
    }
}

/// Votes, then keeps only the geometrically consistent votes of the best
/// candidates. Falls back to the plain ranking if nothing survives.
pub fn vote_ransac(
    query: &Dataset,
    dataset: &Dataset,
    neighbors: &[Vec<Neighbor>],
    threshold: f64,
    k: usize,
) -> Ballot {
    let ballot = if k > 1 {
        vote_top_n(query, dataset, neighbors, threshold)
    } else {
        vote_matchonce(query, dataset, neighbors, threshold)
    };

    let mut filtered = Vec::new();
    let mut bound = 0;
    let mut num_filtered = 0;
    for candidate in &ballot.ranked {
        if candidate.votes() < bound || num_filtered > RANSAC_MAX_FILTERED {
            info!("stopped after filtering {}", num_filtered);
            break;
        }
        num_filtered += 1;
        let verification = find_corr(&candidate.matches, Mode::Fundamental);
        bound = bound.max(verification.num_inliers());
        if verification.num_inliers() > 0 {
            filtered.push(CandidateImage {
                image: candidate.image.clone(),
                matches: verification.inlier_matches(&candidate.matches),
            });
        }
    }

    if filtered.is_empty() {
        warn!("ransac rejected everything, not filtering");
        return ballot;
    }
    Ballot {
        ranked: rank(filtered),
        tally: ballot.tally,
    }
}

/// Exhaustive match-once pairing of a query against one database image,
/// taking the closest pairs first.
pub fn rematch(query: &Dataset, db: &Dataset, threshold: f64, limit: usize) -> Vec<Correspondence> {
    let mut nearest: Vec<(usize, Neighbor)> = (0..query.len())
        .filter_map(|i| {
            let q = query.vector(i);
            (0..db.len())
                .map(|row| {
                    let dist = q
                        .iter()
                        .zip(db.vector(row))
                        .map(|(a, b)| {
                            let d = (*a - *b) as f64;
                            d * d
                        })
                        .sum::<f64>();
                    Neighbor::new(row, dist)
                })
                .min_by(|a, b| a.dist.total_cmp(&b.dist))
                .map(|n| (i, n))
        })
        .collect();
    nearest.sort_by(|a, b| a.1.dist.total_cmp(&b.1.dist));

    let mut closed = HashSet::new();
    let mut matches = Vec::new();
    for (i, n) in nearest {
        if matches.len() == limit {
            break;
        }
        if n.dist < threshold && closed.insert(n.row) {
            matches.push(correspondence(query, i, db, &n));
        }
    }
    matches
}
