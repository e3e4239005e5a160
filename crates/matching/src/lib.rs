mod cache;
mod combine;
mod correspondence;
mod decoy;
mod error;
mod feature;
mod geometry;
mod index;
mod params;
mod progress;
mod runner;
mod store;
mod verify;
mod vote;

pub use cache::{
    cell_id, dump_path, index_file_name, read_dump, read_summary, save_atomic, write_dump,
    write_summary, DETAIL_VERSION,
};
pub use combine::{
    cluster_matches, combine_matches, combine_spatial, count_unique_matches, pick_likeliest,
    CLUSTER_DISTANCE,
};
pub use correspondence::{rank, BallotBox, CandidateImage, Correspondence};
pub use decoy::DecoyCache;
pub use error::{MatchingError, Result};
pub use feature::{Dataset, Feature, Geometry, ImageFeatures};
pub use geometry::{
    is_homography_good, project_reference_point, ReferencePoint, REFERENCE_POINTS,
};
pub use index::{open_index, IndexBuilder, Neighbor, NeighborIndex};
pub use params::{Algorithm, DescriptorKind, DistanceType, SearchParams, VoteMethod};
pub use progress::ProgressReporter;
pub use runner::{QueryRunner, QueryUnit, RunContext, UnitOutcome, UnitState};
pub use store::{image_name, load_cell, load_cells, load_descriptor_file, load_query, parse_descriptors};
pub use verify::{
    find_corr, filter_rotation, rank_candidates, rotation_delta, spatially_ordered, Axis, Mode,
    VerifiedCandidate, Verification,
};
pub use vote::{rematch, Ballot, VoteTally, VotingEngine};
