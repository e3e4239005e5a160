use crate::check_shape;
use crate::distance::{distance, plane_bound, KBest};
use matching::{Dataset, DistanceType, Neighbor, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thread_local::ThreadLocal;

const LEAF_SIZE: usize = 8;
/// Rows sampled to estimate per-dimension variance at a split.
const SAMPLE_SIZE: usize = 100;
/// The split dimension is drawn from this many highest-variance dimensions.
const RAND_DIMS: usize = 5;
const SEED: u64 = 0x6b64_7472_6565;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf { start: u32, end: u32 },
    Split { dim: u32, value: f32, left: u32, right: u32 },
}

/// One randomized kd-tree. Leaves address ranges of `order`, which holds
/// dataset rows; rows left of a split have `v <= value`, rows right of it
/// `v >= value`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KdTree {
    nodes: Vec<Node>,
    order: Vec<u32>,
}

struct TreeBuilder<'a> {
    dataset: &'a Dataset,
    order: Vec<u32>,
    nodes: Vec<Node>,
    rng: StdRng,
}

impl<'a> TreeBuilder<'a> {
    fn value(&self, i: usize, dim: usize) -> f32 {
        self.dataset.vector(self.order[i] as usize)[dim]
    }

    fn choose_dim(&mut self, start: usize, end: usize) -> usize {
        let dim = self.dataset.dim();
        let count = (end - start).min(SAMPLE_SIZE);
        let mut mean = vec![0.0f64; dim];
        let mut var = vec![0.0f64; dim];
        for i in start..start + count {
            let v = self.dataset.vector(self.order[i] as usize);
            for d in 0..dim {
                mean[d] += v[d] as f64;
            }
        }
        for m in mean.iter_mut() {
            *m /= count as f64;
        }
        for i in start..start + count {
            let v = self.dataset.vector(self.order[i] as usize);
            for d in 0..dim {
                let diff = v[d] as f64 - mean[d];
                var[d] += diff * diff;
            }
        }

        let mut dims: Vec<usize> = (0..dim).collect();
        dims.sort_by(|a, b| var[*b].total_cmp(&var[*a]).then(a.cmp(b)));
        let top = RAND_DIMS.min(dim);
        dims[self.rng.gen_range(0..top)]
    }

    fn mean_of(&self, start: usize, end: usize, dim: usize) -> f32 {
        let count = (end - start).min(SAMPLE_SIZE);
        let sum: f64 = (start..start + count)
            .map(|i| self.value(i, dim) as f64)
            .sum();
        (sum / count as f64) as f32
    }

    fn split(&mut self, start: usize, end: usize, dim: usize) -> (usize, f32) {
        let value = self.mean_of(start, end, dim);
        let mut mid = start;
        for j in start..end {
            if self.value(j, dim) < value {
                self.order.swap(mid, j);
                mid += 1;
            }
        }
        if mid > start && mid < end {
            return (mid, value);
        }

        // the mean left one side empty, split at the median instead
        let dataset = self.dataset;
        let key = |row: &u32| dataset.vector(*row as usize)[dim];
        let half = (end - start) / 2;
        self.order[start..end]
            .select_nth_unstable_by(half, |a, b| key(a).total_cmp(&key(b)));
        let mid = start + half;
        (mid, self.value(mid, dim))
    }

    fn build(&mut self, start: usize, end: usize) -> u32 {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            start: start as u32,
            end: end as u32,
        });
        if end - start <= LEAF_SIZE || self.dataset.dim() == 0 {
            return id as u32;
        }

        let dim = self.choose_dim(start, end);
        let (mid, value) = self.split(start, end, dim);
        let left = self.build(start, mid);
        let right = self.build(mid, end);
        self.nodes[id] = Node::Split {
            dim: dim as u32,
            value,
            left,
            right,
        };
        id as u32
    }
}

impl KdTree {
    pub fn build(dataset: &Dataset, seed: u64) -> KdTree {
        let mut builder = TreeBuilder {
            dataset,
            order: (0..dataset.len() as u32).collect(),
            nodes: Vec::new(),
            rng: StdRng::seed_from_u64(SEED ^ seed),
        };
        builder.build(0, dataset.len());
        KdTree {
            nodes: builder.nodes,
            order: builder.order,
        }
    }

    /// Whether the tree can be walked safely over `rows` vectors of `dim`
    /// dimensions.
    pub fn is_consistent(&self, rows: usize, dim: usize) -> bool {
        if self.nodes.is_empty() || self.order.len() != rows {
            return false;
        }
        if self.order.iter().any(|&row| row as usize >= rows) {
            return false;
        }
        let nodes = self.nodes.len() as u32;
        self.nodes.iter().enumerate().all(|(id, node)| match *node {
            Node::Leaf { start, end } => start <= end && end as usize <= rows,
            Node::Split {
                dim: d,
                left,
                right,
                ..
            } => {
                (d as usize) < dim
                    && left > id as u32
                    && right > id as u32
                    && left < nodes
                    && right < nodes
            }
        })
    }
}

/// A branch not yet explored, with a lower bound on the distance of
/// everything below it.
#[derive(Clone, Copy)]
struct Branch {
    bound: f64,
    tree: u32,
    node: u32,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    // reversed, so the heap pops the closest branch first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .bound
            .total_cmp(&self.bound)
            .then(other.tree.cmp(&self.tree))
            .then(other.node.cmp(&self.node))
    }
}

/// Per-thread search state. A row is visited in the current search when
/// its stamp equals `epoch`.
#[derive(Default)]
struct Scratch {
    stamps: Vec<u32>,
    epoch: u32,
    branches: BinaryHeap<Branch>,
}

impl Scratch {
    fn reset(&mut self, rows: usize) {
        if self.stamps.len() != rows {
            self.stamps = vec![0; rows];
            self.epoch = 0;
        }
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.stamps.iter_mut().for_each(|s| *s = 0);
            self.epoch = 1;
        }
        self.branches.clear();
    }

    fn visit(&mut self, row: u32) -> bool {
        let stamp = &mut self.stamps[row as usize];
        if *stamp == self.epoch {
            return false;
        }
        *stamp = self.epoch;
        true
    }
}

struct Search<'a> {
    trees: &'a [KdTree],
    dataset: &'a Dataset,
    query: &'a [f32],
    distance: DistanceType,
    checks: i64,
    checked: i64,
    best: KBest,
}

impl<'a> Search<'a> {
    fn exhausted(&self) -> bool {
        self.checks >= 0 && self.checked >= self.checks && self.best.is_full()
    }

    fn prunes(&self, bound: f64) -> bool {
        self.best.is_full() && bound > self.best.worst()
    }

    fn descend(&mut self, scratch: &mut Scratch, tree: u32, mut node: u32, bound: f64) {
        let trees = self.trees;
        let kd = &trees[tree as usize];
        loop {
            if self.exhausted() {
                return;
            }
            match kd.nodes[node as usize] {
                Node::Leaf { start, end } => {
                    for &row in &kd.order[start as usize..end as usize] {
                        if !scratch.visit(row) {
                            continue;
                        }
                        self.checked += 1;
                        let dist = distance(
                            self.distance,
                            self.query,
                            self.dataset.vector(row as usize),
                        );
                        self.best.push(row, dist);
                    }
                    return;
                }
                Node::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    let diff = (self.query[dim as usize] - value) as f64;
                    let (near, far) = if diff < 0.0 {
                        (left, right)
                    } else {
                        (right, left)
                    };
                    let far_bound = bound.max(plane_bound(self.distance, diff));
                    if !self.prunes(far_bound) {
                        scratch.branches.push(Branch {
                            bound: far_bound,
                            tree,
                            node: far,
                        });
                    }
                    node = near;
                }
            }
        }
    }

    fn run(mut self, scratch: &mut Scratch) -> Vec<Neighbor> {
        for tree in 0..self.trees.len() as u32 {
            self.descend(scratch, tree, 0, 0.0);
        }
        while let Some(branch) = scratch.branches.pop() {
            if self.exhausted() || self.prunes(branch.bound) {
                break;
            }
            self.descend(scratch, branch.tree, branch.node, branch.bound);
        }
        self.best.into_neighbors()
    }
}

/// Randomized kd-trees searched together best-bin-first, in the manner of
/// FLANN's `KDTreeIndex`.
pub struct KdForest {
    trees: Vec<KdTree>,
    distance: DistanceType,
    checks: i64,
    rows: usize,
    scratch: ThreadLocal<RefCell<Scratch>>,
}

impl KdForest {
    pub fn build(dataset: &Dataset, trees: usize, distance: DistanceType, checks: i64) -> Self {
        let trees = (0..trees as u64)
            .into_par_iter()
            .map(|seed| KdTree::build(dataset, seed))
            .collect();
        KdForest::from_trees(trees, dataset.len(), distance, checks)
    }

    pub fn from_trees(trees: Vec<KdTree>, rows: usize, distance: DistanceType, checks: i64) -> Self {
        KdForest {
            trees,
            distance,
            checks,
            rows,
            scratch: ThreadLocal::new(),
        }
    }

    pub fn trees(&self) -> &[KdTree] {
        &self.trees
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn distance(&self) -> DistanceType {
        self.distance
    }

    fn search(&self, dataset: &Dataset, query: &[f32], k: usize) -> Vec<Neighbor> {
        let cell = self.scratch.get_or(|| RefCell::new(Scratch::default()));
        let mut scratch = cell.borrow_mut();
        scratch.reset(self.rows);
        Search {
            trees: &self.trees,
            dataset,
            query,
            distance: self.distance,
            checks: self.checks,
            checked: 0,
            best: KBest::new(k),
        }
        .run(&mut scratch)
    }

    pub fn knn(&self, dataset: &Dataset, queries: &Dataset, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        check_shape(self.rows, dataset, queries)?;
        Ok((0..queries.len())
            .into_par_iter()
            .map(|i| self.search(dataset, queries.vector(i), k))
            .collect())
    }
}
