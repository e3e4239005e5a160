use crate::cache::{dump_path, index_file_name, write_dump, write_summary};
use crate::decoy::DecoyCache;
use crate::error::{MatchingError, Result};
use crate::index::{open_index, IndexBuilder};
use crate::params::{SearchParams, VoteMethod};
use crate::progress::ProgressReporter;
use crate::store::{load_cells, load_query};
use crate::vote::{VoteTally, VotingEngine};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Settings shared by every unit of a batch.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub cache_dir: PathBuf,
    /// Restricts cells to images whose name contains this string. Part of
    /// the cached index name.
    pub criteria: Option<String>,
    pub params: SearchParams,
    pub max_concurrent: usize,
}

impl RunContext {
    pub fn new(cache_dir: impl Into<PathBuf>, params: SearchParams) -> Self {
        RunContext {
            cache_dir: cache_dir.into(),
            criteria: None,
            params,
            max_concurrent: 1,
        }
    }
}

/// One query against one cell, or against several cells searched as one.
#[derive(Clone, Debug)]
pub struct QueryUnit {
    pub query: PathBuf,
    pub cells: Vec<PathBuf>,
    /// Summary file; the detailed dump is written next to it.
    pub outfile: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    IndexReady,
    Queried,
    Voted,
    Persisted,
}

#[derive(Clone, Debug)]
pub struct UnitOutcome {
    pub outfile: PathBuf,
    pub state: UnitState,
    /// The results were already on disk and nothing was computed.
    pub cached: bool,
    pub tally: Option<VoteTally>,
}

fn advance(unit: &QueryUnit, state: &mut UnitState, next: UnitState) {
    debug!("{}: {:?} -> {:?}", unit.outfile.display(), state, next);
    *state = next;
}

pub struct QueryRunner {
    context: RunContext,
    builder: Arc<dyn IndexBuilder>,
    engine: VotingEngine,
    progress: ProgressReporter,
}

impl QueryRunner {
    pub fn new(
        context: RunContext,
        builder: Arc<dyn IndexBuilder>,
        decoy: Option<Arc<DecoyCache>>,
    ) -> Result<Self> {
        context.params.validate()?;
        if context.max_concurrent == 0 {
            return Err(MatchingError::Config(
                "max_concurrent must be at least 1".to_owned(),
            ));
        }
        match &decoy {
            Some(decoy) if !decoy.cell().is_dir() => {
                return Err(MatchingError::Config(format!(
                    "decoy cell {} is not available",
                    decoy.cell().display()
                )));
            }
            None if context.params.vote_method == VoteMethod::Filter => {
                return Err(MatchingError::Config(
                    "filter voting needs a decoy cell".to_owned(),
                ));
            }
            _ => {}
        }
        let mut engine = VotingEngine::new(context.params.clone());
        if let Some(decoy) = decoy {
            engine = engine.with_decoy(decoy);
        }
        Ok(QueryRunner {
            context,
            builder,
            engine,
            progress: ProgressReporter::noop(),
        })
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Runs one unit to completion, or returns at once when both of its
    /// result files already exist.
    pub fn run(&self, unit: &QueryUnit) -> Result<UnitOutcome> {
        let params = &self.context.params;
        let criteria = self.context.criteria.as_deref();
        let dump = dump_path(&unit.outfile);
        let mut state = UnitState::Pending;

        if unit.outfile.exists() && dump.exists() {
            info!("using cached matches in {}", dump.display());
            advance(unit, &mut state, UnitState::Persisted);
            return Ok(UnitOutcome {
                outfile: unit.outfile.clone(),
                state,
                cached: true,
                tally: None,
            });
        }

        let start = Instant::now();
        let dataset = load_cells(&unit.cells, params.descriptor, criteria)?;
        let index_path = self
            .context
            .cache_dir
            .join(index_file_name(&unit.cells, criteria, params));
        let index = open_index(self.builder.as_ref(), &dataset, params, &index_path)?;
        advance(unit, &mut state, UnitState::IndexReady);

        let query = load_query(&unit.query, params.descriptor)?;
        let query_start = Instant::now();
        let neighbors = index.knn(&dataset, &query, params.num_neighbors)?;
        info!(
            "query took {:.3}s",
            query_start.elapsed().as_secs_f64()
        );
        advance(unit, &mut state, UnitState::Queried);
        drop(index);

        let vote_start = Instant::now();
        let ballot = self.engine.vote(&query, &dataset, &neighbors)?;
        info!(
            "voting took {:.3}s",
            vote_start.elapsed().as_secs_f64()
        );
        advance(unit, &mut state, UnitState::Voted);

        write_dump(&dump, &ballot.ranked)?;
        write_summary(&unit.outfile, &ballot.ranked)?;
        advance(unit, &mut state, UnitState::Persisted);
        info!("took {:.3}s total", start.elapsed().as_secs_f64());

        Ok(UnitOutcome {
            outfile: unit.outfile.clone(),
            state,
            cached: false,
            tally: Some(ballot.tally),
        })
    }

    /// Runs all units with at most `max_concurrent` at a time. Every unit
    /// runs to completion even when others fail; results are returned in
    /// the order of `units`.
    pub fn run_parallel(&self, units: &[QueryUnit]) -> Result<Vec<Result<UnitOutcome>>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.context.max_concurrent)
            .build()?;
        let total = units.len() as u64;
        let finished = AtomicU64::new(0);
        self.progress.report(0, total, "");

        Ok(pool.install(|| {
            units
                .par_iter()
                .map(|unit| {
                    let outcome = self.run(unit);
                    if let Err(e) = &outcome {
                        warn!("{} failed: {}", unit.outfile.display(), e);
                    }
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    self.progress
                        .report(done, total, &unit.outfile.display().to_string());
                    outcome
                })
                .collect::<Vec<_>>()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::read_summary;
    use crate::index::testing::CountingBuilder;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use tempdir::TempDir;

    fn write_keys(path: &Path, keys: &[(f64, f64, u8)]) {
        let mut text = format!("{} 128\n", keys.len());
        for (x, y, v) in keys {
            let mut values = vec!["0".to_owned(); 128];
            values[0] = v.to_string();
            text.push_str(&format!("{} {} 1 0 {}\n", x, y, values.join(" ")));
        }
        fs::write(path, text).unwrap();
    }

    fn setup(root: &Path) -> (PathBuf, PathBuf) {
        let cell = root.join("37.87,-122.27");
        fs::create_dir_all(&cell).unwrap();
        write_keys(&cell.join("imgAsift.txt"), &[(1.0, 1.0, 10), (2.0, 2.0, 20)]);
        write_keys(&cell.join("imgBsift.txt"), &[(3.0, 3.0, 200)]);
        let query = root.join("qsift.txt");
        write_keys(&query, &[(5.0, 5.0, 11), (6.0, 6.0, 199), (7.0, 7.0, 21)]);
        (cell, query)
    }

    #[test]
    fn test_second_run_is_served_from_disk() {
        let temp_dir = TempDir::new("runner").unwrap();
        let (cell, query) = setup(temp_dir.path());
        let builder = Arc::new(CountingBuilder::default());
        let context = RunContext::new(temp_dir.path().join("cache"), SearchParams::default());
        let runner = QueryRunner::new(context, builder.clone(), None).unwrap();
        let unit = QueryUnit {
            query,
            cells: vec![cell],
            outfile: temp_dir.path().join("out").join("q.res"),
        };

        let first = runner.run(&unit).unwrap();
        assert_eq!(first.state, UnitState::Persisted);
        assert!(!first.cached);
        assert_eq!(first.tally.unwrap().accepted, 3);
        assert_eq!(
            read_summary(&unit.outfile).unwrap(),
            vec![(2, "imgA".to_owned()), (1, "imgB".to_owned())]
        );
        let summary = fs::read(&unit.outfile).unwrap();
        let dump = fs::read(dump_path(&unit.outfile)).unwrap();

        let second = runner.run(&unit).unwrap();
        assert!(second.cached);
        assert_eq!(second.state, UnitState::Persisted);
        assert_eq!(builder.builds(), 1);
        assert_eq!(fs::read(&unit.outfile).unwrap(), summary);
        assert_eq!(fs::read(dump_path(&unit.outfile)).unwrap(), dump);
    }

    #[test]
    fn test_units_share_the_cached_index() {
        let temp_dir = TempDir::new("runner").unwrap();
        let (cell, query) = setup(temp_dir.path());
        let builder = Arc::new(CountingBuilder::default());
        let mut context = RunContext::new(temp_dir.path().join("cache"), SearchParams::default());
        context.max_concurrent = 2;

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let runner = QueryRunner::new(context, builder.clone(), None)
            .unwrap()
            .with_progress(ProgressReporter::new(Arc::new(move |done, total, _| {
                sink.lock().unwrap().push((done, total));
            })));

        let units: Vec<QueryUnit> = (0..3)
            .map(|i| QueryUnit {
                query: query.clone(),
                cells: vec![cell.clone()],
                outfile: temp_dir.path().join(format!("q{}.res", i)),
            })
            .collect();
        runner.run(&units[0]).unwrap();
        let outcomes = runner
            .run_parallel(&units)
            .unwrap()
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(builder.builds(), 1);
        let outfiles: Vec<_> = outcomes.iter().map(|o| o.outfile.clone()).collect();
        let expected: Vec<_> = units.iter().map(|u| u.outfile.clone()).collect();
        assert_eq!(outfiles, expected);
        assert!(outcomes[0].cached);
        assert!(!outcomes[1].cached);
        assert!(outcomes.iter().all(|o| o.state == UnitState::Persisted));

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 4);
        assert!(reports.contains(&(3, 3)));
    }

    #[test]
    fn test_invalid_parameters_fail_before_work() {
        let mut params = SearchParams::default();
        params.num_neighbors = 3;
        let context = RunContext::new("/nonexistent", params);
        assert!(QueryRunner::new(context, Arc::new(CountingBuilder::default()), None).is_err());
    }

    #[test]
    fn test_failed_unit_does_not_stop_the_others() {
        let temp_dir = TempDir::new("runner").unwrap();
        let (cell, query) = setup(temp_dir.path());
        let context = RunContext::new(temp_dir.path().join("cache"), SearchParams::default());
        let runner =
            QueryRunner::new(context, Arc::new(CountingBuilder::default()), None).unwrap();

        let cells = [temp_dir.path().join("1.0,2.0"), cell.clone(), cell];
        let units: Vec<QueryUnit> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| QueryUnit {
                query: query.clone(),
                cells: vec![cell.clone()],
                outfile: temp_dir.path().join(format!("q{}.res", i)),
            })
            .collect();
        let results = runner.run_parallel(&units).unwrap();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(MatchingError::Io { .. })));
        for (result, unit) in results.iter().zip(&units).skip(1) {
            assert_eq!(result.as_ref().unwrap().state, UnitState::Persisted);
            assert!(unit.outfile.exists());
            assert!(dump_path(&unit.outfile).exists());
        }
        assert!(!units[0].outfile.exists());
    }

    #[test]
    fn test_filter_vote_needs_an_available_decoy() {
        let temp_dir = TempDir::new("runner").unwrap();
        let mut params = SearchParams::default();
        params.vote_method = VoteMethod::Filter;
        let builder = Arc::new(CountingBuilder::default());

        let context = RunContext::new(temp_dir.path().join("cache"), params.clone());
        let err = QueryRunner::new(context.clone(), builder.clone(), None);
        assert!(matches!(err, Err(MatchingError::Config(_))));

        let decoy = Arc::new(DecoyCache::new(
            temp_dir.path().join("no-such-cell"),
            temp_dir.path().join("cache"),
            builder.clone(),
            params,
        ));
        let err = QueryRunner::new(context.clone(), builder.clone(), Some(decoy));
        assert!(matches!(err, Err(MatchingError::Config(_))));

        let (cell, _) = setup(temp_dir.path());
        let decoy = Arc::new(DecoyCache::new(
            cell,
            temp_dir.path().join("cache"),
            builder.clone(),
            context.params.clone(),
        ));
        assert!(QueryRunner::new(context, builder.clone(), Some(decoy)).is_ok());
        assert_eq!(builder.builds(), 0);
    }
}
