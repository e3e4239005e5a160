mod cells;
mod progress;
mod utils;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use matching::{
    combine_matches, combine_spatial, dump_path, rank_candidates, read_dump, CandidateImage,
    DecoyCache, IndexBuilder, Mode, QueryRunner, QueryUnit, RunContext, SearchParams,
    UnitOutcome,
};
use matching_flann::FlannBuilder;
use progress::IndicatifProgressReporter;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use structopt::StructOpt;
use utils::{default_cache_dir, result_path};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Combine {
    Flat,
    Spatial,
}

impl FromStr for Combine {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "flat" => Ok(Combine::Flat),
            "spatial" => Ok(Combine::Spatial),
            other => Err(format!("unknown combine mode '{}'", other)),
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "placematch")]
struct Opt {
    /// Descriptor file of the query image.
    #[structopt(name = "QUERY", parse(from_os_str))]
    query: PathBuf,

    /// Directory holding one sub directory per cell.
    #[structopt(long, parse(from_os_str))]
    db_dir: PathBuf,

    /// Cells to search, by directory name. Defaults to the cells closest to
    /// --lat/--lon.
    #[structopt(long)]
    cells: Vec<String>,

    #[structopt(long, allow_hyphen_values = true)]
    lat: Option<f64>,

    #[structopt(long, allow_hyphen_values = true)]
    lon: Option<f64>,

    /// Number of closest cells to search.
    #[structopt(long, default_value = "1")]
    ncells: usize,

    /// Search all cells with a single index instead of one index per cell.
    #[structopt(long)]
    group: bool,

    /// JSON file with search parameters.
    #[structopt(long, parse(from_os_str))]
    params: Option<PathBuf>,

    #[structopt(long, parse(from_os_str))]
    cache_dir: Option<PathBuf>,

    #[structopt(long, parse(from_os_str), default_value = "results")]
    out_dir: PathBuf,

    /// Cells searched at the same time.
    #[structopt(long, default_value = "1")]
    threads: usize,

    /// Only use database images whose name contains this string.
    #[structopt(long)]
    criteria: Option<String>,

    /// Cell without true matches, used by the filter vote.
    #[structopt(long, parse(from_os_str))]
    decoy_cell: Option<PathBuf>,

    /// How results of several cells are merged: flat or spatial.
    #[structopt(long, default_value = "flat")]
    combine: Combine,

    /// Verify candidates with a homography instead of a fundamental matrix.
    #[structopt(long)]
    homography: bool,

    /// Number of candidates to verify.
    #[structopt(long, default_value = "30")]
    top: usize,

    #[structopt(long, default_value = "1")]
    min_consistent: usize,

    /// Print the verified candidates as JSON.
    #[structopt(long)]
    json: bool,
}

fn select_cells(opt: &Opt) -> Result<Vec<PathBuf>> {
    if !opt.cells.is_empty() {
        return Ok(opt.cells.iter().map(|c| opt.db_dir.join(c)).collect());
    }
    match (opt.lat, opt.lon) {
        (Some(lat), Some(lon)) => {
            let cells = cells::closest_cells(&opt.db_dir, lat, lon, opt.ncells)?;
            if cells.is_empty() {
                bail!("No cells found in {}", opt.db_dir.to_string_lossy());
            }
            Ok(cells)
        }
        _ => bail!("Either --cells or both --lat and --lon are required"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt: Opt = Opt::from_args();

    let params = match &opt.params {
        Some(path) => SearchParams::load(path)
            .with_context(|| format!("Could not load parameters {}", path.to_string_lossy()))?,
        None => SearchParams::default(),
    };
    let cells = select_cells(&opt)?;
    info!("searching {} cells with {}", cells.len(), params.search_type());

    let cache_dir = opt.cache_dir.clone().unwrap_or_else(default_cache_dir);
    let groups: Vec<Vec<PathBuf>> = if opt.group {
        vec![cells]
    } else {
        cells.into_iter().map(|c| vec![c]).collect()
    };
    let units: Vec<QueryUnit> = groups
        .into_iter()
        .map(|cells| QueryUnit {
            outfile: result_path(&opt.out_dir, &opt.query, &cells, &params),
            query: opt.query.clone(),
            cells,
        })
        .collect();

    let builder: Arc<dyn IndexBuilder> = Arc::new(FlannBuilder::default());
    let decoy = opt.decoy_cell.as_ref().map(|cell| {
        Arc::new(DecoyCache::new(
            cell,
            &cache_dir,
            builder.clone(),
            params.clone(),
        ))
    });

    let mut context = RunContext::new(cache_dir, params);
    context.criteria = opt.criteria.clone();
    context.max_concurrent = opt.threads;

    let bar = IndicatifProgressReporter::new()?;
    let runner = QueryRunner::new(context, builder, decoy)?.with_progress(bar.get_reporter());
    let results = runner.run_parallel(&units)?;
    bar.finish();

    let total = results.len();
    let mut outcomes: Vec<UnitOutcome> = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        if outcomes.is_empty() {
            return Err(e).context("No cell could be searched");
        }
        warn!("{} of {} cells failed", total - outcomes.len(), total);
    }

    let per_cell = outcomes
        .iter()
        .map(|o| {
            let dump = dump_path(&o.outfile);
            read_dump(&dump)
                .with_context(|| format!("Could not read matches {}", dump.to_string_lossy()))
        })
        .collect::<Result<Vec<Vec<CandidateImage>>>>()?;

    let combined = match opt.combine {
        Combine::Flat => combine_matches(&per_cell, |_| true),
        Combine::Spatial => combine_spatial(&per_cell),
    };
    let mode = if opt.homography {
        Mode::Homography { ransac_pass: true }
    } else {
        Mode::Fundamental
    };
    let verified = rank_candidates(&combined, mode, opt.top, opt.min_consistent);

    if opt.json {
        let list: Vec<serde_json::Value> = verified
            .iter()
            .map(|v| {
                serde_json::json!({
                    "image": v.image,
                    "votes": v.matches.len(),
                    "inliers": v.num_inliers(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        for v in &verified {
            println!("{}\t{}\t{}", v.num_inliers(), v.matches.len(), v.image);
        }
    }

    Ok(())
}
