use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A cell directory named after its centre, `"<lat>,<lon>"`.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub path: PathBuf,
    pub lat: f64,
    pub lon: f64,
}

pub fn parse_cell_name(name: &str) -> Option<(f64, f64)> {
    let (lat, lon) = name.split_once(',')?;
    Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}

/// Great-circle distance in meters.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = p2 - p1;
    let dlon = (lon2 - lon1).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

pub fn list_cells(db_dir: &Path) -> Result<Vec<Cell>> {
    let entries = fs::read_dir(db_dir)
        .with_context(|| format!("Could not list cells in {}", db_dir.to_string_lossy()))?;
    let mut cells = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        match parse_cell_name(&name) {
            Some((lat, lon)) => cells.push(Cell { path, lat, lon }),
            None => debug!("skipping {}, not a cell", name),
        }
    }
    Ok(cells)
}

/// The `count` cells whose centres are nearest to (lat, lon), nearest first.
pub fn closest_cells(db_dir: &Path, lat: f64, lon: f64, count: usize) -> Result<Vec<PathBuf>> {
    let mut cells: Vec<(f64, Cell)> = list_cells(db_dir)?
        .into_iter()
        .map(|c| (distance_meters(lat, lon, c.lat, c.lon), c))
        .collect();
    cells.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
    for (dist, cell) in cells.iter().take(count) {
        debug!("cell {} is {:.0}m away", cell.path.to_string_lossy(), dist);
    }
    Ok(cells.into_iter().take(count).map(|(_, c)| c.path).collect())
}
