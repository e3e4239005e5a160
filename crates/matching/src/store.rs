use crate::error::{MatchingError, Result};
use crate::feature::{Dataset, Feature, Geometry, ImageFeatures};
use crate::params::DescriptorKind;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

const PT3D_SUFFIX: &str = ".pt3d.txt";
const HSV_SUFFIX: &str = ".hsv.txt";

/// Parses keypoints in the Lowe text layout: a `N D` header followed by
/// `x y scale orientation` and `D` descriptor values per keypoint.
pub fn parse_descriptors(text: &str, kind: DescriptorKind, source: &Path) -> Result<Vec<Feature>> {
    let mut tokens = text.split_whitespace();
    let mut next_number = |what: &str| -> Result<f64> {
        let token = tokens
            .next()
            .ok_or_else(|| MatchingError::parse(source, format!("unexpected end of file, expected {}", what)))?;
        token
            .parse::<f64>()
            .map_err(|_| MatchingError::parse(source, format!("'{}' is not a valid {}", token, what)))
    };

    let count = next_number("keypoint count")? as usize;
    let dim = next_number("descriptor length")? as usize;
    if dim != kind.dimensions() {
        return Err(MatchingError::parse(
            source,
            format!(
                "descriptor length {} does not match {} ({})",
                dim,
                kind.name(),
                kind.dimensions()
            ),
        ));
    }

    // a keypoint takes at least dim + 4 numbers of two bytes each
    let mut features = Vec::with_capacity(count.min(text.len() / (2 * (dim + 4))));
    for _ in 0..count {
        let x = next_number("x")?;
        let y = next_number("y")?;
        let scale = next_number("scale")?;
        let orientation = next_number("orientation")?;
        let mut descriptor = Vec::with_capacity(dim);
        for _ in 0..dim {
            descriptor.push(next_number("descriptor value")? as f32);
        }
        features.push(Feature {
            geometry: Geometry::new(x, y, scale, orientation),
            descriptor,
        });
    }
    Ok(features)
}

pub fn load_descriptor_file(path: &Path, kind: DescriptorKind) -> Result<Vec<Feature>> {
    let text = fs::read_to_string(path).map_err(|e| MatchingError::io(path, e))?;
    parse_descriptors(&text, kind, path)
}

/// Image name of a descriptor file, or `None` if the file holds another kind.
pub fn image_name(file_name: &str, kind: DescriptorKind) -> Option<&str> {
    file_name
        .strip_suffix(kind.file_suffix())
        .filter(|name| !name.is_empty())
}

pub fn load_query(path: &Path, kind: DescriptorKind) -> Result<Dataset> {
    let features = load_descriptor_file(path, kind)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = image_name(&name, kind).unwrap_or(&name).to_owned();
    Dataset::from_images(kind, vec![ImageFeatures::new(name, features)])
}

fn read_rows(path: &Path) -> Result<Option<Vec<Vec<f64>>>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|e| MatchingError::io(path, e))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_whitespace()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|_| MatchingError::parse(path, format!("'{}' is not a number", v)))
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn read_3d_map(path: &Path) -> Result<Option<Vec<Option<[f64; 3]>>>> {
    let rows = match read_rows(path)? {
        Some(rows) => rows,
        None => return Ok(None),
    };
    rows.into_iter()
        .map(|row| match row.as_slice() {
            [lat, lon, alt] if *lat == 0.0 && *lon == 0.0 && *alt == 0.0 => Ok(None),
            [lat, lon, alt] => Ok(Some([*lat, *lon, *alt])),
            _ => Err(MatchingError::parse(path, "expected 'lat lon alt' per line")),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Loads every image of a cell directory, in file name order. `criteria`
/// restricts the cell to images whose name contains it.
pub fn load_cell(cell: &Path, kind: DescriptorKind, criteria: Option<&str>) -> Result<Vec<ImageFeatures>> {
    let entries = fs::read_dir(cell).map_err(|e| MatchingError::io(cell, e))?;
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MatchingError::io(cell, e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(name) = image_name(&file_name, kind) {
            if criteria.map_or(true, |c| name.contains(c)) {
                files.push((name.to_owned(), entry.path()));
            }
        }
    }
    files.sort();

    let mut images = Vec::with_capacity(files.len());
    for (name, path) in files {
        let mut image = ImageFeatures::new(name, load_descriptor_file(&path, kind)?);
        image.pt_3d = read_3d_map(&cell.join(format!("{}{}", image.name, PT3D_SUFFIX)))?;
        image.points = read_rows(&cell.join(format!("{}{}", image.name, HSV_SUFFIX)))?;
        images.push(image);
    }
    Ok(images)
}

/// Loads one or more cells as a single dataset.
pub fn load_cells(cells: &[PathBuf], kind: DescriptorKind, criteria: Option<&str>) -> Result<Dataset> {
    let start = Instant::now();
    let mut images = Vec::new();
    for cell in cells {
        images.extend(load_cell(cell, kind, criteria)?);
    }
    let dataset = Dataset::from_images(kind, images)?;
    info!(
        "dataset load of {} images ({} features) took {:.3}s",
        dataset.images().len(),
        dataset.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(dataset)
}
