use crate::error::{MatchingError, Result};
use crate::params::DescriptorKind;
use serde::{Deserialize, Serialize};

/// Keypoint geometry as written by the feature extractor: position,
/// scale and orientation in radians.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub orientation: f64,
}

impl Geometry {
    pub fn new(x: f64, y: f64, scale: f64, orientation: f64) -> Self {
        Geometry {
            x,
            y,
            scale,
            orientation,
        }
    }

    /// Bitwise identity, usable as a hash key.
    pub fn key(&self) -> [u64; 4] {
        [
            self.x.to_bits(),
            self.y.to_bits(),
            self.scale.to_bits(),
            self.orientation.to_bits(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    pub geometry: Geometry,
    pub descriptor: Vec<f32>,
}

/// Features of one image plus optional per-feature side data.
#[derive(Clone, Debug, Default)]
pub struct ImageFeatures {
    pub name: String,
    pub features: Vec<Feature>,
    /// Approximate world position (lat, lon, alt) per feature.
    pub pt_3d: Option<Vec<Option<[f64; 3]>>>,
    /// Colour sample per feature.
    pub points: Option<Vec<Vec<f64>>>,
}

impl ImageFeatures {
    pub fn new(name: impl Into<String>, features: Vec<Feature>) -> Self {
        ImageFeatures {
            name: name.into(),
            features,
            pt_3d: None,
            points: None,
        }
    }
}

/// All features of one or more images, stored row by row.
///
/// Row `i` of the vectors, the geometry, the image mapping and any side data
/// always describe the same feature.
#[derive(Clone, Debug)]
pub struct Dataset {
    kind: DescriptorKind,
    dim: usize,
    vectors: Vec<f32>,
    geometry: Vec<Geometry>,
    image_of_row: Vec<usize>,
    images: Vec<String>,
    pt_3d: Option<Vec<Option<[f64; 3]>>>,
    points: Option<Vec<Vec<f64>>>,
}

impl Dataset {
    pub fn from_images(kind: DescriptorKind, images: Vec<ImageFeatures>) -> Result<Dataset> {
        let dim = kind.dimensions();
        let rows: usize = images.iter().map(|i| i.features.len()).sum();
        let with_3d = images.iter().any(|i| i.pt_3d.is_some());
        let with_points = images.iter().any(|i| i.points.is_some());

        let mut dataset = Dataset {
            kind,
            dim,
            vectors: Vec::with_capacity(rows * dim),
            geometry: Vec::with_capacity(rows),
            image_of_row: Vec::with_capacity(rows),
            images: Vec::with_capacity(images.len()),
            pt_3d: if with_3d { Some(Vec::with_capacity(rows)) } else { None },
            points: if with_points { Some(Vec::with_capacity(rows)) } else { None },
        };

        for image in images {
            let n = image.features.len();
            check_side_len(&image.name, "3d map", image.pt_3d.as_ref().map(Vec::len), n)?;
            check_side_len(&image.name, "colour", image.points.as_ref().map(Vec::len), n)?;

            let image_idx = dataset.images.len();
            for feature in &image.features {
                if feature.descriptor.len() != dim {
                    return Err(MatchingError::Dataset(format!(
                        "image '{}' has a descriptor of length {}, expected {}",
                        image.name,
                        feature.descriptor.len(),
                        dim
                    )));
                }
                dataset.vectors.extend_from_slice(&feature.descriptor);
                dataset.geometry.push(feature.geometry);
                dataset.image_of_row.push(image_idx);
            }
            if let Some(map) = dataset.pt_3d.as_mut() {
                match image.pt_3d {
                    Some(coords) => map.extend(coords),
                    None => map.extend(std::iter::repeat(None).take(n)),
                }
            }
            if let Some(points) = dataset.points.as_mut() {
                match image.points {
                    Some(p) => points.extend(p),
                    None => points.extend(std::iter::repeat(Vec::new()).take(n)),
                }
            }
            dataset.images.push(image.name);
        }

        Ok(dataset)
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.geometry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty()
    }

    pub fn vector(&self, row: usize) -> &[f32] {
        &self.vectors[row * self.dim..(row + 1) * self.dim]
    }

    pub fn geometry(&self, row: usize) -> Geometry {
        self.geometry[row]
    }

    pub fn image(&self, row: usize) -> &str {
        &self.images[self.image_of_row[row]]
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn has_3d_map(&self) -> bool {
        self.pt_3d.is_some()
    }

    pub fn pt_3d(&self, row: usize) -> Option<[f64; 3]> {
        self.pt_3d.as_ref().and_then(|map| map[row])
    }

    pub fn point(&self, row: usize) -> Option<&[f64]> {
        self.points.as_ref().map(|p| p[row].as_slice())
    }
}

fn check_side_len(image: &str, what: &str, len: Option<usize>, expected: usize) -> Result<()> {
    match len {
        Some(len) if len != expected => Err(MatchingError::Dataset(format!(
            "image '{}' has {} {} rows for {} features",
            image, len, what, expected
        ))),
        _ => Ok(()),
    }
}
