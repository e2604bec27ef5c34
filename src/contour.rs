use dicom::core::Tag;
use nalgebra::{Point3, Vector3};
use std::collections::BTreeMap;
use thiserror::Error;

/// Physical-space contour vertex
pub type ContourPoint = Point3<f64>;

/// Contours of every ROI keyed by referenced ROI number
pub type RoiContours = BTreeMap<i32, Vec<Contour>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContourError {
    #[error("Contour data length {0} is not a multiple of 3")]
    IncompleteTriple(usize),

    #[error("Contour offset vector must have 3 components, got {0}")]
    InvalidOffset(usize),

    #[error("Invalid numeric value in {0}")]
    InvalidValue(Tag),
}

/// Contour Geometric Type of a single isolated point
pub const POINT_GEOMETRIC_TYPE: &str = "POINT";

/// A closed planar polygon drawn on one image slice
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    points: Vec<ContourPoint>,
    offset: Vector3<f64>,
    geometric_type: Option<String>,
}

impl Contour {
    pub fn new(points: Vec<ContourPoint>) -> Self {
        Self {
            points,
            offset: Vector3::zeros(),
            geometric_type: None,
        }
    }

    /// Build a contour from flat `[x0, y0, z0, x1, y1, z1, ...]` coordinates
    pub fn from_flat(coordinates: &[f64]) -> Result<Self, ContourError> {
        if coordinates.len() % 3 != 0 {
            return Err(ContourError::IncompleteTriple(coordinates.len()));
        }
        let points = coordinates
            .chunks_exact(3)
            .map(|xyz| Point3::new(xyz[0], xyz[1], xyz[2]))
            .collect();
        Ok(Self::new(points))
    }

    pub fn with_offset(mut self, offset: Vector3<f64>) -> Self {
        self.offset = offset;
        self
    }

    /// Set the offset from a decoded attribute value, which must hold 3 values
    pub fn with_offset_values(self, values: &[f64]) -> Result<Self, ContourError> {
        match values {
            [x, y, z] => Ok(self.with_offset(Vector3::new(*x, *y, *z))),
            _ => Err(ContourError::InvalidOffset(values.len())),
        }
    }

    pub fn with_geometric_type(mut self, geometric_type: impl Into<String>) -> Self {
        self.geometric_type = Some(geometric_type.into());
        self
    }

    pub fn points(&self) -> &[ContourPoint] {
        &self.points
    }

    pub fn offset(&self) -> &Vector3<f64> {
        &self.offset
    }

    pub fn geometric_type(&self) -> Option<&str> {
        self.geometric_type.as_deref()
    }

    /// True for `POINT` contours, which mark a location and enclose no area
    pub fn is_point(&self) -> bool {
        self.geometric_type() == Some(POINT_GEOMETRIC_TYPE)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points with the offset vector applied
    pub fn shifted_points(&self) -> impl Iterator<Item = ContourPoint> + '_ {
        self.points.iter().map(move |p| p + self.offset)
    }
}
