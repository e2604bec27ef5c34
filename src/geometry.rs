use nalgebra::{Matrix3, Point3, Vector3};
use thiserror::Error;

const ORTHONORMAL_TOLERANCE: f64 = 1e-4;
const SINGULAR_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("Image size must be positive along every axis, got {0:?}")]
    EmptySize([usize; 3]),

    #[error("Voxel spacing must be strictly positive, got {0:?}")]
    NonPositiveSpacing([f64; 3]),

    #[error("Direction matrix is not invertible")]
    TransformSingularity,

    #[error("Direction matrix is not orthonormal")]
    NotOrthonormal,
}

/// Voxel grid of a reference image: extents, spacing, origin and direction
/// cosines.
///
/// The direction matrix is stored row-major and its columns are the physical
/// directions of the voxel axes, so that
/// `physical = origin + direction * (index * spacing)`.
/// The inverse is computed once on construction and reused by every
/// physical-to-index conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGeometry {
    size: [usize; 3],
    spacing: Vector3<f64>,
    origin: Point3<f64>,
    direction: Matrix3<f64>,
    inverse_direction: Matrix3<f64>,
}

impl ImageGeometry {
    /// Create a validated geometry
    ///
    /// # Arguments
    ///
    /// * `size` - Number of voxels along x, y and z
    /// * `spacing` - Voxel spacing along x, y and z
    /// * `origin` - Physical position of voxel (0, 0, 0)
    /// * `direction` - Row-major 3x3 direction cosine matrix
    ///
    /// # Errors
    ///
    /// Fails if any extent is zero, any spacing is not strictly positive, or
    /// the direction matrix is singular or not orthonormal
    pub fn new(
        size: [usize; 3],
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: [f64; 9],
    ) -> Result<Self, GeometryError> {
        if size.contains(&0) {
            return Err(GeometryError::EmptySize(size));
        }
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(GeometryError::NonPositiveSpacing(spacing));
        }

        let direction = Matrix3::from_row_slice(&direction);
        if direction.iter().any(|v| !v.is_finite())
            || direction.determinant().abs() < SINGULAR_TOLERANCE
        {
            return Err(GeometryError::TransformSingularity);
        }
        let inverse_direction = direction
            .try_inverse()
            .ok_or(GeometryError::TransformSingularity)?;

        let deviation = (direction.transpose() * direction - Matrix3::identity()).amax();
        if deviation > ORTHONORMAL_TOLERANCE {
            return Err(GeometryError::NotOrthonormal);
        }

        Ok(Self {
            size,
            spacing: Vector3::from(spacing),
            origin: Point3::from(origin),
            direction,
            inverse_direction,
        })
    }

    /// Geometry with identity direction cosines
    pub fn axis_aligned(
        size: [usize; 3],
        spacing: [f64; 3],
        origin: [f64; 3],
    ) -> Result<Self, GeometryError> {
        Self::new(size, spacing, origin, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// Number of voxels along (x, y, z)
    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    /// Shape of the voxel array in storage order (z, y, x)
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.size[2], self.size[1], self.size[0])
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    /// Map a physical point to continuous voxel index coordinates (x, y, z)
    pub fn physical_to_continuous_index(&self, point: &Point3<f64>) -> Vector3<f64> {
        (self.inverse_direction * (point - self.origin)).component_div(&self.spacing)
    }

    /// Map continuous voxel index coordinates back to a physical point
    pub fn continuous_index_to_physical(&self, index: &Vector3<f64>) -> Point3<f64> {
        self.origin + self.direction * index.component_mul(&self.spacing)
    }
}
