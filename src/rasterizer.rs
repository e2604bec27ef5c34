use crate::contour::{Contour, ContourError, RoiContours};
use crate::enums::DegeneratePolicy;
use crate::geometry::ImageGeometry;
use crate::mask::MaskVolume;
use crate::polygon;

use ndarray::{Zip, s};
use rayon::prelude::*;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum RasterizeError {
    #[error("Contour {contour} lies on slice {slice}, outside of a volume with {depth} slices")]
    GeometryMismatch {
        contour: usize,
        slice: i64,
        depth: usize,
    },

    #[error("Contour {contour} is invalid: {reason}")]
    InvalidContour {
        contour: usize,
        reason: InvalidContourReason,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidContourReason {
    #[error("{0} distinct points cannot form a polygon")]
    TooFewPoints(usize),

    #[error("points span slices {first} and {other}")]
    NonPlanar { first: i64, other: i64 },

    #[error("point {0} maps to a non-finite voxel index")]
    NonFinite(usize),

    #[error("malformed contour data: {0}")]
    Malformed(ContourError),
}

/// Fill values and contour handling for rasterization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizeOptions<T = u8> {
    pub background_value: T,
    pub mask_value: T,
    pub degenerate: DegeneratePolicy,
}

impl<T> RasterizeOptions<T> {
    pub fn new(background_value: T, mask_value: T) -> Self {
        Self {
            background_value,
            mask_value,
            degenerate: DegeneratePolicy::default(),
        }
    }

    pub fn with_degenerate_policy(mut self, degenerate: DegeneratePolicy) -> Self {
        self.degenerate = degenerate;
        self
    }
}

impl Default for RasterizeOptions<u8> {
    fn default() -> Self {
        Self::new(0, 255)
    }
}

/// A contour resolved to voxel space
struct SlicePolygon {
    slice: usize,
    vertices: Vec<[f64; 2]>,
}

/// Rasterize the contours of one ROI into a mask shaped like `geometry`
///
/// Contours are applied in order. Each polygon is XOR-combined with what is
/// already painted on its slice, so a contour drawn inside an earlier one on
/// the same slice cuts a hole into it.
///
/// # Errors
///
/// * [`RasterizeError::GeometryMismatch`] if a contour lies outside the volume
/// * [`RasterizeError::InvalidContour`] if a contour has a non-finite point,
///   spans several slices, or has fewer than 3 distinct points under
///   [`DegeneratePolicy::Reject`]
///
/// `POINT` contours enclose no area and are ignored.
pub fn rasterize_roi<T: Copy + PartialEq>(
    contours: &[Contour],
    geometry: &ImageGeometry,
    options: &RasterizeOptions<T>,
) -> Result<MaskVolume<T>, RasterizeError> {
    let (_, rows, cols) = geometry.shape();
    let mut mask = MaskVolume::filled(geometry, options.background_value);

    for (index, contour) in contours.iter().enumerate() {
        let Some(polygon) = resolve_polygon(index, contour, geometry, options.degenerate)? else {
            continue;
        };
        let inside = polygon::fill_polygon(&polygon.vertices, (rows, cols));

        let mut slice = mask.data_mut().slice_mut(s![polygon.slice, .., ..]);
        Zip::from(&mut slice).and(&inside).for_each(|voxel, &inside| {
            let painted = *voxel == options.mask_value;
            *voxel = if painted ^ inside {
                options.mask_value
            } else {
                options.background_value
            };
        });
    }

    Ok(mask)
}

/// Rasterize every ROI independently on the rayon thread pool
///
/// A failing ROI is reported in its own entry and does not affect the others.
pub fn rasterize_all_rois<T: Copy + PartialEq + Send + Sync>(
    rois: &RoiContours,
    geometry: &ImageGeometry,
    options: &RasterizeOptions<T>,
) -> BTreeMap<i32, Result<MaskVolume<T>, RasterizeError>> {
    rois.par_iter()
        .map(|(&roi, contours)| {
            let result = rasterize_roi(contours, geometry, options);
            match &result {
                Ok(mask) => debug!(
                    roi,
                    contours = contours.len(),
                    voxels = mask.count(options.mask_value),
                    "Rasterized ROI"
                ),
                Err(error) => warn!(roi, %error, "Failed to rasterize ROI"),
            }
            (roi, result)
        })
        .collect()
}

fn resolve_polygon(
    index: usize,
    contour: &Contour,
    geometry: &ImageGeometry,
    policy: DegeneratePolicy,
) -> Result<Option<SlicePolygon>, RasterizeError> {
    if contour.is_point() {
        debug!(contour = index, "Ignoring POINT contour");
        return Ok(None);
    }

    let voxels: Vec<_> = contour
        .shifted_points()
        .map(|point| geometry.physical_to_continuous_index(&point))
        .collect();
    if let Some(point) = voxels.iter().position(|v| !v.iter().all(|c| c.is_finite())) {
        return Err(RasterizeError::InvalidContour {
            contour: index,
            reason: InvalidContourReason::NonFinite(point),
        });
    }
    let vertices: Vec<[f64; 2]> = voxels.iter().map(|v| [v.x, v.y]).collect();

    let distinct = polygon::distinct_vertices(&vertices);
    if distinct < 3 {
        return match policy {
            DegeneratePolicy::Skip => {
                warn!(contour = index, distinct, "Skipping contour without enough points");
                Ok(None)
            }
            DegeneratePolicy::Reject => Err(RasterizeError::InvalidContour {
                contour: index,
                reason: InvalidContourReason::TooFewPoints(distinct),
            }),
        };
    }

    // At least 3 distinct points are present, so the first one exists
    let slice = voxels[0].z.round();
    let depth = geometry.shape().0;
    if !(0.0..depth as f64).contains(&slice) {
        return Err(RasterizeError::GeometryMismatch {
            contour: index,
            slice: slice as i64,
            depth,
        });
    }
    if let Some(other) = voxels.iter().map(|v| v.z.round()).find(|k| *k != slice) {
        return Err(RasterizeError::InvalidContour {
            contour: index,
            reason: InvalidContourReason::NonPlanar {
                first: slice as i64,
                other: other as i64,
            },
        });
    }

    Ok(Some(SlicePolygon {
        slice: slice as usize,
        vertices,
    }))
}
