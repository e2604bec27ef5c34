use crate::enums::SortBy;
use crate::geometry::{GeometryError, ImageGeometry};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use nalgebra::Vector3;
use rayon::prelude::*;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, info};

const ORIENTATION_TOLERANCE: f64 = 1e-3;
const SPACING_TOLERANCE: f64 = 0.01;
const MIN_SLICE_STEP: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Inconsistent image orientation")]
    InconsistentOrientation,

    #[error("Image Orientation Patient does not describe two independent axes")]
    InvalidOrientation,

    #[error("Slices share the same position")]
    CoincidentSlices,

    #[error("Non-uniform slice spacing: min {min}, max {max}")]
    NonUniformSpacing { min: f64, max: f64 },

    #[error("Invalid geometry: {0}")]
    Geometry(#[from] GeometryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Geometry attributes of a single image slice
#[derive(Debug, Clone)]
struct SliceHeader {
    rows: usize,
    columns: usize,
    /// (between rows, between columns)
    pixel_spacing: (f64, f64),
    row_direction: Vector3<f64>,
    column_direction: Vector3<f64>,
    position: Vector3<f64>,
    instance_number: Option<i32>,
    slice_thickness: Option<f64>,
}

/// Builds the reference [`ImageGeometry`] of an image series from its headers
pub struct VolumeLoader;

impl VolumeLoader {
    /// Load the geometry of a series from DICOM objects
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    /// * `sort_by` - Method to sort the slices
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or the slices do not form a
    /// regular grid
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<ImageGeometry, VolumeLoaderError> {
        Self::load_from_objects(dicom_objects.iter().map(|object| &**object), sort_by)
    }

    /// Load the geometry of a series from borrowed data sets
    pub fn load_from_objects<'a>(
        objects: impl IntoIterator<Item = &'a InMemDicomObject>,
        sort_by: SortBy,
    ) -> Result<ImageGeometry, VolumeLoaderError> {
        let mut headers: Vec<_> = objects
            .into_iter()
            .filter_map(|object| {
                let header = Self::extract_header(object);
                if header.is_none() {
                    debug!("Skipping object without image geometry");
                }
                header
            })
            .collect();

        if headers.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::validate_headers(&headers)?;
        let normal = Self::slice_normal(&headers[0])?;
        Self::sort_headers(&mut headers, &normal, sort_by);

        let (slice_direction, slice_spacing) = Self::slice_axis(&headers, &normal)?;
        let first = &headers[0];
        let (row, column) = (first.row_direction, first.column_direction);
        let geometry = ImageGeometry::new(
            [first.columns, first.rows, headers.len()],
            [first.pixel_spacing.1, first.pixel_spacing.0, slice_spacing],
            first.position.into(),
            [
                row.x, column.x, slice_direction.x,
                row.y, column.y, slice_direction.y,
                row.z, column.z, slice_direction.z,
            ],
        )?;

        info!(size = ?geometry.size(), spacing = ?geometry.spacing().as_slice(), "Loaded series geometry");
        Ok(geometry)
    }

    /// Load the geometry of a series from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<ImageGeometry, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load the geometry of a series from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<ImageGeometry, VolumeLoaderError> {
        let paths = dicom_paths(path)?;
        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::load_from_file_paths(&paths, sort_by)
    }

    fn extract_header(dicom_object: &InMemDicomObject) -> Option<SliceHeader> {
        let rows = dicom_object.get(tags::ROWS)?.to_int::<usize>().ok()?;
        let columns = dicom_object.get(tags::COLUMNS)?.to_int::<usize>().ok()?;
        let pixel_spacing = floats(dicom_object, tags::PIXEL_SPACING)?;
        let orientation = floats(dicom_object, tags::IMAGE_ORIENTATION_PATIENT)?;
        let position = floats(dicom_object, tags::IMAGE_POSITION_PATIENT)?;

        let [row_spacing, column_spacing] = pixel_spacing[..] else {
            return None;
        };
        let [rx, ry, rz, cx, cy, cz] = orientation[..] else {
            return None;
        };
        let [px, py, pz] = position[..] else {
            return None;
        };

        Some(SliceHeader {
            rows,
            columns,
            pixel_spacing: (row_spacing, column_spacing),
            row_direction: Vector3::new(rx, ry, rz).try_normalize(f64::EPSILON)?,
            column_direction: Vector3::new(cx, cy, cz).try_normalize(f64::EPSILON)?,
            position: Vector3::new(px, py, pz),
            instance_number: dicom_object
                .get(tags::INSTANCE_NUMBER)
                .and_then(|e| e.to_int::<i32>().ok()),
            slice_thickness: dicom_object
                .get(tags::SLICE_THICKNESS)
                .and_then(|e| e.to_float64().ok()),
        })
    }

    fn validate_headers(headers: &[SliceHeader]) -> Result<(), VolumeLoaderError> {
        let first = &headers[0];
        if headers
            .iter()
            .any(|h| (h.rows, h.columns, h.pixel_spacing) != (first.rows, first.columns, first.pixel_spacing))
        {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        if headers.iter().any(|h| {
            (h.row_direction - first.row_direction).norm() > ORIENTATION_TOLERANCE
                || (h.column_direction - first.column_direction).norm() > ORIENTATION_TOLERANCE
        }) {
            return Err(VolumeLoaderError::InconsistentOrientation);
        }
        Ok(())
    }

    fn slice_normal(header: &SliceHeader) -> Result<Vector3<f64>, VolumeLoaderError> {
        header
            .row_direction
            .cross(&header.column_direction)
            .try_normalize(MIN_SLICE_STEP)
            .ok_or(VolumeLoaderError::InvalidOrientation)
    }

    fn sort_headers(headers: &mut [SliceHeader], normal: &Vector3<f64>, sort_by: SortBy) {
        match sort_by {
            SortBy::ImagePositionPatient => {
                headers.sort_by(|a, b| a.position.dot(normal).total_cmp(&b.position.dot(normal)))
            }
            SortBy::InstanceNumber => headers.sort_by_key(|h| h.instance_number),
        }
    }

    /// Direction and spacing of the slice axis, following the stacking order
    fn slice_axis(
        headers: &[SliceHeader],
        normal: &Vector3<f64>,
    ) -> Result<(Vector3<f64>, f64), VolumeLoaderError> {
        if headers.len() == 1 {
            return Ok((*normal, headers[0].slice_thickness.unwrap_or(1.0)));
        }

        let steps: Vec<f64> = headers
            .windows(2)
            .map(|pair| (pair[1].position - pair[0].position).dot(normal))
            .collect();
        let mean = steps.iter().sum::<f64>() / steps.len() as f64;
        if mean.abs() < MIN_SLICE_STEP {
            return Err(VolumeLoaderError::CoincidentSlices);
        }

        let sign = mean.signum();
        let (min, max) = steps
            .iter()
            .map(|step| step * sign)
            .fold((f64::MAX, f64::MIN), |(min, max), step| (min.min(step), max.max(step)));
        if min < MIN_SLICE_STEP {
            return Err(VolumeLoaderError::CoincidentSlices);
        }
        if max - min > SPACING_TOLERANCE * mean.abs() {
            return Err(VolumeLoaderError::NonUniformSpacing { min, max });
        }

        Ok((normal * sign, mean.abs()))
    }
}

/// Paths of the .dcm files directly inside `path`
pub fn dicom_paths(path: impl AsRef<Path>) -> Result<Vec<std::path::PathBuf>, std::io::Error> {
    let mut paths: Vec<_> = fs::read_dir(path.as_ref())?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn floats(dicom_object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<Vec<f64>> {
    dicom_object.get(tag)?.to_multi_float64().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue, VR};
    use nalgebra::Point3;
    use rstest::rstest;

    fn slice(z: f64, instance_number: i32) -> InMemDicomObject {
        slice_with(z, instance_number, 4, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    fn slice_with(z: f64, instance_number: i32, rows: u16, orientation: [f64; 6]) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
            DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(instance_number.to_string())),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(6_u16)),
            DataElement::new(tags::PIXEL_SPACING, VR::DS, PrimitiveValue::F64([0.5, 0.75].into_iter().collect())),
            DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from(2.5_f64)),
            DataElement::new(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                PrimitiveValue::F64(orientation.into_iter().collect()),
            ),
            DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                PrimitiveValue::F64([-10.0, -20.0, z].into_iter().collect()),
            ),
        ])
    }

    #[test]
    fn test_sorted_by_position() {
        let objects = [slice(6.0, 1), slice(0.0, 2), slice(3.0, 3), slice(9.0, 4)];
        let geometry = VolumeLoader::load_from_objects(&objects, SortBy::ImagePositionPatient).unwrap();

        assert_eq!(geometry.size(), [6, 4, 4]);
        assert_eq!(geometry.spacing().as_slice(), &[0.75, 0.5, 3.0]);
        assert_eq!(geometry.origin(), &Point3::new(-10.0, -20.0, 0.0));
        let index = geometry.physical_to_continuous_index(&Point3::new(-10.0 + 1.5, -20.0 + 1.0, 6.0));
        assert!((index - Vector3::new(2.0, 2.0, 2.0)).norm() < 1e-9);
    }

    #[test]
    fn test_sorted_by_instance_number_descending_positions() {
        let objects = [slice(0.0, 3), slice(6.0, 1), slice(3.0, 2)];
        let geometry = VolumeLoader::load_from_objects(&objects, SortBy::InstanceNumber).unwrap();

        assert_eq!(geometry.origin(), &Point3::new(-10.0, -20.0, 6.0));
        assert_eq!(geometry.spacing().z, 3.0);
        let index = geometry.physical_to_continuous_index(&Point3::new(-10.0, -20.0, 0.0));
        assert!((index.z - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_slice_uses_thickness() {
        let geometry = VolumeLoader::load_from_objects(&[slice(4.0, 1)], SortBy::default()).unwrap();
        assert_eq!(geometry.size(), [6, 4, 1]);
        assert_eq!(geometry.spacing().z, 2.5);
    }

    #[test]
    fn test_oblique_orientation() {
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let orientation = [s, s, 0.0, -s, s, 0.0];
        let objects = [slice_with(0.0, 1, 4, orientation), slice_with(2.0, 2, 4, orientation)];
        let geometry = VolumeLoader::load_from_objects(&objects, SortBy::default()).unwrap();

        let corner = Point3::new(-10.0 + 0.75 * s, -20.0 + 0.75 * s, 2.0);
        let index = geometry.physical_to_continuous_index(&corner);
        assert!((index - Vector3::new(1.0, 0.0, 1.0)).norm() < 1e-9);
    }

    #[test]
    fn test_skips_objects_without_geometry() {
        let other = InMemDicomObject::from_element_iter([DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from("RTSTRUCT"),
        )]);
        let objects = [slice(0.0, 1), other, slice(1.0, 2)];
        let geometry = VolumeLoader::load_from_objects(&objects, SortBy::default()).unwrap();
        assert_eq!(geometry.size()[2], 2);
    }

    #[rstest]
    #[case(vec![], "NoValidImages")]
    #[case(vec![slice(0.0, 1), slice_with(1.0, 2, 5, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0])], "InconsistentDimensions")]
    #[case(vec![slice(0.0, 1), slice_with(1.0, 2, 4, [1.0, 0.0, 0.0, 0.0, 0.0, 1.0])], "InconsistentOrientation")]
    #[case(vec![slice_with(0.0, 1, 4, [1.0, 0.0, 0.0, 1.0, 0.0, 0.0])], "InvalidOrientation")]
    #[case(vec![slice(0.0, 1), slice(0.0, 2)], "CoincidentSlices")]
    #[case(vec![slice(0.0, 1), slice(1.0, 2), slice(3.0, 3)], "NonUniformSpacing")]
    fn test_invalid_series(#[case] objects: Vec<InMemDicomObject>, #[case] expected: &str) {
        let error = VolumeLoader::load_from_objects(&objects, SortBy::default()).unwrap_err();
        assert!(format!("{error:?}").starts_with(expected), "{error:?}");
    }

    #[test]
    fn test_dicom_paths() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.dcm", "a.DCM", "notes.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let paths = dicom_paths(dir.path()).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.DCM", "b.dcm"]);
    }
}
