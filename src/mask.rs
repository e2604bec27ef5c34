use crate::enums::Orientation;
use crate::geometry::ImageGeometry;

use image::ImageBuffer;
use image::Luma;
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use nifti::NiftiHeader;
use nifti::writer::WriterOptions;
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaskError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("Slice {index} out of bounds for {orientation:?} axis")]
    SliceOutOfBounds {
        index: usize,
        orientation: Orientation,
    },
}

/// Two-valued voxel mask co-registered with a reference image
#[derive(Debug, Clone, PartialEq)]
pub struct MaskVolume<T = u8> {
    data: Array3<T>,
    geometry: ImageGeometry,
}

impl<T: Copy + PartialEq> MaskVolume<T> {
    /// Allocate a mask filled with `value`, shaped after `geometry`
    pub fn filled(geometry: &ImageGeometry, value: T) -> Self {
        Self {
            data: Array3::from_elem(geometry.shape(), value),
            geometry: geometry.clone(),
        }
    }

    /// Get the dimensions of the mask (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut Array3<T> {
        &mut self.data
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    pub fn into_parts(self) -> (Array3<T>, ImageGeometry) {
        (self.data, self.geometry)
    }

    /// Number of voxels holding `value`
    pub fn count(&self, value: T) -> usize {
        self.data.iter().filter(|v| **v == value).count()
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ArrayView2<'_, T>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(slice)
    }

    fn is_valid_index(&self, index: usize, orientation: Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }
}

impl MaskVolume<u8> {
    // Rows of the slice become image rows
    fn slice_to_image(slice: &ArrayView2<'_, u8>) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice.into_par_iter().copied().collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, orientation)?;
        Self::slice_to_image(&slice)
    }

    /// Write every axial slice as `slice_XXXX.png` into `directory`
    ///
    /// Returns the number of images written.
    pub fn save_slices(&self, directory: impl AsRef<Path>) -> Result<usize, MaskError> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)?;

        let depth = self.dim().0;
        (0..depth).into_par_iter().try_for_each(|index| {
            let image = self.get_image_from_axis(index, Orientation::Axial).ok_or(
                MaskError::SliceOutOfBounds {
                    index,
                    orientation: Orientation::Axial,
                },
            )?;
            image.save(directory.join(format!("slice_{index:04}.png")))?;
            Ok::<_, MaskError>(())
        })?;

        Ok(depth)
    }

    /// Header placing the voxel grid in NIfTI (RAS) world space
    ///
    /// The same affine is stored as sform and as qform. A left-handed
    /// direction matrix is expressed through `qfac = -1` in `pixdim[0]`.
    pub fn nifti_header(&self) -> NiftiHeader {
        // DICOM patient space is LPS
        let lps_to_ras = Matrix3::from_diagonal(&Vector3::new(-1.0, -1.0, 1.0));
        let direction = lps_to_ras * self.geometry.direction();
        let origin = lps_to_ras * self.geometry.origin().coords;
        let spacing = self.geometry.spacing();
        let affine = direction * Matrix3::from_diagonal(spacing);

        let mut header = NiftiHeader::default();
        header.pixdim[1] = spacing.x as f32;
        header.pixdim[2] = spacing.y as f32;
        header.pixdim[3] = spacing.z as f32;
        // Millimetres
        header.xyzt_units = 2;

        header.sform_code = 1;
        let row = |r: usize| {
            [
                affine[(r, 0)] as f32,
                affine[(r, 1)] as f32,
                affine[(r, 2)] as f32,
                origin[r] as f32,
            ]
        };
        header.srow_x = row(0);
        header.srow_y = row(1);
        header.srow_z = row(2);

        let (rotation, qfac) = if direction.determinant() < 0.0 {
            let mut rotation = direction;
            rotation.set_column(2, &-direction.column(2));
            (rotation, -1.0)
        } else {
            (direction, 1.0)
        };
        let quaternion =
            UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation)).into_inner();
        // NIfTI stores b, c, d and derives a >= 0
        let quaternion = if quaternion.w < 0.0 { -quaternion } else { quaternion };
        header.qform_code = 1;
        header.pixdim[0] = qfac;
        header.quatern_b = quaternion.i as f32;
        header.quatern_c = quaternion.j as f32;
        header.quatern_d = quaternion.k as f32;
        header.quatern_x = origin.x as f32;
        header.quatern_y = origin.y as f32;
        header.quatern_z = origin.z as f32;

        header
    }

    /// Write the mask as a NIfTI-1 volume, gzip-compressed for `.nii.gz`
    pub fn save_nifti(&self, path: impl AsRef<Path>) -> Result<(), MaskError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let header = self.nifti_header();
        // NIfTI arrays are indexed (x, y, z)
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&self.data.view().reversed_axes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
    use rstest::rstest;
    use tempfile::tempdir;

    fn mask() -> MaskVolume {
        let geometry = ImageGeometry::axis_aligned([4, 3, 2], [1.0; 3], [0.0; 3]).unwrap();
        let mut mask = MaskVolume::filled(&geometry, 0u8);
        mask.data_mut()[[1, 2, 3]] = 255;
        mask
    }

    #[test]
    fn test_filled() {
        let mask = mask();
        assert_eq!(mask.dim(), (2, 3, 4));
        assert_eq!(mask.count(255), 1);
        assert_eq!(mask.count(0), 23);
    }

    #[rstest]
    #[case(Orientation::Axial, 1, (3, 4))]
    #[case(Orientation::Coronal, 2, (2, 4))]
    #[case(Orientation::Sagittal, 3, (2, 3))]
    fn test_get_slice_from_axis(
        #[case] orientation: Orientation,
        #[case] index: usize,
        #[case] expected: (usize, usize),
    ) {
        let mask = mask();
        let slice = mask.get_slice_from_axis(index, orientation).unwrap();
        assert_eq!(slice.dim(), expected);
        assert_eq!(slice.iter().filter(|v| **v == 255).count(), 1);
    }

    #[rstest]
    #[case(Orientation::Axial, 2)]
    #[case(Orientation::Coronal, 3)]
    #[case(Orientation::Sagittal, 4)]
    fn test_slice_out_of_bounds(#[case] orientation: Orientation, #[case] index: usize) {
        assert!(mask().get_slice_from_axis(index, orientation).is_none());
    }

    #[test]
    fn test_image_layout() {
        let image = mask().get_image_from_axis(1, Orientation::Axial).unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(3, 2).0, [255]);
        assert_eq!(image.get_pixel(0, 0).0, [0]);
    }

    #[test]
    fn test_save_slices() {
        let dir = tempdir().unwrap();
        let written = mask().save_slices(dir.path().join("roi")).unwrap();
        assert_eq!(written, 2);

        let image = image::open(dir.path().join("roi").join("slice_0001.png"))
            .unwrap()
            .to_luma8();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(3, 2).0, [255]);
        assert!(dir.path().join("roi").join("slice_0000.png").is_file());
    }

    #[test]
    fn test_save_nifti() {
        let geometry =
            ImageGeometry::axis_aligned([4, 3, 2], [0.5, 2.0, 3.0], [10.0, -20.0, 5.0]).unwrap();
        let mut mask = MaskVolume::filled(&geometry, 0u8);
        mask.data_mut()[[1, 2, 3]] = 255;

        let dir = tempdir().unwrap();
        let path = dir.path().join("study").join("roi_1.nii.gz");
        mask.save_nifti(&path).unwrap();

        let object = ReaderOptions::new().read_file(&path).unwrap();
        let header = object.header();
        assert_eq!(header.dim[..4], [3, 4, 3, 2]);
        assert_eq!(header.pixdim[1..4], [0.5, 2.0, 3.0]);
        assert_eq!(header.sform_code, 1);
        assert_eq!(header.srow_x, [-0.5, 0.0, 0.0, -10.0]);
        assert_eq!(header.srow_y, [0.0, -2.0, 0.0, 20.0]);
        assert_eq!(header.srow_z, [0.0, 0.0, 3.0, 5.0]);
        assert_eq!(header.qform_code, 1);
        assert_eq!(header.pixdim[0], 1.0);
        // 180 degrees about z
        assert!(header.quatern_b.abs() < 1e-6);
        assert!(header.quatern_c.abs() < 1e-6);
        assert!((header.quatern_d.abs() - 1.0).abs() < 1e-6);
        assert_eq!([header.quatern_x, header.quatern_y, header.quatern_z], [-10.0, 20.0, 5.0]);

        let data = object.into_volume().into_ndarray::<u8>().unwrap();
        assert_eq!(data.shape(), &[4, 3, 2]);
        assert_eq!(data[[3, 2, 1]], 255);
        assert_eq!(data.iter().filter(|v| **v == 255).count(), 1);
    }

    #[test]
    fn test_nifti_header_left_handed() {
        // Slices stacked towards the feet
        let geometry = ImageGeometry::new(
            [4, 3, 2],
            [1.0; 3],
            [0.0; 3],
            [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
        )
        .unwrap();
        let header = MaskVolume::filled(&geometry, 0u8).nifti_header();
        assert_eq!(header.pixdim[0], -1.0);
        assert_eq!(header.srow_z, [0.0, 0.0, -1.0, 0.0]);
    }
}
