//! # DICOM ROI mask library
//!
//! This crate turns the contours of a DICOM structure set (RTSTRUCT) into
//! voxel masks that are co-registered with the image series the contours
//! were drawn on.
//!
//! This library is part of the dicom-rs ecosystem and leverages its
//! components to read image headers and structure sets. The pieces are:
//!  - [`ImageGeometry`]: size, spacing, origin and direction cosines of the
//!    reference image, with physical/voxel index transforms
//!  - [`VolumeLoader`]: builds the geometry from the headers of an image
//!    series, sorted along the slice normal
//!  - [`RtStruct`]: the ROI contours of a structure set
//!  - [`rasterize_roi`] / [`rasterize_all_rois`]: one [`MaskVolume`] per ROI,
//!    which can be written as a co-registered NIfTI volume
//!
//! Contours are rasterized slice by slice with the even-odd rule. Contours
//! that fall on the same slice are XOR-combined in file order, so an inner
//! contour cuts a hole into an outer one. If the environment supports it the
//! ROIs of a structure set are rasterized in parallel using rayon.
//!
//! Contours are assumed to be planar and parallel to the image slices: a
//! contour whose points fall on different slices is rejected.
//!
//! # Examples
//!
//! ## Rasterizing every ROI of a study
//!
//! Read all DICOM files from the dicom/ directory, pair each structure set
//! with the image series it references and save every ROI mask as NIfTI.
//!
//! ```no_run
//! # use dicom_roi_mask::{group_studies, open_directory, RasterizeOptions, SortBy};
//! let objects = open_directory("dicom").expect("should have read files from directory");
//! for study in group_studies(&objects) {
//!     let masks = study
//!         .masks(SortBy::ImagePositionPatient, &RasterizeOptions::<u8>::default())
//!         .expect("should have loaded the image geometry");
//!     for (roi, mask) in masks {
//!         if let Ok(mask) = mask {
//!             mask.save_nifti(format!("roi_{roi}.nii.gz")).expect("should have saved the mask");
//!         }
//!     }
//! }
//! ```

pub mod contour;
pub mod enums;
pub mod geometry;
pub mod mask;
pub mod polygon;
pub mod rasterizer;
pub mod rtstruct;
pub mod study;
pub mod volume_loader;

pub use contour::{Contour, ContourPoint, RoiContours};
pub use enums::{DegeneratePolicy, Orientation, SortBy};
pub use geometry::{GeometryError, ImageGeometry};
pub use mask::MaskVolume;
pub use rasterizer::{
    InvalidContourReason, RasterizeError, RasterizeOptions, rasterize_all_rois, rasterize_roi,
};
pub use rtstruct::{RejectedRoi, RtStruct};
pub use study::{Study, group_studies, open_directory};
pub use volume_loader::VolumeLoader;
