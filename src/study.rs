//! Pairing structure sets with the image series they were drawn on.

use crate::enums::SortBy;
use crate::geometry::ImageGeometry;
use crate::mask::MaskVolume;
use crate::rasterizer::{InvalidContourReason, RasterizeError, RasterizeOptions, rasterize_all_rois};
use crate::rtstruct::{self, RTSTRUCT_MODALITY, RtStruct};
use crate::volume_loader::{VolumeLoader, VolumeLoaderError, dicom_paths};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::Path;
use tracing::{debug, warn};

/// A structure set together with the image series it was drawn on
#[derive(Debug)]
pub struct Study<'a> {
    rtstruct: RtStruct,
    images: Vec<&'a InMemDicomObject>,
}

impl<'a> Study<'a> {
    pub fn rtstruct(&self) -> &RtStruct {
        &self.rtstruct
    }

    pub fn images(&self) -> &[&'a InMemDicomObject] {
        &self.images
    }

    /// Reference geometry of the paired image series
    pub fn geometry(&self, sort_by: SortBy) -> Result<ImageGeometry, VolumeLoaderError> {
        VolumeLoader::load_from_objects(self.images.iter().copied(), sort_by)
    }

    /// One mask per ROI of the structure set, keyed by referenced ROI number
    ///
    /// ROIs whose contour data could not be parsed are reported as
    /// [`InvalidContourReason::Malformed`].
    pub fn masks<T: Copy + PartialEq + Send + Sync>(
        &self,
        sort_by: SortBy,
        options: &RasterizeOptions<T>,
    ) -> Result<BTreeMap<i32, Result<MaskVolume<T>, RasterizeError>>, VolumeLoaderError> {
        let geometry = self.geometry(sort_by)?;
        let mut masks = rasterize_all_rois(self.rtstruct.contours(), &geometry, options);
        for (&roi, rejected) in self.rtstruct.rejected() {
            masks.insert(
                roi,
                Err(RasterizeError::InvalidContour {
                    contour: rejected.contour,
                    reason: InvalidContourReason::Malformed(rejected.error.clone()),
                }),
            );
        }
        Ok(masks)
    }
}

/// Open every .dcm file in a directory, skipping files that fail to parse
pub fn open_directory(
    path: impl AsRef<Path>,
) -> Result<Vec<FileDicomObject<InMemDicomObject>>, VolumeLoaderError> {
    let paths = dicom_paths(path)?;
    let objects: Vec<_> = paths
        .par_iter()
        .filter_map(|path| match open_file(path) {
            Ok(object) => Some(object),
            Err(error) => {
                warn!(path = %path.display(), %error, "Skipping unreadable file");
                None
            }
        })
        .collect();

    if objects.is_empty() {
        return Err(VolumeLoaderError::NoValidImages);
    }
    Ok(objects)
}

/// Find every structure set among `objects` and pair it with its images
///
/// Candidate images share the structure set's Patient ID and, if the structure
/// set names one, its Frame of Reference UID. RT objects such as dose grids
/// are never candidates. Among the candidates only the series referenced by
/// the structure set is used; without a reference the series with the most
/// images is picked. Structure sets that cannot be parsed are skipped.
pub fn group_studies<O>(objects: &[O]) -> Vec<Study<'_>>
where
    O: Deref<Target = InMemDicomObject>,
{
    let (structure_sets, others): (Vec<&InMemDicomObject>, Vec<&InMemDicomObject>) = objects
        .iter()
        .map(|object| &**object)
        .partition(|object| rtstruct::string(object, tags::MODALITY).as_deref() == Some(RTSTRUCT_MODALITY));
    let images: Vec<_> = others.into_iter().filter(|object| !is_rt_object(object)).collect();

    structure_sets
        .into_iter()
        .filter_map(|object| match RtStruct::from_object(object) {
            Ok(rtstruct) => Some(rtstruct),
            Err(error) => {
                warn!(%error, "Skipping invalid structure set");
                None
            }
        })
        .map(|rtstruct| {
            let candidates = images
                .iter()
                .copied()
                .filter(|image| belongs_to(image, &rtstruct))
                .collect();
            let images = select_series(candidates, rtstruct.referenced_series_uid());
            debug!(
                patient_id = rtstruct.patient_id(),
                series = rtstruct.referenced_series_uid(),
                images = images.len(),
                "Paired structure set with images"
            );
            Study { rtstruct, images }
        })
        .collect()
}

fn is_rt_object(object: &InMemDicomObject) -> bool {
    rtstruct::string(object, tags::MODALITY).is_some_and(|modality| modality.starts_with("RT"))
}

fn belongs_to(image: &InMemDicomObject, rtstruct: &RtStruct) -> bool {
    let same_patient = rtstruct::string(image, tags::PATIENT_ID).as_deref() == rtstruct.patient_id();
    let same_frame = match rtstruct.frame_of_reference_uid() {
        Some(uid) => rtstruct::string(image, tags::FRAME_OF_REFERENCE_UID).as_deref() == Some(uid),
        None => true,
    };
    same_patient && same_frame
}

fn select_series<'a>(
    candidates: Vec<&'a InMemDicomObject>,
    referenced: Option<&str>,
) -> Vec<&'a InMemDicomObject> {
    let mut series: BTreeMap<Option<String>, Vec<&InMemDicomObject>> = BTreeMap::new();
    for image in candidates {
        series
            .entry(rtstruct::string(image, tags::SERIES_INSTANCE_UID))
            .or_default()
            .push(image);
    }

    if let Some(uid) = referenced {
        let images = series.remove(&Some(uid.to_string())).unwrap_or_default();
        if images.is_empty() {
            warn!(series = uid, "Referenced series not found");
        }
        return images;
    }

    if series.len() > 1 {
        warn!(series = series.len(), "No referenced series, using the largest one");
    }
    // Ties go to the lowest Series Instance UID
    series.into_values().rev().max_by_key(Vec::len).unwrap_or_default()
}
