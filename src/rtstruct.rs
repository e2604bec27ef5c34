//! Structure set (RTSTRUCT) parsing.
//!
//! Every attribute the rasterizer needs is looked up once here and stored in
//! plain fields, optional attributes as [`Option`]s.

use crate::contour::{Contour, ContourError, RoiContours};

use dicom::core::Tag;
use dicom::core::value::ConvertValueError;
use dicom::object::{InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

pub const RTSTRUCT_MODALITY: &str = "RTSTRUCT";

#[derive(Debug, Error)]
pub enum RtStructError {
    #[error("Expected modality RTSTRUCT, found {0:?}")]
    NotRtStruct(Option<String>),

    #[error("ROI Contour Sequence is missing or empty")]
    MissingRoiContours,

    #[error("ROI contour item {0} has no Referenced ROI Number")]
    MissingRoiNumber(usize),

    #[error("Invalid value in {tag}: {source}")]
    InvalidValue {
        tag: Tag,
        #[source]
        source: ConvertValueError,
    },

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// First malformed contour of an ROI that could not be parsed
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRoi {
    pub contour: usize,
    pub error: ContourError,
}

/// Contours and identification of a structure set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtStruct {
    patient_id: Option<String>,
    frame_of_reference_uid: Option<String>,
    referenced_series_uid: Option<String>,
    roi_names: BTreeMap<i32, String>,
    contours: RoiContours,
    rejected: BTreeMap<i32, RejectedRoi>,
}

impl RtStruct {
    /// Read a structure set from a file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RtStructError> {
        let object = open_file(path.as_ref())?;
        Self::from_object(&object)
    }

    /// Parse a structure set from an in-memory DICOM object
    ///
    /// An ROI holding a malformed contour is kept out of [`Self::contours`]
    /// and listed in [`Self::rejected`] instead, so the other ROIs stay usable.
    ///
    /// # Errors
    ///
    /// Returns error if the object is not an RTSTRUCT, has no ROI contours,
    /// or an ROI item cannot be identified
    pub fn from_object(object: &InMemDicomObject) -> Result<Self, RtStructError> {
        let modality = string(object, tags::MODALITY);
        if modality.as_deref() != Some(RTSTRUCT_MODALITY) {
            return Err(RtStructError::NotRtStruct(modality));
        }

        let roi_contours = items(object, tags::ROI_CONTOUR_SEQUENCE);
        if roi_contours.is_empty() {
            return Err(RtStructError::MissingRoiContours);
        }

        let mut contours = RoiContours::new();
        let mut rejected = BTreeMap::new();
        for (item_index, item) in roi_contours.iter().enumerate() {
            let roi = int(item, tags::REFERENCED_ROI_NUMBER)?
                .ok_or(RtStructError::MissingRoiNumber(item_index))?;
            let parsed = items(item, tags::CONTOUR_SEQUENCE)
                .iter()
                .enumerate()
                .map(|(contour, item)| {
                    parse_contour(item).map_err(|error| RejectedRoi { contour, error })
                })
                .collect::<Result<Vec<_>, _>>();
            match parsed {
                Ok(parsed) if !rejected.contains_key(&roi) => {
                    debug!(roi, contours = parsed.len(), "Parsed ROI contours");
                    contours.entry(roi).or_default().extend(parsed);
                }
                Ok(_) => {}
                Err(rejection) => {
                    warn!(
                        roi,
                        contour = rejection.contour,
                        error = %rejection.error,
                        "Rejecting ROI with malformed contour"
                    );
                    contours.remove(&roi);
                    rejected.entry(roi).or_insert(rejection);
                }
            }
        }

        let mut roi_names = BTreeMap::new();
        for item in items(object, tags::STRUCTURE_SET_ROI_SEQUENCE) {
            if let (Some(number), Some(name)) = (int(item, tags::ROI_NUMBER)?, string(item, tags::ROI_NAME)) {
                roi_names.insert(number, name);
            }
        }

        let frames = items(object, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE);
        let frame_of_reference_uid = frames
            .iter()
            .find_map(|item| string(item, tags::FRAME_OF_REFERENCE_UID));
        // Frame -> RT Referenced Study -> RT Referenced Series
        let referenced_series_uid = frames
            .iter()
            .flat_map(|frame| items(frame, tags::RT_REFERENCED_STUDY_SEQUENCE))
            .flat_map(|study| items(study, tags::RT_REFERENCED_SERIES_SEQUENCE))
            .find_map(|series| string(series, tags::SERIES_INSTANCE_UID));

        Ok(Self {
            patient_id: string(object, tags::PATIENT_ID),
            frame_of_reference_uid,
            referenced_series_uid,
            roi_names,
            contours,
            rejected,
        })
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }

    pub fn frame_of_reference_uid(&self) -> Option<&str> {
        self.frame_of_reference_uid.as_deref()
    }

    /// Series Instance UID of the images the contours were drawn on
    pub fn referenced_series_uid(&self) -> Option<&str> {
        self.referenced_series_uid.as_deref()
    }

    pub fn roi_name(&self, roi: i32) -> Option<&str> {
        self.roi_names.get(&roi).map(String::as_str)
    }

    /// Contours per referenced ROI number, in file order
    pub fn contours(&self) -> &RoiContours {
        &self.contours
    }

    /// ROIs left out of [`Self::contours`] because a contour was malformed
    pub fn rejected(&self) -> &BTreeMap<i32, RejectedRoi> {
        &self.rejected
    }

    pub fn into_contours(self) -> RoiContours {
        self.contours
    }
}

fn parse_contour(item: &InMemDicomObject) -> Result<Contour, ContourError> {
    let data = floats(item, tags::CONTOUR_DATA)?.unwrap_or_default();
    let mut contour = Contour::from_flat(&data)?;
    if let Some(offset) = floats(item, tags::CONTOUR_OFFSET_VECTOR)? {
        contour = contour.with_offset_values(&offset)?;
    }
    if let Some(geometric_type) = string(item, tags::CONTOUR_GEOMETRIC_TYPE) {
        contour = contour.with_geometric_type(geometric_type);
    }
    Ok(contour)
}

pub(crate) fn string(object: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = object.get(tag)?.to_str().ok()?;
    let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!value.is_empty()).then(|| value.to_string())
}

pub(crate) fn items(object: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
    object.get(tag).and_then(|e| e.items()).unwrap_or(&[])
}

fn int(object: &InMemDicomObject, tag: Tag) -> Result<Option<i32>, RtStructError> {
    object
        .get(tag)
        .map(|e| e.to_int::<i32>())
        .transpose()
        .map_err(|source| RtStructError::InvalidValue { tag, source })
}

fn floats(object: &InMemDicomObject, tag: Tag) -> Result<Option<Vec<f64>>, ContourError> {
    object
        .get(tag)
        .map(|e| e.to_multi_float64())
        .transpose()
        .map_err(|_| ContourError::InvalidValue(tag))
}
